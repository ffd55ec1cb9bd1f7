//! The sync engine: adaptive backoff, the merge planner and the session
//! coordinator that ties them to the store and the feed sources.

mod backoff;
mod clock;
mod coordinator;
pub mod merge;
mod report;

pub use backoff::{BackoffPolicy, BackoffState};
pub use clock::{Clock, ManualClock, SystemClock};
pub use coordinator::{SubscribeError, SyncCoordinator, SyncError, SyncTrigger};
pub use merge::{entry_identifier, plan_merge, DecodeWarning, MergeReport, PendingDownload};
pub use report::{
    ChannelReporter, FeedAlert, FeedOutcome, FeedStatus, SessionReport, SyncEvent, SyncReporter,
    TracingReporter,
};
