use std::sync::Arc;
use tokio::sync::mpsc;

use super::coordinator::{SubscribeError, SyncTrigger};
use crate::storage::{Feed, StoreError};

// ============================================================================
// Per-feed outcome
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedStatus {
    /// Fetched, and the merge created or updated at least one article
    Changed,
    Unchanged,
    /// Fetch or decode failed; holds the error message
    Failed(String),
    /// Not started because the session was cancelled or aborted
    Skipped,
    /// Deleted while the session was running
    Removed,
}

/// What happened to one feed during a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedOutcome {
    pub feed_id: i64,
    pub title: Arc<str>,
    pub status: FeedStatus,
    pub created: usize,
    pub updated: usize,
    pub enclosures_added: usize,
    pub decode_warnings: usize,
    /// Backoff state stored after this fetch
    pub wait_period: u32,
    pub remaining_wait: u32,
    pub consecutive_failures: u32,
}

impl FeedOutcome {
    pub(crate) fn new(feed: &Feed, status: FeedStatus) -> Self {
        Self {
            feed_id: feed.id,
            title: Arc::clone(&feed.title),
            status,
            created: 0,
            updated: 0,
            enclosures_added: 0,
            decode_warnings: 0,
            wait_period: feed.wait_period,
            remaining_wait: feed.remaining_wait,
            consecutive_failures: feed.consecutive_failures,
        }
    }
}

/// A feed whose failure streak reached the configured alert threshold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedAlert {
    pub feed_id: i64,
    pub title: Arc<str>,
    pub consecutive_failures: u32,
    pub last_error: String,
}

// ============================================================================
// Session report
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub trigger: SyncTrigger,
    pub started_at: i64,
    pub finished_at: Option<i64>,
    /// Feeds that were fetched (successfully or not)
    pub feeds_checked: usize,
    pub feeds_changed: usize,
    pub feeds_failed: usize,
    pub feeds_skipped: usize,
    pub articles_created: usize,
    pub articles_updated: usize,
    pub enclosures_added: usize,
    pub decode_warnings: usize,
    pub cancelled: bool,
    pub outcomes: Vec<FeedOutcome>,
    pub alerts: Vec<FeedAlert>,
}

impl SessionReport {
    pub fn new(trigger: SyncTrigger, started_at: i64) -> Self {
        Self {
            trigger,
            started_at,
            finished_at: None,
            feeds_checked: 0,
            feeds_changed: 0,
            feeds_failed: 0,
            feeds_skipped: 0,
            articles_created: 0,
            articles_updated: 0,
            enclosures_added: 0,
            decode_warnings: 0,
            cancelled: false,
            outcomes: Vec::new(),
            alerts: Vec::new(),
        }
    }

    pub(crate) fn record(&mut self, outcome: FeedOutcome, alert_threshold: u32) {
        match &outcome.status {
            FeedStatus::Changed => {
                self.feeds_checked += 1;
                self.feeds_changed += 1;
            }
            FeedStatus::Unchanged => self.feeds_checked += 1,
            FeedStatus::Failed(error) => {
                self.feeds_checked += 1;
                self.feeds_failed += 1;
                if outcome.consecutive_failures >= alert_threshold {
                    self.alerts.push(FeedAlert {
                        feed_id: outcome.feed_id,
                        title: Arc::clone(&outcome.title),
                        consecutive_failures: outcome.consecutive_failures,
                        last_error: error.clone(),
                    });
                }
            }
            FeedStatus::Skipped | FeedStatus::Removed => self.feeds_skipped += 1,
        }
        self.articles_created += outcome.created;
        self.articles_updated += outcome.updated;
        self.enclosures_added += outcome.enclosures_added;
        self.decode_warnings += outcome.decode_warnings;
        self.outcomes.push(outcome);
    }

    pub fn changed(&self) -> bool {
        self.feeds_changed > 0
    }
}

// ============================================================================
// Reporter collaborator
// ============================================================================

/// Receives session progress. All methods default to doing nothing.
///
/// Called from the coordinator's task, so implementations must not block.
pub trait SyncReporter: Send + Sync {
    fn session_started(&self, _trigger: SyncTrigger, _total: usize) {}

    fn feed_progress(&self, _done: usize, _total: usize, _outcome: &FeedOutcome) {}

    fn session_finished(&self, _report: &SessionReport) {}

    /// The store failed; `partial` holds everything recorded before that.
    fn session_aborted(&self, _error: &StoreError, _partial: &SessionReport) {}

    /// Completion of a create-feed-by-URL request.
    fn subscription_finished(&self, _url: &str, _result: Result<&Feed, &SubscribeError>) {}
}

/// Logs sessions through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReporter;

impl SyncReporter for TracingReporter {
    fn session_started(&self, trigger: SyncTrigger, total: usize) {
        tracing::debug!(trigger = ?trigger, feeds = total, "Sync session started");
    }

    fn feed_progress(&self, done: usize, total: usize, outcome: &FeedOutcome) {
        tracing::debug!(
            done = done,
            total = total,
            feed_id = outcome.feed_id,
            status = ?outcome.status,
            wait_period = outcome.wait_period,
            "Feed synced"
        );
    }

    fn session_finished(&self, report: &SessionReport) {
        tracing::info!(
            trigger = ?report.trigger,
            checked = report.feeds_checked,
            changed = report.feeds_changed,
            failed = report.feeds_failed,
            skipped = report.feeds_skipped,
            created = report.articles_created,
            updated = report.articles_updated,
            cancelled = report.cancelled,
            "Sync session finished"
        );
        for alert in &report.alerts {
            tracing::warn!(
                feed_id = alert.feed_id,
                title = %alert.title,
                failures = alert.consecutive_failures,
                error = %alert.last_error,
                "Feed keeps failing"
            );
        }
    }

    fn session_aborted(&self, error: &StoreError, partial: &SessionReport) {
        tracing::error!(
            error = %error,
            checked = partial.feeds_checked,
            "Sync session aborted by store failure"
        );
    }

    fn subscription_finished(&self, url: &str, result: Result<&Feed, &SubscribeError>) {
        match result {
            Ok(feed) => tracing::info!(feed_id = feed.id, url = %url, "Subscribed"),
            Err(e) => tracing::warn!(url = %url, error = %e, "Subscription failed"),
        }
    }
}

/// Events emitted by [`ChannelReporter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    Started {
        trigger: SyncTrigger,
        total: usize,
    },
    Progress {
        done: usize,
        total: usize,
        outcome: FeedOutcome,
    },
    Finished(Box<SessionReport>),
    Aborted {
        error: String,
        partial: Box<SessionReport>,
    },
    Subscribed {
        url: String,
        feed_id: i64,
    },
    SubscribeFailed {
        url: String,
        error: String,
    },
}

/// Forwards session events to a UI task over a bounded channel.
///
/// Events are dropped with a warning when the channel is full or closed;
/// the session never waits on the receiver.
#[derive(Debug, Clone)]
pub struct ChannelReporter {
    tx: mpsc::Sender<SyncEvent>,
}

impl ChannelReporter {
    pub fn new(tx: mpsc::Sender<SyncEvent>) -> Self {
        Self { tx }
    }

    fn send(&self, event: SyncEvent) {
        if let Err(e) = self.tx.try_send(event) {
            tracing::warn!(error = %e, "Sync event dropped (receiver full or gone)");
        }
    }
}

impl SyncReporter for ChannelReporter {
    fn session_started(&self, trigger: SyncTrigger, total: usize) {
        self.send(SyncEvent::Started { trigger, total });
    }

    fn feed_progress(&self, done: usize, total: usize, outcome: &FeedOutcome) {
        self.send(SyncEvent::Progress {
            done,
            total,
            outcome: outcome.clone(),
        });
    }

    fn session_finished(&self, report: &SessionReport) {
        self.send(SyncEvent::Finished(Box::new(report.clone())));
    }

    fn session_aborted(&self, error: &StoreError, partial: &SessionReport) {
        self.send(SyncEvent::Aborted {
            error: error.to_string(),
            partial: Box::new(partial.clone()),
        });
    }

    fn subscription_finished(&self, url: &str, result: Result<&Feed, &SubscribeError>) {
        let event = match result {
            Ok(feed) => SyncEvent::Subscribed {
                url: url.to_string(),
                feed_id: feed.id,
            },
            Err(e) => SyncEvent::SubscribeFailed {
                url: url.to_string(),
                error: e.to_string(),
            },
        };
        self.send(event);
    }
}
