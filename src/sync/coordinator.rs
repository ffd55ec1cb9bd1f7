use futures::stream::{self, StreamExt};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::MissedTickBehavior;

use super::backoff::BackoffPolicy;
use super::clock::{Clock, SystemClock};
use super::merge::PendingDownload;
use super::report::{FeedOutcome, FeedStatus, SessionReport, SyncReporter, TracingReporter};
use crate::config::SyncConfig;
use crate::feed::{EnclosureSource, FeedSource, FetchError};
use crate::storage::{Database, Feed, StoreError};

// ============================================================================
// Error Types
// ============================================================================

/// A session-fatal failure. Only the store can cause one.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Sync session aborted: {source}")]
    Store {
        source: StoreError,
        /// Everything recorded before the failure
        partial: Box<SessionReport>,
    },
}

impl SyncError {
    pub fn partial_report(&self) -> &SessionReport {
        match self {
            SyncError::Store { partial, .. } => partial,
        }
    }
}

#[derive(Debug, Error)]
pub enum SubscribeError {
    #[error("Invalid subscription: {0}")]
    Invalid(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What started a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    /// Timer tick: count every feed down by one, then fetch the due ones
    Scheduled,
    /// User request: fetch the feeds that are due, without ticking
    Manual,
    /// User request: fetch every URL feed regardless of backoff
    Forced,
}

// ============================================================================
// Coordinator
// ============================================================================

/// Drives sync sessions: picks feeds, fetches them on a bounded pool,
/// merges the results and moves each feed's backoff state.
///
/// At most one session runs at a time; a trigger that arrives while one is
/// running is ignored. Share it behind an `Arc` to cancel from elsewhere.
pub struct SyncCoordinator {
    db: Database,
    source: Arc<dyn FeedSource>,
    enclosures: Option<Arc<dyn EnclosureSource>>,
    reporter: Arc<dyn SyncReporter>,
    clock: Arc<dyn Clock>,
    policy: BackoffPolicy,
    max_concurrent: usize,
    tick_interval: Duration,
    alert_threshold: u32,
    running: AtomicBool,
    cancelled: AtomicBool,
}

/// Clears the running flag when a session ends, however it ends.
struct SessionGuard<'a>(&'a AtomicBool);

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl SyncCoordinator {
    pub fn new(db: Database, source: Arc<dyn FeedSource>, config: &SyncConfig) -> Self {
        Self {
            db,
            source,
            enclosures: None,
            reporter: Arc::new(TracingReporter),
            clock: Arc::new(SystemClock),
            policy: config.backoff_policy(),
            max_concurrent: config.max_concurrent_fetches.max(1),
            tick_interval: Duration::from_secs(config.tick_interval_secs.max(1)),
            alert_threshold: config.failure_alert_threshold.max(1),
            running: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn SyncReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Download new enclosures in the background after each merge.
    pub fn with_enclosure_source(mut self, source: Arc<dyn EnclosureSource>) -> Self {
        self.enclosures = Some(source);
        self
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn policy(&self) -> BackoffPolicy {
        self.policy
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Ask the running session to stop. Feeds already being fetched finish
    /// their merge; no further feeds are started.
    pub fn cancel(&self) {
        if self.is_running() {
            tracing::info!("Sync cancellation requested");
            self.cancelled.store(true, Ordering::Release);
        }
    }

    // ========================================================================
    // Sessions
    // ========================================================================

    /// Run one session.
    ///
    /// Returns `Ok(None)` without doing anything if a session is already in
    /// progress. Per-feed fetch and decode failures are recorded in the
    /// report; a store failure aborts the session with
    /// [`SyncError::Store`], carrying the partial report.
    pub async fn run_session(
        &self,
        trigger: SyncTrigger,
    ) -> Result<Option<SessionReport>, SyncError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!(trigger = ?trigger, "Sync already running, ignoring trigger");
            return Ok(None);
        }
        let _guard = SessionGuard(&self.running);
        self.cancelled.store(false, Ordering::Release);

        let mut report = SessionReport::new(trigger, self.clock.now());

        let feeds = match self.select_feeds(trigger).await {
            Ok(feeds) => feeds,
            Err(source) => return Err(self.abort(source, report)),
        };
        let total = feeds.len();
        self.reporter.session_started(trigger, total);

        let mut results = stream::iter(feeds)
            .map(|feed| self.sync_feed(feed))
            .buffer_unordered(self.max_concurrent);

        let mut done = 0;
        let mut failure: Option<StoreError> = None;
        while let Some(result) = results.next().await {
            match result {
                Ok(outcome) => {
                    done += 1;
                    self.reporter.feed_progress(done, total, &outcome);
                    report.record(outcome, self.alert_threshold);
                }
                Err(e) => {
                    // Let in-flight merges finish, start nothing new
                    self.cancelled.store(true, Ordering::Release);
                    failure.get_or_insert(e);
                }
            }
        }
        drop(results);

        if let Some(source) = failure {
            return Err(self.abort(source, report));
        }

        report.cancelled = self.cancelled.load(Ordering::Acquire);
        report.finished_at = Some(self.clock.now());
        self.reporter.session_finished(&report);
        Ok(Some(report))
    }

    /// Run scheduled sessions every `tick_interval` until `shutdown` resolves.
    ///
    /// On shutdown a running session is cancelled and allowed to wind down.
    /// Store failures end that session only; the loop keeps going.
    pub async fn run<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        tracing::info!(
            tick_secs = self.tick_interval.as_secs(),
            workers = self.max_concurrent,
            "Sync loop started"
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => {
                    let session = self.run_session(SyncTrigger::Scheduled);
                    tokio::pin!(session);
                    let mut stopping = false;
                    let result = tokio::select! {
                        result = &mut session => result,
                        _ = &mut shutdown => {
                            stopping = true;
                            self.cancel();
                            session.await
                        }
                    };
                    if let Err(e) = result {
                        tracing::error!(error = %e, "Scheduled sync failed");
                    }
                    if stopping {
                        break;
                    }
                }
            }
        }

        tracing::info!("Sync loop stopped");
    }

    async fn select_feeds(&self, trigger: SyncTrigger) -> Result<Vec<Feed>, StoreError> {
        match trigger {
            SyncTrigger::Scheduled => {
                let moved = self.db.tick_backoff().await?;
                tracing::debug!(moved = moved, "Scheduler tick");
                self.db.due_feeds().await
            }
            SyncTrigger::Manual => self.db.due_feeds().await,
            SyncTrigger::Forced => self.db.fetchable_feeds().await,
        }
    }

    fn abort(&self, source: StoreError, mut partial: SessionReport) -> SyncError {
        partial.finished_at = Some(self.clock.now());
        self.reporter.session_aborted(&source, &partial);
        SyncError::Store {
            source,
            partial: Box::new(partial),
        }
    }

    /// Fetch, merge and reschedule one feed.
    ///
    /// Only store failures are returned as errors; everything else ends up
    /// in the outcome.
    async fn sync_feed(&self, feed: Feed) -> Result<FeedOutcome, StoreError> {
        if self.cancelled.load(Ordering::Acquire) {
            return Ok(FeedOutcome::new(&feed, FeedStatus::Skipped));
        }
        let Some(url) = feed.fetch_url() else {
            return Ok(FeedOutcome::new(&feed, FeedStatus::Skipped));
        };

        match self.source.fetch(url).await {
            Ok(document) => {
                let merge = match self.db.merge_feed(feed.id, &document, self.clock.now()).await {
                    Ok(merge) => merge,
                    Err(StoreError::FeedNotFound(_)) => {
                        return Ok(FeedOutcome::new(&feed, FeedStatus::Removed))
                    }
                    Err(e) => return Err(e),
                };
                for warning in &merge.warnings {
                    tracing::warn!(feed_id = feed.id, warning = %warning, "Dropped feed entry");
                }

                let changed = merge.changed();
                let state = self.policy.after_success(feed.backoff(), changed);
                match self.db.record_fetch_success(feed.id, state).await {
                    Ok(()) => {}
                    Err(StoreError::FeedNotFound(_)) => {
                        return Ok(FeedOutcome::new(&feed, FeedStatus::Removed))
                    }
                    Err(e) => return Err(e),
                }
                tracing::debug!(
                    feed_id = feed.id,
                    changed = changed,
                    wait_period = state.wait_period,
                    "Feed rescheduled"
                );

                self.spawn_downloads(merge.new_enclosures.clone());

                let status = if changed {
                    FeedStatus::Changed
                } else {
                    FeedStatus::Unchanged
                };
                Ok(FeedOutcome {
                    created: merge.created,
                    updated: merge.updated,
                    enclosures_added: merge.enclosures_added,
                    decode_warnings: merge.warnings.len(),
                    wait_period: state.wait_period,
                    remaining_wait: state.remaining_wait,
                    consecutive_failures: 0,
                    ..FeedOutcome::new(&feed, status)
                })
            }
            Err(e) => {
                let message = e.to_string();
                tracing::warn!(feed_id = feed.id, url = %url, error = %message, "Feed fetch failed");

                let state = self.policy.after_failure(feed.backoff());
                let failures = match self.db.record_fetch_failure(feed.id, state, &message).await {
                    Ok(failures) => failures,
                    Err(StoreError::FeedNotFound(_)) => {
                        return Ok(FeedOutcome::new(&feed, FeedStatus::Removed))
                    }
                    Err(e) => return Err(e),
                };
                Ok(FeedOutcome {
                    wait_period: state.wait_period,
                    remaining_wait: state.remaining_wait,
                    consecutive_failures: failures,
                    ..FeedOutcome::new(&feed, FeedStatus::Failed(message))
                })
            }
        }
    }

    /// Fire-and-forget: the session never waits for these.
    fn spawn_downloads(&self, pending: Vec<PendingDownload>) {
        let Some(source) = self.enclosures.clone() else {
            return;
        };
        if pending.is_empty() {
            return;
        }
        let db = self.db.clone();
        tokio::spawn(async move {
            for download in pending {
                match source.download(&download.url).await {
                    Ok(bytes) => {
                        if let Err(e) = db.store_enclosure_data(download.enclosure_id, &bytes).await
                        {
                            tracing::warn!(
                                enclosure_id = download.enclosure_id,
                                error = %e,
                                "Failed to store enclosure"
                            );
                        }
                    }
                    Err(e) => tracing::warn!(
                        url = %download.url,
                        error = %e,
                        "Enclosure download failed"
                    ),
                }
            }
        });
    }

    /// Queue downloads for enclosures left undownloaded by earlier runs.
    ///
    /// Returns how many were queued; zero when no enclosure source is set.
    pub async fn resume_downloads(&self, limit: i64) -> Result<usize, StoreError> {
        if self.enclosures.is_none() {
            return Ok(0);
        }
        let pending: Vec<PendingDownload> = self
            .db
            .pending_enclosures(limit)
            .await?
            .into_iter()
            .map(|(enclosure_id, url)| PendingDownload { enclosure_id, url })
            .collect();
        let queued = pending.len();
        self.spawn_downloads(pending);
        Ok(queued)
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    /// Subscribe to a URL feed.
    ///
    /// A known URL returns the existing feed untouched. Otherwise the
    /// document is fetched first and nothing is stored if that fails; on
    /// success the feed is created, merged and rescheduled like any other
    /// successful fetch.
    pub async fn subscribe(&self, url: &str) -> Result<Feed, SubscribeError> {
        let url = url.trim();
        let result = self.subscribe_url(url).await;
        self.reporter.subscription_finished(url, result.as_ref());
        result
    }

    async fn subscribe_url(&self, url: &str) -> Result<Feed, SubscribeError> {
        if url.is_empty() {
            return Err(SubscribeError::Invalid("feed URL cannot be empty".into()));
        }
        if let Some(existing) = self.db.find_feed_by_url(url).await? {
            return Ok(existing);
        }

        let document = self.source.fetch(url).await?;
        let initial = self.policy.initial();
        let feed = self
            .db
            .create_feed(url, document.title.as_deref().unwrap_or_default(), initial.wait_period)
            .await?;

        let merge = self.db.merge_feed(feed.id, &document, self.clock.now()).await?;
        let state = self.policy.after_success(feed.backoff(), merge.changed());
        self.db.record_fetch_success(feed.id, state).await?;
        self.spawn_downloads(merge.new_enclosures);

        tracing::info!(
            feed_id = feed.id,
            articles = merge.created,
            "New feed subscribed"
        );
        self.db
            .get_feed(feed.id)
            .await?
            .ok_or(SubscribeError::Store(StoreError::FeedNotFound(feed.id)))
    }

    /// Create a query feed; it is never fetched.
    pub async fn subscribe_query(&self, title: &str, query: &str) -> Result<Feed, SubscribeError> {
        let feed = self.db.create_query_feed(title, query, "").await.map_err(|e| match e {
            StoreError::Invalid(msg) => SubscribeError::Invalid(msg),
            other => SubscribeError::Store(other),
        })?;
        tracing::info!(feed_id = feed.id, "Query feed created");
        Ok(feed)
    }
}
