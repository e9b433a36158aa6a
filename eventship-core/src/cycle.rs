//! The collect → upload → delete loop
//!
//! ```text
//!            ┌───────────────────────────────────────────────┐
//!            ▼                                               │
//!       ┌──────────┐     ┌────────────┐  empty   ┌──────┐    │
//!       │ Sleeping │ ──► │ Collecting │ ───────► │ Idle │ ───┤
//!       └──────────┘     └────────────┘          └──────┘    │
//!                              │ events                      │
//!                              ▼                             │
//!                        ┌───────────┐  failure              │
//!                        │ Uploading │ ──────────────────────┤
//!                        └───────────┘                       │
//!                              │ 200 / 201                   │
//!                              ▼                             │
//!                        ┌──────────┐                        │
//!                        │ Deleting │ ───────────────────────┘
//!                        └──────────┘
//! ```
//!
//! Files are only removed after the collector acknowledged the batch, so a
//! failed or unacknowledged upload is retried in full on the next cycle.
//! Delivery is at-least-once; the collector must tolerate duplicates.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::collector::CollectorClient;
use crate::config::UnreadablePolicy;
use crate::error::Error;
use crate::spool::Spool;

/// Where the loop currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Sleeping,
    Collecting,
    Idle,
    Uploading,
    Deleting,
}

/// What one pass did
#[derive(Debug)]
pub enum CycleOutcome {
    /// Nothing to send
    Idle,
    /// Batch acknowledged and its files removed
    Uploaded {
        events: usize,
        deleted: usize,
        delete_failures: usize,
    },
    /// Batch rejected or not delivered; every file was kept
    UploadFailed { events: usize, error: Error },
    /// The spool directory could not be listed
    CollectFailed(Error),
}

/// Counters since start
#[derive(Debug, Default, Clone)]
pub struct CycleStats {
    pub cycles: usize,
    pub events_sent: usize,
    pub uploads_failed: usize,
    pub files_deleted: usize,
    pub delete_failures: usize,
    pub read_failures: usize,
}

/// Drives the spool through the collector, one batch per pass
pub struct UploadCycle {
    spool: Spool,
    client: CollectorClient,
    interval: Duration,
    unreadable: UnreadablePolicy,
    state: CycleState,
    stats: CycleStats,
}

impl UploadCycle {
    pub fn new(spool: Spool, client: CollectorClient, interval: Duration) -> Self {
        Self {
            spool,
            client,
            interval,
            unreadable: UnreadablePolicy::default(),
            state: CycleState::Sleeping,
            stats: CycleStats::default(),
        }
    }

    pub fn with_unreadable_policy(mut self, policy: UnreadablePolicy) -> Self {
        self.unreadable = policy;
        self
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    pub fn stats(&self) -> &CycleStats {
        &self.stats
    }

    /// Sleep, then run a pass, until `running` is cleared.
    ///
    /// The flag is checked between states; a sleep or request in flight
    /// always completes first.
    pub async fn run(&mut self, running: &AtomicBool) {
        tracing::info!(
            dir = %self.spool.dir().display(),
            url = %self.client.url(),
            interval_secs = self.interval.as_secs(),
            "Upload loop started"
        );

        while running.load(Ordering::SeqCst) {
            self.transition(CycleState::Sleeping);
            tokio::time::sleep(self.interval).await;

            if !running.load(Ordering::SeqCst) {
                break;
            }
            self.run_once().await;
        }

        tracing::info!("Upload loop stopped");
    }

    /// One pass from `Collecting` back to `Sleeping`, without the sleep.
    pub async fn run_once(&mut self) -> CycleOutcome {
        self.stats.cycles += 1;
        let outcome = self.pass().await;
        self.transition(CycleState::Sleeping);
        outcome
    }

    async fn pass(&mut self) -> CycleOutcome {
        self.transition(CycleState::Collecting);
        let collection = match self.spool.collect() {
            Ok(collection) => collection,
            Err(e) => {
                tracing::warn!(error = %e, "Unable to find events");
                return CycleOutcome::CollectFailed(e);
            }
        };
        self.stats.read_failures += collection.unreadable.len();

        if collection.is_empty() {
            self.transition(CycleState::Idle);
            return CycleOutcome::Idle;
        }

        let events = collection.events.len();
        tracing::info!(events, "Found event(s)");

        self.transition(CycleState::Uploading);
        if let Err(e) = self.client.send_events(&collection.events).await {
            self.stats.uploads_failed += 1;
            tracing::warn!(error = %e, events, "Upload failed, keeping events for next cycle");
            return CycleOutcome::UploadFailed { events, error: e };
        }
        self.stats.events_sent += events;

        self.transition(CycleState::Deleting);
        let files = collection.files_to_delete(self.unreadable);
        let failures = self.spool.remove(&files).len();
        let deleted = files.len() - failures;
        self.stats.files_deleted += deleted;
        self.stats.delete_failures += failures;

        tracing::info!(
            events,
            deleted,
            delete_failures = failures,
            "Event(s) uploaded"
        );
        CycleOutcome::Uploaded {
            events,
            deleted,
            delete_failures: failures,
        }
    }

    fn transition(&mut self, next: CycleState) {
        if self.state != next {
            tracing::trace!(from = ?self.state, to = ?next, "Cycle state");
            self.state = next;
        }
    }
}
