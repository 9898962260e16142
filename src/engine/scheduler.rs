//! Scheduler: lease, sync, recovery, and the drain loop.
//!
//! One invocation drains the queue sequentially under the lease and then
//! exits. Item state only moves through the store, so a crash at any point
//! leaves rows the next run's recovery pass can resolve.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt as _;
use opentelemetry::KeyValue;
use tracing::{Instrument, Span, error, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::lease::LockManager;
use crate::model::{ItemUpdate, QueueItem, Status};
use crate::prompt;
use crate::store::QueueStore;
use crate::telemetry::metrics;
use crate::telemetry::work::{record_state_transition, start_item_span, start_run_span};
use crate::validate::{ValidationResult, Validator};
use crate::vcs::Publisher;

use super::executor::{TaskRequest, TaskRunner};

/// Error recorded on items whose budget ran out while they were running.
pub const CRASH_ERROR: &str = "Worker crashed or timed out";

/// What one scheduler invocation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunReport {
    /// Another worker holds the lease; nothing was touched.
    LeaseHeld,
    Drained {
        synced: u64,
        recovered: u64,
        /// Picks, counting every retry.
        processed: u64,
        completed: u64,
        requeued: u64,
        failed: u64,
    },
}

/// How a single pick ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settled {
    Completed,
    Requeued,
    Failed,
}

#[derive(Debug, Default)]
struct Tally {
    synced: u64,
    recovered: u64,
    processed: u64,
    completed: u64,
    requeued: u64,
    failed: u64,
}

impl Tally {
    fn record(&mut self, settled: Settled) {
        self.processed += 1;
        match settled {
            Settled::Completed => self.completed += 1,
            Settled::Requeued => self.requeued += 1,
            Settled::Failed => self.failed += 1,
        }
    }

    fn into_report(self) -> RunReport {
        RunReport::Drained {
            synced: self.synced,
            recovered: self.recovered,
            processed: self.processed,
            completed: self.completed,
            requeued: self.requeued,
            failed: self.failed,
        }
    }
}

pub struct Scheduler {
    store: Arc<dyn QueueStore>,
    runner: Arc<dyn TaskRunner>,
    publisher: Arc<dyn Publisher>,
    validator: Validator,
    lease: LockManager,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn QueueStore>,
        runner: Arc<dyn TaskRunner>,
        publisher: Arc<dyn Publisher>,
        validator: Validator,
        lease: LockManager,
    ) -> Self {
        Self {
            store,
            runner,
            publisher,
            validator,
            lease,
        }
    }

    /// Run once: take the lease, drain the queue, release the lease.
    ///
    /// # Errors
    ///
    /// Store failures and panics abort the drain. A recovery pass runs
    /// before the error is returned, and the lease is released either way.
    pub async fn run(&self) -> Result<RunReport> {
        let Some(guard) = self.lease.acquire()? else {
            info!(lease = %self.lease.path().display(), "lease held by another worker, exiting");
            return Ok(RunReport::LeaseHeld);
        };

        let span = start_run_span(&Uuid::new_v4());
        let drained = AssertUnwindSafe(self.drain())
            .catch_unwind()
            .instrument(span.clone())
            .await;

        let result = match drained {
            Ok(Ok(report)) => {
                info!(parent: &span, ?report, "queue drained");
                Ok(report)
            }
            Ok(Err(e)) => {
                error!(parent: &span, "drain aborted: {e}");
                self.recover_best_effort().await;
                Err(e)
            }
            Err(panic) => {
                let msg = panic_message(&*panic);
                error!(parent: &span, "drain panicked: {msg}");
                self.recover_best_effort().await;
                Err(Error::Crashed(msg))
            }
        };

        guard.release();
        result
    }

    async fn drain(&self) -> Result<RunReport> {
        let mut tally = Tally {
            synced: self.store.sync().await?,
            ..Default::default()
        };
        if tally.synced > 0 {
            info!(count = tally.synced, "synced new research topics");
        }

        tally.recovered = self.recover().await?;

        // Re-read every iteration so items enqueued mid-run are seen.
        while let Some(item) = self.store.next_queued().await? {
            let settled = self.process_one(item).await?;
            tally.record(settled);
        }

        Ok(tally.into_report())
    }

    /// Resolve items a previous worker left running.
    async fn recover(&self) -> Result<u64> {
        let stuck = self.store.running().await?;
        for item in &stuck {
            let span = start_item_span(item.id, &item.topic, item.attempts);
            if item.is_exhausted() {
                warn!(
                    parent: &span,
                    item = %item.id,
                    attempts = item.attempts,
                    "stuck item out of attempts, failing"
                );
                self.store
                    .update(
                        item.id,
                        ItemUpdate::new().status(Status::Failed).error(CRASH_ERROR),
                    )
                    .await?;
                record_state_transition(&span, Status::Running, Status::Failed);
            } else {
                warn!(parent: &span, item = %item.id, attempts = item.attempts, "requeueing stuck item");
                self.store
                    .update(item.id, ItemUpdate::new().status(Status::Queued))
                    .await?;
                record_state_transition(&span, Status::Running, Status::Queued);
            }
        }
        Ok(stuck.len() as u64)
    }

    async fn recover_best_effort(&self) {
        match self.recover().await {
            Ok(0) => {}
            Ok(n) => info!(count = n, "recovered items after aborted drain"),
            Err(e) => error!("recovery after aborted drain failed: {e}"),
        }
    }

    async fn process_one(&self, item: QueueItem) -> Result<Settled> {
        let attempt = item.attempts + 1;
        let span = start_item_span(item.id, &item.topic, attempt);

        async {
            let started = Utc::now();
            self.store
                .update(
                    item.id,
                    ItemUpdate::new()
                        .status(Status::Running)
                        .attempts(attempt)
                        .started_at(started),
                )
                .await?;
            record_state_transition(&span, Status::Queued, Status::Running);
            metrics::items_picked().add(1, &[KeyValue::new("model", item.model.as_str())]);

            let item = QueueItem {
                status: Status::Running,
                attempts: attempt,
                started_at: Some(started),
                ..item
            };
            info!(
                item = %item.id,
                topic = %item.topic,
                attempt,
                max_attempts = item.max_attempts,
                "processing"
            );

            // The date is fixed here so the runner and the validator agree
            // on the path even across midnight.
            let date = started.date_naive();
            let artifact = prompt::artifact_path(&item, date);
            let instructions = prompt::build_instructions(&item, &artifact, date);

            let outcome = self
                .runner
                .run(&TaskRequest {
                    item: &item,
                    artifact: &artifact,
                    instructions: &instructions,
                })
                .await;
            if let Some(ref diagnostic) = outcome.diagnostic {
                warn!(item = %item.id, "runner unsuccessful, validating anyway: {diagnostic}");
            }

            let validation = self.validator.validate(&item, &artifact).await;
            for warning in &validation.warnings {
                warn!(item = %item.id, "{warning}");
            }

            let settled = self.settle(&item, &artifact, &validation, &span).await;
            self.publisher.restore_protected().await;
            settled
        }
        .instrument(span.clone())
        .await
    }

    async fn settle(
        &self,
        item: &QueueItem,
        artifact: &Path,
        validation: &ValidationResult,
        span: &Span,
    ) -> Result<Settled> {
        if validation.is_valid() {
            metrics::validation_results().add(1, &[KeyValue::new("result", "valid")]);
            self.store
                .update(
                    item.id,
                    ItemUpdate::new()
                        .status(Status::Completed)
                        .completed_at(Utc::now())
                        .output_file(artifact.to_string_lossy()),
                )
                .await?;
            record_state_transition(span, Status::Running, Status::Completed);
            self.store.mark_origin_processed(item.origin_id).await?;
            info!(item = %item.id, output = %artifact.display(), "completed");

            if let Err(e) = self.publisher.publish().await {
                error!(item = %item.id, "publish failed, commit stays local: {e}");
            }
            return Ok(Settled::Completed);
        }

        metrics::validation_results().add(1, &[KeyValue::new("result", "invalid")]);
        let summary = validation.error_summary();
        for e in &validation.errors {
            warn!(item = %item.id, "validation: {e}");
        }

        if item.is_exhausted() {
            self.store
                .update(
                    item.id,
                    ItemUpdate::new().status(Status::Failed).error(summary),
                )
                .await?;
            record_state_transition(span, Status::Running, Status::Failed);
            error!(item = %item.id, attempts = item.attempts, "failed permanently");
            Ok(Settled::Failed)
        } else {
            self.store
                .update(
                    item.id,
                    ItemUpdate::new().status(Status::Queued).error(summary),
                )
                .await?;
            record_state_transition(span, Status::Running, Status::Queued);
            info!(
                item = %item.id,
                attempts = item.attempts,
                max_attempts = item.max_attempts,
                "requeued for retry"
            );
            Ok(Settled::Requeued)
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}
