//! Integration tests for the drain loop, with a scripted runner and a
//! recording publisher standing in for the external task and git.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use researchq::db::Db;
use researchq::engine::{CRASH_ERROR, RunReport, Scheduler, TaskOutcome, TaskRequest, TaskRunner};
use researchq::error::{Error, Result};
use researchq::lease::LockManager;
use researchq::model::*;
use researchq::store::QueueStore;
use researchq::validate::Validator;
use researchq::vcs::Publisher;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Test doubles
// ---------------------------------------------------------------------------

/// What the scripted runner does on one call.
#[derive(Debug, Clone, Copy)]
enum Step {
    /// Write a complete, valid artifact.
    Valid,
    /// Write an artifact that is far too short.
    Short,
    /// Write nothing and report failure.
    Nothing,
    Panic,
}

struct ScriptedRunner {
    root: PathBuf,
    steps: Mutex<VecDeque<Step>>,
    seen: Mutex<Vec<(String, u32)>>,
}

impl ScriptedRunner {
    fn new(root: &Path, steps: impl IntoIterator<Item = Step>) -> Arc<Self> {
        Arc::new(Self {
            root: root.to_path_buf(),
            steps: Mutex::new(steps.into_iter().collect()),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn seen(&self) -> Vec<(String, u32)> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskRunner for ScriptedRunner {
    async fn run(&self, request: &TaskRequest<'_>) -> TaskOutcome {
        let item = request.item;
        self.seen
            .lock()
            .unwrap()
            .push((item.topic.clone(), item.attempts));
        let step = self.steps.lock().unwrap().pop_front().unwrap_or(Step::Nothing);

        let path = self.root.join(request.artifact);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        match step {
            Step::Valid => std::fs::write(&path, valid_artifact(&item.topic)).unwrap(),
            Step::Short => std::fs::write(&path, "too short").unwrap(),
            Step::Nothing => {
                return TaskOutcome {
                    diagnostic: Some("runner exited with status 1".into()),
                    exit_code: Some(1),
                    ..Default::default()
                };
            }
            Step::Panic => panic!("runner blew up"),
        }
        TaskOutcome {
            success: true,
            exit_code: Some(0),
            duration: Duration::from_millis(5),
            ..Default::default()
        }
    }
}

/// Inserts one more item while running its first task, then behaves like
/// the wrapped runner.
struct EnqueuingRunner {
    db: Arc<Db>,
    pending: Mutex<Option<NewQueueItem>>,
    inner: Arc<ScriptedRunner>,
}

#[async_trait]
impl TaskRunner for EnqueuingRunner {
    async fn run(&self, request: &TaskRequest<'_>) -> TaskOutcome {
        let pending = self.pending.lock().unwrap().take();
        if let Some(new) = pending {
            self.db.insert(new).await.unwrap();
        }
        self.inner.run(request).await
    }
}

/// Which store call breaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fault {
    /// The update that marks an item completed.
    Complete,
    /// The second `next_queued` call.
    SecondPick,
}

/// Delegates to the database, failing one call.
struct FlakyStore {
    inner: Arc<Db>,
    fault: Fault,
    tripped: AtomicBool,
    picks: AtomicUsize,
}

impl FlakyStore {
    fn new(inner: Arc<Db>, fault: Fault) -> Arc<Self> {
        Arc::new(Self {
            inner,
            fault,
            tripped: AtomicBool::new(false),
            picks: AtomicUsize::new(0),
        })
    }

    fn trip(&self) -> Result<()> {
        if self.tripped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        Err(Error::Other("disk I/O error".into()))
    }
}

#[async_trait]
impl QueueStore for FlakyStore {
    async fn next_queued(&self) -> Result<Option<QueueItem>> {
        let picks = self.picks.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fault == Fault::SecondPick && picks == 2 {
            self.trip()?;
        }
        self.inner.next_queued().await
    }

    async fn running(&self) -> Result<Vec<QueueItem>> {
        self.inner.running().await
    }

    async fn insert(&self, new: NewQueueItem) -> Result<InsertResult> {
        self.inner.insert(new).await
    }

    async fn update(&self, id: ItemId, update: ItemUpdate) -> Result<()> {
        if self.fault == Fault::Complete && update.status == Some(Status::Completed) {
            self.trip()?;
        }
        self.inner.update(id, update).await
    }

    async fn sync(&self) -> Result<u64> {
        self.inner.sync().await
    }

    async fn mark_origin_processed(&self, origin: OriginId) -> Result<()> {
        self.inner.mark_origin_processed(origin).await
    }

    async fn get(&self, id: ItemId) -> Result<QueueItem> {
        self.inner.get(id).await
    }

    async fn list(&self, status: Option<Status>) -> Result<Vec<QueueItem>> {
        self.inner.list(status).await
    }
}

#[derive(Default)]
struct RecordingPublisher {
    fail_publish: bool,
    published: AtomicUsize,
    restored: AtomicUsize,
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self) -> Result<()> {
        self.published.fetch_add(1, Ordering::SeqCst);
        if self.fail_publish {
            return Err(Error::Other("remote rejected".into()));
        }
        Ok(())
    }

    async fn restore_protected(&self) {
        self.restored.fetch_add(1, Ordering::SeqCst);
    }
}

fn valid_artifact(topic: &str) -> String {
    let mut body = format!(
        "---\ndate: 2026-03-01\ntopic: {topic}\nstatus: complete\ntags: [test]\n---\n\n\
         ## Context\n\nBackground.\n\n\
         ## Findings\n\nhttps://example.com/1 https://example.com/2 https://example.com/3\n\n\
         ## Open Questions\n\nNone yet.\n\n\
         ## Extracted Principles\n\nKeep it simple.\n\n"
    );
    while body.len() < 9_000 {
        body.push_str("Filler text for a realistic research artifact body. ");
    }
    body
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    db: Arc<Db>,
    root: PathBuf,
    lock_path: PathBuf,
    publisher: Arc<RecordingPublisher>,
}

impl Harness {
    async fn new() -> Self {
        Self::with_publisher(RecordingPublisher::default()).await
    }

    async fn with_publisher(publisher: RecordingPublisher) -> Self {
        let root = std::env::temp_dir().join(format!("researchq-sched-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&root).unwrap();
        Self {
            db: Arc::new(Db::in_memory().await.unwrap()),
            lock_path: root.join("automation/logs/worker.lock"),
            root,
            publisher: Arc::new(publisher),
        }
    }

    fn lease(&self) -> LockManager {
        LockManager::new(&self.lock_path, Duration::from_secs(60 * 60))
    }

    fn scheduler(&self, runner: Arc<dyn TaskRunner>) -> Scheduler {
        self.scheduler_with_store(self.db.clone(), runner)
    }

    fn scheduler_with_store(
        &self,
        store: Arc<dyn QueueStore>,
        runner: Arc<dyn TaskRunner>,
    ) -> Scheduler {
        Scheduler::new(
            store,
            runner,
            self.publisher.clone(),
            Validator::new(&self.root),
            self.lease(),
        )
    }

    async fn enqueue(&self, new: NewQueueItem) -> QueueItem {
        self.db.insert(new).await.unwrap().item().clone()
    }

    fn published(&self) -> usize {
        self.publisher.published.load(Ordering::SeqCst)
    }

    fn restored(&self) -> usize {
        self.publisher.restored.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn empty_queue_drains_to_nothing() {
    let h = Harness::new().await;
    let runner = ScriptedRunner::new(&h.root, []);

    let report = h.scheduler(runner.clone()).run().await.unwrap();

    assert_eq!(
        report,
        RunReport::Drained {
            synced: 0,
            recovered: 0,
            processed: 0,
            completed: 0,
            requeued: 0,
            failed: 0
        }
    );
    assert!(runner.seen().is_empty());
    assert!(!h.lock_path.exists());
}

#[tokio::test]
async fn valid_artifact_completes_item() {
    let h = Harness::new().await;
    let item = h.enqueue(NewQueueItem::new("Event sourcing")).await;
    let runner = ScriptedRunner::new(&h.root, [Step::Valid]);

    let report = h.scheduler(runner.clone()).run().await.unwrap();

    assert!(matches!(
        report,
        RunReport::Drained {
            processed: 1,
            completed: 1,
            requeued: 0,
            failed: 0,
            ..
        }
    ));

    let done = h.db.get(item.id).await.unwrap();
    assert_eq!(done.status, Status::Completed);
    assert_eq!(done.attempts, 1);
    assert!(done.started_at.is_some());
    assert!(done.completed_at.is_some());
    let output = done.output_file.expect("output file recorded");
    assert!(output.starts_with("research/"), "{output}");
    assert!(output.ends_with("-event-sourcing.md"), "{output}");
    assert!(h.root.join(&output).exists());

    let origin = h.db.get_origin(item.origin_id).await.unwrap();
    assert_eq!(origin.status, OriginStatus::Processed);

    assert_eq!(h.published(), 1);
    assert_eq!(h.restored(), 1);
    assert!(!h.lock_path.exists());
}

#[tokio::test]
async fn two_invalid_attempts_fail_with_last_errors() {
    let h = Harness::new().await;
    let item = h
        .enqueue(NewQueueItem::new("Event sourcing").max_attempts(2))
        .await;
    let runner = ScriptedRunner::new(&h.root, [Step::Short, Step::Nothing]);

    let report = h.scheduler(runner.clone()).run().await.unwrap();

    assert!(matches!(
        report,
        RunReport::Drained {
            processed: 2,
            completed: 0,
            requeued: 1,
            failed: 1,
            ..
        }
    ));
    assert_eq!(
        runner.seen(),
        vec![("Event sourcing".to_string(), 1), ("Event sourcing".to_string(), 2)]
    );

    let failed = h.db.get(item.id).await.unwrap();
    assert_eq!(failed.status, Status::Failed);
    assert_eq!(failed.attempts, 2);
    // The second attempt's artifact is the same path the first one wrote,
    // so the stored errors are the short-content ones from attempt two.
    let error = failed.error.expect("errors recorded");
    assert!(error.starts_with("Content too short: 9 chars"), "{error}");
    assert!(error.contains("; Missing header block (---...---)"), "{error}");
    assert_eq!(h.published(), 0);
    assert_eq!(h.restored(), 2);
}

#[tokio::test]
async fn missing_artifact_twice_records_not_found() {
    let h = Harness::new().await;
    let item = h.enqueue(NewQueueItem::new("Vector clocks")).await;
    let runner = ScriptedRunner::new(&h.root, [Step::Nothing, Step::Nothing]);

    h.scheduler(runner).run().await.unwrap();

    let failed = h.db.get(item.id).await.unwrap();
    assert_eq!(failed.status, Status::Failed);
    let error = failed.error.unwrap();
    assert!(error.starts_with("Output file not found: research/"), "{error}");
    assert!(!error.contains(';'), "{error}");
}

#[tokio::test]
async fn retry_succeeds_on_second_attempt() {
    let h = Harness::new().await;
    let item = h.enqueue(NewQueueItem::new("CRDT merge semantics")).await;
    let runner = ScriptedRunner::new(&h.root, [Step::Nothing, Step::Valid]);

    h.scheduler(runner).run().await.unwrap();

    let done = h.db.get(item.id).await.unwrap();
    assert_eq!(done.status, Status::Completed);
    assert_eq!(done.attempts, 2);
}

#[tokio::test]
async fn items_run_in_priority_order() {
    let h = Harness::new().await;
    h.enqueue(NewQueueItem::new("later").priority(7)).await;
    h.enqueue(NewQueueItem::new("first").priority(1)).await;
    h.enqueue(NewQueueItem::new("middle").priority(5)).await;
    let runner = ScriptedRunner::new(&h.root, [Step::Valid, Step::Valid, Step::Valid]);

    h.scheduler(runner.clone()).run().await.unwrap();

    let order: Vec<String> = runner.seen().into_iter().map(|(topic, _)| topic).collect();
    assert_eq!(order, vec!["first", "middle", "later"]);
}

#[tokio::test]
async fn running_items_are_recovered_by_attempts() {
    let h = Harness::new().await;
    let spent = h
        .enqueue(NewQueueItem::new("spent").max_attempts(1).priority(1))
        .await;
    let retry = h
        .enqueue(NewQueueItem::new("retry").max_attempts(2).priority(2))
        .await;
    // Simulate a worker that crashed mid-task on both.
    for item in [&spent, &retry] {
        h.db.update(
            item.id,
            ItemUpdate::new()
                .status(Status::Running)
                .attempts(1)
                .started_at(Utc::now()),
        )
        .await
        .unwrap();
    }
    let runner = ScriptedRunner::new(&h.root, [Step::Valid]);

    let report = h.scheduler(runner.clone()).run().await.unwrap();

    assert!(matches!(
        report,
        RunReport::Drained {
            recovered: 2,
            processed: 1,
            completed: 1,
            ..
        }
    ));

    let spent = h.db.get(spent.id).await.unwrap();
    assert_eq!(spent.status, Status::Failed);
    assert_eq!(spent.error.as_deref(), Some(CRASH_ERROR));

    let retry = h.db.get(retry.id).await.unwrap();
    assert_eq!(retry.status, Status::Completed);
    assert_eq!(retry.attempts, 2);
    assert_eq!(runner.seen(), vec![("retry".to_string(), 2)]);
    assert!(h.db.running().await.unwrap().is_empty());
}

#[tokio::test]
async fn held_lease_touches_nothing() {
    let h = Harness::new().await;
    let item = h.enqueue(NewQueueItem::new("blocked")).await;
    h.db.record_origin(NewOrigin::new("captured elsewhere").processed())
        .await
        .unwrap();
    let _other = h.lease().acquire().unwrap().expect("lease should be free");
    let runner = ScriptedRunner::new(&h.root, [Step::Valid]);

    let report = h.scheduler(runner.clone()).run().await.unwrap();

    assert_eq!(report, RunReport::LeaseHeld);
    assert!(runner.seen().is_empty());
    let untouched = h.db.get(item.id).await.unwrap();
    assert_eq!(untouched.status, Status::Queued);
    assert_eq!(untouched.attempts, 0);
    // Sync did not run either.
    assert_eq!(h.db.list(None).await.unwrap().len(), 1);
    // The other holder's lease is left alone.
    assert!(h.lock_path.exists());
}

#[tokio::test]
async fn stale_lease_is_taken_over() {
    let h = Harness::new().await;
    h.enqueue(NewQueueItem::new("after crash")).await;
    let crashed = h
        .lease()
        .acquire_at(Utc::now() - chrono::TimeDelta::hours(2))
        .unwrap()
        .unwrap();
    std::mem::forget(crashed);
    let runner = ScriptedRunner::new(&h.root, [Step::Valid]);

    let report = h.scheduler(runner).run().await.unwrap();

    assert!(matches!(report, RunReport::Drained { completed: 1, .. }));
    assert!(!h.lock_path.exists());
}

#[tokio::test]
async fn synced_origins_are_drained() {
    let h = Harness::new().await;
    h.db.record_origin(
        NewOrigin::new("Local-first software and sync engines")
            .topic("Local-first sync")
            .processed(),
    )
    .await
    .unwrap();
    let runner = ScriptedRunner::new(&h.root, [Step::Valid]);

    let report = h.scheduler(runner.clone()).run().await.unwrap();

    assert!(matches!(
        report,
        RunReport::Drained {
            synced: 1,
            completed: 1,
            ..
        }
    ));
    assert_eq!(runner.seen(), vec![("Local-first sync".to_string(), 1)]);
}

#[tokio::test]
async fn publish_failure_still_completes() {
    let h = Harness::with_publisher(RecordingPublisher {
        fail_publish: true,
        ..Default::default()
    })
    .await;
    let item = h.enqueue(NewQueueItem::new("Offline conflict resolution")).await;
    let runner = ScriptedRunner::new(&h.root, [Step::Valid]);

    let report = h.scheduler(runner).run().await.unwrap();

    assert!(matches!(report, RunReport::Drained { completed: 1, .. }));
    assert_eq!(h.db.get(item.id).await.unwrap().status, Status::Completed);
    assert_eq!(h.published(), 1);
    assert_eq!(h.restored(), 1);
}

#[tokio::test]
async fn panic_recovers_and_releases_lease() {
    let h = Harness::new().await;
    let item = h.enqueue(NewQueueItem::new("explodes")).await;
    let runner = ScriptedRunner::new(&h.root, [Step::Panic]);

    let err = h.scheduler(runner).run().await.unwrap_err();

    match err {
        Error::Crashed(msg) => assert!(msg.contains("runner blew up"), "{msg}"),
        other => panic!("expected Crashed, got {other:?}"),
    }
    let recovered = h.db.get(item.id).await.unwrap();
    assert_eq!(recovered.status, Status::Queued);
    assert_eq!(recovered.attempts, 1);
    assert!(!h.lock_path.exists());
}

#[tokio::test]
async fn panic_on_last_attempt_fails_item() {
    let h = Harness::new().await;
    let item = h
        .enqueue(NewQueueItem::new("explodes once").max_attempts(1))
        .await;
    let runner = ScriptedRunner::new(&h.root, [Step::Panic]);

    assert!(h.scheduler(runner).run().await.is_err());

    let failed = h.db.get(item.id).await.unwrap();
    assert_eq!(failed.status, Status::Failed);
    assert_eq!(failed.error.as_deref(), Some(CRASH_ERROR));
}

#[tokio::test]
async fn store_failure_mid_drain_recovers_and_releases_lease() {
    let h = Harness::new().await;
    let item = h.enqueue(NewQueueItem::new("Write-ahead logging")).await;
    let store = FlakyStore::new(h.db.clone(), Fault::Complete);
    let runner = ScriptedRunner::new(&h.root, [Step::Valid]);

    let err = h
        .scheduler_with_store(store, runner.clone())
        .run()
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Other(ref msg) if msg == "disk I/O error"), "{err:?}");
    assert_eq!(runner.seen().len(), 1);
    assert!(h.db.running().await.unwrap().is_empty());
    let recovered = h.db.get(item.id).await.unwrap();
    assert_eq!(recovered.status, Status::Queued);
    assert_eq!(recovered.attempts, 1);
    assert_eq!(h.published(), 0);
    assert!(!h.lock_path.exists());
}

#[tokio::test]
async fn failing_pick_aborts_run_after_settled_items() {
    let h = Harness::new().await;
    let first = h.enqueue(NewQueueItem::new("Raft log compaction").priority(1)).await;
    let second = h.enqueue(NewQueueItem::new("Paxos variants").priority(2)).await;
    let store = FlakyStore::new(h.db.clone(), Fault::SecondPick);
    let runner = ScriptedRunner::new(&h.root, [Step::Valid, Step::Valid]);

    let result = h.scheduler_with_store(store, runner.clone()).run().await;

    assert!(result.is_err());
    assert_eq!(runner.seen(), vec![("Raft log compaction".to_string(), 1)]);
    assert_eq!(h.db.get(first.id).await.unwrap().status, Status::Completed);
    let untouched = h.db.get(second.id).await.unwrap();
    assert_eq!(untouched.status, Status::Queued);
    assert_eq!(untouched.attempts, 0);
    assert!(h.db.running().await.unwrap().is_empty());
    assert!(!h.lock_path.exists());
}

#[tokio::test]
async fn item_enqueued_mid_run_is_picked_up() {
    let h = Harness::new().await;
    h.enqueue(NewQueueItem::new("Merkle trees")).await;
    let inner = ScriptedRunner::new(&h.root, [Step::Valid, Step::Valid]);
    let runner = Arc::new(EnqueuingRunner {
        db: h.db.clone(),
        pending: Mutex::new(Some(NewQueueItem::new("Bloom filters").priority(9))),
        inner: inner.clone(),
    });

    let report = h.scheduler(runner).run().await.unwrap();

    assert!(matches!(
        report,
        RunReport::Drained {
            processed: 2,
            completed: 2,
            ..
        }
    ));
    assert_eq!(
        inner.seen(),
        vec![("Merkle trees".to_string(), 1), ("Bloom filters".to_string(), 1)]
    );
    assert!(h.db.list(Some(Status::Queued)).await.unwrap().is_empty());
}
