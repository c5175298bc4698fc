//! End-to-end behavior of the lease lock and the work queue on in-memory stores.
//!
//! Verifies:
//! - At most one concurrent acquirer wins a lease
//! - Expired leases never block a later acquisition
//! - `with_lock` always releases, even when the closure fails
//! - Enqueue is idempotent while a key is active and re-enters after completion
//! - Concurrent claimers never receive the same row
//! - The worker isolates failing items and honours the lease

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::oneshot;

use questlog_core::{JobType, Lease, WorkItem, WorkOutcome, WorkStatus};
use questlog_infra::lease::{InMemoryLeaseStore, LeaseLock, LeaseStore, LockOutcome};
use questlog_infra::queue::{
    BatchReport, InMemoryWorkQueueStore, QueueWorker, RetryPolicy, WorkQueueStore,
};
use questlog_infra::{Coordination, CoordinationConfig};

const FIVE_MINUTES: Duration = Duration::from_secs(5 * 60);

async fn refresh_seasonal(_item: WorkItem) -> anyhow::Result<()> {
    panic!("seasonal model missing")
}

fn lock() -> Arc<LeaseLock<Arc<InMemoryLeaseStore>>> {
    questlog_observability::init();
    Arc::new(LeaseLock::new(InMemoryLeaseStore::arc()))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_acquirers_get_at_most_one_lease() {
    let lock = lock();

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let lock = lock.clone();
        tasks.push(tokio::spawn(async move {
            lock.acquire("job-x", FIVE_MINUTES).await
        }));
    }

    let mut winners = 0;
    for task in tasks {
        if task.await.unwrap().is_some() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn expired_lease_does_not_block_acquisition() {
    let lock = lock();
    let an_hour_ago = Utc::now() - chrono::Duration::hours(1);
    let stale = Lease::issue("job-x", FIVE_MINUTES, an_hour_ago).unwrap();
    lock.store().insert(&stale).await.unwrap();

    let fresh = lock.acquire("job-x", FIVE_MINUTES).await.unwrap();
    assert_ne!(fresh.holder_token, stale.holder_token);
    assert_eq!(lock.holder("job-x").await.unwrap(), Some(fresh));
}

#[tokio::test]
async fn failing_closure_leaves_no_lease_behind() {
    let lock = lock();

    let result = lock
        .with_lock("job-x", FIVE_MINUTES, || async {
            Err::<(), _>(anyhow::anyhow!("igdb quota exceeded"))
        })
        .await;

    assert_eq!(result.unwrap_err().to_string(), "igdb quota exceeded");
    assert!(lock.holder("job-x").await.unwrap().is_none());
    assert!(lock.acquire("job-x", FIVE_MINUTES).await.is_some());
}

#[tokio::test]
async fn enqueue_twice_while_pending_returns_the_same_row() {
    let queue = InMemoryWorkQueueStore::new();

    let first = queue.enqueue(JobType::PatchSummary, "game-1").await.unwrap();
    let second = queue.enqueue(JobType::PatchSummary, "game-1").await.unwrap();

    assert_eq!(first.id, second.id);
    let rows = queue.list_for_key(JobType::PatchSummary, "game-1").await.unwrap();
    assert_eq!(rows.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_enqueues_create_one_row() {
    let queue = InMemoryWorkQueueStore::arc();

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let queue = queue.clone();
        tasks.push(tokio::spawn(async move {
            queue.enqueue(JobType::PatchSummary, "game-1").await
        }));
    }

    let mut created = 0;
    let mut ids = Vec::new();
    for task in tasks {
        let receipt = task.await.unwrap().unwrap();
        created += usize::from(receipt.created);
        ids.push(receipt.id);
    }
    assert_eq!(created, 1);
    ids.dedup();
    assert_eq!(ids.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claimers_never_share_a_row() {
    questlog_observability::init();
    let queue = Arc::new(InMemoryWorkQueueStore::new());
    let mut enqueued = HashSet::new();
    for i in 0..50 {
        let receipt = queue
            .enqueue(JobType::NewsSummary, &format!("article-{i}"))
            .await
            .unwrap();
        enqueued.insert(receipt.id);
    }

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let queue = queue.clone();
        tasks.push(tokio::spawn(async move {
            let mut mine = Vec::new();
            loop {
                let batch = queue.claim_batch(3).await.unwrap();
                if batch.is_empty() {
                    break mine;
                }
                mine.extend(batch.into_iter().map(|item| item.id));
                tokio::task::yield_now().await;
            }
        }));
    }

    let mut claimed = Vec::new();
    for task in tasks {
        claimed.extend(task.await.unwrap());
    }
    let distinct: HashSet<_> = claimed.iter().copied().collect();
    assert_eq!(distinct.len(), claimed.len(), "a row was claimed twice");
    assert_eq!(distinct, enqueued);
    assert_eq!(queue.stats().await.unwrap().running, 50);
}

#[tokio::test]
async fn enqueue_after_done_creates_a_new_row() {
    let queue = InMemoryWorkQueueStore::new();
    let first = queue.enqueue(JobType::PatchSummary, "game-1").await.unwrap().id;

    let claimed = queue.claim_batch(10).await.unwrap();
    assert_eq!(claimed.len(), 1);
    queue.complete(first, &WorkOutcome::Done).await.unwrap();

    let second = queue.enqueue(JobType::PatchSummary, "game-1").await.unwrap();
    assert!(second.created);
    assert_ne!(second.id, first);
}

#[tokio::test]
async fn simultaneous_with_lock_runs_the_closure_once() {
    let lock = lock();
    let runs = Arc::new(AtomicUsize::new(0));
    let (started_tx, started_rx) = oneshot::channel::<()>();
    let (finish_tx, finish_rx) = oneshot::channel::<()>();

    let holder = {
        let lock = lock.clone();
        let runs = runs.clone();
        tokio::spawn(async move {
            lock.with_lock("fetch-videos", FIVE_MINUTES, || async move {
                runs.fetch_add(1, Ordering::SeqCst);
                let _ = started_tx.send(());
                let _ = finish_rx.await;
                Ok::<_, anyhow::Error>("fetched")
            })
            .await
        })
    };

    started_rx.await.unwrap();

    let second_runs = runs.clone();
    let skipped = lock
        .with_lock("fetch-videos", FIVE_MINUTES, || async move {
            second_runs.fetch_add(1, Ordering::SeqCst);
            Ok::<_, anyhow::Error>("fetched")
        })
        .await
        .unwrap();
    assert_eq!(skipped, LockOutcome::Skipped);

    finish_tx.send(()).unwrap();
    let ran = holder.await.unwrap().unwrap();
    assert_eq!(ran, LockOutcome::Ran("fetched"));
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert!(lock.holder("fetch-videos").await.unwrap().is_none());
}

#[tokio::test]
async fn stale_holder_release_keeps_the_new_lease() {
    let lock = lock();
    let an_hour_ago = Utc::now() - chrono::Duration::hours(1);
    let old = Lease::issue("job-x", FIVE_MINUTES, an_hour_ago).unwrap();
    lock.store().insert(&old).await.unwrap();

    let current = lock.acquire("job-x", FIVE_MINUTES).await.unwrap();
    assert!(!lock.release(&old).await);
    assert_eq!(lock.holder("job-x").await.unwrap(), Some(current));
}

#[tokio::test]
async fn requeue_follows_policy() {
    let queue = InMemoryWorkQueueStore::new();
    let id = queue.enqueue(JobType::NewsSummary, "article-3").await.unwrap().id;
    let policy = RetryPolicy::fixed(2, Duration::from_secs(30));

    for attempt in 1..=2u32 {
        let claimed = queue.claim_batch(1).await.unwrap();
        assert_eq!(claimed[0].attempts, attempt);
        queue
            .complete(id, &WorkOutcome::Error("rss feed down".into()))
            .await
            .unwrap();

        let later = Utc::now() + chrono::Duration::seconds(31);
        let requeued = queue.requeue_errored(&policy, later).await.unwrap();
        if attempt < policy.max_attempts {
            assert_eq!(requeued, vec![id]);
        } else {
            assert!(requeued.is_empty());
        }
    }

    let item = queue.get(id).await.unwrap().unwrap();
    assert_eq!(item.status, WorkStatus::Error);
    assert_eq!(item.attempts, 2);
}

#[tokio::test]
async fn worker_isolates_failures_under_the_lease() {
    let coordination = Coordination::in_memory(&CoordinationConfig::default());
    let mut worker: QueueWorker<_> = coordination.worker();
    worker.register_handler(JobType::PatchSummary, |item| async move {
        if item.entity_id == "game-broken" {
            anyhow::bail!("patch notes page moved");
        }
        Ok(())
    });
    worker.register_handler(JobType::DiscoverSeasonal, refresh_seasonal);

    let queue = coordination.queue();
    for (job_type, entity) in [
        (JobType::PatchSummary, "game-1"),
        (JobType::PatchSummary, "game-broken"),
        (JobType::DiscoverSeasonal, "global"),
        (JobType::PatchSummary, "game-2"),
    ] {
        queue.enqueue(job_type, entity).await.unwrap();
    }

    let outcome = worker
        .run_exclusive(coordination.lock(), "process-work", FIVE_MINUTES)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        LockOutcome::Ran(BatchReport {
            claimed: 4,
            succeeded: 2,
            failed: 2
        })
    );

    let stats = queue.stats().await.unwrap();
    assert_eq!((stats.done, stats.error, stats.pending, stats.running), (2, 2, 0, 0));
    assert!(coordination.lock().holder("process-work").await.unwrap().is_none());
}
