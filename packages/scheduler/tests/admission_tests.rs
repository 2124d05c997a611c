//! Behavioural tests for per-team admission control over the in-memory
//! queue and ledger.

use std::sync::Arc;
use std::time::Duration;

use scheduler_core::domains::concurrency::{
    AdmissionConfig, AdmissionControl, ConcurrencyLedger, ConcurrencyLimits, LedgerKey, MemoryConcurrencyLedger,
};
use scheduler_core::kernel::jobs::{JobPool, JobQueue, MemoryJobQueue, NewJob};
use serde_json::json;
use uuid::Uuid;

fn setup(limit: usize, lease: Duration) -> (Arc<MemoryJobQueue>, Arc<MemoryConcurrencyLedger>, AdmissionControl) {
    let queue = Arc::new(MemoryJobQueue::new());
    let ledger = Arc::new(MemoryConcurrencyLedger::new());
    let admission = AdmissionControl::new(
        queue.clone(),
        ledger.clone(),
        AdmissionConfig {
            limits: ConcurrencyLimits {
                default_limit: limit,
                ..Default::default()
            },
            lease,
        },
    );
    (queue, ledger, admission)
}

fn team_job(priority: i32) -> NewJob {
    NewJob::builder().team_id("acme").priority(priority).build()
}

#[tokio::test]
async fn test_limit_k_backlogs_overflow_and_promotes_by_priority() {
    const K: usize = 3;
    let (queue, ledger, admission) = setup(K, Duration::from_secs(600));
    let key = LedgerKey::new("acme", JobPool::Scrape);

    for _ in 0..K {
        assert!(admission.check_admission(team_job(10)).await.unwrap().is_admitted());
    }

    let mut by_priority = Vec::new();
    for priority in [5, 1, 4, 2, 3] {
        let outcome = admission.check_admission(team_job(priority)).await.unwrap();
        assert!(!outcome.is_admitted());
        by_priority.push((priority, outcome.job_id()));
    }
    by_priority.sort();
    let expected: Vec<Uuid> = by_priority.into_iter().map(|(_, id)| id).collect();

    assert_eq!(ledger.active_count(&key).await.unwrap(), K);
    let counts = queue.status_counts().await.unwrap();
    assert_eq!(counts.queued, K as i64);
    assert_eq!(counts.backlog, 5);

    // Drain one job at a time; each release promotes the best backlog entry
    let mut promoted = Vec::new();
    while let Some(job) = queue.get_job_to_process(Uuid::new_v4()).await.unwrap() {
        let token = job.lock_token.unwrap();
        queue.job_finish(job.id, token, json!({})).await.unwrap();
        promoted.extend(admission.release(&job.team_id, job.pool, job.id).await.unwrap());
        assert!(ledger.active_count(&key).await.unwrap() <= K);
    }

    assert_eq!(promoted, expected);
    assert_eq!(ledger.active_count(&key).await.unwrap(), 0);
    assert_eq!(queue.status_counts().await.unwrap().backlog, 0);
}

#[tokio::test]
async fn test_teams_do_not_share_capacity() {
    let (_queue, _ledger, admission) = setup(1, Duration::from_secs(600));

    let a = admission
        .check_admission(NewJob::builder().team_id("a").build())
        .await
        .unwrap();
    let b = admission
        .check_admission(NewJob::builder().team_id("b").build())
        .await
        .unwrap();
    let extract = admission
        .check_admission(NewJob::builder().team_id("a").pool(JobPool::Extract).build())
        .await
        .unwrap();

    assert!(a.is_admitted());
    assert!(b.is_admitted());
    assert!(extract.is_admitted());
}

#[tokio::test]
async fn test_reconcile_adopts_unledgered_job_once() {
    let (queue, ledger, admission) = setup(2, Duration::from_secs(600));
    let key = LedgerKey::new("acme", JobPool::Scrape);

    // In the queue of record, absent from the ledger
    let stray = queue.add_job(team_job(10)).await.unwrap();
    assert_eq!(ledger.active_count(&key).await.unwrap(), 0);

    let report = admission.reconcile(Some("acme")).await.unwrap();
    assert_eq!(report.active_added, 1);
    assert_eq!(ledger.active_job_ids(&key).await.unwrap(), vec![stray.id]);

    let again = admission.reconcile(Some("acme")).await.unwrap();
    assert_eq!(again.drift(), 0);
    assert_eq!(ledger.active_count(&key).await.unwrap(), 1);

    // The adopted slot counts against the limit
    assert!(admission.check_admission(team_job(10)).await.unwrap().is_admitted());
    assert!(!admission.check_admission(team_job(10)).await.unwrap().is_admitted());
}

#[tokio::test]
async fn test_reconcile_restores_lost_backlog_entry() {
    let (queue, ledger, admission) = setup(1, Duration::from_secs(600));
    let key = LedgerKey::new("acme", JobPool::Scrape);

    let running = admission.check_admission(team_job(10)).await.unwrap();
    assert!(running.is_admitted());

    // Parked in storage, but the ledger never heard of it
    let parked = team_job(10);
    let parked_id = parked.id;
    queue.add_backlog_job(parked).await.unwrap();

    let report = admission.reconcile(None).await.unwrap();
    assert_eq!(report.backlog_added, 1);
    assert_eq!(report.promoted, 0);
    assert_eq!(ledger.backlog_job_ids(&key).await.unwrap(), vec![parked_id]);

    // Capacity frees: the restored entry is promoted, not lost
    let job = queue.get_job_to_process(Uuid::new_v4()).await.unwrap().unwrap();
    queue.job_finish(job.id, job.lock_token.unwrap(), json!({})).await.unwrap();
    let promoted = admission.release("acme", JobPool::Scrape, job.id).await.unwrap();
    assert_eq!(promoted, vec![parked_id]);
    assert!(queue.get_job(parked_id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_reconcile_releases_slot_of_finished_job() {
    let (queue, ledger, admission) = setup(1, Duration::from_secs(600));
    let key = LedgerKey::new("acme", JobPool::Scrape);

    admission.check_admission(team_job(10)).await.unwrap();
    let waiting = admission.check_admission(team_job(10)).await.unwrap();
    assert!(!waiting.is_admitted());

    // Worker finished the job but crashed before releasing the slot
    let job = queue.get_job_to_process(Uuid::new_v4()).await.unwrap().unwrap();
    queue.job_finish(job.id, job.lock_token.unwrap(), json!({})).await.unwrap();

    let report = admission.reconcile(Some("acme")).await.unwrap();
    assert_eq!(report.active_released, 1);
    assert_eq!(report.promoted, 1);
    assert_eq!(ledger.active_job_ids(&key).await.unwrap(), vec![waiting.job_id()]);
}

#[tokio::test]
async fn test_expired_lease_of_vanished_holder_frees_slot_for_sweep() {
    let (queue, ledger, admission) = setup(1, Duration::from_millis(50));
    let key = LedgerKey::new("acme", JobPool::Scrape);

    // A producer took a slot and died before its job reached the queue
    assert!(ledger
        .try_acquire(&key, Uuid::new_v4(), 1, Duration::from_millis(50))
        .await
        .unwrap());
    let waiting = admission.check_admission(team_job(10)).await.unwrap();
    assert!(!waiting.is_admitted());

    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(admission.promote_all().await.unwrap(), 1);
    assert!(queue.get_job(waiting.job_id()).await.unwrap().is_some());
}

#[tokio::test]
async fn test_queued_job_keeps_slot_after_lease_runs_out() {
    let (queue, ledger, admission) = setup(1, Duration::from_millis(50));
    let key = LedgerKey::new("acme", JobPool::Scrape);

    let first = admission.check_admission(team_job(10)).await.unwrap();
    let second = admission.check_admission(team_job(10)).await.unwrap();
    assert!(first.is_admitted());
    assert!(!second.is_admitted());

    // Nobody claimed the first job, so nothing renewed its lease
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(admission.promote_all().await.unwrap(), 0);
    let report = admission.reconcile(Some("acme")).await.unwrap();
    assert_eq!(report.promoted, 0);

    let claimed = queue.get_job_to_process(Uuid::new_v4()).await.unwrap().unwrap();
    assert_eq!(claimed.id, first.job_id());
    assert!(queue.get_job_to_process(Uuid::new_v4()).await.unwrap().is_none());
    assert_eq!(ledger.backlog_job_ids(&key).await.unwrap(), vec![second.job_id()]);
}

#[tokio::test]
async fn test_reconcile_returns_excess_queued_jobs_to_backlog() {
    let (queue, ledger, admission) = setup(1, Duration::from_secs(600));
    let key = LedgerKey::new("acme", JobPool::Scrape);

    // Ledger state lost: two queued jobs hold no slot
    let urgent = queue.add_job(team_job(1)).await.unwrap();
    let later = queue.add_job(team_job(5)).await.unwrap();

    let report = admission.reconcile(Some("acme")).await.unwrap();
    assert_eq!(report.active_added, 1);
    assert_eq!(report.demoted, 1);
    assert_eq!(report.promoted, 0);

    assert_eq!(ledger.active_job_ids(&key).await.unwrap(), vec![urgent.id]);
    assert_eq!(ledger.backlog_job_ids(&key).await.unwrap(), vec![later.id]);
    let counts = queue.status_counts().await.unwrap();
    assert_eq!((counts.queued, counts.backlog), (1, 1));

    // The demoted job keeps its arrival time and comes back on release
    let job = queue.get_job_to_process(Uuid::new_v4()).await.unwrap().unwrap();
    queue.job_finish(job.id, job.lock_token.unwrap(), json!({})).await.unwrap();
    assert_eq!(admission.release("acme", JobPool::Scrape, job.id).await.unwrap(), vec![later.id]);
    let back = queue.get_job(later.id).await.unwrap().unwrap();
    assert_eq!(back.created_at, later.created_at);
}

#[tokio::test]
async fn test_reconcile_counts_running_jobs_even_past_limit() {
    let (queue, ledger, admission) = setup(1, Duration::from_secs(600));
    let key = LedgerKey::new("acme", JobPool::Scrape);

    queue.add_job(team_job(1)).await.unwrap();
    queue.add_job(team_job(2)).await.unwrap();
    queue.get_job_to_process(Uuid::new_v4()).await.unwrap().unwrap();
    queue.get_job_to_process(Uuid::new_v4()).await.unwrap().unwrap();

    let report = admission.reconcile(Some("acme")).await.unwrap();
    assert_eq!(report.active_added, 2);
    assert_eq!(report.demoted, 0);
    assert_eq!(ledger.active_count(&key).await.unwrap(), 2);

    // No new admissions until the running jobs drain below the limit
    assert!(!admission.check_admission(team_job(1)).await.unwrap().is_admitted());
}
