//! Integration tests for the Redis frontier store and concurrency ledger.
//! Need Docker: `cargo test --test redis_store_tests -- --ignored`

mod common;

use std::sync::Arc;
use std::time::Duration;

use crate::common::TestHarness;
use chrono::Utc;
use crawl_frontier::{CrawlState, CrawlStatus, Frontier, FrontierConfig};
use scheduler_core::domains::concurrency::{ConcurrencyLedger, LedgerKey};
use scheduler_core::kernel::jobs::JobPool;
use test_context::test_context;
use uuid::Uuid;

async fn frontier(ctx: &TestHarness) -> (Frontier, CrawlState) {
    let frontier = Frontier::new(Arc::new(ctx.frontier_store().await), FrontierConfig::default());
    let crawl = CrawlState::new(format!("team-{}", Uuid::new_v4()), "https://x.com");
    frontier.create_crawl(&crawl).await.unwrap();
    (frontier, crawl)
}

#[test_context(TestHarness)]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "needs Docker"]
async fn test_permutations_lock_once(ctx: &mut TestHarness) {
    let (frontier, crawl) = frontier(ctx).await;

    let handles: Vec<_> = ["https://x.com/a", "https://x.com/a/", "http://x.com/a"]
        .into_iter()
        .map(|url| {
            let frontier = frontier.clone();
            let crawl = crawl.clone();
            tokio::spawn(async move { frontier.lock_url(&crawl, url).await.unwrap() })
        })
        .collect();

    let winners = futures::future::join_all(handles)
        .await
        .into_iter()
        .filter(|r| r.as_ref().unwrap().is_locked())
        .count();
    assert_eq!(winners, 1);
    assert!(frontier.store().visited_count(crawl.id).await.unwrap() > 0);
}

#[test_context(TestHarness)]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "needs Docker"]
async fn test_finish_claimed_by_one_sibling(ctx: &mut TestHarness) {
    let (frontier, crawl) = frontier(ctx).await;

    let crawl_id = crawl.id;
    let jobs: Vec<Uuid> = (0..8).map(|_| Uuid::now_v7()).collect();
    frontier.add_crawl_jobs(crawl_id, &jobs).await.unwrap();
    frontier.mark_kickoff_finished(crawl_id).await.unwrap();

    let handles: Vec<_> = jobs
        .into_iter()
        .map(|job_id| {
            let frontier = frontier.clone();
            tokio::spawn(async move {
                frontier.add_crawl_job_done(crawl_id, job_id, true).await.unwrap();
                frontier.finish_crawl_if_needed(crawl_id).await.unwrap()
            })
        })
        .collect();

    let summaries: Vec<_> = futures::future::join_all(handles)
        .await
        .into_iter()
        .filter_map(|r| r.unwrap())
        .collect();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].status, CrawlStatus::Completed);
    assert_eq!(summaries[0].completed_job_ids.len(), 8);
}

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "needs Docker"]
async fn test_cancel_bumps_version(ctx: &mut TestHarness) {
    let (frontier, crawl) = frontier(ctx).await;
    frontier.cancel(crawl.id).await.unwrap();

    let stored = frontier.crawl(crawl.id).await.unwrap();
    assert!(stored.cancelled);
    assert!(stored.version > crawl.version);

    frontier.purge_crawl(crawl.id).await.unwrap();
    assert!(frontier.crawl(crawl.id).await.is_err());
}

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "needs Docker"]
async fn test_ledger_limit_and_backlog_order(ctx: &mut TestHarness) {
    let ledger = ctx.ledger().await;
    let key = LedgerKey::new(format!("team-{}", Uuid::new_v4()), JobPool::Scrape);
    let lease = Duration::from_secs(60);

    let running = Uuid::now_v7();
    assert!(ledger.try_acquire(&key, running, 1, lease).await.unwrap());
    assert!(!ledger.try_acquire(&key, Uuid::now_v7(), 1, lease).await.unwrap());
    // Re-acquiring a held slot is idempotent
    assert!(ledger.try_acquire(&key, running, 1, lease).await.unwrap());
    assert_eq!(ledger.active_count(&key).await.unwrap(), 1);

    let now = Utc::now();
    let (low, high) = (Uuid::now_v7(), Uuid::now_v7());
    assert!(ledger.push_backlog(&key, low, 10, now).await.unwrap());
    assert!(ledger.push_backlog(&key, high, 1, now).await.unwrap());
    assert!(!ledger.push_backlog(&key, high, 1, now).await.unwrap());

    // Full: nothing promoted
    assert_eq!(ledger.promote_next(&key, 1, lease).await.unwrap(), None);

    assert!(ledger.release(&key, running).await.unwrap());
    assert_eq!(ledger.promote_next(&key, 1, lease).await.unwrap(), Some(high));
    assert_eq!(ledger.backlog_job_ids(&key).await.unwrap(), vec![low]);
    assert!(ledger.teams(JobPool::Scrape).await.unwrap().contains(&key.team_id));
}

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "needs Docker"]
async fn test_ledger_lease_expiry_frees_slot(ctx: &mut TestHarness) {
    let ledger = ctx.ledger().await;
    let key = LedgerKey::new(format!("team-{}", Uuid::new_v4()), JobPool::Extract);

    assert!(ledger
        .try_acquire(&key, Uuid::now_v7(), 1, Duration::from_millis(100))
        .await
        .unwrap());
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(ledger
        .try_acquire(&key, Uuid::now_v7(), 1, Duration::from_secs(60))
        .await
        .unwrap());
}
