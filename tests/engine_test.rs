//! Integration tests for the job lifecycle engine.

use std::collections::HashSet;
use std::time::Duration;

use jobq::engine::{Engine, JobQueue};
use jobq::error::Error;
use jobq::model::JobState;
use jobq::store::MemoryStore;

const SHORT: Option<Duration> = Some(Duration::from_millis(50));

async fn test_feed(name: &str) -> (Engine<MemoryStore>, JobQueue<MemoryStore>) {
    let engine = Engine::in_memory();
    let jobs = engine.create_job(name).await.expect("failed to create feed");
    (engine, jobs)
}

// ---------------------------------------------------------------------------
// Basic lifecycle: put → get → finish
// ---------------------------------------------------------------------------

#[tokio::test]
async fn basic_job_put_get_finish() {
    let (_engine, jobs) = test_feed("testjob").await;
    assert!(jobs.get_ids().await.unwrap().is_empty());

    let id = jobs.put("9.0", false).await.unwrap();

    let claimed = jobs.get(Some(Duration::from_secs(3))).await.unwrap();
    assert_eq!(claimed.id, id);
    assert_eq!(claimed.content, b"9.0");
    assert_eq!(claimed.failure_count, 0);
    assert_eq!(jobs.get_failure_count(id).await.unwrap(), 0);

    jobs.finish(claimed.id, None).await.unwrap();
    assert!(jobs.get_ids().await.unwrap().is_empty());
}

#[tokio::test]
async fn put_is_visible_in_get_ids_until_finished() {
    let (_engine, jobs) = test_feed("testjob").await;
    let id = jobs.put("payload", false).await.unwrap();
    assert_eq!(jobs.get_ids().await.unwrap(), vec![id]);
    assert_eq!(jobs.state(id).await.unwrap(), Some(JobState::Queued));

    jobs.get(SHORT).await.unwrap();
    assert_eq!(jobs.get_ids().await.unwrap(), vec![id]);
    assert_eq!(jobs.state(id).await.unwrap(), Some(JobState::Claimed));

    jobs.finish(id, Some(b"done".to_vec())).await.unwrap();
    assert!(!jobs.get_ids().await.unwrap().contains(&id));
    assert_eq!(jobs.state(id).await.unwrap(), None);
}

#[tokio::test]
async fn finish_records_result_and_counts() {
    let (_engine, jobs) = test_feed("testjob").await;
    let with_result = jobs.put("a", false).await.unwrap();
    let empty_result = jobs.put("b", false).await.unwrap();
    let no_result = jobs.put("c", false).await.unwrap();

    for _ in 0..3 {
        jobs.get(SHORT).await.unwrap();
    }
    jobs.finish(with_result, Some(b"myresult".to_vec())).await.unwrap();
    jobs.finish(empty_result, Some(Vec::new())).await.unwrap();
    jobs.finish(no_result, None).await.unwrap();

    assert_eq!(
        jobs.get_result(with_result).await.unwrap(),
        Some(b"myresult".to_vec())
    );
    assert_eq!(jobs.get_result(empty_result).await.unwrap(), Some(Vec::new()));
    assert_eq!(jobs.get_result(no_result).await.unwrap(), None);

    let stats = jobs.stats().await.unwrap();
    assert_eq!(stats.published, 3);
    assert_eq!(stats.finished, 3);
    assert_eq!(stats.queued + stats.claimed + stats.stalled, 0);
}

#[tokio::test]
async fn finish_twice_fails() {
    let (_engine, jobs) = test_feed("testjob").await;
    let id = jobs.put("x", false).await.unwrap();
    jobs.get(SHORT).await.unwrap();
    jobs.finish(id, None).await.unwrap();

    let err = jobs.finish(id, None).await.unwrap_err();
    assert!(matches!(err, Error::JobNotClaimed(e) if e == id));
}

#[tokio::test]
async fn finish_unclaimed_job_fails() {
    let (_engine, jobs) = test_feed("testjob").await;
    let id = jobs.put("x", false).await.unwrap();
    assert!(matches!(
        jobs.finish(id, None).await,
        Err(Error::JobNotClaimed(_))
    ));
}

// ---------------------------------------------------------------------------
// Empty queue
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn get_on_empty_feed_times_out() {
    let (_engine, jobs) = test_feed("testjob").await;
    assert!(jobs.get_ids().await.unwrap().is_empty());
    let err = jobs.get(Some(Duration::from_secs(1))).await.unwrap_err();
    assert!(matches!(err, Error::Empty));
    assert!(err.is_recoverable());
}

#[tokio::test]
async fn zero_timeout_polls_once() {
    let (_engine, jobs) = test_feed("testjob").await;
    assert!(matches!(
        jobs.get(Some(Duration::ZERO)).await,
        Err(Error::Empty)
    ));
    let id = jobs.put("x", false).await.unwrap();
    assert_eq!(jobs.get(Some(Duration::ZERO)).await.unwrap().id, id);
}

#[tokio::test]
async fn indefinite_get_waits_for_publish() {
    let (_engine, jobs) = test_feed("testjob").await;
    let worker = {
        let jobs = jobs.clone();
        tokio::spawn(async move { jobs.get(None).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let id = jobs.put("late", false).await.unwrap();
    let claimed = tokio::time::timeout(Duration::from_secs(5), worker)
        .await
        .expect("worker never woke")
        .unwrap()
        .unwrap();
    assert_eq!(claimed.id, id);
}

// ---------------------------------------------------------------------------
// Cancel
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancel_job_increments_failure_count() {
    let (_engine, jobs) = test_feed("testjob").await;
    jobs.put("9.0", false).await.unwrap();

    let first = jobs.get(None).await.unwrap();
    assert_eq!(first.content, b"9.0");
    assert_eq!(jobs.get_failure_count(first.id).await.unwrap(), 0);

    jobs.cancel(first.id).await.unwrap();
    let second = jobs.get(None).await.unwrap();
    assert_eq!(second.id, first.id);
    assert_eq!(second.content, b"9.0");
    assert_eq!(second.failure_count, 1);
    assert_eq!(jobs.get_failure_count(first.id).await.unwrap(), 1);

    jobs.cancel(first.id).await.unwrap();
    let third = jobs.get(None).await.unwrap();
    assert_eq!(third.id, first.id);
    assert_eq!(third.content, b"9.0");
    assert_eq!(jobs.get_failure_count(first.id).await.unwrap(), 2);

    jobs.retract(first.id).await.unwrap();
    assert!(jobs.get_ids().await.unwrap().is_empty());
}

#[tokio::test]
async fn worker_finds_retracted_job_unclaimed() {
    let (_engine, jobs) = test_feed("testjob").await;
    let id = jobs.put("x", false).await.unwrap();
    jobs.get(SHORT).await.unwrap();

    jobs.retract(id).await.unwrap();
    assert_eq!(jobs.state(id).await.unwrap(), None);
    assert_eq!(jobs.stats().await.unwrap().claimed, 0);
    assert!(matches!(jobs.finish(id, None).await, Err(Error::JobNotClaimed(_))));
    assert!(matches!(jobs.cancel(id).await, Err(Error::JobNotClaimed(_))));
    assert!(matches!(
        jobs.retract(id).await,
        Err(Error::ItemDoesNotExist(_))
    ));
}

#[tokio::test]
async fn cancel_requires_claim() {
    let (_engine, jobs) = test_feed("testjob").await;
    let id = jobs.put("x", false).await.unwrap();

    assert!(matches!(jobs.cancel(id).await, Err(Error::JobNotClaimed(_))));
    assert_eq!(jobs.get_failure_count(id).await.unwrap(), 0);

    jobs.get(SHORT).await.unwrap();
    jobs.cancel(id).await.unwrap();
    // Back in the queue, so a second cancel is rejected and not counted.
    assert!(matches!(jobs.cancel(id).await, Err(Error::JobNotClaimed(_))));
    assert_eq!(jobs.get_failure_count(id).await.unwrap(), 1);
}

#[tokio::test]
async fn cancelled_job_goes_to_tail() {
    let (_engine, jobs) = test_feed("testjob").await;
    let a = jobs.put("a", false).await.unwrap();
    let b = jobs.put("b", false).await.unwrap();

    assert_eq!(jobs.get(SHORT).await.unwrap().id, a);
    jobs.cancel(a).await.unwrap();
    assert_eq!(jobs.get_ids().await.unwrap(), vec![b, a]);
    assert_eq!(jobs.get(SHORT).await.unwrap().id, b);
    assert_eq!(jobs.get(SHORT).await.unwrap().id, a);
}

// ---------------------------------------------------------------------------
// Stall / retry
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stall_job() {
    let (_engine, jobs) = test_feed("testjob").await;
    assert!(jobs.get_ids().await.unwrap().is_empty());

    let id = jobs.put("9.0", false).await.unwrap();
    assert_eq!(jobs.get_ids().await.unwrap(), vec![id]);

    // invalid stall
    assert!(matches!(jobs.stall(id).await, Err(Error::JobNotClaimed(_))));

    let claimed = jobs.get(Some(Duration::from_secs(3))).await.unwrap();
    assert_eq!(claimed.id, id);
    assert_eq!(claimed.content, b"9.0");
    assert_eq!(jobs.get_failure_count(id).await.unwrap(), 0);

    // invalid retry
    assert!(matches!(jobs.retry(id).await, Err(Error::JobNotStalled(_))));

    jobs.stall(id).await.unwrap();
    assert_eq!(jobs.get_ids().await.unwrap(), vec![id]);
    assert_eq!(jobs.state(id).await.unwrap(), Some(JobState::Stalled));
    assert!(matches!(
        jobs.get(Some(Duration::from_secs(1))).await,
        Err(Error::Empty)
    ));

    jobs.retry(id).await.unwrap();
    assert_eq!(jobs.get_ids().await.unwrap(), vec![id]);

    let claimed = jobs.get(Some(Duration::from_secs(3))).await.unwrap();
    assert_eq!(claimed.id, id);
    assert_eq!(claimed.content, b"9.0");
    assert_eq!(jobs.get_failure_count(id).await.unwrap(), 0);

    jobs.finish(id, None).await.unwrap();
    assert!(jobs.get_ids().await.unwrap().is_empty());
}

#[tokio::test]
async fn stalled_job_can_be_retracted_but_not_finished() {
    let (_engine, jobs) = test_feed("testjob").await;
    let id = jobs.put("x", false).await.unwrap();
    jobs.get(SHORT).await.unwrap();
    jobs.stall(id).await.unwrap();

    assert!(matches!(jobs.finish(id, None).await, Err(Error::JobNotClaimed(_))));
    assert!(matches!(jobs.cancel(id).await, Err(Error::JobNotClaimed(_))));
    jobs.retract(id).await.unwrap();
    assert!(matches!(jobs.retry(id).await, Err(Error::JobNotStalled(_))));
    assert_eq!(jobs.stats().await.unwrap().stalled, 0);
}

// ---------------------------------------------------------------------------
// Retract
// ---------------------------------------------------------------------------

#[tokio::test]
async fn retract_job() {
    let (_engine, jobs) = test_feed("testjob").await;
    assert!(jobs.get_ids().await.unwrap().is_empty());

    let id = jobs.put("9.0", false).await.unwrap();
    assert_eq!(jobs.get_ids().await.unwrap(), vec![id]);

    jobs.retract(id).await.unwrap();
    assert!(jobs.get_ids().await.unwrap().is_empty());

    let err = jobs.retract(id).await.unwrap_err();
    assert!(matches!(err, Error::ItemDoesNotExist(e) if e == id));
    assert!(matches!(jobs.get(SHORT).await, Err(Error::Empty)));
}

// ---------------------------------------------------------------------------
// Ordering
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dispatch_is_fifo_with_priority_at_head() {
    let (_engine, jobs) = test_feed("testjob").await;
    let a = jobs.put("a", false).await.unwrap();
    let b = jobs.put("b", false).await.unwrap();
    let p1 = jobs.put("p1", true).await.unwrap();
    let c = jobs.put("c", false).await.unwrap();
    let p2 = jobs.put("p2", true).await.unwrap();

    let mut order = Vec::new();
    while let Ok(job) = jobs.get(Some(Duration::ZERO)).await {
        order.push(job.id);
    }
    assert_eq!(order, vec![p2, p1, a, b, c]);
}

// ---------------------------------------------------------------------------
// Feeds
// ---------------------------------------------------------------------------

#[tokio::test]
async fn feeds_are_independent() {
    let engine = Engine::in_memory();
    let left = engine.create_job("left").await.unwrap();
    let right = engine.create_job("right").await.unwrap();

    let id = left.put("only-left", false).await.unwrap();
    assert!(right.get_ids().await.unwrap().is_empty());
    assert!(matches!(right.get(Some(Duration::ZERO)).await, Err(Error::Empty)));
    assert_eq!(left.get(Some(Duration::ZERO)).await.unwrap().id, id);
}

#[tokio::test]
async fn job_requires_existing_feed() {
    let engine = Engine::in_memory();
    assert!(!engine.feed_exists("missing").await.unwrap());
    assert!(matches!(
        engine.job("missing").await,
        Err(Error::FeedDoesNotExist(name)) if name == "missing"
    ));

    assert!(engine.create_feed("missing").await.unwrap());
    assert!(!engine.create_feed("missing").await.unwrap());
    assert!(engine.job("missing").await.is_ok());
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exactly_one_worker_claims_a_single_job() {
    let (_engine, jobs) = test_feed("testjob").await;
    let id = jobs.put("contested", false).await.unwrap();

    let mut workers = Vec::new();
    for _ in 0..16 {
        let jobs = jobs.clone();
        workers.push(tokio::spawn(async move {
            jobs.get(Some(Duration::from_millis(200))).await
        }));
    }

    let mut winners = Vec::new();
    let mut empty = 0;
    for worker in workers {
        match worker.await.unwrap() {
            Ok(job) => winners.push(job.id),
            Err(Error::Empty) => empty += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(winners, vec![id]);
    assert_eq!(empty, 15);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_workers_never_share_a_job() {
    let (_engine, jobs) = test_feed("testjob").await;
    let mut published = HashSet::new();
    for n in 0..200 {
        published.insert(jobs.put(format!("job-{n}"), n % 7 == 0).await.unwrap());
    }

    let mut workers = Vec::new();
    for _ in 0..8 {
        let jobs = jobs.clone();
        workers.push(tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Ok(job) = jobs.get(Some(Duration::from_millis(50))).await {
                jobs.finish(job.id, None).await.unwrap();
                seen.push(job.id);
            }
            seen
        }));
    }

    let mut claimed = HashSet::new();
    for worker in workers {
        for id in worker.await.unwrap() {
            assert!(claimed.insert(id), "job {id} claimed twice");
        }
    }
    assert_eq!(claimed, published);
    assert_eq!(jobs.stats().await.unwrap().finished, 200);
}
