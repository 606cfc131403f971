//! Integration tests against a real Redis instance.
//!
//! These tests mutate shared coordination keys, so run them
//! single-threaded:
//!
//! REDIS_URL=redis://127.0.0.1:6379 cargo test --test redis_integration -- --ignored --test-threads=1

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use uuid::Uuid;

use reliq::lock::{self, LeaseOptions};
use reliq::{
    Config, EmptyQueues, Fetch, NoPauses, NoThrottle, PauseStore, Resurrector, Supervisor,
    ThrottleOracle,
};

async fn manager() -> ConnectionManager {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();

    let url =
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    let client = redis::Client::open(url).expect("Invalid REDIS_URL");
    ConnectionManager::new(client)
        .await
        .expect("Redis must be running for integration tests")
}

/// Unique per-test suffix so runs never collide on queue keys.
fn nonce() -> String {
    Uuid::new_v4().simple().to_string()[..12].to_string()
}

fn test_config(identity: &str, queues: &[&str]) -> Config {
    Config::new(identity, queues.iter().map(|q| q.to_string()).collect())
        .with_fetch_timeout(Duration::from_millis(50))
        .with_empty_backoff(Duration::from_millis(200))
        .with_throttle_backoff(Duration::from_secs(30))
}

fn empty_index(conn: &ConnectionManager) -> Arc<EmptyQueues> {
    Arc::new(EmptyQueues::new(conn.clone(), Duration::from_secs(30)))
}

struct AlwaysThrottled;

#[async_trait]
impl ThrottleOracle for AlwaysThrottled {
    async fn is_throttled(&self, _payload: &str) -> bool {
        true
    }
}

struct PausedQueues(HashSet<String>);

#[async_trait]
impl PauseStore for PausedQueues {
    async fn paused_queues(&self) -> HashSet<String> {
        self.0.clone()
    }
}

struct CountingPauses {
    calls: AtomicU64,
}

#[async_trait]
impl PauseStore for CountingPauses {
    async fn paused_queues(&self) -> HashSet<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        HashSet::new()
    }
}

#[tokio::test]
#[ignore]
async fn test_fetch_acknowledge_roundtrip() {
    let conn = manager().await;
    let mut raw = conn.clone();
    let queue = format!("itest-{}", nonce());
    let identity = format!("itest-proc-{}", nonce());

    raw.lpush::<_, _, ()>(format!("queue:{queue}"), "job-A")
        .await
        .unwrap();

    let config = test_config(&identity, &[&queue]);
    let fetch = Fetch::new(
        conn.clone(),
        &config,
        empty_index(&conn),
        Arc::new(NoThrottle),
        Arc::new(NoPauses),
    )
    .unwrap();

    let unit = fetch
        .retrieve_work()
        .await
        .unwrap()
        .expect("Should fetch job-A");
    assert_eq!(unit.payload(), "job-A");
    assert_eq!(unit.queue_name(), queue);

    let inproc: Vec<String> = raw
        .lrange(format!("inproc:{identity}:{queue}"), 0, -1)
        .await
        .unwrap();
    assert_eq!(inproc, vec!["job-A"]);
    let pending: i64 = raw.llen(format!("queue:{queue}")).await.unwrap();
    assert_eq!(pending, 0);

    unit.acknowledge().await.unwrap();

    let inproc: i64 = raw
        .llen(format!("inproc:{identity}:{queue}"))
        .await
        .unwrap();
    assert_eq!(inproc, 0);
}

#[tokio::test]
#[ignore]
async fn test_requeue_goes_to_consumed_end() {
    let conn = manager().await;
    let mut raw = conn.clone();
    let queue = format!("itest-{}", nonce());
    let identity = format!("itest-proc-{}", nonce());

    raw.lpush::<_, _, ()>(format!("queue:{queue}"), "job-A")
        .await
        .unwrap();

    let config = test_config(&identity, &[&queue]);
    let fetch = Fetch::new(
        conn.clone(),
        &config,
        empty_index(&conn),
        Arc::new(NoThrottle),
        Arc::new(NoPauses),
    )
    .unwrap();

    let unit = fetch.retrieve_work().await.unwrap().expect("Should fetch");

    // Another producer enqueues while job-A is in flight.
    raw.lpush::<_, _, ()>(format!("queue:{queue}"), "job-B")
        .await
        .unwrap();

    unit.requeue().await.unwrap();

    // Normal requeue appends at the consumed end: job-A runs before job-B.
    let pending: Vec<String> = raw.lrange(format!("queue:{queue}"), 0, -1).await.unwrap();
    assert_eq!(pending, vec!["job-B", "job-A"]);
    let inproc: i64 = raw
        .llen(format!("inproc:{identity}:{queue}"))
        .await
        .unwrap();
    assert_eq!(inproc, 0);
}

#[tokio::test]
#[ignore]
async fn test_throttled_fetch_restores_and_backs_off() {
    let conn = manager().await;
    let mut raw = conn.clone();
    let queue = format!("itest-{}", nonce());
    let identity = format!("itest-proc-{}", nonce());

    raw.lpush::<_, _, ()>(format!("queue:{queue}"), "job-A")
        .await
        .unwrap();

    let config = test_config(&identity, &[&queue]);
    let fetch = Fetch::new(
        conn.clone(),
        &config,
        empty_index(&conn),
        Arc::new(AlwaysThrottled),
        Arc::new(NoPauses),
    )
    .unwrap();

    assert!(fetch.retrieve_work().await.unwrap().is_none());

    // Payload restored to pending, nothing left in flight.
    let pending: Vec<String> = raw.lrange(format!("queue:{queue}"), 0, -1).await.unwrap();
    assert_eq!(pending, vec!["job-A"]);
    let inproc: i64 = raw
        .llen(format!("inproc:{identity}:{queue}"))
        .await
        .unwrap();
    assert_eq!(inproc, 0);

    // Queue is backed off locally, so the next pass skips it entirely.
    assert!(fetch.retrieve_work().await.unwrap().is_none());
    let pending: i64 = raw.llen(format!("queue:{queue}")).await.unwrap();
    assert_eq!(pending, 1);
}

#[tokio::test]
#[ignore]
async fn test_paused_queue_is_not_polled() {
    let conn = manager().await;
    let mut raw = conn.clone();
    let queue = format!("itest-{}", nonce());
    let identity = format!("itest-proc-{}", nonce());

    raw.lpush::<_, _, ()>(format!("queue:{queue}"), "job-A")
        .await
        .unwrap();

    let config = test_config(&identity, &[&queue]);
    let paused: HashSet<String> = [queue.clone()].into_iter().collect();
    let fetch = Fetch::new(
        conn.clone(),
        &config,
        empty_index(&conn),
        Arc::new(NoThrottle),
        Arc::new(PausedQueues(paused)),
    )
    .unwrap();

    assert!(fetch.retrieve_work().await.unwrap().is_none());

    // The pending job stays untouched; nothing is claimed.
    let pending: i64 = raw.llen(format!("queue:{queue}")).await.unwrap();
    assert_eq!(pending, 1, "Paused queue must not be polled");
    let inproc: i64 = raw
        .llen(format!("inproc:{identity}:{queue}"))
        .await
        .unwrap();
    assert_eq!(inproc, 0);
}

#[tokio::test]
#[ignore]
async fn test_pause_lookup_skipped_when_no_candidates() {
    let conn = manager().await;
    let queue = format!("itest-{}", nonce());
    let identity = format!("itest-proc-{}", nonce());

    // Long back-off so the queue stays out of the candidate set after
    // the first pass observes it empty.
    let config =
        test_config(&identity, &[&queue]).with_empty_backoff(Duration::from_secs(30));
    let pauses = Arc::new(CountingPauses {
        calls: AtomicU64::new(0),
    });
    let store: Arc<dyn PauseStore> = pauses.clone();
    let fetch = Fetch::new(
        conn.clone(),
        &config,
        empty_index(&conn),
        Arc::new(NoThrottle),
        store,
    )
    .unwrap();

    assert!(fetch.retrieve_work().await.unwrap().is_none());
    assert_eq!(pauses.calls.load(Ordering::SeqCst), 1);

    assert!(fetch.retrieve_work().await.unwrap().is_none());
    assert_eq!(
        pauses.calls.load(Ordering::SeqCst),
        1,
        "No candidates left, so the pause store must not be consulted"
    );
}

#[tokio::test]
#[ignore]
async fn test_bulk_requeue_returns_units_to_pending() {
    let conn = manager().await;
    let mut raw = conn.clone();
    let queue = format!("itest-{}", nonce());
    let identity = format!("itest-proc-{}", nonce());

    for payload in ["job-A", "job-B"] {
        raw.lpush::<_, _, ()>(format!("queue:{queue}"), payload)
            .await
            .unwrap();
    }

    let config = test_config(&identity, &[&queue]);
    let fetch = Fetch::new(
        conn.clone(),
        &config,
        empty_index(&conn),
        Arc::new(NoThrottle),
        Arc::new(NoPauses),
    )
    .unwrap();

    let first = fetch.retrieve_work().await.unwrap().expect("First unit");
    let second = fetch.retrieve_work().await.unwrap().expect("Second unit");
    let inproc: i64 = raw
        .llen(format!("inproc:{identity}:{queue}"))
        .await
        .unwrap();
    assert_eq!(inproc, 2);

    Fetch::bulk_requeue(vec![first, second]).await.unwrap();

    let mut pending: Vec<String> =
        raw.lrange(format!("queue:{queue}"), 0, -1).await.unwrap();
    pending.sort_unstable();
    assert_eq!(pending, vec!["job-A", "job-B"]);
    let inproc: i64 = raw
        .llen(format!("inproc:{identity}:{queue}"))
        .await
        .unwrap();
    assert_eq!(inproc, 0);
}

#[tokio::test]
#[ignore]
async fn test_concurrent_fetch_no_duplicates_no_losses() {
    let conn = manager().await;
    let mut raw = conn.clone();
    let queue = format!("itest-{}", nonce());

    let payloads: Vec<String> = (0..50).map(|i| format!("job-{i}")).collect();
    for payload in &payloads {
        raw.lpush::<_, _, ()>(format!("queue:{queue}"), payload)
            .await
            .unwrap();
    }

    let mut handles = Vec::new();
    for worker in 0..4 {
        let conn = conn.clone();
        let queue = queue.clone();
        handles.push(tokio::spawn(async move {
            let identity = format!("itest-proc-{worker}-{}", nonce());
            let config = test_config(&identity, &[&queue]);
            let fetch = Fetch::new(
                conn.clone(),
                &config,
                Arc::new(EmptyQueues::new(conn, Duration::from_secs(30))),
                Arc::new(NoThrottle),
                Arc::new(NoPauses),
            )
            .unwrap();

            let mut claimed = Vec::new();
            while let Some(unit) = fetch.retrieve_work().await.unwrap() {
                claimed.push(unit.payload().to_string());
                unit.acknowledge().await.unwrap();
            }
            claimed
        }));
    }

    let mut union = Vec::new();
    for handle in handles {
        union.extend(handle.await.unwrap());
    }

    assert_eq!(union.len(), 50, "No payload may be lost or duplicated");
    let distinct: HashSet<&String> = union.iter().collect();
    assert_eq!(distinct.len(), 50);
    assert_eq!(distinct, payloads.iter().collect());
}

#[tokio::test]
#[ignore]
async fn test_lease_runs_at_most_once_per_interval() {
    let conn = manager().await;
    let suffix = nonce();
    let opts = LeaseOptions {
        lock_key: format!("itest:lease:{suffix}:lock"),
        last_run_key: format!("itest:lease:{suffix}:last_run"),
        ttl: Duration::from_secs(30),
        min_interval: Duration::from_secs(60),
    };

    let counter = Arc::new(AtomicU64::new(0));
    let mut outcomes = Vec::new();

    for _ in 0..10 {
        let counter = Arc::clone(&counter);
        let ran = lock::run_exclusively(&conn, &opts, || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap();
        outcomes.push(ran);
    }

    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert!(outcomes[0], "First call should win the lease and run");
    assert!(outcomes[1..].iter().all(|ran| !ran));
}

#[tokio::test]
#[ignore]
async fn test_empty_queues_refresh_tracks_pending_lists() {
    let conn = manager().await;
    let mut raw = conn.clone();
    let suffix = nonce();
    let busy = format!("itest-busy-{suffix}");
    let idle_a = format!("itest-idle-a-{suffix}");
    let idle_b = format!("itest-idle-b-{suffix}");

    // Fresh coordination state so the lease pre-check cannot skip us.
    raw.del::<_, ()>(vec![
        "reliq:empty_queues",
        "reliq:empty_queues:last_run",
        "reliq:empty_queues:lock",
    ])
    .await
    .unwrap();

    for queue in [&busy, &idle_a, &idle_b] {
        raw.sadd::<_, _, ()>("queues", queue).await.unwrap();
    }
    raw.lpush::<_, _, ()>(format!("queue:{busy}"), "job")
        .await
        .unwrap();

    let index = EmptyQueues::new(conn.clone(), Duration::from_secs(60));
    assert!(index.refresh().await.unwrap(), "Snapshot should change");

    let snapshot = index.queues();
    assert!(snapshot.contains(&idle_a));
    assert!(snapshot.contains(&idle_b));
    assert!(!snapshot.contains(&busy));

    let global: Vec<String> = raw.smembers("reliq:empty_queues").await.unwrap();
    assert!(global.contains(&idle_a));
    assert!(!global.contains(&busy));

    // Within the interval the lease is skipped and the snapshot is simply
    // re-read from the unchanged global set.
    assert!(!index.refresh().await.unwrap());

    for queue in [&busy, &idle_a, &idle_b] {
        raw.srem::<_, _, ()>("queues", queue).await.unwrap();
    }
}

#[tokio::test]
#[ignore]
async fn test_sweep_resurrects_dead_process_jobs() {
    let conn = manager().await;
    let mut raw = conn.clone();
    let suffix = nonce();
    let dead = format!("itest-dead-{suffix}");
    let queue_a = format!("itest-{suffix}-a");
    let queue_b = format!("itest-{suffix}-b");

    raw.del::<_, ()>(vec!["reliq:resurrector:lock", "reliq:resurrector:last_run"])
        .await
        .unwrap();

    // A dead process left three jobs in one queue and two in another.
    raw.hset::<_, _, _, ()>(
        "reliq:resurrector",
        &dead,
        serde_json::to_string(&[&queue_a, &queue_b]).unwrap(),
    )
    .await
    .unwrap();
    for i in 0..3 {
        raw.rpush::<_, _, ()>(format!("inproc:{dead}:{queue_a}"), format!("{{\"jid\":\"a{i}\"}}"))
            .await
            .unwrap();
    }
    for i in 0..2 {
        raw.rpush::<_, _, ()>(format!("inproc:{dead}:{queue_b}"), format!("{{\"jid\":\"b{i}\"}}"))
            .await
            .unwrap();
    }

    let resurrected = Arc::new(AtomicU64::new(0));
    let counted = Arc::clone(&resurrected);
    let identity = format!("itest-sweeper-{suffix}");
    let config = Config::new(&identity, vec![queue_a.clone()])
        .with_resurrection_counter(true)
        .with_on_resurrection(move |_queue, count| {
            counted.fetch_add(count, Ordering::SeqCst);
        });

    // Keep the sweeping process itself off the casualty list.
    raw.set_ex::<_, _, ()>(&identity, "1", 60).await.unwrap();
    let resurrector = Resurrector::new(conn.clone(), &config).unwrap();
    resurrector.heartbeat().await.unwrap();

    assert!(resurrector.sweep().await.unwrap(), "Sweep should run");

    let pending_a: Vec<String> = raw.lrange(format!("queue:{queue_a}"), 0, -1).await.unwrap();
    let pending_b: Vec<String> = raw.lrange(format!("queue:{queue_b}"), 0, -1).await.unwrap();
    assert_eq!(pending_a.len(), 3);
    assert_eq!(pending_b.len(), 2);
    assert_eq!(resurrected.load(Ordering::SeqCst), 5);

    let entry: Option<String> = raw.hget("reliq:resurrector", &dead).await.unwrap();
    assert!(entry.is_none(), "Registry entry must be purged");
    let leftover: i64 = raw
        .llen(format!("inproc:{dead}:{queue_a}"))
        .await
        .unwrap();
    assert_eq!(leftover, 0);

    assert_eq!(resurrector.resurrection_count("a0").await.unwrap(), 1);
    assert_eq!(resurrector.resurrection_count("missing").await.unwrap(), 0);

    raw.hdel::<_, _, ()>("reliq:resurrector", &identity)
        .await
        .unwrap();
}

#[tokio::test]
#[ignore]
async fn test_supervisor_start_stop() {
    let conn = manager().await;
    let suffix = nonce();
    let identity = format!("itest-sup-{suffix}");
    let config = Config::new(&identity, vec![format!("itest-{suffix}")])
        .with_heartbeat_interval(Duration::from_millis(100))
        .with_sweep_interval(Duration::from_secs(60))
        .with_empty_queues_refresh_interval(Duration::from_secs(60));

    let empty_queues = empty_index(&conn);
    let resurrector = Arc::new(Resurrector::new(conn.clone(), &config).unwrap());
    let mut supervisor = Supervisor::new(config, empty_queues, Arc::clone(&resurrector)).unwrap();

    supervisor.start().unwrap();
    assert!(supervisor.is_running());
    assert!(matches!(
        supervisor.start(),
        Err(reliq::SupervisorError::AlreadyRunning)
    ));

    // Heartbeat fires immediately, so the registry entry appears quickly.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let mut raw = conn.clone();
    let entry: Option<String> = raw.hget("reliq:resurrector", &identity).await.unwrap();
    assert!(entry.is_some(), "Heartbeat should register the process");

    supervisor.stop().await.unwrap();
    assert!(!supervisor.is_running());

    raw.hdel::<_, _, ()>("reliq:resurrector", &identity)
        .await
        .unwrap();
}
