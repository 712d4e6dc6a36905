/// Row lock tests
///
/// Serialized pipeline runs, lock timeouts, deadlock retry against injected
/// faults, ordered multi-id locking and cycle detection.
/// Run with: cargo test --test locking_tests

use async_trait::async_trait;
use bridge_lite::core::BridgeStage;
use bridge_lite::pipeline::{InputStage, OutputStage};
use bridge_lite::{
    BridgeError, ConcurrencyConfig, InMemoryIntentStore, Intent, IntentId, IntentStatus,
    IntentStore, LockOwner, MemoryAuditSink, PipelineOrchestrator, PipelineStage, RetryPolicy,
    ScriptedFaults, commit_all, lock_many_ordered,
};
use futures::future::join_all;
use rand::Rng;
use rand::seq::SliceRandom;
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Barrier;
use tokio_test::assert_ok;

/// Stage that sleeps and records when it entered and left.
struct SlowStage {
    delay: Duration,
    log: Arc<Mutex<Vec<(&'static str, usize)>>>,
}

#[async_trait]
impl PipelineStage for SlowStage {
    fn stage(&self) -> BridgeStage {
        BridgeStage::AiJudge
    }

    async fn run(&self, mut intent: Intent) -> bridge_lite::Result<Intent> {
        let run = intent.payload.get("runs").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
        self.log.lock().unwrap().push(("enter", run));
        tokio::time::sleep(self.delay).await;
        intent.payload.insert("runs".into(), json!(run + 1));
        self.log.lock().unwrap().push(("exit", run));
        Ok(intent)
    }
}

fn slow_orchestrator(
    store: Arc<InMemoryIntentStore>,
    delay: Duration,
    log: Arc<Mutex<Vec<(&'static str, usize)>>>,
    config: ConcurrencyConfig,
) -> PipelineOrchestrator {
    let stages: Vec<Arc<dyn PipelineStage>> = vec![
        Arc::new(InputStage),
        Arc::new(SlowStage { delay, log }),
        Arc::new(OutputStage),
    ];
    PipelineOrchestrator::with_stages(store, Arc::new(MemoryAuditSink::new()), stages, config)
        .with_retry_policy(RetryPolicy::immediate(3))
}

async fn seed(store: &InMemoryIntentStore) -> Intent {
    store
        .save(Intent::from_json("review", json!({})).unwrap())
        .await
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_overlapping_locked_runs_never_interleave() {
    let config = ConcurrencyConfig::default();
    let store = Arc::new(InMemoryIntentStore::with_config(config.clone()));
    let intent = seed(&store).await;
    let log = Arc::new(Mutex::new(Vec::new()));
    let delay = Duration::from_millis(60);
    let orchestrator = Arc::new(slow_orchestrator(store.clone(), delay, log.clone(), config));

    let runs = 3;
    let barrier = Arc::new(Barrier::new(runs));
    let started = Instant::now();
    let handles: Vec<_> = (0..runs)
        .map(|_| {
            let orchestrator = Arc::clone(&orchestrator);
            let barrier = Arc::clone(&barrier);
            let id = intent.id;
            tokio::spawn(async move {
                barrier.wait().await;
                orchestrator.execute_with_lock(&id, None).await
            })
        })
        .collect();
    for joined in join_all(handles).await {
        assert_ok!(joined.unwrap());
    }

    assert!(started.elapsed() >= delay * runs as u32);

    let log = log.lock().unwrap().clone();
    assert_eq!(log.len(), runs * 2);
    for (index, pair) in log.chunks(2).enumerate() {
        assert_eq!(pair[0], ("enter", index));
        assert_eq!(pair[1], ("exit", index));
    }

    let stored = store.get(&intent.id).await.unwrap();
    assert_eq!(stored.version, runs as u64);
    assert_eq!(stored.payload["runs"], runs);
    assert_eq!(stored.status, IntentStatus::Completed);
}

#[tokio::test]
async fn test_lock_timeout_leaves_state_unchanged() {
    let config = ConcurrencyConfig::default();
    let store = Arc::new(InMemoryIntentStore::with_config(config));
    let intent = seed(&store).await;

    let held = store
        .lock_for_update(&intent.id, Duration::from_millis(100))
        .await
        .unwrap();
    let result = store
        .lock_for_update(&intent.id, Duration::from_millis(50))
        .await;
    assert!(matches!(result, Err(BridgeError::LockTimeout { .. })));
    drop(held);

    assert_eq!(store.get(&intent.id).await.unwrap(), intent);
    assert_ok!(store.lock_for_update(&intent.id, Duration::from_millis(50)).await);
}

#[tokio::test]
async fn test_locked_run_timeout_is_not_retried() {
    let config = ConcurrencyConfig::new().lock_timeout_after(Duration::from_millis(40));
    let faults = Arc::new(ScriptedFaults::new());
    let store = Arc::new(InMemoryIntentStore::with_config(config.clone()).with_faults(faults.clone()));
    let intent = seed(&store).await;
    let orchestrator = slow_orchestrator(
        store.clone(),
        Duration::ZERO,
        Arc::new(Mutex::new(Vec::new())),
        config,
    );

    let _held = store
        .lock_for_update(&intent.id, Duration::from_millis(100))
        .await
        .unwrap();
    let result = orchestrator.execute_with_lock(&intent.id, None).await;
    assert!(matches!(result, Err(BridgeError::LockTimeout { .. })));
    assert_eq!(faults.lock_calls(), 2);
}

#[tokio::test]
async fn test_deadlock_k_times_then_success() {
    let k = 2;
    let config = ConcurrencyConfig::default();
    let faults = Arc::new(ScriptedFaults::new().deadlock_first(k));
    let store = Arc::new(InMemoryIntentStore::with_config(config.clone()).with_faults(faults.clone()));
    let intent = seed(&store).await;
    let log = Arc::new(Mutex::new(Vec::new()));
    let orchestrator = slow_orchestrator(store.clone(), Duration::ZERO, log.clone(), config);

    let done = assert_ok!(orchestrator.execute_with_lock(&intent.id, None).await);
    assert_eq!(done.version, 1);
    assert_eq!(faults.lock_calls(), k + 1);
    assert_eq!(log.lock().unwrap().len(), 2);
    assert_eq!(store.get(&intent.id).await.unwrap().version, 1);
}

#[tokio::test]
async fn test_always_deadlocking_backend_surfaces_error() {
    let config = ConcurrencyConfig::default();
    let faults = Arc::new(ScriptedFaults::new().deadlock_always());
    let store = Arc::new(InMemoryIntentStore::with_config(config.clone()).with_faults(faults.clone()));
    let intent = seed(&store).await;
    let orchestrator = slow_orchestrator(
        store.clone(),
        Duration::ZERO,
        Arc::new(Mutex::new(Vec::new())),
        config,
    );

    let result = orchestrator.execute_with_lock(&intent.id, None).await;
    assert!(matches!(result, Err(BridgeError::Deadlock { attempts: 4, .. })));
    assert_eq!(faults.lock_calls(), 4);
    assert_eq!(store.get(&intent.id).await.unwrap(), intent);
}

#[tokio::test]
async fn test_exhausted_seeded_run_stores_nothing() {
    let config = ConcurrencyConfig::default();
    let faults = Arc::new(ScriptedFaults::new().deadlock_always());
    let store = Arc::new(InMemoryIntentStore::with_config(config.clone()).with_faults(faults.clone()));
    let orchestrator = slow_orchestrator(
        store.clone(),
        Duration::ZERO,
        Arc::new(Mutex::new(Vec::new())),
        config,
    );
    let seed = Intent::from_json("review", json!({})).unwrap();
    let id = seed.id;

    let result = orchestrator.execute_with_lock(&id, Some(seed)).await;
    assert!(matches!(result, Err(BridgeError::Deadlock { attempts: 4, .. })));
    assert!(matches!(store.get(&id).await, Err(BridgeError::NotFound(_))));
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn test_seeded_run_timeout_is_not_retried_and_stores_nothing() {
    let config = ConcurrencyConfig::default();
    let faults = Arc::new(ScriptedFaults::new().timeout_first(1));
    let store = Arc::new(InMemoryIntentStore::with_config(config.clone()).with_faults(faults.clone()));
    let orchestrator = slow_orchestrator(
        store.clone(),
        Duration::ZERO,
        Arc::new(Mutex::new(Vec::new())),
        config,
    );
    let seed = Intent::from_json("review", json!({})).unwrap();
    let id = seed.id;

    let result = orchestrator.execute_with_lock(&id, Some(seed.clone())).await;
    assert!(matches!(result, Err(BridgeError::LockTimeout { .. })));
    assert_eq!(faults.lock_calls(), 1);
    assert!(matches!(store.get(&id).await, Err(BridgeError::NotFound(_))));

    let done = assert_ok!(orchestrator.execute_with_lock(&id, Some(seed)).await);
    assert_eq!(done.version, 1);
    assert_eq!(faults.lock_calls(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sorted_random_subsets_never_deadlock() {
    let config = ConcurrencyConfig::default().lock_timeout_after(Duration::from_secs(5));
    let store = Arc::new(InMemoryIntentStore::with_config(config));
    let mut ids = Vec::new();
    for _ in 0..6 {
        ids.push(seed(&store).await.id);
    }
    let ids = Arc::new(ids);

    for _trial in 0..5 {
        let workers = 8;
        let barrier = Arc::new(Barrier::new(workers));
        let handles: Vec<_> = (0..workers)
            .map(|_| {
                let store = Arc::clone(&store);
                let ids = Arc::clone(&ids);
                let barrier = Arc::clone(&barrier);
                tokio::spawn(async move {
                    let subset: Vec<IntentId> = {
                        let mut rng = rand::thread_rng();
                        let size = rng.gen_range(2..=ids.len());
                        let mut shuffled = ids.to_vec();
                        shuffled.shuffle(&mut rng);
                        shuffled.truncate(size);
                        shuffled
                    };
                    barrier.wait().await;
                    let sessions = lock_many_ordered(
                        store.as_ref(),
                        LockOwner::new(),
                        &subset,
                        Duration::from_secs(5),
                    )
                    .await?;
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    drop(sessions);
                    Ok::<usize, BridgeError>(subset.len())
                })
            })
            .collect();

        for joined in join_all(handles).await {
            assert_ok!(joined.unwrap());
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_crossed_lock_order_is_reported_as_deadlock() {
    let store = Arc::new(InMemoryIntentStore::with_config(ConcurrencyConfig::default()));
    let first = seed(&store).await.id;
    let second = seed(&store).await.id;
    let barrier = Arc::new(Barrier::new(2));
    let timeout = Duration::from_secs(3);

    let handles: Vec<_> = [(first, second), (second, first)]
        .into_iter()
        .map(|(a, b)| {
            let store = Arc::clone(&store);
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move {
                let owner = LockOwner::new();
                let _a = store.lock_for_update_as(owner, &a, timeout).await?;
                barrier.wait().await;
                let _b = store.lock_for_update_as(owner, &b, timeout).await?;
                Ok::<(), BridgeError>(())
            })
        })
        .collect();

    let started = Instant::now();
    let results: Vec<_> = join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    assert!(results.iter().any(|result| matches!(result, Err(BridgeError::Deadlock { .. }))));
    assert!(started.elapsed() < timeout);
}

#[tokio::test]
async fn test_lock_many_commits_each_id_once() {
    let store = Arc::new(InMemoryIntentStore::with_config(ConcurrencyConfig::default()));
    let a = seed(&store).await.id;
    let b = seed(&store).await.id;

    let mut sessions = lock_many_ordered(
        store.as_ref(),
        LockOwner::new(),
        &[b, a, b],
        Duration::from_millis(100),
    )
    .await
    .unwrap();
    assert_eq!(sessions.len(), 2);
    assert!(sessions[0].id() < sessions[1].id());

    for session in sessions.iter_mut() {
        let mut next = session.intent().clone();
        next.payload.insert("batched".into(), json!(true));
        session.replace(next);
    }
    let committed = commit_all(sessions).await.unwrap();
    assert!(committed.iter().all(|intent| intent.version == 1));
    assert_eq!(store.get(&a).await.unwrap().payload["batched"], true);
}
