/// Concurrent correction tests
///
/// CAS linearizability, disjoint re-evaluations, same-key races, replays and
/// the starvation fallback.
/// Run with: cargo test --test concurrent_correction_tests

use bridge_lite::{
    ApplyStrategy, AuditEvent, ConcurrencyConfig, CorrectionId, CorrectionService, Diff,
    InMemoryIntentStore, Intent, IntentStore, MemoryAuditSink, PhilosophicalActor,
    ReevaluationRequest, RetryPolicy, ScriptedFaults, Severity,
};
use futures::future::join_all;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Barrier;
use tokio_test::{assert_err, assert_ok};

async fn seeded_store(config: ConcurrencyConfig) -> (Arc<InMemoryIntentStore>, Intent) {
    let store = Arc::new(InMemoryIntentStore::with_config(config));
    let intent = store
        .save(Intent::from_json("review", json!({"status": "received"})).unwrap())
        .await
        .unwrap();
    (store, intent)
}

fn service(
    store: Arc<InMemoryIntentStore>,
    audit: Arc<MemoryAuditSink>,
    config: ConcurrencyConfig,
) -> Arc<CorrectionService> {
    Arc::new(CorrectionService::new(store, audit, config).with_retry_policy(RetryPolicy::immediate(3)))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_cas_versions_match_successes() {
    let (store, intent) = seeded_store(ConcurrencyConfig::default()).await;
    let workers = 16;
    let barrier = Arc::new(Barrier::new(workers));

    let mut handles = vec![];
    for worker in 0..workers {
        let store = Arc::clone(&store);
        let barrier = Arc::clone(&barrier);
        let id = intent.id;
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            let current = store.get(&id).await.unwrap();
            let mut next = current.clone();
            next.payload.insert(format!("worker_{worker}"), json!(true));
            store.compare_and_swap(&id, next, current.version).await.unwrap()
        }));
    }

    let successes = join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .filter(|swapped| *swapped)
        .count();

    let stored = store.get(&intent.id).await.unwrap();
    assert!(successes >= 1);
    assert_eq!(stored.version, intent.version + successes as u64);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_three_disjoint_reevaluations_all_land() {
    let config = ConcurrencyConfig::default();
    let (store, intent) = seeded_store(config.clone()).await;
    let audit = Arc::new(MemoryAuditSink::new());
    let service = service(store.clone(), audit, config);
    let barrier = Arc::new(Barrier::new(3));

    let mut handles = vec![];
    for (field, value) in [("field_a", "A"), ("field_b", "B"), ("field_c", "C")] {
        let service = Arc::clone(&service);
        let barrier = Arc::clone(&barrier);
        let id = intent.id;
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            service
                .reevaluate(
                    ReevaluationRequest::new(id, Diff::new().set(field, value), PhilosophicalActor::Yuno)
                        .reason(format!("fix {field}")),
                )
                .await
        }));
    }
    for joined in join_all(handles).await {
        let outcome = assert_ok!(joined.unwrap());
        assert!(!outcome.already_applied);
    }

    let stored = store.get(&intent.id).await.unwrap();
    assert_eq!(stored.payload["field_a"], "A");
    assert_eq!(stored.payload["field_b"], "B");
    assert_eq!(stored.payload["field_c"], "C");
    assert_eq!(stored.payload["status"], "received");
    assert_eq!(stored.correction_history.len(), 3);
    assert_eq!(stored.version, intent.version + 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_same_key_last_commit_wins() {
    let config = ConcurrencyConfig::default();
    let (store, intent) = seeded_store(config.clone()).await;
    let service = service(store.clone(), Arc::new(MemoryAuditSink::new()), config);

    let handles: Vec<_> = (0..8)
        .map(|value| {
            let service = Arc::clone(&service);
            let id = intent.id;
            tokio::spawn(async move {
                service
                    .reevaluate(ReevaluationRequest::new(
                        id,
                        Diff::new().set("score", value),
                        PhilosophicalActor::Kana,
                    ))
                    .await
            })
        })
        .collect();
    for joined in join_all(handles).await {
        assert_ok!(joined.unwrap());
    }

    let stored = store.get(&intent.id).await.unwrap();
    assert_eq!(stored.version, intent.version + 8);
    assert_eq!(stored.correction_history.len(), 8);

    let last = stored.correction_history.last().unwrap();
    assert_eq!(stored.payload["score"], last.diff.apply(&Default::default()).unwrap()["score"]);
}

#[tokio::test]
async fn test_replayed_correction_changes_nothing() {
    let config = ConcurrencyConfig::default();
    let (store, intent) = seeded_store(config.clone()).await;
    let service = service(store.clone(), Arc::new(MemoryAuditSink::new()), config);

    let correction_id = CorrectionId::new();
    let request = ReevaluationRequest::new(
        intent.id,
        Diff::new().set("field_a", "A"),
        PhilosophicalActor::Yuno,
    )
    .correction_id(correction_id);

    let first = assert_ok!(service.reevaluate(request.clone()).await);
    let before = store.get(&intent.id).await.unwrap();

    let replay = assert_ok!(service.reevaluate(request).await);
    let after = store.get(&intent.id).await.unwrap();

    assert!(!first.already_applied);
    assert!(replay.already_applied);
    assert_eq!(replay.strategy, ApplyStrategy::Replay);
    assert_eq!(replay.correction_id, correction_id);
    assert_eq!(before.version, after.version);
    assert_eq!(before.correction_history, after.correction_history);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_replays_apply_once() {
    let config = ConcurrencyConfig::default();
    let (store, intent) = seeded_store(config.clone()).await;
    let service = service(store.clone(), Arc::new(MemoryAuditSink::new()), config);
    let request = ReevaluationRequest::new(
        intent.id,
        Diff::new().append("tags", "urgent"),
        PhilosophicalActor::Yuno,
    );

    let handles: Vec<_> = (0..6)
        .map(|_| {
            let service = Arc::clone(&service);
            let request = request.clone();
            tokio::spawn(async move { service.reevaluate(request).await })
        })
        .collect();
    let applied = join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .filter(|outcome| !outcome.already_applied)
        .count();

    let stored = store.get(&intent.id).await.unwrap();
    assert_eq!(applied, 1);
    assert_eq!(stored.version, intent.version + 1);
    assert_eq!(stored.payload["tags"], json!(["urgent"]));
}

#[tokio::test]
async fn test_sustained_contention_falls_back_with_one_warning() {
    let config = ConcurrencyConfig::default();
    let faults = Arc::new(ScriptedFaults::new().conflict_always());
    let store = Arc::new(InMemoryIntentStore::with_config(config.clone()).with_faults(faults.clone()));
    let intent = store
        .save(Intent::from_json("review", json!({})).unwrap())
        .await
        .unwrap();
    let audit = Arc::new(MemoryAuditSink::new());
    let service = service(store.clone(), audit.clone(), config.clone());

    let outcome = assert_ok!(
        service
            .reevaluate(ReevaluationRequest::new(
                intent.id,
                Diff::new().set("field_a", "A"),
                PhilosophicalActor::Yuno,
            ))
            .await
    );

    assert_eq!(outcome.strategy, ApplyStrategy::Pessimistic);
    assert_eq!(faults.cas_calls(), config.optimistic_attempts);
    assert_eq!(store.get(&intent.id).await.unwrap().payload["field_a"], "A");

    assert_eq!(audit.count_severity(Severity::Warning).await, 1);
    let warnings = audit.with_event(AuditEvent::StarvationFallback).await;
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].detail_flag("starvation_detected"));
    assert_eq!(warnings[0].details["fallback_strategy"], "pessimistic");
}

#[tokio::test]
async fn test_invalid_diffs_never_mutate() {
    let config = ConcurrencyConfig::default();
    let (store, intent) = seeded_store(config.clone()).await;
    let service = service(store.clone(), Arc::new(MemoryAuditSink::new()), config);

    for diff in [
        Diff::new(),
        Diff::new().set("", 1),
        Diff::new().set("a..b", 1),
        Diff::new().set("count", "*2"),
        Diff::new().set("call", "eval(1)"),
        Diff::new().set("nested", json!({"deep": ["__import__('os')"]})),
    ] {
        assert_err!(
            service
                .reevaluate(ReevaluationRequest::new(intent.id, diff, PhilosophicalActor::Yuno))
                .await
        );
    }
    assert_eq!(store.get(&intent.id).await.unwrap(), intent);
}
