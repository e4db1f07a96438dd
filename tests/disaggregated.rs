use ember_infer::ember_interfaces::{pattern_vector, GreedySampler, ScriptedExecutor};
use ember_infer::ember_types::*;
use ember_infer::{init_test_logging, DisaggregatedEngine, EmberConfig, RequestOutcome};
use std::sync::Arc;

fn side(mode: RunMode, capacity: usize, cards: usize) -> EmberConfig {
    let mut config = EmberConfig::default();
    config.router.run_mode = mode;
    config.router.max_total_token_num = capacity;
    config.router.batch_max_tokens = capacity;
    config.router.chunked_prefill_size = capacity.min(64);
    config.router.max_req_total_len = capacity;
    config.router.disable_log_stats = true;
    config.kv_cache.head_num = 2;
    config.kv_cache.head_dim = 8;
    config.kv_cache.cache_reserved_ratio = 0.0;
    config.parallel.cards_per_shard = cards;
    config.transfer.worker_count = 4;
    config
}

fn request(id: u64, prompt_len: u32, max_new: usize) -> InferenceRequest {
    InferenceRequest::new(
        RequestId::new(id),
        (10..10 + prompt_len).map(TokenId::new).collect(),
        SamplingParams::greedy(max_new),
    )
}

fn engine(prefill: &EmberConfig, decode: &EmberConfig) -> DisaggregatedEngine {
    init_test_logging();
    let executor = Arc::new(ScriptedExecutor::new(32).with_default_token(TokenId::new(5)));
    DisaggregatedEngine::new(prefill, decode, executor, Arc::new(GreedySampler)).unwrap()
}

#[tokio::test]
async fn prompt_cache_lands_on_every_decode_card() {
    let prefill = side(RunMode::Prefill, 100, 1);
    let decode = side(RunMode::Decode, 100, 2);
    let mut engine = engine(&prefill, &decode);
    let req = request(1, 12, 6);
    engine.submit(req.clone()).unwrap();

    let summary = engine.step().await.unwrap();
    assert_eq!(summary.handed_off, 1);
    assert_eq!(summary.transferred_tokens, 12);
    assert_eq!(summary.decode.tokens, 1);

    let scheduled = engine.decode().scheduler().request(req.id).unwrap();
    let handles = engine
        .decode()
        .scheduler()
        .shard_handles(scheduled.shard.unwrap())
        .unwrap();
    assert_eq!(handles.len(), 2);
    let bytes = handles.get(0).unwrap().storage().shape().vector_bytes();
    for handle in handles.iter() {
        for (pos, &slot) in scheduled.slots[..12].iter().enumerate() {
            assert_eq!(
                handle.storage().read_slot(slot).unwrap(),
                pattern_vector(req.id, pos, bytes)
            );
        }
    }

    engine.run_until_idle(20).await.unwrap();
    match engine.outcome(req.id).unwrap() {
        RequestOutcome::Completed { tokens, status, .. } => {
            assert_eq!(tokens, &vec![TokenId::new(5); 6]);
            assert_eq!(*status, FinishStatus::FinishedByLength);
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(
        engine.prefill().scheduler().shard(0).unwrap().free_slots(),
        100
    );
    assert_eq!(engine.decode().stats().used_slots(), 0);
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn hand_off_waits_for_decode_room() {
    let prefill = side(RunMode::Prefill, 100, 1);
    let decode = side(RunMode::Decode, 20, 1);
    let mut engine = engine(&prefill, &decode);
    let first = request(1, 12, 8);
    let second = request(2, 12, 8);
    engine.submit(first.clone()).unwrap();
    engine.submit(second.clone()).unwrap();

    let summary = engine.step().await.unwrap();
    assert_eq!(summary.handed_off, 1);
    assert!(engine.decode().scheduler().request(second.id).is_none());

    engine.run_until_idle(50).await.unwrap();
    for id in [first.id, second.id] {
        let outcome = engine.outcome(id).unwrap();
        assert_eq!(outcome.status(), FinishStatus::FinishedByLength);
        assert_eq!(outcome.tokens().len(), 8);
    }
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn abort_while_parked_for_export_frees_prefill_slots() {
    let prefill = side(RunMode::Prefill, 100, 1);
    let decode = side(RunMode::Decode, 20, 1);
    let mut engine = engine(&prefill, &decode);
    let first = request(1, 12, 8);
    let second = request(2, 12, 8);
    engine.submit(first.clone()).unwrap();
    engine.submit(second.clone()).unwrap();
    engine.step().await.unwrap();

    assert!(engine.abort(second.id).await);
    engine.run_until_idle(50).await.unwrap();

    assert_eq!(
        engine.outcome(second.id).unwrap().status(),
        FinishStatus::Aborted
    );
    assert_eq!(
        engine.outcome(first.id).unwrap().status(),
        FinishStatus::FinishedByLength
    );
    assert_eq!(
        engine.prefill().scheduler().shard(0).unwrap().free_slots(),
        100
    );
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn prompt_too_large_for_decode_instance_fails() {
    let prefill = side(RunMode::Prefill, 100, 1);
    let decode = side(RunMode::Decode, 10, 1);
    let mut engine = engine(&prefill, &decode);
    let req = request(1, 12, 4);
    engine.submit(req.clone()).unwrap();

    engine.run_until_idle(10).await.unwrap();

    match engine.outcome(req.id).unwrap() {
        RequestOutcome::Failed { reason } => assert!(reason.contains("max_req_total_len")),
        other => panic!("unexpected outcome {:?}", other),
    }
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn taking_an_outcome_clears_both_instances() {
    let prefill = side(RunMode::Prefill, 100, 1);
    let decode = side(RunMode::Decode, 10, 1);
    let mut engine = engine(&prefill, &decode);
    let served = request(1, 4, 3);
    let rejected = request(2, 12, 4);
    engine.submit(served.clone()).unwrap();
    engine.submit(rejected.clone()).unwrap();

    engine.run_until_idle(20).await.unwrap();
    assert!(engine.prefill().outcome(rejected.id).is_some());

    assert!(matches!(
        engine.take_outcome(rejected.id),
        Some(RequestOutcome::Failed { .. })
    ));
    assert!(engine.prefill().outcome(rejected.id).is_none());
    assert!(engine.outcome(rejected.id).is_none());

    let outcome = engine.take_outcome(served.id).unwrap();
    assert_eq!(outcome.status(), FinishStatus::FinishedByLength);
    assert_eq!(outcome.tokens().len(), 3);
    assert!(engine.decode().outcome(served.id).is_none());
    assert!(engine.take_outcome(served.id).is_none());
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn mismatched_roles_rejected() {
    let normal = side(RunMode::Normal, 100, 1);
    let decode = side(RunMode::Decode, 100, 1);
    let executor = Arc::new(ScriptedExecutor::new(32));
    let result = DisaggregatedEngine::new(&normal, &decode, executor, Arc::new(GreedySampler));
    assert!(matches!(result, Err(EmberError::Config { .. })));

    let prefill = side(RunMode::Prefill, 100, 1);
    let mut other_layout = side(RunMode::Decode, 100, 1);
    other_layout.kv_cache.head_dim = 16;
    let executor = Arc::new(ScriptedExecutor::new(32));
    let result =
        DisaggregatedEngine::new(&prefill, &other_layout, executor, Arc::new(GreedySampler));
    assert!(matches!(result, Err(EmberError::Config { .. })));
}
