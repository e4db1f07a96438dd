use ember_backend::Backend;
use ember_interfaces::*;
use ember_scheduler::*;
use ember_types::*;
use std::sync::Arc;

const EOS: TokenId = TokenId::new(2);

struct Harness {
    scheduler: Scheduler,
    backends: Vec<Backend>,
    executor: Arc<ScriptedExecutor>,
}

impl Harness {
    fn new(router: RouterConfig, kv: KvCacheConfig, dp: usize) -> Self {
        let records = Arc::new(SharedRecordTable::new());
        let parallel = ParallelConfig {
            dp,
            cards_per_shard: 1,
        };
        let scheduler = Scheduler::new(&router, &kv, &parallel, records.clone()).unwrap();
        let executor = Arc::new(ScriptedExecutor::new(32).with_default_token(TokenId::new(5)));
        let backends = (0..dp)
            .map(|i| {
                Backend::new(
                    i,
                    scheduler.shard_handles(i).unwrap(),
                    executor.clone(),
                    Arc::new(GreedySampler),
                    records.clone(),
                    &router,
                    i as u64,
                )
            })
            .collect();
        Self {
            scheduler,
            backends,
            executor,
        }
    }

    async fn cycle(&mut self) -> SchedulePlan {
        let plan = self.scheduler.schedule();
        for batch in &plan.batches {
            let report = self.backends[batch.shard].step(batch).await.unwrap();
            self.scheduler.complete_step(&report);
        }
        self.scheduler.verify_slot_ownership().unwrap();
        plan
    }

    fn free(&self, shard: ShardIndex) -> usize {
        self.scheduler.shard(shard).unwrap().free_slots()
    }

    fn state(&self, id: RequestId) -> Option<RequestState> {
        self.scheduler.request(id).map(|r| r.state)
    }
}

fn router(capacity: usize) -> RouterConfig {
    RouterConfig {
        max_total_token_num: capacity,
        eos_ids: vec![EOS],
        ..Default::default()
    }
}

fn kv() -> KvCacheConfig {
    KvCacheConfig {
        head_num: 1,
        head_dim: 4,
        cache_reserved_ratio: 0.0,
        ..Default::default()
    }
}

fn request(id: u64, prompt_len: u32, max_new: usize) -> InferenceRequest {
    InferenceRequest::new(
        RequestId::new(id),
        (10..10 + prompt_len).map(TokenId::new).collect(),
        SamplingParams::greedy(max_new),
    )
}

#[tokio::test]
async fn admitted_prompt_fills_cache() {
    let mut h = Harness::new(router(100), kv(), 1);
    let req = request(1, 50, 16);
    let record = h.scheduler.submit(req.clone()).unwrap();

    let plan = h.cycle().await;
    assert_eq!(plan.total_tokens(), 50);
    assert_eq!(record.cur_kv_len(), 50);
    assert_eq!(record.cur_output_len(), 1);
    assert_eq!(h.free(0), 50);
    assert_eq!(h.state(req.id), Some(RequestState::Running));
}

#[tokio::test]
async fn second_request_waits_for_projected_footprint() {
    let mut h = Harness::new(router(100), kv(), 1);
    let first = request(1, 50, 11);
    let second = request(2, 50, 11);
    h.scheduler.submit(first.clone()).unwrap();
    h.scheduler.submit(second.clone()).unwrap();

    let plan = h.cycle().await;
    assert_eq!(plan.batches[0].admitted.len(), 1);
    let (id, err) = &plan.deferred[0];
    assert_eq!(*id, second.id);
    assert_eq!(err, &EmberError::out_of_memory(60, 40, 100));
    assert_eq!(h.state(second.id), Some(RequestState::Queued));

    // Ten decode cycles bring the first request to its length limit.
    for _ in 0..10 {
        let plan = h.cycle().await;
        assert!(plan.batches[0].admitted.is_empty());
        assert_eq!(h.state(second.id), Some(RequestState::Queued));
    }
    assert_eq!(h.free(0), 40);

    let plan = h.cycle().await;
    let batch = &plan.batches[0];
    assert_eq!(batch.retired, vec![first.id]);
    assert_eq!(batch.admitted[0].request.id, second.id);

    let resolved = h.scheduler.take_resolutions();
    assert_eq!(resolved.len(), 1);
    assert_eq!(resolved[0].request_id, first.id);
    assert_eq!(resolved[0].status, FinishStatus::FinishedByLength);
    assert_eq!(resolved[0].snapshot.cur_output_len, 11);
    assert_eq!(resolved[0].snapshot.finish_token_index, 10);
}

#[tokio::test]
async fn finished_request_released_on_next_cycle() {
    let mut h = Harness::new(router(100), kv(), 1);
    let req = request(1, 4, 10);
    h.executor
        .script(req.id, [TokenId::new(7), TokenId::new(8), EOS]);
    let record = h.scheduler.submit(req.clone()).unwrap();

    for _ in 0..3 {
        h.cycle().await;
    }
    let snap = record.snapshot();
    assert_eq!(snap.finish_status, FinishStatus::FinishedByEos);
    assert_eq!(snap.finish_token_index, 2);
    assert_eq!(h.free(0), 94);

    let plan = h.cycle().await;
    assert_eq!(plan.total_tokens(), 0);
    assert_eq!(plan.batches[0].retired, vec![req.id]);
    assert_eq!(h.free(0), 100);
    assert!(h.scheduler.records().get(req.id).is_none());
    assert!(h.scheduler.is_idle());
}

#[tokio::test]
async fn abort_while_waiting() {
    let mut h = Harness::new(router(100), kv(), 1);
    h.scheduler.submit(request(1, 50, 11)).unwrap();
    let waiting = request(2, 50, 11);
    let record = h.scheduler.submit(waiting.clone()).unwrap();
    h.cycle().await;

    assert!(h.scheduler.abort(waiting.id));
    h.cycle().await;

    let snap = record.snapshot();
    assert_eq!(snap.finish_status, FinishStatus::Aborted);
    assert_eq!(snap.finish_token_index, 0);
    assert_eq!(snap.cur_output_len, 0);
    let resolved = h.scheduler.take_resolutions();
    assert_eq!(resolved[0].request_id, waiting.id);
    assert_eq!(resolved[0].status, FinishStatus::Aborted);
    assert_eq!(h.scheduler.waiting(), 0);
}

#[tokio::test]
async fn abort_while_running() {
    let mut h = Harness::new(router(100), kv(), 1);
    let req = request(1, 8, 20);
    let record = h.scheduler.submit(req.clone()).unwrap();
    h.cycle().await;
    h.cycle().await;

    h.scheduler.abort(req.id);
    // The backend notices the flag in the next step, the slot comes back after.
    h.cycle().await;
    assert_eq!(record.finish_status(), FinishStatus::Aborted);
    h.cycle().await;

    assert_eq!(h.free(0), 100);
    let snap = record.snapshot();
    assert_eq!(snap.cur_output_len, 2);
    assert_eq!(snap.finish_token_index, 1);
    let resolved = h.scheduler.take_resolutions();
    assert_eq!(resolved[0].status, FinishStatus::Aborted);
}

#[tokio::test]
async fn prompt_larger_than_limit_is_aborted() {
    let mut cfg = router(100);
    cfg.router_token_ratio = 0.1;
    let mut h = Harness::new(cfg, kv(), 1);
    let req = request(1, 95, 4);
    let record = h.scheduler.submit(req.clone()).unwrap();

    h.cycle().await;
    assert_eq!(record.finish_status(), FinishStatus::Aborted);
    let resolved = h.scheduler.take_resolutions();
    assert_eq!(resolved[0].request_id, req.id);
    assert!(resolved[0].reason.as_deref().unwrap().contains("Out of memory"));
    assert_eq!(h.free(0), 100);
}

#[tokio::test]
async fn request_whose_generation_cannot_fit_is_aborted() {
    let mut h = Harness::new(router(100), kv(), 1);
    let greedy = request(1, 60, 60);
    let small = request(2, 4, 2);
    let greedy_record = h.scheduler.submit(greedy.clone()).unwrap();
    let small_record = h.scheduler.submit(small.clone()).unwrap();

    h.cycle().await;
    assert_eq!(greedy_record.finish_status(), FinishStatus::Aborted);
    let resolved = h.scheduler.take_resolutions();
    assert_eq!(resolved[0].request_id, greedy.id);
    assert!(resolved[0].reason.as_deref().unwrap().contains("Out of memory"));
    assert!(h.state(small.id).is_some());

    for _ in 0..3 {
        h.cycle().await;
    }
    assert_eq!(small_record.finish_status(), FinishStatus::FinishedByLength);
    assert_eq!(small_record.cur_output_len(), 2);
    assert_eq!(h.free(0), 100);
}

#[tokio::test]
async fn long_prompt_is_chunked() {
    let mut cfg = router(100);
    cfg.batch_max_tokens = 16;
    cfg.chunked_prefill_size = 8;
    let mut h = Harness::new(cfg, kv(), 1);
    let req = request(1, 20, 4);
    let record = h.scheduler.submit(req.clone()).unwrap();

    let tokens: Vec<usize> = [
        h.cycle().await.total_tokens(),
        h.cycle().await.total_tokens(),
        h.cycle().await.total_tokens(),
    ]
    .to_vec();
    assert_eq!(tokens, vec![8, 8, 4]);
    assert_eq!(record.cur_kv_len(), 20);
    assert_eq!(record.cur_output_len(), 1);
    assert_eq!(h.state(req.id), Some(RequestState::Running));
}

#[tokio::test]
async fn decodes_are_planned_before_prefill() {
    let mut cfg = router(200);
    cfg.batch_max_tokens = 16;
    cfg.chunked_prefill_size = 16;
    let mut h = Harness::new(cfg, kv(), 1);
    let running = request(1, 4, 8);
    h.scheduler.submit(running.clone()).unwrap();
    h.cycle().await;

    let long = request(2, 40, 4);
    h.scheduler.submit(long.clone()).unwrap();
    let plan = h.cycle().await;
    let entries = &plan.batches[0].entries;
    assert_eq!(entries[0].request_id, running.id);
    assert_eq!(entries[0].kind, StepKind::Decode);
    assert_eq!(entries[1].request_id, long.id);
    assert_eq!(entries[1].input_tokens.len(), 15);
}

#[tokio::test]
async fn aged_request_overtakes_priority() {
    let mut cfg = router(100);
    cfg.running_max_req_size = 1;
    cfg.router_max_wait_tokens = 2;
    let mut h = Harness::new(cfg, kv(), 1);

    let low = request(1, 4, 1).with_priority(Priority::Low);
    h.scheduler.submit(low.clone()).unwrap();
    h.scheduler
        .submit(request(2, 4, 1).with_priority(Priority::High))
        .unwrap();
    let plan = h.cycle().await;
    assert_eq!(plan.batches[0].admitted[0].request.id, RequestId::new(2));

    h.scheduler
        .submit(request(3, 4, 1).with_priority(Priority::High))
        .unwrap();
    let plan = h.cycle().await;
    assert_eq!(plan.batches[0].admitted[0].request.id, RequestId::new(3));

    h.scheduler
        .submit(request(4, 4, 1).with_priority(Priority::High))
        .unwrap();
    let plan = h.cycle().await;
    assert_eq!(plan.batches[0].admitted[0].request.id, low.id);
}

#[tokio::test]
async fn finished_prompt_is_shared_through_prefix_cache() {
    let cache = KvCacheConfig {
        use_dynamic_prompt_cache: true,
        cache_capacity: 64,
        ..kv()
    };
    let mut h = Harness::new(router(100), cache, 1);
    let first = request(1, 8, 2);
    h.scheduler.submit(first).unwrap();
    h.cycle().await;
    h.cycle().await;
    h.cycle().await;
    // Prompt stays cached; only the decode slot came back.
    assert_eq!(h.free(0), 92);
    assert_eq!(h.scheduler.shard(0).unwrap().evictable_slots(), 8);

    let second = request(2, 8, 2);
    let record = h.scheduler.submit(second.clone()).unwrap();
    let plan = h.cycle().await;
    let batch = &plan.batches[0];
    assert_eq!(batch.admitted[0].cached_slots.len(), 7);
    assert_eq!(batch.entries[0].input_tokens, vec![second.prompt[7]]);
    assert_eq!(record.cur_kv_len(), 8);
    assert_eq!(record.cur_output_len(), 1);
}

#[tokio::test]
async fn starved_shard_drops_newest_request() {
    let mut cfg = router(20);
    cfg.router_max_new_token_len = 1;
    let mut h = Harness::new(cfg, kv(), 1);
    let older = request(1, 9, 10);
    let newer = request(2, 9, 10);
    h.scheduler.submit(older.clone()).unwrap();
    let newer_record = h.scheduler.submit(newer.clone()).unwrap();

    h.cycle().await;
    h.cycle().await;
    assert_eq!(h.free(0), 0);

    let plan = h.cycle().await;
    assert_eq!(plan.total_tokens(), 0);
    assert_eq!(newer_record.finish_status(), FinishStatus::Aborted);
    assert_eq!(plan.batches[0].retired, vec![newer.id]);
    assert_eq!(h.free(0), 10);

    let plan = h.cycle().await;
    assert_eq!(plan.batches[0].entries[0].request_id, older.id);
    assert_eq!(h.state(older.id), Some(RequestState::Running));
}

#[tokio::test]
async fn requests_spread_over_shards() {
    let mut h = Harness::new(router(100), kv(), 2);
    h.scheduler.submit(request(1, 30, 4)).unwrap();
    h.scheduler.submit(request(2, 30, 4)).unwrap();

    let plan = h.cycle().await;
    assert_eq!(plan.batches.len(), 2);
    assert_eq!(h.free(0), 70);
    assert_eq!(h.free(1), 70);
    let stats = h.scheduler.stats();
    assert_eq!(stats.running, 2);
    assert_eq!(stats.used_slots(), 60);
    assert_eq!(stats.capacity(), 200);
}

#[tokio::test]
async fn failed_batch_aborts_its_requests() {
    let mut h = Harness::new(router(100), kv(), 1);
    let req = request(1, 6, 4);
    let record = h.scheduler.submit(req.clone()).unwrap();
    h.executor.fail_on_call(1);

    let plan = h.scheduler.schedule();
    let batch = &plan.batches[0];
    let err = h.backends[0].step(batch).await.unwrap_err();
    assert!(err.is_fatal());
    h.scheduler.fail_batch(batch.id, &err);

    assert_eq!(record.finish_status(), FinishStatus::Aborted);
    assert_eq!(h.free(0), 100);
    let resolved = h.scheduler.take_resolutions();
    assert_eq!(resolved[0].status, FinishStatus::Aborted);
}

#[tokio::test]
async fn prefill_instance_exports_then_releases() {
    let mut cfg = router(100);
    cfg.run_mode = RunMode::Prefill;
    let mut h = Harness::new(cfg, kv(), 1);
    let req = request(1, 12, 8);
    h.scheduler.submit(req.clone()).unwrap();
    h.cycle().await;

    assert_eq!(h.state(req.id), Some(RequestState::Exporting));
    let tickets = h.scheduler.pending_exports();
    assert_eq!(tickets.len(), 1);
    assert_eq!(tickets[0].slots.len(), 12);
    assert_eq!(tickets[0].prefilled.first_token, TokenId::new(5));

    // Nothing is decoded or released while the export is outstanding.
    let plan = h.cycle().await;
    assert_eq!(plan.total_tokens(), 0);
    assert_eq!(h.free(0), 88);

    h.scheduler.complete_export(req.id).unwrap();
    assert!(h.scheduler.complete_export(req.id).is_err());
    h.cycle().await;
    assert_eq!(h.free(0), 100);
    let resolved = h.scheduler.take_resolutions();
    assert!(resolved[0].exported);
}

#[tokio::test]
async fn decode_instance_imports_prefilled_request() {
    let mut cfg = router(100);
    cfg.run_mode = RunMode::Decode;
    let mut h = Harness::new(cfg, kv(), 1);
    let req = request(1, 12, 3);
    let prefilled = PrefilledState {
        first_token: TokenId::new(9),
        first_logprob: 0.0,
    };

    let target = h
        .scheduler
        .admit_prefilled(req.clone(), prefilled)
        .unwrap()
        .unwrap();
    assert_eq!(target.slots.len(), 12);
    assert_eq!(h.state(req.id), Some(RequestState::KvPending));

    // Not decoded until the cache lands.
    let plan = h.cycle().await;
    assert_eq!(plan.total_tokens(), 0);

    h.scheduler.mark_kv_ready(req.id).unwrap();
    let plan = h.cycle().await;
    let batch = &plan.batches[0];
    assert_eq!(batch.admitted[0].request.id, req.id);
    assert_eq!(batch.entries[0].kind, StepKind::Decode);

    let record = h.scheduler.records().get(req.id).unwrap();
    assert_eq!(record.cur_kv_len(), 13);
    assert_eq!(record.cur_output_len(), 2);
}

#[tokio::test]
async fn decode_instance_defers_import_without_room() {
    let mut cfg = router(30);
    cfg.run_mode = RunMode::Decode;
    let mut h = Harness::new(cfg, kv(), 1);
    let prefilled = PrefilledState {
        first_token: TokenId::new(9),
        first_logprob: 0.0,
    };

    assert!(h
        .scheduler
        .admit_prefilled(request(1, 20, 4), prefilled.clone())
        .unwrap()
        .is_some());
    assert!(h
        .scheduler
        .admit_prefilled(request(2, 20, 4), prefilled.clone())
        .unwrap()
        .is_none());
    assert!(h.scheduler.records().get(RequestId::new(2)).is_none());
    assert!(h
        .scheduler
        .admit_prefilled(request(3, 40, 4), prefilled.clone())
        .is_err());
    let err = h
        .scheduler
        .admit_prefilled(request(4, 20, 20), prefilled)
        .unwrap_err();
    assert!(matches!(err, EmberError::OutOfMemory { .. }));
    assert!(h.scheduler.records().get(RequestId::new(4)).is_none());
}
