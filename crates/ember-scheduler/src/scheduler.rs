//! Continuous-batching scheduler
//!
//! Each call to [`Scheduler::schedule`] is one cycle:
//!
//! 1. reap requests whose records report a finish (or whose abort flag is set)
//!    and return their slots
//! 2. give every running request one decode token
//! 3. continue chunked prefills that are already admitted
//! 4. admit waiting requests in queue order while the projected cache
//!    footprint stays under the admission limit
//!
//! Decodes are planned before prefill so a long prompt never starves running
//! requests of their per-cycle token.

use crate::queue::{QueueKey, WaitQueue};
use crate::request::{
    peak_footprint, ExportTicket, ImportTarget, RequestState, Resolution, ScheduledRequest,
};
use crate::stats::{SchedulerCounters, SchedulerStats, ShardStats};
use ember_interfaces::{AdmittedRequest, Batch, BatchEntry, PrefilledState, StepKind, StepReport};
use ember_kv::{HandleTable, KvShard};
use ember_types::{
    BatchId, EmberError, FinishStatus, InferenceRequest, KvCacheConfig, ParallelConfig,
    RequestId, Result, RouterConfig, RunMode, ShardIndex, SharedRecordTable,
    SharedRequestRecord, SlotIndex, TokenId,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

/// Output of one scheduling cycle
#[derive(Debug)]
pub struct SchedulePlan {
    pub cycle: u64,
    /// At most one batch per shard; shards with nothing to do are left out
    pub batches: Vec<Batch>,
    /// Requests that could not be scheduled this cycle and stay put
    pub deferred: Vec<(RequestId, EmberError)>,
}

impl SchedulePlan {
    pub fn is_empty(&self) -> bool {
        self.batches.iter().all(Batch::is_empty)
    }

    pub fn total_tokens(&self) -> usize {
        self.batches.iter().map(Batch::total_tokens).sum()
    }
}

/// Scratch state while one cycle is being planned
struct CycleState {
    batches: Vec<Batch>,
    budgets: Vec<usize>,
    deferred: Vec<(RequestId, EmberError)>,
    /// Admitted requests that could not get a slot, per shard
    stalled: Vec<Vec<RequestId>>,
}

/// Slot accounting, admission and batch formation for all shards of one instance
pub struct Scheduler {
    router: RouterConfig,
    shards: Vec<KvShard>,
    records: Arc<SharedRecordTable>,
    queue: WaitQueue,
    requests: HashMap<RequestId, ScheduledRequest>,
    in_flight: HashMap<BatchId, Vec<RequestId>>,
    pending_admits: Vec<Vec<AdmittedRequest>>,
    pending_retire: Vec<Vec<RequestId>>,
    resolutions: Vec<Resolution>,
    cycle: u64,
    next_seq: u64,
    next_admission: u64,
    counters: SchedulerCounters,
}

impl Scheduler {
    pub fn new(
        router: &RouterConfig,
        kv: &KvCacheConfig,
        parallel: &ParallelConfig,
        records: Arc<SharedRecordTable>,
    ) -> Result<Self> {
        router.validate()?;
        parallel.validate()?;
        let shards = (0..parallel.dp)
            .map(|i| KvShard::new(i, router.max_total_token_num, kv, parallel.cards_per_shard))
            .collect::<Result<Vec<_>>>()?;

        info!(
            "Scheduler: mode={:?}, shards={}, capacity={}, admission_limit={}, batch_max_tokens={}, chunked_prefill={}",
            router.run_mode,
            shards.len(),
            router.max_total_token_num,
            router.admission_limit(),
            router.batch_max_tokens,
            router.enable_chunked_prefill
        );

        Ok(Self {
            router: router.clone(),
            queue: WaitQueue::new(router.max_waiting_requests),
            pending_admits: vec![Vec::new(); shards.len()],
            pending_retire: vec![Vec::new(); shards.len()],
            shards,
            records,
            requests: HashMap::new(),
            in_flight: HashMap::new(),
            resolutions: Vec::new(),
            cycle: 0,
            next_seq: 0,
            next_admission: 0,
            counters: SchedulerCounters::default(),
        })
    }

    pub fn config(&self) -> &RouterConfig {
        &self.router
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn shard(&self, index: ShardIndex) -> Option<&KvShard> {
        self.shards.get(index)
    }

    /// Cache handles of one shard, one per card
    pub fn shard_handles(&self, index: ShardIndex) -> Option<HandleTable> {
        self.shards.get(index).map(KvShard::handles)
    }

    pub fn records(&self) -> &Arc<SharedRecordTable> {
        &self.records
    }

    pub fn request(&self, id: RequestId) -> Option<&ScheduledRequest> {
        self.requests.get(&id)
    }

    pub fn waiting(&self) -> usize {
        self.queue.len()
    }

    /// Nothing queued, live, or waiting to be told to a worker
    pub fn is_idle(&self) -> bool {
        self.requests.is_empty()
            && self.pending_admits.iter().all(Vec::is_empty)
            && self.pending_retire.iter().all(Vec::is_empty)
    }

    /// Validate and enqueue a request.
    ///
    /// Returns the request's shared record; output consumers poll it.
    pub fn submit(&mut self, request: InferenceRequest) -> Result<Arc<SharedRequestRecord>> {
        if self.router.run_mode == RunMode::Decode {
            return Err(EmberError::invalid_state(
                "decode instances only accept prefilled requests",
            ));
        }
        request.validate(self.router.max_req_total_len)?;
        if !self.chunking_enabled() && request.prompt_len() > self.router.batch_max_tokens {
            return Err(EmberError::malformed_request(format!(
                "prompt of {} tokens exceeds batch_max_tokens {} without chunked prefill",
                request.prompt_len(),
                self.router.batch_max_tokens
            )));
        }
        if self.requests.contains_key(&request.id) {
            return Err(EmberError::malformed_request(format!(
                "duplicate request id {}",
                request.id
            )));
        }
        if self.queue.is_full() {
            return Err(EmberError::malformed_request(format!(
                "wait queue full ({} requests)",
                self.queue.len()
            )));
        }

        let record = self.records.create(request.id)?;
        let seq = self.next_seq;
        self.next_seq += 1;
        let id = request.id;
        self.queue
            .push(id, QueueKey::new(request.priority, seq), self.cycle);
        debug!(
            "Submitted {}: prompt_len={}, max_new_tokens={}, priority={:?}",
            id,
            request.prompt_len(),
            request.sampling.max_new_tokens,
            request.priority
        );
        self.requests
            .insert(id, ScheduledRequest::new(request, record.clone(), seq));
        self.counters.submitted += 1;
        Ok(record)
    }

    /// Set the abort flag; the request finishes at the next opportunity
    pub fn abort(&self, id: RequestId) -> bool {
        self.records.abort(id)
    }

    /// Plan one cycle
    pub fn schedule(&mut self) -> SchedulePlan {
        self.cycle += 1;
        self.reap();

        let shard_count = self.shards.len();
        let mut state = CycleState {
            batches: (0..shard_count).map(Batch::new).collect(),
            budgets: vec![self.router.batch_max_tokens; shard_count],
            deferred: Vec::new(),
            stalled: vec![Vec::new(); shard_count],
        };

        self.schedule_decodes(&mut state);
        self.schedule_prefill_chunks(&mut state);
        self.admit_waiting(&mut state);
        self.break_livelock(&mut state);

        for (shard, batch) in state.batches.iter_mut().enumerate() {
            batch.admitted.append(&mut self.pending_admits[shard]);
            batch.retired.append(&mut self.pending_retire[shard]);
        }

        let batches: Vec<Batch> = state
            .batches
            .into_iter()
            .filter(|b| !b.is_noop())
            .collect();
        for batch in &batches {
            if !batch.entries.is_empty() {
                self.in_flight.insert(
                    batch.id,
                    batch.entries.iter().map(|e| e.request_id).collect(),
                );
                self.counters.batches += 1;
                self.counters.scheduled_tokens += batch.total_tokens() as u64;
            }
            trace!(
                "Cycle {} shard {}: {} prefill, {} decode, {} tokens, {} admitted, {} retired",
                self.cycle,
                batch.shard,
                batch.prefill_count(),
                batch.decode_count(),
                batch.total_tokens(),
                batch.admitted.len(),
                batch.retired.len()
            );
        }

        SchedulePlan {
            cycle: self.cycle,
            batches,
            deferred: state.deferred,
        }
    }

    /// Fold a worker's step report back into scheduler state
    pub fn complete_step(&mut self, report: &StepReport) {
        self.clear_in_flight(report.batch_id);

        for result in &report.results {
            let Some(req) = self.requests.get_mut(&result.request_id) else {
                continue;
            };
            if let Some(reason) = &result.abort_reason {
                req.abort_reason = Some(reason.clone());
            }
            if req.state != RequestState::Prefill
                || result.kind != StepKind::Prefill
                || result.finish_status.is_finished()
            {
                continue;
            }
            let Some(first_token) = result.new_token else {
                continue;
            };
            if self.router.run_mode == RunMode::Prefill {
                req.state = RequestState::Exporting;
                req.pending_transfers = 1;
                req.prefilled = Some(PrefilledState {
                    first_token,
                    first_logprob: result.logprob.unwrap_or(0.0),
                });
                debug!("{} prefilled, awaiting export", req.id());
            } else {
                req.state = RequestState::Running;
            }
        }
    }

    /// Abort every request of a batch that failed as a whole
    pub fn fail_batch(&mut self, batch_id: BatchId, reason: &EmberError) {
        let ids = self.in_flight.remove(&batch_id).unwrap_or_default();
        error!("Batch {} failed: {}; aborting {} requests", batch_id, reason, ids.len());
        for id in ids {
            if let Some(req) = self.requests.get_mut(&id) {
                req.in_flight = false;
            }
            self.abort_admitted(id, reason.to_string());
        }
    }

    /// Resolutions produced since the last call
    pub fn take_resolutions(&mut self) -> Vec<Resolution> {
        std::mem::take(&mut self.resolutions)
    }

    /// Prefilled requests whose cache is ready to be exported
    pub fn pending_exports(&self) -> Vec<ExportTicket> {
        let mut tickets: Vec<(u64, ExportTicket)> = self
            .requests
            .values()
            .filter(|r| r.state == RequestState::Exporting)
            .filter_map(|r| {
                let shard = r.shard?;
                let prefilled = r.prefilled.clone()?;
                let prompt_len = r.prompt_len().min(r.slots.len());
                Some((
                    r.admitted_at.unwrap_or(u64::MAX),
                    ExportTicket {
                        request: r.request.clone(),
                        shard,
                        slots: r.slots[..prompt_len].to_vec(),
                        prefilled,
                    },
                ))
            })
            .collect();
        tickets.sort_by_key(|(order, _)| *order);
        tickets.into_iter().map(|(_, t)| t).collect()
    }

    /// One outstanding export of `id` has landed
    pub fn complete_export(&mut self, id: RequestId) -> Result<()> {
        let req = self.transfer_done(id)?;
        if req.pending_transfers == 0 && req.state == RequestState::Exporting {
            req.state = RequestState::Exported;
            debug!("{} exported", id);
        }
        Ok(())
    }

    /// Give up on an export or import that will never complete.
    ///
    /// The request is aborted and its slots return on the next cycle.
    pub fn cancel_transfer(&mut self, id: RequestId, reason: impl Into<String>) -> Result<()> {
        let req = self
            .requests
            .get_mut(&id)
            .ok_or_else(|| EmberError::not_found(format!("no scheduled request {}", id)))?;
        if req.pending_transfers == 0 {
            return Err(EmberError::invalid_state(format!(
                "{} has no outstanding transfer",
                id
            )));
        }
        req.pending_transfers = 0;
        let reason = reason.into();
        warn!("Cancelled transfer for {}: {}", id, reason);
        if req.state == RequestState::Aborted {
            return Ok(());
        }
        self.abort_admitted(id, reason);
        Ok(())
    }

    /// Aborted requests still holding slots for a transfer that will not finish
    pub fn abandoned_transfers(&self) -> Vec<RequestId> {
        let mut ids: Vec<RequestId> = self
            .requests
            .values()
            .filter(|r| r.state == RequestState::Aborted && r.pending_transfers > 0)
            .map(|r| r.id())
            .collect();
        ids.sort();
        ids
    }

    /// Reserve cache for a prompt prefilled elsewhere.
    ///
    /// `Ok(None)` means there is no room this cycle; retry later. An error means
    /// the request can never be placed here.
    pub fn admit_prefilled(
        &mut self,
        request: InferenceRequest,
        prefilled: PrefilledState,
    ) -> Result<Option<ImportTarget>> {
        if self.router.run_mode != RunMode::Decode {
            return Err(EmberError::invalid_state(
                "only decode instances import prefilled requests",
            ));
        }
        request.validate(self.router.max_req_total_len)?;
        let id = request.id;
        if self.requests.contains_key(&id) || self.records.get(id).is_some() {
            return Err(EmberError::malformed_request(format!(
                "duplicate request id {}",
                id
            )));
        }

        let prompt_len = request.prompt_len();
        let limit = self.router.admission_limit();
        let need = peak_footprint(&request, self.router.router_max_new_token_len, true);
        if need > limit {
            return Err(EmberError::out_of_memory(
                need,
                limit,
                self.router.max_total_token_num,
            ));
        }
        let (outstanding, active) = self.outstanding_need();
        let placement = (0..self.shards.len())
            .filter(|&s| active[s] < self.router.running_max_req_size)
            .map(|s| (self.shards[s].committed_slots() + outstanding[s], s))
            .filter(|(load, _)| load + need <= limit)
            .min();
        let Some((_, shard)) = placement else {
            self.counters.deferred += 1;
            trace!("{} import deferred: need {} slots", id, need);
            return Ok(None);
        };

        let slots = match self.shards[shard].reserve(prompt_len) {
            Ok(slots) => slots,
            Err(e) if e.is_recoverable() => {
                self.counters.deferred += 1;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        let record = match self.records.create(id) {
            Ok(record) => record,
            Err(e) => {
                self.shards[shard].retire(&[], 0, &slots, false)?;
                return Err(e);
            }
        };

        let seq = self.next_seq;
        self.next_seq += 1;
        let mut req = ScheduledRequest::new(request, record, seq);
        req.state = RequestState::KvPending;
        req.shard = Some(shard);
        req.slots = slots.clone();
        req.scheduled_prompt = prompt_len;
        req.pending_transfers = 1;
        req.admitted_at = Some(self.next_admission());
        req.prefilled = Some(prefilled);
        self.requests.insert(id, req);
        self.counters.submitted += 1;
        self.counters.admitted += 1;
        debug!("{} reserved {} slots on shard {} for import", id, prompt_len, shard);

        Ok(Some(ImportTarget {
            request_id: id,
            shard,
            slots,
        }))
    }

    /// The imported cache of `id` is in place; it decodes from the next cycle
    pub fn mark_kv_ready(&mut self, id: RequestId) -> Result<()> {
        let req = self.transfer_done(id)?;
        if req.pending_transfers > 0 || req.state != RequestState::KvPending {
            return Ok(());
        }
        let Some(shard) = req.shard else {
            return Err(EmberError::internal(format!("{} has no shard", id)));
        };
        req.state = RequestState::Running;
        req.announced = true;
        let admitted = AdmittedRequest {
            request: req.request.clone(),
            cached_slots: req.slots.clone(),
            prefilled: req.prefilled.clone(),
        };
        self.pending_admits[shard].push(admitted);
        debug!("{} cache imported, decoding on shard {}", id, shard);
        Ok(())
    }

    pub fn stats(&self) -> SchedulerStats {
        let mut prefilling = 0;
        let mut running = 0;
        let mut transferring = 0;
        for req in self.requests.values() {
            match req.state {
                RequestState::Prefill => prefilling += 1,
                RequestState::Running => running += 1,
                RequestState::Exporting | RequestState::KvPending => transferring += 1,
                _ => {}
            }
        }
        SchedulerStats {
            cycle: self.cycle,
            waiting: self.queue.len(),
            prefilling,
            running,
            transferring,
            counters: self.counters.clone(),
            shards: self
                .shards
                .iter()
                .map(|s| {
                    let pool = s.pool_stats();
                    ShardStats {
                        index: s.index(),
                        capacity: pool.capacity,
                        used_slots: pool.used_slots,
                        free_slots: pool.free_slots,
                        evictable_slots: s.evictable_slots(),
                        utilization: pool.utilization(),
                        prefix_hit_rate: s.prefix_stats().map(|p| p.hit_rate),
                    }
                })
                .collect(),
        }
    }

    /// Check slot ownership across all live requests.
    ///
    /// Every owned slot must be reserved in its shard's pool and owned by
    /// exactly one request.
    pub fn verify_slot_ownership(&self) -> Result<()> {
        let mut owners: HashMap<(ShardIndex, SlotIndex), RequestId> = HashMap::new();
        for req in self.requests.values() {
            let Some(shard) = req.shard else {
                if !req.slots.is_empty() {
                    return Err(EmberError::internal(format!(
                        "{} holds slots without a shard",
                        req.id()
                    )));
                }
                continue;
            };
            let pool = self.shards[shard].pool();
            for &slot in &req.slots {
                if !pool.is_reserved(slot) {
                    return Err(EmberError::internal(format!(
                        "{} holds unreserved slot {} on shard {}",
                        req.id(),
                        slot,
                        shard
                    )));
                }
            }
            for &slot in &req.slots[req.matched.min(req.slots.len())..] {
                if let Some(other) = owners.insert((shard, slot), req.id()) {
                    return Err(EmberError::internal(format!(
                        "slot {} on shard {} owned by {} and {}",
                        slot,
                        shard,
                        other,
                        req.id()
                    )));
                }
            }
        }
        Ok(())
    }

    fn chunking_enabled(&self) -> bool {
        self.router.enable_chunked_prefill && !self.router.is_embedding
    }

    /// Size of the next prefill chunk, 0 when it does not fit this cycle
    fn chunk_len(&self, remaining: usize, budget: usize) -> usize {
        if self.chunking_enabled() {
            remaining.min(self.router.chunked_prefill_size).min(budget)
        } else if remaining <= budget {
            remaining
        } else {
            0
        }
    }

    fn next_admission(&mut self) -> u64 {
        let order = self.next_admission;
        self.next_admission += 1;
        order
    }

    /// Future slot need and active request count, per shard
    fn outstanding_need(&self) -> (Vec<usize>, Vec<usize>) {
        let mut need = vec![0; self.shards.len()];
        let mut active = vec![0; self.shards.len()];
        let cap = self.router.router_max_new_token_len;
        let generates = !self.router.is_embedding;
        for req in self.requests.values() {
            let Some(shard) = req.shard else {
                continue;
            };
            if req.state.is_active() {
                active[shard] += 1;
                need[shard] += req.future_need(cap, generates);
            }
        }
        (need, active)
    }

    fn clear_in_flight(&mut self, batch_id: BatchId) {
        if let Some(ids) = self.in_flight.remove(&batch_id) {
            for id in ids {
                if let Some(req) = self.requests.get_mut(&id) {
                    req.in_flight = false;
                }
            }
        }
    }

    fn transfer_done(&mut self, id: RequestId) -> Result<&mut ScheduledRequest> {
        let req = self
            .requests
            .get_mut(&id)
            .ok_or_else(|| EmberError::not_found(format!("no scheduled request {}", id)))?;
        if req.pending_transfers == 0 {
            return Err(EmberError::invalid_state(format!(
                "{} has no outstanding transfer",
                id
            )));
        }
        req.pending_transfers -= 1;
        Ok(req)
    }

    /// Poll records and release whatever is done
    fn reap(&mut self) {
        let ids: Vec<RequestId> = self.requests.keys().copied().collect();
        for id in ids {
            let Some(req) = self.requests.get(&id) else {
                continue;
            };
            match req.state {
                RequestState::Queued => {
                    if req.record.abort_requested() {
                        self.queue.remove(id);
                        self.abort_unadmitted(id, "aborted while waiting".to_string());
                    }
                }
                RequestState::Prefill | RequestState::Running => {
                    if req.in_flight {
                        continue;
                    }
                    let status = req.record.finish_status();
                    if status.is_finished() {
                        self.finish(id, status);
                    }
                }
                RequestState::Exporting | RequestState::KvPending => {
                    if req.record.abort_requested() {
                        self.abort_admitted(id, "aborted during cache transfer".to_string());
                    }
                }
                RequestState::Exported | RequestState::Finished | RequestState::Aborted => {
                    if req.pending_transfers == 0 {
                        self.release(id);
                    }
                }
            }
        }
    }

    fn finish(&mut self, id: RequestId, status: FinishStatus) {
        let Some(req) = self.requests.get_mut(&id) else {
            return;
        };
        req.finish_status = status;
        req.state = if status.is_aborted() {
            RequestState::Aborted
        } else {
            RequestState::Finished
        };
        if req.pending_transfers == 0 {
            self.release(id);
        }
    }

    /// Abort a request that never reached a worker
    fn abort_unadmitted(&mut self, id: RequestId, reason: String) {
        if let Some(req) = self.requests.get_mut(&id) {
            debug!("Aborting waiting {}: {}", id, reason);
            req.record.publish_abort();
            req.state = RequestState::Aborted;
            req.finish_status = FinishStatus::Aborted;
            req.abort_reason = Some(reason);
        }
        self.release(id);
    }

    /// Abort an admitted request with no step in flight
    fn abort_admitted(&mut self, id: RequestId, reason: String) {
        let Some(req) = self.requests.get_mut(&id) else {
            return;
        };
        if req.state.is_terminal() {
            return;
        }
        debug!("Aborting {} in state {:?}: {}", id, req.state, reason);
        req.record.publish_abort();
        req.state = RequestState::Aborted;
        req.finish_status = FinishStatus::Aborted;
        req.abort_reason.get_or_insert(reason);
        if req.pending_transfers == 0 {
            self.release(id);
        }
    }

    /// Return a request's slots and retire its record
    fn release(&mut self, id: RequestId) {
        let Some(req) = self.requests.remove(&id) else {
            return;
        };
        if let Some(shard) = req.shard {
            let cacheable = !self.router.is_embedding
                && req.record.cur_kv_len() >= req.prompt_len()
                && req.slots.len() >= req.prompt_len();
            if let Err(e) =
                self.shards[shard].retire(&req.request.prompt, req.matched, &req.slots, cacheable)
            {
                error!("Releasing {} on shard {} failed: {}", id, shard, e);
            }
            if req.announced {
                self.pending_retire[shard].push(id);
            }
        }

        let exported = req.state == RequestState::Exported;
        match req.state {
            RequestState::Exported => self.counters.exported += 1,
            RequestState::Aborted => self.counters.aborted += 1,
            _ => self.counters.finished += 1,
        }
        let snapshot = req.record.snapshot();
        self.records.retire(id);
        debug!(
            "Released {}: status={}, slots={}, output_len={}",
            id,
            req.finish_status,
            req.slots.len(),
            snapshot.cur_output_len
        );
        self.resolutions.push(Resolution {
            request_id: id,
            status: req.finish_status,
            snapshot,
            reason: req.abort_reason,
            exported,
        });
    }

    /// Requests in `state`, oldest admission first
    fn admitted_in(&self, state: RequestState) -> Vec<RequestId> {
        let mut ids: Vec<(u64, RequestId)> = self
            .requests
            .values()
            .filter(|r| r.state == state && !r.in_flight)
            .filter_map(|r| r.admitted_at.map(|order| (order, r.id())))
            .collect();
        ids.sort_unstable();
        ids.into_iter().map(|(_, id)| id).collect()
    }

    fn schedule_decodes(&mut self, state: &mut CycleState) {
        for id in self.admitted_in(RequestState::Running) {
            let Some(req) = self.requests.get_mut(&id) else {
                continue;
            };
            let Some(shard) = req.shard else {
                continue;
            };
            if state.budgets[shard] == 0 {
                continue;
            }
            match self.shards[shard].reserve(1) {
                Ok(slots) => {
                    let Some(&slot) = slots.first() else {
                        continue;
                    };
                    req.slots.push(slot);
                    req.in_flight = true;
                    state.budgets[shard] -= 1;
                    state.batches[shard]
                        .entries
                        .push(BatchEntry::decode(id, slot));
                }
                Err(e) => {
                    trace!("{} decode stalled: {}", id, e);
                    state.stalled[shard].push(id);
                    state.deferred.push((id, e));
                }
            }
        }
    }

    fn schedule_prefill_chunks(&mut self, state: &mut CycleState) {
        for id in self.admitted_in(RequestState::Prefill) {
            let Some(req) = self.requests.get(&id) else {
                continue;
            };
            let (Some(shard), remaining) = (req.shard, req.remaining_prompt()) else {
                continue;
            };
            if remaining == 0 {
                continue;
            }
            let chunk = self.chunk_len(remaining, state.budgets[shard]);
            if chunk == 0 {
                continue;
            }
            match self.shards[shard].reserve(chunk) {
                Ok(slots) => {
                    let Some(req) = self.requests.get_mut(&id) else {
                        continue;
                    };
                    let start = req.scheduled_prompt;
                    let end = start + chunk;
                    let tokens = req.request.prompt[start..end].to_vec();
                    let last = end == req.prompt_len();
                    req.slots.extend_from_slice(&slots);
                    req.scheduled_prompt = end;
                    req.in_flight = true;
                    state.budgets[shard] -= chunk;
                    state.batches[shard]
                        .entries
                        .push(BatchEntry::prefill_chunk(id, tokens, slots, last));
                }
                Err(e) => {
                    trace!("{} prefill chunk stalled: {}", id, e);
                    state.stalled[shard].push(id);
                    state.deferred.push((id, e));
                }
            }
        }
    }

    fn admit_waiting(&mut self, state: &mut CycleState) {
        let promoted = self
            .queue
            .promote_aged(self.cycle, self.router.router_max_wait_tokens);
        if promoted > 0 {
            debug!("Cycle {}: {} waiting requests aged", self.cycle, promoted);
        }

        let limit = self.router.admission_limit();
        while let Some((id, key)) = self.queue.pop() {
            let Some(req) = self.requests.get(&id) else {
                self.queue.admitted(id);
                continue;
            };
            if req.record.abort_requested() {
                self.queue.admitted(id);
                self.abort_unadmitted(id, "aborted while waiting".to_string());
                continue;
            }
            let footprint = req.peak_footprint(
                self.router.router_max_new_token_len,
                !self.router.is_embedding,
            );
            if footprint > limit {
                self.queue.admitted(id);
                let err =
                    EmberError::out_of_memory(footprint, limit, self.router.max_total_token_num);
                warn!("{} can never be admitted: {}", id, err);
                self.abort_unadmitted(id, err.to_string());
                continue;
            }

            match self.try_admit(id, state, limit) {
                Ok(()) => self.queue.admitted(id),
                Err(reason) => {
                    if let Some(err) = reason {
                        trace!("{} deferred: {}", id, err);
                        self.counters.deferred += 1;
                        state.deferred.push((id, err));
                    }
                    self.queue.requeue(id, key);
                    break;
                }
            }
        }
    }

    /// Place one waiting request; `Err(None)` means no room in this cycle's
    /// budget, `Err(Some(_))` a cache shortfall.
    fn try_admit(
        &mut self,
        id: RequestId,
        state: &mut CycleState,
        limit: usize,
    ) -> std::result::Result<(), Option<EmberError>> {
        let (outstanding, active) = self.outstanding_need();
        let shard = (0..self.shards.len())
            .filter(|&s| state.budgets[s] > 0 && active[s] < self.router.running_max_req_size)
            .min_by_key(|&s| self.shards[s].committed_slots() + outstanding[s])
            .ok_or(None::<EmberError>)?;

        let generates = !self.router.is_embedding;
        let cap = self.router.router_max_new_token_len;
        let capacity = self.router.max_total_token_num;
        let chunking = self.chunking_enabled();
        let chunk_size = self.router.chunked_prefill_size;
        let budget = state.budgets[shard];

        let req = self.requests.get_mut(&id).ok_or(None::<EmberError>)?;
        let prompt_len = req.prompt_len();
        let kv_shard = &mut self.shards[shard];
        let matched = kv_shard.match_prefix(&req.request.prompt[..prompt_len - 1]);
        let matched_len = matched.slots.len();

        let decode_need = if generates {
            req.request.sampling.max_new_tokens.min(cap).saturating_sub(1)
        } else {
            0
        };
        let need = prompt_len - matched_len + decode_need;
        let projected = kv_shard.committed_slots() + outstanding[shard];
        if projected + need > limit {
            undo_match(kv_shard, &req.request.prompt[..matched_len], id);
            return Err(Some(EmberError::out_of_memory(
                need,
                limit.saturating_sub(projected),
                capacity,
            )));
        }

        let remaining = prompt_len - matched_len;
        let chunk = if chunking {
            remaining.min(chunk_size).min(budget)
        } else if remaining <= budget {
            remaining
        } else {
            0
        };
        if chunk == 0 {
            undo_match(kv_shard, &req.request.prompt[..matched_len], id);
            return Err(None);
        }
        let new_slots = match kv_shard.reserve(chunk) {
            Ok(slots) => slots,
            Err(e) => {
                undo_match(kv_shard, &req.request.prompt[..matched_len], id);
                return Err(Some(e));
            }
        };

        let end = matched_len + chunk;
        let tokens = req.request.prompt[matched_len..end].to_vec();
        req.state = RequestState::Prefill;
        req.shard = Some(shard);
        req.matched = matched_len;
        req.slots = matched.slots;
        req.slots.extend_from_slice(&new_slots);
        req.scheduled_prompt = end;
        req.announced = true;
        req.in_flight = true;
        let admitted = AdmittedRequest {
            request: req.request.clone(),
            cached_slots: req.slots[..matched_len].to_vec(),
            prefilled: None,
        };
        debug!(
            "Admitted {} to shard {}: prompt_len={}, prefix_hit={}, first_chunk={}",
            id, shard, prompt_len, matched_len, chunk
        );

        let order = self.next_admission();
        if let Some(req) = self.requests.get_mut(&id) {
            req.admitted_at = Some(order);
        }
        self.counters.admitted += 1;
        state.budgets[shard] -= chunk;
        let batch = &mut state.batches[shard];
        batch.admitted.push(admitted);
        batch.entries.push(BatchEntry::prefill_chunk(
            id,
            tokens,
            new_slots,
            end == prompt_len,
        ));
        Ok(())
    }

    /// A shard that planned nothing while admitted requests starved for slots
    /// can never progress on its own; drop its newest starving request.
    fn break_livelock(&mut self, state: &mut CycleState) {
        for shard in 0..self.shards.len() {
            if !state.batches[shard].entries.is_empty() || state.stalled[shard].is_empty() {
                continue;
            }
            let victim = state.stalled[shard]
                .iter()
                .filter_map(|id| {
                    self.requests
                        .get(id)
                        .and_then(|r| r.admitted_at.map(|order| (order, *id)))
                })
                .max();
            if let Some((_, id)) = victim {
                warn!(
                    "Shard {} cannot make progress; aborting newest stalled request {}",
                    shard, id
                );
                self.abort_admitted(id, "out of cache slots while running".to_string());
            }
        }
    }
}

fn undo_match(shard: &mut KvShard, matched: &[TokenId], id: RequestId) {
    if let Err(e) = shard.release_prefix(matched) {
        error!("Undoing prefix match for {} failed: {}", id, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_types::SamplingParams;

    fn router(capacity: usize) -> RouterConfig {
        RouterConfig {
            max_total_token_num: capacity,
            batch_max_tokens: 64,
            chunked_prefill_size: 64,
            max_req_total_len: 256,
            ..Default::default()
        }
    }

    fn kv() -> KvCacheConfig {
        KvCacheConfig {
            head_num: 1,
            head_dim: 2,
            cache_reserved_ratio: 0.0,
            ..Default::default()
        }
    }

    fn request(id: u64, prompt: u32, max_new: usize) -> InferenceRequest {
        InferenceRequest::new(
            RequestId::new(id),
            (0..prompt).map(|t| TokenId::new(t + 3)).collect(),
            SamplingParams::greedy(max_new),
        )
    }

    fn scheduler(capacity: usize) -> Scheduler {
        Scheduler::new(
            &router(capacity),
            &kv(),
            &ParallelConfig::default(),
            Arc::new(SharedRecordTable::new()),
        )
        .unwrap()
    }

    #[test]
    fn test_submit_rejects_oversized_request() {
        let mut s = scheduler(100);
        let err = s.submit(request(1, 250, 16)).unwrap_err();
        assert!(matches!(err, EmberError::MalformedRequest { .. }));
        assert!(s.records().is_empty());
    }

    #[test]
    fn test_admission_plans_first_chunk() {
        let mut s = scheduler(100);
        s.submit(request(1, 10, 4)).unwrap();
        let plan = s.schedule();
        assert_eq!(plan.batches.len(), 1);
        let batch = &plan.batches[0];
        assert_eq!(batch.admitted.len(), 1);
        assert_eq!(batch.entries.len(), 1);
        assert_eq!(batch.entries[0].input_tokens.len(), 10);
        assert!(batch.entries[0].samples);
        assert_eq!(s.request(RequestId::new(1)).unwrap().state, RequestState::Prefill);
        s.verify_slot_ownership().unwrap();
    }

    #[test]
    fn test_in_flight_request_not_rescheduled() {
        let mut s = scheduler(100);
        s.submit(request(1, 10, 4)).unwrap();
        let first = s.schedule();
        assert_eq!(first.total_tokens(), 10);
        let second = s.schedule();
        assert_eq!(second.total_tokens(), 0);
    }

    #[test]
    fn test_decode_mode_rejects_plain_submit() {
        let mut cfg = router(100);
        cfg.run_mode = RunMode::Decode;
        let mut s = Scheduler::new(
            &cfg,
            &kv(),
            &ParallelConfig::default(),
            Arc::new(SharedRecordTable::new()),
        )
        .unwrap();
        assert!(s.submit(request(1, 4, 4)).is_err());
    }
}
