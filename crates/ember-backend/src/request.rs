//! Worker-side request state

use ember_interfaces::AdmittedRequest;
use ember_types::{
    FinishStatus, InferenceRequest, RecordUpdate, RequestId, SharedRequestRecord, SlotIndex,
    TokenId,
};
use std::collections::HashMap;
use std::sync::Arc;

/// A request as seen by the backend that executes it.
///
/// Its volatile fields are mutated only inside the backend's step for this
/// request and mirrored to the shared record after each mutation.
#[derive(Debug)]
pub struct InferReq {
    pub request: InferenceRequest,
    record: Arc<SharedRequestRecord>,
    /// Slots holding this request's cache, in position order
    slots: Vec<SlotIndex>,
    cur_kv_len: usize,
    prompt_cursor: usize,
    cur_output_len: usize,
    output_tokens: Vec<TokenId>,
    logprobs: Vec<f32>,
    out_token_counts: HashMap<TokenId, usize>,
    finish_status: FinishStatus,
}

impl InferReq {
    pub fn new(admitted: AdmittedRequest, record: Arc<SharedRequestRecord>) -> Self {
        let cached = admitted.cached_slots.len();
        let mut req = Self {
            request: admitted.request,
            record,
            slots: admitted.cached_slots,
            cur_kv_len: cached,
            prompt_cursor: cached,
            cur_output_len: 0,
            output_tokens: Vec::new(),
            logprobs: Vec::new(),
            out_token_counts: HashMap::new(),
            finish_status: FinishStatus::NotFinished,
        };
        if let Some(prefilled) = admitted.prefilled {
            req.prompt_cursor = req.request.prompt_len();
            req.push_output(prefilled.first_token, prefilled.first_logprob);
        }
        req.publish(None);
        req
    }

    pub fn id(&self) -> RequestId {
        self.request.id
    }

    pub fn record(&self) -> &SharedRequestRecord {
        &self.record
    }

    pub fn slots(&self) -> &[SlotIndex] {
        &self.slots
    }

    pub fn cur_kv_len(&self) -> usize {
        self.cur_kv_len
    }

    pub fn cur_output_len(&self) -> usize {
        self.cur_output_len
    }

    pub fn prompt_cursor(&self) -> usize {
        self.prompt_cursor
    }

    pub fn output_tokens(&self) -> &[TokenId] {
        &self.output_tokens
    }

    pub fn logprobs(&self) -> &[f32] {
        &self.logprobs
    }

    pub fn out_token_counts(&self) -> &HashMap<TokenId, usize> {
        &self.out_token_counts
    }

    pub fn finish_status(&self) -> FinishStatus {
        self.finish_status
    }

    pub fn is_finished(&self) -> bool {
        self.finish_status.is_finished()
    }

    /// Token fed by the next decode step
    pub fn last_output(&self) -> Option<TokenId> {
        self.output_tokens.last().copied()
    }

    /// Remaining prompt tokens not yet ingested
    pub fn remaining_prompt(&self) -> &[TokenId] {
        &self.request.prompt[self.prompt_cursor.min(self.request.prompt.len())..]
    }

    /// Account for cache written into `new_slots` by a completed step
    pub(crate) fn advance_cache(&mut self, new_slots: &[SlotIndex], prompt_tokens: usize) {
        self.slots.extend_from_slice(new_slots);
        self.cur_kv_len = self.slots.len();
        self.prompt_cursor += prompt_tokens;
    }

    fn push_output(&mut self, token: TokenId, logprob: f32) {
        self.output_tokens.push(token);
        self.logprobs.push(logprob);
        self.cur_output_len += 1;
        *self.out_token_counts.entry(token).or_insert(0) += 1;
    }

    /// Append a sampled token and evaluate the finish condition
    pub(crate) fn append_token(&mut self, token: TokenId, prob: f32, eos_ids: &[TokenId]) {
        self.push_output(token, prob.ln());
        let params = &self.request.sampling;
        let output_len = self.cur_output_len;
        let hit_eos = !params.ignore_eos
            && output_len >= params.min_new_tokens
            && eos_ids.contains(&token);
        let status = if hit_eos {
            FinishStatus::FinishedByEos
        } else if output_len >= params.max_new_tokens {
            FinishStatus::FinishedByLength
        } else {
            FinishStatus::NotFinished
        };
        self.finish(status);
    }

    /// Embedding requests count one output and finish after their single step
    pub(crate) fn complete_embedding(&mut self) {
        self.cur_output_len += 1;
        self.finish(FinishStatus::FinishedByLength);
    }

    pub(crate) fn abort(&mut self) {
        self.finish(FinishStatus::Aborted);
    }

    fn finish(&mut self, status: FinishStatus) {
        let finishing = status.is_finished() && !self.finish_status.is_finished();
        if finishing {
            self.finish_status = status;
        }
        self.publish(finishing.then_some(status));
    }

    /// Mirror volatile fields to the shared record
    pub(crate) fn publish(&self, finish: Option<FinishStatus>) {
        let cur_output_len = self.cur_output_len;
        self.record.publish(RecordUpdate {
            cur_kv_len: self.cur_kv_len,
            cur_output_len,
            finish: finish.map(|s| (cur_output_len.saturating_sub(1) as i64, s)),
            candidate_output_len: cur_output_len,
        });
    }
}
