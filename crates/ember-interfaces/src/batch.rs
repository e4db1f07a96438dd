//! Batch plans handed from the scheduler to a backend worker

use ember_types::{
    BatchId, FinishStatus, InferenceRequest, RequestId, ShardIndex, SlotIndex, TokenId,
};
use serde::{Deserialize, Serialize};

/// Kind of work one request does in a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepKind {
    /// Ingest a chunk of prompt tokens
    Prefill,
    /// Feed back the last output token
    Decode,
}

/// One request's share of a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchEntry {
    pub request_id: RequestId,
    pub kind: StepKind,
    /// Prompt tokens of this chunk; empty for decode
    pub input_tokens: Vec<TokenId>,
    /// Freshly reserved slots receiving this step's cache, one per input token
    pub new_slots: Vec<SlotIndex>,
    /// Whether the step produces an output token (decode, or the final prefill chunk)
    pub samples: bool,
}

impl BatchEntry {
    pub fn prefill_chunk(
        request_id: RequestId,
        input_tokens: Vec<TokenId>,
        new_slots: Vec<SlotIndex>,
        last_chunk: bool,
    ) -> Self {
        Self {
            request_id,
            kind: StepKind::Prefill,
            input_tokens,
            new_slots,
            samples: last_chunk,
        }
    }

    pub fn decode(request_id: RequestId, slot: SlotIndex) -> Self {
        Self {
            request_id,
            kind: StepKind::Decode,
            input_tokens: Vec::new(),
            new_slots: vec![slot],
            samples: true,
        }
    }

    /// Tokens this entry charges against the step budget
    pub fn token_cost(&self) -> usize {
        self.new_slots.len()
    }
}

/// Prompt cache computed elsewhere and imported into this shard
#[derive(Debug, Clone, PartialEq)]
pub struct PrefilledState {
    pub first_token: TokenId,
    pub first_logprob: f32,
}

/// Request entering a worker with this batch
#[derive(Debug, Clone)]
pub struct AdmittedRequest {
    pub request: InferenceRequest,
    /// Slots whose cache is already valid (prefix hit or imported prompt)
    pub cached_slots: Vec<SlotIndex>,
    /// Set when the prompt was prefilled by a partner instance
    pub prefilled: Option<PrefilledState>,
}

/// Work for one shard in one scheduler cycle
#[derive(Debug, Clone)]
pub struct Batch {
    pub id: BatchId,
    pub shard: ShardIndex,
    /// Requests the worker has not seen before
    pub admitted: Vec<AdmittedRequest>,
    pub entries: Vec<BatchEntry>,
    /// Requests the worker should forget
    pub retired: Vec<RequestId>,
}

impl Batch {
    pub fn new(shard: ShardIndex) -> Self {
        Self {
            id: BatchId::new(),
            shard,
            admitted: Vec::new(),
            entries: Vec::new(),
            retired: Vec::new(),
        }
    }

    pub fn total_tokens(&self) -> usize {
        self.entries.iter().map(BatchEntry::token_cost).sum()
    }

    pub fn prefill_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.kind == StepKind::Prefill)
            .count()
    }

    pub fn decode_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.kind == StepKind::Decode)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Nothing to run and nothing to tell the worker
    pub fn is_noop(&self) -> bool {
        self.entries.is_empty() && self.admitted.is_empty() && self.retired.is_empty()
    }
}

/// Outcome of one request in one step
#[derive(Debug, Clone, PartialEq)]
pub struct RequestStepResult {
    pub request_id: RequestId,
    pub kind: StepKind,
    /// Token sampled this step, if any
    pub new_token: Option<TokenId>,
    pub logprob: Option<f32>,
    /// Pooled representation in embedding mode
    pub pooled: Option<Vec<f32>>,
    pub cur_kv_len: usize,
    pub cur_output_len: usize,
    pub finish_status: FinishStatus,
    /// Why the request was aborted inside this step
    pub abort_reason: Option<String>,
}

/// Results of one batch
#[derive(Debug, Clone, PartialEq)]
pub struct StepReport {
    pub batch_id: BatchId,
    pub shard: ShardIndex,
    pub results: Vec<RequestStepResult>,
}

impl StepReport {
    pub fn result(&self, request_id: RequestId) -> Option<&RequestStepResult> {
        self.results.iter().find(|r| r.request_id == request_id)
    }

    pub fn finished(&self) -> impl Iterator<Item = &RequestStepResult> {
        self.results.iter().filter(|r| r.finish_status.is_finished())
    }
}
