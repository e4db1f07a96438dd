//! Scheduler-side view of a request

use ember_interfaces::PrefilledState;
use ember_types::{
    FinishStatus, InferenceRequest, RecordSnapshot, RequestId, ShardIndex, SharedRequestRecord,
    SlotIndex,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Where a request is in its life
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestState {
    /// Waiting for admission
    Queued,
    /// Admitted, prompt not fully ingested
    Prefill,
    /// Generating one token per cycle
    Running,
    /// Prompt cache ready to leave this instance
    Exporting,
    /// Export done; slots go back on the next cycle
    Exported,
    /// Slots reserved for an imported prompt cache that has not landed yet
    KvPending,
    Finished,
    Aborted,
}

impl RequestState {
    /// Counts against `running_max_req_size`
    pub fn is_active(self) -> bool {
        matches!(
            self,
            RequestState::Prefill | RequestState::Running | RequestState::KvPending
        )
    }

    /// Done from the scheduler's point of view, waiting only for release
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestState::Exported | RequestState::Finished | RequestState::Aborted
        )
    }
}

#[derive(Debug)]
pub struct ScheduledRequest {
    pub request: InferenceRequest,
    pub record: Arc<SharedRequestRecord>,
    pub state: RequestState,
    pub shard: Option<ShardIndex>,
    /// Cache slots in position order; the first `matched` belong to the prefix cache
    pub slots: Vec<SlotIndex>,
    pub matched: usize,
    /// Prompt tokens already covered by `slots`
    pub scheduled_prompt: usize,
    /// Outstanding cache transfers; release waits for zero
    pub pending_transfers: usize,
    /// Submission order
    pub seq: u64,
    /// Admission order, set once slots are first reserved
    pub admitted_at: Option<u64>,
    /// Whether a worker has been told about this request
    pub announced: bool,
    /// Part of a batch whose report has not come back
    pub in_flight: bool,
    pub prefilled: Option<PrefilledState>,
    pub finish_status: FinishStatus,
    pub abort_reason: Option<String>,
}

impl ScheduledRequest {
    pub fn new(request: InferenceRequest, record: Arc<SharedRequestRecord>, seq: u64) -> Self {
        Self {
            request,
            record,
            state: RequestState::Queued,
            shard: None,
            slots: Vec::new(),
            matched: 0,
            scheduled_prompt: 0,
            pending_transfers: 0,
            seq,
            admitted_at: None,
            announced: false,
            in_flight: false,
            prefilled: None,
            finish_status: FinishStatus::NotFinished,
            abort_reason: None,
        }
    }

    pub fn id(&self) -> RequestId {
        self.request.id
    }

    pub fn prompt_len(&self) -> usize {
        self.request.prompt_len()
    }

    pub fn remaining_prompt(&self) -> usize {
        self.prompt_len().saturating_sub(self.scheduled_prompt)
    }

    /// Slots this request may still reserve.
    ///
    /// Remaining prompt plus the decode steps left before the capped length.
    /// A request that has sampled nothing yet counts its first token as free,
    /// since it comes from the last prefill chunk.
    pub fn future_need(&self, max_new_cap: usize, generates: bool) -> usize {
        let decode = if generates {
            let m_eff = self.request.sampling.max_new_tokens.min(max_new_cap);
            m_eff.saturating_sub(self.record.cur_output_len().max(1))
        } else {
            0
        };
        self.remaining_prompt() + decode
    }

    /// Slots the request holds at its peak when nothing is shared
    pub fn peak_footprint(&self, max_new_cap: usize, generates: bool) -> usize {
        peak_footprint(&self.request, max_new_cap, generates)
    }
}

/// Whole prompt plus every decode step up to the capped length; the last
/// sampled token is never fed back and needs no slot
pub fn peak_footprint(request: &InferenceRequest, max_new_cap: usize, generates: bool) -> usize {
    let decode = if generates {
        request
            .sampling
            .max_new_tokens
            .min(max_new_cap)
            .saturating_sub(1)
    } else {
        0
    };
    request.prompt_len() + decode
}

/// Final word on a request once its slots are back in the pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub request_id: RequestId,
    pub status: FinishStatus,
    /// Record as it stood at release
    pub snapshot: RecordSnapshot,
    pub reason: Option<String>,
    /// Handed to a decode instance instead of finishing here
    pub exported: bool,
}

/// Prompt cache ready to be shipped to a decode instance
#[derive(Debug, Clone)]
pub struct ExportTicket {
    pub request: InferenceRequest,
    pub shard: ShardIndex,
    /// Prompt slots in position order
    pub slots: Vec<SlotIndex>,
    pub prefilled: PrefilledState,
}

/// Slots reserved on a decode instance for an incoming prompt cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportTarget {
    pub request_id: RequestId,
    pub shard: ShardIndex,
    pub slots: Vec<SlotIndex>,
}
