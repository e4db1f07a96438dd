//! Model executor abstraction.
//!
//! The forward pass is an external capability: given per-sequence inputs and the
//! slots holding their cache, it writes the new tokens' cache vectors and
//! returns either next-token logits or a pooled representation per sequence.

use crate::batch::StepKind;
use async_trait::async_trait;
use ember_kv::HandleTable;
use ember_types::{BatchId, RequestId, Result, ShardIndex, SlotIndex, TokenId};

/// Whether the step generates or embeds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Generate,
    Embed,
}

/// Per-sequence input of a step
#[derive(Debug, Clone)]
pub struct SequenceInput {
    pub request_id: RequestId,
    pub kind: StepKind,
    /// Tokens fed this step
    pub input_tokens: Vec<TokenId>,
    /// Slots receiving the cache of `input_tokens`
    pub input_slots: Vec<SlotIndex>,
    /// Every slot of the sequence's cache, in position order, including `input_slots`
    pub context_slots: Vec<SlotIndex>,
    /// Position of the first input token
    pub start_pos: usize,
    /// Whether the caller will sample this sequence's logits
    pub samples: bool,
}

impl SequenceInput {
    /// Sequence length after the step
    pub fn seq_len(&self) -> usize {
        self.start_pos + self.input_tokens.len()
    }
}

/// Everything the executor needs for one step
#[derive(Debug, Clone)]
pub struct StepDescriptor {
    pub batch_id: BatchId,
    pub shard: ShardIndex,
    pub mode: ExecutionMode,
    /// Cache buffers of the shard, one per card
    pub kv_cache: HandleTable,
    pub sequences: Vec<SequenceInput>,
}

impl StepDescriptor {
    pub fn total_input_tokens(&self) -> usize {
        self.sequences.iter().map(|s| s.input_tokens.len()).sum()
    }
}

/// Executor result, one row per sequence in descriptor order
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutorOutput {
    Logits(Vec<Vec<f32>>),
    Pooled(Vec<Vec<f32>>),
}

impl ExecutorOutput {
    pub fn rows(&self) -> usize {
        match self {
            ExecutorOutput::Logits(rows) | ExecutorOutput::Pooled(rows) => rows.len(),
        }
    }
}

/// Forward-pass capability
#[async_trait]
pub trait ModelExecutor: Send + Sync {
    /// Run one step; an error is fatal to the batch
    async fn execute(&self, step: &StepDescriptor) -> Result<ExecutorOutput>;

    /// Vocabulary size of the logits rows
    fn vocab_size(&self) -> usize;

    fn name(&self) -> &str {
        "model-executor"
    }
}
