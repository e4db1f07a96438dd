//! Deterministic executor for exercising the core without a model.
//!
//! Writes a recognisable byte pattern into every card at each input slot and
//! emits one-hot logits for tokens scripted per request.

use crate::model_executor::{ExecutionMode, ExecutorOutput, ModelExecutor, StepDescriptor};
use async_trait::async_trait;
use ember_types::{EmberError, RequestId, Result, TokenId};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{trace, warn};

/// Byte pattern the scripted executor stores for `(request, position)`
pub fn pattern_vector(request_id: RequestId, position: usize, bytes: usize) -> Vec<u8> {
    (0..bytes)
        .map(|i| {
            (request_id.get() as usize)
                .wrapping_mul(31)
                .wrapping_add(position.wrapping_mul(7))
                .wrapping_add(i) as u8
        })
        .collect()
}

/// Scripted model executor
#[derive(Debug)]
pub struct ScriptedExecutor {
    vocab_size: usize,
    default_token: TokenId,
    pooled_dim: usize,
    scripts: Mutex<HashMap<RequestId, VecDeque<TokenId>>>,
    overrides: Mutex<HashMap<RequestId, Vec<f32>>>,
    fail_on_call: Mutex<Option<usize>>,
    calls: AtomicUsize,
}

impl ScriptedExecutor {
    pub fn new(vocab_size: usize) -> Self {
        Self {
            vocab_size,
            default_token: TokenId::new(1),
            pooled_dim: 4,
            scripts: Mutex::new(HashMap::new()),
            overrides: Mutex::new(HashMap::new()),
            fail_on_call: Mutex::new(None),
            calls: AtomicUsize::new(0),
        }
    }

    /// Token emitted once a request's script runs out
    pub fn with_default_token(mut self, token: TokenId) -> Self {
        self.default_token = token;
        self
    }

    /// Queue the tokens a request will produce, in order
    pub fn script(&self, request_id: RequestId, tokens: impl IntoIterator<Item = TokenId>) {
        self.scripts
            .lock()
            .entry(request_id)
            .or_default()
            .extend(tokens);
    }

    /// Return this raw logits row for the request's next sampled step
    pub fn override_logits(&self, request_id: RequestId, row: Vec<f32>) {
        self.overrides.lock().insert(request_id, row);
    }

    /// Fail the `n`-th call to `execute` (1-based)
    pub fn fail_on_call(&self, n: usize) {
        *self.fail_on_call.lock() = Some(n);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn one_hot(&self, token: TokenId) -> Vec<f32> {
        let mut row = vec![0.0; self.vocab_size];
        if let Some(v) = row.get_mut(usize::from(token)) {
            *v = 20.0;
        }
        row
    }
}

#[async_trait]
impl ModelExecutor for ScriptedExecutor {
    async fn execute(&self, step: &StepDescriptor) -> Result<ExecutorOutput> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if *self.fail_on_call.lock() == Some(call) {
            warn!("Scripted executor failing call {}", call);
            return Err(EmberError::model_executor(format!(
                "scripted failure on call {}",
                call
            )));
        }

        trace!(
            "Scripted call {}: {} sequences, mode={:?}",
            call,
            step.sequences.len(),
            step.mode
        );
        for seq in &step.sequences {
            for (offset, &slot) in seq.input_slots.iter().enumerate() {
                for handle in step.kv_cache.iter() {
                    let storage = handle.storage();
                    let bytes = storage.shape().vector_bytes();
                    storage.write_slot(
                        slot,
                        &pattern_vector(seq.request_id, seq.start_pos + offset, bytes),
                    )?;
                }
            }
        }

        match step.mode {
            ExecutionMode::Embed => Ok(ExecutorOutput::Pooled(
                step.sequences
                    .iter()
                    .map(|s| vec![s.seq_len() as f32; self.pooled_dim])
                    .collect(),
            )),
            ExecutionMode::Generate => {
                let mut scripts = self.scripts.lock();
                let mut overrides = self.overrides.lock();
                let rows = step
                    .sequences
                    .iter()
                    .map(|seq| {
                        if !seq.samples {
                            return vec![0.0; self.vocab_size];
                        }
                        if let Some(row) = overrides.remove(&seq.request_id) {
                            return row;
                        }
                        let token = scripts
                            .get_mut(&seq.request_id)
                            .and_then(VecDeque::pop_front)
                            .unwrap_or(self.default_token);
                        self.one_hot(token)
                    })
                    .collect();
                Ok(ExecutorOutput::Logits(rows))
            }
        }
    }

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
