//! Step execution for one shard's admitted requests

use crate::request::InferReq;
use ember_interfaces::{
    Batch, BatchEntry, ExecutionMode, ExecutorOutput, ModelExecutor, RequestStepResult, Sampler,
    SamplingRequest, SequenceInput, StepDescriptor, StepKind, StepReport,
};
use ember_kv::HandleTable;
use ember_types::{
    EmberError, RequestId, Result, RouterConfig, ShardIndex, SharedRecordTable, TokenId,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

/// Runs steps for the requests admitted to one shard.
///
/// Owns every [`InferReq`] on the shard and is the only writer of their shared
/// records while they are live here.
pub struct Backend {
    shard: ShardIndex,
    kv_cache: HandleTable,
    executor: Arc<dyn ModelExecutor>,
    sampler: Arc<dyn Sampler>,
    records: Arc<SharedRecordTable>,
    eos_ids: Vec<TokenId>,
    is_embedding: bool,
    requests: HashMap<RequestId, InferReq>,
    rng: StdRng,
}

impl Backend {
    pub fn new(
        shard: ShardIndex,
        kv_cache: HandleTable,
        executor: Arc<dyn ModelExecutor>,
        sampler: Arc<dyn Sampler>,
        records: Arc<SharedRecordTable>,
        router: &RouterConfig,
        seed: u64,
    ) -> Self {
        debug!(
            "Backend for shard {}: executor={}, sampler={}, cards={}",
            shard,
            executor.name(),
            sampler.name(),
            kv_cache.len()
        );
        Self {
            shard,
            kv_cache,
            executor,
            sampler,
            records,
            eos_ids: router.eos_ids.clone(),
            is_embedding: router.is_embedding,
            requests: HashMap::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn shard(&self) -> ShardIndex {
        self.shard
    }

    pub fn request(&self, id: RequestId) -> Option<&InferReq> {
        self.requests.get(&id)
    }

    pub fn live_requests(&self) -> usize {
        self.requests.len()
    }

    /// Raise the abort flag of a live request; seen at its next step
    pub fn signal_abort(&self, id: RequestId) -> bool {
        match self.requests.get(&id) {
            Some(req) => {
                req.record().request_abort();
                true
            }
            None => false,
        }
    }

    /// Execute one batch.
    ///
    /// Executor and sampler failures are returned as errors and are fatal to the
    /// batch; a single request's bad state only aborts that request.
    pub async fn step(&mut self, batch: &Batch) -> Result<StepReport> {
        for id in &batch.retired {
            if self.requests.remove(id).is_some() {
                trace!("Shard {} retired {}", self.shard, id);
            }
        }

        for admitted in &batch.admitted {
            let id = admitted.request.id;
            let record = self.records.get(id).ok_or_else(|| {
                EmberError::internal(format!("no shared record for admitted {}", id))
            })?;
            self.requests
                .insert(id, InferReq::new(admitted.clone(), record));
        }

        let mut report = StepReport {
            batch_id: batch.id,
            shard: self.shard,
            results: Vec::with_capacity(batch.entries.len()),
        };

        let mut active: Vec<&BatchEntry> = Vec::with_capacity(batch.entries.len());
        let mut sequences = Vec::with_capacity(batch.entries.len());
        for entry in &batch.entries {
            match self.prepare(entry) {
                Ok(seq) => {
                    active.push(entry);
                    sequences.push(seq);
                }
                Err(reason) => {
                    if let Some(result) = self.abort_request(entry, reason) {
                        report.results.push(result);
                    }
                }
            }
        }

        if sequences.is_empty() {
            return Ok(report);
        }

        let descriptor = StepDescriptor {
            batch_id: batch.id,
            shard: self.shard,
            mode: if self.is_embedding {
                ExecutionMode::Embed
            } else {
                ExecutionMode::Generate
            },
            kv_cache: self.kv_cache.clone(),
            sequences,
        };

        let output = self.executor.execute(&descriptor).await.map_err(|e| {
            error!("Model executor failed on batch {}: {}", batch.id, e);
            match e {
                EmberError::ModelExecutor { .. } => e,
                other => EmberError::model_executor(other.to_string()),
            }
        })?;

        if output.rows() != descriptor.sequences.len() {
            return Err(EmberError::model_executor(format!(
                "executor returned {} rows for {} sequences",
                output.rows(),
                descriptor.sequences.len()
            )));
        }

        for entry in &active {
            if let Some(req) = self.requests.get_mut(&entry.request_id) {
                let prompt_tokens = match entry.kind {
                    StepKind::Prefill => entry.input_tokens.len(),
                    StepKind::Decode => 0,
                };
                req.advance_cache(&entry.new_slots, prompt_tokens);
            }
        }

        match output {
            ExecutorOutput::Pooled(rows) => {
                if !self.is_embedding {
                    return Err(EmberError::model_executor(
                        "pooled output in generation mode",
                    ));
                }
                for (entry, row) in active.iter().zip(rows) {
                    if let Some(req) = self.requests.get_mut(&entry.request_id) {
                        req.complete_embedding();
                        let mut result = Self::result_of(req, entry.kind);
                        result.pooled = Some(row);
                        report.results.push(result);
                    }
                }
            }
            ExecutorOutput::Logits(rows) => {
                if self.is_embedding {
                    return Err(EmberError::model_executor("logits output in embedding mode"));
                }
                self.sample_and_update(&active, rows, &mut report)?;
            }
        }

        debug!(
            "Shard {} step {}: {} sequences, {} finished",
            self.shard,
            batch.id,
            active.len(),
            report.finished().count()
        );
        Ok(report)
    }

    /// Validate an entry against its request and build the executor input
    fn prepare(&self, entry: &BatchEntry) -> std::result::Result<SequenceInput, String> {
        let req = self
            .requests
            .get(&entry.request_id)
            .ok_or_else(|| format!("{} is not live on this shard", entry.request_id))?;
        if req.is_finished() {
            return Err(format!("{} already finished", entry.request_id));
        }
        if req.record().abort_requested() {
            return Err("abort requested".to_string());
        }

        let input_tokens = match entry.kind {
            StepKind::Prefill => {
                let remaining = req.remaining_prompt();
                if entry.input_tokens.is_empty()
                    || entry.input_tokens.len() != entry.new_slots.len()
                    || !remaining.starts_with(&entry.input_tokens)
                {
                    return Err("prefill chunk does not continue the prompt".to_string());
                }
                if entry.samples != (remaining.len() == entry.input_tokens.len()) {
                    return Err("prefill sampling flag disagrees with prompt progress".to_string());
                }
                entry.input_tokens.clone()
            }
            StepKind::Decode => {
                if entry.new_slots.len() != 1 || !req.remaining_prompt().is_empty() {
                    return Err("decode step before prompt was ingested".to_string());
                }
                let last = req
                    .last_output()
                    .ok_or_else(|| "decode step without a previous token".to_string())?;
                vec![last]
            }
        };

        let mut context_slots = req.slots().to_vec();
        context_slots.extend_from_slice(&entry.new_slots);
        Ok(SequenceInput {
            request_id: entry.request_id,
            kind: entry.kind,
            input_tokens,
            input_slots: entry.new_slots.clone(),
            context_slots,
            start_pos: req.cur_kv_len(),
            samples: entry.samples,
        })
    }

    fn abort_request(&mut self, entry: &BatchEntry, reason: String) -> Option<RequestStepResult> {
        let req = self.requests.get_mut(&entry.request_id);
        let Some(req) = req else {
            warn!("Shard {}: {}", self.shard, reason);
            return None;
        };
        if req.is_finished() {
            return None;
        }
        debug!("Shard {} aborting {}: {}", self.shard, entry.request_id, reason);
        req.abort();
        let mut result = Self::result_of(req, entry.kind);
        result.abort_reason = Some(reason);
        Some(result)
    }

    fn sample_and_update(
        &mut self,
        active: &[&BatchEntry],
        rows: Vec<Vec<f32>>,
        report: &mut StepReport,
    ) -> Result<()> {
        let mut sampled_ids = Vec::new();
        let mut sampled_rows = Vec::new();
        for (entry, row) in active.iter().zip(rows) {
            if entry.samples {
                sampled_ids.push(entry.request_id);
                sampled_rows.push(row);
            } else if let Some(req) = self.requests.get(&entry.request_id) {
                req.publish(None);
                report.results.push(Self::result_of(req, entry.kind));
            }
        }
        if sampled_ids.is_empty() {
            return Ok(());
        }

        let output = {
            let mut views = Vec::with_capacity(sampled_ids.len());
            for id in &sampled_ids {
                let req = self.requests.get(id).ok_or_else(|| {
                    EmberError::internal(format!("{} vanished during step", id))
                })?;
                views.push(SamplingRequest {
                    request_id: *id,
                    params: &req.request.sampling,
                    output_counts: req.out_token_counts(),
                    output_len: req.cur_output_len(),
                });
            }
            self.sampler
                .sample(&mut sampled_rows, &views, &self.eos_ids, &mut self.rng)?
        };

        if output.token_ids.len() != sampled_ids.len() || output.probs.len() != sampled_ids.len()
        {
            return Err(EmberError::internal(format!(
                "sampler returned {} tokens for {} requests",
                output.token_ids.len(),
                sampled_ids.len()
            )));
        }

        let vocab = self.executor.vocab_size();
        for (i, id) in sampled_ids.iter().enumerate() {
            let Some(entry) = active.iter().find(|e| e.request_id == *id) else {
                continue;
            };
            let token = output.token_ids[i];
            let prob = output.probs[i];
            let Some(req) = self.requests.get_mut(id) else {
                continue;
            };

            if usize::from(token) >= vocab || !prob.is_finite() || !(0.0..=1.0 + 1e-4).contains(&prob)
            {
                let reason = format!("bad sampling result token={} prob={}", token, prob);
                warn!("Shard {} {}: {}", self.shard, id, reason);
                req.abort();
                let mut result = Self::result_of(req, entry.kind);
                result.abort_reason = Some(reason);
                report.results.push(result);
                continue;
            }

            req.append_token(token, prob.min(1.0), &self.eos_ids);
            let mut result = Self::result_of(req, entry.kind);
            result.new_token = Some(token);
            result.logprob = req.logprobs().last().copied();
            report.results.push(result);
        }
        Ok(())
    }

    fn result_of(req: &InferReq, kind: StepKind) -> RequestStepResult {
        RequestStepResult {
            request_id: req.id(),
            kind,
            new_token: None,
            logprob: None,
            pooled: None,
            cur_kv_len: req.cur_kv_len(),
            cur_output_len: req.cur_output_len(),
            finish_status: req.finish_status(),
            abort_reason: None,
        }
    }
}
