//! Sampling interfaces and the built-in samplers.
//!
//! A sampler turns one logits row per request into a token id and the
//! probability it was chosen with. Rows that cannot be sampled (non-finite
//! values everywhere) yield a NaN probability; the backend treats that as a
//! per-request anomaly rather than failing the batch.

use ember_types::{EmberError, RequestId, Result, SamplingParams, TokenId};
use rand::distributions::{Distribution, WeightedIndex};
use rand::RngCore;
use std::collections::HashMap;
use tracing::debug;

/// Per-request view passed to the sampler
#[derive(Debug, Clone, Copy)]
pub struct SamplingRequest<'a> {
    pub request_id: RequestId,
    pub params: &'a SamplingParams,
    /// Counts of tokens emitted so far
    pub output_counts: &'a HashMap<TokenId, usize>,
    /// Tokens emitted so far
    pub output_len: usize,
}

/// Sampled tokens and their probabilities, one per request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SampleOutput {
    pub token_ids: Vec<TokenId>,
    pub probs: Vec<f32>,
}

/// Token sampler
pub trait Sampler: Send + Sync {
    /// Sample one token per row; `logits` may be modified in place
    fn sample(
        &self,
        logits: &mut [Vec<f32>],
        requests: &[SamplingRequest<'_>],
        eos_token_ids: &[TokenId],
        rng: &mut dyn RngCore,
    ) -> Result<SampleOutput>;

    fn name(&self) -> &str;
}

/// Apply repetition, frequency and presence penalties from output counts
pub fn apply_penalties(logits: &mut [f32], request: &SamplingRequest<'_>) {
    let params = request.params;
    for (&token, &count) in request.output_counts {
        let Some(logit) = logits.get_mut(usize::from(token)) else {
            continue;
        };
        if params.repetition_penalty != 1.0 {
            if *logit > 0.0 {
                *logit /= params.repetition_penalty;
            } else {
                *logit *= params.repetition_penalty;
            }
        }
        *logit -= params.frequency_penalty * count as f32 + params.presence_penalty;
    }
}

/// Suppress end-of-sequence tokens until `min_new_tokens` is reached
pub fn mask_eos(logits: &mut [f32], request: &SamplingRequest<'_>, eos_token_ids: &[TokenId]) {
    if request.output_len + 1 < request.params.min_new_tokens {
        for &eos in eos_token_ids {
            if let Some(logit) = logits.get_mut(usize::from(eos)) {
                *logit = f32::NEG_INFINITY;
            }
        }
    }
}

/// Numerically stable softmax
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits
        .iter()
        .copied()
        .filter(|v| !v.is_nan())
        .fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return vec![f32::NAN; logits.len()];
    }
    let exps: Vec<f32> = logits.iter().map(|&v| (v - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

fn argmax(values: &[f32]) -> usize {
    values
        .iter()
        .enumerate()
        .filter(|(_, v)| !v.is_nan())
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i)
        .unwrap_or(0)
}

fn check_rows(logits: &[Vec<f32>], requests: &[SamplingRequest<'_>]) -> Result<()> {
    if logits.len() != requests.len() {
        return Err(EmberError::internal(format!(
            "sampler got {} logits rows for {} requests",
            logits.len(),
            requests.len()
        )));
    }
    Ok(())
}

fn greedy_row(row: &[f32]) -> (TokenId, f32) {
    let probs = softmax(row);
    let idx = argmax(&probs);
    (TokenId::new(idx as u32), probs.get(idx).copied().unwrap_or(f32::NAN))
}

/// Greedy sampler - always picks the most probable token
#[derive(Debug, Default, Clone)]
pub struct GreedySampler;

impl Sampler for GreedySampler {
    fn sample(
        &self,
        logits: &mut [Vec<f32>],
        requests: &[SamplingRequest<'_>],
        eos_token_ids: &[TokenId],
        _rng: &mut dyn RngCore,
    ) -> Result<SampleOutput> {
        check_rows(logits, requests)?;
        let mut out = SampleOutput::default();
        for (row, request) in logits.iter_mut().zip(requests) {
            apply_penalties(row, request);
            mask_eos(row, request, eos_token_ids);
            let (token, prob) = greedy_row(row);
            if prob.is_nan() {
                debug!("No samplable logits for {}", request.request_id);
            }
            out.token_ids.push(token);
            out.probs.push(prob);
        }
        Ok(out)
    }

    fn name(&self) -> &str {
        "greedy"
    }
}

/// Temperature / top-k / top-p multinomial sampler.
///
/// Falls back to greedy for requests whose params are greedy.
#[derive(Debug, Default, Clone)]
pub struct MultinomialSampler;

impl MultinomialSampler {
    fn sample_row(
        row: &mut [f32],
        params: &SamplingParams,
        rng: &mut dyn RngCore,
    ) -> (TokenId, f32) {
        for v in row.iter_mut() {
            *v /= params.temperature;
        }
        let mut probs = softmax(row);
        if probs.iter().any(|p| p.is_nan()) {
            return (TokenId::new(0), f32::NAN);
        }

        let mut order: Vec<usize> = (0..probs.len()).collect();
        order.sort_by(|&a, &b| probs[b].total_cmp(&probs[a]));

        let mut keep = order.len();
        if let Some(k) = params.top_k {
            keep = keep.min(k);
        }
        if params.top_p < 1.0 {
            let mut cumulative = 0.0f32;
            for (rank, &idx) in order.iter().enumerate().take(keep) {
                cumulative += probs[idx];
                if cumulative >= params.top_p {
                    keep = rank + 1;
                    break;
                }
            }
        }
        for &idx in &order[keep..] {
            probs[idx] = 0.0;
        }
        let total: f32 = probs.iter().sum();
        for p in probs.iter_mut() {
            *p /= total;
        }

        match WeightedIndex::new(&probs) {
            Ok(dist) => {
                let idx = dist.sample(rng);
                (TokenId::new(idx as u32), probs[idx])
            }
            Err(_) => (TokenId::new(0), f32::NAN),
        }
    }
}

impl Sampler for MultinomialSampler {
    fn sample(
        &self,
        logits: &mut [Vec<f32>],
        requests: &[SamplingRequest<'_>],
        eos_token_ids: &[TokenId],
        rng: &mut dyn RngCore,
    ) -> Result<SampleOutput> {
        check_rows(logits, requests)?;
        let mut out = SampleOutput::default();
        for (row, request) in logits.iter_mut().zip(requests) {
            apply_penalties(row, request);
            mask_eos(row, request, eos_token_ids);
            let (token, prob) = if request.params.is_greedy() {
                greedy_row(row)
            } else {
                Self::sample_row(row, request.params, rng)
            };
            if prob.is_nan() {
                debug!("No samplable logits for {}", request.request_id);
            }
            out.token_ids.push(token);
            out.probs.push(prob);
        }
        Ok(out)
    }

    fn name(&self) -> &str {
        "multinomial"
    }
}
