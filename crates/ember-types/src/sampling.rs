//! Sampling parameters, request priority and finish status

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{EmberError, Result};

/// Sampling parameters for generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    /// Maximum number of tokens to generate
    pub max_new_tokens: usize,
    /// Minimum number of tokens before an end-of-sequence token may be sampled
    pub min_new_tokens: usize,
    /// Temperature for randomness (0.0 = greedy)
    pub temperature: f32,
    /// Nucleus sampling probability threshold
    pub top_p: f32,
    /// Top-k sampling - consider only top k tokens
    pub top_k: Option<usize>,
    /// Repetition penalty applied to tokens already emitted
    pub repetition_penalty: f32,
    /// Presence penalty for token diversity
    pub presence_penalty: f32,
    /// Frequency penalty based on output-token counts
    pub frequency_penalty: f32,
    /// Keep generating through end-of-sequence tokens
    pub ignore_eos: bool,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            max_new_tokens: 16,
            min_new_tokens: 1,
            temperature: 1.0,
            top_p: 1.0,
            top_k: None,
            repetition_penalty: 1.0,
            presence_penalty: 0.0,
            frequency_penalty: 0.0,
            ignore_eos: false,
        }
    }
}

impl SamplingParams {
    /// Greedy decoding with the given generation limit
    pub fn greedy(max_new_tokens: usize) -> Self {
        Self {
            max_new_tokens,
            temperature: 0.0,
            ..Default::default()
        }
    }

    /// Whether sampling degenerates to argmax
    pub fn is_greedy(&self) -> bool {
        self.temperature == 0.0 || self.top_k == Some(1)
    }

    /// Validate sampling parameters
    pub fn validate(&self) -> Result<()> {
        if self.max_new_tokens == 0 {
            return Err(EmberError::malformed_request(
                "max_new_tokens must be positive",
            ));
        }
        if self.min_new_tokens > self.max_new_tokens {
            return Err(EmberError::malformed_request(
                "min_new_tokens must not exceed max_new_tokens",
            ));
        }
        if !(self.temperature >= 0.0) {
            return Err(EmberError::malformed_request(
                "temperature must be non-negative",
            ));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(EmberError::malformed_request("top_p must be in range (0, 1]"));
        }
        if self.top_k == Some(0) {
            return Err(EmberError::malformed_request("top_k must be positive"));
        }
        if !(self.repetition_penalty > 0.0) {
            return Err(EmberError::malformed_request(
                "repetition_penalty must be positive",
            ));
        }
        Ok(())
    }
}

/// Request priority levels
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Finish status tag published through the shared record.
///
/// The discriminants are the on-record encoding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FinishStatus {
    #[default]
    NotFinished = 0,
    FinishedByEos = 1,
    FinishedByLength = 2,
    Aborted = 3,
}

impl FinishStatus {
    pub fn is_finished(self) -> bool {
        self != FinishStatus::NotFinished
    }

    pub fn is_aborted(self) -> bool {
        self == FinishStatus::Aborted
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Decode the record encoding; unknown values are treated as aborted
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => FinishStatus::NotFinished,
            1 => FinishStatus::FinishedByEos,
            2 => FinishStatus::FinishedByLength,
            _ => FinishStatus::Aborted,
        }
    }
}

impl fmt::Display for FinishStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FinishStatus::NotFinished => "NOT_FINISHED",
            FinishStatus::FinishedByEos => "FINISHED_BY_EOS",
            FinishStatus::FinishedByLength => "FINISHED_BY_LENGTH",
            FinishStatus::Aborted => "ABORTED",
        };
        f.write_str(s)
    }
}
