//! Inference request type

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{EmberError, Priority, RequestId, Result, SamplingParams, TokenId};

/// A generation (or embedding) request as submitted to the scheduler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceRequest {
    /// Request identifier; also keys the shared record
    pub id: RequestId,
    /// Prompt token ids
    pub prompt: Vec<TokenId>,
    /// Sampling configuration
    pub sampling: SamplingParams,
    /// Scheduling priority
    pub priority: Priority,
    /// Submission timestamp
    pub created_at: DateTime<Utc>,
}

impl InferenceRequest {
    pub fn new(id: RequestId, prompt: Vec<TokenId>, sampling: SamplingParams) -> Self {
        Self {
            id,
            prompt,
            sampling,
            priority: Priority::Normal,
            created_at: Utc::now(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn prompt_len(&self) -> usize {
        self.prompt.len()
    }

    /// Validate against the configured total length limit
    pub fn validate(&self, max_req_total_len: usize) -> Result<()> {
        if self.prompt.is_empty() {
            return Err(EmberError::malformed_request(format!(
                "{} has an empty prompt",
                self.id
            )));
        }
        self.sampling.validate()?;
        let total = self.prompt.len() + self.sampling.max_new_tokens;
        if total > max_req_total_len {
            return Err(EmberError::malformed_request(format!(
                "{}: prompt ({}) + max_new_tokens ({}) exceeds max_req_total_len {}",
                self.id,
                self.prompt.len(),
                self.sampling.max_new_tokens,
                max_req_total_len
            )));
        }
        Ok(())
    }
}
