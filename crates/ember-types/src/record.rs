//! Cross-process projection of a request's volatile fields.
//!
//! One writer (the backend during the request's own step) publishes lengths and
//! finish state; any number of readers poll without locks. Correctness rests on
//! the store order in [`SharedRequestRecord::publish`]:
//!
//! 1. `cur_kv_len`
//! 2. `cur_output_len`
//! 3. if finishing: `finish_token_index`, then `finish_status`
//! 4. `candidate_output_len`
//!
//! Every store is `Release` and [`SharedRequestRecord::snapshot`] loads the status
//! first with `Acquire`, so a reader that sees a finished status also sees the
//! index and lengths written before it.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use crate::{EmberError, FinishStatus, RequestId, Result};

/// Sentinel for an unset finish index
pub const FINISH_INDEX_UNSET: i64 = -1;

/// Fixed-layout shared request record
#[derive(Debug)]
#[repr(C)]
pub struct SharedRequestRecord {
    request_id: u64,
    cur_kv_len: AtomicU64,
    cur_output_len: AtomicU64,
    finish_token_index: AtomicI64,
    finish_status: AtomicU8,
    aborted: AtomicBool,
    candidate_output_len: AtomicU64,
}

/// Values to publish after one step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordUpdate {
    pub cur_kv_len: usize,
    pub cur_output_len: usize,
    /// `(finish_token_index, status)` when the request finishes in this step
    pub finish: Option<(i64, FinishStatus)>,
    pub candidate_output_len: usize,
}

/// Point-in-time view of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordSnapshot {
    pub request_id: RequestId,
    pub cur_kv_len: usize,
    pub cur_output_len: usize,
    pub finish_token_index: i64,
    pub finish_status: FinishStatus,
    pub candidate_output_len: usize,
    pub aborted: bool,
}

impl SharedRequestRecord {
    pub fn new(request_id: RequestId) -> Self {
        Self {
            request_id: request_id.get(),
            cur_kv_len: AtomicU64::new(0),
            cur_output_len: AtomicU64::new(0),
            finish_token_index: AtomicI64::new(FINISH_INDEX_UNSET),
            finish_status: AtomicU8::new(FinishStatus::NotFinished.as_u8()),
            aborted: AtomicBool::new(false),
            candidate_output_len: AtomicU64::new(0),
        }
    }

    pub fn request_id(&self) -> RequestId {
        RequestId::new(self.request_id)
    }

    /// Publish one step's results in the mandated order
    pub fn publish(&self, update: RecordUpdate) {
        self.cur_kv_len
            .store(update.cur_kv_len as u64, Ordering::Release);
        self.cur_output_len
            .store(update.cur_output_len as u64, Ordering::Release);
        if let Some((index, status)) = update.finish {
            self.finish_token_index.store(index, Ordering::Release);
            self.finish_status.store(status.as_u8(), Ordering::Release);
        }
        self.candidate_output_len
            .store(update.candidate_output_len as u64, Ordering::Release);
    }

    /// Finalize as aborted without advancing lengths.
    ///
    /// Only valid while no step for this request is in flight.
    pub fn publish_abort(&self) {
        let output_len = self.cur_output_len();
        self.publish(RecordUpdate {
            cur_kv_len: self.cur_kv_len(),
            cur_output_len: output_len,
            finish: Some((
                output_len.saturating_sub(1) as i64,
                FinishStatus::Aborted,
            )),
            candidate_output_len: output_len,
        });
    }

    /// Flip the abort flag; observed by the backend at the start of the next step
    pub fn request_abort(&self) {
        self.aborted.store(true, Ordering::Release);
    }

    pub fn abort_requested(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    pub fn finish_status(&self) -> FinishStatus {
        FinishStatus::from_u8(self.finish_status.load(Ordering::Acquire))
    }

    pub fn is_finished(&self) -> bool {
        self.finish_status().is_finished()
    }

    pub fn cur_kv_len(&self) -> usize {
        self.cur_kv_len.load(Ordering::Acquire) as usize
    }

    pub fn cur_output_len(&self) -> usize {
        self.cur_output_len.load(Ordering::Acquire) as usize
    }

    /// Read all fields, status first
    pub fn snapshot(&self) -> RecordSnapshot {
        let finish_status = self.finish_status();
        let finish_token_index = self.finish_token_index.load(Ordering::Acquire);
        let candidate_output_len = self.candidate_output_len.load(Ordering::Acquire) as usize;
        let cur_output_len = self.cur_output_len.load(Ordering::Acquire) as usize;
        let cur_kv_len = self.cur_kv_len.load(Ordering::Acquire) as usize;
        RecordSnapshot {
            request_id: self.request_id(),
            cur_kv_len,
            cur_output_len,
            finish_token_index,
            finish_status,
            candidate_output_len,
            aborted: self.abort_requested(),
        }
    }
}

impl RecordSnapshot {
    /// A finished snapshot carries a set index and an output length covering it
    pub fn is_consistent(&self) -> bool {
        if !self.finish_status.is_finished() {
            return true;
        }
        if self.finish_token_index == FINISH_INDEX_UNSET {
            return false;
        }
        if self.cur_output_len == 0 {
            return self.finish_status.is_aborted() && self.finish_token_index == 0;
        }
        (self.finish_token_index as usize) < self.cur_output_len
    }
}

/// Table of live records, shared between scheduler, workers and output readers
#[derive(Debug, Default)]
pub struct SharedRecordTable {
    records: DashMap<RequestId, Arc<SharedRequestRecord>>,
}

impl SharedRecordTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a record for a new request
    pub fn create(&self, request_id: RequestId) -> Result<Arc<SharedRequestRecord>> {
        if self.records.contains_key(&request_id) {
            return Err(EmberError::malformed_request(format!(
                "duplicate request id {}",
                request_id
            )));
        }
        let record = Arc::new(SharedRequestRecord::new(request_id));
        self.records.insert(request_id, record.clone());
        Ok(record)
    }

    pub fn get(&self, request_id: RequestId) -> Option<Arc<SharedRequestRecord>> {
        self.records.get(&request_id).map(|r| r.value().clone())
    }

    /// Signal abort for a request; false if no such record
    pub fn abort(&self, request_id: RequestId) -> bool {
        match self.records.get(&request_id) {
            Some(record) => {
                record.request_abort();
                true
            }
            None => false,
        }
    }

    /// Drop a record once its request is fully resolved
    pub fn retire(&self, request_id: RequestId) -> Option<Arc<SharedRequestRecord>> {
        self.records.remove(&request_id).map(|(_, r)| r)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
