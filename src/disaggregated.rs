//! Prefill/decode split serving
//!
//! A prefill instance runs prompts to their first token and parks them in
//! `Exporting`. Each step hands parked prompts to the decode instance: reserve
//! decode slots, gather the prompt cache into a staging pool, fan it out to
//! every card of the decode shard, then release both sides.

use crate::config::EmberConfig;
use crate::engine::{CycleSummary, RequestOutcome, ServingEngine};
use ember_interfaces::{ModelExecutor, Sampler};
use ember_kv::{HandleRegistry, HandleTable, MemoryPool};
use ember_scheduler::{ExportTicket, ImportTarget};
use ember_transfer::{TransferEngine, TransferLayout, TransferStats};
use ember_types::{EmberError, InferenceRequest, RequestId, Result, RunMode, SlotIndex};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Summary of one disaggregated step
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DisaggregatedSummary {
    pub prefill: CycleSummary,
    pub decode: CycleSummary,
    /// Prompts moved to the decode instance
    pub handed_off: usize,
    /// Tokens copied into decode shards
    pub transferred_tokens: usize,
}

/// A prefill instance and a decode instance joined by cache transfer
pub struct DisaggregatedEngine {
    prefill: ServingEngine,
    decode: ServingEngine,
    transfer: TransferEngine,
    staging: MemoryPool,
    registry: HandleRegistry,
    /// Decode-side handles, shard-major, as wire addresses
    import_wire: Vec<u64>,
    failures: HashMap<RequestId, RequestOutcome>,
}

impl DisaggregatedEngine {
    /// Build both instances.
    ///
    /// `prefill_config` must be in prefill mode and `decode_config` in decode
    /// mode; both must use the same cache layout.
    pub fn new(
        prefill_config: &EmberConfig,
        decode_config: &EmberConfig,
        executor: Arc<dyn ModelExecutor>,
        sampler: Arc<dyn Sampler>,
    ) -> Result<Self> {
        if prefill_config.router.run_mode != RunMode::Prefill {
            return Err(EmberError::config("prefill side must run in prefill mode"));
        }
        if decode_config.router.run_mode != RunMode::Decode {
            return Err(EmberError::config("decode side must run in decode mode"));
        }
        let (p, d) = (&prefill_config.kv_cache, &decode_config.kv_cache);
        if (p.head_num, p.head_dim, p.dtype) != (d.head_num, d.head_dim, d.dtype) {
            return Err(EmberError::config(
                "prefill and decode instances use different cache layouts",
            ));
        }

        let prefill = ServingEngine::new(prefill_config, executor.clone(), sampler.clone())?;
        let decode = ServingEngine::new(decode_config, executor, sampler)?;

        let layout = TransferLayout {
            export_shards: prefill.scheduler().shard_count(),
            import_shards: decode.scheduler().shard_count(),
            cards_per_shard: decode_config.parallel.cards_per_shard,
        };
        let transfer = TransferEngine::new(decode_config.transfer.clone(), layout)?;
        let staging = MemoryPool::new(
            prefill_config.router.max_req_total_len,
            &prefill_config.kv_cache,
            1,
        )?;

        let registry = HandleRegistry::new();
        let mut import_table = HandleTable::default();
        for shard in 0..decode.scheduler().shard_count() {
            let handles = decode
                .scheduler()
                .shard_handles(shard)
                .ok_or_else(|| EmberError::internal(format!("missing decode shard {}", shard)))?;
            for handle in handles.iter() {
                import_table.push(handle.clone());
            }
        }
        registry.register_all(import_table.iter());
        let import_wire = import_table.to_wire();

        info!(
            "Disaggregated serving: {} prefill shards -> {} decode shards x {} cards",
            layout.export_shards, layout.import_shards, layout.cards_per_shard
        );

        Ok(Self {
            prefill,
            decode,
            transfer,
            staging,
            registry,
            import_wire,
            failures: HashMap::new(),
        })
    }

    pub fn prefill(&self) -> &ServingEngine {
        &self.prefill
    }

    pub fn decode(&self) -> &ServingEngine {
        &self.decode
    }

    pub fn submit(&mut self, request: InferenceRequest) -> Result<()> {
        self.prefill.submit(request)?;
        Ok(())
    }

    pub async fn abort(&self, id: RequestId) -> bool {
        if self.decode.scheduler().request(id).is_some() {
            return self.decode.abort(id).await;
        }
        self.prefill.abort(id).await
    }

    pub fn is_idle(&self) -> bool {
        self.prefill.is_idle() && self.decode.is_idle()
    }

    /// Prefill step, hand-off, decode step
    pub async fn step(&mut self) -> Result<DisaggregatedSummary> {
        let prefill = self.prefill.step().await?;
        let (handed_off, transferred_tokens) = self.hand_off()?;
        let decode = self.decode.step().await?;
        Ok(DisaggregatedSummary {
            prefill,
            decode,
            handed_off,
            transferred_tokens,
        })
    }

    pub async fn run_until_idle(&mut self, max_cycles: u64) -> Result<u64> {
        let mut cycles = 0;
        while !self.is_idle() {
            if cycles == max_cycles {
                return Err(EmberError::scheduler(format!(
                    "still busy after {} cycles",
                    max_cycles
                )));
            }
            self.step().await?;
            cycles += 1;
        }
        Ok(cycles)
    }

    /// Final outcome; decode results win over prefill-side ones
    pub fn outcome(&self, id: RequestId) -> Option<&RequestOutcome> {
        self.decode
            .outcome(id)
            .or_else(|| self.failures.get(&id))
            .or_else(|| self.prefill.outcome(id))
    }

    /// Remove a request's outcome from both instances, preferring the decode one
    pub fn take_outcome(&mut self, id: RequestId) -> Option<RequestOutcome> {
        let decode = self.decode.take_outcome(id);
        let failure = self.failures.remove(&id);
        let prefill = self.prefill.take_outcome(id);
        decode.or(failure).or(prefill)
    }

    pub async fn shutdown(self) -> Result<()> {
        self.prefill.shutdown().await?;
        self.decode.shutdown().await
    }

    fn hand_off(&mut self) -> Result<(usize, usize)> {
        for id in self.prefill.scheduler().abandoned_transfers() {
            self.prefill
                .scheduler_mut()
                .cancel_transfer(id, "aborted before hand-off")?;
        }
        for id in self.decode.scheduler().abandoned_transfers() {
            self.decode
                .scheduler_mut()
                .cancel_transfer(id, "aborted before cache arrived")?;
        }

        let mut handed_off = 0;
        let mut tokens = 0;
        for ticket in self.prefill.scheduler().pending_exports() {
            let id = ticket.request.id;
            let aborted = self
                .prefill
                .records()
                .get(id)
                .map_or(false, |r| r.abort_requested());
            if aborted {
                self.prefill
                    .scheduler_mut()
                    .cancel_transfer(id, "aborted before hand-off")?;
                continue;
            }
            if ticket.slots.len() > self.staging.free_slots() {
                debug!("{} waits for staging space", id);
                break;
            }

            let target = match self
                .decode
                .admit_prefilled(ticket.request.clone(), ticket.prefilled.clone())
            {
                Ok(Some(target)) => target,
                Ok(None) => break,
                Err(err) => {
                    warn!("{} rejected by decode instance: {}", id, err);
                    self.prefill
                        .scheduler_mut()
                        .cancel_transfer(id, err.to_string())?;
                    self.failures.insert(
                        id,
                        RequestOutcome::Failed {
                            reason: err.to_string(),
                        },
                    );
                    continue;
                }
            };

            match self.relocate(&ticket, &target) {
                Ok(stats) => {
                    self.decode.scheduler_mut().mark_kv_ready(id)?;
                    self.prefill.scheduler_mut().complete_export(id)?;
                    handed_off += 1;
                    tokens += stats.tokens;
                }
                Err(err) => {
                    warn!("Cache transfer for {} failed: {}", id, err);
                    self.prefill
                        .scheduler_mut()
                        .cancel_transfer(id, err.to_string())?;
                    self.decode
                        .scheduler_mut()
                        .cancel_transfer(id, err.to_string())?;
                    self.failures.insert(
                        id,
                        RequestOutcome::Failed {
                            reason: err.to_string(),
                        },
                    );
                }
            }
        }
        Ok((handed_off, tokens))
    }

    /// Prefill shard -> staging pool -> every card of the decode shard
    fn relocate(&mut self, ticket: &ExportTicket, target: &ImportTarget) -> Result<TransferStats> {
        let token_num = ticket.slots.len();
        if target.slots.len() != token_num {
            return Err(EmberError::transfer_shape_mismatch(format!(
                "export of {} tokens into {} reserved slots",
                token_num,
                target.slots.len()
            )));
        }

        let staged = self.staging.reserve(token_num)?;
        let result = self.copy_through(ticket, target, &staged);
        self.staging.release(&staged)?;
        result
    }

    fn copy_through(
        &self,
        ticket: &ExportTicket,
        target: &ImportTarget,
        staged: &[SlotIndex],
    ) -> Result<TransferStats> {
        let staging = self.staging.handle(0)?;
        let export_table = (0..self.prefill.scheduler().shard_count())
            .map(|shard| {
                self.prefill
                    .scheduler()
                    .shard_handles(shard)
                    .and_then(|table| table.get(0).cloned())
                    .ok_or_else(|| EmberError::internal(format!("missing prefill shard {}", shard)))
            })
            .collect::<Result<HandleTable>>()?;
        let source_shards = vec![ticket.shard; ticket.slots.len()];
        self.transfer.export(
            &export_table,
            &ticket.slots,
            &source_shards,
            &staging,
            staged,
        )?;

        let import_table = HandleTable::from_wire(&self.import_wire, &self.registry)?;
        let destination_shards = vec![target.shard; target.slots.len()];
        self.transfer.import_fanout(
            &import_table,
            &target.slots,
            &destination_shards,
            &staging,
            staged,
        )
    }
}
