//! Validated bulk KV relocation between pools

use crate::kernel::{self, CopyJob};
use ember_kv::{HandleTable, MemoryHandle};
use ember_types::{EmberError, Result, ShardIndex, SlotIndex, TransferConfig};
use rayon::{ThreadPool, ThreadPoolBuilder};
use smallvec::SmallVec;
use std::time::Instant;
use tracing::{debug, trace};

/// Counters for one transfer call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    /// Tokens relocated
    pub tokens: usize,
    /// Destination vectors written (tokens × fan-out)
    pub vector_writes: usize,
    /// Bytes stored
    pub bytes: usize,
}

/// Expected handle-table sizes on both sides of a prefill/decode link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferLayout {
    /// Source shards an export reads from
    pub export_shards: usize,
    /// Destination shards an import fans out to
    pub import_shards: usize,
    /// Cards backing each destination shard
    pub cards_per_shard: usize,
}

/// Relocates per-token cache vectors using a fixed set of copy workers.
///
/// Calls block until the copy completes. Every shape check happens before any
/// storage is touched.
pub struct TransferEngine {
    config: TransferConfig,
    layout: TransferLayout,
    workers: ThreadPool,
}

impl TransferEngine {
    pub fn new(config: TransferConfig, layout: TransferLayout) -> Result<Self> {
        config.validate()?;
        if layout.export_shards == 0 || layout.import_shards == 0 || layout.cards_per_shard == 0 {
            return Err(EmberError::config("transfer layout counts must be positive"));
        }
        let workers = ThreadPoolBuilder::new()
            .num_threads(config.worker_count)
            .thread_name(|i| format!("kv-copy-{}", i))
            .build()
            .map_err(|e| EmberError::internal(format!("failed to build copy pool: {}", e)))?;
        debug!(
            "Transfer engine: workers={}, tile_elems={}, stages={}, layout={:?}",
            config.worker_count, config.tile_elems, config.num_stages, layout
        );
        Ok(Self {
            config,
            layout,
            workers,
        })
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    pub fn layout(&self) -> TransferLayout {
        self.layout
    }

    /// Copy token vectors from per-shard source pools into one destination pool.
    ///
    /// Token `i` moves from `source_table[source_shards[i]]` slot
    /// `source_slots[i]` to `destination` slot `destination_slots[i]`.
    pub fn export(
        &self,
        source_table: &HandleTable,
        source_slots: &[SlotIndex],
        source_shards: &[ShardIndex],
        destination: &MemoryHandle,
        destination_slots: &[SlotIndex],
    ) -> Result<TransferStats> {
        let token_num = source_slots.len();
        check_lengths(
            token_num,
            &[
                ("source_shards", source_shards.len()),
                ("destination_slots", destination_slots.len()),
            ],
        )?;
        if token_num == 0 {
            return Ok(TransferStats::default());
        }
        if source_table.len() != self.layout.export_shards {
            return Err(EmberError::transfer_shape_mismatch(format!(
                "export handle table has {} entries, expected {} shards",
                source_table.len(),
                self.layout.export_shards
            )));
        }
        check_layouts(source_table, destination)?;
        check_slots(destination, destination_slots)?;

        let mut jobs = Vec::with_capacity(token_num);
        for i in 0..token_num {
            let shard = source_shards[i];
            let source = source_table.get(shard).ok_or_else(|| {
                EmberError::malformed_request(format!(
                    "source shard index {} outside table of {}",
                    shard,
                    source_table.len()
                ))
            })?;
            check_slot(source, source_slots[i])?;
            let mut dsts = SmallVec::new();
            dsts.push((destination.storage(), destination_slots[i]));
            jobs.push(CopyJob {
                src: source.storage(),
                src_slot: source_slots[i],
                dsts,
            });
        }

        Ok(self.launch("export", &jobs))
    }

    /// Copy token vectors from one source pool into every card of the addressed shard.
    ///
    /// `destination_table` is laid out shard-major: entries
    /// `[s * cards_per_shard, (s + 1) * cards_per_shard)` are the cards of shard `s`.
    pub fn import_fanout(
        &self,
        destination_table: &HandleTable,
        destination_slots: &[SlotIndex],
        destination_shards: &[ShardIndex],
        source: &MemoryHandle,
        source_slots: &[SlotIndex],
    ) -> Result<TransferStats> {
        let token_num = destination_slots.len();
        check_lengths(
            token_num,
            &[
                ("destination_shards", destination_shards.len()),
                ("source_slots", source_slots.len()),
            ],
        )?;
        if token_num == 0 {
            return Ok(TransferStats::default());
        }

        let shards = self.layout.import_shards;
        let expected = shards * self.layout.cards_per_shard;
        if destination_table.len() != expected {
            return Err(EmberError::transfer_shape_mismatch(format!(
                "import handle table has {} entries, expected {} shards x {} cards",
                destination_table.len(),
                shards,
                self.layout.cards_per_shard
            )));
        }
        let cards_per_shard = destination_table.len() / shards;
        check_layouts(destination_table, source)?;
        check_slots(source, source_slots)?;

        let mut jobs = Vec::with_capacity(token_num);
        for i in 0..token_num {
            let shard = destination_shards[i];
            if shard >= shards {
                return Err(EmberError::malformed_request(format!(
                    "destination shard index {} outside {} shards",
                    shard, shards
                )));
            }
            let mut dsts = SmallVec::new();
            for card in shard * cards_per_shard..(shard + 1) * cards_per_shard {
                let handle = destination_table.get(card).ok_or_else(|| {
                    EmberError::transfer_shape_mismatch(format!("missing card handle {}", card))
                })?;
                check_slot(handle, destination_slots[i])?;
                dsts.push((handle.storage(), destination_slots[i]));
            }
            jobs.push(CopyJob {
                src: source.storage(),
                src_slot: source_slots[i],
                dsts,
            });
        }

        Ok(self.launch("import_fanout", &jobs))
    }

    fn launch(&self, op: &str, jobs: &[CopyJob<'_>]) -> TransferStats {
        let started = Instant::now();
        let bytes = kernel::run(&self.workers, &self.config, jobs);
        let stats = TransferStats {
            tokens: jobs.len(),
            vector_writes: jobs.iter().map(|j| j.dsts.len()).sum(),
            bytes,
        };
        trace!(
            "{}: {} tokens, {} writes, {} bytes in {:?}",
            op,
            stats.tokens,
            stats.vector_writes,
            stats.bytes,
            started.elapsed()
        );
        stats
    }
}

fn check_lengths(token_num: usize, others: &[(&str, usize)]) -> Result<()> {
    for (name, len) in others {
        if *len != token_num {
            return Err(EmberError::malformed_request(format!(
                "{} has {} entries, expected {}",
                name, len, token_num
            )));
        }
    }
    Ok(())
}

fn check_layouts(table: &HandleTable, other: &MemoryHandle) -> Result<()> {
    let reference = other.shape();
    for handle in table.iter() {
        if !handle.shape().same_vector_layout(&reference) {
            return Err(EmberError::transfer_shape_mismatch(format!(
                "handle layout {:?} differs from {:?}",
                handle.shape(),
                reference
            )));
        }
    }
    Ok(())
}

fn check_slots(handle: &MemoryHandle, slots: &[SlotIndex]) -> Result<()> {
    slots.iter().try_for_each(|&slot| check_slot(handle, slot))
}

fn check_slot(handle: &MemoryHandle, slot: SlotIndex) -> Result<()> {
    if slot as usize >= handle.shape().slots {
        return Err(EmberError::malformed_request(format!(
            "slot {} outside pool of {} slots",
            slot,
            handle.shape().slots
        )));
    }
    Ok(())
}
