//! Strided, tiled copy workers.
//!
//! Worker `w` of `W` handles tokens `w, w + W, w + 2W, ...`. Each token's vector
//! moves in tiles of `tile_elems` elements; up to `num_stages` tiles are loaded
//! into a staging buffer before any of them is stored. The last tile of a
//! vector is masked to the vector length. Shapes and indices are validated by
//! the caller; nothing here checks them.

use ember_kv::KvStorage;
use ember_types::{SlotIndex, TransferConfig};
use rayon::ThreadPool;
use smallvec::SmallVec;
use std::sync::atomic::{AtomicUsize, Ordering};

/// One token's relocation: a single source vector to one or more destinations
pub(crate) struct CopyJob<'a> {
    pub src: &'a KvStorage,
    pub src_slot: SlotIndex,
    pub dsts: SmallVec<[(&'a KvStorage, SlotIndex); 4]>,
}

/// Run all jobs on the copy pool; blocks until every worker finishes.
///
/// Returns the number of bytes stored.
pub(crate) fn run(pool: &ThreadPool, config: &TransferConfig, jobs: &[CopyJob<'_>]) -> usize {
    if jobs.is_empty() {
        return 0;
    }
    let workers = config.worker_count.min(jobs.len());
    let stored = AtomicUsize::new(0);

    pool.scope(|scope| {
        for worker in 0..workers {
            let stored = &stored;
            scope.spawn(move |_| {
                let bytes = copy_strided(worker, workers, config, jobs);
                stored.fetch_add(bytes, Ordering::Relaxed);
            });
        }
    });

    stored.into_inner()
}

fn copy_strided(worker: usize, workers: usize, config: &TransferConfig, jobs: &[CopyJob<'_>]) -> usize {
    let elem_bytes = jobs[0].src.shape().dtype.size_in_bytes();
    let tile_bytes = config.tile_elems * elem_bytes;
    let mut staging = vec![0u8; tile_bytes * config.num_stages];
    let mut stored = 0;

    let mut token = worker;
    while token < jobs.len() {
        stored += copy_vector(&jobs[token], tile_bytes, config.num_stages, &mut staging);
        token += workers;
    }
    stored
}

fn copy_vector(job: &CopyJob<'_>, tile_bytes: usize, stages: usize, staging: &mut [u8]) -> usize {
    let vector_bytes = job.src.shape().vector_bytes();
    let tiles = vector_bytes.div_ceil(tile_bytes);
    let mut stored = 0;

    let mut tile = 0;
    while tile < tiles {
        let group = stages.min(tiles - tile);

        for stage in 0..group {
            let offset = (tile + stage) * tile_bytes;
            let len = tile_bytes.min(vector_bytes - offset);
            let buf = &mut staging[stage * tile_bytes..stage * tile_bytes + len];
            job.src.load_bytes(job.src_slot, offset, buf);
        }

        for stage in 0..group {
            let offset = (tile + stage) * tile_bytes;
            let len = tile_bytes.min(vector_bytes - offset);
            let buf = &staging[stage * tile_bytes..stage * tile_bytes + len];
            for (dst, dst_slot) in &job.dsts {
                dst.store_bytes(*dst_slot, offset, buf);
                stored += len;
            }
        }

        tile += group;
    }
    stored
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_kv::KvShape;
    use ember_types::DataType;
    use rayon::ThreadPoolBuilder;
    use smallvec::smallvec;

    fn storage(slots: usize, head_dim: usize) -> KvStorage {
        KvStorage::new(KvShape {
            slots,
            head_num: 1,
            head_dim,
            dtype: DataType::FP32,
        })
        .unwrap()
    }

    fn fill(s: &KvStorage, slot: SlotIndex, seed: u8) -> Vec<u8> {
        let bytes: Vec<u8> = (0..s.shape().vector_bytes())
            .map(|i| seed.wrapping_add(i as u8))
            .collect();
        s.write_slot(slot, &bytes).unwrap();
        bytes
    }

    #[test]
    fn test_partial_tile_is_masked() {
        // 10 elements with 4-element tiles: two full tiles and a half tile.
        let src = storage(2, 10);
        let dst = storage(2, 10);
        let expected = fill(&src, 1, 3);
        let config = TransferConfig {
            worker_count: 1,
            tile_elems: 4,
            num_stages: 2,
        };
        let pool = ThreadPoolBuilder::new().num_threads(1).build().unwrap();
        let jobs = [CopyJob {
            src: &src,
            src_slot: 1,
            dsts: smallvec![(&dst, 0)],
        }];
        assert_eq!(run(&pool, &config, &jobs), 40);
        assert_eq!(dst.read_slot(0).unwrap(), expected);
        assert_eq!(dst.read_slot(1).unwrap(), vec![0u8; 40]);
    }

    #[test]
    fn test_more_tokens_than_workers() {
        let src = storage(16, 3);
        let dst = storage(16, 3);
        let expected: Vec<_> = (0..16).map(|s| fill(&src, s, s as u8 * 11)).collect();
        let config = TransferConfig {
            worker_count: 3,
            tile_elems: 2,
            num_stages: 3,
        };
        let pool = ThreadPoolBuilder::new().num_threads(3).build().unwrap();
        let jobs: Vec<_> = (0..16u32)
            .map(|s| CopyJob {
                src: &src,
                src_slot: s,
                dsts: smallvec![(&dst, 15 - s)],
            })
            .collect();
        run(&pool, &config, &jobs);
        for s in 0..16u32 {
            assert_eq!(dst.read_slot(15 - s).unwrap(), expected[s as usize]);
        }
    }

    #[test]
    fn test_empty_job_list() {
        let pool = ThreadPoolBuilder::new().num_threads(1).build().unwrap();
        assert_eq!(run(&pool, &TransferConfig::default(), &[]), 0);
    }
}
