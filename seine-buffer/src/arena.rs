//! Arenas: per-thread-group collections of chunks and subpage pools.
//!
//! Every arena serialises itself with one mutex, so any thread may free any
//! slot; callers are spread over arenas round-robin to keep contention low.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use log::debug;

use crate::alloc::AllocatorConfig;
use crate::chunk::{Chunk, ChunkMemory, SUBPAGE_FLAG};
use crate::error::AllocError;

/// Where a pooled slot came from; consumed when the slot is returned.
pub(crate) struct SlotOrigin {
    pub(crate) arena: usize,
    pub(crate) chunk: u32,
    pub(crate) handle: u64,
    pub(crate) norm_size: usize,
}

/// A carved-out region handed to `ByteBuf`.
pub(crate) struct RawSlot {
    pub(crate) memory: Arc<ChunkMemory>,
    pub(crate) offset: usize,
    pub(crate) len: usize,
    pub(crate) origin: Option<SlotOrigin>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct SubpageRef {
    chunk: u32,
    page_id: u32,
}

struct ArenaInner {
    chunks: HashMap<u32, Chunk>,
    next_chunk: u32,
    /// One pool per tiny/small size class: subpages that still have free
    /// slots. The last entry is always the preferred allocation target.
    subpage_pools: Vec<Vec<SubpageRef>>,
}

pub(crate) struct Arena {
    index: usize,
    inner: Mutex<ArenaInner>,
}

impl Arena {
    pub(crate) fn new(index: usize, pool_count: usize) -> Self {
        Arena {
            index,
            inner: Mutex::new(ArenaInner {
                chunks: HashMap::new(),
                next_chunk: 0,
                subpage_pools: vec![Vec::new(); pool_count],
            }),
        }
    }

    /// Serves a normalised allocation from this arena.
    pub(crate) fn allocate(
        &self,
        norm: usize,
        config: &AllocatorConfig,
        pooled: &AtomicUsize,
    ) -> Result<RawSlot, AllocError> {
        let mut guard = self.inner.lock().expect("arena poisoned");
        let inner = &mut *guard;
        match config.pool_index(norm) {
            Some(pool_idx) => self.allocate_subpage_slot(inner, norm, pool_idx, config, pooled),
            None => self.allocate_run(inner, norm, config, pooled),
        }
    }

    fn allocate_subpage_slot(
        &self,
        inner: &mut ArenaInner,
        norm: usize,
        pool_idx: usize,
        config: &AllocatorConfig,
        pooled: &AtomicUsize,
    ) -> Result<RawSlot, AllocError> {
        loop {
            let candidate = inner.subpage_pools[pool_idx].last().copied();
            if let Some(r) = candidate {
                let chunk = inner
                    .chunks
                    .get_mut(&r.chunk)
                    .expect("subpage pool references retired chunk");
                let sp = chunk
                    .subpage_mut(r.page_id)
                    .expect("subpage pool references destroyed subpage");
                let idx = sp.allocate().expect("pooled subpage had no free slot");
                if sp.is_full() {
                    inner.subpage_pools[pool_idx].pop();
                }
                let offset = chunk.run_offset(r.page_id) + idx as usize * norm;
                return Ok(RawSlot {
                    memory: chunk.memory().clone(),
                    offset,
                    len: norm,
                    origin: Some(SlotOrigin {
                        arena: self.index,
                        chunk: r.chunk,
                        handle: Chunk::encode_subpage_handle(r.page_id, idx),
                        norm_size: norm,
                    }),
                });
            }

            // No partially-used subpage for this class: carve a fresh page.
            let mut carved = None;
            for cid in Self::pick_order(inner) {
                let chunk = inner.chunks.get_mut(&cid).expect("chunk disappeared");
                if let Some(page_id) = chunk.create_subpage(norm) {
                    carved = Some(SubpageRef { chunk: cid, page_id });
                    break;
                }
            }
            let r = match carved {
                Some(r) => r,
                None => {
                    let cid = self.grow(inner, config, pooled)?;
                    let chunk = inner.chunks.get_mut(&cid).expect("fresh chunk disappeared");
                    let page_id = chunk
                        .create_subpage(norm)
                        .expect("fresh chunk cannot carve a page");
                    SubpageRef { chunk: cid, page_id }
                }
            };
            inner.subpage_pools[pool_idx].push(r);
        }
    }

    fn allocate_run(
        &self,
        inner: &mut ArenaInner,
        norm: usize,
        config: &AllocatorConfig,
        pooled: &AtomicUsize,
    ) -> Result<RawSlot, AllocError> {
        let run_len = norm.max(config.page_size);
        let mut allocated = None;
        for cid in Self::pick_order(inner) {
            let chunk = inner.chunks.get_mut(&cid).expect("chunk disappeared");
            let depth = chunk.depth_for_run(run_len);
            if let Some(id) = chunk.allocate_run(depth) {
                allocated = Some((cid, id));
                break;
            }
        }
        let (cid, id) = match allocated {
            Some(pair) => pair,
            None => {
                let cid = self.grow(inner, config, pooled)?;
                let chunk = inner.chunks.get_mut(&cid).expect("fresh chunk disappeared");
                let depth = chunk.depth_for_run(run_len);
                let id = chunk
                    .allocate_run(depth)
                    .expect("fresh chunk cannot serve a normal run");
                (cid, id)
            }
        };
        let chunk = inner.chunks.get_mut(&cid).expect("chunk disappeared");
        Ok(RawSlot {
            memory: chunk.memory().clone(),
            offset: chunk.run_offset(id),
            len: chunk.run_length(id),
            origin: Some(SlotOrigin {
                arena: self.index,
                chunk: cid,
                handle: u64::from(id),
                norm_size: norm,
            }),
        })
    }

    /// Returns a slot to its chunk, merging and retiring as needed.
    pub(crate) fn free(&self, origin: &SlotOrigin, config: &AllocatorConfig, pooled: &AtomicUsize) {
        let mut guard = self.inner.lock().expect("arena poisoned");
        let inner = &mut *guard;
        let Some(chunk) = inner.chunks.get_mut(&origin.chunk) else {
            debug_assert!(false, "slot freed into a retired chunk");
            return;
        };

        if origin.handle & SUBPAGE_FLAG != 0 {
            let page_id = (origin.handle & 0xFFFF_FFFF) as u32;
            let idx = ((origin.handle >> 32) & 0x3FFF_FFFF) as u32;
            let pool_idx = config
                .pool_index(origin.norm_size)
                .expect("subpage handle for a non-subpage size");
            let sp = chunk.subpage_mut(page_id).expect("missing subpage");
            let was_full = sp.free(idx);
            let unused = sp.is_unused();
            let r = SubpageRef {
                chunk: origin.chunk,
                page_id,
            };
            let pool = &mut inner.subpage_pools[pool_idx];
            if was_full {
                pool.push(r);
            }
            // Keep one empty subpage per class to damp alloc/free thrash;
            // destroy the rest so their pages merge back into the tree.
            if unused && pool.len() > 1 {
                if let Some(pos) = pool.iter().position(|x| *x == r) {
                    pool.swap_remove(pos);
                    chunk.destroy_subpage(page_id);
                }
            }
        } else {
            chunk.free_run(origin.handle as u32);
        }

        if inner
            .chunks
            .get(&origin.chunk)
            .is_some_and(Chunk::is_empty)
            && inner.chunks.len() > 1
        {
            if let Some(c) = inner.chunks.remove(&origin.chunk) {
                pooled.fetch_sub(c.chunk_size(), Ordering::Relaxed);
                debug!("arena {}: retired empty chunk {}", self.index, origin.chunk);
            }
        }
    }

    /// Bytes currently free across this arena's chunks.
    pub(crate) fn free_bytes(&self) -> usize {
        let guard = self.inner.lock().expect("arena poisoned");
        guard.chunks.values().map(Chunk::free_bytes).sum()
    }

    /// Chunk ids in allocation-preference order. Mostly-used chunks go
    /// first (50-75% bucket, then 25-50%, then nearly empty, then nearly
    /// full) so wear spreads instead of fragmenting every chunk a little.
    fn pick_order(inner: &ArenaInner) -> Vec<u32> {
        fn bucket_rank(usage: usize) -> usize {
            match usage {
                50..=74 => 0,
                25..=49 => 1,
                0..=24 => 2,
                _ => 3,
            }
        }
        let mut ids: Vec<(usize, u32)> = inner
            .chunks
            .iter()
            .map(|(id, c)| (bucket_rank(c.usage()), *id))
            .collect();
        ids.sort_unstable();
        ids.into_iter().map(|(_, id)| id).collect()
    }

    fn grow(
        &self,
        inner: &mut ArenaInner,
        config: &AllocatorConfig,
        pooled: &AtomicUsize,
    ) -> Result<u32, AllocError> {
        let chunk_size = config.chunk_size();
        if let Some(budget) = config.max_total_memory {
            let prev = pooled.fetch_add(chunk_size, Ordering::Relaxed);
            if prev + chunk_size > budget {
                pooled.fetch_sub(chunk_size, Ordering::Relaxed);
                return Err(AllocError::OutOfMemory {
                    requested: chunk_size,
                    budget,
                });
            }
        } else {
            pooled.fetch_add(chunk_size, Ordering::Relaxed);
        }
        let cid = inner.next_chunk;
        inner.next_chunk += 1;
        inner
            .chunks
            .insert(cid, Chunk::new(config.page_size, config.max_order));
        debug!(
            "arena {}: grew to {} chunk(s) of {} bytes",
            self.index,
            inner.chunks.len(),
            chunk_size
        );
        Ok(cid)
    }
}
