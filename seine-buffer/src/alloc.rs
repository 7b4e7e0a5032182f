//! The pooled allocator: arenas, thread binding and slot lifecycle.

use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crate::arena::{Arena, RawSlot, SlotOrigin};
use crate::byte_buf::ByteBuf;
use crate::chunk::ChunkMemory;
use crate::error::AllocError;

/// Tuning knobs for a [`PooledAllocator`].
///
/// The defaults match the reference geometry: 8 KiB pages, 16 MiB chunks
/// (`page_size << max_order`), tiny allocations rounded to 16-byte quanta
/// below 512 bytes, small allocations rounded to powers of two below one
/// page, and `2 x` the machine's available parallelism worth of arenas.
#[derive(Debug, Clone)]
pub struct AllocatorConfig {
    /// Size of one page, a power of two.
    pub page_size: usize,
    /// Buddy-tree depth; the chunk size is `page_size << max_order`.
    pub max_order: u32,
    /// Rounding quantum for tiny allocations.
    pub tiny_quantum: usize,
    /// Allocations below this are tiny; from here to one page they are
    /// small; both are served from subpages.
    pub small_threshold: usize,
    /// Number of arenas to spread threads over.
    pub arena_count: usize,
    /// Optional hard cap on pooled chunk memory. `None` means unbounded.
    pub max_total_memory: Option<usize>,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        AllocatorConfig {
            page_size: 8192,
            max_order: 11,
            tiny_quantum: 16,
            small_threshold: 512,
            arena_count: parallelism * 2,
            max_total_memory: None,
        }
    }
}

impl AllocatorConfig {
    /// Overrides the page size.
    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Overrides the buddy-tree depth.
    pub fn max_order(mut self, max_order: u32) -> Self {
        self.max_order = max_order;
        self
    }

    /// Overrides the arena count.
    pub fn arena_count(mut self, arena_count: usize) -> Self {
        self.arena_count = arena_count;
        self
    }

    /// Caps total pooled chunk memory.
    pub fn max_total_memory(mut self, bytes: usize) -> Self {
        self.max_total_memory = Some(bytes);
        self
    }

    #[inline]
    pub(crate) fn chunk_size(&self) -> usize {
        self.page_size << self.max_order
    }

    fn validate(&self) {
        assert!(self.page_size.is_power_of_two(), "page_size must be a power of two");
        assert!(self.tiny_quantum.is_power_of_two(), "tiny_quantum must be a power of two");
        assert!(
            self.small_threshold.is_power_of_two() && self.small_threshold < self.page_size,
            "small_threshold must be a power of two below page_size"
        );
        assert!(self.tiny_quantum < self.small_threshold);
        assert!(self.max_order >= 1 && self.max_order <= 14, "max_order out of range");
        assert!(self.arena_count >= 1, "at least one arena required");
    }

    /// Rounds a capacity to its size class.
    pub(crate) fn normalize(&self, cap: usize) -> usize {
        if cap < self.small_threshold {
            let quantum = self.tiny_quantum;
            ((cap.max(1) + quantum - 1) / quantum) * quantum
        } else {
            cap.next_power_of_two()
        }
    }

    /// Subpage pool index for a normalised size, `None` for normal runs.
    pub(crate) fn pool_index(&self, norm: usize) -> Option<usize> {
        if norm < self.small_threshold {
            Some(norm / self.tiny_quantum)
        } else if norm < self.page_size {
            let tiny_pools = self.small_threshold / self.tiny_quantum;
            Some(
                tiny_pools
                    + (norm.trailing_zeros() - self.small_threshold.trailing_zeros()) as usize,
            )
        } else {
            None
        }
    }

    pub(crate) fn pool_count(&self) -> usize {
        self.small_threshold / self.tiny_quantum
            + (self.page_size.trailing_zeros() - self.small_threshold.trailing_zeros()) as usize
    }
}

pub(crate) struct AllocShared {
    pub(crate) config: AllocatorConfig,
    pub(crate) arenas: Box<[Arena]>,
    pub(crate) outstanding: AtomicUsize,
    pub(crate) pooled_bytes: AtomicUsize,
}

/// A refcounted slot backing one family of buffer views. Dropping the last
/// handle returns the slot to its arena (or frees the one-shot region for
/// unpooled buffers).
pub(crate) struct BufShared {
    pub(crate) memory: Arc<ChunkMemory>,
    pub(crate) offset: usize,
    pub(crate) len: usize,
    origin: Option<SlotOrigin>,
    owner: Weak<AllocShared>,
}

impl BufShared {
    /// The owning allocator, if it is still alive.
    pub(crate) fn allocator(&self) -> Option<PooledAllocator> {
        self.owner
            .upgrade()
            .map(|shared| PooledAllocator { shared })
    }

    /// A one-shot slot with no arena behind it, used when a buffer must
    /// grow after its allocator is gone.
    pub(crate) fn detached(cap: usize) -> Arc<BufShared> {
        let len = cap.max(1);
        Arc::new(BufShared {
            memory: Arc::new(ChunkMemory::new(len)),
            offset: 0,
            len,
            origin: None,
            owner: Weak::new(),
        })
    }
}

impl Drop for BufShared {
    fn drop(&mut self) {
        if let Some(owner) = self.owner.upgrade() {
            owner.outstanding.fetch_sub(1, Ordering::Relaxed);
            if let Some(origin) = self.origin.take() {
                owner.arenas[origin.arena].free(&origin, &owner.config, &owner.pooled_bytes);
            }
        }
    }
}

/// Pooled, size-classed buffer allocator.
///
/// The allocator is cheap to clone and safe to share across threads; spec
/// users typically create one and hand it to every event loop. Threads bind
/// to arenas round-robin on their first allocation, and any thread may
/// release any buffer.
///
/// # Example
///
/// ```rust
/// use seine_buffer::PooledAllocator;
///
/// let alloc = PooledAllocator::default();
/// let mut buf = alloc.allocate(64, 1024).unwrap();
/// buf.write_u32(0xDEADBEEF);
/// assert_eq!(buf.readable_bytes(), 4);
/// assert_eq!(buf.read_u32(), 0xDEADBEEF);
/// ```
#[derive(Clone)]
pub struct PooledAllocator {
    shared: Arc<AllocShared>,
}

static NEXT_THREAD_SEQ: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static THREAD_SEQ: Cell<Option<usize>> = const { Cell::new(None) };
}

fn thread_seq() -> usize {
    THREAD_SEQ.with(|c| match c.get() {
        Some(seq) => seq,
        None => {
            let seq = NEXT_THREAD_SEQ.fetch_add(1, Ordering::Relaxed);
            c.set(Some(seq));
            seq
        }
    })
}

impl Default for PooledAllocator {
    fn default() -> Self {
        PooledAllocator::new(AllocatorConfig::default())
    }
}

impl PooledAllocator {
    /// Creates an allocator with the given geometry.
    ///
    /// # Panics
    ///
    /// Panics if the configuration is inconsistent (non-power-of-two page
    /// size, zero arenas, ...). Configuration errors are programming errors,
    /// not runtime conditions.
    pub fn new(config: AllocatorConfig) -> Self {
        config.validate();
        let pool_count = config.pool_count();
        let arenas = (0..config.arena_count)
            .map(|i| Arena::new(i, pool_count))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        PooledAllocator {
            shared: Arc::new(AllocShared {
                config,
                arenas,
                outstanding: AtomicUsize::new(0),
                pooled_bytes: AtomicUsize::new(0),
            }),
        }
    }

    /// Allocates a buffer with `read_idx == write_idx == 0`.
    ///
    /// Requests above half a chunk bypass the pools entirely and get a
    /// one-shot region that is freed wholesale on release.
    pub fn allocate(&self, initial_capacity: usize, max_capacity: usize) -> Result<ByteBuf, AllocError> {
        if initial_capacity > max_capacity {
            return Err(AllocError::InvalidCapacity {
                initial: initial_capacity,
                max: max_capacity,
            });
        }
        let shared = self.allocate_shared(initial_capacity)?;
        Ok(ByteBuf::from_shared(shared, initial_capacity, max_capacity))
    }

    /// Grows or shrinks `buf` to `new_capacity`, preserving the bytes in
    /// `[read_idx, write_idx)` and both cursors (clamped when shrinking).
    pub fn reallocate(&self, buf: &mut ByteBuf, new_capacity: usize) -> Result<(), AllocError> {
        buf.reallocate(self, new_capacity)
    }

    pub(crate) fn allocate_shared(&self, cap: usize) -> Result<Arc<BufShared>, AllocError> {
        let s = &self.shared;
        let slot = if cap > s.config.chunk_size() / 2 {
            if let Some(budget) = s.config.max_total_memory {
                if cap > budget {
                    return Err(AllocError::OutOfMemory {
                        requested: cap,
                        budget,
                    });
                }
            }
            RawSlot {
                memory: Arc::new(ChunkMemory::new(cap.max(1))),
                offset: 0,
                len: cap.max(1),
                origin: None,
            }
        } else {
            let norm = s.config.normalize(cap);
            let idx = thread_seq() % s.arenas.len();
            s.arenas[idx].allocate(norm, &s.config, &s.pooled_bytes)?
        };
        s.outstanding.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(BufShared {
            memory: slot.memory,
            offset: slot.offset,
            len: slot.len,
            origin: slot.origin,
            owner: Arc::downgrade(&self.shared),
        }))
    }

    /// Number of live allocations (slots handed out and not yet released).
    pub fn outstanding(&self) -> usize {
        self.shared.outstanding.load(Ordering::Relaxed)
    }

    /// Total chunk memory currently owned by the arenas.
    pub fn pooled_bytes(&self) -> usize {
        self.shared.pooled_bytes.load(Ordering::Relaxed)
    }

    /// Free bytes across all arena chunks.
    pub fn free_bytes(&self) -> usize {
        self.shared.arenas.iter().map(Arena::free_bytes).sum()
    }

    pub(crate) fn config(&self) -> &AllocatorConfig {
        &self.shared.config
    }
}

impl std::fmt::Debug for PooledAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledAllocator")
            .field("arenas", &self.shared.arenas.len())
            .field("outstanding", &self.outstanding())
            .field("pooled_bytes", &self.pooled_bytes())
            .finish()
    }
}
