//! `ByteBuf`: a refcounted, random-access byte sequence with read and write
//! cursors.
//!
//! Every buffer is a *view* over a pooled (or one-shot) slot. Views share
//! the slot by reference count: [`ByteBuf::retain`], [`ByteBuf::slice`] and
//! [`ByteBuf::duplicate`] hand out additional owned handles, and the slot
//! returns to its arena when the last handle drops. Releasing is therefore
//! RAII — a double release is unrepresentable, and the "every allocate and
//! retain is matched by a release" invariant holds by construction.
//!
//! ```text
//!      +-------------------+------------------+------------------+
//!      | discardable bytes |  readable bytes  |  writable bytes  |
//!      +-------------------+------------------+------------------+
//!      |                   |                  |                  |
//!      0      <=       read_idx    <=     write_idx    <=    capacity
//! ```
//!
//! Multi-byte accessors honour the buffer's [`ByteOrder`]; buffers are
//! big-endian unless switched explicitly.
//!
//! A buffer may cross threads (it is `Send + Sync`), but handles that share
//! a slot must not write the same region concurrently; the framework keeps
//! each buffer confined to one event loop at a time.

use std::ptr;
use std::sync::Arc;

use bytes::buf::UninitSlice;

use crate::alloc::{BufShared, PooledAllocator};
use crate::error::AllocError;

/// Byte order used by the multi-byte accessors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ByteOrder {
    /// Network order; the default.
    #[default]
    BigEndian,
    /// Explicit little-endian access.
    LittleEndian,
}

/// A reference-counted, growable byte buffer with separate read and write
/// cursors. See the [module docs](self) for the cursor model.
pub struct ByteBuf {
    shared: Arc<BufShared>,
    /// Offset of this view within the shared slot.
    view_offset: usize,
    /// View capacity; grows up to `max_capacity` via reallocation.
    capacity: usize,
    max_capacity: usize,
    read_idx: usize,
    write_idx: usize,
    order: ByteOrder,
    /// Slots parked by reallocation while intermediary deallocation is
    /// suspended; freed on resume.
    stash: Vec<Arc<BufShared>>,
    suspended: bool,
}

impl ByteBuf {
    pub(crate) fn from_shared(shared: Arc<BufShared>, capacity: usize, max_capacity: usize) -> Self {
        debug_assert!(capacity <= shared.len);
        ByteBuf {
            shared,
            view_offset: 0,
            capacity,
            max_capacity,
            read_idx: 0,
            write_idx: 0,
            order: ByteOrder::BigEndian,
            stash: Vec::new(),
            suspended: false,
        }
    }

    #[inline]
    fn base_ptr(&self) -> *mut u8 {
        // The slot region [offset, offset + len) was carved exclusively for
        // this buffer family; views never escape it.
        unsafe {
            self.shared
                .memory
                .as_ptr()
                .add(self.shared.offset + self.view_offset)
        }
    }

    // ---------------------------------------------------------------------
    // Cursors and capacity
    // ---------------------------------------------------------------------

    /// Current capacity of this view.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Upper bound the buffer may grow to.
    #[inline]
    pub fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    /// Bytes available for reading: `write_idx - read_idx`.
    #[inline]
    pub fn readable_bytes(&self) -> usize {
        self.write_idx - self.read_idx
    }

    /// Bytes available for writing without growing: `capacity - write_idx`.
    #[inline]
    pub fn writable_bytes(&self) -> usize {
        self.capacity - self.write_idx
    }

    #[inline]
    pub fn is_readable(&self) -> bool {
        self.read_idx < self.write_idx
    }

    #[inline]
    pub fn read_idx(&self) -> usize {
        self.read_idx
    }

    #[inline]
    pub fn write_idx(&self) -> usize {
        self.write_idx
    }

    /// Moves the read cursor.
    ///
    /// # Panics
    ///
    /// Panics if `idx > write_idx`.
    pub fn set_read_idx(&mut self, idx: usize) {
        assert!(
            idx <= self.write_idx,
            "read_idx {idx} beyond write_idx {}",
            self.write_idx
        );
        self.read_idx = idx;
    }

    /// Moves the write cursor.
    ///
    /// # Panics
    ///
    /// Panics if `idx < read_idx` or `idx > capacity`.
    pub fn set_write_idx(&mut self, idx: usize) {
        assert!(
            idx >= self.read_idx && idx <= self.capacity,
            "write_idx {idx} outside [{}, {}]",
            self.read_idx,
            self.capacity
        );
        self.write_idx = idx;
    }

    /// Resets both cursors to zero. The content is not touched.
    pub fn clear(&mut self) {
        self.read_idx = 0;
        self.write_idx = 0;
    }

    /// Advances the read cursor by `n` consumed bytes.
    ///
    /// # Panics
    ///
    /// Panics if fewer than `n` bytes are readable.
    pub fn advance_read(&mut self, n: usize) {
        assert!(
            n <= self.readable_bytes(),
            "cannot skip {n} bytes, only {} readable",
            self.readable_bytes()
        );
        self.read_idx += n;
    }

    /// Advances the write cursor over `n` bytes already placed in the
    /// writable region (e.g. by a socket read).
    ///
    /// # Panics
    ///
    /// Panics if fewer than `n` bytes are writable.
    pub fn advance_write(&mut self, n: usize) {
        assert!(
            n <= self.writable_bytes(),
            "cannot commit {n} bytes, only {} writable",
            self.writable_bytes()
        );
        self.write_idx += n;
    }

    /// Drops already-read bytes, moving `[read_idx, write_idx)` to the
    /// front of the buffer.
    pub fn discard_read_bytes(&mut self) {
        if self.read_idx == 0 {
            return;
        }
        let readable = self.readable_bytes();
        if readable > 0 {
            // Regions may overlap.
            unsafe {
                ptr::copy(self.base_ptr().add(self.read_idx), self.base_ptr(), readable);
            }
        }
        self.read_idx = 0;
        self.write_idx = readable;
    }

    // ---------------------------------------------------------------------
    // Byte order
    // ---------------------------------------------------------------------

    /// Byte order used by multi-byte accessors.
    #[inline]
    pub fn order(&self) -> ByteOrder {
        self.order
    }

    /// Switches the byte order for subsequent multi-byte accesses.
    pub fn set_order(&mut self, order: ByteOrder) {
        self.order = order;
    }

    // ---------------------------------------------------------------------
    // Absolute accessors (cursor-independent)
    // ---------------------------------------------------------------------

    #[inline]
    fn check_bounds(&self, idx: usize, len: usize) {
        let end = idx.checked_add(len);
        assert!(
            end.is_some_and(|end| end <= self.capacity),
            "access at {idx}+{len} out of bounds (capacity {})",
            self.capacity
        );
    }

    /// Reads the byte at `idx` without touching the cursors.
    pub fn get_u8(&self, idx: usize) -> u8 {
        self.check_bounds(idx, 1);
        unsafe { *self.base_ptr().add(idx) }
    }

    /// Writes the byte at `idx` without touching the cursors.
    pub fn set_u8(&mut self, idx: usize, value: u8) {
        self.check_bounds(idx, 1);
        unsafe { *self.base_ptr().add(idx) = value };
    }

    fn get_array<const N: usize>(&self, idx: usize) -> [u8; N] {
        self.check_bounds(idx, N);
        let mut out = [0u8; N];
        unsafe { ptr::copy_nonoverlapping(self.base_ptr().add(idx), out.as_mut_ptr(), N) };
        out
    }

    fn set_array(&mut self, idx: usize, bytes: &[u8]) {
        self.check_bounds(idx, bytes.len());
        // Plain copy: the source may be another view of the same slot.
        unsafe { ptr::copy(bytes.as_ptr(), self.base_ptr().add(idx), bytes.len()) };
    }

    pub fn get_u16(&self, idx: usize) -> u16 {
        let b = self.get_array::<2>(idx);
        match self.order {
            ByteOrder::BigEndian => u16::from_be_bytes(b),
            ByteOrder::LittleEndian => u16::from_le_bytes(b),
        }
    }

    pub fn set_u16(&mut self, idx: usize, value: u16) {
        let b = match self.order {
            ByteOrder::BigEndian => value.to_be_bytes(),
            ByteOrder::LittleEndian => value.to_le_bytes(),
        };
        self.set_array(idx, &b);
    }

    pub fn get_u32(&self, idx: usize) -> u32 {
        let b = self.get_array::<4>(idx);
        match self.order {
            ByteOrder::BigEndian => u32::from_be_bytes(b),
            ByteOrder::LittleEndian => u32::from_le_bytes(b),
        }
    }

    pub fn set_u32(&mut self, idx: usize, value: u32) {
        let b = match self.order {
            ByteOrder::BigEndian => value.to_be_bytes(),
            ByteOrder::LittleEndian => value.to_le_bytes(),
        };
        self.set_array(idx, &b);
    }

    pub fn get_u64(&self, idx: usize) -> u64 {
        let b = self.get_array::<8>(idx);
        match self.order {
            ByteOrder::BigEndian => u64::from_be_bytes(b),
            ByteOrder::LittleEndian => u64::from_le_bytes(b),
        }
    }

    pub fn set_u64(&mut self, idx: usize, value: u64) {
        let b = match self.order {
            ByteOrder::BigEndian => value.to_be_bytes(),
            ByteOrder::LittleEndian => value.to_le_bytes(),
        };
        self.set_array(idx, &b);
    }

    // ---------------------------------------------------------------------
    // Relative accessors (cursor-advancing)
    // ---------------------------------------------------------------------

    #[inline]
    fn check_readable(&self, n: usize) {
        assert!(
            self.readable_bytes() >= n,
            "buffer underflow: need {n} bytes, {} readable",
            self.readable_bytes()
        );
    }

    #[inline]
    fn reserve(&mut self, n: usize) {
        if let Err(e) = self.ensure_writable(n) {
            panic!("{e}");
        }
    }

    pub fn read_u8(&mut self) -> u8 {
        self.check_readable(1);
        let v = self.get_u8(self.read_idx);
        self.read_idx += 1;
        v
    }

    pub fn read_u16(&mut self) -> u16 {
        self.check_readable(2);
        let v = self.get_u16(self.read_idx);
        self.read_idx += 2;
        v
    }

    pub fn read_u32(&mut self) -> u32 {
        self.check_readable(4);
        let v = self.get_u32(self.read_idx);
        self.read_idx += 4;
        v
    }

    pub fn read_u64(&mut self) -> u64 {
        self.check_readable(8);
        let v = self.get_u64(self.read_idx);
        self.read_idx += 8;
        v
    }

    /// Writes one byte, growing the buffer if required.
    ///
    /// # Panics
    ///
    /// All `write_*` methods panic when growth past `max_capacity` would be
    /// required; use [`ByteBuf::ensure_writable`] first for a fallible path.
    pub fn write_u8(&mut self, value: u8) {
        self.reserve(1);
        let idx = self.write_idx;
        self.set_u8(idx, value);
        self.write_idx += 1;
    }

    pub fn write_u16(&mut self, value: u16) {
        self.reserve(2);
        let idx = self.write_idx;
        self.set_u16(idx, value);
        self.write_idx += 2;
    }

    pub fn write_u32(&mut self, value: u32) {
        self.reserve(4);
        let idx = self.write_idx;
        self.set_u32(idx, value);
        self.write_idx += 4;
    }

    pub fn write_u64(&mut self, value: u64) {
        self.reserve(8);
        let idx = self.write_idx;
        self.set_u64(idx, value);
        self.write_idx += 8;
    }

    /// Copies `dst.len()` bytes out of the buffer, advancing the read
    /// cursor.
    pub fn read_bytes(&mut self, dst: &mut [u8]) {
        self.check_readable(dst.len());
        let idx = self.read_idx;
        let src = self.get_slice(idx, dst.len());
        dst.copy_from_slice(src);
        self.read_idx += dst.len();
    }

    /// Appends `src`, growing as needed.
    pub fn write_bytes(&mut self, src: &[u8]) {
        self.reserve(src.len());
        let idx = self.write_idx;
        self.set_array(idx, src);
        self.write_idx += src.len();
    }

    /// Moves all readable bytes of `src` into this buffer.
    pub fn write_from(&mut self, src: &mut ByteBuf) {
        let n = src.readable_bytes();
        self.reserve(n);
        let idx = self.write_idx;
        {
            let bytes = src.readable_slice();
            self.set_array(idx, bytes);
        }
        self.write_idx += n;
        src.advance_read(n);
    }

    /// The readable region as a slice.
    pub fn readable_slice(&self) -> &[u8] {
        self.get_slice(self.read_idx, self.readable_bytes())
    }

    /// The writable region as a mutable slice, for direct fills (socket
    /// reads). Commit with [`ByteBuf::advance_write`].
    pub fn writable_slice_mut(&mut self) -> &mut [u8] {
        let len = self.writable_bytes();
        unsafe { std::slice::from_raw_parts_mut(self.base_ptr().add(self.write_idx), len) }
    }

    fn get_slice(&self, idx: usize, len: usize) -> &[u8] {
        self.check_bounds(idx, len);
        unsafe { std::slice::from_raw_parts(self.base_ptr().add(idx), len) }
    }

    // ---------------------------------------------------------------------
    // Sharing
    // ---------------------------------------------------------------------

    /// Hands out another owned handle to the same content and cursors.
    /// The underlying slot is released only when every handle is dropped.
    pub fn retain(&self) -> ByteBuf {
        self.duplicate()
    }

    /// A second view with independent cursors over the same bytes.
    /// The duplicate is retained: it owns its own reference to the slot.
    pub fn duplicate(&self) -> ByteBuf {
        ByteBuf {
            shared: Arc::clone(&self.shared),
            view_offset: self.view_offset,
            capacity: self.capacity,
            max_capacity: self.max_capacity,
            read_idx: self.read_idx,
            write_idx: self.write_idx,
            order: self.order,
            stash: Vec::new(),
            suspended: false,
        }
    }

    /// A retained view over `[from, from + len)`, fully readable and not
    /// growable.
    ///
    /// # Panics
    ///
    /// Panics if the range exceeds the capacity.
    pub fn slice(&self, from: usize, len: usize) -> ByteBuf {
        self.check_bounds(from, len);
        ByteBuf {
            shared: Arc::clone(&self.shared),
            view_offset: self.view_offset + from,
            capacity: len,
            max_capacity: len,
            read_idx: 0,
            write_idx: len,
            order: self.order,
            stash: Vec::new(),
            suspended: false,
        }
    }

    /// Carves the next `len` readable bytes off as a retained slice and
    /// advances the read cursor past them. The backbone of zero-copy
    /// framing.
    pub fn read_retained_slice(&mut self, len: usize) -> ByteBuf {
        self.check_readable(len);
        let s = self.slice(self.read_idx, len);
        self.read_idx += len;
        s
    }

    /// Explicitly releases this handle. Equivalent to dropping it.
    pub fn release(self) {}

    /// Number of live handles sharing this buffer's slot.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.shared)
    }

    /// Address of the first byte of this view. Stable while any handle to
    /// the slot is alive; used for zero-copy native I/O.
    pub fn memory_address(&self) -> usize {
        self.base_ptr() as usize
    }

    // ---------------------------------------------------------------------
    // Growth
    // ---------------------------------------------------------------------

    /// Makes room for at least `needed` more writable bytes, growing the
    /// buffer (and moving it to a new slot) when necessary.
    pub fn ensure_writable(&mut self, needed: usize) -> Result<(), AllocError> {
        if self.writable_bytes() >= needed {
            return Ok(());
        }
        let required = self.write_idx + needed;
        if required > self.max_capacity {
            return Err(AllocError::CapacityExceeded {
                requested: required,
                max: self.max_capacity,
            });
        }
        let new_cap = grow_capacity(required, self.max_capacity);
        let new_shared = match self.shared.allocator() {
            Some(alloc) => alloc.allocate_shared(new_cap)?,
            // Allocator already gone: keep the buffer usable with a
            // detached one-shot slot.
            None => BufShared::detached(new_cap),
        };
        self.install(new_shared, new_cap);
        Ok(())
    }

    pub(crate) fn reallocate(
        &mut self,
        allocator: &PooledAllocator,
        new_capacity: usize,
    ) -> Result<(), AllocError> {
        if new_capacity > self.max_capacity {
            return Err(AllocError::CapacityExceeded {
                requested: new_capacity,
                max: self.max_capacity,
            });
        }
        if new_capacity == self.capacity {
            return Ok(());
        }
        let new_shared = allocator.allocate_shared(new_capacity)?;
        self.install(new_shared, new_capacity);
        Ok(())
    }

    /// Moves the view onto `new_shared`, carrying `[read_idx, write_idx)`
    /// over at the same positions. Cursors are clamped when shrinking.
    fn install(&mut self, new_shared: Arc<BufShared>, new_capacity: usize) {
        let old_base = self.base_ptr();
        let r = self.read_idx.min(new_capacity);
        let w = self.write_idx.min(new_capacity);
        if w > r {
            unsafe {
                let dst = new_shared.memory.as_ptr().add(new_shared.offset);
                ptr::copy_nonoverlapping(old_base.add(r), dst.add(r), w - r);
            }
        }
        let old = std::mem::replace(&mut self.shared, new_shared);
        self.view_offset = 0;
        self.capacity = new_capacity;
        self.read_idx = r;
        self.write_idx = w;
        if self.suspended {
            self.stash.push(old);
        }
    }

    /// Parks slots vacated by reallocation instead of freeing them, until
    /// [`ByteBuf::resume_intermediary_deallocations`] is called. Used while
    /// a caller still holds raw pointers into the old memory.
    pub fn suspend_intermediary_deallocations(&mut self) {
        self.suspended = true;
    }

    /// Frees every slot parked since the matching suspend call.
    pub fn resume_intermediary_deallocations(&mut self) {
        self.suspended = false;
        self.stash.clear();
    }
}

/// Growth schedule: double from 64 bytes up to a 4 MiB threshold, then step
/// in 4 MiB increments, always clamped to `max`.
fn grow_capacity(required: usize, max: usize) -> usize {
    const THRESHOLD: usize = 4 * 1024 * 1024;
    debug_assert!(required <= max);
    if required >= THRESHOLD {
        let stepped = required / THRESHOLD * THRESHOLD;
        let grown = if stepped > max - THRESHOLD {
            max
        } else {
            stepped + THRESHOLD
        };
        grown.min(max)
    } else {
        let mut cap = 64usize;
        while cap < required {
            cap <<= 1;
        }
        cap.min(max)
    }
}

impl std::fmt::Debug for ByteBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteBuf")
            .field("read_idx", &self.read_idx)
            .field("write_idx", &self.write_idx)
            .field("capacity", &self.capacity)
            .field("max_capacity", &self.max_capacity)
            .field("order", &self.order)
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

impl bytes::Buf for ByteBuf {
    fn remaining(&self) -> usize {
        self.readable_bytes()
    }

    fn chunk(&self) -> &[u8] {
        self.readable_slice()
    }

    fn advance(&mut self, cnt: usize) {
        self.advance_read(cnt);
    }
}

unsafe impl bytes::BufMut for ByteBuf {
    fn remaining_mut(&self) -> usize {
        self.max_capacity - self.write_idx
    }

    unsafe fn advance_mut(&mut self, cnt: usize) {
        self.advance_write(cnt);
    }

    fn chunk_mut(&mut self) -> &mut UninitSlice {
        if self.writable_bytes() == 0 {
            self.reserve(64.min(self.max_capacity - self.write_idx).max(1));
        }
        UninitSlice::new(self.writable_slice_mut())
    }
}
