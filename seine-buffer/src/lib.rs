//! # Seine Buffer - Pooled Byte Buffers
//!
//! `seine-buffer` provides the buffer layer of the seine networking
//! framework: a size-classed arena allocator producing reference-counted
//! [`ByteBuf`]s that back every I/O operation in the stack.
//!
//! ## Architecture
//!
//! ```text
//!  PooledAllocator
//!    ├─ Arena 0 ──┐        (threads bind to arenas round-robin;
//!    ├─ Arena 1   │         each arena serialises itself internally)
//!    └─ Arena N   │
//!                 ▼
//!            Chunk (16 MiB)
//!            ├─ buddy tree over 8 KiB pages  → "normal" runs
//!            └─ Subpage: one page split into
//!               equal slots                  → "tiny" / "small" slots
//! ```
//!
//! Three size regimes serve an allocation request:
//!
//! - **tiny** (< 512 B): subpage slots rounded to a 16-byte quantum
//! - **small** (< 8 KiB): subpage slots rounded to a power of two
//! - **normal** (≤ half a chunk): runs from the buddy tree
//!
//! Anything larger bypasses the pools and gets a one-shot region that is
//! freed wholesale when released.
//!
//! ## Buffer lifecycle
//!
//! [`ByteBuf`] handles are reference counted. [`ByteBuf::retain`],
//! [`ByteBuf::slice`] and [`ByteBuf::duplicate`] produce additional owned
//! handles; when the last one drops, the slot returns to its arena. Release
//! is RAII, so leaks are the only representable misuse, and
//! [`PooledAllocator::outstanding`] exists to catch those in tests.
//!
//! ## Example
//!
//! ```rust
//! use seine_buffer::{AllocatorConfig, PooledAllocator};
//!
//! let alloc = PooledAllocator::new(AllocatorConfig::default());
//! let mut buf = alloc.allocate(256, 4096).unwrap();
//!
//! buf.write_bytes(b"length-prefixed ");
//! buf.write_u16(42);
//!
//! let mut text = [0u8; 16];
//! buf.read_bytes(&mut text);
//! assert_eq!(&text, b"length-prefixed ");
//! assert_eq!(buf.read_u16(), 42);
//!
//! drop(buf);
//! assert_eq!(alloc.outstanding(), 0);
//! ```

#![warn(rust_2018_idioms)]
#![warn(missing_docs)]

mod alloc;
mod arena;
mod byte_buf;
mod chunk;
mod error;
mod recv_sizer;
mod subpage;

pub use alloc::{AllocatorConfig, PooledAllocator};
pub use byte_buf::{ByteBuf, ByteOrder};
pub use error::AllocError;
pub use recv_sizer::AdaptiveRecvSizer;
