//! # Seine - Pipeline Core
//!
//! `seine` is the I/O-free core of the seine networking framework: the
//! channel pipeline, the [`Handler`] trait, write promises and the shared
//! error vocabulary. Transports, event loops and codecs build on top of it
//! (`seine-transport`, `seine-codec`, `seine-bootstrap`).
//!
//! ## Core concepts
//!
//! - **[`Pipeline`]**: a doubly-linked chain of named handler contexts with
//!   permanent head/tail sentinels. Inbound events flow head → tail,
//!   outbound operations flow tail → head.
//! - **[`Handler`]**: the unit of behaviour. Every callback defaults to
//!   forwarding, so handlers override only the direction they care about.
//! - **[`Context`]**: a handler's view of its position — `fire_*` to
//!   continue inbound events, operation methods to start outbound ones.
//! - **[`ChannelPromise`] / [`ChannelFuture`]**: completion of outbound
//!   operations, with listener callbacks and blocking waits.
//! - **[`OutboundSink`]**: the seam to the channel's I/O primitives; the
//!   pipeline head forwards every outbound operation into it.
//!
//! ## Threading model
//!
//! A pipeline is confined to its channel's event loop. Everything here is
//! `Rc`/`RefCell`-based on purpose: cross-thread callers reach a channel by
//! submitting a task to its loop, never by locking the pipeline.
//!
//! ## Example
//!
//! ```rust
//! use std::rc::Rc;
//! use seine::{ChannelError, Context, Handler, Message, NullSink, Pipeline};
//! use seine_buffer::{ByteBuf, PooledAllocator};
//!
//! /// Counts inbound bytes and forwards every message untouched.
//! struct ByteCounter {
//!     seen: u64,
//! }
//!
//! impl Handler for ByteCounter {
//!     fn channel_read(&mut self, ctx: &Context, msg: Message) -> Result<(), ChannelError> {
//!         if let Some(buf) = msg.downcast_ref::<ByteBuf>() {
//!             self.seen += buf.readable_bytes() as u64;
//!         }
//!         ctx.fire_channel_read(msg);
//!         Ok(())
//!     }
//! }
//!
//! let alloc = PooledAllocator::default();
//! let pipeline = Pipeline::new(alloc.clone(), Rc::new(NullSink));
//! pipeline.add_last("counter", ByteCounter { seen: 0 }).unwrap();
//!
//! let mut buf = alloc.allocate(16, 16).unwrap();
//! buf.write_bytes(b"hello");
//! pipeline.fire_channel_read(Box::new(buf));
//! // The tail released the buffer; nothing leaked.
//! assert_eq!(alloc.outstanding(), 0);
//! ```

#![warn(rust_2018_idioms)]
#![warn(missing_docs)]

mod error;
mod handler;
mod handler_internal;
mod pipeline;
mod promise;

pub use error::ChannelError;
pub use handler::{Context, Handler, Message};
pub use pipeline::{NullSink, OutboundSink, Pipeline, HEAD_NAME, TAIL_NAME};
pub use promise::{ChannelFuture, ChannelPromise};
