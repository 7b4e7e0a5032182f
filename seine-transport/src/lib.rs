//! # Seine Transport - Event Loops and Channels
//!
//! `seine-transport` drives the I/O side of the seine framework: selector
//! event loops, TCP and in-process channels, the outbound queue with
//! writability watermarks, and the flush-promise notifier.
//!
//! ## Architecture
//!
//! ```text
//!  EventLoopGroup
//!    ├─ EventLoop (thread 0) ── mio::Poll ── Channel, Channel, ...
//!    └─ EventLoop (thread 1) ── mio::Poll ── Channel, ...
//!
//!  per channel:
//!    readiness ──▶ read ──▶ Pipeline (inbound, head → tail)
//!    Pipeline (outbound, tail → head) ──▶ OutboundQueue ──▶ flush ──▶ socket
//!                                             │
//!                                             └─▶ FlushNotifier ──▶ write promises
//! ```
//!
//! One OS thread per [`EventLoop`]; a channel is affined to exactly one
//! loop for its lifetime, so its pipeline runs effectively
//! single-threaded. Cross-thread callers go through [`EventLoop::submit`]
//! or a [`ChannelHandle`].
//!
//! ## Example: echo over an in-process pair
//!
//! ```rust,no_run
//! use std::rc::Rc;
//! use seine::{ChannelError, Context, Handler, Message};
//! use seine_transport::{EventLoopBuilder, UnregisteredChannel};
//!
//! struct Echo;
//! impl Handler for Echo {
//!     fn channel_read(&mut self, ctx: &Context, msg: Message) -> Result<(), ChannelError> {
//!         ctx.write(msg);
//!         Ok(())
//!     }
//!     fn channel_read_complete(&mut self, ctx: &Context) -> Result<(), ChannelError> {
//!         ctx.flush();
//!         Ok(())
//!     }
//! }
//!
//! let event_loop = EventLoopBuilder::new().name("echo").spawn().unwrap();
//! let (server, client) = UnregisteredChannel::local_pair();
//! let server = event_loop.register(server.initializer(|ch| {
//!     ch.pipeline().add_last("echo", Echo)?;
//!     Ok(())
//! }));
//! let client = event_loop.register(client);
//! # let _ = (server, client);
//! ```

#![warn(rust_2018_idioms)]
#![warn(missing_docs)]

mod channel;
mod event_loop;
mod flush;
mod handle;
mod local;
mod outbound;

pub use channel::{
    Channel, ChannelConfig, ChannelInitializer, ChannelState, UnregisteredChannel,
};
pub use event_loop::{EventLoop, EventLoopBuilder, EventLoopGroup, TaskHandle};
pub use flush::FlushNotifier;
pub use handle::ChannelHandle;
