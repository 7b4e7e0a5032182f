//! # Handler Trait - Pipeline-Based Event Processing
//!
//! The [`Handler`] trait is the unit of behaviour in a channel pipeline.
//! Inbound events (data read, activation, errors) enter at the head of the
//! pipeline and flow toward the tail; outbound operations (`write`, `flush`,
//! `close`, ...) enter at the tail and flow toward the head, where the
//! channel's I/O primitives execute them.
//!
//! ```text
//!                                                  │ write(msg)
//!   +----------------------------------------------+-----------+
//!   |                        Pipeline              ▼           |
//!   |   +--------------------------------------------------+   |
//!   |   |                    Handler  N                    |   |
//!   |   +--------------------------------------------------+   |
//!   |             ▲                                │           |
//!   |             │ ctx.fire_channel_read(msg)     │ ctx.write |
//!   |   +--------------------------------------------------+   |
//!   |   |                    Handler  1                    |   |
//!   |   +--------------------------------------------------+   |
//!   |             ▲                                │           |
//!   +-------------+--------------------------------+-----------+
//!                 │ channel_read                   ▼ sink.write
//!   +-------------+--------------------------------------------+
//!   |            Channel I/O (event loop readiness)            |
//!   +----------------------------------------------------------+
//! ```
//!
//! ## Capabilities
//!
//! Every callback has a default implementation that forwards the event or
//! operation to the neighbouring handler, so a handler only overrides the
//! direction(s) it cares about:
//!
//! - an **inbound** handler overrides `channel_read` and friends,
//! - an **outbound** handler overrides `write`/`flush`/`close`/...,
//! - a **dual** handler (a codec, typically) overrides both.
//!
//! ## Messages and ownership
//!
//! Messages travel as [`Message`] (`Box<dyn Any>`); the common concrete type
//! is [`seine_buffer::ByteBuf`]. Passing a message downstream transfers
//! ownership. A handler that wants to keep buffer contents past its own
//! scope must `retain()` a handle first; a handler that consumes a message
//! simply lets it drop. Unconsumed reads that reach the tail are released
//! there so forgotten buffers do not leak.
//!
//! ## Errors
//!
//! Callbacks return `Result<(), ChannelError>`. An `Err` from an inbound
//! callback becomes an `exception_caught` event at the *next* context; an
//! `Err` from an outbound callback fails that operation's promise and also
//! fires `exception_caught` along the inbound chain so observability
//! handlers see it.
//!
//! ## Example
//!
//! ```rust
//! use seine::{ChannelError, Context, Handler, Message};
//!
//! /// Echoes every inbound message back to the peer.
//! struct EchoHandler;
//!
//! impl Handler for EchoHandler {
//!     fn channel_read(&mut self, ctx: &Context, msg: Message) -> Result<(), ChannelError> {
//!         ctx.write(msg);
//!         Ok(())
//!     }
//!
//!     fn channel_read_complete(&mut self, ctx: &Context) -> Result<(), ChannelError> {
//!         ctx.flush();
//!         Ok(())
//!     }
//! }
//! ```

use std::any::Any;
use std::net::SocketAddr;
use std::rc::Rc;

use seine_buffer::PooledAllocator;

use crate::error::ChannelError;
use crate::handler_internal::{
    invoke_bind, invoke_channel_active, invoke_channel_inactive, invoke_channel_read,
    invoke_channel_read_complete, invoke_channel_registered, invoke_channel_unregistered,
    invoke_channel_writability_changed, invoke_close, invoke_connect, invoke_deregister,
    invoke_disconnect, invoke_exception_caught, invoke_flush, invoke_read,
    invoke_user_event_triggered, invoke_write, ContextInner,
};
use crate::pipeline::Pipeline;
use crate::promise::{ChannelFuture, ChannelPromise};

/// The envelope every pipeline message travels in. [`seine_buffer::ByteBuf`]
/// is the common concrete type; codecs introduce their own.
pub type Message = Box<dyn Any>;

/// A unit of pipeline behaviour. See the [module docs](self).
///
/// Handlers are owned by their pipeline and confined to the channel's event
/// loop; they never need interior synchronisation. State that must be shared
/// across pipelines belongs outside the handler (the chat-room pattern:
/// `Rc<RefCell<Shared>>` captured at construction).
pub trait Handler: 'static {
    // -----------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------

    /// Called right after this handler was added to a pipeline.
    fn handler_added(&mut self, _ctx: &Context) -> Result<(), ChannelError> {
        Ok(())
    }

    /// Called right after this handler was removed from a pipeline.
    fn handler_removed(&mut self, _ctx: &Context) -> Result<(), ChannelError> {
        Ok(())
    }

    // -----------------------------------------------------------------
    // Inbound events (head → tail)
    // -----------------------------------------------------------------

    /// The channel was registered with its event loop.
    fn channel_registered(&mut self, ctx: &Context) -> Result<(), ChannelError> {
        ctx.fire_channel_registered();
        Ok(())
    }

    /// The channel was deregistered from its event loop.
    fn channel_unregistered(&mut self, ctx: &Context) -> Result<(), ChannelError> {
        ctx.fire_channel_unregistered();
        Ok(())
    }

    /// The channel became active (connected, or bound and listening).
    fn channel_active(&mut self, ctx: &Context) -> Result<(), ChannelError> {
        ctx.fire_channel_active();
        Ok(())
    }

    /// The channel left the active state; no further reads will arrive.
    fn channel_inactive(&mut self, ctx: &Context) -> Result<(), ChannelError> {
        ctx.fire_channel_inactive();
        Ok(())
    }

    /// One inbound message arrived. Ownership of `msg` transfers here:
    /// forward it, keep a retained copy, or consume it by dropping.
    fn channel_read(&mut self, ctx: &Context, msg: Message) -> Result<(), ChannelError> {
        ctx.fire_channel_read(msg);
        Ok(())
    }

    /// The current read burst finished; a good point to flush responses.
    fn channel_read_complete(&mut self, ctx: &Context) -> Result<(), ChannelError> {
        ctx.fire_channel_read_complete();
        Ok(())
    }

    /// The channel's writability flipped (outbound queue crossed a
    /// watermark).
    fn channel_writability_changed(&mut self, ctx: &Context) -> Result<(), ChannelError> {
        ctx.fire_channel_writability_changed();
        Ok(())
    }

    /// An application-defined event travelling the inbound chain.
    fn user_event_triggered(&mut self, ctx: &Context, event: Message) -> Result<(), ChannelError> {
        ctx.fire_user_event_triggered(event);
        Ok(())
    }

    /// An error raised by an earlier handler or by the transport.
    fn exception_caught(&mut self, ctx: &Context, cause: ChannelError) -> Result<(), ChannelError> {
        ctx.fire_exception_caught(cause);
        Ok(())
    }

    // -----------------------------------------------------------------
    // Outbound operations (tail → head)
    // -----------------------------------------------------------------

    /// Bind to a local address.
    fn bind(
        &mut self,
        ctx: &Context,
        addr: SocketAddr,
        promise: ChannelPromise,
    ) -> Result<(), ChannelError> {
        ctx.bind_with_promise(addr, promise);
        Ok(())
    }

    /// Connect to a remote (optionally from a specific local) address.
    fn connect(
        &mut self,
        ctx: &Context,
        remote: SocketAddr,
        local: Option<SocketAddr>,
        promise: ChannelPromise,
    ) -> Result<(), ChannelError> {
        ctx.connect_with_promise(remote, local, promise);
        Ok(())
    }

    /// Half-teardown: for stream transports this is equivalent to `close`.
    fn disconnect(&mut self, ctx: &Context, promise: ChannelPromise) -> Result<(), ChannelError> {
        ctx.disconnect_with_promise(promise);
        Ok(())
    }

    /// Orderly shutdown of the channel.
    fn close(&mut self, ctx: &Context, promise: ChannelPromise) -> Result<(), ChannelError> {
        ctx.close_with_promise(promise);
        Ok(())
    }

    /// Detach the channel from its event loop.
    fn deregister(&mut self, ctx: &Context, promise: ChannelPromise) -> Result<(), ChannelError> {
        ctx.deregister_with_promise(promise);
        Ok(())
    }

    /// Request more inbound data (re-arm read interest).
    fn read(&mut self, ctx: &Context) -> Result<(), ChannelError> {
        ctx.read();
        Ok(())
    }

    /// Enqueue a message on the outbound path. Does not touch the wire
    /// until a `flush`.
    fn write(
        &mut self,
        ctx: &Context,
        msg: Message,
        promise: ChannelPromise,
    ) -> Result<(), ChannelError> {
        ctx.write_with_promise(msg, promise);
        Ok(())
    }

    /// Push everything enqueued by `write` toward the socket.
    fn flush(&mut self, ctx: &Context) -> Result<(), ChannelError> {
        ctx.flush();
        Ok(())
    }
}

/// A handler's view of its pipeline position.
///
/// `fire_*` methods continue an inbound event at the next context toward the
/// tail; operation methods start an outbound operation at the previous
/// context toward the head. The context also exposes the channel's buffer
/// allocator and the owning [`Pipeline`] for dynamic modification.
pub struct Context {
    inner: Rc<ContextInner>,
}

impl Context {
    pub(crate) fn from_inner(inner: Rc<ContextInner>) -> Self {
        Context { inner }
    }

    /// The name this handler was registered under.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Whether the handler was removed from its pipeline.
    pub fn is_removed(&self) -> bool {
        self.inner.removed.get()
    }

    /// The channel's pooled buffer allocator.
    pub fn alloc(&self) -> PooledAllocator {
        self.inner.shared.allocator.clone()
    }

    /// The pipeline this context belongs to.
    pub fn pipeline(&self) -> Pipeline {
        Pipeline::from_shared(&self.inner.shared)
    }

    pub(crate) fn sink(&self) -> Rc<dyn crate::pipeline::OutboundSink> {
        Rc::clone(&self.inner.shared.sink)
    }

    // -----------------------------------------------------------------
    // Inbound forwarding
    // -----------------------------------------------------------------

    /// Continues the `channel_registered` event at the next context.
    pub fn fire_channel_registered(&self) {
        if let Some(next) = self.inner.next_ctx() {
            invoke_channel_registered(next);
        }
    }

    /// Continues the `channel_unregistered` event at the next context.
    pub fn fire_channel_unregistered(&self) {
        if let Some(next) = self.inner.next_ctx() {
            invoke_channel_unregistered(next);
        }
    }

    /// Continues the `channel_active` event at the next context.
    pub fn fire_channel_active(&self) {
        if let Some(next) = self.inner.next_ctx() {
            invoke_channel_active(next);
        }
    }

    /// Continues the `channel_inactive` event at the next context.
    pub fn fire_channel_inactive(&self) {
        if let Some(next) = self.inner.next_ctx() {
            invoke_channel_inactive(next);
        }
    }

    /// Forwards an inbound message to the next context, transferring
    /// ownership.
    pub fn fire_channel_read(&self, msg: Message) {
        match self.inner.next_ctx() {
            Some(next) => invoke_channel_read(next, msg),
            None => log::debug!("channel_read fell off the end of the pipeline; dropped"),
        }
    }

    /// Continues the `channel_read_complete` event at the next context.
    pub fn fire_channel_read_complete(&self) {
        if let Some(next) = self.inner.next_ctx() {
            invoke_channel_read_complete(next);
        }
    }

    /// Continues the `channel_writability_changed` event at the next
    /// context.
    pub fn fire_channel_writability_changed(&self) {
        if let Some(next) = self.inner.next_ctx() {
            invoke_channel_writability_changed(next);
        }
    }

    /// Forwards a user event to the next context.
    pub fn fire_user_event_triggered(&self, event: Message) {
        if let Some(next) = self.inner.next_ctx() {
            invoke_user_event_triggered(next, event);
        }
    }

    /// Forwards an exception to the next context.
    pub fn fire_exception_caught(&self, cause: ChannelError) {
        match self.inner.next_ctx() {
            Some(next) => invoke_exception_caught(next, cause),
            None => log::warn!("exception fell off the end of the pipeline: {cause}"),
        }
    }

    // -----------------------------------------------------------------
    // Outbound operations
    // -----------------------------------------------------------------

    fn prev_or_fail(&self, promise: &ChannelPromise) -> Option<Rc<ContextInner>> {
        let prev = self.inner.prev_ctx();
        if prev.is_none() {
            // Only reachable on a dismantled pipeline.
            promise.fail(ChannelError::Closed);
        }
        prev
    }

    /// Enqueues `msg` outbound; the returned future resolves when the bytes
    /// reached the wire (or the write failed).
    pub fn write(&self, msg: Message) -> ChannelFuture {
        let (promise, future) = ChannelPromise::new();
        self.write_with_promise(msg, promise);
        future
    }

    /// `write` with a caller-supplied promise.
    pub fn write_with_promise(&self, msg: Message, promise: ChannelPromise) {
        if let Some(prev) = self.prev_or_fail(&promise) {
            invoke_write(prev, msg, promise);
        }
    }

    /// `write` followed by `flush`.
    pub fn write_and_flush(&self, msg: Message) -> ChannelFuture {
        let future = self.write(msg);
        self.flush();
        future
    }

    /// Starts a flush of the outbound queue.
    pub fn flush(&self) {
        if let Some(prev) = self.inner.prev_ctx() {
            invoke_flush(prev);
        }
    }

    /// Requests more inbound data.
    pub fn read(&self) {
        if let Some(prev) = self.inner.prev_ctx() {
            invoke_read(prev);
        }
    }

    /// Binds the channel to `addr`.
    pub fn bind(&self, addr: SocketAddr) -> ChannelFuture {
        let (promise, future) = ChannelPromise::new();
        self.bind_with_promise(addr, promise);
        future
    }

    /// `bind` with a caller-supplied promise.
    pub fn bind_with_promise(&self, addr: SocketAddr, promise: ChannelPromise) {
        if let Some(prev) = self.prev_or_fail(&promise) {
            invoke_bind(prev, addr, promise);
        }
    }

    /// Connects the channel to `remote`.
    pub fn connect(&self, remote: SocketAddr, local: Option<SocketAddr>) -> ChannelFuture {
        let (promise, future) = ChannelPromise::new();
        self.connect_with_promise(remote, local, promise);
        future
    }

    /// `connect` with a caller-supplied promise.
    pub fn connect_with_promise(
        &self,
        remote: SocketAddr,
        local: Option<SocketAddr>,
        promise: ChannelPromise,
    ) {
        if let Some(prev) = self.prev_or_fail(&promise) {
            invoke_connect(prev, remote, local, promise);
        }
    }

    /// Disconnects the channel (equivalent to `close` for stream
    /// transports).
    pub fn disconnect(&self) -> ChannelFuture {
        let (promise, future) = ChannelPromise::new();
        self.disconnect_with_promise(promise);
        future
    }

    /// `disconnect` with a caller-supplied promise.
    pub fn disconnect_with_promise(&self, promise: ChannelPromise) {
        if let Some(prev) = self.prev_or_fail(&promise) {
            invoke_disconnect(prev, promise);
        }
    }

    /// Starts an orderly close of the channel.
    pub fn close(&self) -> ChannelFuture {
        let (promise, future) = ChannelPromise::new();
        self.close_with_promise(promise);
        future
    }

    /// `close` with a caller-supplied promise.
    pub fn close_with_promise(&self, promise: ChannelPromise) {
        if let Some(prev) = self.prev_or_fail(&promise) {
            invoke_close(prev, promise);
        }
    }

    /// Detaches the channel from its event loop.
    pub fn deregister(&self) -> ChannelFuture {
        let (promise, future) = ChannelPromise::new();
        self.deregister_with_promise(promise);
        future
    }

    /// `deregister` with a caller-supplied promise.
    pub fn deregister_with_promise(&self, promise: ChannelPromise) {
        if let Some(prev) = self.prev_or_fail(&promise) {
            invoke_deregister(prev, promise);
        }
    }
}
