//! # Pipeline - Chain of Handlers for One Channel
//!
//! A [`Pipeline`] is an ordered chain of named handler contexts between two
//! permanent sentinels:
//!
//! - the **head** adapts outbound operations onto the channel's I/O
//!   primitives (an [`OutboundSink`]),
//! - the **tail** terminates inbound events: it releases unconsumed read
//!   messages and logs unhandled exceptions at `warn`.
//!
//! Inbound events flow head → tail, outbound operations flow tail → head.
//! The chain is doubly linked — strong `next` references and weak `prev`
//! references — so dropping a channel dismantles its pipeline without a
//! cycle collector.
//!
//! ## Dynamic modification
//!
//! Handlers can be added and removed while the channel is live, including
//! from inside handler callbacks. Every structural change runs the affected
//! handler's `handler_added`/`handler_removed` hook; hook failures are
//! logged and never undo the change. Modification errors use
//! `std::io::Error` (`AlreadyExists`, `NotFound`, `PermissionDenied` for
//! the reserved sentinel names).
//!
//! ## Example
//!
//! ```rust
//! use std::rc::Rc;
//! use seine::{Handler, NullSink, Pipeline};
//! use seine_buffer::PooledAllocator;
//!
//! struct NoOp;
//! impl Handler for NoOp {}
//!
//! let pipeline = Pipeline::new(PooledAllocator::default(), Rc::new(NullSink));
//! pipeline.add_last("noop", NoOp).unwrap();
//! assert_eq!(pipeline.names(), vec!["noop".to_string()]);
//! pipeline.remove("noop").unwrap();
//! assert!(pipeline.names().is_empty());
//! ```

use std::io::{Error, ErrorKind};
use std::net::SocketAddr;
use std::rc::Rc;

use log::{debug, warn};
use seine_buffer::PooledAllocator;

use crate::error::ChannelError;
use crate::handler::{Context, Handler, Message};
use crate::handler_internal::{
    invoke_bind, invoke_channel_active, invoke_channel_inactive, invoke_channel_read,
    invoke_channel_read_complete, invoke_channel_registered, invoke_channel_unregistered,
    invoke_channel_writability_changed, invoke_close, invoke_connect, invoke_deregister,
    invoke_disconnect, invoke_exception_caught, invoke_flush, invoke_handler_added,
    invoke_handler_removed, invoke_read, invoke_user_event_triggered, invoke_write, ContextInner,
    PipelineShared,
};
use crate::promise::{ChannelFuture, ChannelPromise};

/// Reserved name of the head sentinel context.
pub const HEAD_NAME: &str = "head";
/// Reserved name of the tail sentinel context.
pub const TAIL_NAME: &str = "tail";

/// The channel-side executor of outbound operations.
///
/// The pipeline itself is I/O-free; its head forwards every outbound
/// operation to this trait, which the owning channel implements against its
/// transport. Implementations are expected to be loop-confined.
pub trait OutboundSink {
    /// Enqueue `msg` on the channel's outbound queue.
    fn write(&self, msg: Message, promise: ChannelPromise);
    /// Transmit everything enqueued so far.
    fn flush(&self);
    /// Re-arm read interest.
    fn read(&self);
    /// Bind to a local address.
    fn bind(&self, addr: SocketAddr, promise: ChannelPromise);
    /// Connect to a remote address.
    fn connect(&self, remote: SocketAddr, local: Option<SocketAddr>, promise: ChannelPromise);
    /// Half-teardown; stream transports treat this as `close`.
    fn disconnect(&self, promise: ChannelPromise);
    /// Orderly shutdown.
    fn close(&self, promise: ChannelPromise);
    /// Detach from the event loop.
    fn deregister(&self, promise: ChannelPromise);
}

/// An [`OutboundSink`] that fails every operation with
/// [`ChannelError::NotRegistered`]. Useful for handler unit tests and as
/// the placeholder sink of unregistered channels.
pub struct NullSink;

impl OutboundSink for NullSink {
    fn write(&self, _msg: Message, promise: ChannelPromise) {
        promise.fail(ChannelError::NotRegistered);
    }

    fn flush(&self) {}

    fn read(&self) {}

    fn bind(&self, _addr: SocketAddr, promise: ChannelPromise) {
        promise.fail(ChannelError::NotRegistered);
    }

    fn connect(&self, _remote: SocketAddr, _local: Option<SocketAddr>, promise: ChannelPromise) {
        promise.fail(ChannelError::NotRegistered);
    }

    fn disconnect(&self, promise: ChannelPromise) {
        promise.fail(ChannelError::NotRegistered);
    }

    fn close(&self, promise: ChannelPromise) {
        promise.fail(ChannelError::NotRegistered);
    }

    fn deregister(&self, promise: ChannelPromise) {
        promise.fail(ChannelError::NotRegistered);
    }
}

/// Head sentinel: hands outbound operations to the channel's sink. Inbound
/// events never visit it — they enter the chain at the first user context.
struct HeadHandler;

impl Handler for HeadHandler {
    fn bind(
        &mut self,
        ctx: &Context,
        addr: SocketAddr,
        promise: ChannelPromise,
    ) -> Result<(), ChannelError> {
        ctx.sink().bind(addr, promise);
        Ok(())
    }

    fn connect(
        &mut self,
        ctx: &Context,
        remote: SocketAddr,
        local: Option<SocketAddr>,
        promise: ChannelPromise,
    ) -> Result<(), ChannelError> {
        ctx.sink().connect(remote, local, promise);
        Ok(())
    }

    fn disconnect(&mut self, ctx: &Context, promise: ChannelPromise) -> Result<(), ChannelError> {
        ctx.sink().disconnect(promise);
        Ok(())
    }

    fn close(&mut self, ctx: &Context, promise: ChannelPromise) -> Result<(), ChannelError> {
        ctx.sink().close(promise);
        Ok(())
    }

    fn deregister(&mut self, ctx: &Context, promise: ChannelPromise) -> Result<(), ChannelError> {
        ctx.sink().deregister(promise);
        Ok(())
    }

    fn read(&mut self, ctx: &Context) -> Result<(), ChannelError> {
        ctx.sink().read();
        Ok(())
    }

    fn write(
        &mut self,
        ctx: &Context,
        msg: Message,
        promise: ChannelPromise,
    ) -> Result<(), ChannelError> {
        ctx.sink().write(msg, promise);
        Ok(())
    }

    fn flush(&mut self, ctx: &Context) -> Result<(), ChannelError> {
        ctx.sink().flush();
        Ok(())
    }
}

/// Tail sentinel: terminates the inbound chain.
struct TailHandler;

impl Handler for TailHandler {
    fn channel_registered(&mut self, _ctx: &Context) -> Result<(), ChannelError> {
        Ok(())
    }

    fn channel_unregistered(&mut self, _ctx: &Context) -> Result<(), ChannelError> {
        Ok(())
    }

    fn channel_active(&mut self, _ctx: &Context) -> Result<(), ChannelError> {
        Ok(())
    }

    fn channel_inactive(&mut self, _ctx: &Context) -> Result<(), ChannelError> {
        Ok(())
    }

    fn channel_read(&mut self, _ctx: &Context, msg: Message) -> Result<(), ChannelError> {
        // Dropping releases pooled buffers, so a handler that forgets to
        // consume a message cannot leak its slot.
        debug!("discarded an inbound message that reached the tail of the pipeline");
        drop(msg);
        Ok(())
    }

    fn channel_read_complete(&mut self, _ctx: &Context) -> Result<(), ChannelError> {
        Ok(())
    }

    fn channel_writability_changed(&mut self, _ctx: &Context) -> Result<(), ChannelError> {
        Ok(())
    }

    fn user_event_triggered(&mut self, _ctx: &Context, event: Message) -> Result<(), ChannelError> {
        debug!("discarded a user event that reached the tail of the pipeline");
        drop(event);
        Ok(())
    }

    fn exception_caught(&mut self, _ctx: &Context, cause: ChannelError) -> Result<(), ChannelError> {
        warn!("an exception reached the tail of the pipeline: {cause}");
        Ok(())
    }
}

/// The pipeline of one channel. Cheap to clone (a shared view); confined to
/// the channel's event loop.
#[derive(Clone)]
pub struct Pipeline {
    head: Rc<ContextInner>,
    tail: Rc<ContextInner>,
    shared: Rc<PipelineShared>,
}

impl Pipeline {
    /// Creates a pipeline containing only the head and tail sentinels.
    pub fn new(allocator: PooledAllocator, sink: Rc<dyn OutboundSink>) -> Pipeline {
        let shared = PipelineShared::new(allocator, sink);
        let head = ContextInner::new(HEAD_NAME, Box::new(HeadHandler), &shared);
        let tail = ContextInner::new(TAIL_NAME, Box::new(TailHandler), &shared);
        *head.next.borrow_mut() = Some(Rc::clone(&tail));
        *tail.prev.borrow_mut() = Rc::downgrade(&head);
        *shared.head.borrow_mut() = Rc::downgrade(&head);
        *shared.tail.borrow_mut() = Rc::downgrade(&tail);
        Pipeline { head, tail, shared }
    }

    pub(crate) fn from_shared(shared: &Rc<PipelineShared>) -> Pipeline {
        let head = shared
            .head
            .borrow()
            .upgrade()
            .expect("pipeline has been dismantled");
        let tail = shared
            .tail
            .borrow()
            .upgrade()
            .expect("pipeline has been dismantled");
        Pipeline {
            head,
            tail,
            shared: Rc::clone(shared),
        }
    }

    /// The channel's buffer allocator.
    pub fn alloc(&self) -> PooledAllocator {
        self.shared.allocator.clone()
    }

    // -----------------------------------------------------------------
    // Structure
    // -----------------------------------------------------------------

    fn check_insert(&self, name: &str) -> Result<(), Error> {
        if name == HEAD_NAME || name == TAIL_NAME {
            return Err(Error::new(
                ErrorKind::PermissionDenied,
                format!("handler name \"{name}\" is reserved"),
            ));
        }
        if self.find(name).is_some() {
            return Err(Error::new(
                ErrorKind::AlreadyExists,
                format!("a handler named \"{name}\" is already in the pipeline"),
            ));
        }
        Ok(())
    }

    fn find(&self, name: &str) -> Option<Rc<ContextInner>> {
        let mut cur = self.head.next_ctx();
        while let Some(ctx) = cur {
            if Rc::ptr_eq(&ctx, &self.tail) {
                return None;
            }
            if ctx.name == name {
                return Some(ctx);
            }
            cur = ctx.next_ctx();
        }
        None
    }

    fn link(left: &Rc<ContextInner>, mid: &Rc<ContextInner>, right: &Rc<ContextInner>) {
        *mid.prev.borrow_mut() = Rc::downgrade(left);
        *mid.next.borrow_mut() = Some(Rc::clone(right));
        *left.next.borrow_mut() = Some(Rc::clone(mid));
        *right.prev.borrow_mut() = Rc::downgrade(mid);
    }

    fn unlink(ctx: &Rc<ContextInner>) {
        let left = ctx.prev_ctx().expect("context already detached");
        let right = ctx.next_ctx().expect("context already detached");
        *left.next.borrow_mut() = Some(Rc::clone(&right));
        *right.prev.borrow_mut() = Rc::downgrade(&left);
        // The removed context keeps its own links so an event currently
        // holding it can still walk on.
        ctx.removed.set(true);
    }

    /// Appends a handler just before the tail.
    pub fn add_last(&self, name: &str, handler: impl Handler) -> Result<(), Error> {
        self.check_insert(name)?;
        let ctx = ContextInner::new(name, Box::new(handler), &self.shared);
        let left = self.tail.prev_ctx().expect("tail lost its predecessor");
        Self::link(&left, &ctx, &self.tail);
        invoke_handler_added(&ctx);
        Ok(())
    }

    /// Inserts a handler right after the head.
    pub fn add_first(&self, name: &str, handler: impl Handler) -> Result<(), Error> {
        self.check_insert(name)?;
        let ctx = ContextInner::new(name, Box::new(handler), &self.shared);
        let right = self.head.next_ctx().expect("head lost its successor");
        Self::link(&self.head, &ctx, &right);
        invoke_handler_added(&ctx);
        Ok(())
    }

    /// Inserts a handler before the named one.
    pub fn add_before(&self, existing: &str, name: &str, handler: impl Handler) -> Result<(), Error> {
        self.check_insert(name)?;
        let anchor = self.find(existing).ok_or_else(|| not_found(existing))?;
        let ctx = ContextInner::new(name, Box::new(handler), &self.shared);
        let left = anchor.prev_ctx().expect("anchor lost its predecessor");
        Self::link(&left, &ctx, &anchor);
        invoke_handler_added(&ctx);
        Ok(())
    }

    /// Inserts a handler after the named one.
    pub fn add_after(&self, existing: &str, name: &str, handler: impl Handler) -> Result<(), Error> {
        self.check_insert(name)?;
        let anchor = self.find(existing).ok_or_else(|| not_found(existing))?;
        let ctx = ContextInner::new(name, Box::new(handler), &self.shared);
        let right = anchor.next_ctx().expect("anchor lost its successor");
        Self::link(&anchor, &ctx, &right);
        invoke_handler_added(&ctx);
        Ok(())
    }

    /// Removes the named handler.
    pub fn remove(&self, name: &str) -> Result<(), Error> {
        if name == HEAD_NAME || name == TAIL_NAME {
            return Err(Error::new(
                ErrorKind::PermissionDenied,
                format!("handler name \"{name}\" is reserved"),
            ));
        }
        let ctx = self.find(name).ok_or_else(|| not_found(name))?;
        Self::unlink(&ctx);
        invoke_handler_removed(&ctx);
        Ok(())
    }

    /// Replaces the named handler with a new one (possibly under a new
    /// name), keeping its position.
    pub fn replace(&self, old_name: &str, name: &str, handler: impl Handler) -> Result<(), Error> {
        if old_name == HEAD_NAME || old_name == TAIL_NAME {
            return Err(Error::new(
                ErrorKind::PermissionDenied,
                format!("handler name \"{old_name}\" is reserved"),
            ));
        }
        if name != old_name {
            self.check_insert(name)?;
        }
        let old = self.find(old_name).ok_or_else(|| not_found(old_name))?;
        let ctx = ContextInner::new(name, Box::new(handler), &self.shared);
        let left = old.prev_ctx().expect("context lost its predecessor");
        let right = old.next_ctx().expect("context lost its successor");
        Self::link(&left, &ctx, &right);
        old.removed.set(true);
        invoke_handler_added(&ctx);
        invoke_handler_removed(&old);
        Ok(())
    }

    /// The context of the named handler, if present.
    pub fn get(&self, name: &str) -> Option<Context> {
        self.find(name).map(Context::from_inner)
    }

    /// Names of the user handlers, head to tail.
    pub fn names(&self) -> Vec<String> {
        let mut out = Vec::new();
        let mut cur = self.head.next_ctx();
        while let Some(ctx) = cur {
            if Rc::ptr_eq(&ctx, &self.tail) {
                break;
            }
            out.push(ctx.name.clone());
            cur = ctx.next_ctx();
        }
        out
    }

    /// Number of user handlers.
    pub fn len(&self) -> usize {
        self.names().len()
    }

    /// True when only the sentinels are present.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn first(&self) -> Option<Rc<ContextInner>> {
        self.head.next_ctx()
    }

    fn last(&self) -> Option<Rc<ContextInner>> {
        self.tail.prev_ctx()
    }

    // -----------------------------------------------------------------
    // Inbound entry points (called by the channel)
    // -----------------------------------------------------------------

    /// Fires `channel_registered` into the chain.
    pub fn fire_channel_registered(&self) {
        if let Some(first) = self.first() {
            invoke_channel_registered(first);
        }
    }

    /// Fires `channel_unregistered` into the chain.
    pub fn fire_channel_unregistered(&self) {
        if let Some(first) = self.first() {
            invoke_channel_unregistered(first);
        }
    }

    /// Fires `channel_active` into the chain.
    pub fn fire_channel_active(&self) {
        if let Some(first) = self.first() {
            invoke_channel_active(first);
        }
    }

    /// Fires `channel_inactive` into the chain.
    pub fn fire_channel_inactive(&self) {
        if let Some(first) = self.first() {
            invoke_channel_inactive(first);
        }
    }

    /// Delivers one inbound message to the chain.
    pub fn fire_channel_read(&self, msg: Message) {
        if let Some(first) = self.first() {
            invoke_channel_read(first, msg);
        }
    }

    /// Fires `channel_read_complete` into the chain.
    pub fn fire_channel_read_complete(&self) {
        if let Some(first) = self.first() {
            invoke_channel_read_complete(first);
        }
    }

    /// Fires `channel_writability_changed` into the chain.
    pub fn fire_channel_writability_changed(&self) {
        if let Some(first) = self.first() {
            invoke_channel_writability_changed(first);
        }
    }

    /// Delivers a user event to the chain.
    pub fn fire_user_event_triggered(&self, event: Message) {
        if let Some(first) = self.first() {
            invoke_user_event_triggered(first, event);
        }
    }

    /// Delivers an exception to the chain.
    pub fn fire_exception_caught(&self, cause: ChannelError) {
        if let Some(first) = self.first() {
            invoke_exception_caught(first, cause);
        }
    }

    // -----------------------------------------------------------------
    // Outbound entry points (called by users of the channel)
    // -----------------------------------------------------------------

    /// Enqueues `msg` through the whole outbound chain.
    pub fn write(&self, msg: Message) -> ChannelFuture {
        let (promise, future) = ChannelPromise::new();
        self.write_with_promise(msg, promise);
        future
    }

    /// `write` with a caller-supplied promise.
    pub fn write_with_promise(&self, msg: Message, promise: ChannelPromise) {
        if let Some(last) = self.last() {
            invoke_write(last, msg, promise);
        }
    }

    /// `write` followed by `flush`.
    pub fn write_and_flush(&self, msg: Message) -> ChannelFuture {
        let future = self.write(msg);
        self.flush();
        future
    }

    /// Flushes the outbound queue.
    pub fn flush(&self) {
        if let Some(last) = self.last() {
            invoke_flush(last);
        }
    }

    /// Requests more inbound data.
    pub fn read(&self) {
        if let Some(last) = self.last() {
            invoke_read(last);
        }
    }

    /// Binds the channel.
    pub fn bind(&self, addr: SocketAddr) -> ChannelFuture {
        let (promise, future) = ChannelPromise::new();
        if let Some(last) = self.last() {
            invoke_bind(last, addr, promise);
        }
        future
    }

    /// Connects the channel.
    pub fn connect(&self, remote: SocketAddr, local: Option<SocketAddr>) -> ChannelFuture {
        let (promise, future) = ChannelPromise::new();
        if let Some(last) = self.last() {
            invoke_connect(last, remote, local, promise);
        }
        future
    }

    /// Disconnects the channel.
    pub fn disconnect(&self) -> ChannelFuture {
        let (promise, future) = ChannelPromise::new();
        if let Some(last) = self.last() {
            invoke_disconnect(last, promise);
        }
        future
    }

    /// Closes the channel.
    pub fn close(&self) -> ChannelFuture {
        let (promise, future) = ChannelPromise::new();
        self.close_with_promise(promise);
        future
    }

    /// `close` with a caller-supplied promise.
    pub fn close_with_promise(&self, promise: ChannelPromise) {
        if let Some(last) = self.last() {
            invoke_close(last, promise);
        }
    }

    /// Deregisters the channel from its loop.
    pub fn deregister(&self) -> ChannelFuture {
        let (promise, future) = ChannelPromise::new();
        if let Some(last) = self.last() {
            invoke_deregister(last, promise);
        }
        future
    }
}

fn not_found(name: &str) -> Error {
    Error::new(
        ErrorKind::NotFound,
        format!("no handler named \"{name}\" in the pipeline"),
    )
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline").field("names", &self.names()).finish()
    }
}
