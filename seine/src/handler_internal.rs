//! Internal context nodes and the dispatch machinery.
//!
//! Contexts form a doubly-linked chain: `next` links are strong (the chain
//! owns itself forward from the head), `prev` links are weak so teardown is
//! a plain drop of the head. Handler invocation goes through `dispatch`,
//! which tracks the nesting depth of pipeline activity on this chain.
//!
//! Re-entrancy: a handler that is already running cannot be borrowed again
//! (one `RefCell` per context). When an event or operation walks back into
//! such a handler — e.g. a dual codec whose `channel_read` triggered a
//! `write` that flows outbound through the same codec — the invocation is
//! parked and replayed in order once the current dispatch unwinds. This is
//! the single-threaded rendition of "submit it to the loop".

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};

use log::warn;
use seine_buffer::PooledAllocator;

use crate::error::ChannelError;
use crate::handler::{Context, Handler, Message};
use crate::pipeline::OutboundSink;
use crate::promise::ChannelPromise;

pub(crate) struct PipelineShared {
    pub(crate) allocator: PooledAllocator,
    pub(crate) sink: Rc<dyn OutboundSink>,
    pub(crate) head: RefCell<Weak<ContextInner>>,
    pub(crate) tail: RefCell<Weak<ContextInner>>,
    depth: Cell<usize>,
    deferred: RefCell<VecDeque<Box<dyn FnOnce()>>>,
}

impl PipelineShared {
    pub(crate) fn new(allocator: PooledAllocator, sink: Rc<dyn OutboundSink>) -> Rc<Self> {
        Rc::new(PipelineShared {
            allocator,
            sink,
            head: RefCell::new(Weak::new()),
            tail: RefCell::new(Weak::new()),
            depth: Cell::new(0),
            deferred: RefCell::new(VecDeque::new()),
        })
    }
}

pub(crate) struct ContextInner {
    pub(crate) name: String,
    pub(crate) handler: RefCell<Box<dyn Handler>>,
    pub(crate) next: RefCell<Option<Rc<ContextInner>>>,
    pub(crate) prev: RefCell<Weak<ContextInner>>,
    pub(crate) removed: Cell<bool>,
    pub(crate) shared: Rc<PipelineShared>,
}

impl ContextInner {
    pub(crate) fn new(
        name: &str,
        handler: Box<dyn Handler>,
        shared: &Rc<PipelineShared>,
    ) -> Rc<Self> {
        Rc::new(ContextInner {
            name: name.to_string(),
            handler: RefCell::new(handler),
            next: RefCell::new(None),
            prev: RefCell::new(Weak::new()),
            removed: Cell::new(false),
            shared: Rc::clone(shared),
        })
    }

    pub(crate) fn next_ctx(&self) -> Option<Rc<ContextInner>> {
        self.next.borrow().clone()
    }

    pub(crate) fn prev_ctx(&self) -> Option<Rc<ContextInner>> {
        self.prev.borrow().upgrade()
    }
}

struct DepthGuard<'a>(&'a PipelineShared);

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        let shared = self.0;
        shared.depth.set(shared.depth.get() - 1);
        if shared.depth.get() == 0 && !std::thread::panicking() {
            // Replay invocations parked while their handler was busy.
            loop {
                let job = shared.deferred.borrow_mut().pop_front();
                match job {
                    Some(job) => job(),
                    None => break,
                }
            }
        }
    }
}

fn dispatch(shared: &Rc<PipelineShared>, f: impl FnOnce()) {
    shared.depth.set(shared.depth.get() + 1);
    let guard = DepthGuard(shared);
    f();
    drop(guard);
}

/// Runs an inbound callback on `ctx`. An `Err` surfaces as an
/// `exception_caught` event at the next context.
fn invoke_inbound<F>(ctx: Rc<ContextInner>, f: F)
where
    F: FnOnce(&mut Box<dyn Handler>, &Context) -> Result<(), ChannelError> + 'static,
{
    let shared = Rc::clone(&ctx.shared);
    dispatch(&shared, move || {
        if let Ok(mut handler) = ctx.handler.try_borrow_mut() {
            let c = Context::from_inner(Rc::clone(&ctx));
            let result = f(&mut handler, &c);
            drop(handler);
            if let Err(err) = result {
                fire_exception_forward(&ctx, err);
            }
            return;
        }
        // Handler already on the stack: replay after the current dispatch
        // unwinds.
        let replay = Rc::clone(&ctx.shared);
        replay
            .deferred
            .borrow_mut()
            .push_back(Box::new(move || invoke_inbound(ctx, f)));
    });
}

/// Runs an outbound callback on `ctx`. An `Err` fails the operation's
/// promise and additionally travels the inbound chain as `exception_caught`.
fn invoke_outbound<F>(ctx: Rc<ContextInner>, promise: Option<ChannelPromise>, f: F)
where
    F: FnOnce(&mut Box<dyn Handler>, &Context) -> Result<(), ChannelError> + 'static,
{
    let shared = Rc::clone(&ctx.shared);
    dispatch(&shared, move || {
        if let Ok(mut handler) = ctx.handler.try_borrow_mut() {
            let c = Context::from_inner(Rc::clone(&ctx));
            let result = f(&mut handler, &c);
            drop(handler);
            if let Err(err) = result {
                if let Some(promise) = promise {
                    promise.fail(err.clone());
                }
                fire_exception_from_head(&ctx.shared, err);
            }
            return;
        }
        // Handler already on the stack: replay after the current dispatch
        // unwinds.
        let replay = Rc::clone(&ctx.shared);
        replay
            .deferred
            .borrow_mut()
            .push_back(Box::new(move || invoke_outbound(ctx, promise, f)));
    });
}

/// Delivers an exception raised *by* `ctx` to the next context onward.
pub(crate) fn fire_exception_forward(ctx: &Rc<ContextInner>, err: ChannelError) {
    match ctx.next_ctx() {
        Some(next) => invoke_exception_caught(next, err),
        None => warn!("exception fell off the end of the pipeline: {err}"),
    }
}

/// Delivers an exception along the whole inbound chain, starting at the
/// first user context.
pub(crate) fn fire_exception_from_head(shared: &Rc<PipelineShared>, err: ChannelError) {
    let first = shared.head.borrow().upgrade().and_then(|h| h.next_ctx());
    match first {
        Some(first) => invoke_exception_caught(first, err),
        None => warn!("exception raised on a dismantled pipeline: {err}"),
    }
}

// ---------------------------------------------------------------------
// Inbound event invokers
// ---------------------------------------------------------------------

pub(crate) fn invoke_channel_registered(ctx: Rc<ContextInner>) {
    invoke_inbound(ctx, |h, c| h.channel_registered(c));
}

pub(crate) fn invoke_channel_unregistered(ctx: Rc<ContextInner>) {
    invoke_inbound(ctx, |h, c| h.channel_unregistered(c));
}

pub(crate) fn invoke_channel_active(ctx: Rc<ContextInner>) {
    invoke_inbound(ctx, |h, c| h.channel_active(c));
}

pub(crate) fn invoke_channel_inactive(ctx: Rc<ContextInner>) {
    invoke_inbound(ctx, |h, c| h.channel_inactive(c));
}

pub(crate) fn invoke_channel_read(ctx: Rc<ContextInner>, msg: Message) {
    invoke_inbound(ctx, move |h, c| h.channel_read(c, msg));
}

pub(crate) fn invoke_channel_read_complete(ctx: Rc<ContextInner>) {
    invoke_inbound(ctx, |h, c| h.channel_read_complete(c));
}

pub(crate) fn invoke_channel_writability_changed(ctx: Rc<ContextInner>) {
    invoke_inbound(ctx, |h, c| h.channel_writability_changed(c));
}

pub(crate) fn invoke_user_event_triggered(ctx: Rc<ContextInner>, event: Message) {
    invoke_inbound(ctx, move |h, c| h.user_event_triggered(c, event));
}

pub(crate) fn invoke_exception_caught(ctx: Rc<ContextInner>, cause: ChannelError) {
    invoke_inbound(ctx, move |h, c| h.exception_caught(c, cause));
}

// ---------------------------------------------------------------------
// Outbound operation invokers
// ---------------------------------------------------------------------

pub(crate) fn invoke_write(ctx: Rc<ContextInner>, msg: Message, promise: ChannelPromise) {
    let p = promise.clone();
    invoke_outbound(ctx, Some(p), move |h, c| h.write(c, msg, promise));
}

pub(crate) fn invoke_flush(ctx: Rc<ContextInner>) {
    invoke_outbound(ctx, None, |h, c| h.flush(c));
}

pub(crate) fn invoke_read(ctx: Rc<ContextInner>) {
    invoke_outbound(ctx, None, |h, c| h.read(c));
}

pub(crate) fn invoke_bind(ctx: Rc<ContextInner>, addr: SocketAddr, promise: ChannelPromise) {
    let p = promise.clone();
    invoke_outbound(ctx, Some(p), move |h, c| h.bind(c, addr, promise));
}

pub(crate) fn invoke_connect(
    ctx: Rc<ContextInner>,
    remote: SocketAddr,
    local: Option<SocketAddr>,
    promise: ChannelPromise,
) {
    let p = promise.clone();
    invoke_outbound(ctx, Some(p), move |h, c| h.connect(c, remote, local, promise));
}

pub(crate) fn invoke_disconnect(ctx: Rc<ContextInner>, promise: ChannelPromise) {
    let p = promise.clone();
    invoke_outbound(ctx, Some(p), move |h, c| h.disconnect(c, promise));
}

pub(crate) fn invoke_close(ctx: Rc<ContextInner>, promise: ChannelPromise) {
    let p = promise.clone();
    invoke_outbound(ctx, Some(p), move |h, c| h.close(c, promise));
}

pub(crate) fn invoke_deregister(ctx: Rc<ContextInner>, promise: ChannelPromise) {
    let p = promise.clone();
    invoke_outbound(ctx, Some(p), move |h, c| h.deregister(c, promise));
}

// ---------------------------------------------------------------------
// Lifecycle hooks
// ---------------------------------------------------------------------

/// Hook failures are logged and do not undo the structural change.
pub(crate) fn invoke_handler_added(ctx: &Rc<ContextInner>) {
    let ctx = Rc::clone(ctx);
    let shared = Rc::clone(&ctx.shared);
    dispatch(&shared, move || {
        if let Ok(mut handler) = ctx.handler.try_borrow_mut() {
            let c = Context::from_inner(Rc::clone(&ctx));
            if let Err(err) = handler.handler_added(&c) {
                warn!("handler_added hook of '{}' failed: {err}", ctx.name);
            }
            return;
        }
        let replay = Rc::clone(&ctx.shared);
        replay
            .deferred
            .borrow_mut()
            .push_back(Box::new(move || invoke_handler_added(&ctx)));
    });
}

pub(crate) fn invoke_handler_removed(ctx: &Rc<ContextInner>) {
    let ctx = Rc::clone(ctx);
    let shared = Rc::clone(&ctx.shared);
    dispatch(&shared, move || {
        if let Ok(mut handler) = ctx.handler.try_borrow_mut() {
            let c = Context::from_inner(Rc::clone(&ctx));
            if let Err(err) = handler.handler_removed(&c) {
                warn!("handler_removed hook of '{}' failed: {err}", ctx.name);
            }
            return;
        }
        let replay = Rc::clone(&ctx.shared);
        replay
            .deferred
            .borrow_mut()
            .push_back(Box::new(move || invoke_handler_removed(&ctx)));
    });
}
