//! Channels: one communicating endpoint each, affined to one event loop.
//!
//! A channel is created *unregistered* (a [`UnregisteredChannel`] spec that
//! is `Send`), then moved onto exactly one loop with
//! [`EventLoop::register`]. From that point on everything about it — the
//! pipeline, the transport, the outbound queue — lives on that loop and is
//! only touched from loop tasks. The `Send` face of a registered channel is
//! [`crate::ChannelHandle`].
//!
//! State machine: `Unregistered → Registered → Active → Inactive → Closed`,
//! strictly one-way. Pipeline events fire at each transition; the address
//! book is populated before `channel_active` and cleared after
//! `channel_inactive`.

use std::cell::{Cell, RefCell};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{trace, warn};
use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Token};

use seine::{
    ChannelError, ChannelFuture, ChannelPromise, Message, OutboundSink, Pipeline,
};
use seine_buffer::{AdaptiveRecvSizer, ByteBuf, PooledAllocator};

use crate::event_loop::{current_loop, EventLoop, EventLoopGroup, LoopContext};
use crate::flush::FlushNotifier;
use crate::handle::ChannelHandle;
use crate::local::LocalPairState;
use crate::outbound::OutboundQueue;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of a channel; transitions are one-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Created but not yet owned by an event loop.
    Unregistered,
    /// Owned by a loop; may bind or connect.
    Registered,
    /// Connected, or bound and listening.
    Active,
    /// No further I/O will happen; teardown in progress.
    Inactive,
    /// Terminal. A closed channel never reopens.
    Closed,
}

/// Per-channel tuning: watermarks, receive sizing, read behaviour.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Outbound bytes above which the channel reports unwritable.
    pub high_water_mark: usize,
    /// Outbound bytes below which writability recovers.
    pub low_water_mark: usize,
    /// Lower bound for the adaptive receive buffer.
    pub recv_buffer_min: usize,
    /// First guess for the adaptive receive buffer.
    pub recv_buffer_initial: usize,
    /// Upper bound for the adaptive receive buffer.
    pub recv_buffer_max: usize,
    /// Keep read interest armed permanently (the default). When off, a
    /// handler must issue `read` to receive the next burst.
    pub auto_read: bool,
    /// Cap on socket reads dispatched per readiness event.
    pub max_reads_per_event: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            high_water_mark: 64 * 1024,
            low_water_mark: 32 * 1024,
            recv_buffer_min: 64,
            recv_buffer_initial: 2048,
            recv_buffer_max: 64 * 1024,
            auto_read: true,
            max_reads_per_event: 16,
        }
    }
}

impl ChannelConfig {
    /// Sets both watermarks.
    pub fn water_marks(mut self, low: usize, high: usize) -> Self {
        assert!(low <= high, "low watermark above high watermark");
        self.low_water_mark = low;
        self.high_water_mark = high;
        self
    }

    /// Sets the adaptive receive-buffer bounds.
    pub fn recv_buffer(mut self, min: usize, initial: usize, max: usize) -> Self {
        self.recv_buffer_min = min;
        self.recv_buffer_initial = initial;
        self.recv_buffer_max = max;
        self
    }

    /// Toggles automatic read re-arming.
    pub fn auto_read(mut self, auto_read: bool) -> Self {
        self.auto_read = auto_read;
        self
    }
}

/// Runs on the owning loop right after registration to populate the
/// channel's pipeline with handlers.
pub type ChannelInitializer = Arc<dyn Fn(&Channel) -> Result<(), ChannelError> + Send + Sync>;

pub(crate) enum UnregisteredKind {
    TcpPending,
    TcpAccepted(TcpStream),
    TcpServerPending {
        child_group: Option<Arc<EventLoopGroup>>,
        child_config: ChannelConfig,
        child_initializer: Option<ChannelInitializer>,
    },
    Local(Arc<LocalPairState>, u8),
}

/// A channel specification awaiting registration. `Send`, so it can be
/// built anywhere and moved onto its loop.
pub struct UnregisteredChannel {
    pub(crate) kind: UnregisteredKind,
    pub(crate) config: ChannelConfig,
    pub(crate) initializer: Option<ChannelInitializer>,
    pub(crate) parent: Option<u64>,
}

impl UnregisteredChannel {
    fn new(kind: UnregisteredKind) -> Self {
        UnregisteredChannel {
            kind,
            config: ChannelConfig::default(),
            initializer: None,
            parent: None,
        }
    }

    /// A TCP client channel; connect it through the pipeline (or a
    /// bootstrap) after registration.
    pub fn tcp() -> Self {
        UnregisteredChannel::new(UnregisteredKind::TcpPending)
    }

    /// A TCP server channel; bind it through the pipeline (or a bootstrap)
    /// after registration. Accepted connections become child channels.
    pub fn tcp_server() -> Self {
        UnregisteredChannel::new(UnregisteredKind::TcpServerPending {
            child_group: None,
            child_config: ChannelConfig::default(),
            child_initializer: None,
        })
    }

    pub(crate) fn tcp_accepted(stream: TcpStream) -> Self {
        UnregisteredChannel::new(UnregisteredKind::TcpAccepted(stream))
    }

    /// A connected in-process pair. Register each end with a loop (the
    /// same one or different ones); both become active once both ends are
    /// registered.
    pub fn local_pair() -> (Self, Self) {
        let pair = LocalPairState::new();
        (
            UnregisteredChannel::new(UnregisteredKind::Local(Arc::clone(&pair), 0)),
            UnregisteredChannel::new(UnregisteredKind::Local(pair, 1)),
        )
    }

    /// Overrides the channel configuration.
    pub fn config(mut self, config: ChannelConfig) -> Self {
        self.config = config;
        self
    }

    /// Installs the pipeline initializer run at registration time.
    pub fn initializer(
        mut self,
        init: impl Fn(&Channel) -> Result<(), ChannelError> + Send + Sync + 'static,
    ) -> Self {
        self.initializer = Some(Arc::new(init));
        self
    }

    /// Event loops for accepted children (server channels only).
    pub fn child_group(mut self, group: Arc<EventLoopGroup>) -> Self {
        match &mut self.kind {
            UnregisteredKind::TcpServerPending { child_group, .. } => *child_group = Some(group),
            _ => warn!("child_group is only meaningful for server channels"),
        }
        self
    }

    /// Configuration for accepted children (server channels only).
    pub fn child_config(mut self, config: ChannelConfig) -> Self {
        match &mut self.kind {
            UnregisteredKind::TcpServerPending { child_config, .. } => *child_config = config,
            _ => warn!("child_config is only meaningful for server channels"),
        }
        self
    }

    /// Pipeline initializer for accepted children (server channels only).
    pub fn child_initializer(
        mut self,
        init: impl Fn(&Channel) -> Result<(), ChannelError> + Send + Sync + 'static,
    ) -> Self {
        match &mut self.kind {
            UnregisteredKind::TcpServerPending {
                child_initializer, ..
            } => *child_initializer = Some(Arc::new(init)),
            _ => warn!("child_initializer is only meaningful for server channels"),
        }
        self
    }
}

pub(crate) enum Transport {
    TcpPending,
    TcpConnecting(TcpStream),
    Tcp(TcpStream),
    TcpServerPending {
        child_group: Option<Arc<EventLoopGroup>>,
        child_config: ChannelConfig,
        child_initializer: Option<ChannelInitializer>,
    },
    TcpServer {
        listener: TcpListener,
        child_group: Option<Arc<EventLoopGroup>>,
        child_config: ChannelConfig,
        child_initializer: Option<ChannelInitializer>,
    },
    Local {
        pair: Arc<LocalPairState>,
        side: u8,
        peer: Option<(EventLoop, u64)>,
    },
    Closed,
}

pub(crate) struct ChannelShared {
    pub(crate) id: u64,
    pub(crate) parent: Option<u64>,
    pub(crate) config: ChannelConfig,
    pub(crate) event_loop: EventLoop,
    pub(crate) allocator: PooledAllocator,
    pub(crate) pipeline: RefCell<Option<Pipeline>>,
    pub(crate) transport: RefCell<Transport>,
    pub(crate) state: Cell<ChannelState>,
    pub(crate) token: Cell<Option<Token>>,
    pub(crate) local_addr: Cell<Option<SocketAddr>>,
    pub(crate) remote_addr: Cell<Option<SocketAddr>>,
    pub(crate) outbound: RefCell<OutboundQueue>,
    pub(crate) notifier: RefCell<FlushNotifier>,
    pub(crate) recv_sizer: RefCell<AdaptiveRecvSizer>,
    pub(crate) close_promise: ChannelPromise,
    pub(crate) close_future: ChannelFuture,
    pub(crate) registered_future: ChannelFuture,
    pub(crate) connect_promise: RefCell<Option<ChannelPromise>>,
    pub(crate) read_interest: Cell<bool>,
    pub(crate) write_interest: Cell<bool>,
}

/// The loop-confined face of a registered channel, handed to pipeline
/// initializers and channel-aware handlers. Cheap to clone; not `Send` —
/// cross-thread callers use [`crate::ChannelHandle`].
#[derive(Clone)]
pub struct Channel {
    pub(crate) inner: Rc<ChannelShared>,
}

impl Channel {
    /// Process-unique channel id.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// The parent (server) channel id for accepted children.
    pub fn parent_id(&self) -> Option<u64> {
        self.inner.parent
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ChannelState {
        self.inner.state.get()
    }

    /// Whether the channel is in the `Active` state.
    pub fn is_active(&self) -> bool {
        self.state() == ChannelState::Active
    }

    /// True while the outbound queue sits below its high watermark.
    pub fn is_writable(&self) -> bool {
        self.inner.outbound.borrow().is_writable()
    }

    /// The channel's pipeline.
    pub fn pipeline(&self) -> Pipeline {
        self.inner.pipeline()
    }

    /// The owning event loop.
    pub fn event_loop(&self) -> EventLoop {
        self.inner.event_loop.clone()
    }

    /// The channel's buffer allocator.
    pub fn alloc(&self) -> PooledAllocator {
        self.inner.allocator.clone()
    }

    /// Local address, once bound/connected and until inactive.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr.get()
    }

    /// Remote address, once connected and until inactive.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.remote_addr.get()
    }

    /// The channel configuration.
    pub fn config(&self) -> &ChannelConfig {
        &self.inner.config
    }

    /// Resolves when the channel has fully closed.
    pub fn close_future(&self) -> ChannelFuture {
        self.inner.close_future.clone()
    }

    /// A `Send` handle for off-loop callers.
    pub fn handle(&self) -> ChannelHandle {
        ChannelHandle::new(
            self.inner.id,
            self.inner.event_loop.clone(),
            self.inner.registered_future.clone(),
            self.inner.close_future.clone(),
        )
    }

    /// Shorthand for `pipeline().write_and_flush`.
    pub fn write_and_flush(&self, msg: Message) -> ChannelFuture {
        self.pipeline().write_and_flush(msg)
    }

    /// Shorthand for `pipeline().close`.
    pub fn close(&self) -> ChannelFuture {
        self.pipeline().close()
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.inner.id)
            .field("state", &self.inner.state.get())
            .field("local", &self.inner.local_addr.get())
            .field("remote", &self.inner.remote_addr.get())
            .finish()
    }
}

/// Adapter from the pipeline head to the channel; holds a weak reference
/// so the sink does not keep its own channel alive.
struct ChannelSink {
    chan: Weak<ChannelShared>,
}

impl ChannelSink {
    fn with<F: FnOnce(&Rc<ChannelShared>)>(&self, promise: Option<&ChannelPromise>, f: F) {
        match self.chan.upgrade() {
            Some(chan) => f(&chan),
            None => {
                if let Some(promise) = promise {
                    promise.fail(ChannelError::Closed);
                }
            }
        }
    }
}

impl OutboundSink for ChannelSink {
    fn write(&self, msg: Message, promise: ChannelPromise) {
        self.with(Some(&promise.clone()), |chan| chan.write_op(msg, promise));
    }

    fn flush(&self) {
        self.with(None, |chan| chan.flush_op());
    }

    fn read(&self) {
        self.with(None, |chan| chan.read_op());
    }

    fn bind(&self, addr: SocketAddr, promise: ChannelPromise) {
        self.with(Some(&promise.clone()), |chan| chan.bind_op(addr, promise));
    }

    fn connect(&self, remote: SocketAddr, local: Option<SocketAddr>, promise: ChannelPromise) {
        self.with(Some(&promise.clone()), |chan| {
            chan.connect_op(remote, local, promise)
        });
    }

    fn disconnect(&self, promise: ChannelPromise) {
        // Stream transports have no half-open teardown here.
        self.with(Some(&promise.clone()), |chan| chan.close_op(promise));
    }

    fn close(&self, promise: ChannelPromise) {
        self.with(Some(&promise.clone()), |chan| chan.close_op(promise));
    }

    fn deregister(&self, promise: ChannelPromise) {
        self.with(Some(&promise.clone()), |chan| chan.deregister_op(promise));
    }
}

impl EventLoop {
    /// Moves `channel` onto this loop. The returned handle's
    /// `when_registered` future resolves after the channel joined the
    /// selector and its pipeline saw `channel_registered`.
    pub fn register(&self, channel: UnregisteredChannel) -> ChannelHandle {
        let id = NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed);
        let (reg_promise, reg_future) = ChannelPromise::new();
        let (close_promise, close_future) = ChannelPromise::new();
        let handle = ChannelHandle::new(id, self.clone(), reg_future.clone(), close_future.clone());
        let fail_on_drop = reg_promise.clone();
        let task = self.submit(move || match current_loop() {
            Some(ctx) => {
                register_on_loop(&ctx, id, channel, reg_promise, close_promise, close_future)
            }
            None => {
                reg_promise.fail(ChannelError::NotRegistered);
            }
        });
        if task.is_cancelled() {
            // The loop already terminated; the task will never run.
            fail_on_drop.fail(ChannelError::Closed);
        }
        handle
    }
}

fn register_on_loop(
    ctx: &Rc<LoopContext>,
    id: u64,
    spec: UnregisteredChannel,
    reg_promise: ChannelPromise,
    close_promise: ChannelPromise,
    close_future: ChannelFuture,
) {
    if ctx.event_loop.is_shutting_down() {
        reg_promise.fail(ChannelError::Closed);
        close_promise.succeed();
        return;
    }
    let UnregisteredChannel {
        kind,
        config,
        initializer,
        parent,
    } = spec;
    let transport = match kind {
        UnregisteredKind::TcpPending => Transport::TcpPending,
        UnregisteredKind::TcpAccepted(stream) => Transport::Tcp(stream),
        UnregisteredKind::TcpServerPending {
            child_group,
            child_config,
            child_initializer,
        } => Transport::TcpServerPending {
            child_group,
            child_config,
            child_initializer,
        },
        UnregisteredKind::Local(pair, side) => Transport::Local {
            pair,
            side,
            peer: None,
        },
    };
    let accepted = matches!(transport, Transport::Tcp(_));
    let local = matches!(transport, Transport::Local { .. });

    let chan = Rc::new_cyclic(|weak: &Weak<ChannelShared>| {
        let sink: Rc<dyn OutboundSink> = Rc::new(ChannelSink { chan: weak.clone() });
        let pipeline = Pipeline::new(ctx.allocator.clone(), sink);
        ChannelShared {
            id,
            parent,
            event_loop: ctx.event_loop.clone(),
            allocator: ctx.allocator.clone(),
            pipeline: RefCell::new(Some(pipeline)),
            transport: RefCell::new(transport),
            state: Cell::new(ChannelState::Unregistered),
            token: Cell::new(None),
            local_addr: Cell::new(None),
            remote_addr: Cell::new(None),
            outbound: RefCell::new(OutboundQueue::new(
                config.high_water_mark,
                config.low_water_mark,
            )),
            notifier: RefCell::new(FlushNotifier::new()),
            recv_sizer: RefCell::new(AdaptiveRecvSizer::new(
                config.recv_buffer_min,
                config.recv_buffer_initial,
                config.recv_buffer_max,
            )),
            close_promise,
            close_future,
            registered_future: reg_promise.future(),
            connect_promise: RefCell::new(None),
            read_interest: Cell::new(config.auto_read),
            write_interest: Cell::new(false),
            config,
        }
    });

    ctx.channels.borrow_mut().insert(id, Rc::clone(&chan));
    chan.state.set(ChannelState::Registered);

    let channel = Channel {
        inner: Rc::clone(&chan),
    };
    if let Some(init) = initializer {
        if let Err(err) = init(&channel) {
            warn!("channel {id} initializer failed: {err}");
            chan.pipeline().fire_exception_caught(err);
        }
    }
    chan.pipeline().fire_channel_registered();
    reg_promise.succeed();

    if accepted {
        if let Err(err) = chan.selector_register(ctx, Interest::READABLE) {
            chan.handle_io_error(err);
            return;
        }
        chan.activate_stream();
    } else if local {
        crate::local::wire_up(ctx, &chan);
    }
}

impl ChannelShared {
    pub(crate) fn pipeline(&self) -> Pipeline {
        self.pipeline
            .borrow()
            .as_ref()
            .expect("channel pipeline missing")
            .clone()
    }

    /// Registers the current transport source with the selector.
    fn selector_register(
        self: &Rc<Self>,
        ctx: &Rc<LoopContext>,
        interests: Interest,
    ) -> io::Result<()> {
        let token = ctx.allocate_token();
        {
            let mut transport = self.transport.borrow_mut();
            match &mut *transport {
                Transport::Tcp(stream) | Transport::TcpConnecting(stream) => {
                    ctx.registry.register(stream, token, interests)?
                }
                Transport::TcpServer { listener, .. } => {
                    ctx.registry.register(listener, token, interests)?
                }
                _ => return Ok(()),
            }
        }
        self.token.set(Some(token));
        ctx.tokens.borrow_mut().insert(token, self.id);
        Ok(())
    }

    fn interests(&self) -> Interest {
        let read = self.read_interest.get();
        let write = self.write_interest.get();
        match (read, write) {
            (true, true) => Interest::READABLE | Interest::WRITABLE,
            (false, true) => Interest::WRITABLE,
            (true, false) => Interest::READABLE,
            // The selector needs at least one interest; an idle channel
            // keeps READABLE armed (edge-triggered, so this is quiet).
            (false, false) => Interest::READABLE,
        }
    }

    fn update_interests(self: &Rc<Self>) {
        let Some(ctx) = current_loop() else { return };
        let Some(token) = self.token.get() else {
            return;
        };
        let interests = self.interests();
        let mut transport = self.transport.borrow_mut();
        let result = match &mut *transport {
            Transport::Tcp(stream) | Transport::TcpConnecting(stream) => {
                ctx.registry.reregister(stream, token, interests)
            }
            Transport::TcpServer { listener, .. } => {
                ctx.registry.reregister(listener, token, interests)
            }
            _ => Ok(()),
        };
        if let Err(err) = result {
            warn!("channel {}: reregister failed: {err}", self.id);
        }
    }

    fn activate_stream(self: &Rc<Self>) {
        let (local, remote) = {
            let transport = self.transport.borrow();
            match &*transport {
                Transport::Tcp(stream) => (stream.local_addr().ok(), stream.peer_addr().ok()),
                _ => (None, None),
            }
        };
        self.local_addr.set(local);
        self.remote_addr.set(remote);
        self.state.set(ChannelState::Active);
        self.pipeline().fire_channel_active();
    }

    pub(crate) fn set_active_local(self: &Rc<Self>) {
        if self.state.get() != ChannelState::Registered {
            return;
        }
        self.state.set(ChannelState::Active);
        self.pipeline().fire_channel_active();
    }

    // -----------------------------------------------------------------
    // Outbound operations (via the pipeline head)
    // -----------------------------------------------------------------

    pub(crate) fn write_op(self: &Rc<Self>, msg: Message, promise: ChannelPromise) {
        if self.state.get() == ChannelState::Closed {
            promise.fail(ChannelError::Closed);
            self.pipeline().fire_exception_caught(ChannelError::Closed);
            return;
        }
        let buf = match msg.downcast::<ByteBuf>() {
            Ok(buf) => *buf,
            Err(_) => {
                promise.fail(ChannelError::protocol(
                    "only byte buffers can reach the transport; add an encoder to the pipeline",
                ));
                return;
            }
        };
        let edge = {
            let mut outbound = self.outbound.borrow_mut();
            let edge = outbound.push(buf);
            self.notifier
                .borrow_mut()
                .add(promise, outbound.pending_bytes() as u64);
            edge
        };
        if edge.is_some() {
            self.pipeline().fire_channel_writability_changed();
        }
    }

    pub(crate) fn flush_op(self: &Rc<Self>) {
        self.outbound.borrow_mut().mark_flushed();
        self.do_flush();
    }

    pub(crate) fn do_flush(self: &Rc<Self>) {
        if self.state.get() == ChannelState::Closed {
            return;
        }
        if matches!(&*self.transport.borrow(), Transport::Local { .. }) {
            crate::local::flush_local(self);
            return;
        }

        enum Outcome {
            Idle,
            NeedWrite,
            /// Transport cannot transmit yet (still connecting); leave the
            /// queue and interests untouched.
            NotReady,
            Failed(io::Error),
        }

        let mut edged = false;
        let outcome = loop {
            let write_result = {
                let mut outbound = self.outbound.borrow_mut();
                let Some(buf) = outbound.front_mut() else {
                    break Outcome::Idle;
                };
                if buf.readable_bytes() == 0 {
                    outbound.pop_front();
                    continue;
                }
                let result = {
                    let mut transport = self.transport.borrow_mut();
                    match &mut *transport {
                        Transport::Tcp(stream) => stream.write(buf.readable_slice()),
                        // Not connected yet: stay queued, the connect
                        // completion flushes again.
                        _ => break Outcome::NotReady,
                    }
                };
                if let Ok(n) = result {
                    if n > 0 {
                        buf.advance_read(n);
                        if buf.readable_bytes() == 0 {
                            outbound.pop_front();
                        }
                    }
                }
                result
            };
            match write_result {
                Ok(0) => {
                    break Outcome::Failed(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "socket accepted zero bytes",
                    ))
                }
                Ok(n) => {
                    self.notifier.borrow_mut().increase(n as u64);
                    if self.outbound.borrow_mut().consumed(n).is_some() {
                        edged = true;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break Outcome::NeedWrite,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => break Outcome::Failed(e),
            }
        };

        let due = self.notifier.borrow_mut().drain_due();
        for promise in due {
            promise.succeed();
        }
        if edged {
            self.pipeline().fire_channel_writability_changed();
        }
        match outcome {
            Outcome::Idle => {
                if self.write_interest.replace(false) {
                    self.update_interests();
                }
            }
            Outcome::NeedWrite => {
                if !self.write_interest.replace(true) {
                    self.update_interests();
                }
            }
            Outcome::NotReady => {}
            Outcome::Failed(err) => self.handle_io_error(err),
        }
    }

    pub(crate) fn read_op(self: &Rc<Self>) {
        if !self.read_interest.replace(true) {
            self.update_interests();
        }
        if self.state.get() == ChannelState::Active {
            // Edge-triggered selectors will not re-announce data that is
            // already queued; drain it now.
            self.do_read();
        }
    }

    pub(crate) fn do_read(self: &Rc<Self>) {
        if self.state.get() != ChannelState::Active {
            return;
        }
        if matches!(&*self.transport.borrow(), Transport::Local { .. }) {
            return;
        }

        let mut total = 0usize;
        let mut reads = 0usize;
        let mut eof = false;
        let mut failure: Option<io::Error> = None;
        let mut stopped_full = false;

        loop {
            let cap = self.recv_sizer.borrow().next_size();
            let mut buf = match self.allocator.allocate(cap, cap) {
                Ok(buf) => buf,
                Err(err) => {
                    self.pipeline().fire_exception_caught(err.into());
                    break;
                }
            };
            let result = {
                let mut transport = self.transport.borrow_mut();
                match &mut *transport {
                    Transport::Tcp(stream) => stream.read(buf.writable_slice_mut()),
                    _ => return,
                }
            };
            match result {
                Ok(0) => {
                    eof = true;
                    break;
                }
                Ok(n) => {
                    buf.advance_write(n);
                    total += n;
                    reads += 1;
                    self.pipeline().fire_channel_read(Box::new(buf));
                    if self.state.get() != ChannelState::Active {
                        // A handler closed us mid-burst.
                        break;
                    }
                    if n < cap {
                        break;
                    }
                    if reads >= self.config.max_reads_per_event {
                        stopped_full = true;
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        if total > 0 {
            self.recv_sizer.borrow_mut().record(total);
        }
        self.pipeline().fire_channel_read_complete();

        if let Some(err) = failure {
            self.handle_io_error(err);
            return;
        }
        if eof {
            close_now(self);
            return;
        }
        if !self.config.auto_read {
            self.read_interest.set(false);
            self.update_interests();
        }
        if stopped_full {
            // More data may be queued and the edge has passed; resume on
            // the next loop turn.
            let event_loop = self.event_loop.clone();
            let id = self.id;
            event_loop.submit(move || {
                if let Some(ctx) = current_loop() {
                    if let Some(chan) = ctx.channel(id) {
                        chan.do_read();
                    }
                }
            });
        }
    }

    pub(crate) fn bind_op(self: &Rc<Self>, addr: SocketAddr, promise: ChannelPromise) {
        let Some(ctx) = current_loop() else {
            promise.fail(ChannelError::NotRegistered);
            return;
        };
        if !matches!(&*self.transport.borrow(), Transport::TcpServerPending { .. }) {
            promise.fail(ChannelError::protocol(
                "bind is only supported on an unbound server channel",
            ));
            return;
        }
        match TcpListener::bind(addr) {
            Ok(listener) => {
                let old = self.transport.replace(Transport::Closed);
                if let Transport::TcpServerPending {
                    child_group,
                    child_config,
                    child_initializer,
                } = old
                {
                    *self.transport.borrow_mut() = Transport::TcpServer {
                        listener,
                        child_group,
                        child_config,
                        child_initializer,
                    };
                }
                if let Err(err) = self.selector_register(&ctx, Interest::READABLE) {
                    let cause: ChannelError = err.into();
                    promise.fail(cause.clone());
                    self.pipeline().fire_exception_caught(cause);
                    close_now(self);
                    return;
                }
                let local = {
                    let transport = self.transport.borrow();
                    match &*transport {
                        Transport::TcpServer { listener, .. } => listener.local_addr().ok(),
                        _ => None,
                    }
                };
                self.local_addr.set(local);
                self.state.set(ChannelState::Active);
                self.pipeline().fire_channel_active();
                promise.succeed();
            }
            Err(err) => {
                let cause: ChannelError = err.into();
                promise.fail(cause.clone());
                self.pipeline().fire_exception_caught(cause);
            }
        }
    }

    pub(crate) fn connect_op(
        self: &Rc<Self>,
        remote: SocketAddr,
        local: Option<SocketAddr>,
        promise: ChannelPromise,
    ) {
        let Some(ctx) = current_loop() else {
            promise.fail(ChannelError::NotRegistered);
            return;
        };
        if local.is_some() {
            promise.fail(ChannelError::protocol(
                "binding a specific local address before connect is not supported",
            ));
            return;
        }
        if !matches!(&*self.transport.borrow(), Transport::TcpPending) {
            promise.fail(ChannelError::protocol(
                "connect is only supported on an unconnected client channel",
            ));
            return;
        }
        match TcpStream::connect(remote) {
            Ok(stream) => {
                *self.transport.borrow_mut() = Transport::TcpConnecting(stream);
                self.write_interest.set(true);
                if let Err(err) =
                    self.selector_register(&ctx, Interest::READABLE | Interest::WRITABLE)
                {
                    let cause: ChannelError = err.into();
                    promise.fail(cause.clone());
                    self.pipeline().fire_exception_caught(cause);
                    close_now(self);
                    return;
                }
                self.remote_addr.set(Some(remote));
                *self.connect_promise.borrow_mut() = Some(promise);
            }
            Err(err) => {
                let cause: ChannelError = err.into();
                promise.fail(cause.clone());
                self.pipeline().fire_exception_caught(cause);
            }
        }
    }

    pub(crate) fn finish_connect(self: &Rc<Self>) {
        let verdict = {
            let mut transport = self.transport.borrow_mut();
            match &mut *transport {
                Transport::TcpConnecting(stream) => match stream.take_error() {
                    Ok(Some(err)) => Err(err),
                    Ok(None) => match stream.peer_addr() {
                        Ok(_) => Ok(()),
                        Err(e) if e.kind() == io::ErrorKind::NotConnected => return,
                        Err(e) => Err(e),
                    },
                    Err(err) => Err(err),
                },
                _ => return,
            }
        };
        match verdict {
            Ok(()) => {
                let old = self.transport.replace(Transport::Closed);
                if let Transport::TcpConnecting(stream) = old {
                    *self.transport.borrow_mut() = Transport::Tcp(stream);
                }
                self.write_interest.set(false);
                self.update_interests();
                let connect_promise = self.connect_promise.borrow_mut().take();
                self.activate_stream();
                if let Some(promise) = connect_promise {
                    promise.succeed();
                }
                // Writes queued while connecting go out now.
                self.do_flush();
            }
            Err(err) => {
                let cause: ChannelError = err.into();
                let pending = self.connect_promise.borrow_mut().take();
                if let Some(promise) = pending {
                    promise.fail(cause.clone());
                }
                self.pipeline().fire_exception_caught(cause);
                close_now(self);
            }
        }
    }

    pub(crate) fn do_accept(self: &Rc<Self>) {
        loop {
            let accepted = {
                let mut transport = self.transport.borrow_mut();
                match &mut *transport {
                    Transport::TcpServer { listener, .. } => listener.accept(),
                    _ => return,
                }
            };
            match accepted {
                Ok((stream, peer)) => {
                    let (group, child_config, child_init) = {
                        let transport = self.transport.borrow();
                        match &*transport {
                            Transport::TcpServer {
                                child_group,
                                child_config,
                                child_initializer,
                                ..
                            } => (
                                child_group.clone(),
                                child_config.clone(),
                                child_initializer.clone(),
                            ),
                            _ => return,
                        }
                    };
                    let mut child = UnregisteredChannel::tcp_accepted(stream).config(child_config);
                    child.initializer = child_init;
                    child.parent = Some(self.id);
                    let target = match group {
                        Some(group) => group.next(),
                        None => self.event_loop.clone(),
                    };
                    let handle = target.register(child);
                    trace!(
                        "channel {}: accepted {} as child channel {}",
                        self.id,
                        peer,
                        handle.id()
                    );
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("channel {}: accept failed: {e}", self.id);
                    self.pipeline().fire_exception_caught(e.into());
                    break;
                }
            }
        }
    }

    pub(crate) fn close_op(self: &Rc<Self>, promise: ChannelPromise) {
        if self.state.get() == ChannelState::Closed {
            promise.succeed();
            return;
        }
        close_now(self);
        promise.succeed();
    }

    pub(crate) fn deregister_op(self: &Rc<Self>, promise: ChannelPromise) {
        if self.state.get() == ChannelState::Closed {
            promise.succeed();
            return;
        }
        let Some(ctx) = current_loop() else {
            promise.fail(ChannelError::NotRegistered);
            return;
        };
        if let Some(token) = self.token.take() {
            let mut transport = self.transport.borrow_mut();
            let _ = match &mut *transport {
                Transport::Tcp(stream) | Transport::TcpConnecting(stream) => {
                    ctx.registry.deregister(stream)
                }
                Transport::TcpServer { listener, .. } => ctx.registry.deregister(listener),
                _ => Ok(()),
            };
            ctx.tokens.borrow_mut().remove(&token);
            ctx.cancelled_keys.set(ctx.cancelled_keys.get() + 1);
        }
        ctx.channels.borrow_mut().remove(&self.id);
        self.pipeline().fire_channel_unregistered();
        promise.succeed();
    }

    pub(crate) fn handle_io_error(self: &Rc<Self>, err: io::Error) {
        let cause: ChannelError = err.into();
        warn!("channel {}: transport error: {cause}", self.id);
        let due = self.notifier.borrow_mut().drain_due();
        let rest = self.notifier.borrow_mut().drain_rest();
        for promise in due {
            promise.succeed();
        }
        for promise in rest {
            promise.fail(cause.clone());
        }
        self.pipeline().fire_exception_caught(cause);
        close_now(self);
    }
}

/// Dispatches selector readiness to the channel's primitives.
pub(crate) fn handle_ready(chan: &Rc<ChannelShared>, event: &mio::event::Event) {
    enum Kind {
        Stream,
        Connecting,
        Server,
        Other,
    }
    let kind = match &*chan.transport.borrow() {
        Transport::Tcp(_) => Kind::Stream,
        Transport::TcpConnecting(_) => Kind::Connecting,
        Transport::TcpServer { .. } => Kind::Server,
        _ => Kind::Other,
    };
    match kind {
        Kind::Server => {
            if event.is_readable() {
                chan.do_accept();
            }
        }
        Kind::Connecting => {
            if event.is_writable() || event.is_readable() {
                chan.finish_connect();
            }
        }
        Kind::Stream => {
            if event.is_readable() || event.is_read_closed() {
                chan.do_read();
            }
            if chan.state.get() == ChannelState::Closed {
                return;
            }
            if event.is_writable() {
                chan.do_flush();
            }
        }
        Kind::Other => {}
    }
}

/// Tears the channel down: fails queued writes, releases the transport,
/// fires `channel_inactive`/`channel_unregistered` and resolves the close
/// promise. Idempotent.
pub(crate) fn close_now(chan: &Rc<ChannelShared>) {
    if chan.state.get() == ChannelState::Closed {
        return;
    }
    let was_active = chan.state.get() == ChannelState::Active;

    let due = chan.notifier.borrow_mut().drain_due();
    let rest = chan.notifier.borrow_mut().drain_rest();
    for promise in due {
        promise.succeed();
    }
    for promise in rest {
        promise.fail(ChannelError::Closed);
    }
    chan.outbound.borrow_mut().clear();
    let pending_connect = chan.connect_promise.borrow_mut().take();
    if let Some(promise) = pending_connect {
        promise.fail(ChannelError::Closed);
    }

    let old = chan.transport.replace(Transport::Closed);
    if let Some(ctx) = current_loop() {
        match old {
            Transport::Tcp(mut stream) | Transport::TcpConnecting(mut stream) => {
                let _ = ctx.registry.deregister(&mut stream);
            }
            Transport::TcpServer { mut listener, .. } => {
                let _ = ctx.registry.deregister(&mut listener);
            }
            Transport::Local { peer, .. } => crate::local::peer_eof(peer),
            _ => {}
        }
        if let Some(token) = chan.token.take() {
            ctx.tokens.borrow_mut().remove(&token);
            ctx.cancelled_keys.set(ctx.cancelled_keys.get() + 1);
        }
        ctx.channels.borrow_mut().remove(&chan.id);
    }

    chan.state.set(ChannelState::Inactive);
    if was_active {
        chan.pipeline().fire_channel_inactive();
    }
    // The address book empties once the channel went inactive.
    chan.local_addr.set(None);
    chan.remote_addr.set(None);
    chan.pipeline().fire_channel_unregistered();
    chan.state.set(ChannelState::Closed);
    // Dismantle the chain: user handlers come out (running their
    // handler_removed hooks) so a handler holding its own Channel can
    // never keep the reference cycle alive past close.
    let pipeline = chan.pipeline();
    for name in pipeline.names() {
        let _ = pipeline.remove(&name);
    }
    chan.close_promise.succeed();
}
