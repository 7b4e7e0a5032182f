//! # Seine Bootstrap - Wiring Pipelines onto Loops
//!
//! The helpful bootstrap APIs which enable an easy implementation of a
//! typical server-side or client-side channel setup: pick the event loops,
//! describe the pipeline once, then `bind` or `connect`.
//!
//! ## Server
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use seine::{ChannelError, Context, Handler, Message};
//! use seine_buffer::PooledAllocator;
//! use seine_transport::{EventLoopBuilder, EventLoopGroup};
//! use seine_bootstrap::ServerBootstrap;
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
//! let allocator = PooledAllocator::default();
//! let acceptor = EventLoopBuilder::new().name("acceptor").allocator(allocator.clone()).spawn().unwrap();
//! let workers = Arc::new(EventLoopGroup::new(4, "worker", allocator).unwrap());
//!
//! let server = ServerBootstrap::new()
//!     .group(acceptor)
//!     .child_group(workers)
//!     .pipeline(|ch| {
//!         ch.pipeline().add_last("echo", Echo)?;
//!         Ok(())
//!     });
//! let addr = server.bind("127.0.0.1:4000".parse().unwrap()).unwrap();
//! println!("listening on {addr}");
//! ```
//!
//! ## Client
//!
//! ```rust,no_run
//! use seine_transport::EventLoopBuilder;
//! use seine_bootstrap::Bootstrap;
//!
//! let event_loop = EventLoopBuilder::new().name("client").spawn().unwrap();
//! let channel = Bootstrap::new()
//!     .group(event_loop)
//!     .pipeline(|_ch| Ok(()))
//!     .connect("127.0.0.1:4000".parse().unwrap())
//!     .unwrap();
//! let _pending = channel.close();
//! ```

#![warn(rust_2018_idioms)]
#![warn(missing_docs)]

use std::net::SocketAddr;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::info;
use seine::ChannelError;
use seine_transport::{
    Channel, ChannelConfig, ChannelHandle, EventLoop, EventLoopGroup, UnregisteredChannel,
};

/// How long bootstrap operations wait for their loop before giving up.
const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(30);

/// Runs `f` on the channel's loop and ships the result back.
fn call_on_loop<T: Send + 'static>(
    handle: &ChannelHandle,
    f: impl FnOnce(&Channel) -> T + Send + 'static,
) -> Result<T, ChannelError> {
    let (tx, rx) = mpsc::channel();
    handle.invoke(move |ch| {
        let _ = tx.send(f(ch));
    });
    rx.recv_timeout(BOOTSTRAP_TIMEOUT)
        .map_err(|_| ChannelError::Closed)
}

/// Server-side bootstrap: an acceptor loop, a child group, one pipeline
/// description for every accepted connection.
#[derive(Default)]
pub struct ServerBootstrap {
    parent: Option<EventLoop>,
    child_group: Option<Arc<EventLoopGroup>>,
    child_config: Option<ChannelConfig>,
    child_pipeline: Option<Arc<dyn Fn(&Channel) -> Result<(), ChannelError> + Send + Sync>>,
    server: Mutex<Option<ChannelHandle>>,
}

impl ServerBootstrap {
    /// An empty bootstrap; set a group and a pipeline before binding.
    pub fn new() -> Self {
        ServerBootstrap::default()
    }

    /// The loop that runs the acceptor channel.
    pub fn group(mut self, parent: EventLoop) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Loops for accepted connections. Without one, children share the
    /// acceptor's loop.
    pub fn child_group(mut self, group: Arc<EventLoopGroup>) -> Self {
        self.child_group = Some(group);
        self
    }

    /// Configuration applied to every accepted connection.
    pub fn child_config(mut self, config: ChannelConfig) -> Self {
        self.child_config = Some(config);
        self
    }

    /// Pipeline setup run for every accepted connection, on its loop.
    pub fn pipeline(
        mut self,
        f: impl Fn(&Channel) -> Result<(), ChannelError> + Send + Sync + 'static,
    ) -> Self {
        self.child_pipeline = Some(Arc::new(f));
        self
    }

    /// Registers the acceptor, binds it to `addr` and returns the actual
    /// local address (useful with port 0).
    pub fn bind(&self, addr: SocketAddr) -> Result<SocketAddr, ChannelError> {
        let parent = self
            .parent
            .clone()
            .ok_or_else(|| ChannelError::protocol("ServerBootstrap requires a group"))?;
        let pipeline = self
            .child_pipeline
            .clone()
            .ok_or_else(|| ChannelError::protocol("ServerBootstrap requires a pipeline"))?;

        let mut spec = UnregisteredChannel::tcp_server()
            .child_initializer(move |ch: &Channel| pipeline(ch));
        if let Some(group) = &self.child_group {
            spec = spec.child_group(Arc::clone(group));
        }
        if let Some(config) = &self.child_config {
            spec = spec.child_config(config.clone());
        }

        let handle = parent.register(spec);
        handle.when_registered().wait()?;
        let (bind_result, local) = call_on_loop(&handle, move |ch| {
            // bind runs synchronously on the loop
            let result = ch.pipeline().bind(addr).result();
            (result, ch.local_addr())
        })?;
        match bind_result {
            Some(Ok(())) => {}
            Some(Err(err)) => return Err(err),
            None => return Err(ChannelError::protocol("bind did not complete")),
        }
        let bound = local.ok_or_else(|| ChannelError::protocol("bound channel has no address"))?;

        *self.server.lock().expect("bootstrap poisoned") = Some(handle);
        info!("server channel bound on {bound}");
        Ok(bound)
    }

    /// The acceptor's handle, once bound.
    pub fn server_channel(&self) -> Option<ChannelHandle> {
        self.server.lock().expect("bootstrap poisoned").clone()
    }

    /// Closes the acceptor. Connections already accepted keep running
    /// until their peers hang up or their loops shut down.
    pub fn stop(&self) {
        if let Some(handle) = self.server.lock().expect("bootstrap poisoned").take() {
            let _ = handle.close().wait_timeout(BOOTSTRAP_TIMEOUT);
        }
    }
}

/// Client-side bootstrap: one loop, one pipeline description, `connect`.
#[derive(Default)]
pub struct Bootstrap {
    group: Option<EventLoop>,
    config: Option<ChannelConfig>,
    pipeline: Option<Arc<dyn Fn(&Channel) -> Result<(), ChannelError> + Send + Sync>>,
}

impl Bootstrap {
    /// An empty bootstrap; set a group before connecting.
    pub fn new() -> Self {
        Bootstrap::default()
    }

    /// The loop that will own the connection.
    pub fn group(mut self, event_loop: EventLoop) -> Self {
        self.group = Some(event_loop);
        self
    }

    /// Configuration for the connection.
    pub fn config(mut self, config: ChannelConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Pipeline setup, run on the loop at registration time.
    pub fn pipeline(
        mut self,
        f: impl Fn(&Channel) -> Result<(), ChannelError> + Send + Sync + 'static,
    ) -> Self {
        self.pipeline = Some(Arc::new(f));
        self
    }

    /// Registers a client channel, connects it to `addr` and waits for the
    /// connection to become active.
    pub fn connect(&self, addr: SocketAddr) -> Result<ChannelHandle, ChannelError> {
        let event_loop = self
            .group
            .clone()
            .ok_or_else(|| ChannelError::protocol("Bootstrap requires a group"))?;

        let mut spec = UnregisteredChannel::tcp();
        if let Some(pipeline) = self.pipeline.clone() {
            spec = spec.initializer(move |ch: &Channel| pipeline(ch));
        }
        if let Some(config) = &self.config {
            spec = spec.config(config.clone());
        }

        let handle = event_loop.register(spec);
        handle.when_registered().wait()?;
        let connected = call_on_loop(&handle, move |ch| ch.pipeline().connect(addr, None))?;
        connected
            .wait_timeout(BOOTSTRAP_TIMEOUT)
            .ok_or_else(|| ChannelError::protocol("connect timed out"))??;
        info!("connected to {addr}");
        Ok(handle)
    }
}
