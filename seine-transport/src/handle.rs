//! The `Send` face of a registered channel.

use std::any::Any;

use seine::{ChannelError, ChannelFuture, ChannelPromise, Message};

use crate::channel::Channel;
use crate::event_loop::{current_loop, EventLoop};

/// A thread-safe handle to a channel living on some event loop.
///
/// Every operation submits a task to the owning loop — the handle never
/// touches channel state directly, which is what keeps channels
/// single-threaded from their pipeline's point of view. Operations on a
/// channel that already closed fail with [`ChannelError::Closed`].
#[derive(Clone)]
pub struct ChannelHandle {
    id: u64,
    event_loop: EventLoop,
    registered: ChannelFuture,
    closed: ChannelFuture,
}

impl ChannelHandle {
    pub(crate) fn new(
        id: u64,
        event_loop: EventLoop,
        registered: ChannelFuture,
        closed: ChannelFuture,
    ) -> Self {
        ChannelHandle {
            id,
            event_loop,
            registered,
            closed,
        }
    }

    /// Process-unique channel id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The loop that owns the channel.
    pub fn event_loop(&self) -> &EventLoop {
        &self.event_loop
    }

    /// Resolves once the channel finished registering (selector joined,
    /// `channel_registered` fired).
    pub fn when_registered(&self) -> ChannelFuture {
        self.registered.clone()
    }

    /// Resolves once the channel has fully closed.
    pub fn close_future(&self) -> ChannelFuture {
        self.closed.clone()
    }

    /// Runs `f` with the channel on its owning loop. Silently skipped if
    /// the channel no longer exists.
    pub fn invoke(&self, f: impl FnOnce(&Channel) + Send + 'static) {
        let id = self.id;
        self.event_loop.submit(move || {
            if let Some(chan) = current_loop().and_then(|ctx| ctx.channel(id)) {
                let channel = Channel { inner: chan };
                f(&channel);
            }
        });
    }

    /// Enqueues `msg` through the channel's pipeline.
    pub fn write(&self, msg: Box<dyn Any + Send>) -> ChannelFuture {
        let (promise, future) = ChannelPromise::new();
        let id = self.id;
        self.event_loop.submit(move || {
            let msg: Message = msg;
            match current_loop().and_then(|ctx| ctx.channel(id)) {
                Some(chan) => chan.pipeline().write_with_promise(msg, promise),
                None => {
                    promise.fail(ChannelError::Closed);
                }
            }
        });
        future
    }

    /// `write` followed by `flush`.
    pub fn write_and_flush(&self, msg: Box<dyn Any + Send>) -> ChannelFuture {
        let (promise, future) = ChannelPromise::new();
        let id = self.id;
        self.event_loop.submit(move || {
            let msg: Message = msg;
            match current_loop().and_then(|ctx| ctx.channel(id)) {
                Some(chan) => {
                    let pipeline = chan.pipeline();
                    pipeline.write_with_promise(msg, promise);
                    pipeline.flush();
                }
                None => {
                    promise.fail(ChannelError::Closed);
                }
            }
        });
        future
    }

    /// Flushes the outbound queue.
    pub fn flush(&self) {
        let id = self.id;
        self.event_loop.submit(move || {
            if let Some(chan) = current_loop().and_then(|ctx| ctx.channel(id)) {
                chan.pipeline().flush();
            }
        });
    }

    /// Delivers a user event to the pipeline.
    pub fn fire_user_event(&self, event: Box<dyn Any + Send>) {
        let id = self.id;
        self.event_loop.submit(move || {
            let event: Message = event;
            if let Some(chan) = current_loop().and_then(|ctx| ctx.channel(id)) {
                chan.pipeline().fire_user_event_triggered(event);
            }
        });
    }

    /// Starts an orderly close; the returned future tracks this close
    /// operation (equivalent to [`ChannelHandle::close_future`] once done).
    pub fn close(&self) -> ChannelFuture {
        let (promise, future) = ChannelPromise::new();
        let id = self.id;
        self.event_loop.submit(move || {
            match current_loop().and_then(|ctx| ctx.channel(id)) {
                Some(chan) => chan.pipeline().close_with_promise(promise),
                // Already gone means already closed.
                None => {
                    promise.succeed();
                }
            }
        });
        future
    }

    /// Detaches the channel from its loop.
    pub fn deregister(&self) -> ChannelFuture {
        let (promise, future) = ChannelPromise::new();
        let id = self.id;
        self.event_loop.submit(move || {
            match current_loop().and_then(|ctx| ctx.channel(id)) {
                Some(chan) => {
                    let fut = chan.pipeline().deregister();
                    let promise = promise;
                    fut.add_listener(move |result| match result {
                        Ok(()) => {
                            promise.succeed();
                        }
                        Err(err) => {
                            promise.fail(err.clone());
                        }
                    });
                }
                None => {
                    promise.fail(ChannelError::Closed);
                }
            }
        });
        future
    }
}

impl std::fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("id", &self.id)
            .field("loop", &self.event_loop.name())
            .finish()
    }
}
