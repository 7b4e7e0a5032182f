//! The in-process transport: a connected channel pair with no sockets.
//!
//! Each end registers with a loop of its own choosing. Once both ends are
//! registered, both fire `channel_active`. A flush hands the flushed
//! buffers to the peer's loop wholesale, where they surface as ordinary
//! `channel_read` events — so pipelines behave identically over loopback
//! memory and over TCP.

use std::rc::Rc;
use std::sync::Mutex;

use crate::channel::{self, ChannelShared, Transport};
use crate::event_loop::{current_loop, EventLoop, LoopContext};

/// Rendezvous state shared by the two ends of a pair.
pub(crate) struct LocalPairState {
    sides: Mutex<[Option<(EventLoop, u64)>; 2]>,
}

impl LocalPairState {
    pub(crate) fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(LocalPairState {
            sides: Mutex::new([None, None]),
        })
    }
}

/// Records this end in the pair; when the peer is already present, points
/// the two ends at each other and activates both.
pub(crate) fn wire_up(ctx: &Rc<LoopContext>, chan: &Rc<ChannelShared>) {
    let (pair, side) = {
        let transport = chan.transport.borrow();
        match &*transport {
            Transport::Local { pair, side, .. } => (pair.clone(), *side),
            _ => return,
        }
    };
    let me = (ctx.event_loop.clone(), chan.id);
    let peer = {
        let mut sides = pair.sides.lock().expect("local pair poisoned");
        sides[side as usize] = Some(me.clone());
        sides[1 - side as usize].clone()
    };
    if let Some((peer_loop, peer_id)) = peer {
        set_peer_and_activate(chan, (peer_loop.clone(), peer_id));
        peer_loop.submit(move || {
            if let Some(ctx) = current_loop() {
                if let Some(peer_chan) = ctx.channel(peer_id) {
                    set_peer_and_activate(&peer_chan, me);
                }
            }
        });
    }
}

fn set_peer_and_activate(chan: &Rc<ChannelShared>, peer: (EventLoop, u64)) {
    {
        let mut transport = chan.transport.borrow_mut();
        match &mut *transport {
            Transport::Local { peer: slot, .. } => {
                if slot.is_some() {
                    return;
                }
                *slot = Some(peer);
            }
            _ => return,
        }
    }
    chan.set_active_local();
    // Flushes issued before the peer appeared are still queued.
    chan.do_flush();
}

/// Moves every flushed buffer to the peer's loop and advances the flush
/// notifier by their size.
pub(crate) fn flush_local(chan: &Rc<ChannelShared>) {
    let peer = {
        let transport = chan.transport.borrow();
        match &*transport {
            Transport::Local { peer, .. } => peer.clone(),
            _ => return,
        }
    };
    // Peer not registered yet: everything stays queued; activation
    // re-runs the flush.
    let Some((peer_loop, peer_id)) = peer else {
        return;
    };

    let (bufs, total, edged) = {
        let mut outbound = chan.outbound.borrow_mut();
        let bufs = outbound.take_flushed();
        let total: usize = bufs.iter().map(|b| b.readable_bytes()).sum();
        let edged = outbound.consumed(total).is_some();
        (bufs, total, edged)
    };
    chan.notifier.borrow_mut().increase(total as u64);
    let due = chan.notifier.borrow_mut().drain_due();

    if !bufs.is_empty() {
        peer_loop.submit(move || {
            match current_loop().and_then(|ctx| ctx.channel(peer_id)) {
                Some(peer_chan) => {
                    let pipeline = peer_chan.pipeline();
                    for buf in bufs {
                        pipeline.fire_channel_read(Box::new(buf));
                    }
                    pipeline.fire_channel_read_complete();
                }
                // Peer already closed: the bytes vanish, like a reset.
                None => log::trace!("local peer {peer_id} is gone; dropping flushed data"),
            }
        });
    }

    for promise in due {
        promise.succeed();
    }
    if edged {
        chan.pipeline().fire_channel_writability_changed();
    }
}

/// Close propagation: the peer observes our close as an end-of-stream.
pub(crate) fn peer_eof(peer: Option<(EventLoop, u64)>) {
    if let Some((peer_loop, peer_id)) = peer {
        peer_loop.submit(move || {
            if let Some(ctx) = current_loop() {
                if let Some(peer_chan) = ctx.channel(peer_id) {
                    channel::close_now(&peer_chan);
                }
            }
        });
    }
}
