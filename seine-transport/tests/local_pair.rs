//! End-to-end behaviour over the in-process transport: echo ordering,
//! writability watermarks and close semantics.

use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use seine::{ChannelError, Context, Handler, Message};
use seine_buffer::{AllocatorConfig, ByteBuf, PooledAllocator};
use seine_transport::{Channel, ChannelConfig, EventLoopBuilder, UnregisteredChannel};

fn test_alloc() -> PooledAllocator {
    PooledAllocator::new(
        AllocatorConfig::default()
            .page_size(4096)
            .max_order(4)
            .arena_count(1),
    )
}

fn payload(alloc: &PooledAllocator, bytes: &[u8]) -> Box<ByteBuf> {
    let len = bytes.len().max(1);
    let mut buf = alloc.allocate(len, len).unwrap();
    buf.write_bytes(bytes);
    Box::new(buf)
}

/// Echoes every message straight back.
struct Echo;

impl Handler for Echo {
    fn channel_read(&mut self, ctx: &Context, msg: Message) -> Result<(), ChannelError> {
        ctx.write(msg);
        Ok(())
    }

    fn channel_read_complete(&mut self, ctx: &Context) -> Result<(), ChannelError> {
        ctx.flush();
        Ok(())
    }
}

/// Forwards each received payload to an mpsc channel.
struct Collector {
    tx: Sender<Vec<u8>>,
}

impl Handler for Collector {
    fn channel_read(&mut self, _ctx: &Context, msg: Message) -> Result<(), ChannelError> {
        let buf = msg
            .downcast::<ByteBuf>()
            .map_err(|_| ChannelError::protocol("expected a buffer"))?;
        let _ = self.tx.send(buf.readable_slice().to_vec());
        Ok(())
    }
}

#[test]
fn echo_preserves_message_order_and_releases_buffers() {
    let alloc = test_alloc();
    let event_loop = EventLoopBuilder::new()
        .name("echo-pair")
        .allocator(alloc.clone())
        .spawn()
        .unwrap();

    let (server_spec, client_spec) = UnregisteredChannel::local_pair();
    let server = event_loop.register(server_spec.initializer(|ch: &Channel| {
        ch.pipeline().add_last("echo", Echo)?;
        Ok(())
    }));

    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let client = event_loop.register(client_spec.initializer(move |ch: &Channel| {
        let tx = tx.lock().expect("collector sender poisoned").clone();
        ch.pipeline().add_last("collect", Collector { tx })?;
        Ok(())
    }));

    server.when_registered().wait().unwrap();
    client.when_registered().wait().unwrap();

    let mut futures = Vec::new();
    for text in [&b"a"[..], b"bb", b"ccc"] {
        futures.push(client.write_and_flush(payload(&alloc, text)));
    }

    for (i, expected) in [&b"a"[..], b"bb", b"ccc"].iter().enumerate() {
        let got = rx
            .recv_timeout(Duration::from_secs(5))
            .unwrap_or_else(|_| panic!("echo {i} never arrived"));
        assert_eq!(&got, expected);
    }
    for future in futures {
        assert!(matches!(
            future.wait_timeout(Duration::from_secs(5)),
            Some(Ok(()))
        ));
    }

    client.close().wait_timeout(Duration::from_secs(5)).unwrap().unwrap();
    server.close_future().wait_timeout(Duration::from_secs(5));
    event_loop.shutdown_gracefully();

    // Every buffer travelled client -> server -> client and was dropped.
    assert_eq!(alloc.outstanding(), 0);
}

/// Records writability edges with the channel's own view of the flag.
struct WritabilityWatch {
    ch: Channel,
    tx: Sender<bool>,
}

impl Handler for WritabilityWatch {
    fn channel_writability_changed(&mut self, ctx: &Context) -> Result<(), ChannelError> {
        let _ = self.tx.send(self.ch.is_writable());
        ctx.fire_channel_writability_changed();
        Ok(())
    }
}

#[test]
fn writability_toggles_once_per_watermark_edge() {
    let alloc = test_alloc();
    let event_loop = EventLoopBuilder::new()
        .name("watermarks")
        .allocator(alloc.clone())
        .spawn()
        .unwrap();

    let (writer_spec, drain_spec) = UnregisteredChannel::local_pair();
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let writer = event_loop.register(
        writer_spec
            .config(ChannelConfig::default().water_marks(32 * 1024, 64 * 1024))
            .initializer(move |ch: &Channel| {
                let tx = tx.lock().expect("watch sender poisoned").clone();
                ch.pipeline().add_last(
                    "watch",
                    WritabilityWatch {
                        ch: ch.clone(),
                        tx,
                    },
                )?;
                Ok(())
            }),
    );
    writer.when_registered().wait().unwrap();

    // 100 KiB in 10 KiB chunks, no flush: the 7th write crosses 64 KiB.
    let mut futures = Vec::new();
    for _ in 0..10 {
        futures.push(writer.write(payload(&alloc, &vec![0xEE; 10 * 1024])));
    }
    assert!(!rx.recv_timeout(Duration::from_secs(5)).unwrap());
    assert!(rx.try_recv().is_err(), "high watermark fired more than once");

    // Registering the drain end and flushing empties the queue entirely,
    // dropping below the 32 KiB low watermark: exactly one recovery edge.
    let drain = event_loop.register(drain_spec);
    drain.when_registered().wait().unwrap();
    writer.flush();

    assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
    for future in futures {
        assert!(matches!(
            future.wait_timeout(Duration::from_secs(5)),
            Some(Ok(()))
        ));
    }
    assert!(rx.try_recv().is_err(), "low watermark fired more than once");

    event_loop.shutdown_gracefully();
    assert_eq!(alloc.outstanding(), 0);
}

#[test]
fn close_fails_writes_still_in_the_queue() {
    let alloc = test_alloc();
    let event_loop = EventLoopBuilder::new()
        .name("close-pending")
        .allocator(alloc.clone())
        .spawn()
        .unwrap();

    // Only one end registered: flushes cannot proceed, writes stay queued.
    let (lonely_spec, _never_registered) = UnregisteredChannel::local_pair();
    let lonely = event_loop.register(lonely_spec);
    lonely.when_registered().wait().unwrap();

    let queued = lonely.write(payload(&alloc, b"never leaves"));
    let closed = lonely.close();

    assert!(matches!(
        queued.wait_timeout(Duration::from_secs(5)),
        Some(Err(ChannelError::Closed))
    ));
    assert!(matches!(closed.wait_timeout(Duration::from_secs(5)), Some(Ok(()))));

    event_loop.shutdown_gracefully();
    assert_eq!(alloc.outstanding(), 0);
}

#[test]
fn shutdown_closes_registered_channels() {
    let alloc = test_alloc();
    let event_loop = EventLoopBuilder::new()
        .name("shutdown-close")
        .allocator(alloc.clone())
        .spawn()
        .unwrap();

    let (a_spec, b_spec) = UnregisteredChannel::local_pair();
    let a = event_loop.register(a_spec);
    let b = event_loop.register(b_spec);
    a.when_registered().wait().unwrap();
    b.when_registered().wait().unwrap();

    event_loop.shutdown_gracefully();

    assert!(matches!(
        a.close_future().wait_timeout(Duration::from_secs(5)),
        Some(Ok(()))
    ));
    assert!(matches!(
        b.close_future().wait_timeout(Duration::from_secs(5)),
        Some(Ok(()))
    ));
}
