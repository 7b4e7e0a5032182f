//! Loopback TCP: accept, connect, echo, teardown.

use std::net::SocketAddr;
use std::sync::mpsc::{self, Sender};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use seine::{ChannelError, Context, Handler, Message};
use seine_buffer::{AllocatorConfig, ByteBuf, PooledAllocator};
use seine_transport::{Channel, EventLoopGroup, UnregisteredChannel};

fn test_alloc() -> PooledAllocator {
    PooledAllocator::new(
        AllocatorConfig::default()
            .page_size(4096)
            .max_order(4)
            .arena_count(2),
    )
}

fn payload(alloc: &PooledAllocator, bytes: &[u8]) -> Box<ByteBuf> {
    let len = bytes.len().max(1);
    let mut buf = alloc.allocate(len, len).unwrap();
    buf.write_bytes(bytes);
    Box::new(buf)
}

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

/// Streams every received byte to an mpsc channel (TCP may re-chunk).
struct ByteCollector {
    tx: Sender<Vec<u8>>,
}

impl Handler for ByteCollector {
    fn channel_read(&mut self, _ctx: &Context, msg: Message) -> Result<(), ChannelError> {
        let buf = msg
            .downcast::<ByteBuf>()
            .map_err(|_| ChannelError::protocol("expected a buffer"))?;
        let _ = self.tx.send(buf.readable_slice().to_vec());
        Ok(())
    }
}

#[test]
fn tcp_loopback_echo_round_trips_bytes() {
    let alloc = test_alloc();
    let group = EventLoopGroup::new(2, "tcp-echo", alloc.clone()).unwrap();

    // Server: bind an ephemeral port, echo on every child.
    let server = group.next().register(
        UnregisteredChannel::tcp_server().child_initializer(|ch: &Channel| {
            ch.pipeline().add_last("echo", Echo)?;
            Ok(())
        }),
    );
    server.when_registered().wait().unwrap();

    let (addr_tx, addr_rx) = mpsc::channel();
    server.invoke(move |ch| {
        let bound = ch.pipeline().bind("127.0.0.1:0".parse().unwrap());
        // bind runs synchronously on the loop
        assert!(matches!(bound.result(), Some(Ok(()))));
        let _ = addr_tx.send(ch.local_addr());
    });
    let addr: SocketAddr = addr_rx
        .recv_timeout(Duration::from_secs(5))
        .unwrap()
        .expect("server bound an address");

    // Client: connect and collect echoed bytes.
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let client = group.next().register(UnregisteredChannel::tcp().initializer(
        move |ch: &Channel| {
            let tx = tx.lock().expect("collector sender poisoned").clone();
            ch.pipeline().add_last("collect", ByteCollector { tx })?;
            Ok(())
        },
    ));
    client.when_registered().wait().unwrap();

    let (connect_tx, connect_rx) = mpsc::channel();
    client.invoke(move |ch| {
        let fut = ch.pipeline().connect(addr, None);
        let _ = connect_tx.send(fut);
    });
    let connected = connect_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    // Writes are queued even while the connect is still in flight.
    let w1 = client.write_and_flush(payload(&alloc, b"hello "));
    let w2 = client.write_and_flush(payload(&alloc, b"world"));

    assert!(matches!(
        connected.wait_timeout(Duration::from_secs(5)),
        Some(Ok(()))
    ));

    let mut received = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(5);
    while received.len() < b"hello world".len() {
        let left = deadline
            .checked_duration_since(Instant::now())
            .expect("echo did not complete in time");
        let chunk = rx.recv_timeout(left).expect("echo stalled");
        received.extend_from_slice(&chunk);
    }
    assert_eq!(received, b"hello world");

    assert!(matches!(w1.wait_timeout(Duration::from_secs(5)), Some(Ok(()))));
    assert!(matches!(w2.wait_timeout(Duration::from_secs(5)), Some(Ok(()))));

    assert!(matches!(
        client.close().wait_timeout(Duration::from_secs(5)),
        Some(Ok(()))
    ));
    group.shutdown_gracefully();
    assert_eq!(alloc.outstanding(), 0);
}

#[test]
fn connect_to_a_dead_port_fails_the_promise() {
    let alloc = test_alloc();
    let group = EventLoopGroup::new(1, "tcp-refused", alloc.clone()).unwrap();

    // Grab a port that is certainly closed by binding and dropping it.
    let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let dead = probe.local_addr().unwrap();
    drop(probe);

    let client = group.next().register(UnregisteredChannel::tcp());
    client.when_registered().wait().unwrap();

    let (tx, rx) = mpsc::channel();
    client.invoke(move |ch| {
        let _ = tx.send(ch.pipeline().connect(dead, None));
    });
    let fut = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    match fut.wait_timeout(Duration::from_secs(10)) {
        Some(Err(ChannelError::Transport(_))) | Some(Err(ChannelError::Closed)) => {}
        other => panic!("expected a failed connect, got {other:?}"),
    }
    assert!(matches!(
        client.close_future().wait_timeout(Duration::from_secs(5)),
        Some(Ok(()))
    ));
    group.shutdown_gracefully();
}
