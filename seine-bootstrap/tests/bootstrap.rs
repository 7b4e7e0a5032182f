//! Full-stack bootstrap test: line-framed echo over loopback TCP.

use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use seine::{ChannelError, Context, Handler, Message};
use seine_buffer::{AllocatorConfig, ByteBuf, PooledAllocator};
use seine_codec::{ByteToMessageCodec, LineBasedFrameDecoder, StringCodec, TerminatorType};
use seine_bootstrap::{Bootstrap, ServerBootstrap};
use seine_transport::{Channel, EventLoopBuilder, EventLoopGroup};

fn test_alloc() -> PooledAllocator {
    PooledAllocator::new(
        AllocatorConfig::default()
            .page_size(4096)
            .max_order(4)
            .arena_count(2),
    )
}

fn install_line_codecs(ch: &Channel) -> Result<(), ChannelError> {
    ch.pipeline().add_last(
        "framer",
        ByteToMessageCodec::new(Box::new(LineBasedFrameDecoder::new(
            8192,
            true,
            TerminatorType::Both,
        ))),
    )?;
    ch.pipeline().add_last("strings", StringCodec::new())?;
    Ok(())
}

/// Echoes every line back, uppercased, with a terminator re-attached.
struct ShoutingEcho;

impl Handler for ShoutingEcho {
    fn channel_read(&mut self, ctx: &Context, msg: Message) -> Result<(), ChannelError> {
        let line = msg
            .downcast::<String>()
            .map_err(|_| ChannelError::protocol("expected a line"))?;
        ctx.write(Box::new(format!("{}\n", line.to_uppercase())));
        Ok(())
    }

    fn channel_read_complete(&mut self, ctx: &Context) -> Result<(), ChannelError> {
        ctx.flush();
        Ok(())
    }
}

struct LineTap {
    tx: Sender<String>,
}

impl Handler for LineTap {
    fn channel_read(&mut self, _ctx: &Context, msg: Message) -> Result<(), ChannelError> {
        let line = msg
            .downcast::<String>()
            .map_err(|_| ChannelError::protocol("expected a line"))?;
        let _ = self.tx.send(*line);
        Ok(())
    }
}

fn line(alloc: &PooledAllocator, text: &str) -> Box<ByteBuf> {
    let bytes = text.as_bytes();
    let mut buf = alloc.allocate(bytes.len(), bytes.len()).unwrap();
    buf.write_bytes(bytes);
    Box::new(buf)
}

#[test]
fn bootstrapped_server_and_client_exchange_lines() {
    let alloc = test_alloc();
    let acceptor = EventLoopBuilder::new()
        .name("boot-acceptor")
        .allocator(alloc.clone())
        .spawn()
        .unwrap();
    let workers = Arc::new(EventLoopGroup::new(2, "boot-worker", alloc.clone()).unwrap());
    let client_loop = EventLoopBuilder::new()
        .name("boot-client")
        .allocator(alloc.clone())
        .spawn()
        .unwrap();

    let server = ServerBootstrap::new()
        .group(acceptor.clone())
        .child_group(Arc::clone(&workers))
        .pipeline(|ch| {
            install_line_codecs(ch)?;
            ch.pipeline().add_last("echo", ShoutingEcho)?;
            Ok(())
        });
    let addr = server.bind("127.0.0.1:0".parse().unwrap()).unwrap();

    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let client = Bootstrap::new()
        .group(client_loop.clone())
        .pipeline(move |ch| {
            install_line_codecs(ch)?;
            let tx = tx.lock().expect("tap sender poisoned").clone();
            ch.pipeline().add_last("tap", LineTap { tx })?;
            Ok(())
        })
        .connect(addr)
        .unwrap();

    let w1 = client.write_and_flush(line(&alloc, "first line\n"));
    let w2 = client.write_and_flush(line(&alloc, "second line\n"));

    assert_eq!(
        rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        "FIRST LINE"
    );
    assert_eq!(
        rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        "SECOND LINE"
    );
    assert!(matches!(w1.wait_timeout(Duration::from_secs(5)), Some(Ok(()))));
    assert!(matches!(w2.wait_timeout(Duration::from_secs(5)), Some(Ok(()))));

    client
        .close()
        .wait_timeout(Duration::from_secs(5))
        .unwrap()
        .unwrap();
    server.stop();
    client_loop.shutdown_gracefully();
    workers.shutdown_gracefully();
    acceptor.shutdown_gracefully();
    assert_eq!(alloc.outstanding(), 0);
}

#[test]
fn connect_without_a_listener_fails() {
    let event_loop = EventLoopBuilder::new().name("no-listener").spawn().unwrap();

    let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let dead = probe.local_addr().unwrap();
    drop(probe);

    let result = Bootstrap::new()
        .group(event_loop.clone())
        .pipeline(|_| Ok(()))
        .connect(dead);
    assert!(result.is_err());
    event_loop.shutdown_gracefully();
}
