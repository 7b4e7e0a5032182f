use std::sync::mpsc;
use std::sync::Arc;

use clap::Parser;
use log::{error, info};

use seine::{ChannelError, Context, Handler, Message};
use seine_buffer::PooledAllocator;
use seine_bootstrap::ServerBootstrap;
use seine_codec::{ByteToMessageCodec, LineBasedFrameDecoder, StringCodec, TerminatorType};
use seine_transport::{EventLoopBuilder, EventLoopGroup};

////////////////////////////////////////////////////////////////////////////////////////////////////
struct EchoServerHandler;

impl Handler for EchoServerHandler {
    fn channel_active(&mut self, ctx: &Context) -> Result<(), ChannelError> {
        info!("peer connected");
        ctx.fire_channel_active();
        Ok(())
    }

    fn channel_read(&mut self, ctx: &Context, msg: Message) -> Result<(), ChannelError> {
        let line = msg
            .downcast::<String>()
            .map_err(|_| ChannelError::protocol("expected a text line"))?;
        info!("received: {line}");
        ctx.write(Box::new(format!("{line}\r\n")));
        Ok(())
    }

    fn channel_read_complete(&mut self, ctx: &Context) -> Result<(), ChannelError> {
        ctx.flush();
        Ok(())
    }

    fn channel_inactive(&mut self, ctx: &Context) -> Result<(), ChannelError> {
        info!("peer left");
        ctx.fire_channel_inactive();
        Ok(())
    }
}

#[derive(Parser)]
#[command(name = "Echo Server")]
#[command(version = "0.1.0")]
#[command(about = "A line-based echo server on seine event loops", long_about = None)]
struct Cli {
    #[arg(short, long)]
    debug: bool,
    #[arg(long, default_value_t = format!("0.0.0.0"))]
    host: String,
    #[arg(long, default_value_t = 8080)]
    port: u16,
    #[arg(long, default_value_t = 2)]
    workers: usize,
    #[arg(long, default_value_t = format!("INFO"))]
    log_level: String,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    demos::init_logging(cli.debug, &cli.log_level)?;

    let allocator = PooledAllocator::default();
    let acceptor = EventLoopBuilder::new()
        .name("acceptor")
        .allocator(allocator.clone())
        .spawn()?;
    let workers = Arc::new(EventLoopGroup::new(cli.workers, "worker", allocator)?);

    let server = ServerBootstrap::new()
        .group(acceptor.clone())
        .child_group(Arc::clone(&workers))
        .pipeline(|ch| {
            ch.pipeline().add_last(
                "framer",
                ByteToMessageCodec::new(Box::new(LineBasedFrameDecoder::new(
                    8192,
                    true,
                    TerminatorType::Both,
                ))),
            )?;
            ch.pipeline().add_last("strings", StringCodec::new())?;
            ch.pipeline().add_last("echo", EchoServerHandler)?;
            Ok(())
        });

    let addr = match server.bind(format!("{}:{}", cli.host, cli.port).parse()?) {
        Ok(addr) => addr,
        Err(err) => {
            error!("bind failed: {err}");
            return Err(err.into());
        }
    };
    info!("listening on {addr}");
    info!("Press Ctrl-C to stop");
    info!("try `nc {} {}` in another shell", cli.host, cli.port);

    let (stop_tx, stop_rx) = mpsc::channel::<()>();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    })?;
    let _ = stop_rx.recv();

    info!("shutting down...");
    server.stop();
    workers.shutdown_gracefully();
    acceptor.shutdown_gracefully();
    info!("goodbye");
    Ok(())
}
