use std::io::BufRead;
use std::sync::mpsc;
use std::sync::Mutex;
use std::time::Duration;

use clap::Parser;
use log::info;

use seine::{ChannelError, Context, Handler, Message};
use seine_bootstrap::Bootstrap;
use seine_codec::{ByteToMessageCodec, LineBasedFrameDecoder, StringCodec, TerminatorType};
use seine_transport::EventLoopBuilder;

////////////////////////////////////////////////////////////////////////////////////////////////////
struct PrintHandler;

impl Handler for PrintHandler {
    fn channel_read(&mut self, _ctx: &Context, msg: Message) -> Result<(), ChannelError> {
        let line = msg
            .downcast::<String>()
            .map_err(|_| ChannelError::protocol("expected a text line"))?;
        println!("< {line}");
        Ok(())
    }

    fn channel_inactive(&mut self, ctx: &Context) -> Result<(), ChannelError> {
        info!("server closed the connection");
        ctx.fire_channel_inactive();
        Ok(())
    }
}

#[derive(Parser)]
#[command(name = "Echo Client")]
#[command(version = "0.1.0")]
#[command(about = "Reads stdin lines, sends them to an echo server", long_about = None)]
struct Cli {
    #[arg(short, long)]
    debug: bool,
    #[arg(long, default_value_t = format!("127.0.0.1"))]
    host: String,
    #[arg(long, default_value_t = 8080)]
    port: u16,
    #[arg(long, default_value_t = format!("INFO"))]
    log_level: String,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    demos::init_logging(cli.debug, &cli.log_level)?;

    let event_loop = EventLoopBuilder::new().name("client").spawn()?;

    let (close_tx, close_rx) = mpsc::channel::<()>();
    let close_tx = Mutex::new(Some(close_tx));
    let channel = Bootstrap::new()
        .group(event_loop.clone())
        .pipeline(move |ch| {
            ch.pipeline().add_last(
                "framer",
                ByteToMessageCodec::new(Box::new(LineBasedFrameDecoder::new(
                    8192,
                    true,
                    TerminatorType::Both,
                ))),
            )?;
            ch.pipeline().add_last("strings", StringCodec::new())?;
            ch.pipeline().add_last("print", PrintHandler)?;
            let close_tx = close_tx.lock().expect("poisoned").take();
            if let Some(close_tx) = close_tx {
                ch.close_future().add_listener(move |_| {
                    let _ = close_tx.send(());
                });
            }
            Ok(())
        })
        .connect(format!("{}:{}", cli.host, cli.port).parse()?)?;

    info!("connected; type lines, Ctrl-D to quit");
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        let future = channel.write_and_flush(Box::new(format!("{line}\n")));
        if let Some(Err(err)) = future.wait_timeout(Duration::from_secs(10)) {
            info!("write failed: {err}");
            break;
        }
        // Stop typing into a dead connection.
        if close_rx.try_recv().is_ok() {
            break;
        }
    }

    let _ = channel.close().wait_timeout(Duration::from_secs(5));
    event_loop.shutdown_gracefully();
    Ok(())
}
