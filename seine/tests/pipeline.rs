//! Pipeline behaviour: propagation order, exception routing, dynamic
//! modification and the head/tail sentinel contracts.

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;

use seine::{
    ChannelError, ChannelPromise, Context, Handler, Message, OutboundSink, Pipeline,
};
use seine_buffer::{AllocatorConfig, ByteBuf, PooledAllocator};

fn test_alloc() -> PooledAllocator {
    PooledAllocator::new(
        AllocatorConfig::default()
            .page_size(4096)
            .max_order(4)
            .arena_count(1),
    )
}

fn buf_msg(alloc: &PooledAllocator, bytes: &[u8]) -> Message {
    let mut buf = alloc.allocate(bytes.len().max(1), 4096).unwrap();
    buf.write_bytes(bytes);
    Box::new(buf)
}

/// Records every outbound operation that reaches the head.
#[derive(Default)]
struct RecordingSink {
    ops: RefCell<Vec<String>>,
    written: RefCell<Vec<Vec<u8>>>,
}

impl RecordingSink {
    fn ops(&self) -> Vec<String> {
        self.ops.borrow().clone()
    }

    fn written(&self) -> Vec<Vec<u8>> {
        self.written.borrow().clone()
    }
}

impl OutboundSink for RecordingSink {
    fn write(&self, msg: Message, promise: ChannelPromise) {
        match msg.downcast::<ByteBuf>() {
            Ok(buf) => {
                self.written.borrow_mut().push(buf.readable_slice().to_vec());
                self.ops.borrow_mut().push("write".into());
                promise.succeed();
            }
            Err(_) => {
                promise.fail(ChannelError::protocol("unsupported outbound message type"));
            }
        }
    }

    fn flush(&self) {
        self.ops.borrow_mut().push("flush".into());
    }

    fn read(&self) {
        self.ops.borrow_mut().push("read".into());
    }

    fn bind(&self, addr: SocketAddr, promise: ChannelPromise) {
        self.ops.borrow_mut().push(format!("bind:{addr}"));
        promise.succeed();
    }

    fn connect(&self, remote: SocketAddr, _local: Option<SocketAddr>, promise: ChannelPromise) {
        self.ops.borrow_mut().push(format!("connect:{remote}"));
        promise.succeed();
    }

    fn disconnect(&self, promise: ChannelPromise) {
        self.ops.borrow_mut().push("disconnect".into());
        promise.succeed();
    }

    fn close(&self, promise: ChannelPromise) {
        self.ops.borrow_mut().push("close".into());
        promise.succeed();
    }

    fn deregister(&self, promise: ChannelPromise) {
        self.ops.borrow_mut().push("deregister".into());
        promise.succeed();
    }
}

/// Logs selected events under its name, forwarding everything.
struct Recorder {
    tag: &'static str,
    log: Rc<RefCell<Vec<String>>>,
}

impl Recorder {
    fn new(tag: &'static str, log: &Rc<RefCell<Vec<String>>>) -> Self {
        Recorder {
            tag,
            log: Rc::clone(log),
        }
    }

    fn note(&self, what: &str) {
        self.log.borrow_mut().push(format!("{}:{}", self.tag, what));
    }
}

impl Handler for Recorder {
    fn handler_added(&mut self, _ctx: &Context) -> Result<(), ChannelError> {
        self.note("added");
        Ok(())
    }

    fn handler_removed(&mut self, _ctx: &Context) -> Result<(), ChannelError> {
        self.note("removed");
        Ok(())
    }

    fn channel_active(&mut self, ctx: &Context) -> Result<(), ChannelError> {
        self.note("active");
        ctx.fire_channel_active();
        Ok(())
    }

    fn channel_read(&mut self, ctx: &Context, msg: Message) -> Result<(), ChannelError> {
        self.note("read");
        ctx.fire_channel_read(msg);
        Ok(())
    }

    fn exception_caught(&mut self, ctx: &Context, cause: ChannelError) -> Result<(), ChannelError> {
        self.note(&format!("exception:{cause}"));
        ctx.fire_exception_caught(cause);
        Ok(())
    }
}

fn pipeline_with_sink() -> (Pipeline, Rc<RecordingSink>, PooledAllocator) {
    let alloc = test_alloc();
    let sink = Rc::new(RecordingSink::default());
    let pipeline = Pipeline::new(alloc.clone(), Rc::clone(&sink) as Rc<dyn OutboundSink>);
    (pipeline, sink, alloc)
}

#[test]
fn inbound_events_visit_handlers_in_order() {
    let (pipeline, _sink, alloc) = pipeline_with_sink();
    let log = Rc::new(RefCell::new(Vec::new()));
    pipeline.add_last("a", Recorder::new("a", &log)).unwrap();
    pipeline.add_last("b", Recorder::new("b", &log)).unwrap();

    pipeline.fire_channel_active();
    pipeline.fire_channel_read(buf_msg(&alloc, b"x"));

    assert_eq!(
        log.borrow().as_slice(),
        ["a:added", "b:added", "a:active", "b:active", "a:read", "b:read"]
    );
}

#[test]
fn exception_from_inbound_handler_lands_on_next_context() {
    struct Faulty;
    impl Handler for Faulty {
        fn channel_read(&mut self, _ctx: &Context, _msg: Message) -> Result<(), ChannelError> {
            Err(ChannelError::protocol("boom"))
        }
    }

    let (pipeline, _sink, alloc) = pipeline_with_sink();
    let log = Rc::new(RefCell::new(Vec::new()));
    pipeline.add_last("a", Recorder::new("a", &log)).unwrap();
    pipeline.add_last("b", Faulty).unwrap();
    pipeline.add_last("c", Recorder::new("c", &log)).unwrap();

    pipeline.fire_channel_read(buf_msg(&alloc, b"x"));

    // C never sees the read, only B's failure as an exception event.
    assert_eq!(
        log.borrow().as_slice(),
        [
            "a:added",
            "c:added",
            "a:read",
            "c:exception:protocol error: boom"
        ]
    );
    // The message B consumed-by-failing was dropped, not leaked.
    assert_eq!(alloc.outstanding(), 0);
}

#[test]
fn outbound_error_fails_promise_and_fires_exception_inbound() {
    struct Rejecting;
    impl Handler for Rejecting {
        fn write(
            &mut self,
            _ctx: &Context,
            _msg: Message,
            _promise: ChannelPromise,
        ) -> Result<(), ChannelError> {
            Err(ChannelError::protocol("rejected"))
        }
    }

    let (pipeline, sink, alloc) = pipeline_with_sink();
    let log = Rc::new(RefCell::new(Vec::new()));
    pipeline.add_last("obs", Recorder::new("obs", &log)).unwrap();
    pipeline.add_last("rej", Rejecting).unwrap();

    let future = pipeline.write(buf_msg(&alloc, b"payload"));

    assert!(matches!(future.result(), Some(Err(ChannelError::Protocol(_)))));
    assert!(sink.written().is_empty());
    assert!(log
        .borrow()
        .iter()
        .any(|e| e.starts_with("obs:exception:protocol error: rejected")));
}

#[test]
fn add_then_remove_restores_structure_and_runs_hooks() {
    let (pipeline, _sink, _alloc) = pipeline_with_sink();
    let log = Rc::new(RefCell::new(Vec::new()));
    let before = pipeline.names();

    pipeline.add_last("h", Recorder::new("h", &log)).unwrap();
    assert_eq!(pipeline.names(), vec!["h".to_string()]);
    pipeline.remove("h").unwrap();

    assert_eq!(pipeline.names(), before);
    assert_eq!(log.borrow().as_slice(), ["h:added", "h:removed"]);
}

#[test]
fn insertion_order_operators_place_handlers_correctly() {
    let (pipeline, _sink, _alloc) = pipeline_with_sink();
    let log = Rc::new(RefCell::new(Vec::new()));

    pipeline.add_last("b", Recorder::new("b", &log)).unwrap();
    pipeline.add_first("a", Recorder::new("a", &log)).unwrap();
    pipeline.add_after("b", "d", Recorder::new("d", &log)).unwrap();
    pipeline.add_before("d", "c", Recorder::new("c", &log)).unwrap();

    assert_eq!(pipeline.names(), vec!["a", "b", "c", "d"]);

    // Structural guards
    assert!(pipeline.add_last("a", Recorder::new("a", &log)).is_err());
    assert!(pipeline.add_last("head", Recorder::new("x", &log)).is_err());
    assert!(pipeline.remove("nope").is_err());
}

#[test]
fn replace_keeps_position() {
    let (pipeline, _sink, _alloc) = pipeline_with_sink();
    let log = Rc::new(RefCell::new(Vec::new()));
    pipeline.add_last("a", Recorder::new("a", &log)).unwrap();
    pipeline.add_last("mid", Recorder::new("old", &log)).unwrap();
    pipeline.add_last("z", Recorder::new("z", &log)).unwrap();

    pipeline
        .replace("mid", "mid2", Recorder::new("new", &log))
        .unwrap();
    assert_eq!(pipeline.names(), vec!["a", "mid2", "z"]);
    assert!(log.borrow().contains(&"new:added".to_string()));
    assert!(log.borrow().contains(&"old:removed".to_string()));
}

#[test]
fn write_issued_inside_read_reaches_the_sink() {
    /// A dual handler: passes reads through and tags writes, so an echo
    /// write from a later handler must traverse it while its own
    /// `channel_read` frame is still on the stack.
    struct Framing;
    impl Handler for Framing {
        fn write(
            &mut self,
            ctx: &Context,
            msg: Message,
            promise: ChannelPromise,
        ) -> Result<(), ChannelError> {
            let mut buf = *msg
                .downcast::<ByteBuf>()
                .map_err(|_| ChannelError::protocol("expected a buffer"))?;
            let mut framed = ctx.alloc().allocate(buf.readable_bytes() + 1, 4096)?;
            framed.write_from(&mut buf);
            framed.write_u8(b'\n');
            ctx.write_with_promise(Box::new(framed), promise);
            Ok(())
        }
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

    let (pipeline, sink, alloc) = pipeline_with_sink();
    pipeline.add_last("framing", Framing).unwrap();
    pipeline.add_last("echo", Echo).unwrap();

    pipeline.fire_channel_read(buf_msg(&alloc, b"hi"));
    pipeline.fire_channel_read_complete();

    assert_eq!(sink.written(), vec![b"hi\n".to_vec()]);
    assert_eq!(sink.ops().last().map(String::as_str), Some("flush"));
    assert_eq!(alloc.outstanding(), 0);
}

#[test]
fn tail_releases_unconsumed_messages() {
    let (pipeline, _sink, alloc) = pipeline_with_sink();
    pipeline.fire_channel_read(buf_msg(&alloc, b"nobody reads me"));
    assert_eq!(alloc.outstanding(), 0);
}

#[test]
fn outbound_operations_reach_the_sink_in_order() {
    let (pipeline, sink, alloc) = pipeline_with_sink();
    let addr: SocketAddr = "127.0.0.1:4000".parse().unwrap();

    pipeline.bind(addr).result().unwrap().unwrap();
    let w = pipeline.write(buf_msg(&alloc, b"one"));
    pipeline.flush();
    let c = pipeline.close();

    assert!(matches!(w.result(), Some(Ok(()))));
    assert!(matches!(c.result(), Some(Ok(()))));
    assert_eq!(
        sink.ops(),
        vec![format!("bind:{addr}"), "write".into(), "flush".into(), "close".into()]
    );
}
