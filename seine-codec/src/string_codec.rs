//! UTF-8 string codec: buffers in, `String`s out, and back again.

use seine::{ChannelError, ChannelPromise, Context, Handler, Message};
use seine_buffer::ByteBuf;

/// Decodes inbound frames into `String` messages and encodes outbound
/// `String`s into buffers. Outbound messages of any other type pass
/// through untouched, so the codec composes with binary writers.
#[derive(Default)]
pub struct StringCodec;

impl StringCodec {
    /// A fresh codec; it is stateless.
    pub fn new() -> Self {
        StringCodec
    }
}

impl Handler for StringCodec {
    fn channel_read(&mut self, ctx: &Context, msg: Message) -> Result<(), ChannelError> {
        let buf = msg
            .downcast::<ByteBuf>()
            .map_err(|_| ChannelError::protocol("string codec expects byte frames"))?;
        let text = std::str::from_utf8(buf.readable_slice())
            .map_err(|e| ChannelError::Protocol(format!("invalid utf-8 in frame: {e}")))?
            .to_owned();
        ctx.fire_channel_read(Box::new(text));
        Ok(())
    }

    fn write(
        &mut self,
        ctx: &Context,
        msg: Message,
        promise: ChannelPromise,
    ) -> Result<(), ChannelError> {
        match msg.downcast::<String>() {
            Ok(text) => {
                let bytes = text.as_bytes();
                let mut buf = ctx.alloc().allocate(bytes.len().max(1), bytes.len().max(1))?;
                buf.write_bytes(bytes);
                ctx.write_with_promise(Box::new(buf), promise);
            }
            Err(other) => ctx.write_with_promise(other, promise),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use seine::{NullSink, OutboundSink, Pipeline};
    use seine_buffer::{AllocatorConfig, PooledAllocator};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn alloc() -> PooledAllocator {
        PooledAllocator::new(
            AllocatorConfig::default()
                .page_size(4096)
                .max_order(4)
                .arena_count(1),
        )
    }

    struct CapturingSink {
        written: RefCell<Vec<Vec<u8>>>,
    }

    impl OutboundSink for CapturingSink {
        fn write(&self, msg: Message, promise: ChannelPromise) {
            if let Ok(buf) = msg.downcast::<ByteBuf>() {
                self.written.borrow_mut().push(buf.readable_slice().to_vec());
            }
            promise.succeed();
        }
        fn flush(&self) {}
        fn read(&self) {}
        fn bind(&self, _addr: std::net::SocketAddr, promise: ChannelPromise) {
            promise.succeed();
        }
        fn connect(
            &self,
            _remote: std::net::SocketAddr,
            _local: Option<std::net::SocketAddr>,
            promise: ChannelPromise,
        ) {
            promise.succeed();
        }
        fn disconnect(&self, promise: ChannelPromise) {
            promise.succeed();
        }
        fn close(&self, promise: ChannelPromise) {
            promise.succeed();
        }
        fn deregister(&self, promise: ChannelPromise) {
            promise.succeed();
        }
    }

    struct StringTap {
        seen: Rc<RefCell<Vec<String>>>,
    }

    impl Handler for StringTap {
        fn channel_read(&mut self, _ctx: &Context, msg: Message) -> Result<(), ChannelError> {
            let text = msg
                .downcast::<String>()
                .map_err(|_| ChannelError::protocol("expected a string"))?;
            self.seen.borrow_mut().push(*text);
            Ok(())
        }
    }

    #[test]
    fn decodes_frames_to_strings() {
        let a = alloc();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let pipeline = Pipeline::new(a.clone(), Rc::new(NullSink));
        pipeline.add_last("strings", StringCodec::new()).unwrap();
        pipeline
            .add_last("tap", StringTap { seen: Rc::clone(&seen) })
            .unwrap();

        let mut frame = a.allocate(16, 16).unwrap();
        frame.write_bytes("grüß dich".as_bytes());
        pipeline.fire_channel_read(Box::new(frame));

        assert_eq!(seen.borrow().as_slice(), ["grüß dich".to_string()]);
        assert_eq!(a.outstanding(), 0);
    }

    #[test]
    fn rejects_invalid_utf8() {
        let a = alloc();
        let pipeline = Pipeline::new(a.clone(), Rc::new(NullSink));
        pipeline.add_last("strings", StringCodec::new()).unwrap();

        let mut frame = a.allocate(4, 4).unwrap();
        frame.write_bytes(&[0xFF, 0xFE, 0xFD]);
        // The tail logs the resulting protocol exception; nothing panics
        // and the buffer is released.
        pipeline.fire_channel_read(Box::new(frame));
        assert_eq!(a.outstanding(), 0);
    }

    #[test]
    fn encodes_strings_and_passes_foreign_messages_through() {
        let a = alloc();
        let sink = Rc::new(CapturingSink {
            written: RefCell::new(Vec::new()),
        });
        let pipeline = Pipeline::new(a.clone(), Rc::clone(&sink) as Rc<dyn OutboundSink>);
        pipeline.add_last("strings", StringCodec::new()).unwrap();

        pipeline
            .write(Box::new("hallo".to_string()))
            .result()
            .unwrap()
            .unwrap();
        let mut raw = a.allocate(4, 4).unwrap();
        raw.write_bytes(b"\x01\x02");
        pipeline.write(Box::new(raw)).result().unwrap().unwrap();

        assert_eq!(
            sink.written.borrow().as_slice(),
            [b"hallo".to_vec(), b"\x01\x02".to_vec()]
        );
        assert_eq!(a.outstanding(), 0);
    }
}
