//! Frames split across arbitrary read boundaries must reassemble.

use std::cell::RefCell;
use std::rc::Rc;

use seine::{ChannelError, Context, Handler, Message, NullSink, Pipeline};
use seine_buffer::{AllocatorConfig, PooledAllocator};
use seine_codec::{ByteToMessageCodec, LineBasedFrameDecoder, StringCodec, TerminatorType};

struct Tap {
    seen: Rc<RefCell<Vec<String>>>,
}

impl Handler for Tap {
    fn channel_read(&mut self, _ctx: &Context, msg: Message) -> Result<(), ChannelError> {
        let text = msg
            .downcast::<String>()
            .map_err(|_| ChannelError::protocol("expected a string"))?;
        self.seen.borrow_mut().push(*text);
        Ok(())
    }
}

fn text_pipeline() -> (Pipeline, Rc<RefCell<Vec<String>>>, PooledAllocator) {
    let alloc = PooledAllocator::new(
        AllocatorConfig::default()
            .page_size(4096)
            .max_order(4)
            .arena_count(1),
    );
    let pipeline = Pipeline::new(alloc.clone(), Rc::new(NullSink));
    pipeline
        .add_last(
            "framer",
            ByteToMessageCodec::new(Box::new(LineBasedFrameDecoder::new(
                8192,
                true,
                TerminatorType::Both,
            ))),
        )
        .unwrap();
    pipeline.add_last("strings", StringCodec::new()).unwrap();
    let seen = Rc::new(RefCell::new(Vec::new()));
    pipeline
        .add_last("tap", Tap { seen: Rc::clone(&seen) })
        .unwrap();
    (pipeline, seen, alloc)
}

fn feed(pipeline: &Pipeline, alloc: &PooledAllocator, chunk: &[u8]) {
    let mut buf = alloc.allocate(chunk.len().max(1), chunk.len().max(1)).unwrap();
    buf.write_bytes(chunk);
    pipeline.fire_channel_read(Box::new(buf));
}

#[test]
fn lines_reassemble_across_chunks() {
    let (pipeline, seen, alloc) = text_pipeline();

    feed(&pipeline, &alloc, b"he");
    feed(&pipeline, &alloc, b"llo\r\nwor");
    assert_eq!(seen.borrow().as_slice(), ["hello".to_string()]);

    feed(&pipeline, &alloc, b"ld\nrest");
    assert_eq!(
        seen.borrow().as_slice(),
        ["hello".to_string(), "world".to_string()]
    );

    // The tail of an unterminated line is still buffered, not delivered.
    feed(&pipeline, &alloc, b" of it\n");
    assert_eq!(
        seen.borrow().as_slice(),
        [
            "hello".to_string(),
            "world".to_string(),
            "rest of it".to_string()
        ]
    );

    pipeline.fire_channel_inactive();
    assert_eq!(alloc.outstanding(), 0);
}

#[test]
fn one_burst_may_contain_many_lines() {
    let (pipeline, seen, alloc) = text_pipeline();
    feed(&pipeline, &alloc, b"a\nbb\nccc\n");
    assert_eq!(
        seen.borrow().as_slice(),
        ["a".to_string(), "bb".to_string(), "ccc".to_string()]
    );
    assert_eq!(alloc.outstanding(), 0);
}
