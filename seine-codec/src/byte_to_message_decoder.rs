//! Byte-to-message framing: cumulate inbound buffers, carve frames.

use seine::{ChannelError, Context, Handler, Message};
use seine_buffer::ByteBuf;

/// Hard ceiling for the cumulation buffer. Individual decoders bound their
/// frames much lower; this only protects against a runaway peer.
const CUMULATION_MAX: usize = 1 << 30;

/// Turns a byte stream into framed messages.
///
/// `decode` is called repeatedly with the cumulation buffer. Return
/// `Ok(Some(frame))` after consuming one frame's bytes from the buffer,
/// `Ok(None)` when more bytes are needed, or `Err` for an unrecoverable
/// protocol violation (which travels the pipeline as `exception_caught`
/// and usually closes the channel).
pub trait MessageDecoder {
    /// Attempts to carve the next frame off `input`.
    fn decode(&mut self, input: &mut ByteBuf) -> Result<Option<Message>, ChannelError>;
}

/// A pipeline handler adapting a [`MessageDecoder`] to the inbound byte
/// stream: read bursts are cumulated, complete frames flow on to the next
/// handler, partial trailing bytes wait for the next burst.
pub struct ByteToMessageCodec {
    decoder: Box<dyn MessageDecoder>,
    cumulation: Option<ByteBuf>,
}

impl ByteToMessageCodec {
    /// Wraps a decoder.
    pub fn new(decoder: Box<dyn MessageDecoder>) -> Self {
        ByteToMessageCodec {
            decoder,
            cumulation: None,
        }
    }

    fn cumulate(
        &mut self,
        ctx: &Context,
        mut cum: ByteBuf,
        mut input: ByteBuf,
    ) -> Result<ByteBuf, ChannelError> {
        cum.discard_read_bytes();
        if cum.ensure_writable(input.readable_bytes()).is_err() {
            // The first burst's buffer cannot grow any further; move the
            // backlog into a dedicated cumulation buffer.
            let need = cum.readable_bytes() + input.readable_bytes();
            let mut bigger = ctx.alloc().allocate(need, CUMULATION_MAX)?;
            bigger.write_from(&mut cum);
            cum = bigger;
        }
        cum.write_from(&mut input);
        Ok(cum)
    }
}

impl Handler for ByteToMessageCodec {
    fn channel_read(&mut self, ctx: &Context, msg: Message) -> Result<(), ChannelError> {
        let input = *msg
            .downcast::<ByteBuf>()
            .map_err(|_| ChannelError::protocol("frame decoder expects a byte stream"))?;
        let mut cum = match self.cumulation.take() {
            // Fast path: no backlog, decode straight out of the read buffer.
            None => input,
            Some(cum) => self.cumulate(ctx, cum, input)?,
        };

        loop {
            match self.decoder.decode(&mut cum) {
                Ok(Some(frame)) => {
                    ctx.fire_channel_read(frame);
                    if !cum.is_readable() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    // The stream is beyond recovery; drop the backlog.
                    return Err(err);
                }
            }
        }
        if cum.is_readable() {
            self.cumulation = Some(cum);
        }
        Ok(())
    }

    fn channel_inactive(&mut self, ctx: &Context) -> Result<(), ChannelError> {
        // Trailing bytes of a broken frame are released, not delivered.
        if let Some(cum) = self.cumulation.take() {
            if cum.is_readable() {
                log::debug!(
                    "discarding {} trailing byte(s) of an incomplete frame",
                    cum.readable_bytes()
                );
            }
        }
        ctx.fire_channel_inactive();
        Ok(())
    }
}

/// Which line terminators delimit a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminatorType {
    /// `\n` only.
    Lf,
    /// `\r\n` only.
    CrLf,
    /// Either `\n` or `\r\n`.
    Both,
}

/// Splits the stream on line terminators, producing one retained slice per
/// line (zero-copy framing).
pub struct LineBasedFrameDecoder {
    max_length: usize,
    strip_delimiter: bool,
    terminator: TerminatorType,
}

impl LineBasedFrameDecoder {
    /// `max_length` bounds the line body; longer lines are a protocol
    /// error. `strip_delimiter` controls whether the terminator stays in
    /// the frame.
    pub fn new(max_length: usize, strip_delimiter: bool, terminator: TerminatorType) -> Self {
        LineBasedFrameDecoder {
            max_length,
            strip_delimiter,
            terminator,
        }
    }

    /// Returns `(line_length, delimiter_length)` of the next complete
    /// line, if any.
    fn find_line(&self, haystack: &[u8]) -> Option<(usize, usize)> {
        match self.terminator {
            TerminatorType::Lf | TerminatorType::Both => {
                let pos = haystack.iter().position(|&b| b == b'\n')?;
                if self.terminator == TerminatorType::Both && pos > 0 && haystack[pos - 1] == b'\r'
                {
                    Some((pos - 1, 2))
                } else {
                    Some((pos, 1))
                }
            }
            TerminatorType::CrLf => haystack
                .windows(2)
                .position(|w| w == b"\r\n")
                .map(|pos| (pos, 2)),
        }
    }
}

impl MessageDecoder for LineBasedFrameDecoder {
    fn decode(&mut self, input: &mut ByteBuf) -> Result<Option<Message>, ChannelError> {
        let (line_len, delim_len) = match self.find_line(input.readable_slice()) {
            Some(found) => found,
            None => {
                if input.readable_bytes() > self.max_length {
                    return Err(ChannelError::Protocol(format!(
                        "line exceeds {} bytes without a terminator",
                        self.max_length
                    )));
                }
                return Ok(None);
            }
        };
        if line_len > self.max_length {
            return Err(ChannelError::Protocol(format!(
                "line of {} bytes exceeds the {} byte limit",
                line_len, self.max_length
            )));
        }
        let frame = if self.strip_delimiter {
            let frame = input.read_retained_slice(line_len);
            input.advance_read(delim_len);
            frame
        } else {
            input.read_retained_slice(line_len + delim_len)
        };
        Ok(Some(Box::new(frame)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use seine_buffer::{AllocatorConfig, PooledAllocator};

    fn alloc() -> PooledAllocator {
        PooledAllocator::new(
            AllocatorConfig::default()
                .page_size(4096)
                .max_order(4)
                .arena_count(1),
        )
    }

    fn buf(a: &PooledAllocator, bytes: &[u8]) -> ByteBuf {
        let mut b = a.allocate(bytes.len().max(1), bytes.len().max(64)).unwrap();
        b.write_bytes(bytes);
        b
    }

    fn frame_bytes(msg: Message) -> Vec<u8> {
        msg.downcast::<ByteBuf>().unwrap().readable_slice().to_vec()
    }

    #[test]
    fn decodes_lf_and_crlf_lines() {
        let a = alloc();
        let mut dec = LineBasedFrameDecoder::new(1024, true, TerminatorType::Both);
        let mut input = buf(&a, b"one\ntwo\r\nthree");

        let f1 = dec.decode(&mut input).unwrap().unwrap();
        assert_eq!(frame_bytes(f1), b"one");
        let f2 = dec.decode(&mut input).unwrap().unwrap();
        assert_eq!(frame_bytes(f2), b"two");
        assert!(dec.decode(&mut input).unwrap().is_none());
        assert_eq!(input.readable_slice(), b"three");
    }

    #[test]
    fn keeps_delimiter_when_asked() {
        let a = alloc();
        let mut dec = LineBasedFrameDecoder::new(1024, false, TerminatorType::Lf);
        let mut input = buf(&a, b"keep\n");
        let frame = dec.decode(&mut input).unwrap().unwrap();
        assert_eq!(frame_bytes(frame), b"keep\n");
    }

    #[test]
    fn oversized_line_is_a_protocol_error() {
        let a = alloc();
        let mut dec = LineBasedFrameDecoder::new(4, true, TerminatorType::Both);
        let mut input = buf(&a, b"way too long\n");
        assert!(matches!(
            dec.decode(&mut input),
            Err(ChannelError::Protocol(_))
        ));
    }

    #[test]
    fn unterminated_overflow_is_a_protocol_error() {
        let a = alloc();
        let mut dec = LineBasedFrameDecoder::new(4, true, TerminatorType::Both);
        let mut input = buf(&a, b"no newline here");
        assert!(matches!(
            dec.decode(&mut input),
            Err(ChannelError::Protocol(_))
        ));
    }
}
