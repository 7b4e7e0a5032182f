//! # Seine Codec - Framing and Message Codecs
//!
//! `seine-codec` provides the codec envelope of the seine framework: the
//! pieces that turn a raw byte stream into framed messages and typed
//! values, expressed as ordinary pipeline [`Handler`](seine::Handler)s.
//!
//! - [`MessageDecoder`] / [`ByteToMessageCodec`]: cumulate read bursts and
//!   carve frames
//! - [`LineBasedFrameDecoder`]: split on `\n` / `\r\n` (zero-copy retained
//!   slices)
//! - [`StringCodec`]: UTF-8 frames ⇄ `String` messages
//!
//! ## Building a text pipeline
//!
//! ```rust,no_run
//! use seine::Pipeline;
//! use seine_codec::{ByteToMessageCodec, LineBasedFrameDecoder, StringCodec, TerminatorType};
//! # fn install(pipeline: &Pipeline) -> std::io::Result<()> {
//! pipeline.add_last(
//!     "framer",
//!     ByteToMessageCodec::new(Box::new(LineBasedFrameDecoder::new(
//!         8192,
//!         true,
//!         TerminatorType::Both,
//!     ))),
//! )?;
//! pipeline.add_last("strings", StringCodec::new())?;
//! // pipeline.add_last("app", your_handler)?;
//! # Ok(())
//! # }
//! ```
//!
//! A decoder failure (`ChannelError::Protocol`) travels inbound as
//! `exception_caught` and normally terminates the channel.

#![warn(rust_2018_idioms)]
#![warn(missing_docs)]

mod byte_to_message_decoder;
mod string_codec;

pub use byte_to_message_decoder::{
    ByteToMessageCodec, LineBasedFrameDecoder, MessageDecoder, TerminatorType,
};
pub use string_codec::StringCodec;
