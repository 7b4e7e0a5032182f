use std::sync::Arc;

use seine_buffer::AllocError;
use thiserror::Error;

/// The error vocabulary shared by channels, pipelines and promises.
///
/// Every variant is cheap to clone so one failure can both fail an
/// operation's promise and travel the inbound chain as an
/// `exception_caught` event.
#[derive(Debug, Clone, Error)]
pub enum ChannelError {
    /// Operation attempted on a channel that already closed. Never retried.
    #[error("channel is closed")]
    Closed,

    /// I/O attempted before the channel was registered with an event loop.
    #[error("channel is not registered with an event loop")]
    NotRegistered,

    /// The pooled allocator could not serve a request.
    #[error("allocation failed: {0}")]
    Allocation(#[from] AllocError),

    /// A codec or handler rejected the byte stream. Usually terminal for
    /// the channel.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The underlying transport reported an I/O error.
    #[error("transport error: {0}")]
    Transport(Arc<std::io::Error>),

    /// A submitted task was cancelled before it ran. Silent: this variant
    /// never propagates through a pipeline.
    #[error("task was cancelled")]
    Cancelled,
}

impl ChannelError {
    /// Convenience constructor for codec failures.
    pub fn protocol(message: impl Into<String>) -> Self {
        ChannelError::Protocol(message.into())
    }

    /// True for errors that indicate the channel cannot continue.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ChannelError::Closed | ChannelError::Transport(_) | ChannelError::Protocol(_)
        )
    }
}

impl From<std::io::Error> for ChannelError {
    fn from(err: std::io::Error) -> Self {
        ChannelError::Transport(Arc::new(err))
    }
}
