pub type StreamResult<T> = Result<T, StreamError>;

#[derive(thiserror::Error, Debug)]
pub enum StreamError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("encode error: {0}")]
    Encode(String),

    #[error("shared memory error: {0}")]
    Shm(String),

    #[error("producer process died: {0}")]
    ProducerDeath(String),

    #[error("allocation failure: {0}")]
    Allocation(String),

    #[error("pipeline closed")]
    Closed,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StreamError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    pub fn encode(msg: impl Into<String>) -> Self {
        Self::Encode(msg.into())
    }

    pub fn shm(msg: impl Into<String>) -> Self {
        Self::Shm(msg.into())
    }

    pub fn producer_death(msg: impl Into<String>) -> Self {
        Self::ProducerDeath(msg.into())
    }

    pub fn allocation(msg: impl Into<String>) -> Self {
        Self::Allocation(msg.into())
    }

    /// Terminal errors end the affected pipeline; everything else is absorbed and counted.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::ProducerDeath(_) | Self::Allocation(_) | Self::Closed
        )
    }
}

impl From<std::io::Error> for StreamError {
    fn from(e: std::io::Error) -> Self {
        Self::Other(anyhow::Error::new(e))
    }
}
