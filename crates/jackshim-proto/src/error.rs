#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unexpected message size: expected {expected}, got {got}")]
    UnexpectedSize { expected: usize, got: usize },

    #[error("unexpected number of file descriptors: expected {expected}, got {got}")]
    UnexpectedFdCount { expected: usize, got: usize },

    #[error("unknown pool id {0}")]
    UnknownPool(u32),

    #[error("unknown mem id {0}")]
    UnknownMem(u32),

    #[error("format negotiation failed: {0}")]
    FormatMismatch(String),

    #[error("port {0} has no mix {1}")]
    UnknownMix(u32, u32),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
