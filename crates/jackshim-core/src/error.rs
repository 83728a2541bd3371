use jackshim_proto::ProtocolError;

/// Errors surfaced across `jackshim-core`'s public methods. Never crosses
/// the C ABI directly — `jackshim-capi` translates this into the legacy
/// status bitfield.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("PIPEWIRE_NOJACK is set")]
    NoJack,

    #[error(transparent)]
    Config(#[from] jackshim_conf::ConfigError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Buffer(#[from] crate::bufmgr::BufferError),

    #[error("operation not supported")]
    NotSupported,

    #[error("client is active; cannot change callbacks")]
    ActiveClient,

    #[error("object not found")]
    NotFound,

    #[error("connection to the server was lost")]
    ConnectionLost,

    #[error(transparent)]
    Timebase(#[from] crate::transport::TimebaseError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Map to the legacy API's errno-ish status code, used both by
    /// `jackshim-capi` and by tests asserting on the scenarios in §8.
    pub fn as_status(&self) -> i32 {
        match self {
            CoreError::NoJack => libc::EIO,
            CoreError::Config(_) => libc::EINVAL,
            CoreError::Protocol(_) => libc::EINVAL,
            CoreError::Buffer(_) => libc::ENOMEM,
            CoreError::NotSupported => libc::ENOTSUP,
            CoreError::ActiveClient => libc::EIO,
            CoreError::NotFound => libc::ENOENT,
            CoreError::ConnectionLost => libc::EIO,
            CoreError::Timebase(_) => libc::EBUSY,
            CoreError::Io(_) => libc::EIO,
        }
    }
}
