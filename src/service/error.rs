pub type TransportResult<T> = Result<T, TransportError>;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// A write would push the frame body past the 16-bit length prefix.
    #[error("frame too large: {0} bytes exceeds the 65535 byte limit")]
    FrameTooLarge(usize),

    #[error("out of range: requested {requested} bytes, {remaining} remaining")]
    OutOfRange { requested: usize, remaining: usize },

    #[error("string too long: {0} bytes")]
    StringTooLong(usize),

    #[error("malformed string: {0}")]
    MalformedString(#[from] std::string::FromUtf8Error),

    /// The server answered the connect handshake with the rejection byte.
    #[error("connection rejected by server")]
    ConnectionRejected,

    #[error("connect timed out")]
    ConnectTimeout,

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config file error: {0}")]
    ConfigFile(#[from] config::ConfigError),
}
