/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// A request declared a message length outside `5..=limit`.
    ///
    /// The whole unparsed buffer is unusable after this: there is no way to
    /// find the start of the next frame.
    #[error("invalid message length {0}")]
    InvalidMessageLength(u32),

    /// A payload does not fit the wire format or the configured maximum.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// An error response was built with a non-negative code.
    #[error("error code {0} is not negative")]
    InvalidErrorCode(i32),

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed before a complete frame was received.
    #[error("connection closed (incomplete frame)")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, FrameError>;
