use smfp_frame::error_code::CONNECTION_FAILED;

/// Errors that can occur in server and client operations.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] smfp_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] smfp_frame::FrameError),

    /// Unrecoverable I/O error on a connection.
    #[error("connection I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was lost before the transaction completed.
    #[error("connection failed")]
    ConnectionFailed,

    /// The server answered with an error response.
    #[error("remote error {0} ({name})", name = remote_name(.0))]
    Remote(i32),

    /// No response arrived in time.
    #[error("response timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// A connection task panicked or was cancelled.
    #[error("connection task failed: {0}")]
    ConnectionTask(#[from] tokio::task::JoinError),
}

impl PeerError {
    /// The negative status code a client reports for this error, if any.
    pub fn status_code(&self) -> Option<i32> {
        match self {
            Self::ConnectionFailed => Some(CONNECTION_FAILED),
            Self::Remote(code) => Some(*code),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, PeerError>;

fn remote_name(code: &i32) -> &'static str {
    smfp_frame::error_name(*code)
}

/// Errors returned by [`Transaction`](crate::Transaction) response operations.
#[derive(Debug, thiserror::Error)]
pub enum TransactionError {
    /// The transaction had already been completed.
    ///
    /// The response was still written; the caller has broken the
    /// one-terminal-response contract and bookkeeping may now be off.
    #[error("transaction {transaction_id} marked completed more than once")]
    AlreadyCompleted { transaction_id: u32 },

    /// The response could not be encoded; nothing was written.
    #[error("response encoding failed: {0}")]
    Encode(#[from] smfp_frame::FrameError),
}

impl TransactionError {
    /// Whether the response still went out despite the error.
    pub fn was_sent(&self) -> bool {
        matches!(self, Self::AlreadyCompleted { .. })
    }
}
