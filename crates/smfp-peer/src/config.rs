use std::time::Duration;

use smfp_frame::{DEFAULT_MAX_RESPONSE_PAYLOAD, MAX_MESSAGE_LENGTH};
use smfp_transport::ConnectRetry;

const DEFAULT_READ_CHUNK_SIZE: usize = 8 * 1024;

/// What a connection does with its input after a malformed message length.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FramingErrorPolicy {
    /// Drop everything buffered and keep the connection open.
    ///
    /// Valid requests already buffered behind the bad one are lost too.
    #[default]
    DiscardBuffer,
    /// Drop everything buffered and close the connection.
    CloseConnection,
}

/// Server-side connection behavior.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Reaction to an out-of-range request length.
    pub framing_error_policy: FramingErrorPolicy,
    /// Bytes requested from the socket per read.
    pub read_chunk_size: usize,
    /// Largest accepted request message length. Default: 10 MiB.
    pub max_message_length: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            framing_error_policy: FramingErrorPolicy::default(),
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            max_message_length: MAX_MESSAGE_LENGTH,
        }
    }
}

/// Client connection behavior.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Retries while the server socket is missing or refusing connections.
    pub connect_retry: ConnectRetry,
    /// How long to wait for each response. `None` waits indefinitely.
    pub response_timeout: Option<Duration>,
    /// Largest response payload accepted from the server.
    pub max_response_payload: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_retry: ConnectRetry::default(),
            response_timeout: None,
            max_response_payload: DEFAULT_MAX_RESPONSE_PAYLOAD,
        }
    }
}
