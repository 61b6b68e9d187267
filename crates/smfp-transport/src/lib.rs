//! Unix domain socket transport for SMFP.
//!
//! SMFP runs over a stream-oriented local socket addressed by a filesystem
//! path. This crate owns the socket-file lifecycle around that:
//! - path length validation against `sockaddr_un`
//! - stale socket removal before binding (never removing non-socket files)
//! - restrictive permissions on the created socket
//! - cleanup of the socket file on drop, only if it is still ours
//!
//! The blocking [`UnixDomainSocket`] is always available. The tokio-based
//! [`AsyncUnixSocket`] used by the server lives behind the `async` feature.

pub mod error;

#[cfg(unix)]
pub mod uds;

pub use error::{Result, TransportError};

#[cfg(unix)]
pub use uds::{ConnectRetry, UnixDomainSocket};

#[cfg(all(unix, feature = "async"))]
pub use uds::AsyncUnixSocket;
