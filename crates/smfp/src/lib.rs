//! Simplest multiplexed framing protocol (SMFP) over Unix domain sockets.
//!
//! A client sends length-prefixed request frames tagged with a transaction
//! ID; the server may answer them in any order, with one or more response
//! frames each.
//!
//! # Crate Structure
//!
//! - [`transport`]: Unix domain socket binding and connecting
//! - [`frame`]: request and response wire codec
//! - [`peer`]: multiplexing server and client (behind `peer` feature)

/// Re-export transport types.
pub mod transport {
    pub use smfp_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use smfp_frame::*;
}

/// Re-export server and client types (requires `peer` feature).
#[cfg(feature = "peer")]
pub mod peer {
    pub use smfp_peer::*;
}
