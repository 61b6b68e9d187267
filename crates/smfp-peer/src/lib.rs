//! Transaction multiplexing over SMFP connections.
//!
//! The server side turns each accepted connection's byte stream into
//! [`Transaction`]s handed to a [`RequestHandler`], which may answer them
//! later and in any order. The client side issues concurrent requests over a
//! single connection and routes responses back by transaction ID.

pub mod client;
pub mod config;
pub mod error;
pub mod handler;
pub mod multiplexer;
pub mod server;
pub mod transaction;

pub use client::{Client, PendingTransaction};
pub use config::{ClientConfig, FramingErrorPolicy, ServerConfig};
pub use error::{PeerError, Result, TransactionError};
pub use handler::RequestHandler;
pub use multiplexer::{Multiplexer, ReceiveOutcome};
pub use server::Server;
pub use transaction::Transaction;
