//! Wire framing for SMFP, the simplest multiplexed framing protocol.
//!
//! Requests (client to server), all integers big-endian:
//! - 4-byte message length, counting every byte after itself (at least 5)
//! - 1-byte request code
//! - 4-byte client-chosen transaction ID
//! - argument bytes
//!
//! Responses (server to client):
//! - 4-byte signed status: payload length when non-negative, error code when negative
//! - 4-byte transaction ID
//! - payload bytes, only for non-negative status
//!
//! The parser here is pure: it never performs I/O and never holds state
//! between calls, so it can be re-run against a growing buffer.

pub mod codec;
pub mod error;
pub mod error_code;
pub mod reader;
pub mod writer;

pub use codec::{
    decode_request, decode_response, encode_error_response, encode_request, encode_response,
    parse_request, parse_request_with_limit, ParsedRequest, RequestFrame, Response, ResponseBody,
    MAX_MESSAGE_LENGTH, MIN_MESSAGE_LENGTH, REQUEST_HEADER_SIZE, RESPONSE_HEADER_SIZE,
};
pub use error::{FrameError, Result};
pub use error_code::{error_name, is_smfp_error, CONNECTION_FAILED, UNKNOWN_REQUEST_CODE};
pub use reader::{ResponseReader, DEFAULT_MAX_RESPONSE_PAYLOAD};
pub use writer::RequestWriter;
