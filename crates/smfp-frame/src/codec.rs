use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};

/// Request header: length (4) + code (1) + transaction ID (4) = 9 bytes.
pub const REQUEST_HEADER_SIZE: usize = 9;

/// Response header: status (4) + transaction ID (4) = 8 bytes.
pub const RESPONSE_HEADER_SIZE: usize = 8;

/// Size of the request length field itself.
const LENGTH_FIELD_SIZE: usize = 4;

/// Smallest valid request message length: code + transaction ID.
pub const MIN_MESSAGE_LENGTH: u32 = 5;

/// Largest accepted request message length: 10 MiB.
pub const MAX_MESSAGE_LENGTH: u32 = 10 * 1024 * 1024;

/// Largest payload a success response can announce.
const MAX_RESPONSE_PAYLOAD: usize = i32::MAX as usize;

/// One request as it arrived on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFrame {
    /// Application-defined request type.
    pub code: u8,
    /// Client-chosen ID, unique among the connection's open transactions.
    pub transaction_id: u32,
    /// Argument bytes following the header.
    pub arg: Bytes,
}

impl RequestFrame {
    /// Create a new request frame.
    pub fn new(code: u8, transaction_id: u32, arg: impl Into<Bytes>) -> Self {
        Self {
            code,
            transaction_id,
            arg: arg.into(),
        }
    }

    /// The total wire size of this frame (length field included).
    pub fn wire_size(&self) -> usize {
        REQUEST_HEADER_SIZE + self.arg.len()
    }
}

/// A request extracted from the front of a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRequest {
    pub frame: RequestFrame,
    /// Bytes the caller should discard from the front of its buffer.
    pub total_len: usize,
}

/// Try to extract one request from the front of `buf`.
///
/// - `Ok(None)`: not enough bytes yet, nothing consumed.
/// - `Err(FrameError::InvalidMessageLength)`: the declared length is out of
///   range; nothing after it can be trusted.
/// - `Ok(Some(_))`: a complete request plus its wire length.
///
/// Only the frame's own bytes are touched, whatever else is buffered behind it.
pub fn parse_request(buf: &[u8]) -> Result<Option<ParsedRequest>> {
    parse_request_with_limit(buf, MAX_MESSAGE_LENGTH)
}

/// [`parse_request`] with an explicit upper bound on the message length.
pub fn parse_request_with_limit(buf: &[u8], max_message_length: u32) -> Result<Option<ParsedRequest>> {
    let Some(total_len) = complete_request_len(buf, max_message_length)? else {
        return Ok(None);
    };

    let frame = RequestFrame {
        code: buf[LENGTH_FIELD_SIZE],
        transaction_id: read_u32_be(&buf[5..REQUEST_HEADER_SIZE]),
        arg: Bytes::copy_from_slice(&buf[REQUEST_HEADER_SIZE..total_len]),
    };
    Ok(Some(ParsedRequest { frame, total_len }))
}

/// Decode one request from a buffer, consuming its bytes on success.
///
/// Same outcomes as [`parse_request`], but the argument is split off the
/// buffer instead of copied.
pub fn decode_request(src: &mut BytesMut, max_message_length: u32) -> Result<Option<RequestFrame>> {
    let Some(total_len) = complete_request_len(src, max_message_length)? else {
        return Ok(None);
    };

    let mut frame_bytes = src.split_to(total_len);
    frame_bytes.advance(LENGTH_FIELD_SIZE);
    let code = frame_bytes.get_u8();
    let transaction_id = frame_bytes.get_u32();
    Ok(Some(RequestFrame {
        code,
        transaction_id,
        arg: frame_bytes.freeze(),
    }))
}

/// Wire length of the request at the front of `buf`, once it is fully buffered.
fn complete_request_len(buf: &[u8], max_message_length: u32) -> Result<Option<usize>> {
    if buf.len() < REQUEST_HEADER_SIZE {
        return Ok(None);
    }

    let message_len = read_u32_be(&buf[..LENGTH_FIELD_SIZE]);
    if !(MIN_MESSAGE_LENGTH..=max_message_length).contains(&message_len) {
        return Err(FrameError::InvalidMessageLength(message_len));
    }

    let total_len = LENGTH_FIELD_SIZE + message_len as usize;
    if buf.len() < total_len {
        return Ok(None);
    }
    Ok(Some(total_len))
}

/// Encode a request into the wire format.
///
/// Wire format:
/// ```text
/// ┌──────────────┬──────────┬──────────────┬──────────────────┐
/// │ Length (4B)  │ Code     │ Transaction  │ Argument         │
/// │ BE, >= 5     │ (1B)     │ ID (4B BE)   │ (Length-5 bytes) │
/// └──────────────┴──────────┴──────────────┴──────────────────┘
/// ```
pub fn encode_request(code: u8, transaction_id: u32, arg: &[u8], dst: &mut BytesMut) -> Result<()> {
    let max_arg = (MAX_MESSAGE_LENGTH - MIN_MESSAGE_LENGTH) as usize;
    if arg.len() > max_arg {
        return Err(FrameError::PayloadTooLarge {
            size: arg.len(),
            max: max_arg,
        });
    }
    dst.reserve(REQUEST_HEADER_SIZE + arg.len());
    dst.put_u32(MIN_MESSAGE_LENGTH + arg.len() as u32);
    dst.put_u8(code);
    dst.put_u32(transaction_id);
    dst.put_slice(arg);
    Ok(())
}

/// The body of a response frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseBody {
    /// Success payload (possibly one chunk of a streamed response).
    Data(Bytes),
    /// Negative error code; no payload follows on the wire.
    Error(i32),
}

/// One response as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub transaction_id: u32,
    pub body: ResponseBody,
}

impl Response {
    /// The signed status field: payload length or error code.
    pub fn status(&self) -> i32 {
        match &self.body {
            ResponseBody::Data(payload) => payload.len() as i32,
            ResponseBody::Error(code) => *code,
        }
    }

    /// The total wire size of this frame.
    pub fn wire_size(&self) -> usize {
        match &self.body {
            ResponseBody::Data(payload) => RESPONSE_HEADER_SIZE + payload.len(),
            ResponseBody::Error(_) => RESPONSE_HEADER_SIZE,
        }
    }
}

/// Encode a success response carrying `payload`.
///
/// Wire format:
/// ```text
/// ┌──────────────┬──────────────┬─────────────────────┐
/// │ Status (4B)  │ Transaction  │ Payload             │
/// │ BE signed    │ ID (4B BE)   │ (Status bytes)      │
/// └──────────────┴──────────────┴─────────────────────┘
/// ```
pub fn encode_response(transaction_id: u32, payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    if payload.len() > MAX_RESPONSE_PAYLOAD {
        return Err(FrameError::PayloadTooLarge {
            size: payload.len(),
            max: MAX_RESPONSE_PAYLOAD,
        });
    }
    dst.reserve(RESPONSE_HEADER_SIZE + payload.len());
    dst.put_i32(payload.len() as i32);
    dst.put_u32(transaction_id);
    dst.put_slice(payload);
    Ok(())
}

/// Encode an error response: header only, status set to the negative `code`.
pub fn encode_error_response(transaction_id: u32, code: i32, dst: &mut BytesMut) -> Result<()> {
    if code >= 0 {
        return Err(FrameError::InvalidErrorCode(code));
    }
    dst.reserve(RESPONSE_HEADER_SIZE);
    dst.put_i32(code);
    dst.put_u32(transaction_id);
    Ok(())
}

/// Decode one response from a buffer, consuming its bytes on success.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
pub fn decode_response(src: &mut BytesMut, max_payload: usize) -> Result<Option<Response>> {
    if src.len() < RESPONSE_HEADER_SIZE {
        return Ok(None);
    }

    let status = read_u32_be(&src[..4]) as i32;
    let transaction_id = read_u32_be(&src[4..RESPONSE_HEADER_SIZE]);

    if status < 0 {
        src.advance(RESPONSE_HEADER_SIZE);
        return Ok(Some(Response {
            transaction_id,
            body: ResponseBody::Error(status),
        }));
    }

    let payload_len = status as usize;
    if payload_len > max_payload {
        return Err(FrameError::PayloadTooLarge {
            size: payload_len,
            max: max_payload,
        });
    }
    if src.len() < RESPONSE_HEADER_SIZE + payload_len {
        return Ok(None);
    }

    src.advance(RESPONSE_HEADER_SIZE);
    let payload = src.split_to(payload_len).freeze();
    Ok(Some(Response {
        transaction_id,
        body: ResponseBody::Data(payload),
    }))
}

fn read_u32_be(bytes: &[u8]) -> u32 {
    let mut field = [0u8; 4];
    field.copy_from_slice(&bytes[..4]);
    u32::from_be_bytes(field)
}
