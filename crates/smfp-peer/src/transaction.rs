use std::fmt;

use bytes::{Bytes, BytesMut};
use smfp_frame::{encode_error_response, encode_response};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::TransactionError;

/// An encoded response on its way to the connection that owns the transaction.
#[derive(Debug)]
pub(crate) struct PendingWrite {
    pub(crate) transaction_id: u32,
    /// Identifies the table entry this response belongs to, so a response on a
    /// superseded transaction never completes its same-ID replacement.
    pub(crate) serial: u64,
    pub(crate) bytes: Bytes,
    pub(crate) completes: bool,
}

pub(crate) type ResponseSink = mpsc::UnboundedSender<PendingWrite>;

/// One request/response exchange, handed to the request handler.
///
/// A transaction is **open** until `respond(.., true)` or `respond_err` is
/// called, then **completed** for good. Responding again after that is
/// reported as [`TransactionError::AlreadyCompleted`] but still written.
///
/// Writes never block: they are queued to the owning connection, which
/// writes them in the order they were queued.
pub struct Transaction {
    connection_id: u64,
    code: u8,
    transaction_id: u32,
    arg: Bytes,
    serial: u64,
    completed: bool,
    sink: ResponseSink,
    cancel: CancellationToken,
}

impl Transaction {
    pub(crate) fn new(
        connection_id: u64,
        code: u8,
        transaction_id: u32,
        arg: Bytes,
        serial: u64,
        sink: ResponseSink,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            connection_id,
            code,
            transaction_id,
            arg,
            serial,
            completed: false,
            sink,
            cancel,
        }
    }

    /// Application-defined request code.
    pub fn code(&self) -> u8 {
        self.code
    }

    /// Client-chosen transaction ID.
    pub fn transaction_id(&self) -> u32 {
        self.transaction_id
    }

    /// Request argument bytes.
    pub fn arg(&self) -> &Bytes {
        &self.arg
    }

    /// Server-assigned ID of the connection this request arrived on.
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// Whether a terminal response has been sent.
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Send a success response carrying `payload`.
    ///
    /// Call with `completed = false` any number of times to stream partial
    /// responses, then once with `completed = true`.
    pub fn respond(
        &mut self,
        payload: impl AsRef<[u8]>,
        completed: bool,
    ) -> Result<(), TransactionError> {
        let payload = payload.as_ref();
        let mut buf = BytesMut::new();
        encode_response(self.transaction_id, payload, &mut buf)?;
        self.send(buf.freeze(), completed)
    }

    /// Send a UTF-8 string as a success response.
    pub fn respond_str(&mut self, payload: &str, completed: bool) -> Result<(), TransactionError> {
        self.respond(payload.as_bytes(), completed)
    }

    /// Send an error response and complete the transaction.
    ///
    /// `code` must be negative.
    pub fn respond_err(&mut self, code: i32) -> Result<(), TransactionError> {
        let mut buf = BytesMut::new();
        encode_error_response(self.transaction_id, code, &mut buf)?;
        self.send(buf.freeze(), true)
    }

    /// Whether the client connection has gone away.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the client connection has gone away.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// A token cancelled when the client connection goes away.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn send(&mut self, bytes: Bytes, completes: bool) -> Result<(), TransactionError> {
        let already_completed = self.completed;
        if already_completed {
            warn!(
                connection_id = self.connection_id,
                transaction_id = self.transaction_id,
                "transaction marked completed more than once"
            );
        }
        self.completed |= completes;

        let write = PendingWrite {
            transaction_id: self.transaction_id,
            serial: self.serial,
            bytes,
            completes,
        };
        if self.sink.send(write).is_err() {
            // Same outcome as a broken pipe: the client is gone.
            debug!(
                connection_id = self.connection_id,
                transaction_id = self.transaction_id,
                "connection closed; dropping response"
            );
        }

        if already_completed {
            return Err(TransactionError::AlreadyCompleted {
                transaction_id: self.transaction_id,
            });
        }
        Ok(())
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("connection_id", &self.connection_id)
            .field("code", &self.code)
            .field("transaction_id", &self.transaction_id)
            .field("arg_len", &self.arg.len())
            .field("completed", &self.completed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use smfp_frame::{decode_response, ResponseBody, UNKNOWN_REQUEST_CODE};

    use super::*;

    fn transaction(transaction_id: u32) -> (Transaction, mpsc::UnboundedReceiver<PendingWrite>) {
        let (sink, rx) = mpsc::unbounded_channel();
        let tx = Transaction::new(
            0,
            0x42,
            transaction_id,
            Bytes::from_static(b"hello smfp"),
            1,
            sink,
            CancellationToken::new(),
        );
        (tx, rx)
    }

    fn decode(write: &PendingWrite) -> smfp_frame::Response {
        let mut buf = BytesMut::from(write.bytes.as_ref());
        let response = decode_response(&mut buf, usize::MAX).unwrap().unwrap();
        assert!(buf.is_empty());
        response
    }

    #[test]
    fn respond_encodes_success_frame() {
        let (mut tx, mut rx) = transaction(0x3344_5566);
        tx.respond_str("HELLO SMFP", true).unwrap();
        assert!(tx.is_completed());

        let write = rx.try_recv().unwrap();
        assert!(write.completes);
        assert_eq!(write.transaction_id, 0x3344_5566);

        let response = decode(&write);
        assert_eq!(response.transaction_id, 0x3344_5566);
        assert_eq!(response.status(), 10);
        assert_eq!(
            response.body,
            ResponseBody::Data(Bytes::from_static(b"HELLO SMFP"))
        );
    }

    #[test]
    fn streamed_responses_complete_on_last() {
        let (mut tx, mut rx) = transaction(7);
        tx.respond(b"part-1", false).unwrap();
        assert!(!tx.is_completed());
        tx.respond(b"part-2", false).unwrap();
        tx.respond(b"", true).unwrap();
        assert!(tx.is_completed());

        let writes: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(writes.len(), 3);
        assert_eq!(
            writes.iter().map(|w| w.completes).collect::<Vec<_>>(),
            vec![false, false, true]
        );
        assert_eq!(decode(&writes[2]).status(), 0);
    }

    #[test]
    fn respond_err_completes() {
        let (mut tx, mut rx) = transaction(9);
        tx.respond_err(UNKNOWN_REQUEST_CODE).unwrap();
        assert!(tx.is_completed());

        let write = rx.try_recv().unwrap();
        assert!(write.completes);
        assert_eq!(write.bytes.len(), smfp_frame::RESPONSE_HEADER_SIZE);
        assert_eq!(decode(&write).body, ResponseBody::Error(-200));
    }

    #[test]
    fn respond_err_after_partial_responses() {
        let (mut tx, mut rx) = transaction(9);
        tx.respond(b"partial", false).unwrap();
        tx.respond_err(-5).unwrap();
        assert!(tx.is_completed());
        assert_eq!(std::iter::from_fn(|| rx.try_recv().ok()).count(), 2);
    }

    #[test]
    fn responding_twice_is_reported_but_still_written() {
        let (mut tx, mut rx) = transaction(3);
        tx.respond(b"done", true).unwrap();

        let err = tx.respond(b"again", true).unwrap_err();
        assert!(matches!(
            err,
            TransactionError::AlreadyCompleted { transaction_id: 3 }
        ));
        assert!(err.was_sent());

        let err = tx.respond_err(-1).unwrap_err();
        assert!(err.was_sent());

        assert_eq!(std::iter::from_fn(|| rx.try_recv().ok()).count(), 3);
        assert!(tx.is_completed());
    }

    #[test]
    fn completed_is_terminal() {
        let (mut tx, _rx) = transaction(3);
        tx.respond(b"done", true).unwrap();
        let _ = tx.respond(b"late", false);
        assert!(tx.is_completed());
    }

    #[test]
    fn non_negative_error_code_is_rejected_without_writing() {
        let (mut tx, mut rx) = transaction(4);
        let err = tx.respond_err(0).unwrap_err();
        assert!(matches!(
            err,
            TransactionError::Encode(smfp_frame::FrameError::InvalidErrorCode(0))
        ));
        assert!(!err.was_sent());
        assert!(!tx.is_completed());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn responding_after_connection_closed_is_silent() {
        let (mut tx, rx) = transaction(5);
        drop(rx);
        tx.respond(b"nobody listening", true).unwrap();
        assert!(tx.is_completed());
    }

    #[test]
    fn accessors() {
        let (tx, _rx) = transaction(6);
        assert_eq!(tx.code(), 0x42);
        assert_eq!(tx.transaction_id(), 6);
        assert_eq!(tx.arg().as_ref(), b"hello smfp");
        assert_eq!(tx.connection_id(), 0);
        assert!(!tx.is_cancelled());
        assert!(format!("{tx:?}").contains("arg_len: 10"));
    }
}
