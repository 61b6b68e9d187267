//! Per-connection request parsing and transaction bookkeeping.
//!
//! A [`Multiplexer`] owns one connection's receive buffer and its table of
//! open transactions. It does no I/O on its own: the connection task feeds
//! it received chunks and asks it to write queued responses, which keeps the
//! parse loop and the bookkeeping testable without sockets.

use std::collections::HashMap;
use std::io::ErrorKind;

use bytes::BytesMut;
use smfp_frame::{decode_request, RequestFrame};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{FramingErrorPolicy, ServerConfig};
use crate::error::{PeerError, Result};
use crate::handler::RequestHandler;
use crate::transaction::{PendingWrite, ResponseSink, Transaction};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;

/// What the connection should do after a chunk has been processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Keep reading.
    Continue,
    /// Close the connection (framing error under
    /// [`FramingErrorPolicy::CloseConnection`]).
    Close,
}

/// Table entry for a transaction still waiting for its terminal response.
#[derive(Debug)]
struct OpenTransaction {
    serial: u64,
    code: u8,
    cancel: CancellationToken,
}

/// One connection's parser state and open-transaction table.
pub struct Multiplexer {
    connection_id: u64,
    buf: BytesMut,
    transactions: HashMap<u32, OpenTransaction>,
    next_serial: u64,
    sink: ResponseSink,
    config: ServerConfig,
}

impl Multiplexer {
    pub(crate) fn new(connection_id: u64, sink: ResponseSink, config: ServerConfig) -> Self {
        Self {
            connection_id,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            transactions: HashMap::new(),
            next_serial: 0,
            sink,
            config,
        }
    }

    /// Append a received chunk and dispatch every request now complete.
    ///
    /// Requests are dispatched in arrival order, each to `handler`, before
    /// this returns. The handler does not have to respond first.
    pub fn receive<H>(&mut self, chunk: &[u8], handler: &H) -> ReceiveOutcome
    where
        H: RequestHandler + ?Sized,
    {
        self.buf.extend_from_slice(chunk);
        loop {
            match decode_request(&mut self.buf, self.config.max_message_length) {
                Ok(Some(frame)) => self.dispatch(frame, handler),
                Ok(None) => return ReceiveOutcome::Continue,
                Err(err) => {
                    warn!(
                        connection_id = self.connection_id,
                        error = %err,
                        discarded = self.buf.len(),
                        "framing error; discarding buffered input"
                    );
                    self.buf.clear();
                    return match self.config.framing_error_policy {
                        FramingErrorPolicy::DiscardBuffer => ReceiveOutcome::Continue,
                        FramingErrorPolicy::CloseConnection => ReceiveOutcome::Close,
                    };
                }
            }
        }
    }

    fn dispatch<H>(&mut self, frame: RequestFrame, handler: &H)
    where
        H: RequestHandler + ?Sized,
    {
        let serial = self.next_serial;
        self.next_serial += 1;
        let cancel = CancellationToken::new();

        let entry = OpenTransaction {
            serial,
            code: frame.code,
            cancel: cancel.clone(),
        };
        if let Some(previous) = self.transactions.insert(frame.transaction_id, entry) {
            debug!(
                connection_id = self.connection_id,
                transaction_id = frame.transaction_id,
                previous_code = previous.code,
                "transaction ID reused while still open; replacing"
            );
        }

        debug!(
            connection_id = self.connection_id,
            transaction_id = frame.transaction_id,
            code = frame.code,
            arg_len = frame.arg.len(),
            "dispatching request"
        );
        handler.handle(Transaction::new(
            self.connection_id,
            frame.code,
            frame.transaction_id,
            frame.arg,
            serial,
            self.sink.clone(),
            cancel,
        ));
    }

    /// Write one queued response to `io` and update the table.
    ///
    /// A broken pipe means the client is gone: the error is swallowed and the
    /// write settles as if it had succeeded. Any other write error is
    /// returned and should end the connection.
    pub(crate) async fn write<W>(&mut self, io: &mut W, write: PendingWrite) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let result = io.write_all(&write.bytes).await;
        self.settle(&write, result)
    }

    fn settle(&mut self, write: &PendingWrite, result: std::io::Result<()>) -> Result<()> {
        match result {
            Ok(()) => {
                if write.completes {
                    self.complete(write.transaction_id, write.serial);
                }
                Ok(())
            }
            Err(err) if is_peer_gone(&err) => {
                warn!(
                    connection_id = self.connection_id,
                    transaction_id = write.transaction_id,
                    error = %err,
                    "ignoring write error (client probably crashed)"
                );
                if write.completes {
                    self.complete(write.transaction_id, write.serial);
                }
                Ok(())
            }
            Err(err) => Err(PeerError::Io(err)),
        }
    }

    fn complete(&mut self, transaction_id: u32, serial: u64) {
        match self.transactions.get(&transaction_id) {
            Some(open) if open.serial == serial => {
                self.transactions.remove(&transaction_id);
                debug!(
                    connection_id = self.connection_id,
                    transaction_id, "transaction completed"
                );
            }
            _ => debug!(
                connection_id = self.connection_id,
                transaction_id, "completed transaction no longer registered"
            ),
        }
    }

    /// Cancel every transaction still open and forget them.
    pub(crate) fn teardown(&mut self) {
        if !self.transactions.is_empty() {
            info!(
                connection_id = self.connection_id,
                open = self.transactions.len(),
                "cancelling open transactions"
            );
        }
        for (_, open) in self.transactions.drain() {
            open.cancel.cancel();
        }
        self.buf.clear();
    }

    /// Server-assigned connection ID.
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// Number of transactions waiting for a terminal response.
    pub fn open_transactions(&self) -> usize {
        self.transactions.len()
    }

    /// Whether `transaction_id` is currently open.
    pub fn is_open(&self, transaction_id: u32) -> bool {
        self.transactions.contains_key(&transaction_id)
    }

    /// Bytes received but not yet parsed into a request.
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }
}

fn is_peer_gone(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::BrokenPipe | ErrorKind::ConnectionReset
    )
}

/// Drive one accepted connection until the client disconnects.
///
/// Reads and queued response writes share this single task, so the buffer
/// and the transaction table are never touched concurrently.
pub(crate) async fn serve_connection<S, H>(
    stream: S,
    connection_id: u64,
    handler: &H,
    config: ServerConfig,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    H: RequestHandler + ?Sized,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let (sink, mut outbound) = mpsc::unbounded_channel::<PendingWrite>();
    let mut chunk = vec![0u8; config.read_chunk_size.max(1)];
    let mut mux = Multiplexer::new(connection_id, sink, config);

    let result = loop {
        tokio::select! {
            biased;

            // Queued responses go out before the next read.
            Some(write) = outbound.recv() => {
                if let Err(err) = mux.write(&mut writer, write).await {
                    break Err(err);
                }
            }
            read = reader.read(&mut chunk) => match read {
                Ok(0) => break Ok(()),
                Ok(n) => {
                    if mux.receive(&chunk[..n], handler) == ReceiveOutcome::Close {
                        break Ok(());
                    }
                }
                Err(err) if is_peer_gone(&err) => break Ok(()),
                Err(err) => break Err(PeerError::Io(err)),
            },
        }
    };

    mux.teardown();
    info!(connection_id, "smfp client disconnected");
    result
}
