use std::collections::HashMap;
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use smfp_frame::{FrameError, RequestWriter, Response, ResponseBody, ResponseReader};
use smfp_transport::UnixDomainSocket;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::{PeerError, Result};

type ResponseSender = mpsc::Sender<Result<ResponseBody>>;

/// A transaction waiting for responses on one particular connection.
struct Waiting {
    generation: u64,
    tx: ResponseSender,
}

/// Transactions waiting for responses, and which connection is alive.
struct Outstanding {
    /// Generation whose reader thread is still running.
    connected: Option<u64>,
    next_transaction_id: u32,
    waiting: HashMap<u32, Waiting>,
}

impl Outstanding {
    /// Next free transaction ID. Wraps from `u32::MAX` to 1, skipping IDs
    /// still waiting for responses.
    fn allocate(&mut self) -> u32 {
        loop {
            let id = self.next_transaction_id;
            self.next_transaction_id = id.checked_add(1).unwrap_or(1);
            if !self.waiting.contains_key(&id) {
                return id;
            }
        }
    }
}

struct Shared {
    outstanding: Mutex<Outstanding>,
    response_timeout: Option<Duration>,
}

impl Shared {
    fn outstanding(&self) -> MutexGuard<'_, Outstanding> {
        self.outstanding
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn unregister(&self, transaction_id: u32) {
        self.outstanding().waiting.remove(&transaction_id);
    }
}

/// One open socket plus the thread reading responses from it.
struct Connection {
    generation: u64,
    stream: UnixStream,
    writer: RequestWriter<UnixStream>,
    reader_thread: Option<JoinHandle<()>>,
}

impl Connection {
    fn open(path: &Path, config: &ClientConfig, shared: &Arc<Shared>, generation: u64) -> Result<Self> {
        let stream = UnixDomainSocket::connect_with_retry(path, config.connect_retry)?;
        let reader_stream = stream.try_clone()?;
        let writer_stream = stream.try_clone()?;

        shared.outstanding().connected = Some(generation);
        let reader = ResponseReader::with_max_payload(reader_stream, config.max_response_payload);
        let reader_shared = Arc::clone(shared);
        let spawned = std::thread::Builder::new()
            .name("smfp-response-reader".to_string())
            .spawn(move || read_responses(reader, &reader_shared, generation));
        let reader_thread = match spawned {
            Ok(handle) => handle,
            Err(err) => {
                shared.outstanding().connected = None;
                return Err(err.into());
            }
        };

        info!(?path, generation, "connected to smfp server");
        Ok(Self {
            generation,
            stream,
            writer: RequestWriter::new(writer_stream),
            reader_thread: Some(reader_thread),
        })
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
        if let Some(handle) = self.reader_thread.take() {
            let _ = handle.join();
        }
    }
}

/// Where the client connects, and the current connection if any.
struct Link {
    path: PathBuf,
    generation: u64,
    connection: Option<Connection>,
}

/// Blocking SMFP client multiplexing many transactions over one connection.
///
/// Requests can be issued from several threads at once; a background reader
/// thread routes each response to the transaction it belongs to.
/// Transaction IDs are assigned sequentially from 1.
///
/// A lost connection fails the transactions waiting on it. The next request
/// reconnects, waiting for the server per [`ClientConfig::connect_retry`].
pub struct Client {
    shared: Arc<Shared>,
    config: ClientConfig,
    link: Mutex<Link>,
}

impl Client {
    /// Connect with default configuration, waiting for the server to appear.
    pub fn connect(path: impl AsRef<Path>) -> Result<Self> {
        Self::connect_with_config(path, ClientConfig::default())
    }

    /// Connect with explicit configuration.
    pub fn connect_with_config(path: impl AsRef<Path>, config: ClientConfig) -> Result<Self> {
        let client = Self {
            shared: Arc::new(Shared {
                outstanding: Mutex::new(Outstanding {
                    connected: None,
                    next_transaction_id: 1,
                    waiting: HashMap::new(),
                }),
                response_timeout: config.response_timeout,
            }),
            config,
            link: Mutex::new(Link {
                path: path.as_ref().to_path_buf(),
                generation: 0,
                connection: None,
            }),
        };
        client.ensure_connected(&mut client.link())?;
        Ok(client)
    }

    /// Send a request and return a handle for its response(s).
    ///
    /// Reconnects first if the connection was lost. A request that hits a
    /// broken pipe is sent once more on a fresh connection.
    pub fn send_request(&self, code: u8, arg: &[u8]) -> Result<PendingTransaction> {
        let mut link = self.link();
        let mut resent = false;
        loop {
            let generation = self.ensure_connected(&mut link)?;

            let (tx, rx) = mpsc::channel();
            let transaction_id = {
                let mut outstanding = self.shared.outstanding();
                if outstanding.connected == Some(generation) {
                    let id = outstanding.allocate();
                    outstanding.waiting.insert(id, Waiting { generation, tx });
                    Some(id)
                } else {
                    None
                }
            };
            // Registered first so a fast response is never missed.
            let pending = transaction_id.map(|transaction_id| PendingTransaction {
                shared: Arc::clone(&self.shared),
                transaction_id,
                rx,
            });

            let sent = match (&pending, link.connection.as_mut()) {
                (Some(pending), Some(connection)) => {
                    connection.writer.send(code, pending.transaction_id, arg)
                }
                // The reader stopped between connecting and registering.
                _ => Err(FrameError::ConnectionClosed),
            };
            match (sent, pending) {
                (Ok(()), Some(pending)) => {
                    debug!(
                        transaction_id = pending.transaction_id,
                        code,
                        arg_len = arg.len(),
                        "sent request"
                    );
                    return Ok(pending);
                }
                (Err(err), _) if is_connection_lost(&err) => {
                    warn!(error = %err, resent, "connection lost while sending request");
                    link.connection = None;
                    if resent {
                        return Err(PeerError::ConnectionFailed);
                    }
                    resent = true;
                }
                (Err(err), _) => return Err(err.into()),
                (Ok(()), None) => return Err(PeerError::ConnectionFailed),
            }
        }
    }

    /// Send a request and wait for its first response.
    ///
    /// An error response becomes [`PeerError::Remote`].
    pub fn request(&self, code: u8, arg: &[u8]) -> Result<Bytes> {
        let pending = self.send_request(code, arg)?;
        match pending.next_response()? {
            ResponseBody::Data(payload) => Ok(payload),
            ResponseBody::Error(code) => Err(PeerError::Remote(code)),
        }
    }

    /// Point the client at another socket path.
    ///
    /// The current connection is closed right away, failing its waiting
    /// transactions with [`PeerError::ConnectionFailed`]. The next request
    /// connects to `path`.
    pub fn switch_socket(&self, path: impl AsRef<Path>) {
        let mut link = self.link();
        link.path = path.as_ref().to_path_buf();
        link.connection = None;
        info!(path = ?link.path, "switched smfp socket");
    }

    /// Socket path requests go to.
    pub fn path(&self) -> PathBuf {
        self.link().path.clone()
    }

    /// Whether the current connection is still open.
    pub fn is_connected(&self) -> bool {
        let link = self.link();
        match &link.connection {
            Some(connection) => self.shared.outstanding().connected == Some(connection.generation),
            None => false,
        }
    }

    /// Number of transactions still waiting for responses.
    pub fn outstanding(&self) -> usize {
        self.shared.outstanding().waiting.len()
    }

    fn link(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Generation of a live connection, opening a new one if needed.
    fn ensure_connected(&self, link: &mut Link) -> Result<u64> {
        if let Some(connection) = &link.connection {
            if self.shared.outstanding().connected == Some(connection.generation) {
                return Ok(connection.generation);
            }
            debug!(generation = connection.generation, "connection lost; reconnecting");
            link.connection = None;
        }

        link.generation += 1;
        let connection = Connection::open(&link.path, &self.config, &self.shared, link.generation)?;
        let generation = connection.generation;
        link.connection = Some(connection);
        Ok(generation)
    }
}

/// A request that has been sent and may still receive responses.
///
/// Dropping it stops routing responses to it; later responses for the same
/// ID are logged and ignored.
pub struct PendingTransaction {
    shared: Arc<Shared>,
    transaction_id: u32,
    rx: mpsc::Receiver<Result<ResponseBody>>,
}

impl PendingTransaction {
    /// Transaction ID assigned to the request.
    pub fn transaction_id(&self) -> u32 {
        self.transaction_id
    }

    /// Wait for the next response frame of this transaction.
    ///
    /// Call repeatedly for streamed responses; the application protocol
    /// decides which response is the last.
    pub fn next_response(&self) -> Result<ResponseBody> {
        match self.shared.response_timeout {
            Some(timeout) => self.rx.recv_timeout(timeout).map_err(|err| match err {
                mpsc::RecvTimeoutError::Timeout => PeerError::Timeout(timeout),
                mpsc::RecvTimeoutError::Disconnected => PeerError::ConnectionFailed,
            })?,
            None => self.rx.recv().map_err(|_| PeerError::ConnectionFailed)?,
        }
    }
}

impl Drop for PendingTransaction {
    fn drop(&mut self) {
        self.shared.unregister(self.transaction_id);
    }
}

fn read_responses(mut reader: ResponseReader<UnixStream>, shared: &Shared, generation: u64) {
    loop {
        let Response {
            transaction_id,
            body,
        } = match reader.read_response() {
            Ok(response) => response,
            Err(FrameError::ConnectionClosed) => {
                info!(generation, "server closed the connection");
                break;
            }
            Err(err) => {
                warn!(generation, error = %err, "response reader failed");
                break;
            }
        };

        let outstanding = shared.outstanding();
        match outstanding.waiting.get(&transaction_id) {
            Some(waiting) if waiting.generation == generation => {
                let _ = waiting.tx.send(Ok(body));
            }
            _ => warn!(
                transaction_id,
                "no outstanding transaction for response; server probably responded \
                 to the same transaction twice, ignoring"
            ),
        }
    }

    let mut outstanding = shared.outstanding();
    if outstanding.connected == Some(generation) {
        outstanding.connected = None;
    }
    let lost: Vec<u32> = outstanding
        .waiting
        .iter()
        .filter(|(_, waiting)| waiting.generation == generation)
        .map(|(id, _)| *id)
        .collect();
    for transaction_id in lost {
        if let Some(waiting) = outstanding.waiting.remove(&transaction_id) {
            debug!(transaction_id, "cancelling transaction");
            let _ = waiting.tx.send(Err(PeerError::ConnectionFailed));
        }
    }
}

fn is_connection_lost(err: &FrameError) -> bool {
    match err {
        FrameError::ConnectionClosed => true,
        FrameError::Io(err) => matches!(
            err.kind(),
            std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::NotConnected
        ),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::path::PathBuf;
    use std::thread;

    use bytes::BytesMut;
    use smfp_frame::{encode_error_response, encode_response, parse_request, UNKNOWN_REQUEST_CODE};
    use smfp_transport::ConnectRetry;

    use super::*;

    fn make_sock_path(tag: &str) -> PathBuf {
        let dir = PathBuf::from(format!(
            "/tmp/smfp-cli-{}-{}-{}",
            tag,
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("time should be after epoch")
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
        dir.join("client.sock")
    }

    fn no_retry() -> ClientConfig {
        ClientConfig {
            connect_retry: ConnectRetry::none(),
            response_timeout: Some(Duration::from_secs(5)),
            ..ClientConfig::default()
        }
    }

    /// Read exactly `count` requests from a raw server-side stream.
    fn read_requests(stream: &mut UnixStream, count: usize) -> Vec<smfp_frame::RequestFrame> {
        let mut buf = Vec::new();
        let mut frames = Vec::new();
        while frames.len() < count {
            let mut chunk = [0u8; 512];
            let n = stream.read(&mut chunk).expect("server read should succeed");
            assert!(n > 0, "client closed early");
            buf.extend_from_slice(&chunk[..n]);
            while let Some(parsed) = parse_request(&buf).unwrap() {
                buf.drain(..parsed.total_len);
                frames.push(parsed.frame);
            }
        }
        frames
    }

    /// Answer the next request on a raw server-side stream with `payload`.
    fn answer(stream: &mut UnixStream, payload: &[u8]) {
        let id = read_requests(stream, 1)[0].transaction_id;
        let mut wire = BytesMut::new();
        encode_response(id, payload, &mut wire).unwrap();
        stream.write_all(&wire).unwrap();
    }

    #[test]
    fn transaction_ids_start_at_one_and_increase() {
        let sock_path = make_sock_path("ids");
        let listener = UnixDomainSocket::bind(&sock_path).unwrap();

        let server = thread::spawn(move || {
            let mut stream = listener.accept().unwrap();
            let frames = read_requests(&mut stream, 3);
            let ids = frames.iter().map(|f| f.transaction_id).collect::<Vec<_>>();
            (ids, stream)
        });

        let client = Client::connect_with_config(&sock_path, no_retry()).unwrap();
        let pending: Vec<_> = (0..3)
            .map(|_| client.send_request(0x42, b"x").unwrap())
            .collect();

        let (ids, _stream) = server.join().unwrap();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(client.outstanding(), 3);
        drop(pending);
        assert_eq!(client.outstanding(), 0);

        let _ = std::fs::remove_dir_all(sock_path.parent().unwrap());
    }

    #[test]
    fn responses_are_routed_by_transaction_id() {
        let sock_path = make_sock_path("route");
        let listener = UnixDomainSocket::bind(&sock_path).unwrap();

        let server = thread::spawn(move || {
            let mut stream = listener.accept().unwrap();
            let frames = read_requests(&mut stream, 2);
            // Answer in reverse order, the second one as an error.
            let mut wire = BytesMut::new();
            encode_error_response(frames[1].transaction_id, UNKNOWN_REQUEST_CODE, &mut wire)
                .unwrap();
            encode_response(frames[0].transaction_id, b"first", &mut wire).unwrap();
            stream.write_all(&wire).unwrap();
            stream
        });

        let client = Client::connect_with_config(&sock_path, no_retry()).unwrap();
        let first = client.send_request(0x42, b"a").unwrap();
        let second = client.send_request(0x43, b"b").unwrap();

        assert_eq!(
            first.next_response().unwrap(),
            ResponseBody::Data(Bytes::from_static(b"first"))
        );
        assert_eq!(
            second.next_response().unwrap(),
            ResponseBody::Error(UNKNOWN_REQUEST_CODE)
        );

        let _stream = server.join().unwrap();
        let _ = std::fs::remove_dir_all(sock_path.parent().unwrap());
    }

    #[test]
    fn streamed_responses_arrive_in_order() {
        let sock_path = make_sock_path("stream");
        let listener = UnixDomainSocket::bind(&sock_path).unwrap();

        let server = thread::spawn(move || {
            let mut stream = listener.accept().unwrap();
            let id = read_requests(&mut stream, 1)[0].transaction_id;
            let mut wire = BytesMut::new();
            for part in [&b"one"[..], b"two", b""] {
                encode_response(id, part, &mut wire).unwrap();
            }
            stream.write_all(&wire).unwrap();
            stream
        });

        let client = Client::connect_with_config(&sock_path, no_retry()).unwrap();
        let pending = client.send_request(0x10, b"").unwrap();
        let parts: Vec<_> = (0..3).map(|_| pending.next_response().unwrap()).collect();
        assert_eq!(
            parts,
            vec![
                ResponseBody::Data(Bytes::from_static(b"one")),
                ResponseBody::Data(Bytes::from_static(b"two")),
                ResponseBody::Data(Bytes::new()),
            ]
        );

        let _stream = server.join().unwrap();
        let _ = std::fs::remove_dir_all(sock_path.parent().unwrap());
    }

    #[test]
    fn request_maps_error_response() {
        let sock_path = make_sock_path("remote");
        let listener = UnixDomainSocket::bind(&sock_path).unwrap();

        let server = thread::spawn(move || {
            let mut stream = listener.accept().unwrap();
            let id = read_requests(&mut stream, 1)[0].transaction_id;
            let mut wire = BytesMut::new();
            encode_error_response(id, UNKNOWN_REQUEST_CODE, &mut wire).unwrap();
            stream.write_all(&wire).unwrap();
            stream
        });

        let client = Client::connect_with_config(&sock_path, no_retry()).unwrap();
        let err = client.request(0x77, b"").unwrap_err();
        assert!(matches!(err, PeerError::Remote(-200)));
        assert_eq!(err.status_code(), Some(-200));

        let _stream = server.join().unwrap();
        let _ = std::fs::remove_dir_all(sock_path.parent().unwrap());
    }

    #[test]
    fn server_disconnect_fails_outstanding_transactions() {
        let sock_path = make_sock_path("drop");
        let listener = UnixDomainSocket::bind(&sock_path).unwrap();

        let server = thread::spawn(move || {
            let mut stream = listener.accept().unwrap();
            read_requests(&mut stream, 1);
            // Dropping the stream and listener closes the connection without
            // answering and removes the socket file.
        });

        let client = Client::connect_with_config(&sock_path, no_retry()).unwrap();
        let pending = client.send_request(0x42, b"orphan").unwrap();
        server.join().unwrap();

        let err = pending.next_response().unwrap_err();
        assert!(matches!(err, PeerError::ConnectionFailed));
        assert_eq!(err.status_code(), Some(smfp_frame::CONNECTION_FAILED));
        assert!(!client.is_connected());
        assert_eq!(client.outstanding(), 0);

        // Nobody is listening any more, so the reconnect fails.
        let err = client.request(0x42, b"late").unwrap_err();
        assert!(matches!(err, PeerError::Transport(_)));

        let _ = std::fs::remove_dir_all(sock_path.parent().unwrap());
    }

    #[test]
    fn reconnects_after_server_restart() {
        let sock_path = make_sock_path("restart");
        let first = UnixDomainSocket::bind(&sock_path).unwrap();
        let server = thread::spawn(move || {
            let mut stream = first.accept().unwrap();
            answer(&mut stream, b"first");
            first
        });

        let client = Client::connect_with_config(&sock_path, no_retry()).unwrap();
        assert_eq!(client.request(0x42, b"a").unwrap(), Bytes::from_static(b"first"));
        // Dropping the listener removes the socket file.
        drop(server.join().unwrap());

        let second = UnixDomainSocket::bind(&sock_path).unwrap();
        let server = thread::spawn(move || {
            let mut stream = second.accept().unwrap();
            answer(&mut stream, b"second");
            (second, stream)
        });

        assert_eq!(client.request(0x42, b"b").unwrap(), Bytes::from_static(b"second"));
        assert!(client.is_connected());

        let _second = server.join().unwrap();
        let _ = std::fs::remove_dir_all(sock_path.parent().unwrap());
    }

    #[test]
    fn switch_socket_fails_waiting_and_moves_to_new_path() {
        let old_path = make_sock_path("switch-old");
        let new_path = make_sock_path("switch-new");
        let old = UnixDomainSocket::bind(&old_path).unwrap();
        let new = UnixDomainSocket::bind(&new_path).unwrap();

        let old_server = thread::spawn(move || {
            let mut stream = old.accept().unwrap();
            read_requests(&mut stream, 1);
            (old, stream)
        });
        let new_server = thread::spawn(move || {
            let mut stream = new.accept().unwrap();
            answer(&mut stream, b"from new");
            (new, stream)
        });

        let client = Client::connect_with_config(&old_path, no_retry()).unwrap();
        let stranded = client.send_request(0x42, b"stranded").unwrap();
        let _old = old_server.join().unwrap();

        client.switch_socket(&new_path);
        assert_eq!(client.path(), new_path);
        assert!(!client.is_connected());
        assert!(matches!(
            stranded.next_response(),
            Err(PeerError::ConnectionFailed)
        ));

        assert_eq!(
            client.request(0x42, b"moved").unwrap(),
            Bytes::from_static(b"from new")
        );
        assert!(client.is_connected());

        let _new = new_server.join().unwrap();
        let _ = std::fs::remove_dir_all(old_path.parent().unwrap());
        let _ = std::fs::remove_dir_all(new_path.parent().unwrap());
    }

    #[test]
    fn transaction_ids_wrap_past_waiting_ones() {
        let (tx, _rx) = mpsc::channel();
        let mut outstanding = Outstanding {
            connected: None,
            next_transaction_id: u32::MAX,
            waiting: HashMap::new(),
        };
        outstanding.waiting.insert(1, Waiting { generation: 1, tx });

        assert_eq!(outstanding.allocate(), u32::MAX);
        // 0 is never used and 1 is still waiting.
        assert_eq!(outstanding.allocate(), 2);
        assert_eq!(outstanding.allocate(), 3);
    }

    #[test]
    fn response_timeout() {
        let sock_path = make_sock_path("timeout");
        let listener = UnixDomainSocket::bind(&sock_path).unwrap();

        let server = thread::spawn(move || {
            let mut stream = listener.accept().unwrap();
            read_requests(&mut stream, 1);
            stream
        });

        let config = ClientConfig {
            response_timeout: Some(Duration::from_millis(50)),
            ..no_retry()
        };
        let client = Client::connect_with_config(&sock_path, config).unwrap();
        let err = client.request(0x42, b"slow").unwrap_err();
        assert!(matches!(err, PeerError::Timeout(_)));

        let _stream = server.join().unwrap();
        let _ = std::fs::remove_dir_all(sock_path.parent().unwrap());
    }

    #[test]
    fn connect_to_missing_socket_fails() {
        let sock_path = make_sock_path("missing");
        let err = Client::connect_with_config(&sock_path, no_retry())
            .err()
            .expect("connect should fail");
        assert!(matches!(err, PeerError::Transport(_)));
        let _ = std::fs::remove_dir_all(sock_path.parent().unwrap());
    }
}
