use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use smfp_transport::AsyncUnixSocket;
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::config::ServerConfig;
use crate::error::Result;
use crate::handler::RequestHandler;
use crate::multiplexer::serve_connection;

/// Accepts SMFP clients on a Unix domain socket and serves each one on its
/// own task.
///
/// A fatal error on any connection (a write failure other than a broken
/// pipe, or a panicking handler) stops the server and is returned from
/// [`run`](Server::run).
pub struct Server<H> {
    socket: AsyncUnixSocket,
    handler: Arc<H>,
    config: ServerConfig,
    next_connection_id: u64,
}

impl<H: RequestHandler> Server<H> {
    /// Bind to `path`, replacing a stale socket file there.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(path: impl AsRef<Path>, handler: H) -> Result<Self> {
        Self::bind_with_config(path, handler, ServerConfig::default())
    }

    /// Bind with explicit connection configuration.
    pub fn bind_with_config(path: impl AsRef<Path>, handler: H, config: ServerConfig) -> Result<Self> {
        let socket = AsyncUnixSocket::bind(path)?;
        info!(path = ?socket.path(), "smfp server listening");
        Ok(Self {
            socket,
            handler: Arc::new(handler),
            config,
            next_connection_id: 0,
        })
    }

    /// Bound socket path.
    pub fn path(&self) -> &Path {
        self.socket.path()
    }

    /// Serve clients until a connection fails fatally.
    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Serve clients until `shutdown` resolves or a connection fails fatally.
    ///
    /// On shutdown, connections still open are aborted and the socket file
    /// is removed.
    pub async fn run_until<F>(mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        let result = loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!("smfp server shutting down");
                    break Ok(());
                }
                accepted = self.socket.accept() => {
                    let stream = match accepted {
                        Ok(stream) => stream,
                        Err(err) => break Err(err.into()),
                    };
                    let connection_id = self.next_connection_id;
                    self.next_connection_id += 1;
                    info!(connection_id, "smfp client connected");

                    let handler = Arc::clone(&self.handler);
                    let config = self.config.clone();
                    connections.spawn(async move {
                        serve_connection(stream, connection_id, handler.as_ref(), config).await
                    });
                }
                Some(joined) = connections.join_next() => {
                    match joined {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => {
                            error!(error = %err, "connection failed");
                            break Err(err);
                        }
                        Err(err) => {
                            error!(error = %err, "connection task failed");
                            break Err(err.into());
                        }
                    }
                }
            }
        };

        connections.shutdown().await;
        result
    }
}
