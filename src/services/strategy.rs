use std::sync::Arc;

use async_trait::async_trait;
use russh::client::Msg;
use russh::{Channel, ChannelStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::models::Direction;
use crate::services::bridge::bridge;
use crate::utils::error::{MoleError, Result};

/// The dial/listen surface a forwarding strategy needs from an SSH session.
///
/// Implemented by [`Client`](crate::services::client::Client); tests can
/// substitute a stub.
#[async_trait]
pub trait SshConn: Send + Sync {
    /// Open a direct-tcpip channel to `addr` through the session.
    async fn dial(&self, addr: &str) -> Result<ChannelStream<Msg>>;

    /// Ask the remote side to listen on `addr`; forwarded connections
    /// arrive through the returned listener.
    async fn listen(&self, addr: &str) -> Result<RemoteListener>;

    /// Tear down a remote listen previously set up with `listen`.
    async fn unlisten(&self, addr: &str);
}

/// Connections accepted by a remote `tcpip-forward` bind, delivered as
/// forwarded-tcpip channels.
pub struct RemoteListener {
    rx: mpsc::Receiver<Channel<Msg>>,
}

impl RemoteListener {
    pub fn new(rx: mpsc::Receiver<Channel<Msg>>) -> Self {
        Self { rx }
    }

    /// Next forwarded connection. `None` means the session is gone.
    pub async fn accept(&mut self) -> Option<Channel<Msg>> {
        self.rx.recv().await
    }
}

/// Direction-specific accept+dial+bridge implementation for one tunnel.
#[derive(Debug, Clone)]
pub struct ForwardStrategy {
    direction: Direction,
    local: String,
    remote: String,
}

impl ForwardStrategy {
    pub fn new(direction: Direction, local: impl Into<String>, remote: impl Into<String>) -> Self {
        Self {
            direction,
            local: local.into(),
            remote: remote.into(),
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Open the listening side. Bind failures surface here, before any
    /// accept loop runs.
    pub async fn bind(&self, conn: &dyn SshConn) -> Result<BoundForward> {
        let inner = match self.direction {
            Direction::Local => {
                let listener = TcpListener::bind(&self.local).await.map_err(|e| {
                    MoleError::ListenerFailure(format!("failed to bind {}: {}", self.local, e))
                })?;
                tracing::info!("listening for connections on {}", self.local);
                Listener::Tcp(listener)
            }
            Direction::Reverse => {
                let listener = conn.listen(&self.remote).await?;
                tracing::info!("remote side listening on {}", self.remote);
                Listener::Remote(listener)
            }
        };

        Ok(BoundForward {
            local: self.local.clone(),
            remote: self.remote.clone(),
            inner,
        })
    }

    /// Bind and serve in one call. Returns when the scope is cancelled or
    /// the listening side fails for good.
    pub async fn run(&self, scope: CancellationToken, conn: Arc<dyn SshConn>) -> Result<()> {
        self.bind(conn.as_ref()).await?.serve(scope, conn).await
    }
}

enum Listener {
    Tcp(TcpListener),
    Remote(RemoteListener),
}

/// A strategy whose listening side is already open.
pub struct BoundForward {
    local: String,
    remote: String,
    inner: Listener,
}

impl BoundForward {
    /// Accept connections and pair each with a dial on the other side,
    /// handing every pair to a bridge task. The listener closes when this
    /// returns.
    pub async fn serve(self, scope: CancellationToken, conn: Arc<dyn SshConn>) -> Result<()> {
        match self.inner {
            Listener::Tcp(listener) => {
                Self::serve_local(listener, &self.remote, scope, conn).await
            }
            Listener::Remote(listener) => {
                let result =
                    Self::serve_reverse(listener, &self.local, &self.remote, scope, &conn).await;
                conn.unlisten(&self.remote).await;
                result
            }
        }
    }

    async fn serve_local(
        listener: TcpListener,
        remote: &str,
        scope: CancellationToken,
        conn: Arc<dyn SshConn>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                _ = scope.cancelled() => return Ok(()),
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tracing::debug!("accepted connection from {}", peer);
                        match conn.dial(remote).await {
                            Ok(channel) => {
                                tokio::spawn(bridge(scope.child_token(), stream, channel));
                            }
                            Err(e) => {
                                // Dropping the accepted socket tells the
                                // caller the remote end is unreachable.
                                tracing::warn!("failed to open port to remote {}: {}", remote, e);
                            }
                        }
                    }
                    // Transient; the listener itself only goes away when
                    // this task returns.
                    Err(e) => tracing::warn!("failed to accept connection: {}", e),
                },
            }
        }
    }

    async fn serve_reverse(
        mut listener: RemoteListener,
        local: &str,
        remote: &str,
        scope: CancellationToken,
        _conn: &Arc<dyn SshConn>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                _ = scope.cancelled() => return Ok(()),
                accepted = listener.accept() => match accepted {
                    Some(channel) => match TcpStream::connect(local).await {
                        Ok(stream) => {
                            tokio::spawn(bridge(
                                scope.child_token(),
                                channel.into_stream(),
                                stream,
                            ));
                        }
                        Err(e) => {
                            tracing::warn!("failed to dial local {}: {}", local, e);
                        }
                    },
                    None => {
                        return Err(MoleError::SessionLost(format!(
                            "forwarding stream for {} ended",
                            remote
                        )))
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction() {
        let s = ForwardStrategy::new(Direction::Local, "localhost:9000", "example.com:80");
        assert_eq!(s.direction(), Direction::Local);
    }
}
