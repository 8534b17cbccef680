use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use russh::keys::PublicKey;
use russh::server::{Auth, Msg, Session};
use russh::{Channel, ChannelId, MethodKind, MethodSet};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::models::EventBus;
use crate::services::approval::{self, ApprovalFn, ApprovalRequest};
use crate::services::bridge::bridge;
use crate::services::config_service::ServerConfig;
use crate::services::key_service;
use crate::utils::error::{MoleError, Result};

/// Backoff before restarting a failed server loop
const RESTART_BACKOFF: Duration = Duration::from_secs(1);

/// The active public-key predicate. Interactive enrollment temporarily
/// replaces the plain list check; the list is restored on scope cancel.
enum Authorizer {
    List,
    Enroll(ApprovalFn, CancellationToken),
}

/// SSH server that admits peers by public key and honors their local and
/// reverse forwarding requests. No shell or PTY is offered.
#[derive(Clone)]
pub struct Server {
    cfg: Arc<Mutex<ServerConfig>>,
    events: EventBus,
    authorizer: Arc<RwLock<Authorizer>>,
    socket_path: PathBuf,
}

impl Server {
    /// Build a server from its config; the host key must parse.
    pub fn new(cfg: ServerConfig, events: EventBus) -> Result<Self> {
        key_service::parse_private_key(&cfg.host_key)
            .map_err(|e| MoleError::KeyParse(format!("host key: {}", e)))?;

        Ok(Self {
            cfg: Arc::new(Mutex::new(cfg)),
            events,
            authorizer: Arc::new(RwLock::new(Authorizer::List)),
            socket_path: PathBuf::from(approval::DEFAULT_SOCKET_PATH),
        })
    }

    /// Use a different approval socket than the well-known default
    pub fn with_socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.socket_path = path.into();
        self
    }

    /// Decide whether `key` may authenticate as `user`.
    ///
    /// The configured list is parsed into a snapshot and checked first;
    /// only on a miss do the interactive paths run. Every outcome emits an
    /// event naming the user and remote address.
    pub async fn authorize(&self, user: &str, remote: &str, key: &PublicKey) -> bool {
        self.events.log(format!(
            "incoming authentication request for {} from {}",
            user, remote
        ));

        let (snapshot, interactive_uds) = {
            let cfg = self.cfg.lock().await;
            (cfg.authorized_keys.clone(), cfg.interactive_uds)
        };

        for line in &snapshot {
            match key_service::parse_public_key(line) {
                Ok(known) if known.key_data() == key.key_data() => {
                    self.events
                        .log(format!("authorized key for {} from {}", user, remote));
                    return true;
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("skipping bad authorized key entry: {}", e),
            }
        }

        let enrollment = match &*self.authorizer.read().await {
            Authorizer::List => None,
            Authorizer::Enroll(prompt, scope) => Some((Arc::clone(prompt), scope.clone())),
        };

        let allowed = match enrollment {
            Some((prompt, enroll_scope)) => {
                let request = ApprovalRequest {
                    user: user.to_string(),
                    remote: remote.to_string(),
                };
                // A cancel racing the prompt aborts it and denies.
                let allowed = tokio::select! {
                    _ = enroll_scope.cancelled() => false,
                    res = tokio::task::spawn_blocking(move || prompt(request)) => {
                        res.unwrap_or(false)
                    }
                };
                if allowed {
                    self.persist_key(key).await;
                }
                allowed
            }
            None if interactive_uds => approval::request(&self.socket_path, user, remote).await,
            None => false,
        };

        if allowed {
            self.events
                .log(format!("approved key for {} from {}", user, remote));
        } else {
            let denied = MoleError::AuthDenied {
                user: user.to_string(),
                remote: remote.to_string(),
            };
            self.events.error(denied.to_string());
        }
        allowed
    }

    async fn persist_key(&self, key: &PublicKey) {
        let wire = match key.to_openssh() {
            Ok(wire) => wire,
            Err(e) => {
                self.events.error(format!("failed to encode key: {}", e));
                return;
            }
        };

        let mut cfg = self.cfg.lock().await;
        cfg.add_authorized_key(wire);
        match cfg.save() {
            Ok(()) => self
                .events
                .log("new public key was saved to the authorized list".to_string()),
            Err(e) => self.events.error(format!("failed to save config: {}", e)),
        }
    }

    /// Swap the predicate for interactive enrollment: unknown keys are put
    /// to `prompt` and accepted ones are persisted. Restores the plain
    /// list check when the scope is cancelled.
    pub async fn enroll_interactively(&self, scope: CancellationToken, prompt: ApprovalFn) {
        {
            let mut authorizer = self.authorizer.write().await;
            *authorizer = Authorizer::Enroll(prompt, scope.clone());
        }
        self.events
            .log("interactively accepting new public keys".to_string());

        scope.cancelled().await;

        let mut authorizer = self.authorizer.write().await;
        *authorizer = Authorizer::List;
    }

    /// One server lifetime: runs until the accept loop dies or the scope
    /// is cancelled, closing the listener in either case.
    pub async fn listen_and_serve(&self, scope: &CancellationToken) -> Result<()> {
        let (host_key, addr) = {
            let cfg = self.cfg.lock().await;
            (
                key_service::parse_private_key(&cfg.host_key)?,
                listen_addr(&cfg.listen_port),
            )
        };

        let config = Arc::new(russh::server::Config {
            methods: MethodSet::from(&[MethodKind::PublicKey][..]),
            keys: vec![host_key],
            auth_rejection_time: Duration::from_secs(1),
            auth_rejection_time_initial: Some(Duration::ZERO),
            ..Default::default()
        });

        let mut acceptor = Acceptor {
            server: self.clone(),
            scope: scope.child_token(),
        };

        self.events.log(format!("server listening on {}", addr));

        tokio::select! {
            res = russh::server::Server::run_on_address(&mut acceptor, config, addr.as_str()) => {
                res.map_err(|e| MoleError::ListenerFailure(format!("server exited: {}", e)))
            }
            _ = scope.cancelled() => Ok(()),
        }
    }

    /// Keep the server alive until the scope dies, restarting the inner
    /// loop with a fixed backoff.
    pub async fn run(&self, scope: CancellationToken) {
        while !scope.is_cancelled() {
            if let Err(e) = self.listen_and_serve(&scope).await {
                self.events.error(format!("server failed: {}", e));
            }
            tokio::select! {
                _ = scope.cancelled() => return,
                _ = tokio::time::sleep(RESTART_BACKOFF) => {}
            }
        }
    }
}

/// Turn a `listen_port` config value into a bindable address
fn listen_addr(listen_port: &str) -> String {
    if let Some(port) = listen_port.strip_prefix(':') {
        format!("0.0.0.0:{}", port)
    } else if listen_port.chars().all(|c| c.is_ascii_digit()) {
        format!("0.0.0.0:{}", listen_port)
    } else {
        listen_port.to_string()
    }
}

struct Acceptor {
    server: Server,
    scope: CancellationToken,
}

impl russh::server::Server for Acceptor {
    type Handler = ServerHandler;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> ServerHandler {
        self.server.events.log(format!(
            "new connection from {}",
            peer_addr
                .map(|a| a.to_string())
                .unwrap_or_else(|| "unknown".to_string())
        ));

        ServerHandler {
            server: self.server.clone(),
            remote: peer_addr
                .map(|a| a.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            forwards: HashMap::new(),
            scope: self.scope.child_token(),
        }
    }

    fn handle_session_error(&mut self, error: <Self::Handler as russh::server::Handler>::Error) {
        tracing::debug!("session error: {}", error);
    }
}

/// Per-connection handler: key authorization plus the standard forwarding
/// channel and request handlers.
pub struct ServerHandler {
    server: Server,
    remote: String,
    // Live tcpip-forward listeners for this session
    forwards: HashMap<(String, u32), CancellationToken>,
    scope: CancellationToken,
}

impl russh::server::Handler for ServerHandler {
    type Error = russh::Error;

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> std::result::Result<Auth, Self::Error> {
        if self.server.authorize(user, &self.remote, public_key).await {
            Ok(Auth::Accept)
        } else {
            Ok(Auth::Reject {
                proceed_with_methods: None,
                partial_success: false,
            })
        }
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> std::result::Result<bool, Self::Error> {
        // Sessions are accepted for keepalive purposes only.
        Ok(true)
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        session.channel_failure(channel)?;
        Ok(())
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        session.channel_failure(channel)?;
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        _data: &[u8],
        session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        session.channel_failure(channel)?;
        Ok(())
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> std::result::Result<bool, Self::Error> {
        tracing::debug!(
            "direct-tcpip to {}:{} from {}:{}",
            host_to_connect,
            port_to_connect,
            originator_address,
            originator_port
        );

        match TcpStream::connect((host_to_connect, port_to_connect as u16)).await {
            Ok(stream) => {
                tokio::spawn(bridge(
                    self.scope.child_token(),
                    channel.into_stream(),
                    stream,
                ));
                Ok(true)
            }
            Err(e) => {
                tracing::warn!(
                    "failed to dial {}:{}: {}",
                    host_to_connect,
                    port_to_connect,
                    e
                );
                Ok(false)
            }
        }
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        session: &mut Session,
    ) -> std::result::Result<bool, Self::Error> {
        let bind_host = if address.is_empty() {
            "0.0.0.0"
        } else {
            address
        };

        let listener = match TcpListener::bind((bind_host, *port as u16)).await {
            Ok(listener) => listener,
            Err(e) => {
                tracing::warn!("failed to bind {}:{}: {}", bind_host, port, e);
                return Ok(false);
            }
        };

        if *port == 0 {
            if let Ok(local) = listener.local_addr() {
                *port = local.port() as u32;
            }
        }

        self.server
            .events
            .log(format!("bound {}:{} for {}", bind_host, port, self.remote));

        let token = self.scope.child_token();
        self.forwards
            .insert((address.to_string(), *port), token.clone());

        let handle = session.handle();
        let connected_address = address.to_string();
        let connected_port = *port;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            let opened = handle
                                .channel_open_forwarded_tcpip(
                                    connected_address.clone(),
                                    connected_port,
                                    peer.ip().to_string(),
                                    peer.port() as u32,
                                )
                                .await;
                            match opened {
                                Ok(channel) => {
                                    tokio::spawn(bridge(
                                        token.child_token(),
                                        channel.into_stream(),
                                        stream,
                                    ));
                                }
                                // The session is gone; stop accepting.
                                Err(e) => {
                                    tracing::debug!("forward channel open failed: {}", e);
                                    break;
                                }
                            }
                        }
                        Err(e) => tracing::warn!("forward accept failed: {}", e),
                    },
                }
            }
        });

        Ok(true)
    }

    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut Session,
    ) -> std::result::Result<bool, Self::Error> {
        match self.forwards.remove(&(address.to_string(), port)) {
            Some(token) => {
                token.cancel();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl Drop for ServerHandler {
    fn drop(&mut self) {
        self.scope.cancel();
        for token in self.forwards.values() {
            token.cancel();
        }
    }
}
