use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, AuthResult, Handle, Msg};
use russh::keys::{decode_secret_key, PrivateKey, PrivateKeyWithHashAlg, PublicKey};
use russh::{Channel, ChannelStream, Disconnect};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::models::{Event, EventBus};
use crate::services::strategy::{RemoteListener, SshConn};
use crate::services::tunnel::Tunnel;
use crate::utils::error::{MoleError, Result};
use crate::utils::net::split_endpoint;

/// Interval between connection attempts
const RETRY_INTERVAL: Duration = Duration::from_secs(5);
/// Poll interval for `wait_for_connect`
const CONNECT_POLL: Duration = Duration::from_millis(200);
/// Poll interval of the liveness waiter
const LIVENESS_POLL: Duration = Duration::from_secs(1);

/// SSH client session handle
pub type SshSession = Handle<ClientHandler>;

/// Routes forwarded-tcpip channels to the reverse strategy listening on
/// that remote port.
type ForwardRoutes = Arc<RwLock<HashMap<u32, mpsc::Sender<Channel<Msg>>>>>;

/// A supervised SSH session to one upstream address with its tunnels.
pub struct Client {
    address: String,
    key: Arc<PrivateKey>,
    host_key: Option<PublicKey>,
    session: Arc<RwLock<Option<SshSession>>>,
    connected: Arc<AtomicBool>,
    dead_tx: mpsc::Sender<()>,
    dead_rx: Mutex<mpsc::Receiver<()>>,
    routes: ForwardRoutes,
    tunnels: Vec<Arc<Tunnel>>,
    // Admits at most one supervisor loop per client
    connect_lock: Mutex<()>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").field("address", &self.address).finish_non_exhaustive()
    }
}

impl Client {
    /// Create a client for `address` authenticating with the given private
    /// key PEM. `host_key` pins the server's public key (wire form); without
    /// it the first key seen is trusted.
    pub fn new(
        address: impl Into<String>,
        private_key_pem: &str,
        host_key: Option<&str>,
    ) -> Result<Self> {
        let key = decode_secret_key(private_key_pem, None)
            .map_err(|e| MoleError::KeyParse(format!("failed to parse private key: {}", e)))?;

        let host_key = match host_key {
            Some(line) => Some(PublicKey::from_openssh(line.trim()).map_err(|e| {
                MoleError::KeyParse(format!("failed to parse pinned host key: {}", e))
            })?),
            None => None,
        };

        let (dead_tx, dead_rx) = mpsc::channel(1);

        Ok(Self {
            address: address.into(),
            key: Arc::new(key),
            host_key,
            session: Arc::new(RwLock::new(None)),
            connected: Arc::new(AtomicBool::new(false)),
            dead_tx,
            dead_rx: Mutex::new(dead_rx),
            routes: Arc::new(RwLock::new(HashMap::new())),
            tunnels: Vec::new(),
            connect_lock: Mutex::new(()),
        })
    }

    pub fn add_tunnel(&mut self, tunnel: Tunnel) {
        self.tunnels.push(Arc::new(tunnel));
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn tunnels(&self) -> &[Arc<Tunnel>] {
        &self.tunnels
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Single-shot TCP dial and SSH handshake; on success the session is
    /// installed but `connected` is left to the supervisor.
    pub async fn connect(&self) -> Result<()> {
        let (host, port) = match split_endpoint(&self.address) {
            Some((host, port)) => (host, port as u16),
            None => (self.address.clone(), 22),
        };

        if self.host_key.is_none() {
            tracing::warn!(
                "no pinned host key for {}, trusting first key seen (insecure)",
                self.address
            );
        }

        let config = client::Config {
            inactivity_timeout: None,
            ..<client::Config as Default>::default()
        };

        let handler = ClientHandler {
            pinned_host_key: self.host_key.clone(),
            routes: Arc::clone(&self.routes),
        };

        let mut session = client::connect(Arc::new(config), (host.as_str(), port), handler)
            .await
            .map_err(|e| MoleError::DialFailure(format!("{}: {}", self.address, e)))?;

        let user = whoami::username();
        let key_with_alg = PrivateKeyWithHashAlg::new(Arc::clone(&self.key), None);
        let auth_res = session
            .authenticate_publickey(&user, key_with_alg)
            .await
            .map_err(|e| MoleError::DialFailure(format!("{}: {}", self.address, e)))?;

        if !matches!(auth_res, AuthResult::Success) {
            return Err(MoleError::DialFailure(format!(
                "{}: public key authentication rejected",
                self.address
            )));
        }

        *self.session.write().await = Some(session);
        Ok(())
    }

    /// Supervisor: a ticker drives connection attempts, a liveness waiter
    /// flags dead sessions for retry, and scope cancel closes everything.
    /// Runs at most once per client.
    pub async fn connect_with_scope(&self, scope: CancellationToken, events: EventBus) {
        let _guard = self.connect_lock.lock().await;
        if self.is_connected() {
            return;
        }

        let mut ticker = tokio::time::interval(RETRY_INTERVAL);
        let mut dead_rx = self.dead_rx.lock().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.is_connected() {
                        continue;
                    }
                    match self.connect().await {
                        Ok(()) => {
                            self.connected.store(true, Ordering::SeqCst);
                            self.spawn_liveness_waiter();
                            events.log(format!("client {} was connected", self.address));
                            events.emit(Event::ClientConnected(self.address.clone()));
                        }
                        Err(e) => {
                            events.error(format!("failed to connect to {}: {}", self.address, e));
                        }
                    }
                }
                _ = dead_rx.recv() => {
                    self.connected.store(false, Ordering::SeqCst);
                    events.error(format!("client {} disconnected", self.address));
                    events.emit(Event::ClientDisconnected(self.address.clone()));
                }
                _ = scope.cancelled() => {
                    events.log(format!("scope cancelled for client {}", self.address));
                    self.close().await;
                    return;
                }
            }
        }
    }

    fn spawn_liveness_waiter(&self) {
        let session = Arc::clone(&self.session);
        let dead_tx = self.dead_tx.clone();
        let address = self.address.clone();

        tokio::spawn(async move {
            loop {
                {
                    let guard = session.read().await;
                    match guard.as_ref() {
                        Some(s) if !s.is_closed() => {}
                        _ => break,
                    }
                }
                tokio::time::sleep(LIVENESS_POLL).await;
            }
            tracing::debug!("session to {} exited", address);
            let _ = dead_tx.send(()).await;
        });
    }

    /// Block until the client is connected, polling every 200 ms. Callers
    /// must guard with a scope check; this never times out on its own.
    pub async fn wait_for_connect(&self) {
        loop {
            if self.is_connected() {
                return;
            }
            tokio::time::sleep(CONNECT_POLL).await;
        }
    }

    /// Start the supervisor, wait for readiness, then run a `keep_open`
    /// task per enabled tunnel. No-op for clients without enabled tunnels.
    pub async fn open_tunnels(self: &Arc<Self>, scope: CancellationToken, events: EventBus) {
        if !self.tunnels.iter().any(|t| t.is_enabled()) {
            return;
        }

        {
            let client = Arc::clone(self);
            let scope = scope.clone();
            let events = events.clone();
            tokio::spawn(async move {
                client.connect_with_scope(scope, events).await;
            });
        }

        tokio::select! {
            _ = scope.cancelled() => return,
            _ = self.wait_for_connect() => {}
        }

        for tunnel in self.tunnels.iter().filter(|t| t.is_enabled()) {
            let tunnel = Arc::clone(tunnel);
            let conn: Arc<dyn SshConn> = Arc::clone(self) as Arc<dyn SshConn>;
            let scope = scope.clone();
            let events = events.clone();
            tokio::spawn(async move {
                tunnel.keep_open(scope, conn, &events).await;
            });
        }
    }

    /// Close the session and mark the client disconnected.
    pub async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(session) = self.session.write().await.take() {
            let _ = session
                .disconnect(Disconnect::ByApplication, "", "English")
                .await;
        }
    }
}

#[async_trait]
impl SshConn for Client {
    async fn dial(&self, addr: &str) -> Result<ChannelStream<Msg>> {
        if !self.is_connected() {
            return Err(MoleError::Disconnected);
        }

        let (host, port) = split_endpoint(addr)
            .ok_or_else(|| MoleError::DialFailure(format!("invalid address: {}", addr)))?;

        let guard = self.session.read().await;
        let session = guard.as_ref().ok_or(MoleError::Disconnected)?;

        let channel = session
            .channel_open_direct_tcpip(&host, port, "127.0.0.1", 0)
            .await
            .map_err(|e| MoleError::DialFailure(format!("{}: {}", addr, e)))?;

        Ok(channel.into_stream())
    }

    async fn listen(&self, addr: &str) -> Result<RemoteListener> {
        if !self.is_connected() {
            return Err(MoleError::Disconnected);
        }

        let (host, port) = split_endpoint(addr)
            .ok_or_else(|| MoleError::ListenerFailure(format!("invalid address: {}", addr)))?;

        let (tx, rx) = mpsc::channel(16);
        self.routes.write().await.insert(port, tx);

        let forward = {
            let mut guard = self.session.write().await;
            let session = guard.as_mut().ok_or(MoleError::Disconnected)?;
            session.tcpip_forward(host, port).await
        };

        if let Err(e) = forward {
            self.routes.write().await.remove(&port);
            return Err(MoleError::ListenerFailure(format!(
                "remote bind {} refused: {}",
                addr, e
            )));
        }

        Ok(RemoteListener::new(rx))
    }

    async fn unlisten(&self, addr: &str) {
        if let Some((host, port)) = split_endpoint(addr) {
            self.routes.write().await.remove(&port);
            let mut guard = self.session.write().await;
            if let Some(session) = guard.as_mut() {
                let _ = session.cancel_tcpip_forward(host, port).await;
            }
        }
    }
}

/// Client-side russh handler: host key policy plus routing of
/// forwarded-tcpip channels back to the reverse strategies.
#[derive(Clone)]
pub struct ClientHandler {
    pinned_host_key: Option<PublicKey>,
    routes: ForwardRoutes,
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> impl std::future::Future<Output = std::result::Result<bool, Self::Error>> + Send {
        let pinned = self.pinned_host_key.clone();
        let presented = server_public_key.clone();

        async move {
            match pinned {
                Some(expected) => {
                    if expected.key_data() == presented.key_data() {
                        Ok(true)
                    } else {
                        tracing::error!("server host key does not match the pinned key");
                        Err(russh::Error::UnknownKey)
                    }
                }
                None => {
                    tracing::warn!(
                        "accepting unverified host key {}",
                        presented.fingerprint(russh::keys::ssh_key::HashAlg::Sha256)
                    );
                    Ok(true)
                }
            }
        }
    }

    fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> impl std::future::Future<Output = std::result::Result<(), Self::Error>> + Send {
        let connected_address = connected_address.to_string();
        let originator_address = originator_address.to_string();
        let routes = Arc::clone(&self.routes);

        async move {
            tracing::debug!(
                "forwarded connection from {}:{} to {}:{}",
                originator_address,
                originator_port,
                connected_address,
                connected_port
            );

            let tx = routes.read().await.get(&connected_port).cloned();
            match tx {
                Some(tx) => {
                    if tx.send(channel).await.is_err() {
                        tracing::warn!(
                            "no active listener for forwarded port {}, dropping connection",
                            connected_port
                        );
                    }
                }
                None => {
                    tracing::warn!(
                        "no forward registered for remote port {}, dropping connection",
                        connected_port
                    );
                }
            }
            Ok(())
        }
    }
}
