use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::models::{Event, EventBus, ForwardSpec};
use crate::services::strategy::{ForwardStrategy, SshConn};
use crate::utils::error::{MoleError, Result};

/// Backoff between reopen attempts after a failed open
const REOPEN_BACKOFF: Duration = Duration::from_secs(1);

/// A named forward bound to one client address.
///
/// Owns its strategy and its open/closed state; `keep_open` supervises the
/// strategy and restarts it until the scope is cancelled.
pub struct Tunnel {
    address: String,
    spec: ForwardSpec,
    strategy: Option<ForwardStrategy>,
    enabled: AtomicBool,
    is_open: Arc<AtomicBool>,
    done: watch::Sender<()>,
    // Serializes open/close; holds the current invocation's scope
    current: Mutex<Option<CancellationToken>>,
}

impl Tunnel {
    /// Build a tunnel for `spec`, owned by the client at `address`.
    pub fn new(address: impl Into<String>, spec: ForwardSpec) -> Self {
        let strategy = ForwardStrategy::new(spec.direction, &spec.local, &spec.remote);
        let (done, _) = watch::channel(());

        Self {
            address: address.into(),
            enabled: AtomicBool::new(spec.enabled),
            strategy: Some(strategy),
            spec,
            is_open: Arc::new(AtomicBool::new(false)),
            done,
            current: Mutex::new(None),
        }
    }

    /// A tunnel with an empty strategy slot; `open` fails until one exists.
    pub fn without_strategy(address: impl Into<String>, spec: ForwardSpec) -> Self {
        let mut tun = Self::new(address, spec);
        tun.strategy = None;
        tun
    }

    /// Stable key, `"{local}:{remote}"` after normalization
    pub fn name(&self) -> String {
        self.spec.name()
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn spec(&self) -> &ForwardSpec {
        &self.spec
    }

    pub fn is_open(&self) -> bool {
        self.is_open.load(Ordering::SeqCst)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn enable(&self, events: &EventBus) {
        self.enabled.store(true, Ordering::SeqCst);
        events.emit(Event::TunnelEnabled(self.name()));
    }

    pub async fn disable(&self, events: &EventBus) {
        self.enabled.store(false, Ordering::SeqCst);
        self.close().await;
        events.emit(Event::TunnelDisabled(self.name()));
    }

    /// Fires once per strategy completion; subscribe before `open` to
    /// observe the invocation started by it.
    pub fn done_signal(&self) -> watch::Receiver<()> {
        self.done.subscribe()
    }

    /// Open the tunnel: bind the listening side and launch the strategy
    /// under a child scope. Idempotent while already open.
    pub async fn open(
        &self,
        scope: &CancellationToken,
        conn: Arc<dyn SshConn>,
        events: &EventBus,
    ) -> Result<()> {
        let mut current = self.current.lock().await;

        if self.is_open() {
            return Ok(());
        }

        let strategy = self.strategy.as_ref().ok_or(MoleError::StrategyAbsent)?;

        // Bind errors surface here and leave the tunnel closed.
        let bound = strategy.bind(conn.as_ref()).await?;

        let token = scope.child_token();
        *current = Some(token.clone());

        let name = self.name();
        let is_open = Arc::clone(&self.is_open);
        let done = self.done.clone();
        let events = events.clone();

        tokio::spawn(async move {
            let result = bound.serve(token, conn).await;
            is_open.store(false, Ordering::SeqCst);
            match result {
                Ok(()) => events.log(format!("tunnel {} was closed", name)),
                Err(e) => events.error(format!("tunnel {} failed: {}", name, e)),
            }
            done.send_replace(());
        });

        self.is_open.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Supervision loop: open the tunnel and reopen it on failure or
    /// completion until the scope is cancelled.
    pub async fn keep_open(
        &self,
        scope: CancellationToken,
        conn: Arc<dyn SshConn>,
        events: &EventBus,
    ) {
        loop {
            if scope.is_cancelled() {
                return;
            }

            let mut done = self.done_signal();

            match self.open(&scope, Arc::clone(&conn), events).await {
                Err(e) => {
                    events.error(format!(
                        "[{}] failed to open tunnel {}: {}",
                        self.address,
                        self.name(),
                        e
                    ));
                    tokio::select! {
                        _ = scope.cancelled() => return,
                        _ = tokio::time::sleep(REOPEN_BACKOFF) => {}
                    }
                }
                Ok(()) => {
                    events.log(format!("[{}] tunnel {} is open", self.address, self.name()));
                    tokio::select! {
                        _ = scope.cancelled() => return,
                        _ = done.changed() => {
                            events.log(format!(
                                "[{}] tunnel {} went down, reopening",
                                self.address,
                                self.name()
                            ));
                        }
                    }
                }
            }
        }
    }

    /// Close the current strategy invocation. Safe to call when already
    /// closed.
    pub async fn close(&self) {
        let mut current = self.current.lock().await;
        if let Some(token) = current.take() {
            token.cancel();
        }
        self.is_open.store(false, Ordering::SeqCst);
    }
}
