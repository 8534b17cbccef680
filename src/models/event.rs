use tokio::sync::broadcast;

/// State and log notifications emitted by the tunnel fabric.
///
/// Each variant has a fixed payload shape; subscribers match on the
/// variant rather than on handler signatures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Log(String),
    Error(String),
    ClientConnected(String),
    ClientDisconnected(String),
    TunnelEnabled(String),
    TunnelDisabled(String),
}

/// Best-effort, fire-and-forget notification bus.
///
/// Carries events outward only; components never block on it and a send
/// with no subscribers is not an error.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    pub fn emit(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    pub fn log(&self, msg: impl Into<String>) {
        self.emit(Event::Log(msg.into()));
    }

    pub fn error(&self, msg: impl Into<String>) {
        self.emit(Event::Error(msg.into()));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
