use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::models::EventBus;
use crate::services::client::Client;
use crate::services::config_service::ClientConfig;
use crate::utils::error::Result;

/// Address-keyed registry of clients. Reusing an already-connected client
/// saves a full SSH session per tunnel.
pub struct ConnPool {
    clients: Mutex<Vec<Arc<Client>>>,
    scope: CancellationToken,
    events: EventBus,
}

impl ConnPool {
    pub fn new(scope: CancellationToken, events: EventBus) -> Self {
        Self {
            clients: Mutex::new(Vec::new()),
            scope,
            events,
        }
    }

    /// Number of pooled clients
    pub async fn len(&self) -> usize {
        self.clients.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.lock().await.is_empty()
    }

    /// Snapshot of the pooled clients in insertion order
    pub async fn clients(&self) -> Vec<Arc<Client>> {
        self.clients.lock().await.clone()
    }

    /// Ensure a client for `addr` exists in the pool without connecting it.
    /// Key parse failures bubble up and leave no entry behind.
    pub async fn add_client(&self, addr: &str, key: &str, host_key: Option<&str>) -> Result<()> {
        let mut clients = self.clients.lock().await;
        if clients.iter().any(|cl| cl.address() == addr) {
            return Ok(());
        }

        let client = Client::new(addr, key, host_key)?;
        clients.push(Arc::new(client));
        Ok(())
    }

    /// Get the connected client for `addr`, creating and connecting one if
    /// needed. Blocks until the client reports ready or the scope dies.
    pub async fn get_client(
        &self,
        addr: &str,
        key: &str,
        host_key: Option<&str>,
    ) -> Result<Arc<Client>> {
        self.events.log(format!("looking up client for {}", addr));

        // Existence check and insert are atomic; the readiness wait is not
        // done under the pool lock.
        let client = {
            let mut clients = self.clients.lock().await;
            match clients.iter().find(|cl| cl.address() == addr) {
                Some(client) => Arc::clone(client),
                None => {
                    self.events
                        .log(format!("no client found, creating new client for {}", addr));
                    let client = Arc::new(Client::new(addr, key, host_key)?);
                    clients.push(Arc::clone(&client));
                    client
                }
            }
        };

        if !client.is_connected() {
            let supervisor = Arc::clone(&client);
            let scope = self.scope.clone();
            let events = self.events.clone();
            tokio::spawn(async move {
                supervisor.connect_with_scope(scope, events).await;
            });
        }

        tokio::select! {
            _ = self.scope.cancelled() => Err(crate::utils::error::MoleError::DialFailure(
                format!("scope cancelled while waiting for {}", addr),
            )),
            _ = client.wait_for_connect() => {
                self.events.log(format!("client for {} is connected", addr));
                Ok(client)
            }
        }
    }

    /// Pre-create an unconnected client, with its tunnels, for every
    /// config entry that has matching key material. Connection is deferred
    /// to `get_client` or the caller's `open_tunnels`.
    pub async fn populate(&self, cfg: &ClientConfig) -> Result<()> {
        let built = cfg.build_clients()?;
        let mut clients = self.clients.lock().await;
        for client in built {
            if clients.iter().any(|cl| cl.address() == client.address()) {
                continue;
            }
            clients.push(client);
        }
        Ok(())
    }
}
