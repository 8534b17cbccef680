use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::models::{Direction, ForwardSpec};
use crate::services::client::Client;
use crate::services::key_service;
use crate::services::tunnel::Tunnel;
use crate::utils::error::{MoleError, Result};
use crate::utils::pfd::parse_port_forward_definition;

/// Config files are searched for in this order
pub const CONFIG_FILES: &[&str] = &[
    "./mole.yml",
    "~/.mole.yml",
    "~/.config/mole.yml",
    "~/.local/mole/mole.yml",
    "/etc/mole.yml",
];

/// One tunnel record. Either the `local_port`/`remote_port` pair or one of
/// the `L`/`R` shorthand definitions must be present.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TunnelEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_port: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_port: Option<String>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disabled: bool,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub reverse: bool,

    /// Local forward in SSH `-L` format
    #[serde(default, rename = "L", skip_serializing_if = "Option::is_none")]
    pub local_def: Option<String>,

    /// Reverse forward in SSH `-R` format
    #[serde(default, rename = "R", skip_serializing_if = "Option::is_none")]
    pub remote_def: Option<String>,
}

impl TunnelEntry {
    pub fn ports(local: impl Into<String>, remote: impl Into<String>) -> Self {
        Self {
            local_port: Some(local.into()),
            remote_port: Some(remote.into()),
            ..Self::default()
        }
    }

    /// Resolve this record into a forward spec
    pub fn to_spec(&self) -> Result<ForwardSpec> {
        let mut spec = if let Some(def) = &self.local_def {
            let (local, remote) = parse_port_forward_definition(def)?;
            ForwardSpec::local(local, remote)
        } else if let Some(def) = &self.remote_def {
            let (local, remote) = parse_port_forward_definition(def)?;
            ForwardSpec::reverse(local, remote)
        } else {
            match (&self.local_port, &self.remote_port) {
                (Some(local), Some(remote)) => {
                    let direction = if self.reverse {
                        Direction::Reverse
                    } else {
                        Direction::Local
                    };
                    ForwardSpec::new(direction, local, remote)
                }
                _ => {
                    return Err(MoleError::ConfigParse(
                        "tunnel entry needs local_port/remote_port or an L/R definition"
                            .to_string(),
                    ))
                }
            }
        };

        spec.enabled = !self.disabled;
        Ok(spec)
    }
}

/// One upstream server: its address, key material and tunnels. An entry
/// with address `"*"` supplies default keys for clients without their own.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientEntry {
    pub address: String,

    #[serde(default)]
    pub private: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public: Option<String>,

    /// Pinned host public key in authorized_keys wire form
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tunnels: Vec<TunnelEntry>,
}

/// The tunnel client configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientConfig {
    #[serde(skip)]
    pub filename: PathBuf,

    #[serde(default)]
    pub clients: Vec<ClientEntry>,
}

impl ClientConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let mut cfg: Self = serde_yaml::from_str(&content)
            .map_err(|e| MoleError::ConfigParse(format!("{}: {}", path.display(), e)))?;
        cfg.filename = path.to_path_buf();
        Ok(cfg)
    }

    pub fn save(&self) -> Result<()> {
        let content = serde_yaml::to_string(self)
            .map_err(|e| MoleError::ConfigParse(format!("failed to serialize config: {}", e)))?;
        std::fs::write(&self.filename, content)?;
        Ok(())
    }

    /// Fresh config with a generated default key pair
    pub fn generate() -> Result<Self> {
        let (public, private) = key_service::generate_keypair()?;
        Ok(Self {
            filename: PathBuf::new(),
            clients: vec![ClientEntry {
                address: "*".to_string(),
                private,
                public: Some(public),
                host: None,
                tunnels: Vec::new(),
            }],
        })
    }

    /// Key material for `addr`: the client's own entry when it carries a
    /// key, otherwise the `"*"` wildcard entry.
    pub fn keys_for(&self, addr: &str) -> Option<(&str, Option<&str>)> {
        let own = self
            .clients
            .iter()
            .find(|c| c.address == addr && !c.private.is_empty());
        let entry = own.or_else(|| {
            self.clients
                .iter()
                .find(|c| c.address == "*" && !c.private.is_empty())
        })?;

        let host = self
            .clients
            .iter()
            .find(|c| c.address == addr)
            .and_then(|c| c.host.as_deref());

        Some((&entry.private, host))
    }

    /// Build the configured clients with their tunnels. A client whose key
    /// fails to parse is skipped with a warning; malformed tunnel records
    /// are fatal.
    pub fn build_clients(&self) -> Result<Vec<Arc<Client>>> {
        let mut clients = Vec::new();

        for entry in &self.clients {
            if entry.address == "*" {
                continue;
            }

            let Some((key, host_key)) = self.keys_for(&entry.address) else {
                tracing::warn!("no key material for {}, skipping", entry.address);
                continue;
            };

            let mut client = match Client::new(&entry.address, key, host_key) {
                Ok(client) => client,
                Err(e) => {
                    tracing::warn!("skipping client {}: {}", entry.address, e);
                    continue;
                }
            };

            for record in &entry.tunnels {
                let spec = record.to_spec()?;
                client.add_tunnel(Tunnel::new(&entry.address, spec));
            }

            clients.push(Arc::new(client));
        }

        Ok(clients)
    }
}

/// The companion server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerConfig {
    #[serde(skip)]
    pub filename: PathBuf,

    #[serde(default = "default_listen_port")]
    pub listen_port: String,

    #[serde(default)]
    pub host_key: String,

    #[serde(default)]
    pub authorized_keys: Vec<String>,

    #[serde(default)]
    pub run_server: bool,

    #[serde(default)]
    pub interactive_uds: bool,
}

fn default_listen_port() -> String {
    ":8022".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            filename: PathBuf::new(),
            listen_port: default_listen_port(),
            host_key: String::new(),
            authorized_keys: Vec::new(),
            run_server: false,
            interactive_uds: false,
        }
    }
}

impl ServerConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let mut cfg: Self = serde_yaml::from_str(&content)
            .map_err(|e| MoleError::ConfigParse(format!("{}: {}", path.display(), e)))?;
        cfg.filename = path.to_path_buf();
        Ok(cfg)
    }

    pub fn save(&self) -> Result<()> {
        let content = serde_yaml::to_string(self)
            .map_err(|e| MoleError::ConfigParse(format!("failed to serialize config: {}", e)))?;
        std::fs::write(&self.filename, content)?;
        Ok(())
    }

    /// Fresh config with a generated host key
    pub fn generate() -> Result<Self> {
        let (_, host_key) = key_service::generate_keypair()?;
        Ok(Self {
            host_key,
            run_server: true,
            ..Self::default()
        })
    }

    /// Append a key in wire form to the authorized list
    pub fn add_authorized_key(&mut self, key: impl Into<String>) {
        self.authorized_keys.push(key.into());
    }
}

/// Find the first config file that exists, expanding `~`
pub fn find_config() -> Option<PathBuf> {
    for candidate in CONFIG_FILES {
        let path = expand_home(candidate);
        if path.exists() {
            return Some(path);
        }
    }
    None
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
