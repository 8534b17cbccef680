use serde::{Deserialize, Serialize};

use crate::utils::net::normalize_endpoint;

/// Direction of a forward relative to the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Direction {
    /// Listen locally, dial the remote end through the session (-L)
    #[default]
    Local,
    /// Listen on the remote host, dial locally (-R)
    Reverse,
}

/// A named forward: one local/remote port pair with a direction.
///
/// Endpoints are normalized on construction, so `9000` and `:9000`
/// both read back as `localhost:9000`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardSpec {
    pub direction: Direction,
    pub local: String,
    pub remote: String,
    pub enabled: bool,
}

impl ForwardSpec {
    pub fn new(direction: Direction, local: impl Into<String>, remote: impl Into<String>) -> Self {
        Self {
            direction,
            local: normalize_endpoint(&local.into()),
            remote: normalize_endpoint(&remote.into()),
            enabled: true,
        }
    }

    pub fn local(local: impl Into<String>, remote: impl Into<String>) -> Self {
        Self::new(Direction::Local, local, remote)
    }

    pub fn reverse(local: impl Into<String>, remote: impl Into<String>) -> Self {
        Self::new(Direction::Reverse, local, remote)
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Stable key used for lookups and log messages
    pub fn name(&self) -> String {
        format!("{}:{}", self.local, self.remote)
    }
}
