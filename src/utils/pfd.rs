//! SSH-style port forward definition parsing.

use crate::utils::error::{MoleError, Result};

/// Parse an SSH `-L`/`-R` style port forward definition and return the
/// `(local, remote)` address pair, adding `127.0.0.1` to ambiguous ports.
///
/// | Definition                | Local          | Remote         |
/// |---------------------------|----------------|----------------|
/// | `11:localhost:22`         | `localhost:22` | `127.0.0.1:11` |
/// | `0.0.0.0:11:localhost:22` | `localhost:22` | `0.0.0.0:11`   |
/// | `11:22`                   | `127.0.0.1:22` | `127.0.0.1:11` |
pub fn parse_port_forward_definition(def: &str) -> Result<(String, String)> {
    let bits: Vec<&str> = def.split(':').collect();

    match bits.len() {
        // bindIP:bindPort:host:port
        4 => {
            let mut remote = format!("{}:{}", bits[0], bits[1]);
            let local = format!("{}:{}", bits[2], bits[3]);
            if def.starts_with(':') {
                remote = format!("127.0.0.1{}", remote);
            }
            Ok((local, remote))
        }
        // bindPort:host:port
        3 => {
            let remote = format!("127.0.0.1:{}", bits[0]);
            let local = format!("{}:{}", bits[1], bits[2]);
            Ok((local, remote))
        }
        // bindPort:destPort
        2 => {
            let remote = format!("127.0.0.1:{}", bits[0]);
            let local = format!("127.0.0.1:{}", bits[1]);
            Ok((local, remote))
        }
        _ => Err(MoleError::ConfigParse(format!(
            "invalid port forward definition: {}",
            def
        ))),
    }
}
