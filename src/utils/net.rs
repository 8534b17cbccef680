//! Endpoint normalization helpers.

/// Normalize a port/endpoint string into `host:port` form.
///
/// A bare port `9000` and the shorthand `:9000` both become
/// `localhost:9000`; anything already carrying a host part is left
/// untouched. Normalization is idempotent.
pub fn normalize_endpoint(endpoint: &str) -> String {
    let endpoint = endpoint.trim();

    if endpoint.is_empty() {
        return endpoint.to_string();
    }

    if let Some(stripped) = endpoint.strip_prefix(':') {
        return format!("localhost:{}", stripped);
    }

    if endpoint.chars().all(|c| c.is_ascii_digit()) {
        return format!("localhost:{}", endpoint);
    }

    endpoint.to_string()
}

/// Split a normalized `host:port` endpoint into its parts.
///
/// The port is parsed as u32 to match the SSH wire protocol.
pub fn split_endpoint(endpoint: &str) -> Option<(String, u32)> {
    let (host, port) = endpoint.rsplit_once(':')?;
    let port = port.parse().ok()?;
    Some((host.to_string(), port))
}
