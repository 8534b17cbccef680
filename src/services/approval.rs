use std::path::Path;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;

use crate::models::EventBus;
use crate::utils::error::{MoleError, Result};

/// Well-known socket the approver side listens on
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/moled.sock";

/// One pending key approval: who is asking and from where
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalRequest {
    pub user: String,
    pub remote: String,
}

/// Callback that asks a human to decide one approval request
pub type ApprovalFn = Arc<dyn Fn(ApprovalRequest) -> bool + Send + Sync>;

/// Ask the approver process to decide on a key. Any failure in the
/// conversation is a deny.
pub async fn request(path: &Path, user: &str, remote: &str) -> bool {
    match try_request(path, user, remote).await {
        Ok(allowed) => allowed,
        Err(e) => {
            tracing::warn!("approval request failed: {}", e);
            false
        }
    }
}

async fn try_request(path: &Path, user: &str, remote: &str) -> Result<bool> {
    let mut stream = UnixStream::connect(path)
        .await
        .map_err(|e| MoleError::UdsFailure(format!("connect {}: {}", path.display(), e)))?;

    let mut line = serde_json::to_string(&(user, remote))
        .map_err(|e| MoleError::UdsFailure(e.to_string()))?;
    line.push('\n');

    stream
        .write_all(line.as_bytes())
        .await
        .map_err(|e| MoleError::UdsFailure(e.to_string()))?;

    let mut answer = [0u8; 1];
    stream
        .read_exact(&mut answer)
        .await
        .map_err(|e| MoleError::UdsFailure(e.to_string()))?;

    Ok(answer[0] == b'y')
}

/// Run the approver side: accept connections, decode one request per
/// connection, put it to the prompt and write the one-byte verdict.
/// Errors close the connection and the accept loop continues.
pub async fn serve(
    scope: CancellationToken,
    path: &Path,
    prompt: ApprovalFn,
    events: &EventBus,
) -> Result<()> {
    // A previous run may have left the socket file behind.
    let _ = std::fs::remove_file(path);

    let listener = UnixListener::bind(path)
        .map_err(|e| MoleError::UdsFailure(format!("bind {}: {}", path.display(), e)))?;
    events.log(format!("approval socket listening at {}", path.display()));

    loop {
        tokio::select! {
            _ = scope.cancelled() => {
                let _ = std::fs::remove_file(path);
                return Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let prompt = Arc::clone(&prompt);
                    let scope = scope.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_conversation(scope, stream, prompt).await {
                            tracing::warn!("approval conversation failed: {}", e);
                        }
                    });
                }
                Err(e) => tracing::warn!("approval accept failed: {}", e),
            },
        }
    }
}

async fn handle_conversation(
    scope: CancellationToken,
    stream: UnixStream,
    prompt: ApprovalFn,
) -> Result<()> {
    let (read, mut write) = stream.into_split();

    let mut line = String::new();
    BufReader::new(read)
        .read_line(&mut line)
        .await
        .map_err(|e| MoleError::UdsFailure(e.to_string()))?;

    let (user, remote): (String, String) = serde_json::from_str(line.trim())
        .map_err(|e| MoleError::UdsFailure(format!("bad request: {}", e)))?;
    let request = ApprovalRequest { user, remote };

    // The prompt blocks on the terminal; a cancel racing it is a deny.
    let allowed = tokio::select! {
        _ = scope.cancelled() => false,
        res = tokio::task::spawn_blocking(move || prompt(request)) => res.unwrap_or(false),
    };

    write
        .write_all(if allowed { b"y" } else { b"n" })
        .await
        .map_err(|e| MoleError::UdsFailure(e.to_string()))?;

    Ok(())
}
