use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// Copy bytes symmetrically between two duplex streams until either
/// direction reports EOF or an error, or the scope is cancelled.
///
/// Both endpoints are shut down exactly once before returning. A closed
/// peer is the normal way a bridge ends, so copy errors are logged and
/// never propagated.
pub async fn bridge<A, B>(scope: CancellationToken, a: A, b: B)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    {
        let up = tokio::io::copy(&mut a_read, &mut b_write);
        let down = tokio::io::copy(&mut b_read, &mut a_write);
        tokio::pin!(up);
        tokio::pin!(down);

        tokio::select! {
            res = &mut up => {
                if let Err(e) = res {
                    tracing::debug!("bridge copy ended: {}", e);
                }
            }
            res = &mut down => {
                if let Err(e) = res {
                    tracing::debug!("bridge copy ended: {}", e);
                }
            }
            _ = scope.cancelled() => {
                tracing::debug!("bridge cancelled");
            }
        }
    }

    let _ = a_write.shutdown().await;
    let _ = b_write.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_bridge_copies_both_directions() {
        let (mut probe, near) = tokio::io::duplex(1024);
        let (far, mut peer) = tokio::io::duplex(1024);

        let scope = CancellationToken::new();
        let task = tokio::spawn(bridge(scope.clone(), near, far));

        probe.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        peer.write_all(b"pong").await.unwrap();
        probe.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        drop(probe);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_bridge_returns_on_cancel() {
        let (_probe, near) = tokio::io::duplex(64);
        let (far, _peer) = tokio::io::duplex(64);

        let scope = CancellationToken::new();
        let task = tokio::spawn(bridge(scope.clone(), near, far));

        scope.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_bridge_propagates_eof() {
        let (probe, near) = tokio::io::duplex(64);
        let (far, mut peer) = tokio::io::duplex(64);

        let scope = CancellationToken::new();
        let task = tokio::spawn(bridge(scope.clone(), near, far));

        // Closing one side ends the bridge and shuts the other down.
        drop(probe);
        task.await.unwrap();

        let mut buf = [0u8; 1];
        assert_eq!(peer.read(&mut buf).await.unwrap(), 0);
    }
}
