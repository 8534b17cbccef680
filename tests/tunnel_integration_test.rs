use std::net::TcpListener as StdTcpListener;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mole::models::{Event, EventBus, ForwardSpec};
use mole::services::strategy::{RemoteListener, SshConn};
use mole::services::tunnel::Tunnel;
use mole::utils::error::{MoleError, Result};
use russh::client::Msg;
use russh::ChannelStream;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

/// A session stub whose dials and listens always fail
struct DeadConn;

#[async_trait]
impl SshConn for DeadConn {
    async fn dial(&self, addr: &str) -> Result<ChannelStream<Msg>> {
        Err(MoleError::DialFailure(format!("no session for {}", addr)))
    }

    async fn listen(&self, addr: &str) -> Result<RemoteListener> {
        Err(MoleError::ListenerFailure(format!("no session for {}", addr)))
    }

    async fn unlisten(&self, _addr: &str) {}
}

fn free_port() -> u16 {
    let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn test_open_without_strategy_fails() {
    let tun = Tunnel::without_strategy("stub:22", ForwardSpec::local("9000", "80"));
    let scope = CancellationToken::new();

    let err = tun
        .open(&scope, Arc::new(DeadConn), &EventBus::new())
        .await
        .unwrap_err();
    assert!(matches!(err, MoleError::StrategyAbsent));
    assert!(!tun.is_open());
}

#[tokio::test]
async fn test_open_accepts_and_drops_on_dial_failure() {
    let port = free_port();
    let tun = Tunnel::new(
        "stub:22",
        ForwardSpec::local(format!("127.0.0.1:{}", port), "localhost:9"),
    );
    let scope = CancellationToken::new();
    let events = EventBus::new();

    tun.open(&scope, Arc::new(DeadConn), &events).await.unwrap();
    assert!(tun.is_open());

    // Opening again while open is a no-op success.
    tun.open(&scope, Arc::new(DeadConn), &events).await.unwrap();

    // The listener accepts but the dial through the dead session fails,
    // so the probe connection is closed straight away.
    let mut probe = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut buf = [0u8; 1];
    let n = probe.read(&mut buf).await.unwrap_or(0);
    assert_eq!(n, 0);

    tun.close().await;
    assert!(!tun.is_open());

    // The port is free again once the strategy has wound down.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let rebind = tokio::net::TcpListener::bind(("127.0.0.1", port)).await;
    assert!(rebind.is_ok());
}

#[tokio::test]
async fn test_open_reports_bind_failure() {
    let port = free_port();
    // Hold the port so the tunnel cannot bind it.
    let _occupier = tokio::net::TcpListener::bind(("127.0.0.1", port))
        .await
        .unwrap();

    let tun = Tunnel::new(
        "stub:22",
        ForwardSpec::local(format!("127.0.0.1:{}", port), "localhost:9"),
    );
    let scope = CancellationToken::new();

    let err = tun
        .open(&scope, Arc::new(DeadConn), &EventBus::new())
        .await
        .unwrap_err();
    assert!(matches!(err, MoleError::ListenerFailure(_)));
    assert!(!tun.is_open());
}

#[tokio::test]
async fn test_scope_cancel_closes_tunnel() {
    let port = free_port();
    let tun = Tunnel::new(
        "stub:22",
        ForwardSpec::local(format!("127.0.0.1:{}", port), "localhost:9"),
    );
    let scope = CancellationToken::new();
    let events = EventBus::new();
    let mut done = tun.done_signal();

    tun.open(&scope, Arc::new(DeadConn), &events).await.unwrap();
    assert!(tun.is_open());

    scope.cancel();
    tokio::time::timeout(Duration::from_secs(2), done.changed())
        .await
        .expect("strategy should complete after cancel")
        .unwrap();
    assert!(!tun.is_open());
}

#[tokio::test]
async fn test_keep_open_returns_on_cancel() {
    // Reverse direction against the dead stub: every open attempt fails,
    // keeping the supervision loop in its backoff path.
    let tun = Arc::new(Tunnel::new(
        "stub:22",
        ForwardSpec::reverse("localhost:9", "localhost:9"),
    ));
    let scope = CancellationToken::new();
    let events = EventBus::new();
    let mut rx = events.subscribe();

    let supervisor = {
        let tun = Arc::clone(&tun);
        let scope = scope.clone();
        let events = events.clone();
        tokio::spawn(async move {
            tun.keep_open(scope, Arc::new(DeadConn), &events).await;
        })
    };

    // The first failed open is reported before the backoff sleep.
    let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(event, Event::Error(_)));

    scope.cancel();
    tokio::time::timeout(Duration::from_secs(2), supervisor)
        .await
        .expect("keep_open should return once cancelled")
        .unwrap();
}
