use std::net::TcpListener as StdTcpListener;
use std::sync::Arc;
use std::time::Duration;

use mole::models::{EventBus, ForwardSpec};
use mole::services::approval::{self, ApprovalFn};
use mole::services::client::Client;
use mole::services::config_service::ServerConfig;
use mole::services::server::Server;
use mole::services::strategy::SshConn;
use mole::services::tunnel::Tunnel;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

const HOST_KEY: &str = include_str!("data/test_rsa_openssh");
const CLIENT_KEY: &str = include_str!("data/test_ed25519");
const CLIENT_PUB: &str = include_str!("data/test_ed25519.pub");
const STRANGER_KEY: &str = include_str!("data/test_rsa_pkcs1");

fn free_port() -> u16 {
    let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Echo everything back, one task per connection
async fn spawn_echo_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut read, mut write) = stream.split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
            });
        }
    });

    port
}

fn server_config(port: u16, authorized: &[&str]) -> ServerConfig {
    ServerConfig {
        listen_port: format!("127.0.0.1:{}", port),
        host_key: HOST_KEY.to_string(),
        authorized_keys: authorized.iter().map(|k| k.to_string()).collect(),
        run_server: true,
        ..ServerConfig::default()
    }
}

async fn start_server(cfg: ServerConfig, scope: &CancellationToken) -> Server {
    let server = Server::new(cfg, EventBus::new()).unwrap();
    {
        let server = server.clone();
        let scope = scope.clone();
        tokio::spawn(async move {
            server.run(scope).await;
        });
    }
    // Give the listener a moment to come up.
    tokio::time::sleep(Duration::from_millis(300)).await;
    server
}

async fn connected_client(addr: String, scope: &CancellationToken) -> Arc<Client> {
    let client = Arc::new(Client::new(addr, CLIENT_KEY, None).unwrap());
    {
        let client = Arc::clone(&client);
        let scope = scope.clone();
        tokio::spawn(async move {
            client.connect_with_scope(scope, EventBus::new()).await;
        });
    }
    tokio::time::timeout(Duration::from_secs(20), client.wait_for_connect())
        .await
        .expect("client should connect");
    client
}

#[tokio::test]
async fn test_local_forward_echoes_byte_for_byte() {
    let echo_port = spawn_echo_server().await;
    let server_port = free_port();
    let scope = CancellationToken::new();

    let _server = start_server(server_config(server_port, &[CLIENT_PUB]), &scope).await;
    let client = connected_client(format!("127.0.0.1:{}", server_port), &scope).await;

    let local_port = free_port();
    let tunnel = Tunnel::new(
        client.address(),
        ForwardSpec::local(
            format!("127.0.0.1:{}", local_port),
            format!("127.0.0.1:{}", echo_port),
        ),
    );

    let events = EventBus::new();
    tunnel
        .open(&scope, Arc::clone(&client) as Arc<dyn SshConn>, &events)
        .await
        .unwrap();
    assert!(tunnel.is_open());

    let mut probe = TcpStream::connect(("127.0.0.1", local_port)).await.unwrap();
    probe.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    probe.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    // A second connection through the same tunnel works too.
    let mut probe2 = TcpStream::connect(("127.0.0.1", local_port)).await.unwrap();
    probe2.write_all(b"pong").await.unwrap();
    probe2.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"pong");

    scope.cancel();
}

#[tokio::test]
async fn test_reverse_forward_echoes_byte_for_byte() {
    let echo_port = spawn_echo_server().await;
    let server_port = free_port();
    let scope = CancellationToken::new();

    let _server = start_server(server_config(server_port, &[CLIENT_PUB]), &scope).await;
    let client = connected_client(format!("127.0.0.1:{}", server_port), &scope).await;

    let remote_port = free_port();
    let tunnel = Tunnel::new(
        client.address(),
        ForwardSpec::reverse(
            format!("127.0.0.1:{}", echo_port),
            format!("127.0.0.1:{}", remote_port),
        ),
    );

    let events = EventBus::new();
    tunnel
        .open(&scope, Arc::clone(&client) as Arc<dyn SshConn>, &events)
        .await
        .unwrap();

    // The server end is now listening on the remote port; connections to
    // it come back through the session and reach the local echo service.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let mut probe = TcpStream::connect(("127.0.0.1", remote_port))
        .await
        .unwrap();
    probe.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    probe.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    scope.cancel();
}

#[tokio::test]
async fn test_unknown_key_is_denied() {
    let server_port = free_port();
    let scope = CancellationToken::new();

    let _server = start_server(server_config(server_port, &[CLIENT_PUB]), &scope).await;

    // STRANGER_KEY is not in the authorized list.
    let stranger = Client::new(format!("127.0.0.1:{}", server_port), STRANGER_KEY, None).unwrap();
    assert!(stranger.connect().await.is_err());

    scope.cancel();
}

#[tokio::test]
async fn test_uds_approval_grants_without_mutating_the_list() {
    let temp = TempDir::new().unwrap();
    let socket = temp.path().join("moled.sock");
    let server_port = free_port();
    let scope = CancellationToken::new();

    // Empty authorized list; the UDS approver is the only way in.
    let mut cfg = server_config(server_port, &[]);
    cfg.interactive_uds = true;

    let server = Server::new(cfg, EventBus::new())
        .unwrap()
        .with_socket_path(&socket);
    {
        let server = server.clone();
        let scope = scope.clone();
        tokio::spawn(async move {
            server.run(scope).await;
        });
    }

    let approver_scope = CancellationToken::new();
    {
        let approver_scope = approver_scope.clone();
        let socket = socket.clone();
        let prompt: ApprovalFn = Arc::new(|_| true);
        tokio::spawn(async move {
            let _ = approval::serve(approver_scope, &socket, prompt, &EventBus::new()).await;
        });
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    // Approver says yes: the session proceeds.
    let client = Client::new(format!("127.0.0.1:{}", server_port), CLIENT_KEY, None).unwrap();
    client.connect().await.unwrap();
    client.close().await;

    // Stop the approver. If the yes had been persisted to the list the
    // next attempt would succeed without it; instead it is denied again.
    approver_scope.cancel();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let again = Client::new(format!("127.0.0.1:{}", server_port), CLIENT_KEY, None).unwrap();
    assert!(again.connect().await.is_err());

    scope.cancel();
}

#[tokio::test]
async fn test_uds_approver_denial_blocks_the_session() {
    let temp = TempDir::new().unwrap();
    let socket = temp.path().join("moled.sock");
    let server_port = free_port();
    let scope = CancellationToken::new();

    let mut cfg = server_config(server_port, &[]);
    cfg.interactive_uds = true;

    let server = Server::new(cfg, EventBus::new())
        .unwrap()
        .with_socket_path(&socket);
    {
        let server = server.clone();
        let scope = scope.clone();
        tokio::spawn(async move {
            server.run(scope).await;
        });
    }

    {
        let scope = scope.clone();
        let socket = socket.clone();
        let prompt: ApprovalFn = Arc::new(|_| false);
        tokio::spawn(async move {
            let _ = approval::serve(scope, &socket, prompt, &EventBus::new()).await;
        });
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    let client = Client::new(format!("127.0.0.1:{}", server_port), CLIENT_KEY, None).unwrap();
    assert!(client.connect().await.is_err());

    scope.cancel();
}
