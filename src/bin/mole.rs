use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

use mole::models::{Event, EventBus};
use mole::services::client::Client;
use mole::services::config_service::{self, ClientConfig, ClientEntry, TunnelEntry};
use mole::services::pool::ConnPool;
use mole::utils::logger;
use mole::utils::pfd::parse_port_forward_definition;

/// mole - persistent SSH tunnel client
#[derive(Parser, Debug)]
#[command(name = "mole", version, about)]
struct Cli {
    /// The config file to use
    #[arg(short = 'c')]
    config: Option<PathBuf>,

    /// The address to connect to (ad-hoc tunnel)
    #[arg(short = 'a')]
    address: Option<String>,

    /// The local port
    #[arg(short = 'l')]
    local: Option<String>,

    /// The remote port
    #[arg(short = 'r')]
    remote: Option<String>,

    /// Make the ad-hoc tunnel a reverse forward
    #[arg(long)]
    reverse: bool,

    /// Identity file (private key) to use, or override config with
    #[arg(short = 'i')]
    identity: Option<PathBuf>,

    /// Local port forward in SSH format
    #[arg(short = 'L')]
    local_def: Option<String>,

    /// Remote port forward in SSH format
    #[arg(short = 'R')]
    remote_def: Option<String>,

    /// Generate a new config file to the given location
    #[arg(short = 'g')]
    generate: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    logger::init();
    let cli = Cli::parse();

    if let Some(path) = &cli.generate {
        generate_config(path);
    }

    let cfg = match build_config(&cli) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("ERROR: {}", e);
            std::process::exit(1);
        }
    };

    let scope = CancellationToken::new();
    let events = EventBus::new();
    spawn_event_logger(&events);

    let pool = ConnPool::new(scope.clone(), events.clone());
    if let Err(e) = pool.populate(&cfg).await {
        eprintln!("ERROR: {}", e);
        std::process::exit(1);
    }

    let clients = pool.clients().await;
    for client in &clients {
        let client = Arc::clone(client);
        let scope = scope.clone();
        let events = events.clone();
        tokio::spawn(async move {
            client.open_tunnels(scope, events).await;
        });
    }

    spawn_stats_dump(clients);
    spawn_signal_handler(scope.clone());

    tracing::info!("waiting for quit signal");
    scope.cancelled().await;
    // Give tasks a moment to close their sockets.
    tokio::time::sleep(Duration::from_millis(500)).await;
}

/// Resolve the CLI into a client config: an ad-hoc single tunnel when the
/// address and ports are given, otherwise a config file.
fn build_config(cli: &Cli) -> anyhow::Result<ClientConfig> {
    let mut local = cli.local.clone();
    let mut remote = cli.remote.clone();
    let mut reverse = cli.reverse;

    if let Some(def) = &cli.local_def {
        let (l, r) = parse_port_forward_definition(def)?;
        local = Some(l);
        remote = Some(r);
    } else if let Some(def) = &cli.remote_def {
        let (l, r) = parse_port_forward_definition(def)?;
        local = Some(l);
        remote = Some(r);
        reverse = true;
    }

    if let (Some(address), Some(local), Some(remote)) = (&cli.address, &local, &remote) {
        let keyfile = cli.identity.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_default()
                .join(".ssh")
                .join("id_rsa")
        });
        let private = std::fs::read_to_string(&keyfile)
            .with_context(|| format!("failed to read keyfile {}", keyfile.display()))?;
        tracing::info!("found keyfile at {}", keyfile.display());

        return Ok(ClientConfig {
            filename: PathBuf::new(),
            clients: vec![ClientEntry {
                address: address.clone(),
                private,
                tunnels: vec![TunnelEntry {
                    reverse,
                    ..TunnelEntry::ports(local.clone(), remote.clone())
                }],
                ..ClientEntry::default()
            }],
        });
    }

    let path = match &cli.config {
        Some(path) => path.clone(),
        None => match config_service::find_config() {
            Some(path) => path,
            None => {
                let path = PathBuf::from(config_service::CONFIG_FILES[0]);
                tracing::info!("config file not found, generating one at {}", path.display());
                let mut cfg = ClientConfig::generate()?;
                cfg.filename = path.clone();
                cfg.save()?;
                path
            }
        },
    };

    let mut cfg = ClientConfig::load(&path)?;

    // An explicit identity overrides whatever default keys the config has.
    if let Some(keyfile) = &cli.identity {
        let private = std::fs::read_to_string(keyfile)
            .with_context(|| format!("failed to read keyfile {}", keyfile.display()))?;
        tracing::info!("found keyfile at {}", keyfile.display());
        cfg.clients.insert(
            0,
            ClientEntry {
                address: "*".to_string(),
                private,
                ..ClientEntry::default()
            },
        );
    }

    Ok(cfg)
}

fn generate_config(path: &PathBuf) -> ! {
    if path.exists() {
        eprintln!("ERROR: file already exists at {}", path.display());
        std::process::exit(2);
    }

    let result = ClientConfig::generate().and_then(|mut cfg| {
        cfg.filename = path.clone();
        cfg.save()
    });

    match result {
        Ok(()) => {
            println!("New config file generated and saved to {}", path.display());
            std::process::exit(0);
        }
        Err(e) => {
            eprintln!("ERROR: {}", e);
            std::process::exit(1);
        }
    }
}

/// Watch the events and log the relevant ones
fn spawn_event_logger(events: &EventBus) {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(Event::Log(msg)) => tracing::info!("{}", msg),
                Ok(Event::Error(msg)) => tracing::error!("{}", msg),
                Ok(Event::ClientConnected(addr)) => tracing::info!("client {} connected", addr),
                Ok(Event::ClientDisconnected(addr)) => {
                    tracing::warn!("client {} disconnected", addr)
                }
                Ok(Event::TunnelEnabled(name)) => tracing::info!("tunnel {} enabled", name),
                Ok(Event::TunnelDisabled(name)) => tracing::info!("tunnel {} disabled", name),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

/// USR1 dumps the open tunnels to stdout
fn spawn_stats_dump(clients: Vec<Arc<Client>>) {
    tokio::spawn(async move {
        let mut usr1 = match signal(SignalKind::user_defined1()) {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!("failed to install SIGUSR1 handler: {}", e);
                return;
            }
        };

        while usr1.recv().await.is_some() {
            for client in &clients {
                for tunnel in client.tunnels() {
                    if tunnel.is_open() {
                        println!("{} {}", client.address(), tunnel.name());
                    }
                }
            }
        }
    });
}

/// Any of these signals does a graceful exit
fn spawn_signal_handler(scope: CancellationToken) {
    tokio::spawn(async move {
        let mut interrupt = signal(SignalKind::interrupt()).expect("signal handler");
        let mut hangup = signal(SignalKind::hangup()).expect("signal handler");
        let mut quit = signal(SignalKind::quit()).expect("signal handler");
        let mut terminate = signal(SignalKind::terminate()).expect("signal handler");

        tokio::select! {
            _ = interrupt.recv() => {}
            _ = hangup.recv() => {}
            _ = quit.recv() => {}
            _ = terminate.recv() => {}
        }
        scope.cancel();
    });
}
