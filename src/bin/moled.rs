use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use dialoguer::Confirm;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

use mole::models::{Event, EventBus};
use mole::services::approval::{self, ApprovalFn, ApprovalRequest};
use mole::services::config_service::ServerConfig;
use mole::services::server::Server;
use mole::utils::logger;

/// moled - the mole tunnel server
#[derive(Parser, Debug)]
#[command(name = "moled", version, about)]
struct Cli {
    /// The config file to use
    #[arg(short = 'c', default_value = "./mole.yml")]
    config: PathBuf,

    /// Generate a new config file to the given location
    #[arg(short = 'g')]
    generate: Option<PathBuf>,

    /// The port to serve on
    #[arg(short = 'p')]
    port: Option<String>,

    /// Interactively accept connection requests (useful for setting up)
    #[arg(short = 'i')]
    interactive: bool,

    /// Run only the approval socket listener, no SSH server
    #[arg(short = 'I')]
    approver_only: bool,

    /// Approval socket path
    #[arg(long, default_value = approval::DEFAULT_SOCKET_PATH)]
    socket: PathBuf,
}

#[tokio::main]
async fn main() {
    logger::init();
    let cli = Cli::parse();

    if let Some(path) = &cli.generate {
        generate_config(path);
    }

    let scope = CancellationToken::new();
    let events = EventBus::new();
    spawn_event_logger(&events);
    spawn_signal_handler(scope.clone());

    if cli.approver_only {
        let result = approval::serve(scope.clone(), &cli.socket, terminal_prompt(), &events).await;
        if let Err(e) = result {
            eprintln!("ERROR: {}", e);
            std::process::exit(1);
        }
        return;
    }

    if !cli.config.exists() {
        tracing::info!("first run, generating new config");
        let generated = ServerConfig::generate().and_then(|mut cfg| {
            cfg.filename = cli.config.clone();
            cfg.save()
        });
        if let Err(e) = generated {
            eprintln!("ERROR: {}", e);
            std::process::exit(1);
        }
    }

    let mut cfg = match ServerConfig::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("ERROR: {}", e);
            std::process::exit(1);
        }
    };

    if let Some(port) = &cli.port {
        cfg.listen_port = normalize_port(port);
    }

    if !cfg.run_server {
        eprintln!("not running server, nothing to do...");
        std::process::exit(1);
    }

    let server = match Server::new(cfg, events.clone()) {
        Ok(server) => server.with_socket_path(&cli.socket),
        Err(e) => {
            eprintln!("ERROR: {}", e);
            std::process::exit(1);
        }
    };

    if cli.interactive {
        let server = server.clone();
        let scope = scope.clone();
        tokio::spawn(async move {
            server.enroll_interactively(scope, terminal_prompt()).await;
        });
    }

    {
        let server = server.clone();
        let scope = scope.clone();
        tokio::spawn(async move {
            server.run(scope).await;
        });
    }

    scope.cancelled().await;
    tokio::time::sleep(Duration::from_millis(500)).await;
}

/// Yes/no question on the controlling terminal, default no
fn terminal_prompt() -> ApprovalFn {
    Arc::new(|request: ApprovalRequest| {
        Confirm::new()
            .with_prompt(format!(
                "Allow {} from {} to connect?",
                request.user, request.remote
            ))
            .default(false)
            .interact()
            .unwrap_or(false)
    })
}

fn normalize_port(port: &str) -> String {
    if !port.starts_with(':') && !port.contains(':') {
        format!(":{}", port)
    } else {
        port.to_string()
    }
}

fn generate_config(path: &PathBuf) -> ! {
    if path.exists() {
        eprintln!("ERROR: file already exists at {}", path.display());
        std::process::exit(2);
    }

    let result = ServerConfig::generate().and_then(|mut cfg| {
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

fn spawn_event_logger(events: &EventBus) {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(Event::Log(msg)) => tracing::info!("{}", msg),
                Ok(Event::Error(msg)) => tracing::error!("{}", msg),
                Ok(event) => tracing::info!("{:?}", event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

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
