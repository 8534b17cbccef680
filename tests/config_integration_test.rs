use std::path::PathBuf;

use mole::models::Direction;
use mole::services::config_service::{ClientConfig, ClientEntry, ServerConfig, TunnelEntry};
use tempfile::TempDir;

#[test]
fn test_client_config_save_then_load_is_identity() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("mole.yml");

    let cfg = ClientConfig {
        filename: path.clone(),
        clients: vec![
            ClientEntry {
                address: "*".to_string(),
                private: "default-pem".to_string(),
                public: Some("ssh-rsa AAAA default".to_string()),
                ..ClientEntry::default()
            },
            ClientEntry {
                address: "example.com:8022".to_string(),
                private: "own-pem".to_string(),
                host: Some("ssh-rsa AAAA host".to_string()),
                tunnels: vec![
                    TunnelEntry::ports("9000", "80"),
                    TunnelEntry {
                        reverse: true,
                        disabled: true,
                        ..TunnelEntry::ports("3000", "8080")
                    },
                ],
                ..ClientEntry::default()
            },
        ],
    };

    cfg.save().unwrap();
    let loaded = ClientConfig::load(&path).unwrap();
    assert_eq!(loaded, cfg);

    // Saving what was loaded must be a fixed point.
    loaded.save().unwrap();
    assert_eq!(ClientConfig::load(&path).unwrap(), loaded);
}

#[test]
fn test_server_config_save_then_load_is_identity() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("moled.yml");

    let cfg = ServerConfig {
        filename: path.clone(),
        listen_port: ":8022".to_string(),
        host_key: "host-pem".to_string(),
        authorized_keys: vec![
            "ssh-rsa AAAA one".to_string(),
            "ssh-rsa AAAA two".to_string(),
        ],
        run_server: true,
        interactive_uds: true,
    };

    cfg.save().unwrap();
    let loaded = ServerConfig::load(&path).unwrap();
    assert_eq!(loaded, cfg);
}

#[test]
fn test_tunnel_shorthand_from_yaml() {
    let yaml = r#"
clients:
  - address: jump.example.com:8022
    private: pem
    tunnels:
      - L: "1234:localhost:4568"
      - R: "8080:localhost:3000"
      - local_port: "9000"
        remote_port: "80"
        disabled: true
"#;

    let cfg: ClientConfig = serde_yaml::from_str(yaml).unwrap();
    let tunnels = &cfg.clients[0].tunnels;

    let spec = tunnels[0].to_spec().unwrap();
    assert_eq!(spec.direction, Direction::Local);
    assert_eq!(spec.local, "localhost:4568");
    assert_eq!(spec.remote, "127.0.0.1:1234");

    let spec = tunnels[1].to_spec().unwrap();
    assert_eq!(spec.direction, Direction::Reverse);
    assert_eq!(spec.local, "localhost:3000");
    assert_eq!(spec.remote, "127.0.0.1:8080");

    let spec = tunnels[2].to_spec().unwrap();
    assert!(!spec.enabled);
}

#[test]
fn test_generated_client_config_carries_wildcard_keys() {
    let cfg = ClientConfig::generate().unwrap();
    assert_eq!(cfg.clients.len(), 1);
    assert_eq!(cfg.clients[0].address, "*");
    assert!(!cfg.clients[0].private.is_empty());
    assert!(cfg.clients[0]
        .public
        .as_deref()
        .unwrap()
        .starts_with("ssh-rsa "));

    // The wildcard entry backs any address.
    assert!(cfg.keys_for("anything:22").is_some());
}

#[test]
fn test_generated_server_config_defaults() {
    let cfg = ServerConfig::generate().unwrap();
    assert_eq!(cfg.listen_port, ":8022");
    assert!(cfg.run_server);
    assert!(!cfg.host_key.is_empty());
    assert!(cfg.authorized_keys.is_empty());
}

#[test]
fn test_load_rejects_malformed_yaml() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("mole.yml");
    std::fs::write(&path, "clients: [ oops").unwrap();

    assert!(ClientConfig::load(&path).is_err());
}

#[test]
fn test_build_clients_skips_bad_keys_but_keeps_good_ones() {
    let good_key = include_str!("data/test_ed25519");

    let cfg = ClientConfig {
        filename: PathBuf::new(),
        clients: vec![
            ClientEntry {
                address: "bad.example.com:22".to_string(),
                private: "not a key".to_string(),
                tunnels: vec![TunnelEntry::ports("9000", "80")],
                ..ClientEntry::default()
            },
            ClientEntry {
                address: "good.example.com:22".to_string(),
                private: good_key.to_string(),
                tunnels: vec![TunnelEntry::ports("9001", "81")],
                ..ClientEntry::default()
            },
        ],
    };

    let clients = cfg.build_clients().unwrap();
    assert_eq!(clients.len(), 1);
    assert_eq!(clients[0].address(), "good.example.com:22");
    assert_eq!(clients[0].tunnels().len(), 1);
}
