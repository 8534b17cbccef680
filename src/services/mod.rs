// Services module
pub mod approval;
pub mod bridge;
pub mod client;
pub mod config_service;
pub mod key_service;
pub mod pool;
pub mod server;
pub mod strategy;
pub mod tunnel;
