use std::env;

use clap::Parser;

pub const SAMPLE_PATH: &str = "samples"; // persisted uploads
pub const REPORT_PATH: &str = "reports"; // final analysis reports
pub const STATUS_PATH: &str = "status"; // live status snapshots for the websocket route
pub const LOG_PATH: &str = "logs"; // raw driver logs fetched from the guest

pub const VERSION: &str = "1.0.0";

/// Command line configuration. Hypervisor credentials come from the
/// environment instead (see [`ProxmoxConfig`]) so they never show up in
/// process listings.
#[derive(Parser, Debug, Clone)]
#[command(name = "amaterasu-api", about = "Dynamic malware analysis API")]
pub struct Config {
    /// API server port
    #[arg(long, default_value_t = 4000)]
    pub port: u16,

    /// Environment (development|staging|production)
    #[arg(long, default_value = "development", value_parser = ["development", "staging", "production"])]
    pub env: String,

    /// Maximum number of parallel analysis workers
    #[arg(long = "queueMaxWorkers", default_value_t = 10)]
    pub queue_max_workers: usize,

    /// Capacity of the pending-analysis queue
    #[arg(long = "queueCapacity", default_value_t = 100)]
    pub queue_capacity: usize,
}

/// Proxmox access read once at startup and immutable afterwards.
#[derive(Debug, Clone)]
pub struct ProxmoxConfig {
    pub url: String,
    pub token_id: String,
    pub token_secret: String,
    pub node: String,
}

impl ProxmoxConfig {
    pub fn from_env() -> Self {
        ProxmoxConfig {
            url: required("PROXMOX_URL"),
            token_id: required("PROXMOX_TOKEN_ID"),
            token_secret: required("PROXMOX_TOKEN_SECRET"),
            node: required("PROXMOX_NODE"),
        }
    }
}

fn required(name: &str) -> String {
    match env::var(name) {
        Ok(value) if !value.is_empty() => value,
        _ => panic!("{} must be set", name),
    }
}
