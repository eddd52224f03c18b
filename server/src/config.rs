use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Courier chat gateway
#[derive(Parser, Serialize, Deserialize, Clone, Debug)]
#[command(name = "courier-server", version, about = "Courier chat gateway")]
pub struct Config {
    /// Port to listen on
    #[arg(long, env = "COURIER_PORT", default_value = "8170")]
    pub port: u16,

    /// Bind address
    #[arg(long, env = "COURIER_BIND_ADDRESS", default_value = "0.0.0.0")]
    pub bind_address: String,

    /// Path to TOML config file
    #[arg(long, default_value = "./courier.toml")]
    pub config: String,

    /// Enable structured JSON logging (for Docker/production)
    #[arg(long, env = "COURIER_JSON_LOGS")]
    pub json_logs: bool,

    /// Output a commented TOML config template and exit
    #[arg(long)]
    pub generate_config: bool,

    /// Data directory for persistent state (DB, keys)
    #[arg(long, env = "COURIER_DATA_DIR", default_value = "./data")]
    pub data_dir: String,

    /// Redis URL for the presence/token cache
    #[arg(
        long,
        env = "COURIER_REDIS_URL",
        default_value = "redis://127.0.0.1:6379"
    )]
    pub redis_url: String,

    /// NATS URL for cross-process delivery. Empty disables the broker:
    /// the gateway runs single-process and remote routing degrades to
    /// history-only.
    #[arg(long, env = "COURIER_NATS_URL", default_value = "")]
    pub nats_url: String,

    /// Access token validity in seconds
    #[arg(long, env = "COURIER_ACCESS_TTL_SECS", default_value = "900")]
    pub access_ttl_secs: i64,

    /// Refresh token validity in seconds. Also the TTL of the cached
    /// token identifier that arbitrates single-active-session.
    #[arg(long, env = "COURIER_REFRESH_TTL_SECS", default_value = "604800")]
    pub refresh_ttl_secs: i64,

    /// TTL in seconds for cached message-history reads
    #[arg(long, env = "COURIER_HISTORY_CACHE_TTL_SECS", default_value = "30")]
    pub history_cache_ttl_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8170,
            bind_address: "0.0.0.0".to_string(),
            config: "./courier.toml".to_string(),
            json_logs: false,
            generate_config: false,
            data_dir: "./data".to_string(),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            nats_url: String::new(),
            access_ttl_secs: 900,
            refresh_ttl_secs: 604_800,
            history_cache_ttl_secs: 30,
        }
    }
}

impl Config {
    /// Load config with layered precedence:
    /// built-in defaults < TOML file < env vars (COURIER_*) < CLI args
    pub fn load() -> Result<Self, figment::Error> {
        let cli = Config::parse();
        let config_path = cli.config.clone();

        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_path))
            .merge(Env::prefixed("COURIER_"))
            .merge(Serialized::defaults(cli))
            .extract()
    }
}

/// Generate a commented TOML config template
pub fn generate_config_template() -> String {
    r#"# Courier Chat Gateway Configuration
# Place this file at ./courier.toml or specify with --config <path>
# All settings can be overridden via environment variables (COURIER_PORT, etc.)
# or CLI flags (--port, etc.)

# Server port (default: 8170)
# port = 8170

# Bind address (default: 0.0.0.0 — all interfaces)
# bind_address = "0.0.0.0"

# Enable structured JSON logging for Docker/production
# json_logs = false

# Data directory for SQLite database and JWT signing key
# data_dir = "./data"

# Redis URL for the presence/token cache.
# Required: holds the per-user refresh-token identifier that enforces
# single-active-session, plus short-TTL read-through caches.
# redis_url = "redis://127.0.0.1:6379"

# NATS URL for cross-process delivery. Leave empty to run a single
# gateway process; messages for receivers connected elsewhere are then
# dropped from the real-time path (history remains the durable record).
# nats_url = "nats://127.0.0.1:4222"

# Token lifetimes (seconds)
# access_ttl_secs = 900        # 15 minutes
# refresh_ttl_secs = 604800    # 7 days

# TTL for cached message-history reads (seconds)
# history_cache_ttl_secs = 30
"#
    .to_string()
}
