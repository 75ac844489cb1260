use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use weft_common::base58;
use weft_common::frame::{MAX_PAYLOAD, PORT_SEND_OVERHEAD};

use crate::session::SessionConfig;
use crate::transport::{Connector, TcpConnector, TlsConnector};

/// CLI interface for the weft client.
#[derive(Parser)]
#[command(name = "weftc", about = "Weft Overlay Client")]
#[command(version)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Path to a custom configuration file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Relay node address override (host:port).
    #[arg(long, global = true)]
    pub relay: Option<String>,

    /// Increase log verbosity (repeat for more detail).
    #[arg(short = 'v', long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Write logs to a file instead of stderr.
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,
}

/// Available subcommands.
#[derive(Subcommand)]
pub enum Commands {
    /// Make one HTTP request through the overlay.
    Fetch {
        /// The http method (GET/POST/DELETE/PUT/OPTION).
        #[arg(long, default_value = "GET")]
        method: String,
        /// The http body that will be transferred.
        #[arg(long, default_value = "")]
        data: String,
        /// An http header to transfer, `name: value`. Repeatable.
        #[arg(long)]
        header: Vec<String>,
        /// The request URL, e.g. `http://myname.weft`.
        #[arg(long, default_value = "")]
        url: String,
        /// Write the response body to this file instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,
        /// Print connection details to stderr.
        #[arg(long)]
        verbose: bool,
    },
    /// Publish local TCP services and serve inbound overlay dials.
    Publish {
        /// Port specs of the form `<source>:<port>[:<mode>]` where mode
        /// is public, protected, or private (default public).
        #[arg(required = true)]
        ports: Vec<String>,
        /// Device (base58) admitted to every published port. Repeatable.
        #[arg(long)]
        allow: Vec<String>,
    },
}

/// Runtime configuration loaded from file, env, and defaults.
#[derive(Debug, Deserialize, Clone)]
pub struct ClientConfig {
    /// Relay node address, `host:port`.
    pub relay: String,
    /// Fleet contract address (base58) for the access predicate.
    pub fleet: String,
    /// Devices (base58) refused outright. Wins over the allowlist.
    #[serde(default)]
    pub blocklist: Vec<String>,
    /// Devices (base58) admitted when the blocklist is empty.
    #[serde(default)]
    pub allowlist: Vec<String>,
    /// Operation timeouts.
    pub timeouts: TimeoutConfig,
    /// Reconnection backoff settings.
    pub reconnect: ReconnectConfig,
    /// Block follower settings.
    pub chain: ChainConfig,
    /// TLS settings for the node transport.
    pub tls: TlsConfig,
    /// Metrics recording toggle.
    pub metrics: MetricsConfig,
}

/// Operation timeouts, in milliseconds.
#[derive(Debug, Deserialize, Clone)]
pub struct TimeoutConfig {
    /// Dialing the node (TCP + handshake).
    pub connect_ms: u64,
    /// Dialing the local published service for an inbound open.
    pub dial_ms: u64,
    /// Enqueues into bounded queues and response slots.
    pub enqueue_ms: u64,
}

/// Reconnect backoff parameters.
#[derive(Debug, Deserialize, Clone)]
pub struct ReconnectConfig {
    /// Initial delay before the first reconnect attempt, in milliseconds.
    pub initial_delay_ms: u64,
    /// Maximum delay between reconnect attempts, in milliseconds.
    pub max_delay_ms: u64,
    /// Multiplier applied to the delay after each failed attempt.
    pub backoff_factor: f64,
    /// Attempts before the session gives up and closes.
    pub max_attempts: u32,
}

/// Block follower parameters.
#[derive(Debug, Deserialize, Clone)]
pub struct ChainConfig {
    /// Seconds between follower ticks.
    pub tick_secs: u64,
    /// Only ingest headers at most `peak - confirmations`.
    pub confirmations: u64,
    /// Wire bytes between traffic tickets; 0 disables ticketing.
    pub ticket_bytes: u64,
}

/// TLS transport settings.
#[derive(Debug, Deserialize, Clone)]
pub struct TlsConfig {
    /// Whether to wrap the node transport in TLS.
    pub enabled: bool,
    /// PEM bundle of trusted CA certificates.
    #[serde(default)]
    pub ca_file: Option<PathBuf>,
    /// Server name to verify the node certificate against.
    #[serde(default)]
    pub domain: String,
}

/// Metrics toggle.
#[derive(Debug, Deserialize, Clone)]
pub struct MetricsConfig {
    /// Record latency histograms and byte counters.
    pub enabled: bool,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_ms: 5000,
            dial_ms: 3000,
            enqueue_ms: 100,
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 100,
            max_delay_ms: 30000,
            backoff_factor: 2.0,
            max_attempts: 10,
        }
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            tick_secs: 15,
            confirmations: 6,
            ticket_bytes: 1024 * 1024,
        }
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ca_file: None,
            domain: String::new(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: false }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay: "eu1.nodes.weft:41046".to_string(),
            fleet: base58::encode(&[0u8; 20]),
            blocklist: Vec::new(),
            allowlist: Vec::new(),
            timeouts: TimeoutConfig::default(),
            reconnect: ReconnectConfig::default(),
            chain: ChainConfig::default(),
            tls: TlsConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Validates the configuration values are within acceptable bounds.
    /// Returns Ok(()) if valid, Err with description otherwise.
    pub fn validate(&self) -> Result<(), String> {
        if self.relay.is_empty() {
            return Err("relay address must not be empty".to_string());
        }
        if !self.relay.contains(':') {
            return Err(format!("relay address must be host:port, got: {}", self.relay));
        }

        base58::decode_device(&self.fleet)
            .map_err(|e| format!("fleet address is not a valid base58 address: {e}"))?;
        for entry in self.blocklist.iter().chain(self.allowlist.iter()) {
            base58::decode_device(entry)
                .map_err(|e| format!("device id {entry:?} is invalid: {e}"))?;
        }

        if self.timeouts.connect_ms == 0 || self.timeouts.dial_ms == 0 {
            return Err("timeouts must be greater than 0".to_string());
        }
        if self.timeouts.enqueue_ms == 0 {
            return Err("timeouts.enqueue_ms must be greater than 0".to_string());
        }

        if self.reconnect.initial_delay_ms == 0 {
            return Err("reconnect.initial_delay_ms must be greater than 0".to_string());
        }
        if self.reconnect.max_delay_ms < self.reconnect.initial_delay_ms {
            return Err("reconnect.max_delay_ms must be >= initial_delay_ms".to_string());
        }
        if !self.reconnect.backoff_factor.is_finite() || self.reconnect.backoff_factor <= 0.0 {
            return Err(
                "reconnect.backoff_factor must be a finite number greater than 0".to_string(),
            );
        }
        if self.reconnect.max_attempts == 0 {
            return Err("reconnect.max_attempts must be greater than 0".to_string());
        }

        if self.chain.tick_secs == 0 {
            return Err("chain.tick_secs must be greater than 0".to_string());
        }

        if self.tls.enabled {
            if self.tls.ca_file.is_none() {
                return Err("tls.ca_file is required when tls is enabled".to_string());
            }
            if self.tls.domain.is_empty() {
                return Err("tls.domain is required when tls is enabled".to_string());
            }
        }

        Ok(())
    }

    /// Resolves the textual config into a [`SessionConfig`].
    ///
    /// # Errors
    ///
    /// Returns an error when a device id or the fleet address does not
    /// decode.
    pub fn session_config(&self) -> anyhow::Result<SessionConfig> {
        let fleet = base58::decode_device(&self.fleet)
            .map_err(|e| anyhow::anyhow!("invalid fleet address: {e}"))?;
        let decode_all = |entries: &[String]| -> anyhow::Result<_> {
            entries
                .iter()
                .map(|entry| {
                    base58::decode_device(entry)
                        .map_err(|e| anyhow::anyhow!("invalid device id {entry:?}: {e}"))
                })
                .collect()
        };
        Ok(SessionConfig {
            fleet,
            blocklist: decode_all(&self.blocklist)?,
            allowlist: decode_all(&self.allowlist)?,
            dial_timeout: Duration::from_millis(self.timeouts.dial_ms),
            enqueue_timeout: Duration::from_millis(self.timeouts.enqueue_ms),
            reconnect_initial: Duration::from_millis(self.reconnect.initial_delay_ms),
            reconnect_max: Duration::from_millis(self.reconnect.max_delay_ms),
            reconnect_factor: self.reconnect.backoff_factor,
            max_reconnect_attempts: self.reconnect.max_attempts,
            block_tick: Duration::from_secs(self.chain.tick_secs),
            confirmations: self.chain.confirmations,
            ticket_bytes: self.chain.ticket_bytes,
            chunk_limit: MAX_PAYLOAD - PORT_SEND_OVERHEAD,
            enable_metrics: self.metrics.enabled,
        })
    }

    /// Builds the node connector described by this config.
    ///
    /// # Errors
    ///
    /// Returns an error when the TLS CA bundle cannot be loaded.
    pub fn connector(&self) -> anyhow::Result<Box<dyn Connector>> {
        let timeout = Duration::from_millis(self.timeouts.connect_ms);
        if self.tls.enabled {
            let ca_file = self
                .tls
                .ca_file
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("tls.ca_file is required when tls is enabled"))?;
            let connector =
                TlsConnector::new(self.relay.clone(), &self.tls.domain, ca_file, timeout)?;
            Ok(Box::new(connector))
        } else {
            Ok(Box::new(TcpConnector::new(self.relay.clone(), timeout)))
        }
    }
}

/// # Errors
///
/// Returns an error if the configuration file cannot be read or parsed.
#[allow(clippy::cast_possible_wrap)]
pub fn load_config(path: Option<&Path>) -> anyhow::Result<ClientConfig> {
    let defaults = ClientConfig::default();
    let mut builder = config::Config::builder()
        .set_default("relay", defaults.relay.as_str())?
        .set_default("fleet", defaults.fleet.as_str())?
        .set_default("blocklist", Vec::<String>::new())?
        .set_default("allowlist", Vec::<String>::new())?
        .set_default("timeouts.connect_ms", defaults.timeouts.connect_ms as i64)?
        .set_default("timeouts.dial_ms", defaults.timeouts.dial_ms as i64)?
        .set_default("timeouts.enqueue_ms", defaults.timeouts.enqueue_ms as i64)?
        .set_default(
            "reconnect.initial_delay_ms",
            defaults.reconnect.initial_delay_ms as i64,
        )?
        .set_default(
            "reconnect.max_delay_ms",
            defaults.reconnect.max_delay_ms as i64,
        )?
        .set_default(
            "reconnect.backoff_factor",
            defaults.reconnect.backoff_factor,
        )?
        .set_default(
            "reconnect.max_attempts",
            i64::from(defaults.reconnect.max_attempts),
        )?
        .set_default("chain.tick_secs", defaults.chain.tick_secs as i64)?
        .set_default("chain.confirmations", defaults.chain.confirmations as i64)?
        .set_default("chain.ticket_bytes", defaults.chain.ticket_bytes as i64)?
        .set_default("tls.enabled", defaults.tls.enabled)?
        .set_default("tls.domain", defaults.tls.domain.as_str())?
        .set_default("metrics.enabled", defaults.metrics.enabled)?;

    if let Some(config_path) = path {
        if config_path.exists() {
            builder = builder.add_source(config::File::from(config_path));
        }
    } else {
        // Check platform-native config dir first, then fall back to
        // ~/.config/weftc/ (installers use ~/.config/ even on macOS)
        let native_path = dirs::config_dir().map(|d| d.join("weftc").join("config.toml"));
        let xdg_path = dirs::home_dir().map(|d| d.join(".config").join("weftc").join("config.toml"));

        let resolved = native_path
            .filter(|p| p.exists())
            .or_else(|| xdg_path.filter(|p| p.exists()));

        if let Some(config_path) = resolved {
            builder = builder.add_source(config::File::from(config_path));
        }
    }

    builder = builder.add_source(config::Environment::with_prefix("WEFTC").separator("_"));

    let settings = builder.build()?;
    let config: ClientConfig = settings.try_deserialize()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::field_reassign_with_default)]
    use super::*;

    #[test]
    fn test_client_config_default_has_expected_values() {
        let config = ClientConfig::default();

        assert_eq!(config.relay, "eu1.nodes.weft:41046");
        assert!(config.blocklist.is_empty());
        assert!(!config.tls.enabled);
    }

    #[test]
    fn test_load_config_with_no_file_returns_defaults() {
        let config = load_config(Some(std::path::Path::new("/nonexistent/config.toml")))
            .expect("load_config should succeed with no file");

        assert_eq!(config.relay, "eu1.nodes.weft:41046");
        assert_eq!(config.timeouts.enqueue_ms, 100);
    }

    #[test]
    fn test_default_config_passes_validation() {
        let config = ClientConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_relay() {
        let mut config = ClientConfig::default();
        config.relay = String::new();
        assert!(config
            .validate()
            .unwrap_err()
            .contains("relay address must not be empty"));
    }

    #[test]
    fn test_validate_rejects_relay_without_port() {
        let mut config = ClientConfig::default();
        config.relay = "eu1.nodes.weft".to_string();
        assert!(config.validate().unwrap_err().contains("host:port"));
    }

    #[test]
    fn test_validate_rejects_bad_fleet_address() {
        let mut config = ClientConfig::default();
        config.fleet = "not-base58-0OIl".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_blocklist_entry() {
        let mut config = ClientConfig::default();
        config.blocklist = vec!["short".to_string()];
        assert!(config.validate().unwrap_err().contains("invalid"));
    }

    #[test]
    fn test_validate_rejects_zero_initial_delay() {
        let mut config = ClientConfig::default();
        config.reconnect.initial_delay_ms = 0;
        assert!(config.validate().unwrap_err().contains("initial_delay_ms"));
    }

    #[test]
    fn test_validate_rejects_max_delay_less_than_initial() {
        let mut config = ClientConfig::default();
        config.reconnect.initial_delay_ms = 1000;
        config.reconnect.max_delay_ms = 500;
        assert!(config.validate().unwrap_err().contains("max_delay_ms"));
    }

    #[test]
    fn test_validate_rejects_zero_backoff_factor() {
        let mut config = ClientConfig::default();
        config.reconnect.backoff_factor = 0.0;
        assert!(config.validate().unwrap_err().contains("backoff_factor"));
    }

    #[test]
    fn test_validate_rejects_tls_without_ca() {
        let mut config = ClientConfig::default();
        config.tls.enabled = true;
        config.tls.domain = "nodes.weft".to_string();
        assert!(config.validate().unwrap_err().contains("ca_file"));
    }

    #[test]
    fn test_session_config_decodes_device_lists() {
        let device = [0x55u8; 20];
        let mut config = ClientConfig::default();
        config.blocklist = vec![base58::encode(&device)];

        let session_config = config.session_config().unwrap();
        assert!(session_config.blocklist.contains(&device));
        assert!(session_config.allowlist.is_empty());
    }

    #[test]
    fn test_session_config_rejects_bad_device() {
        let mut config = ClientConfig::default();
        config.allowlist = vec!["bogus".to_string()];
        assert!(config.session_config().is_err());
    }
}
