//! Configuration handling for the tether demo peer.
//!
//! Settings come from an optional YAML file, overridden by environment
//! variables, overridden again by command-line flags in `main`.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};
use tether_session::wire::CodecKind;
use tether_session::PeerConfig;

/// Peer configuration as read from file and environment
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TetherConfig {
    /// Listen address, e.g. "0.0.0.0:9090"
    pub listen: Option<String>,
    /// Addresses to dial on startup
    pub connect: Vec<String>,
    /// Default body codec: "json" or "cbor"
    pub codec: String,
    /// Gzip level for outbound bodies (0 disables)
    pub gzip_level: u8,
    /// Per-packet read timeout in seconds (0 waits forever)
    pub read_timeout_secs: u64,
    /// Per-packet write timeout in seconds (0 waits forever)
    pub write_timeout_secs: u64,
    /// Exchanges slower than this many milliseconds log at warn
    pub slow_threshold_ms: u64,
    /// Render packet bodies in the operation log
    pub print_body: bool,
}

impl Default for TetherConfig {
    fn default() -> Self {
        Self {
            listen: None,
            connect: Vec::new(),
            codec: "json".to_string(),
            gzip_level: 0,
            read_timeout_secs: 0,
            write_timeout_secs: 0,
            slow_threshold_ms: 1000,
            print_body: false,
        }
    }
}

impl TetherConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();

        if let Ok(content) = std::fs::read_to_string(&config_path) {
            match serde_yaml::from_str::<TetherConfig>(&content) {
                Ok(parsed) => {
                    config = parsed;
                    info!("loaded configuration from {:?}", config_path.as_ref());
                }
                Err(e) => {
                    warn!(
                        "failed to parse config file {:?}: {}; using defaults",
                        config_path.as_ref(),
                        e
                    );
                }
            }
        }

        config.apply_environment_overrides();
        Ok(config)
    }

    /// Override fields from `TETHER_*` environment variables
    fn apply_environment_overrides(&mut self) {
        if let Ok(listen) = std::env::var("TETHER_LISTEN") {
            self.listen = Some(listen);
        }
        if let Ok(connect) = std::env::var("TETHER_CONNECT") {
            self.connect = connect.split(',').map(str::to_string).collect();
        }
        if let Ok(codec) = std::env::var("TETHER_CODEC") {
            self.codec = codec;
        }
        if let Ok(level) = std::env::var("TETHER_GZIP") {
            match level.parse() {
                Ok(level) => self.gzip_level = level,
                Err(_) => warn!("ignoring invalid TETHER_GZIP value {:?}", level),
            }
        }
        if let Ok(print_body) = std::env::var("TETHER_PRINT_BODY") {
            self.print_body = print_body == "1" || print_body.eq_ignore_ascii_case("true");
        }
    }

    /// Resolve into the session-layer peer configuration
    pub fn to_peer_config(&self) -> Result<PeerConfig> {
        let codec = CodecKind::from_name(&self.codec)
            .ok_or_else(|| anyhow::anyhow!("unknown codec {:?}", self.codec))?;
        let timeout = |secs: u64| {
            if secs == 0 {
                None
            } else {
                Some(Duration::from_secs(secs))
            }
        };
        Ok(PeerConfig {
            default_body_codec: codec,
            default_header_codec: codec,
            default_gzip_level: self.gzip_level,
            read_timeout: timeout(self.read_timeout_secs),
            write_timeout: timeout(self.write_timeout_secs),
            slow_threshold: Duration::from_millis(self.slow_threshold_ms),
            print_body: self.print_body,
            ..PeerConfig::default()
        })
    }
}
