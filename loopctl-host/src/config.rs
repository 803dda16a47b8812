//! Configuration for the host service.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use loopctl_core::bridge::BridgeOptions;
use loopctl_core::network::TransportOptions;
use loopctl_core::server::ServerOptions;
use loopctl_core::session::SessionOptions;

/// Environment variable overriding `network.listen_address`.
pub const ADDR_ENV: &str = "LOOPCTL_ADDR";

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub network: NetworkConfig,
    pub session: SessionConfig,
    pub event_loop: EventLoopConfig,
    pub workers: WorkersConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// `host:port` to accept control connections on.
    pub listen_address: String,
    pub max_connections: usize,
    /// Server keepalive Ping period.
    pub keepalive_interval_ms: u64,
    /// Silent intervals tolerated before a connection is dropped.
    pub keepalive_misses: u32,
    /// Frames buffered per connection before `BackpressureExceeded`.
    pub write_buffer_frames: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub reconnect_grace_period_ms: u64,
    /// Required in every Hello when non-empty.
    pub shared_token: String,
    /// Unanswered commands a session may have before admission refuses more.
    pub outbox_capacity: usize,
    pub retired_sessions_max: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventLoopConfig {
    pub queue_capacity: usize,
    pub tick_budget_ms: u64,
    /// Longest sleep of an idle GUI loop.
    pub idle_tick_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    pub worker_pool_size: usize,
    pub drain_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1:7300".into(),
            max_connections: 16,
            keepalive_interval_ms: 5_000,
            keepalive_misses: 3,
            write_buffer_frames: 256,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reconnect_grace_period_ms: 30_000,
            shared_token: String::new(),
            outbox_capacity: 256,
            retired_sessions_max: 4096,
        }
    }
}

impl Default for EventLoopConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            tick_budget_ms: 16,
            idle_tick_ms: 50,
        }
    }
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: 4,
            drain_timeout_ms: 5_000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl HostConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => Self::parse(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Write the default configuration to a file (for bootstrapping).
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let text = Self::default().to_toml().map_err(std::io::Error::other)?;
        std::fs::write(path, text)
    }

    /// Apply `LOOPCTL_ADDR` if it is set and non-empty.
    pub fn apply_env(&mut self) {
        self.apply_addr(std::env::var(ADDR_ENV).ok());
    }

    fn apply_addr(&mut self, addr: Option<String>) {
        if let Some(addr) = addr.filter(|a| !a.trim().is_empty()) {
            tracing::info!("{ADDR_ENV} overrides listen address: {addr}");
            self.network.listen_address = addr.trim().to_string();
        }
    }

    /// Convert into the core's runtime options, clamping nonsense values.
    pub fn to_server_options(&self) -> ServerOptions {
        let token = self.session.shared_token.trim();
        ServerOptions {
            listen_address: self.network.listen_address.clone(),
            transport: TransportOptions {
                max_connections: self.network.max_connections.max(1),
                keepalive_interval: Duration::from_millis(self.network.keepalive_interval_ms.max(100)),
                keepalive_misses: self.network.keepalive_misses.max(1),
                write_buffer_frames: self.network.write_buffer_frames.max(1),
            },
            session: SessionOptions {
                grace_period: Duration::from_millis(self.session.reconnect_grace_period_ms),
                outbox_capacity: self.session.outbox_capacity.max(1),
                retired_max: self.session.retired_sessions_max,
            },
            queue_capacity: self.event_loop.queue_capacity.max(1),
            bridge: BridgeOptions {
                tick_budget: Duration::from_millis(self.event_loop.tick_budget_ms.max(1)),
                drain_timeout: Duration::from_millis(self.workers.drain_timeout_ms),
            },
            worker_pool_size: self.workers.worker_pool_size.max(1),
            idle_tick: Duration::from_millis(self.event_loop.idle_tick_ms.max(1)),
            shared_token: (!token.is_empty()).then(|| token.to_string()),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_lists_every_option() {
        let text = HostConfig::default().to_toml().unwrap();
        for key in [
            "max_connections",
            "queue_capacity",
            "tick_budget_ms",
            "reconnect_grace_period_ms",
            "worker_pool_size",
            "keepalive_interval_ms",
        ] {
            assert!(text.contains(key), "missing {key}");
        }
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let cfg = HostConfig::parse(
            r#"
            [event_loop]
            queue_capacity = 10

            [session]
            shared_token = "abc"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.event_loop.queue_capacity, 10);
        assert_eq!(cfg.event_loop.tick_budget_ms, 16);
        assert_eq!(cfg.network.max_connections, 16);

        let options = cfg.to_server_options();
        assert_eq!(options.queue_capacity, 10);
        assert_eq!(options.shared_token.as_deref(), Some("abc"));
    }

    #[test]
    fn to_server_options_clamps() {
        let mut cfg = HostConfig::default();
        cfg.event_loop.queue_capacity = 0;
        cfg.workers.worker_pool_size = 0;
        cfg.network.keepalive_interval_ms = 1;
        let options = cfg.to_server_options();
        assert_eq!(options.queue_capacity, 1);
        assert_eq!(options.worker_pool_size, 1);
        assert_eq!(options.transport.keepalive_interval, Duration::from_millis(100));
        assert_eq!(options.shared_token, None);
    }

    #[test]
    fn address_override() {
        let mut cfg = HostConfig::default();
        cfg.apply_addr(Some("  ".into()));
        assert_eq!(cfg.network.listen_address, "127.0.0.1:7300");
        cfg.apply_addr(Some("0.0.0.0:9000".into()));
        assert_eq!(cfg.network.listen_address, "0.0.0.0:9000");
    }

    #[test]
    fn invalid_file_is_an_error() {
        assert!(HostConfig::parse("[event_loop]\nqueue_capacity = \"many\"").is_err());
    }
}
