//! Configuration loading and validation.

use crate::error::{ConfigError, Result};
use anyhow::Context as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level dispatchd configuration, assembled from a TOML file layered
/// with environment overrides (`DISPATCHD_*`).
#[derive(Debug, Clone)]
pub struct Config {
    /// Data directory: SQLite file, PID file, control socket, logs.
    pub data_dir: PathBuf,

    /// HTTP bind address for webhooks, REST, and the agent WebSocket endpoint.
    pub http_bind: std::net::SocketAddr,

    pub dispatcher: DispatcherConfig,
    pub channel: ChannelConfig,
    pub telemetry: TelemetryConfig,
    pub chat: ChatConfig,
    pub metrics: MetricsConfig,
}

/// Timing knobs for the Message Channel's reliable-delivery loop and the
/// Dispatcher's periodic tasks, read once at startup and held as a plain
/// owned value for the process lifetime — retuning requires a restart.
#[derive(Debug, Clone, Copy)]
pub struct DispatcherConfig {
    /// Dispatcher tick period (spec.md §4.5 `TICK`).
    pub tick: Duration,
    /// Idle job cleanup threshold (spec.md §4.5 `JOB_IDLE_MINUTES`).
    pub job_idle: Duration,
    /// Inactive agent eviction threshold (spec.md §4.5 `AGENT_INACTIVE_THRESHOLD`).
    pub agent_inactive_threshold: Duration,
    /// Default per-agent concurrent-job capacity (spec.md §9 generalization).
    pub default_agent_capacity: u32,
    /// Whether ACK-retry exhaustion auto-demotes the in-flight message back
    /// to QUEUED. spec.md §9 Open Question, default conservative `false`.
    pub auto_demote_on_ack_exhaustion: bool,
    /// How long a dispatcher sub-task lease is held before another
    /// coordinator process may claim it.
    pub lease_duration: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(5),
            job_idle: Duration::from_secs(30 * 60),
            agent_inactive_threshold: Duration::from_secs(5 * 60),
            default_agent_capacity: 1,
            auto_demote_on_ack_exhaustion: false,
            lease_duration: Duration::from_secs(15),
        }
    }
}

/// Message Channel reliable-delivery timing (spec.md §4.2).
#[derive(Debug, Clone, Copy)]
pub struct ChannelConfig {
    pub ack_timeout: Duration,
    pub max_retries: u32,
    pub retry_scan_interval: Duration,
    pub max_frame_bytes: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(30),
            max_retries: 5,
            retry_scan_interval: Duration::from_secs(10),
            max_frame_bytes: 1024 * 1024,
        }
    }
}

/// OpenTelemetry export configuration. Absent endpoint disables the layer
/// entirely rather than failing startup.
#[derive(Debug, Clone, Default)]
pub struct TelemetryConfig {
    pub otlp_endpoint: Option<String>,
    pub otlp_headers: std::collections::HashMap<String, String>,
    pub service_name: String,
    pub sample_rate: f64,
}

/// Chat Adapter credentials. Each field absent means that platform's adapter
/// is not started.
#[derive(Debug, Clone, Default)]
pub struct ChatConfig {
    pub slack_bot_token: Option<String>,
    pub slack_signing_secret: Option<String>,
    pub discord_bot_token: Option<String>,
    pub discord_public_key: Option<String>,
    /// Upstream HTTP call timeout for chat adapter posts/edits.
    pub upstream_timeout: Duration,
    /// This coordinator's webhook credentials belong to exactly one
    /// organization — spec.md's `hello`-frame org resolution is
    /// per-agent-connection, but inbound webhook events carry no org hint at
    /// all, so every event from this process's Slack/Discord app is
    /// attributed to this org. Required for the chat-event pump to start.
    pub default_org_id: Option<String>,
}

/// Prometheus `/metrics` exporter, behind the `metrics` cargo feature.
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub bind: String,
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: "127.0.0.1".to_string(),
            port: 9090,
        }
    }
}

impl Config {
    /// Load configuration from environment and an optional TOML file.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        } else if let Some(default_path) = Self::default_config_path()
            && default_path.exists()
        {
            builder = builder.add_source(config::File::from(default_path).required(false));
        }

        builder = builder.add_source(config::Environment::with_prefix("DISPATCHD").separator("__"));

        let raw = builder
            .build()
            .map_err(|error| ConfigError::Invalid(error.to_string()))?;

        let data_dir = raw
            .get_string("data_dir")
            .ok()
            .map(PathBuf::from)
            .unwrap_or_else(Self::default_data_dir);
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;

        let http_bind: std::net::SocketAddr = raw
            .get_string("http_bind")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(|| "0.0.0.0:8080".parse().unwrap());

        let telemetry = TelemetryConfig {
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
                .ok()
                .or_else(|| raw.get_string("telemetry.otlp_endpoint").ok()),
            otlp_headers: std::collections::HashMap::new(),
            service_name: raw
                .get_string("telemetry.service_name")
                .unwrap_or_else(|_| "dispatchd".to_string()),
            sample_rate: raw.get_float("telemetry.sample_rate").unwrap_or(1.0),
        };

        let chat = ChatConfig {
            slack_bot_token: std::env::var("SLACK_BOT_TOKEN").ok(),
            slack_signing_secret: std::env::var("SLACK_SIGNING_SECRET").ok(),
            discord_bot_token: std::env::var("DISCORD_BOT_TOKEN").ok(),
            discord_public_key: std::env::var("DISCORD_PUBLIC_KEY").ok(),
            upstream_timeout: Duration::from_secs(5),
            default_org_id: std::env::var("DISPATCHD_ORG_ID").ok(),
        };

        let metrics = MetricsConfig {
            enabled: raw.get_bool("metrics.enabled").unwrap_or(false),
            bind: raw
                .get_string("metrics.bind")
                .unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: raw
                .get_int("metrics.port")
                .ok()
                .and_then(|p| u16::try_from(p).ok())
                .unwrap_or(9090),
        };

        Ok(Self {
            data_dir,
            http_bind,
            dispatcher: DispatcherConfig::default(),
            channel: ChannelConfig::default(),
            telemetry,
            chat,
            metrics,
        })
    }

    fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .map(|d| d.join("dispatchd"))
            .unwrap_or_else(|| PathBuf::from("./data"))
    }

    fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("dispatchd").join("config.toml"))
    }

    pub fn default_instance_dir() -> PathBuf {
        Self::default_data_dir()
    }

    pub fn sqlite_path(&self) -> PathBuf {
        self.data_dir.join("dispatchd.db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatcher_defaults_match_spec_recommendations() {
        let config = DispatcherConfig::default();
        assert_eq!(config.tick, Duration::from_secs(5));
        assert_eq!(config.job_idle, Duration::from_secs(30 * 60));
        assert_eq!(config.agent_inactive_threshold, Duration::from_secs(5 * 60));
        assert_eq!(config.default_agent_capacity, 1);
        assert!(!config.auto_demote_on_ack_exhaustion);
    }

    #[test]
    fn channel_defaults_match_spec_recommendations() {
        let config = ChannelConfig::default();
        assert_eq!(config.ack_timeout, Duration::from_secs(30));
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.retry_scan_interval, Duration::from_secs(10));
        assert_eq!(config.max_frame_bytes, 1024 * 1024);
    }
}
