// ABOUTME: Typed engine configuration loaded from environment variables
// ABOUTME: Validates ports, intervals and limits before any component is constructed

pub mod constants;

use std::collections::HashMap;
use std::env;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use constants::*;

/// Default tools offered to agents when `CORRAL_TOOL_CATALOG` is unset
pub const DEFAULT_TOOL_CATALOG: &[&str] = &[
    "Bash", "Edit", "Glob", "Grep", "LS", "MultiEdit", "Read", "TodoWrite", "WebFetch",
    "WebSearch", "Write",
];

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },
    #[error("{name} is out of range ({value}); expected {expected}")]
    OutOfRange {
        name: &'static str,
        value: String,
        expected: &'static str,
    },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_origin: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SandboxConfig {
    pub image: String,
    pub memory_mb: u64,
    pub cpu_cores: f32,
    pub network_mode: String,
    pub working_dir: String,
    pub pull_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunnerConfig {
    pub agent_program: String,
    pub tool_catalog: Vec<String>,
    pub require_tools: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    pub heartbeat_interval: Duration,
    pub channel_size: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    pub health_check_interval: Duration,
    /// Zero disables idle reclamation
    pub idle_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WebhookConfig {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub server: ServerConfig,
    pub database_url: String,
    pub sandbox: SandboxConfig,
    pub runner: RunnerConfig,
    pub stream: StreamConfig,
    pub monitor: MonitorConfig,
    pub webhooks: WebhookConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        // An empty lookup only yields defaults, which are always valid
        Self::from_lookup(|_| None).unwrap_or_else(|_| unreachable!("defaults are valid"))
    }
}

impl EngineConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration from an explicit set of variables
    pub fn from_map(vars: &HashMap<String, String>) -> Result<Self> {
        Self::from_lookup(|name| vars.get(name).cloned())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars { lookup: &lookup };

        let port = match vars.get(CORRAL_PORT).or_else(|| vars.get(PORT)) {
            Some(raw) => raw.parse::<u16>().map_err(|_| ConfigError::InvalidValue {
                name: CORRAL_PORT,
                value: raw.clone(),
            })?,
            None => 4100,
        };
        if port == 0 {
            return Err(ConfigError::OutOfRange {
                name: CORRAL_PORT,
                value: port.to_string(),
                expected: "1-65535",
            });
        }

        let server = ServerConfig {
            host: vars
                .get(CORRAL_HOST)
                .unwrap_or_else(|| "127.0.0.1".to_string()),
            port,
            cors_origin: vars.get(CORRAL_CORS_ORIGIN),
        };

        let cpu_cores = vars.parse_or(CORRAL_SANDBOX_CPU_CORES, 2.0_f32)?;
        if !cpu_cores.is_finite() || cpu_cores <= 0.0 {
            return Err(ConfigError::OutOfRange {
                name: CORRAL_SANDBOX_CPU_CORES,
                value: cpu_cores.to_string(),
                expected: "a finite positive number",
            });
        }

        let sandbox = SandboxConfig {
            image: vars
                .get(CORRAL_SANDBOX_IMAGE)
                .unwrap_or_else(|| "ghcr.io/corral-dev/agent-sandbox:latest".to_string()),
            memory_mb: vars.parse_in_range(CORRAL_SANDBOX_MEMORY_MB, 2048, 128..=262_144, "128-262144")?,
            cpu_cores,
            network_mode: vars
                .get(CORRAL_SANDBOX_NETWORK_MODE)
                .unwrap_or_else(|| "bridge".to_string()),
            working_dir: vars
                .get(CORRAL_SANDBOX_WORKDIR)
                .unwrap_or_else(|| "/workspace".to_string()),
            pull_timeout: Duration::from_secs(vars.parse_in_range(
                CORRAL_IMAGE_PULL_TIMEOUT_SECONDS,
                600,
                1..=7200,
                "1-7200",
            )?),
        };

        let tool_catalog = match vars.get(CORRAL_TOOL_CATALOG) {
            Some(raw) => raw
                .split(',')
                .map(|tool| tool.trim().to_string())
                .filter(|tool| !tool.is_empty())
                .collect(),
            None => DEFAULT_TOOL_CATALOG.iter().map(|t| t.to_string()).collect(),
        };

        let runner = RunnerConfig {
            agent_program: vars
                .get(CORRAL_AGENT_PROGRAM)
                .unwrap_or_else(|| "claude".to_string()),
            tool_catalog,
            require_tools: vars.parse_or(CORRAL_REQUIRE_TOOLS, false)?,
        };

        let stream = StreamConfig {
            heartbeat_interval: Duration::from_secs(vars.parse_in_range(
                CORRAL_HEARTBEAT_INTERVAL_SECONDS,
                15,
                1..=3600,
                "1-3600",
            )?),
            channel_size: vars.parse_in_range(CORRAL_EVENT_CHANNEL_SIZE, 256, 16..=10_000, "16-10000")?,
        };

        let monitor = MonitorConfig {
            health_check_interval: Duration::from_secs(vars.parse_in_range(
                CORRAL_HEALTH_CHECK_INTERVAL_SECONDS,
                30,
                1..=86_400,
                "1-86400",
            )?),
            idle_timeout: Duration::from_secs(vars.parse_or(CORRAL_IDLE_TIMEOUT_SECONDS, 0)?),
        };

        let initial_backoff =
            Duration::from_millis(vars.parse_in_range(CORRAL_WEBHOOK_BACKOFF_MS, 500, 1..=600_000, "1-600000")?);
        let max_backoff = Duration::from_millis(vars.parse_in_range(
            CORRAL_WEBHOOK_MAX_BACKOFF_MS,
            30_000,
            1..=3_600_000,
            "1-3600000",
        )?);
        if max_backoff < initial_backoff {
            warn!(
                "{} is below {}; clamping to the initial backoff",
                CORRAL_WEBHOOK_MAX_BACKOFF_MS, CORRAL_WEBHOOK_BACKOFF_MS
            );
        }

        let webhooks = WebhookConfig {
            max_retries: vars.parse_in_range(CORRAL_WEBHOOK_MAX_RETRIES, 3, 0..=20, "0-20")?,
            initial_backoff,
            max_backoff: max_backoff.max(initial_backoff),
            request_timeout: Duration::from_secs(vars.parse_in_range(
                CORRAL_WEBHOOK_TIMEOUT_SECONDS,
                10,
                1..=300,
                "1-300",
            )?),
        };

        Ok(EngineConfig {
            server,
            database_url: vars
                .get(CORRAL_DATABASE_URL)
                .unwrap_or_else(|| "sqlite://corral.db".to_string()),
            sandbox,
            runner,
            stream,
            monitor,
            webhooks,
        })
    }
}

struct Vars<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> Vars<'_, F> {
    fn get(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn parse_or<T: std::str::FromStr>(&self, name: &'static str, default: T) -> Result<T> {
        match self.get(name) {
            Some(raw) => raw.parse::<T>().map_err(|_| ConfigError::InvalidValue {
                name,
                value: raw,
            }),
            None => Ok(default),
        }
    }

    fn parse_in_range<T>(
        &self,
        name: &'static str,
        default: T,
        range: std::ops::RangeInclusive<T>,
        expected: &'static str,
    ) -> Result<T>
    where
        T: std::str::FromStr + PartialOrd + ToString,
    {
        let value = self.parse_or(name, default)?;
        if !range.contains(&value) {
            return Err(ConfigError::OutOfRange {
                name,
                value: value.to_string(),
                expected,
            });
        }
        Ok(value)
    }
}
