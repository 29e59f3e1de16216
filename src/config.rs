//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs. Every
//! section has defaults, so a missing file or a partial file is valid.
//! Secrets (the market-data API key) are referenced by env-var name in the
//! config and resolved at runtime.

use anyhow::{Context, Result};
use secrecy::SecretString;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub service: ServiceConfig,
    pub classifier: ClassifierConfig,
    pub extraction: ExtractionConfig,
    pub sandbox: SandboxConfig,
    pub jobs: JobsConfig,
    pub market_data: MarketDataConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    pub bind: String,
    pub port: u16,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "SCANLAB-001".to_string(),
            bind: "0.0.0.0".to_string(),
            port: 8088,
        }
    }
}

/// Heuristic thresholds for `SourceClassifier`. These were tuned against
/// sample files and are deliberately configurable.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Weighted signal count at or above which a source is multi-pattern.
    pub multi_signal_threshold: u32,
    /// Sources larger than this are treated as multi-pattern.
    pub large_file_bytes: usize,
    /// Conventional entry-point names, in priority order.
    pub entry_point_names: Vec<String>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            multi_signal_threshold: 2,
            large_file_bytes: 100_000,
            entry_point_names: ["main", "run_scan", "scan", "run", "run_scanner", "execute_scan"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ExtractionConfig {
    /// Name fragments marking a technical parameter as low-information.
    pub low_information_patterns: Vec<String>,
    /// Drop low-information technical parameters when trading filters exist.
    pub suppress_low_information: bool,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            low_information_patterns: ["rolling", "window", "span", "period", "length", "lookback"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            suppress_low_information: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SandboxConfig {
    pub timeout_secs: u64,
    /// Estimated working-set rows above which a range is chunked.
    pub row_ceiling: u64,
    /// Instruments returned per grouped-daily call.
    pub universe_size: u64,
    /// Calendar days searched backwards for the D-1 session.
    pub lookback_days: i64,
    /// Concurrent grouped-daily fetches per unit.
    pub fetch_concurrency: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            row_ceiling: 5_000_000,
            universe_size: 10_000,
            lookback_days: 5,
            fetch_concurrency: 8,
        }
    }
}

impl SandboxConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct JobsConfig {
    /// Worker pool size: jobs executing at once.
    pub max_concurrent: usize,
    /// Terminal jobs older than this are evicted by cleanup.
    pub retention_secs: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            retention_secs: 3600,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    GroupedHttp,
    Synthetic,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MarketDataConfig {
    pub provider: ProviderKind,
    pub base_url: String,
    pub api_key_env: String,
    /// Instrument scope used as the cache key prefix.
    pub scope: String,
    /// Instruments generated per day by the synthetic provider.
    pub synthetic_universe: usize,
}

impl Default for MarketDataConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Synthetic,
            base_url: "https://api.polygon.io".to_string(),
            api_key_env: "POLYGON_API_KEY".to_string(),
            scope: "us_stocks".to_string(),
            synthetic_universe: 200,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        let config: AppConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {path}"))?;
        Ok(config)
    }

    /// Load from `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Resolve an environment variable name to its value.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }

    /// The market-data API key, wrapped so it never lands in logs.
    pub fn market_data_api_key(&self) -> Result<SecretString> {
        Self::resolve_env(&self.market_data.api_key_env).map(SecretString::new)
    }
}
