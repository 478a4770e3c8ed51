use anyhow::{Context, Result};
use serde::Deserialize;
use std::str::FromStr;

pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";
pub const CONFIG_PATH_ENV: &str = "INSIGHTS_CONFIG";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub general: General,
    pub database: Database,
    pub server: Server,
    pub observability: Observability,
    pub materialization: Materialization,
    pub valuation: Valuation,
    pub search: Search,
}

#[derive(Debug, Clone, Deserialize)]
pub struct General {
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Database {
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Server {
    pub host: String,
    pub port: u16,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Observability {
    pub prometheus_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Materialization {
    pub default_preview_limit: usize,
    pub max_preview_limit: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Valuation {
    pub confidence_penalties: ConfidencePenalties,
    pub max_batch_symbols: usize,
}

/// Multiplier applied to confidence each time a soft degradation occurs.
/// 1.0 disables the penalty; values must stay in (0, 1].
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ConfidencePenalties {
    pub missing_base_inputs: f64,
    pub channel_out_of_range: f64,
}

impl Default for ConfidencePenalties {
    fn default() -> Self {
        Self {
            missing_base_inputs: 0.8,
            channel_out_of_range: 0.9,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Search {
    pub default_limit: usize,
    pub max_limit: usize,
    pub snippet_tokens: u32,
}

impl Config {
    /// Load from `$INSIGHTS_CONFIG`, falling back to `config/default.toml`.
    pub fn load() -> Result<Self> {
        let path =
            std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(&path)
    }

    pub fn load_from(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {path}"))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s).context("failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.server.port > 0, "server.port must be > 0");
        anyhow::ensure!(
            self.materialization.default_preview_limit > 0,
            "materialization.default_preview_limit must be > 0"
        );
        anyhow::ensure!(
            self.materialization.default_preview_limit <= self.materialization.max_preview_limit,
            "materialization.default_preview_limit must be <= max_preview_limit"
        );
        anyhow::ensure!(
            self.search.default_limit > 0 && self.search.default_limit <= self.search.max_limit,
            "search.default_limit must be in (0, search.max_limit]"
        );
        anyhow::ensure!(
            self.valuation.max_batch_symbols > 0,
            "valuation.max_batch_symbols must be > 0"
        );
        let p = &self.valuation.confidence_penalties;
        for (name, value) in [
            ("missing_base_inputs", p.missing_base_inputs),
            ("channel_out_of_range", p.channel_out_of_range),
        ] {
            anyhow::ensure!(
                value > 0.0 && value <= 1.0,
                "valuation.confidence_penalties.{name} must be in (0, 1]"
            );
        }
        Ok(())
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::from_toml_str(s)
    }
}
