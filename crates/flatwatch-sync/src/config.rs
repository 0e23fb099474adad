use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use flatwatch_adapters::DEFAULT_FILTER_API_BASE_URL;
use flatwatch_storage::{FlapPolicy, HttpClientConfig};
use serde::{Deserialize, Serialize};

use crate::reconcile::Thresholds;

/// Deployment environment; selects snapshot file names and the subscription set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvType {
    #[default]
    Dev,
    Test,
    Prod,
}

impl EnvType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dev => "dev",
            Self::Test => "test",
            Self::Prod => "prod",
        }
    }
}

impl fmt::Display for EnvType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnvType {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "dev" => Ok(Self::Dev),
            "test" => Ok(Self::Test),
            "prod" => Ok(Self::Prod),
            other => bail!("unknown environment {other:?} (expected dev, test or prod)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub storage_dir: PathBuf,
    pub env: EnvType,
    pub registry_path: PathBuf,
    pub api_base_url: String,
    pub poll_interval: Duration,
    pub max_concurrent_segments: usize,
    pub http_timeout: Duration,
    pub user_agent: Option<String>,
    pub shutdown_grace: Duration,
    pub delivery_queue_capacity: usize,
    pub price_drop_percent: u8,
    pub extreme_price_drop_percent: u8,
    pub web_port: u16,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from("./data"),
            env: EnvType::Dev,
            registry_path: PathBuf::from("./segments.yaml"),
            api_base_url: DEFAULT_FILTER_API_BASE_URL.to_string(),
            poll_interval: Duration::from_secs(60),
            max_concurrent_segments: 10,
            http_timeout: Duration::from_secs(20),
            user_agent: None,
            shutdown_grace: Duration::from_secs(10),
            delivery_queue_capacity: 1024,
            price_drop_percent: 15,
            extreme_price_drop_percent: 20,
            web_port: 8000,
        }
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|err| anyhow::anyhow!("{err}"))
            .with_context(|| format!("parsing {key}={raw:?}")),
        _ => Ok(default),
    }
}

impl WatchConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolves the configuration from an arbitrary key lookup; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            storage_dir: lookup("FLATWATCH_STORAGE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.storage_dir),
            env: parse_var(&lookup, "FLATWATCH_ENV", defaults.env)?,
            registry_path: lookup("FLATWATCH_REGISTRY")
                .map(PathBuf::from)
                .unwrap_or(defaults.registry_path),
            api_base_url: lookup("FLATWATCH_API_BASE_URL").unwrap_or(defaults.api_base_url),
            poll_interval: Duration::from_secs(parse_var(
                &lookup,
                "FLATWATCH_POLL_INTERVAL_SECS",
                defaults.poll_interval.as_secs(),
            )?),
            max_concurrent_segments: parse_var(
                &lookup,
                "FLATWATCH_MAX_CONCURRENT_SEGMENTS",
                defaults.max_concurrent_segments,
            )?,
            http_timeout: Duration::from_secs(parse_var(
                &lookup,
                "FLATWATCH_HTTP_TIMEOUT_SECS",
                defaults.http_timeout.as_secs(),
            )?),
            user_agent: lookup("FLATWATCH_USER_AGENT").filter(|ua| !ua.trim().is_empty()),
            shutdown_grace: Duration::from_secs(parse_var(
                &lookup,
                "FLATWATCH_SHUTDOWN_GRACE_SECS",
                defaults.shutdown_grace.as_secs(),
            )?),
            delivery_queue_capacity: parse_var(
                &lookup,
                "FLATWATCH_DELIVERY_QUEUE_CAPACITY",
                defaults.delivery_queue_capacity,
            )?,
            price_drop_percent: parse_var(
                &lookup,
                "FLATWATCH_PRICE_DROP_PERCENT",
                defaults.price_drop_percent,
            )?,
            extreme_price_drop_percent: parse_var(
                &lookup,
                "FLATWATCH_EXTREME_PRICE_DROP_PERCENT",
                defaults.extreme_price_drop_percent,
            )?,
            web_port: parse_var(&lookup, "FLATWATCH_WEB_PORT", defaults.web_port)?,
        };
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            bail!("poll interval must be positive");
        }
        if self.http_timeout.is_zero() {
            bail!("http timeout must be positive");
        }
        if self.max_concurrent_segments == 0 {
            bail!("max concurrent segments must be positive");
        }
        if self.delivery_queue_capacity == 0 {
            bail!("delivery queue capacity must be positive");
        }
        for (name, value) in [
            ("price drop", self.price_drop_percent),
            ("extreme price drop", self.extreme_price_drop_percent),
        ] {
            if !(1..=100).contains(&value) {
                bail!("{name} threshold {value}% is outside 1..=100");
            }
        }
        if self.price_drop_percent > self.extreme_price_drop_percent {
            bail!(
                "price drop threshold {}% exceeds extreme threshold {}%",
                self.price_drop_percent,
                self.extreme_price_drop_percent
            );
        }
        Ok(())
    }

    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            standard: self.price_drop_percent,
            extreme: self.extreme_price_drop_percent,
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: self.http_timeout,
            user_agent: self.user_agent.clone(),
            global_concurrency: self.max_concurrent_segments.max(1),
            flap: FlapPolicy::default(),
            ..HttpClientConfig::default()
        }
    }
}
