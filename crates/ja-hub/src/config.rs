//! # Hub Configuration
//!
//! `ja-hub.toml`, every field optional. A missing file means defaults; a
//! file that exists but cannot be read or parsed is a startup error.

use ja_core::{CurrencyError, CurrencyTable, EngineConfig, SalaryBins};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error(transparent)]
    Currency(#[from] CurrencyError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub salary: SalaryConfig,
    #[serde(default)]
    pub skills: SkillsConfig,
    #[serde(default)]
    pub volume: VolumeConfig,
    #[serde(default)]
    pub currency: CurrencyConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Directory served at `/` for a dashboard build, if any.
    #[serde(default)]
    pub static_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            static_dir: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_ttl")]
    pub ttl_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SalaryConfig {
    #[serde(default = "default_bin_width")]
    pub bin_width: u64,
    #[serde(default = "default_bin_count")]
    pub bin_count: usize,
    /// Monthly amounts under this floor are counted as unknown. The
    /// default suits RUB; set 0 to disable.
    #[serde(default = "default_min_plausible")]
    pub min_plausible: u64,
}

impl Default for SalaryConfig {
    fn default() -> Self {
        Self {
            bin_width: default_bin_width(),
            bin_count: default_bin_count(),
            min_plausible: default_min_plausible(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SkillsConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

impl Default for SkillsConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct VolumeConfig {
    #[serde(default = "default_max_buckets")]
    pub max_buckets: u64,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            max_buckets: default_max_buckets(),
        }
    }
}

/// Rates are decimal strings (`"92.5"`) so they reach the fixed-point
/// parser without passing through a float.
#[derive(Debug, Deserialize, Clone)]
pub struct CurrencyConfig {
    #[serde(default = "default_reference")]
    pub reference: String,
    #[serde(default)]
    pub rates: BTreeMap<String, String>,
    /// Optional TOML file with a `rates` table; its entries win over the
    /// inline ones.
    #[serde(default)]
    pub table_path: Option<PathBuf>,
}

impl Default for CurrencyConfig {
    fn default() -> Self {
        Self {
            reference: default_reference(),
            rates: BTreeMap::new(),
            table_path: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RateFile {
    #[serde(default)]
    rates: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    #[value(name = "json_dir")]
    JsonDir,
    Memory,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default = "default_store_kind")]
    pub kind: StoreKind,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: default_store_kind(),
            data_dir: default_data_dir(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8000".into()
}
fn default_ttl() -> u64 {
    300
}
fn default_sweep_interval() -> u64 {
    60
}
fn default_bin_width() -> u64 {
    50_000
}
fn default_bin_count() -> usize {
    10
}
fn default_min_plausible() -> u64 {
    10_000
}
fn default_top_k() -> usize {
    20
}
fn default_max_buckets() -> u64 {
    10_000
}
fn default_reference() -> String {
    "RUB".into()
}
fn default_store_kind() -> StoreKind {
    StoreKind::JsonDir
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn read_toml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::warn!("Config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        read_toml(path)
    }

    pub fn currency_table(&self) -> Result<CurrencyTable, ConfigError> {
        let mut rates = self.currency.rates.clone();
        if let Some(path) = &self.currency.table_path {
            let file: RateFile = read_toml(path)?;
            rates.extend(file.rates);
        }
        Ok(CurrencyTable::from_decimal_rates(
            &self.currency.reference,
            rates.iter().map(|(code, rate)| (code.as_str(), rate.as_str())),
        )?)
    }

    pub fn engine_config(&self) -> Result<EngineConfig, ConfigError> {
        let engine = EngineConfig {
            salary: SalaryBins {
                bin_width: self.salary.bin_width,
                bin_count: self.salary.bin_count,
                min_plausible: self.salary.min_plausible,
            },
            top_k: self.skills.top_k,
            max_buckets: self.volume.max_buckets,
            currency: self.currency_table()?,
        };
        engine.validate().map_err(ConfigError::Invalid)?;
        Ok(engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_means_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.bind, "127.0.0.1:8000");
        assert_eq!(config.cache.ttl_secs, 300);
        assert_eq!(config.store.kind, StoreKind::JsonDir);
        let engine = config.engine_config().unwrap();
        assert_eq!(engine.top_k, 20);
        assert_eq!(engine.max_buckets, 10_000);
        assert_eq!(engine.salary.min_plausible, 10_000);
        assert_eq!(engine.currency.reference(), "RUB");
    }

    #[test]
    fn test_full_file() {
        let config: Config = toml::from_str(
            r#"
            [cache]
            ttl_secs = 30

            [salary]
            bin_width = 1000
            bin_count = 5
            min_plausible = 200

            [volume]
            max_buckets = 731

            [currency]
            reference = "USD"
            rates = { EUR = "1.08", RUR = "0.011" }

            [store]
            kind = "memory"
            "#,
        )
        .unwrap();
        assert_eq!(config.cache.ttl(), Duration::from_secs(30));
        assert_eq!(config.store.kind, StoreKind::Memory);
        let engine = config.engine_config().unwrap();
        assert_eq!(engine.salary.bin_count, 5);
        assert_eq!(engine.salary.min_plausible, 200);
        assert_eq!(engine.max_buckets, 731);
        assert_eq!(engine.currency.convert(1000, "RUB"), Some(11));
    }

    #[test]
    fn test_rate_file_overrides_inline_rates() {
        let tmp = tempfile::tempdir().unwrap();
        let rates = tmp.path().join("rates.toml");
        std::fs::write(&rates, "[rates]\nUSD = \"100\"\n").unwrap();

        let mut config = Config::default();
        config.currency.rates.insert("USD".into(), "90".into());
        config.currency.table_path = Some(rates);
        let table = config.currency_table().unwrap();
        assert_eq!(table.convert(2, "USD"), Some(200));
    }

    #[test]
    fn test_bad_values_are_errors() {
        let mut config = Config::default();
        config.currency.rates.insert("USD".into(), "ninety".into());
        assert!(matches!(config.engine_config(), Err(ConfigError::Currency(_))));

        let mut config = Config::default();
        config.salary.bin_width = 0;
        assert!(matches!(config.engine_config(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.volume.max_buckets = 0;
        assert!(matches!(config.engine_config(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_unparseable_file_is_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("ja-hub.toml");
        std::fs::write(&path, "[cache\nttl_secs = ").unwrap();
        assert!(matches!(Config::load(&path), Err(ConfigError::Parse { .. })));
        assert!(Config::load(&tmp.path().join("missing.toml")).is_ok());
    }
}
