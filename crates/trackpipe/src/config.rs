//! Configuration parsing and validation.
//!
//! trackpipe is configured via a TOML file (default: `config/trackpipe.toml`).
//! Every section is optional; a missing key takes the default shown below.
//!
//! # Example
//!
//! ```toml
//! [store]
//! path = "./data/trackpipe.sqlite"
//!
//! [objects]
//! backend = "s3"
//! region = "us-east-2"
//! raw_bucket = "tracks-raw"
//! transformed_bucket = "tracks-transformed"
//!
//! [load]
//! batch_size = 1000
//! max_retries = 3
//!
//! [features.popularity]
//! bands = [
//!   { min = 0, label = "Low" },
//!   { min = 40, label = "Medium" },
//!   { min = 70, label = "High" },
//! ]
//! ```
//!
//! After the file is parsed, a few environment variables override it:
//! `RAW_BUCKET`, `TRANSFORMED_BUCKET`, `DB_NAME` (store path), `BATCH_SIZE`,
//! and `OBJECTS_ROOT`.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use trackpipe_core::features::{Band, FeatureTables, ThresholdTable};

/// Largest accepted batch size. Each row binds 16 parameters and SQLite
/// allows 32 766 per statement.
pub const MAX_BATCH_SIZE: usize = 2000;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub objects: ObjectsConfig,
    #[serde(default)]
    pub transform: TransformConfig,
    #[serde(default)]
    pub load: LoadConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub features: FeaturesConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_busy_timeout_secs")]
    pub busy_timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            max_connections: default_max_connections(),
            busy_timeout_secs: default_busy_timeout_secs(),
        }
    }
}

fn default_store_path() -> PathBuf {
    PathBuf::from("./data/trackpipe.sqlite")
}
fn default_max_connections() -> u32 {
    5
}
fn default_busy_timeout_secs() -> u64 {
    5
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ObjectBackend {
    #[default]
    Local,
    S3,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ObjectsConfig {
    #[serde(default)]
    pub backend: ObjectBackend,
    /// Root directory of the local backend; buckets are subdirectories.
    #[serde(default = "default_objects_root")]
    pub root: PathBuf,
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom S3-compatible endpoint (MinIO, LocalStack).
    #[serde(default)]
    pub endpoint_url: Option<String>,
    #[serde(default = "default_raw_bucket")]
    pub raw_bucket: String,
    #[serde(default = "default_transformed_bucket")]
    pub transformed_bucket: String,
}

impl Default for ObjectsConfig {
    fn default() -> Self {
        Self {
            backend: ObjectBackend::Local,
            root: default_objects_root(),
            region: default_region(),
            endpoint_url: None,
            raw_bucket: default_raw_bucket(),
            transformed_bucket: default_transformed_bucket(),
        }
    }
}

fn default_objects_root() -> PathBuf {
    PathBuf::from("./data/objects")
}
fn default_region() -> String {
    "us-east-1".to_string()
}
fn default_raw_bucket() -> String {
    "raw".to_string()
}
fn default_transformed_bucket() -> String {
    "transformed".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct TransformConfig {
    /// Delimiter of raw input files. Transformed output always uses `,`.
    #[serde(default = "default_delimiter")]
    pub delimiter: String,
    #[serde(default = "default_flush_rows")]
    pub flush_rows: usize,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            delimiter: default_delimiter(),
            flush_rows: default_flush_rows(),
        }
    }
}

impl TransformConfig {
    /// The delimiter as a single byte. Validated by [`load_config`].
    pub fn delimiter_byte(&self) -> u8 {
        self.delimiter.as_bytes().first().copied().unwrap_or(b',')
    }
}

fn default_delimiter() -> String {
    ",".to_string()
}
fn default_flush_rows() -> usize {
    500
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoadConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
    /// Skipped-row samples kept in a load result.
    #[serde(default = "default_skip_samples")]
    pub skip_samples: usize,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            retry_base_ms: default_retry_base_ms(),
            retry_max_ms: default_retry_max_ms(),
            skip_samples: default_skip_samples(),
        }
    }
}

fn default_batch_size() -> usize {
    1000
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_base_ms() -> u64 {
    200
}
fn default_retry_max_ms() -> u64 {
    5000
}
fn default_skip_samples() -> usize {
    20
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueryConfig {
    #[serde(default = "default_max_limit")]
    pub max_limit: u32,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_limit: default_max_limit(),
        }
    }
}

fn default_max_limit() -> u32 {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7340".to_string()
}

/// Optional overrides of the built-in threshold tables.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct FeaturesConfig {
    pub popularity: Option<TableConfig>,
    pub danceability: Option<TableConfig>,
    pub energy: Option<TableConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TableConfig {
    pub bands: Vec<Band>,
}

impl FeaturesConfig {
    /// Threshold tables with configured overrides applied.
    pub fn tables(&self) -> Result<FeatureTables> {
        let mut tables = FeatureTables::default();
        let overrides = [
            ("popularity", &self.popularity, &mut tables.popularity),
            ("danceability", &self.danceability, &mut tables.danceability),
            ("energy", &self.energy, &mut tables.energy),
        ];
        for (name, configured, slot) in overrides {
            if let Some(table) = configured {
                *slot = ThresholdTable::new(name, table.bands.clone())
                    .with_context(|| format!("Invalid [features.{}] table", name))?;
            }
        }
        Ok(tables)
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    apply_env(&mut config, |key| std::env::var(key).ok())?;
    validate(&config)?;
    Ok(config)
}

/// Apply environment overrides, looking variables up through `var`.
pub fn apply_env(config: &mut Config, var: impl Fn(&str) -> Option<String>) -> Result<()> {
    if let Some(bucket) = var("RAW_BUCKET") {
        config.objects.raw_bucket = bucket;
    }
    if let Some(bucket) = var("TRANSFORMED_BUCKET") {
        config.objects.transformed_bucket = bucket;
    }
    if let Some(path) = var("DB_NAME") {
        config.store.path = PathBuf::from(path);
    }
    if let Some(root) = var("OBJECTS_ROOT") {
        config.objects.root = PathBuf::from(root);
    }
    if let Some(size) = var("BATCH_SIZE") {
        config.load.batch_size = size
            .trim()
            .parse()
            .with_context(|| format!("BATCH_SIZE must be a positive integer, got '{}'", size))?;
    }
    Ok(())
}

pub fn validate(config: &Config) -> Result<()> {
    if config.store.max_connections == 0 {
        bail!("store.max_connections must be > 0");
    }

    // Validate objects
    if config.objects.raw_bucket.trim().is_empty() {
        bail!("objects.raw_bucket must not be empty");
    }
    if config.objects.transformed_bucket.trim().is_empty() {
        bail!("objects.transformed_bucket must not be empty");
    }

    // Validate transform
    let delimiter = config.transform.delimiter.as_bytes();
    if delimiter.len() != 1 || matches!(delimiter[0], b'"' | b'\n' | b'\r') {
        bail!(
            "transform.delimiter must be a single ASCII character other than a quote or line break, got {:?}",
            config.transform.delimiter
        );
    }
    if config.transform.flush_rows == 0 {
        bail!("transform.flush_rows must be > 0");
    }

    // Validate load
    if !(1..=MAX_BATCH_SIZE).contains(&config.load.batch_size) {
        bail!(
            "load.batch_size must be in [1, {}], got {}",
            MAX_BATCH_SIZE,
            config.load.batch_size
        );
    }
    if config.load.retry_base_ms > config.load.retry_max_ms {
        bail!("load.retry_base_ms must be <= load.retry_max_ms");
    }

    if config.query.max_limit == 0 {
        bail!("query.max_limit must be > 0");
    }

    config.features.tables()?;
    Ok(())
}
