//! Job configuration
//!
//! Settings are layered: built-in defaults, then an optional TOML file, then `OPTMIRROR_*`
//! environment variables (a `.env` file is honoured by the binary), then command-line flags.

use optmirror_common::units::SizeTolerance;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::convert::ConvertPolicy;
use crate::fetch::FetchPolicy;

// ============================================================================
// Defaults
// ============================================================================

/// Root of the remote dataset tree
pub const DEFAULT_ROOT_URL: &str = "https://b.scsi.to/";

/// Some listing servers answer 403 to unknown clients
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0";

/// Attempts per file before a fetch is reported as permanently failed
pub const DEFAULT_MAX_ATTEMPTS: u32 = 8;

/// Rows per conversion chunk
pub const DEFAULT_CHUNK_ROWS: usize = 500_000;

/// The decoder is CPU and IO heavy, keep this small
pub const DEFAULT_MAX_WORKERS: usize = 2;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid value '{value}' for environment variable {var}")]
    InvalidEnv { var: String, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Settings for the whole index → fetch → convert job
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Root URL of the remote directory-listing tree
    pub root_url: String,

    /// Where fetched archives are placed (`raw_root/<relative_path>`)
    pub raw_root: PathBuf,

    /// Where decoded tables and converted datasets are placed
    pub interim_root: PathBuf,

    pub user_agent: String,

    /// Bound for a listing request, for connecting, and for any gap between body chunks
    pub request_timeout_secs: u64,

    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,

    /// Random jitter added to each backoff delay
    pub backoff_jitter_ms: u64,

    pub size_tolerance: SizeTolerance,

    /// Re-download a published file whose size no longer verifies (otherwise just remove it)
    pub redownload_corrupt: bool,

    /// Files downloaded at once
    pub fetch_concurrency: usize,

    /// Shuffle the catalog so independent runs make progress on different files
    pub shuffle: bool,

    pub chunk_rows: usize,

    /// Combined budget for chunk decoding across every file being converted
    pub max_workers: usize,

    /// Source files converted at once; each still draws chunk permits from `max_workers`
    pub file_concurrency: usize,

    /// zstd level for parquet output
    pub compression_level: i32,

    /// Extension of fetched archives handed to the decompression cache
    pub archive_extension: String,

    /// Extension of converted dataset directories
    pub dataset_extension: String,

    /// Draw indicatif progress bars
    pub progress: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            root_url: DEFAULT_ROOT_URL.to_string(),
            raw_root: PathBuf::from("./data/raw"),
            interim_root: PathBuf::from("./data/interim"),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            request_timeout_secs: 120,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 5 * 60 * 1_000,
            backoff_jitter_ms: 1_000,
            size_tolerance: SizeTolerance::default(),
            redownload_corrupt: true,
            fetch_concurrency: 1,
            shuffle: true,
            chunk_rows: DEFAULT_CHUNK_ROWS,
            max_workers: DEFAULT_MAX_WORKERS,
            file_concurrency: DEFAULT_MAX_WORKERS,
            compression_level: 3,
            archive_extension: "lz".to_string(),
            dataset_extension: "parq".to_string(),
            progress: true,
        }
    }
}

impl IngestConfig {
    /// Defaults, then the TOML file (if any), then environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.with_env_overrides()
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Overlay `OPTMIRROR_*` environment variables
    ///
    /// - `OPTMIRROR_ROOT_URL`, `OPTMIRROR_RAW_ROOT`, `OPTMIRROR_INTERIM_ROOT`
    /// - `OPTMIRROR_MAX_ATTEMPTS`, `OPTMIRROR_FETCH_CONCURRENCY`
    /// - `OPTMIRROR_CHUNK_ROWS`, `OPTMIRROR_MAX_WORKERS`
    /// - `OPTMIRROR_SIZE_TOLERANCE` (`digits:2`, `relative:0.01`)
    pub fn with_env_overrides(mut self) -> Result<Self, ConfigError> {
        if let Ok(url) = std::env::var("OPTMIRROR_ROOT_URL") {
            self.root_url = url;
        }
        if let Ok(dir) = std::env::var("OPTMIRROR_RAW_ROOT") {
            self.raw_root = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("OPTMIRROR_INTERIM_ROOT") {
            self.interim_root = PathBuf::from(dir);
        }
        if let Some(v) = env_parse("OPTMIRROR_MAX_ATTEMPTS")? {
            self.max_attempts = v;
        }
        if let Some(v) = env_parse("OPTMIRROR_FETCH_CONCURRENCY")? {
            self.fetch_concurrency = v;
        }
        if let Some(v) = env_parse("OPTMIRROR_CHUNK_ROWS")? {
            self.chunk_rows = v;
        }
        if let Some(v) = env_parse("OPTMIRROR_MAX_WORKERS")? {
            self.max_workers = v;
        }
        if let Some(v) = env_parse("OPTMIRROR_SIZE_TOLERANCE")? {
            self.size_tolerance = v;
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.root_url.trim().is_empty() {
            return Err(ConfigError::Invalid("root_url cannot be empty".to_string()));
        }
        if url::Url::parse(&self.root_url).is_err() {
            return Err(ConfigError::Invalid(format!("root_url '{}' is not a URL", self.root_url)));
        }
        if self.raw_root == self.interim_root {
            return Err(ConfigError::Invalid(
                "raw_root and interim_root must be different directories".to_string(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid("max_attempts must be at least 1".to_string()));
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid("request_timeout_secs must be greater than 0".to_string()));
        }
        if self.chunk_rows == 0 {
            return Err(ConfigError::Invalid("chunk_rows must be greater than 0".to_string()));
        }
        if self.max_workers == 0 || self.file_concurrency == 0 || self.fetch_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "max_workers, file_concurrency and fetch_concurrency must be at least 1".to_string(),
            ));
        }
        if !(1..=22).contains(&self.compression_level) {
            return Err(ConfigError::Invalid(format!(
                "compression_level {} is outside the zstd range 1-22",
                self.compression_level
            )));
        }
        if self.archive_extension.is_empty() || self.dataset_extension.is_empty() {
            return Err(ConfigError::Invalid("file extensions cannot be empty".to_string()));
        }
        self.size_tolerance
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn fetch_policy(&self) -> FetchPolicy {
        FetchPolicy {
            max_attempts: self.max_attempts,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            max_jitter: Duration::from_millis(self.backoff_jitter_ms),
            stall_timeout: self.request_timeout(),
            tolerance: self.size_tolerance,
            redownload_corrupt: self.redownload_corrupt,
            show_progress: self.progress,
        }
    }

    pub fn convert_policy(&self) -> ConvertPolicy {
        ConvertPolicy {
            chunk_rows: self.chunk_rows,
            compression_level: self.compression_level,
            dataset_extension: self.dataset_extension.clone(),
            show_progress: self.progress,
        }
    }

    /// Shared HTTP client for listings and downloads
    ///
    /// Only connecting is bounded here; listing requests set their own total timeout and
    /// downloads bound each gap between body chunks, since a multi-gigabyte body can
    /// legitimately take hours.
    pub fn http_client(&self) -> reqwest::Result<reqwest::Client> {
        reqwest::Client::builder()
            .user_agent(self.user_agent.clone())
            .connect_timeout(self.request_timeout())
            .build()
    }
}

fn env_parse<T: std::str::FromStr>(var: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv {
                var: var.to_string(),
                value,
            }),
        Err(_) => Ok(None),
    }
}
