//! optmirror ingest library
//!
//! Mirrors a remote directory-listing tree of compressed statistical tables and converts
//! them into partitioned parquet datasets.
//!
//! # Stages
//!
//! - **Index** ([`index`]): crawl the listing pages into a flat [`index::Catalog`]
//! - **Fetch** ([`fetch`]): resumable, size-verified downloads with retry and backoff
//! - **Decompress** ([`decompress`]): decode archives into the interim area on demand
//! - **Convert** ([`convert`]): chunked, parallel conversion to partitioned parquet
//! - **Query** ([`query`]): partition-pruned reads of the converted datasets
//!
//! Every stage writes through a `.partial` staging name and publishes by rename, so an
//! interrupted job is resumed by simply running it again.

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod commands;
pub mod config;
pub mod convert;
pub mod decompress;
pub mod fetch;
pub mod index;
pub mod pipeline;
pub mod progress;
pub mod query;
pub mod staging;

pub use config::{ConfigError, IngestConfig};

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Overall result of a command, mapped onto the process exit status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// Everything succeeded
    Success,
    /// The job ran to completion but some files permanently failed
    PartialFailure,
    /// The job was aborted
    Fatal,
}

impl JobStatus {
    pub fn exit_code(self) -> i32 {
        match self {
            JobStatus::Success => 0,
            JobStatus::PartialFailure => 1,
            JobStatus::Fatal => 2,
        }
    }

    /// The worse of two statuses
    pub fn combine(self, other: JobStatus) -> JobStatus {
        if self.exit_code() >= other.exit_code() {
            self
        } else {
            other
        }
    }
}

/// Archive codec used by the decompression cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Codec {
    /// `.lz`, decoded with the external `lzip` tool
    Lzip,
    /// `.gz`, decoded in-process
    Gzip,
}

impl Codec {
    pub fn from_extension(extension: &str) -> Option<Codec> {
        match extension.trim_start_matches('.').to_ascii_lowercase().as_str() {
            "lz" => Some(Codec::Lzip),
            "gz" => Some(Codec::Gzip),
            _ => None,
        }
    }
}

/// optmirror - mirror a remote table archive and convert it to partitioned parquet
#[derive(Parser, Debug)]
#[command(name = "optmirror")]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// TOML configuration file
    #[arg(short, long, env = "OPTMIRROR_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Root URL of the remote listing tree
    #[arg(long, global = true)]
    pub root_url: Option<String>,

    /// Directory for fetched archives
    #[arg(long, global = true)]
    pub raw_root: Option<PathBuf>,

    /// Directory for decoded tables and converted datasets
    #[arg(long, global = true)]
    pub interim_root: Option<PathBuf>,

    /// Do not draw progress bars
    #[arg(long, global = true)]
    pub no_progress: bool,
}

impl Cli {
    /// Command-line flags take precedence over file and environment settings
    pub fn apply_overrides(&self, config: &mut IngestConfig) {
        if let Some(url) = &self.root_url {
            config.root_url = url.clone();
        }
        if let Some(dir) = &self.raw_root {
            config.raw_root = dir.clone();
        }
        if let Some(dir) = &self.interim_root {
            config.interim_root = dir.clone();
        }
        if self.no_progress {
            config.progress = false;
        }
    }
}

/// Options shared by every command that converts
#[derive(clap::Args, Debug, Clone)]
pub struct ConvertArgs {
    /// Directory beneath the raw root holding the archives to convert
    #[arg(long, default_value = "optm_lz/opprcd")]
    pub dir: PathBuf,

    /// Built-in table schema
    #[arg(long, default_value = "opprcd")]
    pub table: String,

    /// TOML schema file, instead of a built-in one
    #[arg(long)]
    pub schema: Option<PathBuf>,

    /// Archive codec (defaults to the one matching `archive_extension`)
    #[arg(long, value_enum)]
    pub codec: Option<Codec>,

    /// Source files converted at once
    #[arg(long)]
    pub file_concurrency: Option<usize>,

    /// Chunk worker budget shared by all files
    #[arg(long)]
    pub max_workers: Option<usize>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Crawl the remote tree and print a catalog summary
    Index {
        /// Write the catalog as CSV
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Keep only entries beneath this relative path
        #[arg(long)]
        prefix: Option<PathBuf>,
    },

    /// Download every catalog entry into the raw root
    Fetch {
        /// Use a catalog written by `index --out` instead of crawling
        #[arg(long)]
        catalog: Option<PathBuf>,

        /// Keep only entries beneath this relative path
        #[arg(long)]
        prefix: Option<PathBuf>,

        /// Files downloaded at once
        #[arg(short = 'j', long)]
        concurrency: Option<usize>,

        /// Fetch in catalog order instead of a random one
        #[arg(long)]
        no_shuffle: bool,
    },

    /// Decompress and convert fetched archives
    Convert {
        #[command(flatten)]
        args: ConvertArgs,
    },

    /// Index, fetch, then convert
    Run {
        /// Keep only entries beneath this relative path
        #[arg(long)]
        prefix: Option<PathBuf>,

        #[command(flatten)]
        args: ConvertArgs,
    },

    /// Read one partition of the converted datasets
    Query {
        /// Partition key value, e.g. a security id
        value: String,

        /// Row filters such as `cp_flag=P` or `strike_price>=100`
        #[arg(short = 'w', long = "where")]
        predicates: Vec<String>,

        /// Directory searched for datasets (defaults to the interim root)
        #[arg(long)]
        dir: Option<PathBuf>,

        /// Print only the number of matching rows
        #[arg(long)]
        count: bool,
    },
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_query() {
        let cli = Cli::try_parse_from([
            "optmirror",
            "--interim-root",
            "/data/interim",
            "query",
            "5125",
            "-w",
            "cp_flag=P",
            "--where",
            "strike_price>=100",
        ])
        .unwrap();

        let Commands::Query { value, predicates, .. } = &cli.command else {
            panic!("expected query");
        };
        assert_eq!(value, "5125");
        assert_eq!(predicates.len(), 2);

        let mut config = IngestConfig::default();
        cli.apply_overrides(&mut config);
        assert_eq!(config.interim_root, PathBuf::from("/data/interim"));
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(JobStatus::Success.exit_code(), 0);
        assert_eq!(JobStatus::PartialFailure.exit_code(), 1);
        assert_eq!(JobStatus::Fatal.exit_code(), 2);
        assert_eq!(
            JobStatus::Success.combine(JobStatus::PartialFailure),
            JobStatus::PartialFailure
        );
    }

    #[test]
    fn test_codec_from_extension() {
        assert_eq!(Codec::from_extension("lz"), Some(Codec::Lzip));
        assert_eq!(Codec::from_extension(".GZ"), Some(Codec::Gzip));
        assert_eq!(Codec::from_extension("zip"), None);
    }
}
