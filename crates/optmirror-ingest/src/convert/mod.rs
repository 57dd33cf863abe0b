//! Chunked columnar converter
//!
//! Turns one decoded table into a partitioned parquet dataset:
//!
//! 1. skip immediately if the dataset directory already exists (no source reads at all)
//! 2. a metadata-only pass yields the row count
//! 3. the row range is cut into fixed-size chunks, read in parallel under a shared
//!    [`WorkerBudget`]
//! 4. each chunk has its date columns normalized and is written, split by partition key,
//!    into `<dest>.partial`
//! 5. once every chunk succeeded the staging directory is renamed to `<dest>`
//!
//! If any chunk fails, the remaining chunks are cancelled and the staging directory is
//! removed, so a visible dataset directory always means a complete conversion.

pub mod partition;
pub mod reader;
pub mod schema;
pub mod temporal;

use arrow::error::ArrowError;
use parquet::errors::ParquetError;
use parquet::file::properties::WriterProperties;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::progress::{create_progress_bar, short_label};
use crate::staging::{discard_dir, private_staging_path, publish, sweep_stale, STALE_STAGING_AGE};
use partition::{count_dataset_rows, write_chunk, writer_properties, ChunkStats};
use reader::{RowRange, TableReader};
use schema::TableSchema;
use temporal::normalize_batch;

pub use reader::CsvTableReader;

#[derive(Error, Debug)]
pub enum ConvertError {
    #[error("Schema mismatch in column '{column}': {reason}")]
    SchemaMismatch { column: String, reason: String },

    #[error("Invalid table schema: {0}")]
    InvalidSchema(String),

    #[error("Invalid conversion settings: {0}")]
    Config(String),

    #[error("Failed to read {path}: {reason}")]
    Read { path: PathBuf, reason: String },

    #[error("Chunk {index} of {path} failed: {source}")]
    Chunk {
        path: PathBuf,
        index: usize,
        #[source]
        source: Box<ConvertError>,
    },

    #[error("Arrow error: {0}")]
    Arrow(#[from] ArrowError),

    #[error("Parquet error: {0}")]
    Parquet(#[from] ParquetError),

    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Staged dataset {path} holds {actual} rows, expected {expected}")]
    Incomplete { path: PathBuf, expected: u64, actual: u64 },

    #[error("Conversion task failed: {0}")]
    Task(String),

    #[error("Cancelled after another chunk failed")]
    Cancelled,
}

impl ConvertError {
    fn io(path: &Path) -> impl FnOnce(std::io::Error) -> ConvertError + '_ {
        move |source| ConvertError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Tunables for a conversion; none of them affect the dataset's contents
#[derive(Debug, Clone)]
pub struct ConvertPolicy {
    pub chunk_rows: usize,
    pub compression_level: i32,
    /// Extension of the dataset directory, without the dot
    pub dataset_extension: String,
    pub show_progress: bool,
}

impl Default for ConvertPolicy {
    fn default() -> Self {
        Self {
            chunk_rows: 500_000,
            compression_level: 3,
            dataset_extension: "parq".to_string(),
            show_progress: false,
        }
    }
}

/// Concurrency budget shared by every conversion in the process.
///
/// Each chunk holds one permit while it is read and written. Files being converted at the
/// same time draw from the same budget, so total decoding work never exceeds its size.
#[derive(Debug, Clone)]
pub struct WorkerBudget {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerBudget {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, ConvertError> {
        self.permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| ConvertError::Task(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetInfo {
    pub path: PathBuf,
    pub rows: u64,
    pub chunks: usize,
    pub files: usize,
    pub partitions: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConvertOutcome {
    Converted(DatasetInfo),
    /// The dataset directory was already present; the source was not read
    AlreadyExists(PathBuf),
}

/// Converts decoded tables of one schema into partitioned datasets
#[derive(Clone)]
pub struct Converter {
    reader: Arc<dyn TableReader>,
    schema: Arc<TableSchema>,
    policy: ConvertPolicy,
    budget: WorkerBudget,
}

impl Converter {
    pub fn new(
        reader: Arc<dyn TableReader>,
        schema: TableSchema,
        policy: ConvertPolicy,
        budget: WorkerBudget,
    ) -> Result<Self, ConvertError> {
        schema.validate()?;
        if policy.chunk_rows == 0 {
            return Err(ConvertError::Config("chunk_rows must be greater than 0".to_string()));
        }
        Ok(Self {
            reader,
            schema: Arc::new(schema),
            policy,
            budget,
        })
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    pub fn budget(&self) -> &WorkerBudget {
        &self.budget
    }

    /// `opprcd1998.sas7bdat` -> `opprcd1998.parq`, next to the decoded table
    pub fn dataset_path(&self, decoded: &Path) -> PathBuf {
        decoded.with_extension(&self.policy.dataset_extension)
    }

    pub async fn convert(&self, decoded: &Path) -> Result<ConvertOutcome, ConvertError> {
        let dest = self.dataset_path(decoded);
        if tokio::fs::try_exists(&dest).await.map_err(ConvertError::io(&dest))? {
            debug!(path = %dest.display(), "Dataset already converted");
            return Ok(ConvertOutcome::AlreadyExists(dest));
        }

        match sweep_stale(&dest, STALE_STAGING_AGE).await {
            Ok(0) => {},
            Ok(removed) => debug!(path = %dest.display(), removed, "Removed stale staging datasets"),
            Err(e) => warn!(path = %dest.display(), error = %e, "Could not sweep stale staging datasets"),
        }

        let staging = private_staging_path(&dest);
        tokio::fs::create_dir(&staging)
            .await
            .map_err(ConvertError::io(&staging))?;

        let result = self.convert_into(decoded, &staging).await;
        let mut info = match result {
            Ok(info) => info,
            Err(error) => {
                if let Err(e) = discard_dir(&staging).await {
                    warn!(path = %staging.display(), error = %e, "Could not remove staging dataset");
                }
                return Err(error);
            },
        };

        if let Err(e) = publish(&staging, &dest).await {
            if let Err(e) = discard_dir(&staging).await {
                warn!(path = %staging.display(), error = %e, "Could not remove staging dataset");
            }
            // Another run published the same dataset first
            if tokio::fs::try_exists(&dest).await.map_err(ConvertError::io(&dest))? {
                debug!(path = %dest.display(), "Dataset published concurrently");
                return Ok(ConvertOutcome::AlreadyExists(dest));
            }
            return Err(ConvertError::io(&dest)(e));
        }
        info.path = dest;
        info!(
            src = %decoded.display(),
            dest = %info.path.display(),
            rows = info.rows,
            chunks = info.chunks,
            partitions = info.partitions,
            "Converted table"
        );
        Ok(ConvertOutcome::Converted(info))
    }

    async fn convert_into(&self, decoded: &Path, staging: &Path) -> Result<DatasetInfo, ConvertError> {
        let meta = {
            let reader = self.reader.clone();
            let path = decoded.to_path_buf();
            tokio::task::spawn_blocking(move || reader.metadata(&path))
                .await
                .map_err(|e| ConvertError::Task(e.to_string()))??
        };

        for column in self.schema.columns.iter().filter(|c| c.required) {
            if !meta.columns.iter().any(|c| c.eq_ignore_ascii_case(&column.name)) {
                return Err(ConvertError::SchemaMismatch {
                    column: column.name.clone(),
                    reason: format!("required column missing from {}", decoded.display()),
                });
            }
        }

        let ranges = RowRange::split(meta.rows, self.policy.chunk_rows);
        let chunks = ranges.len();
        debug!(path = %decoded.display(), rows = meta.rows, chunks, "Planned conversion");

        let props = Arc::new(writer_properties(self.policy.compression_level)?);
        let cancelled = Arc::new(AtomicBool::new(false));
        let label = short_label(&decoded.to_string_lossy(), 60);
        let pb = create_progress_bar(chunks as u64, &label, self.policy.show_progress);

        let mut tasks = JoinSet::new();
        for range in ranges {
            let job = ChunkJob {
                reader: self.reader.clone(),
                schema: self.schema.clone(),
                props: props.clone(),
                cancelled: cancelled.clone(),
                source: decoded.to_path_buf(),
                dataset_root: staging.to_path_buf(),
                range,
            };
            let budget = self.budget.clone();
            tasks.spawn(async move { (range.index, job.run(budget).await) });
        }

        let mut first_error: Option<ConvertError> = None;
        let mut rows = 0u64;
        let mut files = 0usize;
        let mut partitions = BTreeSet::new();

        while let Some(joined) = tasks.join_next().await {
            let error = match joined {
                Ok((_, Ok(stats))) => {
                    rows += stats.rows;
                    files += stats.files;
                    partitions.extend(stats.partitions);
                    pb.inc(1);
                    continue;
                },
                Ok((_, Err(ConvertError::Cancelled))) => continue,
                Ok((index, Err(source))) => ConvertError::Chunk {
                    path: decoded.to_path_buf(),
                    index,
                    source: Box::new(source),
                },
                Err(e) => ConvertError::Task(e.to_string()),
            };

            if first_error.is_none() {
                warn!(path = %decoded.display(), error = %error, "Chunk failed, cancelling conversion");
                cancelled.store(true, Ordering::SeqCst);
                first_error = Some(error);
            }
        }
        pb.finish_and_clear();

        if let Some(error) = first_error {
            return Err(error);
        }

        let on_disk = {
            let root = staging.to_path_buf();
            tokio::task::spawn_blocking(move || count_dataset_rows(&root))
                .await
                .map_err(|e| ConvertError::Task(e.to_string()))??
        };
        if on_disk != meta.rows || rows != meta.rows {
            return Err(ConvertError::Incomplete {
                path: staging.to_path_buf(),
                expected: meta.rows,
                actual: on_disk,
            });
        }

        Ok(DatasetInfo {
            path: staging.to_path_buf(),
            rows,
            chunks,
            files,
            partitions: partitions.len(),
        })
    }
}

/// Everything one chunk task needs, owned so it can move onto the blocking pool
struct ChunkJob {
    reader: Arc<dyn TableReader>,
    schema: Arc<TableSchema>,
    props: Arc<WriterProperties>,
    cancelled: Arc<AtomicBool>,
    source: PathBuf,
    dataset_root: PathBuf,
    range: RowRange,
}

impl ChunkJob {
    async fn run(self, budget: WorkerBudget) -> Result<ChunkStats, ConvertError> {
        let _permit = budget.acquire().await?;
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(ConvertError::Cancelled);
        }

        tokio::task::spawn_blocking(move || {
            let raw = self.reader.read_chunk(&self.source, self.range, &self.schema)?;
            let batch = normalize_batch(&raw, &self.schema)?;
            write_chunk(
                &self.dataset_root,
                &self.schema.partition_key,
                self.range.index,
                &batch,
                &self.props,
            )
        })
        .await
        .map_err(|e| ConvertError::Task(e.to_string()))?
    }
}
