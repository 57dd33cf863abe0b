//! Decompress-then-convert pipeline over fetched archives

use futures::stream::{self, StreamExt};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::convert::{ConvertError, ConvertOutcome, Converter};
use crate::decompress::{DecompressError, DecompressionCache};
use crate::staging::is_staging_path;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Decompress(#[from] DecompressError),

    #[error(transparent)]
    Convert(#[from] ConvertError),

    #[error("Failed to scan {path}: {source}")]
    Scan {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },
}

impl PipelineError {
    /// Usage errors that would fail every file the same way
    pub fn is_fatal(&self) -> bool {
        match self {
            PipelineError::Decompress(e) => e.is_fatal(),
            PipelineError::Convert(ConvertError::InvalidSchema(_) | ConvertError::Config(_)) => true,
            PipelineError::Convert(_) => false,
            PipelineError::Scan { .. } => true,
        }
    }
}

#[derive(Debug)]
pub struct ConvertFailure {
    pub archive: PathBuf,
    pub error: PipelineError,
}

#[derive(Debug, Default)]
pub struct ConvertSummary {
    pub converted: usize,
    pub already_exists: usize,
    pub rows: u64,
    pub failures: Vec<ConvertFailure>,
}

impl ConvertSummary {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Raw archive -> decoded table -> partitioned dataset
#[derive(Clone)]
pub struct ConversionPipeline {
    cache: DecompressionCache,
    converter: Converter,
}

impl ConversionPipeline {
    pub fn new(cache: DecompressionCache, converter: Converter) -> Self {
        Self { cache, converter }
    }

    pub fn cache(&self) -> &DecompressionCache {
        &self.cache
    }

    pub fn converter(&self) -> &Converter {
        &self.converter
    }

    /// Convert one raw archive. The dataset check happens before decompressing, so a
    /// finished archive costs neither a decode nor a read.
    pub async fn prepare_and_convert(&self, raw: &Path) -> Result<ConvertOutcome, PipelineError> {
        let decoded = self.cache.decoded_path(raw)?;
        let dest = self.converter.dataset_path(&decoded);
        let converted = tokio::fs::try_exists(&dest)
            .await
            .map_err(|source| ConvertError::Io {
                path: dest.clone(),
                source,
            })?;
        if converted {
            return Ok(ConvertOutcome::AlreadyExists(dest));
        }

        let decoded = self.cache.materialize(raw, true).await?;
        Ok(self.converter.convert(&decoded).await?)
    }

    /// Convert archives `file_concurrency` at a time.
    ///
    /// Per-file failures are collected and the batch carries on; a fatal error stops the
    /// batch and is returned.
    pub async fn convert_all(
        &self,
        archives: &[PathBuf],
        file_concurrency: usize,
    ) -> Result<ConvertSummary, PipelineError> {
        let mut summary = ConvertSummary::default();

        let mut results = stream::iter(archives)
            .map(|raw| async move { (raw, self.prepare_and_convert(raw).await) })
            .buffer_unordered(file_concurrency.max(1));

        while let Some((raw, result)) = results.next().await {
            match result {
                Ok(ConvertOutcome::Converted(info)) => {
                    summary.converted += 1;
                    summary.rows += info.rows;
                },
                Ok(ConvertOutcome::AlreadyExists(path)) => {
                    info!(path = %path.display(), "Skipping, already converted");
                    summary.already_exists += 1;
                },
                Err(error) if error.is_fatal() => return Err(error),
                Err(error) => {
                    warn!(archive = %raw.display(), error = %error, "Conversion failed");
                    summary.failures.push(ConvertFailure {
                        archive: raw.clone(),
                        error,
                    });
                },
            }
        }

        info!(
            converted = summary.converted,
            already_exists = summary.already_exists,
            failed = summary.failures.len(),
            rows = summary.rows,
            "Conversion complete"
        );
        Ok(summary)
    }
}

/// Every `*.<extension>` file beneath `dir`, sorted
pub fn discover_archives(dir: &Path, extension: &str) -> Result<Vec<PathBuf>, PipelineError> {
    let mut archives = Vec::new();

    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|source| PipelineError::Scan {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        let matches = path
            .extension()
            .map(|ext| ext.to_string_lossy().eq_ignore_ascii_case(extension))
            .unwrap_or(false);

        if entry.file_type().is_file() && matches && !is_staging_path(path) {
            archives.push(path.to_path_buf());
        }
    }

    archives.sort();
    Ok(archives)
}
