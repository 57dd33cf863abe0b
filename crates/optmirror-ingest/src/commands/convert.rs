//! `optmirror convert` command implementation

use anyhow::{anyhow, Context, Result};
use std::sync::Arc;

use crate::config::IngestConfig;
use crate::convert::schema::TableSchema;
use crate::convert::{Converter, CsvTableReader, WorkerBudget};
use crate::decompress::{DecompressionCache, Decompressor, GzipDecoder, LzipCommand};
use crate::pipeline::{discover_archives, ConversionPipeline, ConvertSummary};
use crate::{Codec, ConvertArgs, JobStatus};

pub async fn run(config: &IngestConfig, args: &ConvertArgs) -> Result<JobStatus> {
    let config = with_overrides(config, args);
    let summary = convert_dir(&config, args).await?;
    print_summary(&summary);

    Ok(if summary.is_success() {
        JobStatus::Success
    } else {
        JobStatus::PartialFailure
    })
}

/// Apply the per-command concurrency flags
pub(crate) fn with_overrides(config: &IngestConfig, args: &ConvertArgs) -> IngestConfig {
    let mut config = config.clone();
    if let Some(n) = args.file_concurrency {
        config.file_concurrency = n;
    }
    if let Some(n) = args.max_workers {
        config.max_workers = n;
    }
    config
}

/// Convert every archive beneath `raw_root/<args.dir>`
pub(crate) async fn convert_dir(config: &IngestConfig, args: &ConvertArgs) -> Result<ConvertSummary> {
    let pipeline = build_pipeline(config, args)?;
    let dir = config.raw_root.join(&args.dir);
    let archives = discover_archives(&dir, pipeline.cache().extension())?;
    tracing::info!(dir = %dir.display(), archives = archives.len(), "Converting archives");

    let summary = pipeline
        .convert_all(&archives, config.file_concurrency)
        .await
        .context("Conversion aborted")?;
    Ok(summary)
}

pub(crate) fn build_pipeline(config: &IngestConfig, args: &ConvertArgs) -> Result<ConversionPipeline> {
    let schema = match &args.schema {
        Some(path) => TableSchema::from_toml_file(path)?,
        None => TableSchema::builtin(&args.table)
            .ok_or_else(|| anyhow!("No built-in schema for table '{}'", args.table))?,
    };

    let codec = match args.codec {
        Some(codec) => codec,
        None => Codec::from_extension(&config.archive_extension).ok_or_else(|| {
            anyhow!("No codec handles archive extension '{}'", config.archive_extension)
        })?,
    };
    let decompressor: Arc<dyn Decompressor> = match codec {
        Codec::Lzip => Arc::new(LzipCommand::new()),
        Codec::Gzip => Arc::new(GzipDecoder),
    };

    let cache = DecompressionCache::new(&config.raw_root, &config.interim_root, decompressor);
    let converter = Converter::new(
        Arc::new(CsvTableReader::new()),
        schema,
        config.convert_policy(),
        WorkerBudget::new(config.max_workers),
    )?;

    Ok(ConversionPipeline::new(cache, converter))
}

pub(crate) fn print_summary(summary: &ConvertSummary) {
    println!("Converted:         {} ({} rows)", summary.converted, summary.rows);
    println!("Already converted: {}", summary.already_exists);

    if !summary.failures.is_empty() {
        println!("Failed:            {}", summary.failures.len());
        for failure in &summary.failures {
            println!("  {} : {}", failure.archive.display(), failure.error);
        }
    }
}
