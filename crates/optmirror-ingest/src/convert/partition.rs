//! Partitioned parquet output
//!
//! A dataset is a directory holding one sub-directory per partition key value:
//!
//! ```text
//! opprcd1998.parq/
//!   secid=5125/part-00000.parquet
//!   secid=5125/part-00001.parquet
//!   secid=8675/part-00000.parquet
//! ```
//!
//! Each chunk writes its own `part-<chunk>.parquet` into every partition it touches, so chunks
//! never share a file and can be written in any order.

use arrow::array::{Array, StringArray, UInt32Array};
use arrow::compute::{cast, take_record_batch};
use arrow::datatypes::DataType;
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, ZstdLevel};
use parquet::file::properties::{EnabledStatistics, WriterProperties};
use parquet::file::reader::{FileReader, SerializedFileReader};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use super::ConvertError;

/// Directory value used for rows whose partition key is null
pub const NULL_PARTITION: &str = "__HIVE_DEFAULT_PARTITION__";

/// `<key>=<percent-encoded value>`
pub fn partition_dir_name(key: &str, value: Option<&str>) -> String {
    match value {
        Some(value) => format!("{key}={}", urlencoding::encode(value)),
        None => format!("{key}={NULL_PARTITION}"),
    }
}

/// Inverse of [`partition_dir_name`]: `Some(None)` is the null partition, `None` means the
/// directory does not belong to `key`
pub fn parse_partition_dir(name: &str, key: &str) -> Option<Option<String>> {
    let encoded = name.strip_prefix(key)?.strip_prefix('=')?;
    if encoded == NULL_PARTITION {
        return Some(None);
    }
    urlencoding::decode(encoded).ok().map(|v| Some(v.into_owned()))
}

/// Parquet settings for every part file
pub fn writer_properties(compression_level: i32) -> Result<WriterProperties, ConvertError> {
    let level = ZstdLevel::try_new(compression_level).map_err(|e| {
        ConvertError::Config(format!("invalid zstd level {compression_level}: {e}"))
    })?;

    Ok(WriterProperties::builder()
        .set_compression(Compression::ZSTD(level))
        .set_statistics_enabled(EnabledStatistics::Chunk)
        .set_max_row_group_size(1_000_000)
        .build())
}

/// Group the rows of `batch` by the text form of its `key` column
pub fn split_by_key(batch: &RecordBatch, key: &str) -> Result<Vec<(Option<String>, RecordBatch)>, ConvertError> {
    let column = batch
        .column_by_name(key)
        .ok_or_else(|| ConvertError::SchemaMismatch {
            column: key.to_string(),
            reason: "partition key missing from chunk".to_string(),
        })?;

    let text = cast(column, &DataType::Utf8)?;
    let values = text
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| ConvertError::SchemaMismatch {
            column: key.to_string(),
            reason: "partition key cannot be rendered as text".to_string(),
        })?;

    let mut groups: BTreeMap<Option<String>, Vec<u32>> = BTreeMap::new();
    for (row, value) in values.iter().enumerate() {
        let row = u32::try_from(row).map_err(|_| ConvertError::SchemaMismatch {
            column: key.to_string(),
            reason: "chunk has too many rows".to_string(),
        })?;
        groups.entry(value.map(str::to_string)).or_default().push(row);
    }

    groups
        .into_iter()
        .map(|(value, rows)| {
            let indices = UInt32Array::from(rows);
            Ok((value, take_record_batch(batch, &indices)?))
        })
        .collect()
}

/// Files and rows produced by one chunk
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkStats {
    pub rows: u64,
    pub files: usize,
    pub partitions: Vec<String>,
}

/// Write one normalized chunk beneath `dataset_root`, one part file per partition value.
///
/// `dataset_root` must already exist; a root that vanished mid-run is an error rather than
/// something to recreate.
pub fn write_chunk(
    dataset_root: &Path,
    key: &str,
    chunk_index: usize,
    batch: &RecordBatch,
    props: &WriterProperties,
) -> Result<ChunkStats, ConvertError> {
    let mut stats = ChunkStats::default();

    for (value, part) in split_by_key(batch, key)? {
        let dir_name = partition_dir_name(key, value.as_deref());
        let dir = dataset_root.join(&dir_name);
        match fs::create_dir(&dir) {
            Ok(()) => {},
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {},
            Err(source) => {
                return Err(ConvertError::Io {
                    path: dir.clone(),
                    source,
                })
            },
        }

        let path = part_file_path(&dir, chunk_index);
        let file = File::create(&path).map_err(|source| ConvertError::Io {
            path: path.clone(),
            source,
        })?;
        let mut writer = ArrowWriter::try_new(file, part.schema(), Some(props.clone()))?;
        writer.write(&part)?;
        writer.close()?;

        stats.rows += part.num_rows() as u64;
        stats.files += 1;
        stats.partitions.push(dir_name);
    }

    Ok(stats)
}

fn part_file_path(dir: &Path, chunk_index: usize) -> PathBuf {
    dir.join(format!("part-{chunk_index:05}.parquet"))
}

/// Rows recorded in the footers of every part file beneath `dataset_root`
pub fn count_dataset_rows(dataset_root: &Path) -> Result<u64, ConvertError> {
    let mut rows = 0u64;
    for entry in WalkDir::new(dataset_root) {
        let entry = entry.map_err(|e| ConvertError::Io {
            path: dataset_root.to_path_buf(),
            source: e.into(),
        })?;
        if !entry.file_type().is_file() || entry.path().extension().map_or(true, |ext| ext != "parquet") {
            continue;
        }

        let file = File::open(entry.path()).map_err(|source| ConvertError::Io {
            path: entry.path().to_path_buf(),
            source,
        })?;
        let reader = SerializedFileReader::new(file)?;
        rows += reader.metadata().file_metadata().num_rows().max(0) as u64;
    }
    Ok(rows)
}
