//! Chunked table readers
//!
//! [`TableReader`] is the seam between the converter and a concrete on-disk table codec.
//! A reader answers two questions: how many rows a table holds (without loading it), and
//! what a given row range contains. Both are blocking calls and are run on the blocking
//! thread pool by the converter.

use arrow::array::{ArrayRef, Float64Array, Float64Builder, Int64Array, Int64Builder, StringArray, StringBuilder};
use arrow::record_batch::RecordBatch;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use super::schema::{ColumnKind, TableSchema};
use super::ConvertError;

/// What a metadata-only pass reveals about a table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMeta {
    pub rows: u64,
    pub columns: Vec<String>,
}

/// A contiguous block of rows, `[offset, offset + limit)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowRange {
    pub index: usize,
    pub offset: u64,
    pub limit: u64,
}

impl RowRange {
    /// Cover `rows` with ranges of at most `chunk_rows`
    pub fn split(rows: u64, chunk_rows: usize) -> Vec<RowRange> {
        let chunk = chunk_rows.max(1) as u64;
        (0..rows.div_ceil(chunk))
            .map(|i| {
                let offset = i * chunk;
                RowRange {
                    index: i as usize,
                    offset,
                    limit: chunk.min(rows - offset),
                }
            })
            .collect()
    }
}

pub trait TableReader: Send + Sync {
    /// Row count and column names, without reading row data
    fn metadata(&self, path: &Path) -> Result<TableMeta, ConvertError>;

    /// Read one row range, shaped like [`TableSchema::raw_arrow_schema`]
    fn read_chunk(&self, path: &Path, range: RowRange, schema: &TableSchema) -> Result<RecordBatch, ConvertError>;
}

/// Rows between two recorded seek positions
pub const DEFAULT_INDEX_STRIDE: u64 = 10_000;

/// Byte positions of every `stride`-th record, recorded by the metadata pass
#[derive(Debug)]
struct SeekIndex {
    file_len: u64,
    stride: u64,
    positions: Vec<csv::Position>,
}

/// Reads header-checked delimited text exports.
///
/// Text has no row offsets, so [`TableReader::metadata`] records the position of every
/// `index_stride`-th record while counting. A later [`TableReader::read_chunk`] seeks to the
/// nearest recorded position at or before its offset and scans at most one stride. Without a
/// matching index (another reader ran the metadata pass, or the file changed size since) it
/// scans from the first record.
#[derive(Debug, Clone)]
pub struct CsvTableReader {
    delimiter: u8,
    index_stride: u64,
    indexes: Arc<Mutex<HashMap<PathBuf, Arc<SeekIndex>>>>,
}

impl CsvTableReader {
    pub fn new() -> Self {
        Self::with_delimiter(b',')
    }

    pub fn with_delimiter(delimiter: u8) -> Self {
        Self {
            delimiter,
            index_stride: DEFAULT_INDEX_STRIDE,
            indexes: Arc::default(),
        }
    }

    pub fn with_index_stride(mut self, stride: u64) -> Self {
        self.index_stride = stride.max(1);
        self
    }

    fn file_len(path: &Path) -> Result<u64, ConvertError> {
        std::fs::metadata(path)
            .map(|meta| meta.len())
            .map_err(|source| ConvertError::Io {
                path: path.to_path_buf(),
                source,
            })
    }

    fn remember(&self, path: &Path, index: SeekIndex) {
        // A poisoned map only costs later chunks their seek
        if let Ok(mut indexes) = self.indexes.lock() {
            indexes.insert(path.to_path_buf(), Arc::new(index));
        }
    }

    fn lookup(&self, path: &Path, file_len: u64) -> Option<Arc<SeekIndex>> {
        let indexes = self.indexes.lock().ok()?;
        indexes
            .get(path)
            .filter(|index| index.file_len == file_len)
            .cloned()
    }

    fn open(&self, path: &Path) -> Result<csv::Reader<std::fs::File>, ConvertError> {
        csv::ReaderBuilder::new()
            .delimiter(self.delimiter)
            .has_headers(true)
            .from_path(path)
            .map_err(|e| ConvertError::Read {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
    }
}

impl Default for CsvTableReader {
    fn default() -> Self {
        Self::new()
    }
}

impl TableReader for CsvTableReader {
    fn metadata(&self, path: &Path) -> Result<TableMeta, ConvertError> {
        let read_error = |e: csv::Error| ConvertError::Read {
            path: path.to_path_buf(),
            reason: e.to_string(),
        };

        let mut reader = self.open(path)?;
        let columns = reader
            .headers()
            .map_err(read_error)?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();

        let file_len = Self::file_len(path)?;
        let stride = self.index_stride;
        let mut positions = Vec::new();
        let mut record = csv::ByteRecord::new();
        let mut rows = 0u64;
        loop {
            if rows % stride == 0 {
                positions.push(reader.position().clone());
            }
            if !reader.read_byte_record(&mut record).map_err(read_error)? {
                break;
            }
            rows += 1;
        }

        self.remember(
            path,
            SeekIndex {
                file_len,
                stride,
                positions,
            },
        );
        Ok(TableMeta { rows, columns })
    }

    fn read_chunk(&self, path: &Path, range: RowRange, schema: &TableSchema) -> Result<RecordBatch, ConvertError> {
        let read_error = |e: csv::Error| ConvertError::Read {
            path: path.to_path_buf(),
            reason: e.to_string(),
        };

        let mut reader = self.open(path)?;
        let headers: Vec<String> = reader
            .headers()
            .map_err(read_error)?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();

        // Source position of every declared column; undeclared source columns are dropped
        let mut positions = Vec::with_capacity(schema.columns.len());
        for column in &schema.columns {
            let position = headers.iter().position(|h| h.eq_ignore_ascii_case(&column.name));
            if position.is_none() && column.required {
                return Err(ConvertError::SchemaMismatch {
                    column: column.name.clone(),
                    reason: format!("required column missing from {}", path.display()),
                });
            }
            positions.push(position);
        }

        let capacity = usize::try_from(range.limit).unwrap_or(0);
        let mut builders: Vec<ColumnBuilder> = schema
            .columns
            .iter()
            .zip(&positions)
            .map(|(column, position)| ColumnBuilder::new(column.kind, position.is_some(), capacity))
            .collect();

        let mut row = 0u64;
        if let Some(index) = self.lookup(path, Self::file_len(path)?) {
            let slot = usize::try_from(range.offset / index.stride)
                .unwrap_or(usize::MAX)
                .min(index.positions.len().saturating_sub(1));
            if let Some(position) = index.positions.get(slot) {
                reader.seek(position.clone()).map_err(read_error)?;
                row = slot as u64 * index.stride;
            }
        }

        let mut record = csv::StringRecord::new();
        let end = range.offset + range.limit;
        while row < end && reader.read_record(&mut record).map_err(read_error)? {
            if row >= range.offset {
                for ((builder, position), column) in builders.iter_mut().zip(&positions).zip(&schema.columns) {
                    if let Some(position) = position {
                        let value = record.get(*position).unwrap_or("");
                        builder.append(value).map_err(|reason| ConvertError::SchemaMismatch {
                            column: column.name.clone(),
                            reason: format!("row {row}: {reason}"),
                        })?;
                    }
                }
            }
            row += 1;
        }

        let rows = row.saturating_sub(range.offset) as usize;
        let columns: Vec<ArrayRef> = builders.into_iter().map(|b| b.finish(rows)).collect();
        Ok(RecordBatch::try_new(schema.raw_arrow_schema(), columns)?)
    }
}

enum ColumnBuilder {
    Int64(Int64Builder),
    Float64(Float64Builder),
    Utf8(StringBuilder),
    /// Declared optional and absent from the source
    Absent(ColumnKind),
}

impl ColumnBuilder {
    fn new(kind: ColumnKind, present: bool, capacity: usize) -> Self {
        if !present {
            return ColumnBuilder::Absent(kind);
        }
        match kind {
            ColumnKind::Int64 => ColumnBuilder::Int64(Int64Builder::with_capacity(capacity)),
            ColumnKind::Float64 => ColumnBuilder::Float64(Float64Builder::with_capacity(capacity)),
            ColumnKind::Utf8 | ColumnKind::Date => {
                ColumnBuilder::Utf8(StringBuilder::with_capacity(capacity, capacity * 8))
            },
        }
    }

    /// Empty text and `.` (SAS missing) are null for non-text columns
    fn append(&mut self, raw: &str) -> Result<(), String> {
        let text = raw.trim();
        let missing = text.is_empty() || text == ".";
        match self {
            ColumnBuilder::Int64(b) if missing => b.append_null(),
            ColumnBuilder::Int64(b) => b.append_value(parse_int(text)?),
            ColumnBuilder::Float64(b) if missing => b.append_null(),
            ColumnBuilder::Float64(b) => b.append_value(
                text.parse::<f64>()
                    .map_err(|_| format!("'{text}' is not a number"))?,
            ),
            ColumnBuilder::Utf8(b) if text.is_empty() => b.append_null(),
            ColumnBuilder::Utf8(b) => b.append_value(text),
            ColumnBuilder::Absent(_) => {},
        }
        Ok(())
    }

    fn finish(self, rows: usize) -> ArrayRef {
        match self {
            ColumnBuilder::Int64(mut b) => Arc::new(b.finish()),
            ColumnBuilder::Float64(mut b) => Arc::new(b.finish()),
            ColumnBuilder::Utf8(mut b) => Arc::new(b.finish()),
            ColumnBuilder::Absent(kind) => null_column(kind, rows),
        }
    }
}

fn null_column(kind: ColumnKind, rows: usize) -> ArrayRef {
    match kind {
        ColumnKind::Int64 => Arc::new(Int64Array::new_null(rows)),
        ColumnKind::Float64 => Arc::new(Float64Array::new_null(rows)),
        ColumnKind::Utf8 | ColumnKind::Date => Arc::new(StringArray::new_null(rows)),
    }
}

/// SAS has no integer type, so exports often write `5125.0` for an integer column
fn parse_int(text: &str) -> Result<i64, String> {
    if let Ok(value) = text.parse::<i64>() {
        return Ok(value);
    }
    match text.parse::<f64>() {
        Ok(value) if value.is_finite() && value.fract() == 0.0 && value.abs() < 9.0e15 => Ok(value as i64),
        _ => Err(format!("'{text}' is not an integer")),
    }
}
