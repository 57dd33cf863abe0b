//! Reading converted datasets back
//!
//! Reads are pruned by partition: asking for one key value opens only the files under
//! `<key>=<value>/`. Additional predicates are applied row by row after reading.

use arrow::array::{ArrayRef, BooleanArray, Date32Array, Float64Array, Int64Array, Scalar, StringArray};
use arrow::compute::kernels::cmp;
use arrow::compute::{and, cast, filter_record_batch};
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::errors::ParquetError;
use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use walkdir::WalkDir;

use crate::convert::partition::{parse_partition_dir, partition_dir_name};
use crate::convert::temporal::parse_date;
use crate::staging::is_staging_path;

#[derive(Error, Debug)]
pub enum QueryError {
    #[error("Invalid predicate '{0}': expected <column><op><value> with op one of = < <= > >=")]
    InvalidPredicate(String),

    #[error("Unknown column '{0}'")]
    UnknownColumn(String),

    #[error("{0} is not a partitioned dataset")]
    NotADataset(PathBuf),

    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to scan datasets: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("Arrow error: {0}")]
    Arrow(#[from] ArrowError),

    #[error("Parquet error: {0}")]
    Parquet(#[from] ParquetError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    fn symbol(self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }
}

/// A literal on the right-hand side of a predicate
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarValue {
    Int64(i64),
    Float64(f64),
    Utf8(String),
    /// Days since 1970-01-01
    Date(i32),
}

impl ScalarValue {
    /// Integers, then floats, then ISO-style dates, then text
    pub fn parse(text: &str) -> Self {
        let text = text.trim();
        if let Ok(v) = text.parse::<i64>() {
            return ScalarValue::Int64(v);
        }
        if let Ok(v) = text.parse::<f64>() {
            return ScalarValue::Float64(v);
        }
        if text.contains('-') || text.chars().any(|c| c.is_ascii_alphabetic()) {
            if let Ok(Some(days)) = parse_date(text) {
                return ScalarValue::Date(days);
            }
        }
        ScalarValue::Utf8(text.to_string())
    }

    fn to_array(&self) -> ArrayRef {
        match self {
            ScalarValue::Int64(v) => Arc::new(Int64Array::from(vec![*v])),
            ScalarValue::Float64(v) => Arc::new(Float64Array::from(vec![*v])),
            ScalarValue::Utf8(v) => Arc::new(StringArray::from(vec![v.as_str()])),
            ScalarValue::Date(v) => Arc::new(Date32Array::from(vec![*v])),
        }
    }
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarValue::Int64(v) => write!(f, "{v}"),
            ScalarValue::Float64(v) => write!(f, "{v}"),
            ScalarValue::Utf8(v) => write!(f, "{v}"),
            ScalarValue::Date(v) => write!(f, "date({v})"),
        }
    }
}

/// `column op value`, e.g. `strike_price>=100` or `cp_flag=P`
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub column: String,
    pub op: CompareOp,
    pub value: ScalarValue,
}

impl Predicate {
    pub fn new(column: impl Into<String>, op: CompareOp, value: ScalarValue) -> Self {
        Self {
            column: column.into(),
            op,
            value,
        }
    }

    /// Row mask for `batch`; rows with a null in the column never match
    pub fn evaluate(&self, batch: &RecordBatch) -> Result<BooleanArray, QueryError> {
        let column = batch
            .column_by_name(&self.column)
            .ok_or_else(|| QueryError::UnknownColumn(self.column.clone()))?;

        // A literal that cannot be cast becomes null and matches nothing
        let literal = cast(&self.value.to_array(), column.data_type())?;
        let scalar = Scalar::new(literal);

        let mask = match self.op {
            CompareOp::Eq => cmp::eq(column, &scalar)?,
            CompareOp::Lt => cmp::lt(column, &scalar)?,
            CompareOp::Le => cmp::lt_eq(column, &scalar)?,
            CompareOp::Gt => cmp::gt(column, &scalar)?,
            CompareOp::Ge => cmp::gt_eq(column, &scalar)?,
        };
        Ok(mask)
    }
}

impl FromStr for Predicate {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || QueryError::InvalidPredicate(s.to_string());
        let start = s.find(['<', '>', '=']).ok_or_else(invalid)?;
        let rest = &s[start..];

        let (op, len) = if rest.starts_with(">=") {
            (CompareOp::Ge, 2)
        } else if rest.starts_with("<=") {
            (CompareOp::Le, 2)
        } else if rest.starts_with('>') {
            (CompareOp::Gt, 1)
        } else if rest.starts_with('<') {
            (CompareOp::Lt, 1)
        } else {
            (CompareOp::Eq, 1)
        };

        let column = s[..start].trim();
        let value = rest[len..].trim();
        if column.is_empty() || value.is_empty() {
            return Err(invalid());
        }

        Ok(Self::new(column, op, ScalarValue::parse(value)))
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.column, self.op.symbol(), self.value)
    }
}

/// Keep the rows of `batch` matching every predicate
pub fn apply_predicates(batch: &RecordBatch, predicates: &[Predicate]) -> Result<RecordBatch, QueryError> {
    let mut mask: Option<BooleanArray> = None;
    for predicate in predicates {
        let next = predicate.evaluate(batch)?;
        mask = Some(match mask {
            Some(current) => and(&current, &next)?,
            None => next,
        });
    }

    match mask {
        Some(mask) => Ok(filter_record_batch(batch, &mask)?),
        None => Ok(batch.clone()),
    }
}

/// One converted dataset directory
#[derive(Debug, Clone)]
pub struct PartitionedDataset {
    root: PathBuf,
    key: Option<String>,
}

impl PartitionedDataset {
    /// Open a dataset, inferring its partition key from the partition directory names
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, QueryError> {
        let root = root.into();
        if !root.is_dir() || is_staging_path(&root) {
            return Err(QueryError::NotADataset(root));
        }

        let mut key = None;
        for entry in std::fs::read_dir(&root).map_err(|source| QueryError::Io {
            path: root.clone(),
            source,
        })? {
            let entry = entry.map_err(|source| QueryError::Io {
                path: root.clone(),
                source,
            })?;
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some((k, _)) = name.split_once('=') {
                key = Some(k.to_string());
                break;
            }
        }

        Ok(Self { root, key })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Partition key column; `None` for a dataset with no rows
    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    /// Every partition value present, sorted; `None` is the null-key partition
    pub fn partition_values(&self) -> Result<Vec<Option<String>>, QueryError> {
        let Some(key) = &self.key else {
            return Ok(Vec::new());
        };

        let mut values = Vec::new();
        for entry in std::fs::read_dir(&self.root).map_err(|source| QueryError::Io {
            path: self.root.clone(),
            source,
        })? {
            let entry = entry.map_err(|source| QueryError::Io {
                path: self.root.clone(),
                source,
            })?;
            if let Some(value) = parse_partition_dir(&entry.file_name().to_string_lossy(), key) {
                values.push(value);
            }
        }
        values.sort();
        Ok(values)
    }

    /// Rows whose key equals `value` and that match every predicate. Only the matching
    /// partition directory is opened.
    pub fn read_partition(&self, value: &str, predicates: &[Predicate]) -> Result<Vec<RecordBatch>, QueryError> {
        let Some(key) = &self.key else {
            return Ok(Vec::new());
        };
        let dir = self.root.join(partition_dir_name(key, Some(value)));
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        read_dir_batches(&dir, predicates)
    }

    /// Every row of the dataset matching the predicates
    pub fn read_all(&self, predicates: &[Predicate]) -> Result<Vec<RecordBatch>, QueryError> {
        let Some(key) = &self.key else {
            return Ok(Vec::new());
        };

        let mut batches = Vec::new();
        for value in self.partition_values()? {
            let dir = self.root.join(partition_dir_name(key, value.as_deref()));
            batches.extend(read_dir_batches(&dir, predicates)?);
        }
        Ok(batches)
    }
}

fn read_dir_batches(dir: &Path, predicates: &[Predicate]) -> Result<Vec<RecordBatch>, QueryError> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(|source| QueryError::Io {
            path: dir.to_path_buf(),
            source,
        })?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().map(|e| e == "parquet").unwrap_or(false))
        .collect();
    files.sort();

    let mut batches = Vec::new();
    for path in files {
        let file = File::open(&path).map_err(|source| QueryError::Io {
            path: path.clone(),
            source,
        })?;
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;
        for batch in reader {
            let filtered = apply_predicates(&batch?, predicates)?;
            if filtered.num_rows() > 0 {
                batches.push(filtered);
            }
        }
    }
    Ok(batches)
}

/// All datasets beneath a directory, e.g. one per year of a table
#[derive(Debug, Clone, Default)]
pub struct DatasetCollection {
    datasets: Vec<PartitionedDataset>,
}

impl DatasetCollection {
    /// Find every `*.<extension>` dataset directory beneath `dir`
    pub fn discover(dir: &Path, extension: &str) -> Result<Self, QueryError> {
        let mut datasets = Vec::new();
        let mut walker = WalkDir::new(dir).sort_by_file_name().into_iter();

        while let Some(entry) = walker.next() {
            let entry = entry?;
            let is_dataset = entry.file_type().is_dir()
                && entry
                    .path()
                    .extension()
                    .map(|e| e.to_string_lossy().eq_ignore_ascii_case(extension))
                    .unwrap_or(false);

            if is_dataset {
                datasets.push(PartitionedDataset::open(entry.path())?);
                walker.skip_current_dir();
            }
        }

        Ok(Self { datasets })
    }

    pub fn datasets(&self) -> &[PartitionedDataset] {
        &self.datasets
    }

    pub fn len(&self) -> usize {
        self.datasets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.datasets.is_empty()
    }

    /// [`PartitionedDataset::read_partition`] across every dataset
    pub fn query(&self, value: &str, predicates: &[Predicate]) -> Result<Vec<RecordBatch>, QueryError> {
        let mut batches = Vec::new();
        for dataset in &self.datasets {
            batches.extend(dataset.read_partition(value, predicates)?);
        }
        Ok(batches)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use arrow::array::Array;
    use arrow::datatypes::{DataType, Field, Schema};

    fn batch() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("cp_flag", DataType::Utf8, true),
            Field::new("strike_price", DataType::Float64, true),
            Field::new("exdate", DataType::Date32, true),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(vec![Some("P"), Some("C"), Some("P"), None])),
                Arc::new(Float64Array::from(vec![Some(90.0), Some(100.0), Some(110.0), Some(120.0)])),
                Arc::new(Date32Array::from(vec![10228, 10228, 10300, 10300])),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_parse_predicates() {
        let p: Predicate = "strike_price>=100".parse().unwrap();
        assert_eq!(p, Predicate::new("strike_price", CompareOp::Ge, ScalarValue::Int64(100)));

        let p: Predicate = "cp_flag = P".parse().unwrap();
        assert_eq!(p.op, CompareOp::Eq);
        assert_eq!(p.value, ScalarValue::Utf8("P".to_string()));

        let p: Predicate = "exdate<1998-01-02".parse().unwrap();
        assert_eq!(p.value, ScalarValue::Date(10228));

        assert!("strike_price".parse::<Predicate>().is_err());
        assert!(">=3".parse::<Predicate>().is_err());
        assert!("x<=".parse::<Predicate>().is_err());
    }

    #[test]
    fn test_apply_predicates() {
        let predicates: Vec<Predicate> = vec![
            "cp_flag=P".parse().unwrap(),
            "strike_price>95".parse().unwrap(),
        ];
        let filtered = apply_predicates(&batch(), &predicates).unwrap();
        assert_eq!(filtered.num_rows(), 1);

        let strikes = filtered.column(1).as_any().downcast_ref::<Float64Array>().unwrap();
        assert_eq!(strikes.value(0), 110.0);
    }

    #[test]
    fn test_date_predicate() {
        let predicates: Vec<Predicate> = vec!["exdate<=1998-01-02".parse().unwrap()];
        let filtered = apply_predicates(&batch(), &predicates).unwrap();
        assert_eq!(filtered.num_rows(), 2);
    }

    #[test]
    fn test_unknown_column() {
        let predicates: Vec<Predicate> = vec!["volume>0".parse().unwrap()];
        assert!(matches!(
            apply_predicates(&batch(), &predicates),
            Err(QueryError::UnknownColumn(_))
        ));
    }

    #[test]
    fn test_no_predicates_keeps_everything() {
        let filtered = apply_predicates(&batch(), &[]).unwrap();
        assert_eq!(filtered.num_rows(), 4);
        assert_eq!(filtered.column(0).null_count(), 1);
    }
}
