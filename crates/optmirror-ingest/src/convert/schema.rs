//! Declared table schemas
//!
//! Every table is read against a fixed list of typed columns. Values that do not fit their
//! declared type fail the chunk instead of being coerced.

use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use super::ConvertError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnKind {
    Int64,
    Float64,
    Utf8,
    /// Calendar date, normalized to Arrow `Date32`
    Date,
}

impl ColumnKind {
    /// Type of the column as written to the dataset
    pub fn data_type(self) -> DataType {
        match self {
            ColumnKind::Int64 => DataType::Int64,
            ColumnKind::Float64 => DataType::Float64,
            ColumnKind::Utf8 => DataType::Utf8,
            ColumnKind::Date => DataType::Date32,
        }
    }
}

fn required_by_default() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub kind: ColumnKind,
    /// Optional columns missing from a source table are filled with nulls
    #[serde(default = "required_by_default")]
    pub required: bool,
}

impl ColumnSpec {
    pub fn new(name: &str, kind: ColumnKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            required: true,
        }
    }

    pub fn optional(name: &str, kind: ColumnKind) -> Self {
        Self {
            required: false,
            ..Self::new(name, kind)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    /// Column the dataset is physically partitioned by
    pub partition_key: String,
    pub columns: Vec<ColumnSpec>,
}

impl TableSchema {
    /// IvyDB OptionMetrics option prices (`opprcd<year>`), partitioned by security id
    pub fn opprcd() -> Self {
        use ColumnKind::*;

        Self {
            name: "opprcd".to_string(),
            partition_key: "secid".to_string(),
            columns: vec![
                ColumnSpec::new("secid", Int64),
                ColumnSpec::new("date", Date),
                ColumnSpec::optional("symbol", Utf8),
                ColumnSpec::optional("symbol_flag", Utf8),
                ColumnSpec::new("exdate", Date),
                ColumnSpec::optional("last_date", Date),
                ColumnSpec::new("cp_flag", Utf8),
                ColumnSpec::new("strike_price", Float64),
                ColumnSpec::new("best_bid", Float64),
                ColumnSpec::new("best_offer", Float64),
                ColumnSpec::optional("volume", Float64),
                ColumnSpec::optional("open_interest", Float64),
                ColumnSpec::optional("impl_volatility", Float64),
                ColumnSpec::optional("delta", Float64),
                ColumnSpec::optional("gamma", Float64),
                ColumnSpec::optional("vega", Float64),
                ColumnSpec::optional("theta", Float64),
                ColumnSpec::new("optionid", Int64),
                ColumnSpec::optional("cfadj", Float64),
                ColumnSpec::optional("am_settlement", Int64),
                ColumnSpec::optional("contract_size", Float64),
                ColumnSpec::optional("ss_flag", Utf8),
                ColumnSpec::optional("forward_price", Float64),
                ColumnSpec::optional("expiry_indicator", Utf8),
            ],
        }
    }

    /// Look up a built-in schema by table name
    pub fn builtin(name: &str) -> Option<Self> {
        match name {
            "opprcd" => Some(Self::opprcd()),
            _ => None,
        }
    }

    /// Load a schema from TOML:
    ///
    /// ```toml
    /// name = "prices"
    /// partition_key = "secid"
    ///
    /// [[columns]]
    /// name = "secid"
    /// kind = "int64"
    /// ```
    pub fn from_toml_file(path: &Path) -> Result<Self, ConvertError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConvertError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let schema: Self = toml::from_str(&text)
            .map_err(|e| ConvertError::InvalidSchema(format!("{}: {e}", path.display())))?;
        schema.validate()?;
        Ok(schema)
    }

    pub fn validate(&self) -> Result<(), ConvertError> {
        if self.columns.is_empty() {
            return Err(ConvertError::InvalidSchema(format!(
                "schema '{}' declares no columns",
                self.name
            )));
        }

        let mut seen = HashSet::new();
        for column in &self.columns {
            if !seen.insert(column.name.as_str()) {
                return Err(ConvertError::InvalidSchema(format!(
                    "column '{}' declared twice in '{}'",
                    column.name, self.name
                )));
            }
        }

        match self.column(&self.partition_key) {
            Some(key) if key.required => Ok(()),
            Some(_) => Err(ConvertError::InvalidSchema(format!(
                "partition key '{}' must be a required column",
                self.partition_key
            ))),
            None => Err(ConvertError::InvalidSchema(format!(
                "partition key '{}' is not a declared column",
                self.partition_key
            ))),
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Columns normalized to dates after each chunk is read
    pub fn temporal_columns(&self) -> impl Iterator<Item = &ColumnSpec> {
        self.columns.iter().filter(|c| c.kind == ColumnKind::Date)
    }

    /// Schema of the written dataset
    pub fn arrow_schema(&self) -> SchemaRef {
        self.build_schema(ColumnKind::data_type)
    }

    /// Schema of a freshly read chunk: dates are still raw text until normalized
    pub fn raw_arrow_schema(&self) -> SchemaRef {
        self.build_schema(|kind| match kind {
            ColumnKind::Date => DataType::Utf8,
            other => other.data_type(),
        })
    }

    fn build_schema(&self, data_type: impl Fn(ColumnKind) -> DataType) -> SchemaRef {
        let fields: Vec<Field> = self
            .columns
            .iter()
            .map(|c| Field::new(&c.name, data_type(c.kind), true))
            .collect();
        Arc::new(Schema::new(fields))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_opprcd_is_valid() {
        let schema = TableSchema::opprcd();
        schema.validate().unwrap();

        let temporal: Vec<_> = schema.temporal_columns().map(|c| c.name.as_str()).collect();
        assert_eq!(temporal, vec!["date", "exdate", "last_date"]);

        let arrow = schema.arrow_schema();
        assert_eq!(arrow.field_with_name("date").unwrap().data_type(), &DataType::Date32);

        let raw = schema.raw_arrow_schema();
        assert_eq!(raw.field_with_name("exdate").unwrap().data_type(), &DataType::Utf8);
    }

    #[test]
    fn test_from_toml_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
name = "prices"
partition_key = "secid"

[[columns]]
name = "secid"
kind = "int64"

[[columns]]
name = "date"
kind = "date"

[[columns]]
name = "note"
kind = "utf8"
required = false
"#
        )
        .unwrap();

        let schema = TableSchema::from_toml_file(file.path()).unwrap();
        assert_eq!(schema.columns.len(), 3);
        assert!(!schema.column("note").unwrap().required);
    }

    #[test]
    fn test_unknown_partition_key_is_rejected() {
        let schema = TableSchema {
            name: "t".to_string(),
            partition_key: "missing".to_string(),
            columns: vec![ColumnSpec::new("secid", ColumnKind::Int64)],
        };
        assert!(matches!(schema.validate(), Err(ConvertError::InvalidSchema(_))));
    }

    #[test]
    fn test_duplicate_column_is_rejected() {
        let schema = TableSchema {
            name: "t".to_string(),
            partition_key: "secid".to_string(),
            columns: vec![
                ColumnSpec::new("secid", ColumnKind::Int64),
                ColumnSpec::new("secid", ColumnKind::Utf8),
            ],
        };
        assert!(schema.validate().is_err());
    }
}
