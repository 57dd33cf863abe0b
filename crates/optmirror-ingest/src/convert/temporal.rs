//! Date normalization
//!
//! Source tables carry dates in whatever form the export produced: ISO text, SAS `DATE9`
//! text (`02JAN1998`), compact `YYYYMMDD`, or raw SAS numerics counting days from
//! 1960-01-01. All of them become Arrow `Date32` (days since 1970-01-01).

use arrow::array::{Array, ArrayRef, Date32Builder, Float64Array, Int64Array, StringArray};
use arrow::compute::cast;
use arrow::datatypes::DataType;
use arrow::record_batch::RecordBatch;
use chrono::{NaiveDate, NaiveDateTime};
use std::sync::Arc;

use super::schema::TableSchema;
use super::ConvertError;

/// Days from the SAS epoch (1960-01-01) to the Unix epoch (1970-01-01)
pub const SAS_EPOCH_OFFSET_DAYS: i64 = 3653;

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d%b%Y", "%Y/%m/%d", "%m/%d/%Y"];
const DATETIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%d%b%Y:%H:%M:%S%.f"];

fn unix_epoch() -> NaiveDate {
    NaiveDate::default()
}

fn days_since_epoch(date: NaiveDate) -> Option<i32> {
    i32::try_from(date.signed_duration_since(unix_epoch()).num_days()).ok()
}

/// Convert a SAS day count to Arrow days
pub fn sas_days_to_date32(sas_days: i64) -> Option<i32> {
    i32::try_from(sas_days.checked_sub(SAS_EPOCH_OFFSET_DAYS)?).ok()
}

/// Parse one textual date. Empty text and the SAS missing marker `.` are `Ok(None)`.
pub fn parse_date(text: &str) -> Result<Option<i32>, String> {
    let text = text.trim();
    if text.is_empty() || text == "." {
        return Ok(None);
    }

    if text.len() == 8 && text.bytes().all(|b| b.is_ascii_digit()) {
        if let Ok(date) = NaiveDate::parse_from_str(text, "%Y%m%d") {
            return days_since_epoch(date).map(Some).ok_or_else(|| out_of_range(text));
        }
    }

    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(text, format) {
            return days_since_epoch(date).map(Some).ok_or_else(|| out_of_range(text));
        }
    }

    for format in DATETIME_FORMATS {
        if let Ok(datetime) = NaiveDateTime::parse_from_str(text, format) {
            return days_since_epoch(datetime.date())
                .map(Some)
                .ok_or_else(|| out_of_range(text));
        }
    }

    // Raw SAS numeric written as text
    if let Ok(days) = text.parse::<f64>() {
        if days.is_finite() && days.fract() == 0.0 {
            return sas_days_to_date32(days as i64)
                .map(Some)
                .ok_or_else(|| out_of_range(text));
        }
    }

    Err(format!("'{text}' is not a recognised date"))
}

fn out_of_range(text: &str) -> String {
    format!("'{text}' is outside the representable date range")
}

/// Convert one column to `Date32`
pub fn normalize_dates(array: &ArrayRef, column: &str) -> Result<ArrayRef, ConvertError> {
    let mismatch = |reason: String| ConvertError::SchemaMismatch {
        column: column.to_string(),
        reason,
    };

    let mut builder = Date32Builder::with_capacity(array.len());
    match array.data_type() {
        DataType::Date32 => return Ok(array.clone()),
        DataType::Date64 | DataType::Timestamp(_, _) => return Ok(cast(array, &DataType::Date32)?),
        DataType::Null => return Ok(cast(array, &DataType::Date32)?),
        DataType::Utf8 => {
            let strings = downcast::<StringArray>(array, column)?;
            for value in strings.iter() {
                match value {
                    Some(text) => builder.append_option(parse_date(text).map_err(mismatch)?),
                    None => builder.append_null(),
                }
            }
        },
        DataType::Float64 => {
            let numbers = downcast::<Float64Array>(array, column)?;
            for value in numbers.iter() {
                match value {
                    Some(days) if days.is_finite() => {
                        let date = sas_days_to_date32(days.round() as i64)
                            .ok_or_else(|| mismatch(format!("{days} days is out of range")))?;
                        builder.append_value(date);
                    },
                    // SAS stores missing numerics as NaN
                    _ => builder.append_null(),
                }
            }
        },
        DataType::Int64 => {
            let numbers = downcast::<Int64Array>(array, column)?;
            for value in numbers.iter() {
                match value {
                    Some(days) => {
                        let date = sas_days_to_date32(days)
                            .ok_or_else(|| mismatch(format!("{days} days is out of range")))?;
                        builder.append_value(date);
                    },
                    None => builder.append_null(),
                }
            }
        },
        other => return Err(mismatch(format!("cannot interpret {other} as a date"))),
    }

    Ok(Arc::new(builder.finish()))
}

fn downcast<'a, T: 'static>(array: &'a ArrayRef, column: &str) -> Result<&'a T, ConvertError> {
    array
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| ConvertError::SchemaMismatch {
            column: column.to_string(),
            reason: format!("unexpected array type {}", array.data_type()),
        })
}

/// Normalize every temporal column of a freshly read chunk so it matches
/// [`TableSchema::arrow_schema`]
pub fn normalize_batch(batch: &RecordBatch, schema: &TableSchema) -> Result<RecordBatch, ConvertError> {
    let target = schema.arrow_schema();
    let mut columns = Vec::with_capacity(target.fields().len());

    for field in target.fields() {
        let column = batch
            .column_by_name(field.name())
            .ok_or_else(|| ConvertError::SchemaMismatch {
                column: field.name().clone(),
                reason: "column missing from chunk".to_string(),
            })?;

        let normalized = if field.data_type() == &DataType::Date32 {
            normalize_dates(column, field.name())?
        } else {
            column.clone()
        };
        columns.push(normalized);
    }

    Ok(RecordBatch::try_new(target, columns)?)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use arrow::array::{Date32Array, TimestampSecondArray};

    fn ymd(y: i32, m: u32, d: u32) -> i32 {
        days_since_epoch(NaiveDate::from_ymd_opt(y, m, d).unwrap()).unwrap()
    }

    #[test]
    fn test_parse_date_formats() {
        let expected = Some(ymd(1998, 1, 2));
        assert_eq!(parse_date("1998-01-02").unwrap(), expected);
        assert_eq!(parse_date("02JAN1998").unwrap(), expected);
        assert_eq!(parse_date("19980102").unwrap(), expected);
        assert_eq!(parse_date("1998-01-02 15:30:00").unwrap(), expected);
        assert_eq!(parse_date("1998-01-02T15:30:00.250").unwrap(), expected);
        // SAS numeric: 1998-01-02 is 13881 days after 1960-01-01
        assert_eq!(parse_date("13881").unwrap(), expected);
    }

    #[test]
    fn test_missing_dates() {
        assert_eq!(parse_date("").unwrap(), None);
        assert_eq!(parse_date(" . ").unwrap(), None);
    }

    #[test]
    fn test_garbage_date_is_an_error() {
        assert!(parse_date("yesterday").is_err());
        assert!(parse_date("1998-13-45").is_err());
    }

    #[test]
    fn test_sas_epoch() {
        assert_eq!(sas_days_to_date32(0), Some(ymd(1960, 1, 1)));
        assert_eq!(sas_days_to_date32(SAS_EPOCH_OFFSET_DAYS), Some(0));
    }

    #[test]
    fn test_normalize_float_with_nan() {
        let array: ArrayRef = Arc::new(Float64Array::from(vec![Some(13881.0), Some(f64::NAN), None]));
        let normalized = normalize_dates(&array, "exdate").unwrap();
        let dates = normalized.as_any().downcast_ref::<Date32Array>().unwrap();

        assert_eq!(dates.value(0), ymd(1998, 1, 2));
        assert!(dates.is_null(1));
        assert!(dates.is_null(2));
    }

    #[test]
    fn test_normalize_timestamp() {
        let array: ArrayRef = Arc::new(TimestampSecondArray::from(vec![86_400 * 3]));
        let normalized = normalize_dates(&array, "date").unwrap();
        let dates = normalized.as_any().downcast_ref::<Date32Array>().unwrap();
        assert_eq!(dates.value(0), 3);
    }

    #[test]
    fn test_normalize_text_reports_column() {
        let array: ArrayRef = Arc::new(StringArray::from(vec!["1998-01-02", "soon"]));
        let err = normalize_dates(&array, "last_date").unwrap_err();
        assert!(err.to_string().contains("last_date"));
    }
}
