//! Lossless value conversion from wire values into DataFusion scalars.
//!
//! Conversion is pure and deterministic: the same `(ColumnType, RawValue)`
//! pair always produces the same scalar. A null at any nesting level becomes
//! a typed null at the same level. Anything that cannot be represented
//! exactly (extra fractional digits on a decimal, an unparseable timestamp,
//! a shape mismatch) is an error, never a rounded or defaulted value.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate};
use datafusion::arrow::array::ListArray;
use datafusion::arrow::datatypes::{Field, SchemaRef};
use datafusion::arrow::record_batch::RecordBatch;
use datafusion::common::ScalarValue;
use span_store::{RawRow, RawValue};

use crate::error::{ConversionError, ScanError};
use crate::schema::{ColumnSchema, ColumnType};

/// Converts one raw value into the scalar for its declared column type.
pub fn convert_value(
    column_type: &ColumnType,
    raw: &RawValue,
) -> Result<ScalarValue, ConversionError> {
    if matches!(raw, RawValue::Null) {
        return Ok(null_scalar(column_type));
    }
    match (column_type, raw) {
        (ColumnType::Bool, RawValue::Bool(v)) => Ok(ScalarValue::Boolean(Some(*v))),
        (ColumnType::Int64, RawValue::Int64(v)) => Ok(ScalarValue::Int64(Some(*v))),
        (ColumnType::Float32, RawValue::Float32(v)) => Ok(ScalarValue::Float32(Some(*v))),
        (ColumnType::Float64, RawValue::Float64(v)) => Ok(ScalarValue::Float64(Some(*v))),
        (ColumnType::String, RawValue::String(v)) => Ok(ScalarValue::Utf8(Some(v.clone()))),
        (ColumnType::Bytes, RawValue::Bytes(v)) => Ok(ScalarValue::Binary(Some(v.clone()))),
        // JSON documents stay textual; a plain string payload is accepted
        // because PostgreSQL-dialect drivers deliver JSONB that way.
        (ColumnType::Json, RawValue::Json(v)) | (ColumnType::Json, RawValue::String(v)) => {
            Ok(ScalarValue::Utf8(Some(v.clone())))
        }
        (ColumnType::Numeric { precision, scale }, RawValue::Numeric(text)) => {
            let mantissa = parse_numeric_exact(text, *precision, *scale)?;
            Ok(ScalarValue::Decimal128(Some(mantissa), *precision, *scale))
        }
        (ColumnType::Date, RawValue::Date(text)) => {
            Ok(ScalarValue::Date32(Some(parse_epoch_days(text)?)))
        }
        (ColumnType::Timestamp, RawValue::Timestamp(text)) => Ok(
            ScalarValue::TimestampMicrosecond(Some(parse_utc_micros(text)?), Some("UTC".into())),
        ),
        (ColumnType::Array(element), RawValue::Array(items)) => {
            let mut scalars = Vec::with_capacity(items.len());
            for item in items {
                scalars.push(convert_value(element, item)?);
            }
            let list = ScalarValue::new_list(&scalars, &element.arrow_type(), true);
            Ok(ScalarValue::List(list))
        }
        (expected, actual) => Err(ConversionError::TypeMismatch {
            expected: expected.to_string(),
            actual: raw_kind(actual),
        }),
    }
}

/// Converts a whole raw row against the derived schema, column by column.
pub fn convert_row(
    columns: &[ColumnSchema],
    row: &RawRow,
) -> Result<Vec<ScalarValue>, ConversionError> {
    if row.values.len() != columns.len() {
        return Err(ConversionError::ColumnCount {
            expected: columns.len(),
            actual: row.values.len(),
        });
    }
    columns
        .iter()
        .zip(row.values.iter())
        .map(|(column, raw)| convert_value(&column.column_type, raw))
        .collect()
}

/// Assembles converted rows into one Arrow record batch.
pub fn rows_to_batch(
    schema: SchemaRef,
    rows: &[Vec<ScalarValue>],
) -> Result<RecordBatch, ScanError> {
    if rows.is_empty() {
        return Ok(RecordBatch::new_empty(schema));
    }
    let field_count = schema.fields().len();
    for row in rows {
        if row.len() != field_count {
            return Err(ScanError::Conversion(ConversionError::ColumnCount {
                expected: field_count,
                actual: row.len(),
            }));
        }
    }
    let mut arrays = Vec::with_capacity(field_count);
    for col_idx in 0..field_count {
        let column = rows.iter().map(|row| row[col_idx].clone());
        let array = ScalarValue::iter_to_array(column).map_err(|e| {
            ScanError::Schema(format!(
                "cannot build array for column {:?}: {e}",
                schema.field(col_idx).name()
            ))
        })?;
        arrays.push(array);
    }
    RecordBatch::try_new(schema, arrays)
        .map_err(|e| ScanError::Schema(format!("cannot assemble record batch: {e}")))
}

/// Typed null scalar for a column type; recursion bottom for null handling.
pub fn null_scalar(column_type: &ColumnType) -> ScalarValue {
    match column_type {
        ColumnType::Bool => ScalarValue::Boolean(None),
        ColumnType::Int64 => ScalarValue::Int64(None),
        ColumnType::Float32 => ScalarValue::Float32(None),
        ColumnType::Float64 => ScalarValue::Float64(None),
        ColumnType::Numeric { precision, scale } => {
            ScalarValue::Decimal128(None, *precision, *scale)
        }
        ColumnType::String | ColumnType::Json => ScalarValue::Utf8(None),
        ColumnType::Bytes => ScalarValue::Binary(None),
        ColumnType::Date => ScalarValue::Date32(None),
        ColumnType::Timestamp => ScalarValue::TimestampMicrosecond(None, Some("UTC".into())),
        ColumnType::Array(element) => {
            let field = Arc::new(Field::new_list_field(element.arrow_type(), true));
            ScalarValue::List(Arc::new(ListArray::new_null(field, 1)))
        }
    }
}

/// Parses an RFC 3339 timestamp into microseconds since the UTC epoch.
///
/// Normalizing to an absolute instant makes the conversion order-preserving
/// regardless of the offset the value was rendered with.
fn parse_utc_micros(text: &str) -> Result<i64, ConversionError> {
    let parsed = DateTime::parse_from_rfc3339(text).map_err(|e| ConversionError::InvalidLiteral {
        kind: "timestamp",
        text: text.to_string(),
        reason: e.to_string(),
    })?;
    Ok(parsed.timestamp_micros())
}

/// Parses a `YYYY-MM-DD` date into days since the epoch, timezone-free.
fn parse_epoch_days(text: &str) -> Result<i32, ConversionError> {
    let date = NaiveDate::parse_from_str(text, "%Y-%m-%d").map_err(|e| {
        ConversionError::InvalidLiteral {
            kind: "date",
            text: text.to_string(),
            reason: e.to_string(),
        }
    })?;
    // NaiveDate::default() is 1970-01-01; the difference always fits i32.
    Ok(date.signed_duration_since(NaiveDate::default()).num_days() as i32)
}

/// Parses a plain decimal string into an exact `Decimal128` mantissa at the
/// declared scale.
///
/// The path is digit-by-digit over the textual form; no binary floating
/// point is ever involved. Values with more fractional digits than the
/// declared scale, or more integer digits than the precision permits, are
/// rejected rather than rounded.
fn parse_numeric_exact(text: &str, precision: u8, scale: i8) -> Result<i128, ConversionError> {
    let trimmed = text.trim();
    let invalid = |reason: &str| ConversionError::InvalidLiteral {
        kind: "numeric",
        text: text.to_string(),
        reason: reason.to_string(),
    };

    let (negative, digits) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };
    if digits.is_empty() {
        return Err(invalid("empty literal"));
    }

    let (int_part, frac_part) = match digits.split_once('.') {
        Some((int_part, frac_part)) => (int_part, frac_part),
        None => (digits, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return Err(invalid("no digits"));
    }
    if !int_part.bytes().all(|b| b.is_ascii_digit())
        || !frac_part.bytes().all(|b| b.is_ascii_digit())
    {
        return Err(invalid("expected only decimal digits and one point"));
    }

    let scale_digits = usize::try_from(scale).unwrap_or(0);
    // Trailing zeros beyond the scale are still exact; only significant
    // extra digits are a lossy conversion.
    let significant = frac_part.trim_end_matches('0');
    if significant.len() > scale_digits {
        return Err(ConversionError::NumericScale {
            text: text.to_string(),
            fractional: significant.len(),
            scale,
        });
    }
    let kept_frac = &frac_part[..frac_part.len().min(scale_digits)];

    let precision_err = || ConversionError::NumericPrecision {
        text: text.to_string(),
        precision,
        scale,
    };

    let mut mantissa: i128 = 0;
    for b in int_part.bytes().chain(kept_frac.bytes()) {
        mantissa = mantissa
            .checked_mul(10)
            .and_then(|m| m.checked_add(i128::from(b - b'0')))
            .ok_or_else(precision_err)?;
    }
    // Pad the remainder of the scale with zeros.
    for _ in kept_frac.len()..scale_digits {
        mantissa = mantissa.checked_mul(10).ok_or_else(precision_err)?;
    }

    let limit = 10i128
        .checked_pow(u32::from(precision))
        .unwrap_or(i128::MAX);
    if mantissa >= limit {
        return Err(precision_err());
    }
    Ok(if negative { -mantissa } else { mantissa })
}

/// Short human-readable tag for a raw value's shape, used in mismatch errors.
fn raw_kind(raw: &RawValue) -> &'static str {
    match raw {
        RawValue::Null => "null",
        RawValue::Bool(_) => "a bool",
        RawValue::Int64(_) => "an int64",
        RawValue::Float32(_) => "a float32",
        RawValue::Float64(_) => "a float64",
        RawValue::String(_) => "a string",
        RawValue::Bytes(_) => "bytes",
        RawValue::Numeric(_) => "a numeric",
        RawValue::Date(_) => "a date",
        RawValue::Timestamp(_) => "a timestamp",
        RawValue::Json(_) => "a json document",
        RawValue::Array(_) => "an array",
    }
}
