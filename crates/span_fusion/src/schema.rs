//! Dialect-aware schema derivation.
//!
//! Table metadata arrives as dialect-specific type-name strings. The names
//! are resolved once per scan into [`ColumnType`] values and from there into
//! Arrow types; per-row conversion never inspects type names again.

use std::sync::Arc;

use datafusion::arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use span_store::{ColumnRecord, Dialect};

use crate::error::ScanError;

/// Default precision/scale of a `NUMERIC` column when the database does not
/// declare an explicit pair.
pub const NUMERIC_DEFAULT_PRECISION: u8 = 38;
pub const NUMERIC_DEFAULT_SCALE: i8 = 9;

/// Source column type after dialect resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnType {
    Bool,
    Int64,
    Float32,
    Float64,
    Numeric { precision: u8, scale: i8 },
    String,
    Bytes,
    /// JSON (GoogleSQL) or JSONB (PostgreSQL dialect), carried as text.
    Json,
    Date,
    Timestamp,
    Array(Box<ColumnType>),
}

impl ColumnType {
    /// Arrow type this column converts into.
    pub fn arrow_type(&self) -> DataType {
        match self {
            ColumnType::Bool => DataType::Boolean,
            ColumnType::Int64 => DataType::Int64,
            ColumnType::Float32 => DataType::Float32,
            ColumnType::Float64 => DataType::Float64,
            ColumnType::Numeric { precision, scale } => DataType::Decimal128(*precision, *scale),
            ColumnType::String | ColumnType::Json => DataType::Utf8,
            ColumnType::Bytes => DataType::Binary,
            ColumnType::Date => DataType::Date32,
            ColumnType::Timestamp => DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
            ColumnType::Array(element) => {
                DataType::List(Arc::new(Field::new_list_field(element.arrow_type(), true)))
            }
        }
    }
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ColumnType::Bool => write!(f, "BOOL"),
            ColumnType::Int64 => write!(f, "INT64"),
            ColumnType::Float32 => write!(f, "FLOAT32"),
            ColumnType::Float64 => write!(f, "FLOAT64"),
            ColumnType::Numeric { precision, scale } => {
                write!(f, "NUMERIC({precision},{scale})")
            }
            ColumnType::String => write!(f, "STRING"),
            ColumnType::Bytes => write!(f, "BYTES"),
            ColumnType::Json => write!(f, "JSON"),
            ColumnType::Date => write!(f, "DATE"),
            ColumnType::Timestamp => write!(f, "TIMESTAMP"),
            ColumnType::Array(element) => write!(f, "ARRAY<{element}>"),
        }
    }
}

/// One column of the derived scan schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSchema {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
}

/// Resolves raw column metadata into the scan schema, fixing dialect-specific
/// decisions once for the lifetime of the scan.
pub fn derive_schema(
    dialect: Dialect,
    records: &[ColumnRecord],
) -> Result<Vec<ColumnSchema>, ScanError> {
    records
        .iter()
        .map(|record| {
            let column_type = parse_column_type(dialect, &record.type_name)?;
            Ok(ColumnSchema {
                name: record.name.clone(),
                column_type,
                nullable: record.nullable,
            })
        })
        .collect()
}

/// Builds the Arrow schema matching the derived column order.
pub fn arrow_schema(columns: &[ColumnSchema]) -> SchemaRef {
    Arc::new(Schema::new(
        columns
            .iter()
            .map(|column| Field::new(&column.name, column.column_type.arrow_type(), column.nullable))
            .collect::<Vec<_>>(),
    ))
}

/// Parses one dialect-specific type name into a [`ColumnType`].
pub fn parse_column_type(dialect: Dialect, type_name: &str) -> Result<ColumnType, ScanError> {
    let trimmed = type_name.trim();
    match dialect {
        Dialect::GoogleSql => parse_googlesql_type(trimmed),
        Dialect::Postgres => parse_postgres_type(trimmed),
    }
    .ok_or_else(|| {
        ScanError::Schema(format!(
            "unsupported {dialect:?} column type {type_name:?}"
        ))
    })
}

fn parse_googlesql_type(name: &str) -> Option<ColumnType> {
    let upper = name.to_ascii_uppercase();
    if let Some(inner) = upper.strip_prefix("ARRAY<").and_then(|s| s.strip_suffix('>')) {
        return parse_googlesql_type(inner.trim()).map(|e| ColumnType::Array(Box::new(e)));
    }
    let (base, args) = split_type_args(&upper);
    match base {
        "BOOL" => Some(ColumnType::Bool),
        "INT64" => Some(ColumnType::Int64),
        "FLOAT32" => Some(ColumnType::Float32),
        "FLOAT64" => Some(ColumnType::Float64),
        "NUMERIC" => parse_numeric_args(args),
        "STRING" => Some(ColumnType::String),
        "BYTES" => Some(ColumnType::Bytes),
        "JSON" => Some(ColumnType::Json),
        "DATE" => Some(ColumnType::Date),
        "TIMESTAMP" => Some(ColumnType::Timestamp),
        _ => None,
    }
}

fn parse_postgres_type(name: &str) -> Option<ColumnType> {
    let lower = name.to_ascii_lowercase();
    if let Some(inner) = lower.strip_suffix("[]") {
        return parse_postgres_type(inner.trim()).map(|e| ColumnType::Array(Box::new(e)));
    }
    let (base, args) = split_type_args(&lower);
    match base {
        "boolean" | "bool" => Some(ColumnType::Bool),
        "bigint" | "int8" => Some(ColumnType::Int64),
        "real" | "float4" => Some(ColumnType::Float32),
        "double precision" | "float8" => Some(ColumnType::Float64),
        "numeric" | "decimal" => parse_numeric_args(args),
        "character varying" | "varchar" | "text" => Some(ColumnType::String),
        "bytea" => Some(ColumnType::Bytes),
        "jsonb" => Some(ColumnType::Json),
        "date" => Some(ColumnType::Date),
        "timestamp with time zone" | "timestamptz" => Some(ColumnType::Timestamp),
        _ => None,
    }
}

/// Splits `BASE(arg, ...)` into the base name and the raw argument list.
fn split_type_args(name: &str) -> (&str, Option<&str>) {
    match (name.find('('), name.rfind(')')) {
        (Some(open), Some(close)) if open < close => {
            (name[..open].trim_end(), Some(&name[open + 1..close]))
        }
        _ => (name, None),
    }
}

/// Resolves `NUMERIC` precision/scale arguments, defaulting to the
/// database-wide maximum when absent.
fn parse_numeric_args(args: Option<&str>) -> Option<ColumnType> {
    let Some(args) = args else {
        return Some(ColumnType::Numeric {
            precision: NUMERIC_DEFAULT_PRECISION,
            scale: NUMERIC_DEFAULT_SCALE,
        });
    };
    let mut parts = args.split(',').map(str::trim);
    let precision = parts.next()?.parse::<u8>().ok()?;
    let scale = parts.next().map_or(Ok(0), str::parse::<i8>).ok()?;
    if parts.next().is_some() || precision == 0 || scale < 0 || scale as u8 > precision {
        return None;
    }
    Some(ColumnType::Numeric { precision, scale })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn googlesql_names_resolve() {
        let cases = [
            ("BOOL", ColumnType::Bool),
            ("INT64", ColumnType::Int64),
            ("FLOAT32", ColumnType::Float32),
            ("FLOAT64", ColumnType::Float64),
            ("STRING(MAX)", ColumnType::String),
            ("string(100)", ColumnType::String),
            ("BYTES(MAX)", ColumnType::Bytes),
            ("JSON", ColumnType::Json),
            ("DATE", ColumnType::Date),
            ("TIMESTAMP", ColumnType::Timestamp),
            (
                "NUMERIC",
                ColumnType::Numeric {
                    precision: 38,
                    scale: 9,
                },
            ),
            (
                "NUMERIC(10, 4)",
                ColumnType::Numeric {
                    precision: 10,
                    scale: 4,
                },
            ),
            (
                "ARRAY<STRING(MAX)>",
                ColumnType::Array(Box::new(ColumnType::String)),
            ),
            (
                "ARRAY<ARRAY<INT64>>",
                ColumnType::Array(Box::new(ColumnType::Array(Box::new(ColumnType::Int64)))),
            ),
        ];
        for (name, expected) in cases {
            let parsed = parse_column_type(Dialect::GoogleSql, name).unwrap();
            assert_eq!(parsed, expected, "{name}");
        }
    }

    #[test]
    fn postgres_names_resolve() {
        let cases = [
            ("boolean", ColumnType::Bool),
            ("bigint", ColumnType::Int64),
            ("real", ColumnType::Float32),
            ("double precision", ColumnType::Float64),
            ("character varying", ColumnType::String),
            ("text", ColumnType::String),
            ("bytea", ColumnType::Bytes),
            ("jsonb", ColumnType::Json),
            ("date", ColumnType::Date),
            ("timestamp with time zone", ColumnType::Timestamp),
            ("timestamptz", ColumnType::Timestamp),
            (
                "numeric(12,2)",
                ColumnType::Numeric {
                    precision: 12,
                    scale: 2,
                },
            ),
            (
                "bigint[]",
                ColumnType::Array(Box::new(ColumnType::Int64)),
            ),
        ];
        for (name, expected) in cases {
            let parsed = parse_column_type(Dialect::Postgres, name).unwrap();
            assert_eq!(parsed, expected, "{name}");
        }
    }

    #[test]
    fn unknown_names_fail_schema_derivation() {
        let err = parse_column_type(Dialect::GoogleSql, "GEOGRAPHY").unwrap_err();
        assert!(matches!(err, ScanError::Schema(_)), "{err}");
        // Dialects do not leak into each other.
        let err = parse_column_type(Dialect::Postgres, "INT64").unwrap_err();
        assert!(matches!(err, ScanError::Schema(_)), "{err}");
        let err = parse_column_type(Dialect::GoogleSql, "bigint").unwrap_err();
        assert!(matches!(err, ScanError::Schema(_)), "{err}");
    }

    #[test]
    fn arrow_mapping_is_dialect_independent_after_resolution() {
        assert_eq!(
            ColumnType::Numeric {
                precision: 38,
                scale: 9
            }
            .arrow_type(),
            DataType::Decimal128(38, 9)
        );
        assert_eq!(
            ColumnType::Timestamp.arrow_type(),
            DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into()))
        );
        assert_eq!(ColumnType::Date.arrow_type(), DataType::Date32);
        assert_eq!(
            ColumnType::Array(Box::new(ColumnType::Int64)).arrow_type(),
            DataType::List(Arc::new(Field::new_list_field(DataType::Int64, true)))
        );
        assert_eq!(ColumnType::Json.arrow_type(), DataType::Utf8);
    }

    #[test]
    fn derived_schema_preserves_column_order_and_nullability() {
        let records = vec![
            ColumnRecord {
                name: "id".into(),
                type_name: "INT64".into(),
                nullable: false,
            },
            ColumnRecord {
                name: "tags".into(),
                type_name: "ARRAY<STRING(MAX)>".into(),
                nullable: true,
            },
        ];
        let columns = derive_schema(Dialect::GoogleSql, &records).unwrap();
        let schema = arrow_schema(&columns);
        assert_eq!(schema.field(0).name(), "id");
        assert!(!schema.field(0).is_nullable());
        assert_eq!(schema.field(1).name(), "tags");
        assert!(schema.field(1).is_nullable());
    }
}
