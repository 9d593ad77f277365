//! Connection configuration for one scanned table.
//!
//! Options arrive either as a string map from the host engine's table
//! registration surface or from `SPAN_FUSION_*` environment variables.
//! Validation happens once here; the rest of the crate works with the
//! resolved [`ConnectOptions`].

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use span_store::{Dialect, TableRef};

/// Resolved options identifying the database and table to scan.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Cloud project that owns the instance.
    pub project_id: String,
    /// Database instance within the project.
    pub instance_id: String,
    /// Database within the instance.
    pub database_id: String,
    /// Table to scan.
    pub table: String,
    /// SQL dialect the database was created with.
    pub dialect: Dialect,
    /// Overrides the endpoint to point at a local emulator when set.
    pub emulator_endpoint: Option<String>,
    /// Requests isolated compute capacity for partition reads.
    pub data_boost: bool,
}

impl ConnectOptions {
    /// Builds options from the key/value map supplied at table registration.
    pub fn from_map(options: &HashMap<String, String>) -> Result<Self> {
        let required = |key: &str| -> Result<String> {
            options
                .get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .with_context(|| format!("missing required option {key:?}"))
        };
        Ok(Self {
            project_id: required("projectId")?,
            instance_id: required("instanceId")?,
            database_id: required("databaseId")?,
            table: required("table")?,
            dialect: parse_dialect(options.get("dialect").map(String::as_str))?,
            emulator_endpoint: options
                .get("emulatorEndpoint")
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()),
            data_boost: parse_bool(options.get("dataBoost").map(String::as_str), false)?,
        })
    }

    /// Builds options from `SPAN_FUSION_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let required = |key: &str| -> Result<String> {
            std::env::var(key).with_context(|| format!("missing required env var {key}"))
        };
        Ok(Self {
            project_id: required("SPAN_FUSION_PROJECT_ID")?,
            instance_id: required("SPAN_FUSION_INSTANCE_ID")?,
            database_id: required("SPAN_FUSION_DATABASE_ID")?,
            table: required("SPAN_FUSION_TABLE")?,
            dialect: parse_dialect(std::env::var("SPAN_FUSION_DIALECT").ok().as_deref())?,
            emulator_endpoint: std::env::var("SPAN_FUSION_EMULATOR_ENDPOINT")
                .ok()
                .filter(|v| !v.is_empty()),
            data_boost: parse_bool(
                std::env::var("SPAN_FUSION_DATA_BOOST").ok().as_deref(),
                false,
            )?,
        })
    }

    /// Fully qualified reference for the configured table.
    pub fn table_ref(&self) -> TableRef {
        TableRef {
            project: self.project_id.clone(),
            instance: self.instance_id.clone(),
            database: self.database_id.clone(),
            table: self.table.clone(),
            dialect: self.dialect,
        }
    }
}

/// Parses an optional dialect name, defaulting to GoogleSQL.
fn parse_dialect(value: Option<&str>) -> Result<Dialect> {
    match value.map(str::trim) {
        None | Some("") => Ok(Dialect::GoogleSql),
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "googlesql" | "google_standard_sql" => Ok(Dialect::GoogleSql),
            "postgresql" | "postgres" => Ok(Dialect::Postgres),
            _ => bail!("invalid dialect value: {raw}"),
        },
    }
}

/// Parses an optional boolean flag with fallback default.
fn parse_bool(value: Option<&str>, default_value: bool) -> Result<bool> {
    match value.map(str::trim) {
        None | Some("") => Ok(default_value),
        Some(raw) => raw
            .to_ascii_lowercase()
            .parse::<bool>()
            .with_context(|| format!("invalid boolean value: {raw}")),
    }
}
