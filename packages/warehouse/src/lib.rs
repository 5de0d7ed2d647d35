#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! `DuckDB` warehouse for energy usage records.
//!
//! Records live in `{schema}.usage_records`, keyed by
//! `(meter_id, reading_timestamp, commodity)`. Each file is loaded inside
//! its own transaction on its own connection: rows are first collected
//! into a temporary staging table, reduced to the last row per key, then
//! merged into the target with `INSERT ... ON CONFLICT DO UPDATE`.
//! Any error, including one yielded by the record stream, rolls the whole
//! file back.

use std::path::Path;
use std::str::FromStr as _;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use duckdb::Connection;
use energy_usage_config::WarehouseIdentity;
use energy_usage_models::{Commodity, UsageRecord};
use energy_usage_source::ParseError;
use energy_usage_source::parse::{CONSUMPTION_PRECISION, CONSUMPTION_SCALE};
use rust_decimal::Decimal;

/// Number of rows per staging INSERT.
const CHUNK_SIZE: usize = 2_000;

/// Column type for consumption values, matching what the parser accepts.
fn decimal_type() -> String {
    format!("DECIMAL({CONSUMPTION_PRECISION}, {CONSUMPTION_SCALE})")
}

/// Columns bound per staged row.
const COLUMNS_PER_ROW: usize = 9;

/// Errors that can occur while loading into the warehouse.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// `DuckDB` error.
    #[error("DuckDB error: {0}")]
    Database(#[from] duckdb::Error),

    /// The record stream failed; nothing from the file was kept.
    #[error("Source error: {0}")]
    Source(#[from] ParseError),

    /// I/O error (creating the database directory).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The blocking load task panicked or was cancelled.
    #[error("Load task failed: {message}")]
    Join {
        /// Description of what went wrong.
        message: String,
    },

    /// A previous load panicked while holding the connection.
    #[error("Warehouse connection lock poisoned")]
    Poisoned,
}

/// Rows written by one file load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadCounts {
    /// Keys that were new to the warehouse.
    pub inserted: u64,
    /// Keys that already existed and were overwritten.
    pub updated: u64,
}

/// Upserts one file's records atomically.
pub trait Load: Send + Sync {
    /// Drains `records` into the warehouse inside a single transaction.
    ///
    /// # Errors
    ///
    /// Returns [`LoadError`] if the stream yields an error or any database
    /// operation fails. The transaction is rolled back in both cases.
    fn load(
        &self,
        records: &mut dyn Iterator<Item = Result<UsageRecord, ParseError>>,
    ) -> Result<LoadCounts, LoadError>;
}

/// Warehouse backed by a `DuckDB` file.
pub struct DuckDbWarehouse {
    conn: Mutex<Connection>,
    table: String,
}

impl std::fmt::Debug for DuckDbWarehouse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuckDbWarehouse")
            .field("table", &self.table)
            .finish_non_exhaustive()
    }
}

impl DuckDbWarehouse {
    /// Opens (or creates) the warehouse database and ensures the schema
    /// exists. Logs the engine version as a connectivity check.
    ///
    /// # Errors
    ///
    /// Returns [`LoadError`] if the directory, connection, or schema
    /// cannot be created.
    pub fn open(identity: &WarehouseIdentity) -> Result<Self, LoadError> {
        if let Some(parent) = identity.database.parent()
            && !parent.as_os_str().is_empty()
        {
            energy_usage_source::paths::ensure_dir(parent)?;
        }

        let conn = Connection::open(&identity.database)?;
        Self::with_connection(conn, &identity.schema, &identity.database)
    }

    /// Opens a throwaway in-memory warehouse.
    ///
    /// # Errors
    ///
    /// Returns [`LoadError`] if the schema cannot be created.
    pub fn open_in_memory(schema: &str) -> Result<Self, LoadError> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn, schema, Path::new(":memory:"))
    }

    fn with_connection(conn: Connection, schema: &str, path: &Path) -> Result<Self, LoadError> {
        let version: String = conn.query_row("SELECT version()", [], |row| row.get(0))?;
        log::info!("Connected to DuckDB {version} at {}", path.display());

        let table = format!("{schema}.usage_records");
        let decimal = decimal_type();
        conn.execute_batch(&format!(
            "CREATE SCHEMA IF NOT EXISTS {schema};

             CREATE TABLE IF NOT EXISTS {table} (
                meter_id TEXT NOT NULL,
                reading_timestamp TIMESTAMP NOT NULL,
                commodity TEXT NOT NULL,
                consumption_value {decimal} NOT NULL,
                source_file_name TEXT NOT NULL,
                meter_count INTEGER,
                mean_consumption {decimal},
                median_consumption {decimal},
                loaded_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (meter_id, reading_timestamp, commodity)
            );"
        ))?;

        Ok(Self {
            conn: Mutex::new(conn),
            table,
        })
    }

    /// Fresh connection to the same database, so concurrent loads never
    /// share a transaction.
    fn connection(&self) -> Result<Connection, LoadError> {
        let conn = self.conn.lock().map_err(|_| LoadError::Poisoned)?;
        Ok(conn.try_clone()?)
    }

    /// Number of stored records, optionally for one commodity.
    ///
    /// # Errors
    ///
    /// Returns [`LoadError`] if the query fails.
    pub fn record_count(&self, commodity: Option<Commodity>) -> Result<u64, LoadError> {
        let conn = self.connection()?;
        let count: i64 = match commodity {
            Some(commodity) => conn.query_row(
                &format!("SELECT COUNT(*) FROM {} WHERE commodity = ?", self.table),
                [commodity.as_ref()],
                |row| row.get(0),
            )?,
            None => conn.query_row(&format!("SELECT COUNT(*) FROM {}", self.table), [], |row| {
                row.get(0)
            })?,
        };
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Stored consumption for one natural key, if present.
    ///
    /// # Errors
    ///
    /// Returns [`LoadError`] if the query fails.
    pub fn consumption_value(
        &self,
        meter_id: &str,
        reading_timestamp: DateTime<Utc>,
        commodity: Commodity,
    ) -> Result<Option<Decimal>, LoadError> {
        let conn = self.connection()?;
        let result = conn.query_row(
            &format!(
                "SELECT CAST(consumption_value AS TEXT) FROM {}
                 WHERE meter_id = ? AND reading_timestamp = CAST(? AS TIMESTAMP) AND commodity = ?",
                self.table
            ),
            [
                meter_id,
                format_timestamp(reading_timestamp).as_str(),
                commodity.as_ref(),
            ],
            |row| row.get::<_, String>(0),
        );
        match result {
            Ok(text) => Ok(Decimal::from_str(trim_scale(&text)).ok()),
            Err(duckdb::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(LoadError::Database(e)),
        }
    }

    fn load_in_transaction(
        &self,
        conn: &Connection,
        records: &mut dyn Iterator<Item = Result<UsageRecord, ParseError>>,
    ) -> Result<LoadCounts, LoadError> {
        let decimal = decimal_type();
        conn.execute_batch(&format!(
            "CREATE OR REPLACE TEMP TABLE staged_usage (
                seq BIGINT NOT NULL,
                meter_id TEXT NOT NULL,
                reading_timestamp TIMESTAMP NOT NULL,
                commodity TEXT NOT NULL,
                consumption_value {decimal} NOT NULL,
                source_file_name TEXT NOT NULL,
                meter_count INTEGER,
                mean_consumption {decimal},
                median_consumption {decimal}
            );"
        ))?;

        let mut seq = 0i64;
        let mut chunk: Vec<UsageRecord> = Vec::with_capacity(CHUNK_SIZE);
        for record in records {
            chunk.push(record?);
            if chunk.len() == CHUNK_SIZE {
                seq = stage_chunk(conn, &chunk, seq)?;
                chunk.clear();
            }
        }
        stage_chunk(conn, &chunk, seq)?;

        // Later rows for the same key win.
        conn.execute_batch(
            "CREATE OR REPLACE TEMP TABLE staged_latest AS
             SELECT * EXCLUDE (seq) FROM staged_usage
             QUALIFY row_number() OVER (
                PARTITION BY meter_id, reading_timestamp, commodity
                ORDER BY seq DESC
             ) = 1;",
        )?;

        let staged: i64 =
            conn.query_row("SELECT COUNT(*) FROM staged_latest", [], |row| row.get(0))?;
        let existing: i64 = conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM staged_latest s
                 JOIN {} t USING (meter_id, reading_timestamp, commodity)",
                self.table
            ),
            [],
            |row| row.get(0),
        )?;

        conn.execute(
            &format!(
                "INSERT INTO {} (
                    meter_id, reading_timestamp, commodity, consumption_value,
                    source_file_name, meter_count, mean_consumption,
                    median_consumption, loaded_at
                )
                SELECT
                    meter_id, reading_timestamp, commodity, consumption_value,
                    source_file_name, meter_count, mean_consumption,
                    median_consumption, current_timestamp
                FROM staged_latest
                ON CONFLICT (meter_id, reading_timestamp, commodity) DO UPDATE SET
                    consumption_value = EXCLUDED.consumption_value,
                    source_file_name = EXCLUDED.source_file_name,
                    meter_count = EXCLUDED.meter_count,
                    mean_consumption = EXCLUDED.mean_consumption,
                    median_consumption = EXCLUDED.median_consumption,
                    loaded_at = EXCLUDED.loaded_at",
                self.table
            ),
            [],
        )?;
        conn.execute_batch("DROP TABLE staged_latest; DROP TABLE staged_usage;")?;

        let staged = u64::try_from(staged).unwrap_or(0);
        let updated = u64::try_from(existing).unwrap_or(0);
        Ok(LoadCounts {
            inserted: staged.saturating_sub(updated),
            updated,
        })
    }
}

impl Load for DuckDbWarehouse {
    fn load(
        &self,
        records: &mut dyn Iterator<Item = Result<UsageRecord, ParseError>>,
    ) -> Result<LoadCounts, LoadError> {
        let conn = self.connection()?;
        conn.execute_batch("BEGIN TRANSACTION")?;

        match self.load_in_transaction(&conn, records) {
            Ok(counts) => {
                conn.execute_batch("COMMIT")?;
                Ok(counts)
            }
            Err(e) => {
                if let Err(rollback) = conn.execute_batch("ROLLBACK") {
                    log::warn!("Rollback after failed load also failed: {rollback}");
                }
                Err(e)
            }
        }
    }
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S%.f").to_string()
}

/// Appends one chunk to the staging table, numbering rows from `seq`.
/// Returns the next free sequence number.
fn stage_chunk(conn: &Connection, chunk: &[UsageRecord], seq: i64) -> Result<i64, LoadError> {
    if chunk.is_empty() {
        return Ok(seq);
    }

    let mut sql = String::from(
        "INSERT INTO staged_usage (
            seq, meter_id, reading_timestamp, commodity, consumption_value,
            source_file_name, meter_count, mean_consumption, median_consumption
        ) VALUES ",
    );
    let decimal = decimal_type();
    let row = format!(
        "(?, ?, CAST(? AS TIMESTAMP), ?, CAST(? AS {decimal}), ?, ?, \
         CAST(? AS {decimal}), CAST(? AS {decimal}))"
    );
    for i in 0..chunk.len() {
        if i > 0 {
            sql.push_str(", ");
        }
        sql.push_str(&row);
    }

    let mut stmt = conn.prepare(&sql)?;
    let mut param_idx = 1usize;
    let mut next_seq = seq;

    for record in chunk {
        stmt.raw_bind_parameter(param_idx, next_seq)?;
        stmt.raw_bind_parameter(param_idx + 1, &record.meter_id)?;
        stmt.raw_bind_parameter(param_idx + 2, format_timestamp(record.reading_timestamp))?;
        stmt.raw_bind_parameter(param_idx + 3, record.commodity.as_ref())?;
        stmt.raw_bind_parameter(param_idx + 4, record.consumption_value.to_string())?;
        stmt.raw_bind_parameter(param_idx + 5, &record.source_file_name)?;
        stmt.raw_bind_parameter(param_idx + 6, record.meter_count)?;
        stmt.raw_bind_parameter(
            param_idx + 7,
            record.mean_consumption.map(|d| d.to_string()),
        )?;
        stmt.raw_bind_parameter(
            param_idx + 8,
            record.median_consumption.map(|d| d.to_string()),
        )?;

        param_idx += COLUMNS_PER_ROW;
        next_seq += 1;
    }

    stmt.raw_execute()?;
    Ok(next_seq)
}

/// Drops the zero padding `DuckDB` adds to fill the column scale.
fn trim_scale(text: &str) -> &str {
    if text.contains('.') {
        text.trim_end_matches('0').trim_end_matches('.')
    } else {
        text
    }
}
