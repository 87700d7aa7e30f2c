use crate::errors::{Error, Result};
use crate::model::{NewReading, Peripheral, PeripheralType, Reading};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::types::Json;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

/// Result of recording a reading through the ingestion path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestOutcome {
    pub reading_id: i64,
    /// The peripheral did not exist and was created by this call.
    pub registered: bool,
}

/// Typed access to peripherals and readings.
///
/// The pool holds exactly one connection, so every operation (and every
/// transaction) is serialized against all others. Callers never need their
/// own locking.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct PeripheralRow {
    serial_number: String,
    kind: i64,
    name: Option<String>,
    created_at: i64,
}

#[derive(sqlx::FromRow)]
struct ReadingRow {
    id: i64,
    serial_number: String,
    timestamp: i64,
    data: Json<Map<String, Value>>,
}

impl TryFrom<PeripheralRow> for Peripheral {
    type Error = Error;

    fn try_from(row: PeripheralRow) -> Result<Self> {
        let code = u8::try_from(row.kind)
            .map_err(|_| decode_error(format!("peripheral type {} out of range", row.kind)))?;
        let peripheral_type = PeripheralType::try_from(code)
            .map_err(|e| decode_error(e.to_string()))?;

        Ok(Peripheral {
            serial_number: row.serial_number,
            peripheral_type,
            name: row.name,
            created_at: from_micros(row.created_at)?,
        })
    }
}

impl TryFrom<ReadingRow> for Reading {
    type Error = Error;

    fn try_from(row: ReadingRow) -> Result<Self> {
        Ok(Reading {
            id: row.id,
            serial_number: row.serial_number,
            timestamp: from_micros(row.timestamp)?,
            data: row.data.0,
        })
    }
}

fn from_micros(micros: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| decode_error(format!("timestamp {} out of range", micros)))
}

fn decode_error(message: String) -> Error {
    Error::Database(sqlx::Error::Decode(message.into()))
}

fn peripheral_code(kind: PeripheralType) -> i64 {
    i64::from(u8::from(kind))
}

impl Store {
    /// Opens (or creates) the database at `database_path` and runs migrations.
    ///
    /// `:memory:` opens a private in-memory database that lives as long as
    /// the store.
    pub async fn connect(database_path: &str) -> Result<Self> {
        info!("Opening database at {}", database_path);

        let options = if database_path == ":memory:" {
            SqliteConnectOptions::from_str("sqlite::memory:")?
        } else {
            SqliteConnectOptions::new()
                .filename(database_path)
                .create_if_missing(true)
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options.foreign_keys(true))
            .await?;

        info!("Running database migrations...");
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("Migrations completed");

        Ok(Self { pool })
    }

    /// Creates a peripheral unless one with the same serial number exists.
    ///
    /// Returns whether a row was created. An existing peripheral is never
    /// overwritten.
    pub async fn create_peripheral(
        &self,
        serial_number: &str,
        peripheral_type: PeripheralType,
    ) -> Result<bool> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO peripherals (serial_number, type, created_at) VALUES (?, ?, ?)",
        )
        .bind(serial_number)
        .bind(peripheral_code(peripheral_type))
        .bind(Utc::now().timestamp_micros())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Sets the name and type of an existing peripheral.
    ///
    /// Returns `false` when no peripheral has this serial number.
    pub async fn update_peripheral(
        &self,
        serial_number: &str,
        name: &str,
        peripheral_type: PeripheralType,
    ) -> Result<bool> {
        let result = sqlx::query("UPDATE peripherals SET name = ?, type = ? WHERE serial_number = ?")
            .bind(name)
            .bind(peripheral_code(peripheral_type))
            .bind(serial_number)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn get_all_peripherals(&self) -> Result<Vec<Peripheral>> {
        let rows = sqlx::query_as::<_, PeripheralRow>(
            "SELECT serial_number, type AS kind, name, created_at
             FROM peripherals
             ORDER BY created_at, serial_number",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Peripheral::try_from).collect()
    }

    pub async fn get_peripheral_by_serial(&self, serial_number: &str) -> Result<Option<Peripheral>> {
        let row = sqlx::query_as::<_, PeripheralRow>(
            "SELECT serial_number, type AS kind, name, created_at
             FROM peripherals
             WHERE serial_number = ?",
        )
        .bind(serial_number)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Peripheral::try_from).transpose()
    }

    /// Names are not unique; the earliest registered match wins.
    pub async fn get_peripheral_by_name(&self, name: &str) -> Result<Option<Peripheral>> {
        let row = sqlx::query_as::<_, PeripheralRow>(
            "SELECT serial_number, type AS kind, name, created_at
             FROM peripherals
             WHERE name = ?
             ORDER BY created_at, serial_number
             LIMIT 1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Peripheral::try_from).transpose()
    }

    /// Inserts a reading for a peripheral that must already exist.
    pub async fn insert_reading(&self, reading: &NewReading, received_at: DateTime<Utc>) -> Result<i64> {
        let mut tx = self.pool.begin().await?;

        let known = sqlx::query("SELECT 1 FROM peripherals WHERE serial_number = ?")
            .bind(&reading.serial_number)
            .fetch_optional(&mut *tx)
            .await?
            .is_some();
        if !known {
            return Err(Error::UnknownPeripheral(reading.serial_number.clone()));
        }

        let id = insert_reading_row(&mut tx, reading, received_at).await?;
        tx.commit().await?;

        Ok(id)
    }

    /// Registers the peripheral on first sight and stores the reading, in one
    /// transaction.
    ///
    /// Readers never observe a reading without its peripheral; a failure
    /// rolls back both writes.
    pub async fn record_reading(
        &self,
        reading: &NewReading,
        received_at: DateTime<Utc>,
    ) -> Result<IngestOutcome> {
        let mut tx = self.pool.begin().await?;

        let registered = sqlx::query(
            "INSERT OR IGNORE INTO peripherals (serial_number, type, created_at) VALUES (?, ?, ?)",
        )
        .bind(&reading.serial_number)
        .bind(peripheral_code(PeripheralType::Unknown))
        .bind(received_at.timestamp_micros())
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        let reading_id = insert_reading_row(&mut tx, reading, received_at).await?;
        tx.commit().await?;

        debug!(
            serial_number = %reading.serial_number,
            reading_id,
            registered,
            "Reading committed"
        );

        Ok(IngestOutcome {
            reading_id,
            registered,
        })
    }

    /// The newest `limit` readings of a peripheral, newest first.
    pub async fn get_last_readings(&self, serial_number: &str, limit: u32) -> Result<Vec<Reading>> {
        let rows = sqlx::query_as::<_, ReadingRow>(
            "SELECT id, serial_number, timestamp, data
             FROM readings
             WHERE serial_number = ?
             ORDER BY timestamp DESC, id DESC
             LIMIT ?",
        )
        .bind(serial_number)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Reading::try_from).collect()
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

async fn insert_reading_row(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    reading: &NewReading,
    received_at: DateTime<Utc>,
) -> Result<i64> {
    let timestamp = reading.timestamp.unwrap_or(received_at);

    let result = sqlx::query("INSERT INTO readings (serial_number, timestamp, data) VALUES (?, ?, ?)")
        .bind(&reading.serial_number)
        .bind(timestamp.timestamp_micros())
        .bind(Json(&reading.data))
        .execute(&mut **tx)
        .await?;

    Ok(result.last_insert_rowid())
}
