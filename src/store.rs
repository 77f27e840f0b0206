//! DongleStore - keyed index of live dongle records
//!
//! ## Responsibilities
//!
//! - Point lookups by device path
//! - The "best candidate per IMEI" query (minimum tty, ties by path)
//! - Insert/update/remove with store-owned timestamps
//!
//! The pool is capped at a single connection, which gives every operation
//! single-writer serializability. Callers never hold a transaction across a
//! serial probe or filesystem call; no operation here spans more than one
//! statement.

use crate::error::{Error, Result};
use crate::models::Dongle;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

const MIGRATION_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS dongles(
    imei        TEXT NOT NULL,
    imsi        TEXT NOT NULL,
    path        TEXT NOT NULL UNIQUE,
    symlink     INTEGER NOT NULL DEFAULT 0,
    tty         INTEGER NOT NULL,
    properties  TEXT NOT NULL DEFAULT '{}',
    created_on  TEXT NOT NULL,
    updated_on  TEXT NOT NULL
)
"#;

const DONGLE_COLUMNS: &str = "imei, imsi, path, symlink, tty, properties, created_on, updated_on";

/// Database row for dongles
#[derive(Debug, sqlx::FromRow)]
struct DongleRow {
    imei: String,
    imsi: String,
    path: String,
    symlink: bool,
    tty: i64,
    properties: String,
    created_on: DateTime<Utc>,
    updated_on: DateTime<Utc>,
}

impl DongleRow {
    fn into_dongle(self) -> Dongle {
        Dongle {
            imei: self.imei,
            imsi: self.imsi,
            path: self.path,
            is_symlinked: self.symlink,
            tty: self.tty,
            properties: serde_json::from_str(&self.properties).unwrap_or_default(),
            created_on: self.created_on,
            updated_on: self.updated_on,
        }
    }
}

/// Dongle index backed by an in-memory SQLite database
#[derive(Clone)]
pub struct DongleStore {
    pool: SqlitePool,
}

impl DongleStore {
    /// Connect and run the migration
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(MIGRATION_SQL).execute(&self.pool).await?;
        Ok(())
    }

    /// Point lookup by device path
    pub async fn get(&self, path: &str) -> Result<Option<Dongle>> {
        let row: Option<DongleRow> = sqlx::query_as(&format!(
            "SELECT {DONGLE_COLUMNS} FROM dongles WHERE path = ? LIMIT 1"
        ))
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(DongleRow::into_dongle))
    }

    /// Whether a record for this (imei, path) pair is already tracked
    pub async fn exists(&self, imei: &str, path: &str) -> Result<bool> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM dongles WHERE imei = ? AND path = ?")
                .bind(imei)
                .bind(path)
                .fetch_one(&self.pool)
                .await?;

        Ok(count > 0)
    }

    /// The record eligible to hold the symlinks for this IMEI: minimum tty
    /// among all records sharing the IMEI, ties broken by path ascending.
    pub async fn best_candidate(&self, imei: &str) -> Result<Option<Dongle>> {
        let row: Option<DongleRow> = sqlx::query_as(&format!(
            "SELECT {DONGLE_COLUMNS} FROM dongles WHERE imei = ? ORDER BY tty ASC, path ASC LIMIT 1"
        ))
        .bind(imei)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(DongleRow::into_dongle))
    }

    /// Insert a new record; sets both timestamps. A second record for the
    /// same path is a [`Error::DuplicatePath`].
    pub async fn insert(&self, d: &Dongle) -> Result<Dongle> {
        let now = Utc::now();
        let properties = serde_json::to_string(&d.properties)?;

        sqlx::query(
            "INSERT INTO dongles (imei, imsi, path, symlink, tty, properties, created_on, updated_on) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&d.imei)
        .bind(&d.imsi)
        .bind(&d.path)
        .bind(d.is_symlinked)
        .bind(d.tty)
        .bind(&properties)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Error::DuplicatePath(d.path.clone())
            }
            _ => Error::Database(e),
        })?;

        let mut stored = d.clone();
        stored.created_on = now;
        stored.updated_on = now;
        Ok(stored)
    }

    /// Update a record in place (keyed by path); bumps `updated_on`
    pub async fn update(&self, d: &Dongle) -> Result<Dongle> {
        let now = Utc::now();
        let properties = serde_json::to_string(&d.properties)?;

        sqlx::query(
            "UPDATE dongles SET imsi = ?, symlink = ?, properties = ?, updated_on = ? WHERE path = ?",
        )
        .bind(&d.imsi)
        .bind(d.is_symlinked)
        .bind(&properties)
        .bind(now)
        .bind(&d.path)
        .execute(&self.pool)
        .await?;

        let mut stored = d.clone();
        stored.updated_on = now;
        Ok(stored)
    }

    /// Remove a record; missing records are not an error
    pub async fn remove(&self, d: &Dongle) -> Result<()> {
        sqlx::query("DELETE FROM dongles WHERE imei = ? AND path = ?")
            .bind(&d.imei)
            .bind(&d.path)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Every live record, for the initial snapshot sent to new subscribers
    pub async fn list_all(&self) -> Result<Vec<Dongle>> {
        let rows: Vec<DongleRow> = sqlx::query_as(&format!(
            "SELECT {DONGLE_COLUMNS} FROM dongles ORDER BY path ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(DongleRow::into_dongle).collect())
    }
}
