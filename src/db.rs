use crate::entities::{Alert, AlertOwner, Vehicle, VehicleRecord};
use crate::matcher::fold_case;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

// ============================================================================
// STORE INTERFACE
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("alert store query failed")]
    Sqlite(#[from] rusqlite::Error),

    #[error("alert store connection lock was poisoned")]
    Poisoned,
}

/// Read side of the alert store, plus the delivery ledger the pipeline uses
/// to suppress duplicate notifications.
///
/// Lookups that find nothing return `Ok(None)` / an empty `Vec`. Errors mean
/// the store itself could not be read.
pub trait AlertStore: Send + Sync + 'static {
    fn find_alert_by_external_id(&self, external_id: &Uuid) -> Result<Option<Alert>, StoreError>;

    /// Manufacturer and model compare case-insensitively, year exactly.
    fn find_vehicles_by_attributes(
        &self,
        manufacturer: &str,
        model: &str,
        model_year: &str,
    ) -> Result<Vec<VehicleRecord>, StoreError>;

    fn find_alerts_by_vehicle(&self, vehicle_id: i64) -> Result<Vec<Alert>, StoreError>;

    /// Whether a notification for `listing_key` was already sent for `alert_id`.
    fn is_delivered(&self, alert_id: i64, listing_key: &str) -> Result<bool, StoreError>;

    /// Records a sent notification. Recording the same pair twice is a no-op.
    fn record_delivery(&self, alert_id: i64, listing_key: &str) -> Result<(), StoreError>;
}

// ============================================================================
// SCHEMA
// ============================================================================

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            email TEXT UNIQUE NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // Vehicles are deduplicated on the exact triple. The *_key columns hold
    // the case-folded names the attribute lookup searches on.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS vehicles (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            manufacturer_name TEXT NOT NULL,
            model_name TEXT NOT NULL,
            model_year TEXT NOT NULL,
            manufacturer_key TEXT NOT NULL,
            model_key TEXT NOT NULL,
            UNIQUE (manufacturer_name, model_name, model_year)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS alerts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            external_id TEXT UNIQUE NOT NULL,
            user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            vehicle_id INTEGER NOT NULL REFERENCES vehicles(id),
            branch TEXT,
            created_at TEXT NOT NULL,
            modified_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS deliveries (
            alert_id INTEGER NOT NULL REFERENCES alerts(id) ON DELETE CASCADE,
            listing_key TEXT NOT NULL,
            delivered_at TEXT NOT NULL,
            PRIMARY KEY (alert_id, listing_key)
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_vehicles_attributes
         ON vehicles(manufacturer_key, model_key, model_year)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_alerts_vehicle ON alerts(vehicle_id)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// ROW MAPPING
// ============================================================================

const ALERT_COLUMNS: &str = "a.id, a.external_id, u.id, u.email,
                v.manufacturer_name, v.model_name, v.model_year,
                a.branch, a.created_at, a.modified_at
         FROM alerts a
         JOIN users u ON u.id = a.user_id
         JOIN vehicles v ON v.id = a.vehicle_id";

fn parse_timestamp(idx: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn alert_from_row(row: &Row<'_>) -> rusqlite::Result<Alert> {
    let external_id: String = row.get(1)?;
    let created_at: String = row.get(8)?;
    let modified_at: String = row.get(9)?;

    Ok(Alert {
        id: row.get(0)?,
        external_id: Uuid::parse_str(&external_id).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
        })?,
        owner: AlertOwner {
            id: row.get(2)?,
            email: row.get(3)?,
        },
        vehicle: Vehicle {
            manufacturer_name: row.get(4)?,
            model_name: row.get(5)?,
            model_year: row.get(6)?,
        },
        branch: row.get(7)?,
        created_at: parse_timestamp(8, &created_at)?,
        modified_at: parse_timestamp(9, &modified_at)?,
    })
}

// ============================================================================
// QUERIES
// ============================================================================

pub fn find_alert_by_external_id(
    conn: &Connection,
    external_id: &Uuid,
) -> rusqlite::Result<Option<Alert>> {
    conn.query_row(
        &format!("SELECT {ALERT_COLUMNS} WHERE a.external_id = ?1"),
        [external_id.to_string()],
        alert_from_row,
    )
    .optional()
}

pub fn find_vehicles_by_attributes(
    conn: &Connection,
    manufacturer: &str,
    model: &str,
    model_year: &str,
) -> rusqlite::Result<Vec<VehicleRecord>> {
    let mut stmt = conn.prepare(
        "SELECT id, manufacturer_name, model_name, model_year
         FROM vehicles
         WHERE manufacturer_key = ?1
           AND model_key = ?2
           AND model_year = ?3
         ORDER BY id",
    )?;

    let vehicles = stmt
        .query_map(params![fold_case(manufacturer), fold_case(model), model_year], |row| {
            Ok(VehicleRecord {
                id: row.get(0)?,
                vehicle: Vehicle {
                    manufacturer_name: row.get(1)?,
                    model_name: row.get(2)?,
                    model_year: row.get(3)?,
                },
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(vehicles)
}

pub fn find_alerts_by_vehicle(conn: &Connection, vehicle_id: i64) -> rusqlite::Result<Vec<Alert>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ALERT_COLUMNS} WHERE a.vehicle_id = ?1 ORDER BY a.id"
    ))?;

    let alerts = stmt
        .query_map([vehicle_id], alert_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(alerts)
}

pub fn list_alerts(conn: &Connection) -> Result<Vec<Alert>> {
    let mut stmt = conn.prepare(&format!("SELECT {ALERT_COLUMNS} ORDER BY a.id"))?;

    let alerts = stmt
        .query_map([], alert_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(alerts)
}

// ============================================================================
// ALERT MANAGEMENT
// Writes done by the alert-management side; the CLI and tests use them to
// seed the store.
// ============================================================================

pub fn get_or_create_user(conn: &Connection, email: &str) -> Result<i64> {
    conn.execute("INSERT OR IGNORE INTO users (email) VALUES (?1)", [email])?;

    let id = conn
        .query_row("SELECT id FROM users WHERE email = ?1", [email], |row| row.get(0))
        .with_context(|| format!("looking up user {email}"))?;

    Ok(id)
}

pub fn get_or_create_vehicle(conn: &Connection, vehicle: &Vehicle) -> Result<i64> {
    conn.execute(
        "INSERT OR IGNORE INTO vehicles
             (manufacturer_name, model_name, model_year, manufacturer_key, model_key)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            vehicle.manufacturer_name,
            vehicle.model_name,
            vehicle.model_year,
            fold_case(&vehicle.manufacturer_name),
            fold_case(&vehicle.model_name),
        ],
    )?;

    let id = conn
        .query_row(
            "SELECT id FROM vehicles
             WHERE manufacturer_name = ?1 AND model_name = ?2 AND model_year = ?3",
            params![vehicle.manufacturer_name, vehicle.model_name, vehicle.model_year],
            |row| row.get(0),
        )
        .with_context(|| format!("looking up vehicle {vehicle}"))?;

    Ok(id)
}

/// Creates an alert for `email` on `vehicle`, minting a fresh correlation id.
pub fn insert_alert(
    conn: &Connection,
    email: &str,
    vehicle: &Vehicle,
    branch: Option<&str>,
) -> Result<Alert> {
    let user_id = get_or_create_user(conn, email)?;
    let vehicle_id = get_or_create_vehicle(conn, vehicle)?;

    let external_id = Uuid::new_v4();
    let now = Utc::now();
    let now_str = now.to_rfc3339();

    conn.execute(
        "INSERT INTO alerts (external_id, user_id, vehicle_id, branch, created_at, modified_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
        params![external_id.to_string(), user_id, vehicle_id, branch, now_str],
    )
    .context("inserting alert")?;

    Ok(Alert {
        id: conn.last_insert_rowid(),
        external_id,
        owner: AlertOwner {
            id: user_id,
            email: email.to_string(),
        },
        vehicle: vehicle.clone(),
        branch: branch.map(str::to_string),
        created_at: now,
        modified_at: now,
    })
}

/// Deletes the alert with `external_id`. Returns whether one existed.
pub fn delete_alert(conn: &Connection, external_id: &Uuid) -> Result<bool> {
    let deleted = conn.execute(
        "DELETE FROM alerts WHERE external_id = ?1",
        [external_id.to_string()],
    )?;

    Ok(deleted > 0)
}

/// One row of an alert seed file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AlertSeed {
    pub email: String,
    pub manufacturer: String,
    pub model: String,
    pub year: String,
    /// Empty means any branch
    pub branch: Option<String>,
}

pub fn load_alerts_csv(csv_path: &Path) -> Result<Vec<AlertSeed>> {
    let mut rdr = csv::Reader::from_path(csv_path).context("Failed to open CSV file")?;

    let mut seeds = Vec::new();
    for result in rdr.deserialize() {
        let seed: AlertSeed = result.context("Failed to deserialize alert row")?;
        seeds.push(seed);
    }

    Ok(seeds)
}

pub fn import_alerts(conn: &Connection, seeds: &[AlertSeed]) -> Result<Vec<Alert>> {
    let mut alerts = Vec::with_capacity(seeds.len());

    for seed in seeds {
        let vehicle = Vehicle::new(&seed.manufacturer, &seed.model, &seed.year);
        let branch = seed.branch.as_deref().filter(|b| !b.trim().is_empty());
        alerts.push(insert_alert(conn, &seed.email, &vehicle, branch)?);
    }

    Ok(alerts)
}

// ============================================================================
// SQLITE STORE
// ============================================================================

/// `AlertStore` over a single SQLite connection.
///
/// Every call takes the lock for one query only; nothing is held while the
/// pipeline sends mail.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn new(conn: Connection) -> Result<Self> {
        setup_database(&conn)?;
        Ok(SqliteStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database at {:?}", db_path))?;
        Self::new(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    /// Runs `f` against the underlying connection.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> T) -> Result<T, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(f(&conn))
    }
}

impl AlertStore for SqliteStore {
    fn find_alert_by_external_id(&self, external_id: &Uuid) -> Result<Option<Alert>, StoreError> {
        Ok(self.with_conn(|conn| find_alert_by_external_id(conn, external_id))??)
    }

    fn find_vehicles_by_attributes(
        &self,
        manufacturer: &str,
        model: &str,
        model_year: &str,
    ) -> Result<Vec<VehicleRecord>, StoreError> {
        Ok(self.with_conn(|conn| {
            find_vehicles_by_attributes(conn, manufacturer, model, model_year)
        })??)
    }

    fn find_alerts_by_vehicle(&self, vehicle_id: i64) -> Result<Vec<Alert>, StoreError> {
        Ok(self.with_conn(|conn| find_alerts_by_vehicle(conn, vehicle_id))??)
    }

    fn is_delivered(&self, alert_id: i64, listing_key: &str) -> Result<bool, StoreError> {
        Ok(self.with_conn(|conn| {
            conn.query_row(
                "SELECT EXISTS(
                     SELECT 1 FROM deliveries WHERE alert_id = ?1 AND listing_key = ?2
                 )",
                params![alert_id, listing_key],
                |row| row.get(0),
            )
        })??)
    }

    fn record_delivery(&self, alert_id: i64, listing_key: &str) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO deliveries (alert_id, listing_key, delivered_at)
                 VALUES (?1, ?2, ?3)",
                params![alert_id, listing_key, Utc::now().to_rfc3339()],
            )
        })??;

        Ok(())
    }
}
