//! Database initialization
//!
//! Creates the database on first run with the full schema, idempotently.
//! All tables use TEXT uuids and TEXT ISO-8601 timestamps; status columns
//! are TEXT checked against the closed enums in `models`.

use crate::Result;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::path::Path;
use tracing::info;

/// Initialize database connection and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(20)
        .min_connections(5)
        .connect(&db_url)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    init_schema(&pool).await?;

    Ok(pool)
}

/// Apply pragmas and create the schema on an existing pool.
///
/// Split out from [`init_database`] so tests can run against in-memory
/// databases.
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query("PRAGMA foreign_keys = ON").execute(pool).await?;

    // WAL allows concurrent readers with one writer; scan and claim traffic
    // is read-heavy with short CAS writes
    sqlx::query("PRAGMA journal_mode = WAL").execute(pool).await?;

    // Short busy timeout; contention beyond this is handled by the bounded
    // backoff retry at call sites
    sqlx::query("PRAGMA busy_timeout = 250").execute(pool).await?;

    create_settings_table(pool).await?;
    create_couriers_table(pool).await?;
    create_delivery_codes_table(pool).await?;
    create_delivery_tasks_table(pool).await?;
    create_scan_events_table(pool).await?;

    init_default_settings(pool).await?;

    Ok(())
}

async fn create_settings_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_couriers_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS couriers (
            id TEXT PRIMARY KEY,
            tier INTEGER NOT NULL CHECK (tier BETWEEN 1 AND 4),
            zone_code TEXT NOT NULL,
            parent_id TEXT REFERENCES couriers(id),
            status TEXT NOT NULL DEFAULT 'active'
                CHECK (status IN ('active','pending','frozen')),
            points INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_couriers_zone ON couriers(zone_code)")
        .execute(pool)
        .await?;
    Ok(())
}

async fn create_delivery_codes_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS delivery_codes (
            id TEXT PRIMARY KEY,
            code TEXT NOT NULL UNIQUE,
            signature TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'unbound'
                CHECK (status IN ('unbound','bound','in_transit','delivered','expired','invalid')),
            recipient_op_code TEXT,
            sender_op_code TEXT,
            letter_id TEXT,
            issuer_id TEXT,
            issued_at_ms INTEGER NOT NULL,
            bound_at TEXT,
            expires_at TEXT NOT NULL,
            scan_count INTEGER NOT NULL DEFAULT 0
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_codes_status ON delivery_codes(status)")
        .execute(pool)
        .await?;
    Ok(())
}

async fn create_delivery_tasks_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS delivery_tasks (
            id TEXT PRIMARY KEY,
            code_id TEXT NOT NULL REFERENCES delivery_codes(id),
            assigned_courier_id TEXT,
            pickup_op_code TEXT NOT NULL,
            delivery_op_code TEXT NOT NULL,
            priority INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending','assigned','picked_up','delivered','escalated','failed')),
            current_tier INTEGER NOT NULL DEFAULT 1 CHECK (current_tier BETWEEN 1 AND 4),
            created_at TEXT NOT NULL,
            escalation_deadline TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_tasks_status_deadline
         ON delivery_tasks(status, escalation_deadline)",
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_scan_events_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS scan_events (
            id TEXT PRIMARY KEY,
            code_id TEXT NOT NULL,
            courier_id TEXT NOT NULL,
            action TEXT NOT NULL CHECK (action IN ('pickup','delivery')),
            signature_valid INTEGER NOT NULL,
            accepted INTEGER NOT NULL,
            result TEXT,
            location TEXT,
            created_at TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    // Backstop for scan idempotency: at most one accepted scan per
    // (code, action), even if two processors race past the dedup read
    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_scans_accepted_once
         ON scan_events(code_id, action) WHERE accepted = 1",
    )
    .execute(pool)
    .await?;
    Ok(())
}

/// Insert default settings if not present (INSERT OR IGNORE keeps operator
/// overrides intact across restarts)
async fn init_default_settings(pool: &SqlitePool) -> Result<()> {
    let defaults: [(&str, String); 4] = [
        ("code_ttl_hours", crate::config::DEFAULT_CODE_TTL_HOURS.to_string()),
        (
            "escalation_interval_secs",
            crate::config::DEFAULT_ESCALATION_INTERVAL_SECS.to_string(),
        ),
        (
            "escalation_deadline_secs",
            crate::config::DEFAULT_ESCALATION_DEADLINE_SECS.to_string(),
        ),
        ("max_lock_wait_ms", crate::config::DEFAULT_MAX_LOCK_WAIT_MS.to_string()),
    ];

    for (key, value) in defaults {
        sqlx::query("INSERT OR IGNORE INTO settings (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(value)
            .execute(pool)
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        init_schema(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn test_schema_init_is_idempotent() {
        let pool = memory_pool().await;
        // Second run must not fail
        init_schema(&pool).await.unwrap();

        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();

        for expected in ["couriers", "delivery_codes", "delivery_tasks", "scan_events", "settings"] {
            assert!(tables.iter().any(|t| t == expected), "missing table {}", expected);
        }
    }

    #[tokio::test]
    async fn test_default_settings_seeded() {
        let pool = memory_pool().await;
        let ttl: Option<(String,)> =
            sqlx::query_as("SELECT value FROM settings WHERE key = 'code_ttl_hours'")
                .fetch_optional(&pool)
                .await
                .unwrap();
        assert_eq!(ttl.unwrap().0, crate::config::DEFAULT_CODE_TTL_HOURS.to_string());
    }

    #[tokio::test]
    async fn test_accepted_scan_unique_index() {
        let pool = memory_pool().await;
        let insert = "INSERT INTO scan_events
            (id, code_id, courier_id, action, signature_valid, accepted, created_at)
            VALUES (?, ?, ?, ?, 1, ?, ?)";
        let now = chrono::Utc::now();

        sqlx::query(insert)
            .bind("e1").bind("c1").bind("k1").bind("pickup").bind(1).bind(now)
            .execute(&pool)
            .await
            .unwrap();

        // Second accepted pickup for the same code must violate the index
        let dup = sqlx::query(insert)
            .bind("e2").bind("c1").bind("k1").bind("pickup").bind(1).bind(now)
            .execute(&pool)
            .await;
        assert!(dup.is_err());

        // A rejected replay is fine
        sqlx::query(insert)
            .bind("e3").bind("c1").bind("k1").bind("pickup").bind(0).bind(now)
            .execute(&pool)
            .await
            .unwrap();
    }
}
