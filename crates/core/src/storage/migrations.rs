//! Database migration system
//!
//! Tracks schema versions and applies migrations in order.

use rusqlite::Connection;
use tracing::{info, instrument};

use crate::error::Result;

/// A database migration
pub struct Migration {
    /// Version number (must be sequential starting from 1)
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations in order
const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "Initial schema",
        sql: r#"
            -- This device's replica identity per room
            CREATE TABLE IF NOT EXISTS room_replicas (
                room TEXT PRIMARY KEY,
                replica_id TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            -- Append-only log of committed updates, local and remote
            CREATE TABLE IF NOT EXISTS updates (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                room TEXT NOT NULL,
                replica_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                payload BLOB NOT NULL,
                committed_at TEXT NOT NULL,
                UNIQUE(room, replica_id, seq)
            );

            -- Full document state as of a version
            CREATE TABLE IF NOT EXISTS snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                room TEXT NOT NULL,
                version INTEGER NOT NULL,
                payload BLOB NOT NULL,
                created_at TEXT NOT NULL
            );
        "#,
    },
    Migration {
        version: 2,
        description: "Add indexes for room loading",
        sql: r#"
            CREATE INDEX IF NOT EXISTS idx_updates_room ON updates(room, id);
            CREATE INDEX IF NOT EXISTS idx_snapshots_room ON snapshots(room, id);
        "#,
    },
    Migration {
        version: 3,
        description: "One replica id per session",
        sql: r#"
            -- Every start of a room runs under a new replica id
            CREATE TABLE IF NOT EXISTS replica_sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                room TEXT NOT NULL,
                replica_id TEXT NOT NULL UNIQUE,
                started_at TEXT NOT NULL
            );

            INSERT INTO replica_sessions (room, replica_id, started_at)
                SELECT room, replica_id, created_at FROM room_replicas;

            DROP TABLE room_replicas;

            CREATE INDEX IF NOT EXISTS idx_replica_sessions_room ON replica_sessions(room, id);
        "#,
    },
];

/// Initialize the migrations table
fn init_migrations_table(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at TEXT NOT NULL
        )",
        [],
    )?;
    Ok(())
}

fn get_current_version(conn: &Connection) -> Result<u32> {
    let version: Option<u32> = conn
        .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
            row.get(0)
        })
        .unwrap_or(None);
    Ok(version.unwrap_or(0))
}

fn record_migration(conn: &Connection, migration: &Migration) -> Result<()> {
    conn.execute(
        "INSERT INTO schema_migrations (version, description, applied_at) VALUES (?1, ?2, ?3)",
        rusqlite::params![
            migration.version,
            migration.description,
            chrono::Utc::now().to_rfc3339()
        ],
    )?;
    Ok(())
}

/// Run all pending migrations
#[instrument(skip(conn))]
pub fn run_migrations(conn: &Connection) -> Result<()> {
    init_migrations_table(conn)?;

    let current_version = get_current_version(conn)?;
    info!(current_version, "Checking for pending migrations");

    for migration in MIGRATIONS.iter().filter(|m| m.version > current_version) {
        info!(
            version = migration.version,
            description = migration.description,
            "Applying migration"
        );

        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(migration.sql)?;
        record_migration(&tx, migration)?;
        tx.commit()?;
    }

    let new_version = get_current_version(conn)?;
    if new_version > current_version {
        info!(
            from = current_version,
            to = new_version,
            "Database schema updated"
        );
    }

    Ok(())
}
