//! Database connection management
//!
//! Postgres connections go through sqlx; the SQLite backend uses rusqlite.
//! Every connection is tested before it is handed out so an unreachable
//! database fails the stage that asked for it.

use crate::error::{EtlError, Result};
use rusqlite::{Connection as SqliteConnection, OpenFlags};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);
const SQLITE_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open a single-connection pool for one stage.
///
/// One connection keeps every statement of the stage, including an open
/// transaction, on the same session.
pub async fn connect_postgres(target: &str, database_url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect(database_url)
        .await
        .map_err(|e| EtlError::connection(target, e))?;

    // Test the connection
    sqlx::query("SELECT 1")
        .execute(&pool)
        .await
        .map_err(|e| EtlError::connection(target, e))?;

    Ok(pool)
}

/// Open a SQLite database file. The file must already exist; schemas are
/// provisioned outside the pipeline.
pub fn connect_sqlite(target: &str, path: &str, read_only: bool) -> Result<SqliteConnection> {
    let flags = if read_only {
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX
    } else {
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX
    };

    let conn = SqliteConnection::open_with_flags(path, flags)
        .map_err(|e| EtlError::connection(target, e))?;
    conn.busy_timeout(SQLITE_BUSY_TIMEOUT)
        .map_err(|e| EtlError::connection(target, e))?;

    conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
        .map_err(|e| EtlError::connection(target, e))?;

    Ok(conn)
}
