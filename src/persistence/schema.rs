//! `SQLite` schema bootstrap logic.
//!
//! All table definitions use `CREATE TABLE IF NOT EXISTS` — safe to
//! re-run on every process start. Produces a convergent result.

use sqlx::SqlitePool;

use crate::Result;

/// Apply all table definitions to the connected `SQLite` database.
///
/// Creates the session-store and pairing tables idempotently. Safe to
/// call on every startup.
///
/// # Errors
///
/// Returns `AppError::Db` if any DDL statement fails.
pub async fn bootstrap_schema(pool: &SqlitePool) -> Result<()> {
    let ddl = r"
CREATE TABLE IF NOT EXISTS session_store (
    session_key     TEXT PRIMARY KEY NOT NULL,
    session_id      TEXT NOT NULL,
    label           TEXT,
    updated_at      TEXT NOT NULL,
    acp_meta        TEXT
);

CREATE TABLE IF NOT EXISTS pairing_request (
    channel         TEXT NOT NULL,
    account_id      TEXT NOT NULL,
    sender_id       TEXT NOT NULL,
    code            TEXT NOT NULL,
    created_at      TEXT NOT NULL,
    meta            TEXT,
    PRIMARY KEY (channel, account_id, sender_id)
);

CREATE INDEX IF NOT EXISTS idx_pairing_code ON pairing_request(code);
";

    sqlx::raw_sql(ddl).execute(pool).await?;
    Ok(())
}
