//! Session Metadata Store (§4.3): CRUD over persisted per-session ACP
//! metadata with an optimistic mutate-closure API.
//!
//! Backed by `SQLite` with a single-writer connection pool (see
//! [`super::db`]), which gives "writes are serialized per session key" for
//! free at the connection-pool level — every write for every key already
//! goes through the same one physical connection, so `upsert` additionally
//! wraps its read-modify-write in an immediate transaction purely to make
//! "the mutate closure observes the committed state" an explicit guarantee
//! rather than an implementation accident.

use chrono::Utc;
use serde_json::Value;
use sqlx::Row;
use tracing::{debug, instrument};

use crate::model::{IdentitySource, IdentityState, SessionAcpMeta, SessionIdentity};
use crate::{AppError, Result};

use super::db::Database;

/// CRUD store for [`SessionAcpMeta`] records, keyed by session key.
#[derive(Clone)]
pub struct SessionMetadataStore {
    db: Database,
}

impl SessionMetadataStore {
    /// Wrap an existing connection pool.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Read the current metadata for a session key, applying the one-way
    /// legacy-identity migration (§3.1, §9) in-memory. The migration is
    /// NOT persisted by `read` alone — it only takes effect in storage on
    /// the next successful `upsert`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query or stored JSON is malformed.
    #[instrument(skip(self))]
    pub async fn read(&self, session_key: &str) -> Result<Option<SessionAcpMeta>> {
        let row = sqlx::query("SELECT acp_meta FROM session_store WHERE session_key = ?1")
            .bind(session_key)
            .fetch_optional(&self.db)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let raw: Option<String> = row.try_get("acp_meta")?;
        let Some(raw) = raw else {
            return Ok(None);
        };

        let value: Value = serde_json::from_str(&raw)?;
        Ok(Some(decode_with_migration(value)?))
    }

    /// Mutate the metadata for a session key under an optimistic
    /// read-modify-write. `mutate` observes the committed current state
    /// (post-migration) and returns `Some(next)` to upsert, or `None` to
    /// delete the row.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the transaction fails.
    #[instrument(skip(self, mutate))]
    pub async fn upsert<F>(&self, session_key: &str, mutate: F) -> Result<Option<SessionAcpMeta>>
    where
        F: FnOnce(Option<&SessionAcpMeta>) -> Option<SessionAcpMeta>,
    {
        let mut tx = self.db.begin().await?;

        let row = sqlx::query("SELECT acp_meta FROM session_store WHERE session_key = ?1")
            .bind(session_key)
            .fetch_optional(&mut *tx)
            .await?;
        let current = match row {
            Some(row) => {
                let raw: Option<String> = row.try_get("acp_meta")?;
                raw.map(|r| serde_json::from_str(&r).map_err(AppError::from))
                    .transpose()?
                    .map(decode_with_migration)
                    .transpose()?
            }
            None => None,
        };

        let next = mutate(current.as_ref());

        match &next {
            Some(meta) => {
                let serialized = serde_json::to_string(meta)?;
                let now = Utc::now().to_rfc3339();
                sqlx::query(
                    "INSERT INTO session_store (session_key, session_id, updated_at, acp_meta)
                     VALUES (?1, ?1, ?2, ?3)
                     ON CONFLICT(session_key) DO UPDATE SET updated_at = ?2, acp_meta = ?3",
                )
                .bind(session_key)
                .bind(&now)
                .bind(&serialized)
                .execute(&mut *tx)
                .await?;
            }
            None => {
                sqlx::query("DELETE FROM session_store WHERE session_key = ?1")
                    .bind(session_key)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        tx.commit().await?;
        debug!(session_key, deleted = next.is_none(), "metadata upserted");
        Ok(next)
    }

    /// List every persisted ACP metadata record, used by startup identity
    /// reconciliation. Applies the legacy migration in-memory per row; does
    /// not persist the migration.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query or any row's JSON is malformed.
    pub async fn list(&self) -> Result<Vec<(String, SessionAcpMeta)>> {
        let rows = sqlx::query("SELECT session_key, acp_meta FROM session_store")
            .fetch_all(&self.db)
            .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let key: String = row.try_get("session_key")?;
            let raw: Option<String> = row.try_get("acp_meta")?;
            if let Some(raw) = raw {
                let value: Value = serde_json::from_str(&raw)?;
                out.push((key, decode_with_migration(value)?));
            }
        }
        Ok(out)
    }
}

/// Decode a stored metadata JSON value, detecting and migrating the
/// legacy flat-identity shape (§3.1): a row with no `identity` object but
/// one of `backendSessionId` / `agentSessionId` / `sessionIdsProvisional`
/// at the top level is synthesized into the unified `identity` record,
/// state `pending`, source `ensure`.
fn decode_with_migration(mut value: Value) -> Result<SessionAcpMeta> {
    if value.get("identity").is_none() {
        let backend_session_id = value
            .get("backendSessionId")
            .and_then(Value::as_str)
            .map(str::to_owned);
        let agent_session_id = value
            .get("agentSessionId")
            .and_then(Value::as_str)
            .map(str::to_owned);
        let has_legacy = backend_session_id.is_some()
            || agent_session_id.is_some()
            || value.get("sessionIdsProvisional").is_some();

        if has_legacy {
            let last_activity_at = value
                .get("lastActivityAt")
                .and_then(Value::as_str)
                .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(Utc::now);

            let identity = SessionIdentity {
                state: IdentityState::Pending,
                source: IdentitySource::Ensure,
                acpx_session_id: backend_session_id,
                agent_session_id,
                acpx_record_id: None,
                last_updated_at: last_activity_at,
            };

            if let Some(obj) = value.as_object_mut() {
                obj.remove("backendSessionId");
                obj.remove("agentSessionId");
                obj.remove("sessionIdsProvisional");
                obj.insert("identity".to_owned(), serde_json::to_value(identity)?);
            }
        }
    }

    Ok(serde_json::from_value(value)?)
}
