//! Persisted pairing-request store (§6 "Pairing store"): issues and reads
//! back the one-time codes used to gain allowlist status when
//! `dmPolicy = pairing` challenges an unknown DM sender.

use chrono::Utc;
use rand::RngCore;
use sqlx::Row;
use tracing::instrument;

use crate::model::PairingRequest;
use crate::Result;

use super::db::Database;

/// Entropy budget for a pairing code: 10 bytes = 80 bits, comfortably over
/// the "≥ 64 bits" the design notes call for, encoded compactly in base32.
const CODE_BYTES: usize = 10;

fn generate_code() -> String {
    let mut bytes = [0_u8; CODE_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    data_encoding::BASE32_NOPAD.encode(&bytes)
}

/// Store for pairing requests, keyed by `(channel, accountId, senderId)`.
#[derive(Clone)]
pub struct PairingStore {
    db: Database,
}

impl PairingStore {
    /// Wrap an existing connection pool.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Issue or refresh a pairing request for `(channel, accountId, senderId)`.
    /// Generates a fresh code; if the freshly generated code collides with
    /// a code already live for a *different* sender, regenerates (§9
    /// design notes: "if a code collides with a live pairing, regenerate").
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` on persistence failure.
    #[instrument(skip(self, meta))]
    pub async fn upsert_channel_pairing_request(
        &self,
        channel: &str,
        account_id: &str,
        sender_id: &str,
        meta: Option<serde_json::Value>,
    ) -> Result<(String, bool)> {
        let existing = sqlx::query(
            "SELECT code FROM pairing_request WHERE channel = ?1 AND account_id = ?2 AND sender_id = ?3",
        )
        .bind(channel)
        .bind(account_id)
        .bind(sender_id)
        .fetch_optional(&self.db)
        .await?;

        if let Some(row) = existing {
            let code: String = row.try_get("code")?;
            return Ok((code, false));
        }

        let mut code = generate_code();
        loop {
            let collision = sqlx::query("SELECT 1 FROM pairing_request WHERE code = ?1")
                .bind(&code)
                .fetch_optional(&self.db)
                .await?;
            if collision.is_none() {
                break;
            }
            code = generate_code();
        }

        let now = Utc::now();
        let meta_json = meta.as_ref().map(serde_json::to_string).transpose()?;
        sqlx::query(
            "INSERT INTO pairing_request (channel, account_id, sender_id, code, created_at, meta)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(channel)
        .bind(account_id)
        .bind(sender_id)
        .bind(&code)
        .bind(now.to_rfc3339())
        .bind(meta_json)
        .execute(&self.db)
        .await?;

        Ok((code, true))
    }

    /// Every sender id that has an accepted pairing request for this
    /// `(channel, accountId)`, normalized — these feed into
    /// `effectiveAllowFrom` at evaluation time.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` on query failure.
    pub async fn read_store_allow_from_for_dm_policy(
        &self,
        channel: &str,
        account_id: &str,
    ) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT sender_id FROM pairing_request WHERE channel = ?1 AND account_id = ?2",
        )
        .bind(channel)
        .bind(account_id)
        .fetch_all(&self.db)
        .await?;

        rows.into_iter()
            .map(|row| row.try_get::<String, _>("sender_id").map_err(Into::into))
            .collect()
    }

    /// Remove a pairing request once the sender has successfully redeemed
    /// its code (not required by the core contract, but keeps the table
    /// from growing unbounded across long-running processes).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` on query failure.
    pub async fn clear(&self, channel: &str, account_id: &str, sender_id: &str) -> Result<()> {
        sqlx::query(
            "DELETE FROM pairing_request WHERE channel = ?1 AND account_id = ?2 AND sender_id = ?3",
        )
        .bind(channel)
        .bind(account_id)
        .bind(sender_id)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    /// Reconstruct a full [`PairingRequest`] record for a live code, if any.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` on query failure.
    pub async fn find_by_code(&self, code: &str) -> Result<Option<PairingRequest>> {
        let row = sqlx::query(
            "SELECT channel, account_id, sender_id, code, created_at, meta FROM pairing_request WHERE code = ?1",
        )
        .bind(code)
        .fetch_optional(&self.db)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let created_at: String = row.try_get("created_at")?;
        let meta: Option<String> = row.try_get("meta")?;
        Ok(Some(PairingRequest {
            channel: row.try_get("channel")?,
            account_id: row.try_get("account_id")?,
            id: row.try_get("sender_id")?,
            code: row.try_get("code")?,
            created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
            meta: meta.map(|m| serde_json::from_str(&m)).transpose()?,
        }))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::persistence::db;

    #[tokio::test]
    async fn first_request_issues_a_fresh_code() {
        let db = db::connect_memory().await.unwrap();
        let store = PairingStore::new(db);

        let (code, freshly_created) = store
            .upsert_channel_pairing_request("tg", "acct1", "user1", None)
            .await
            .unwrap();

        assert!(freshly_created);
        assert!(!code.is_empty());
    }

    #[tokio::test]
    async fn repeated_request_for_same_sender_returns_the_same_code() {
        let db = db::connect_memory().await.unwrap();
        let store = PairingStore::new(db);

        let (code1, _) = store
            .upsert_channel_pairing_request("tg", "acct1", "user1", None)
            .await
            .unwrap();
        let (code2, freshly_created) = store
            .upsert_channel_pairing_request("tg", "acct1", "user1", None)
            .await
            .unwrap();

        assert_eq!(code1, code2);
        assert!(!freshly_created);
    }

    #[tokio::test]
    async fn different_senders_get_different_codes() {
        let db = db::connect_memory().await.unwrap();
        let store = PairingStore::new(db);

        let (code1, _) = store
            .upsert_channel_pairing_request("tg", "acct1", "user1", None)
            .await
            .unwrap();
        let (code2, _) = store
            .upsert_channel_pairing_request("tg", "acct1", "user2", None)
            .await
            .unwrap();

        assert_ne!(code1, code2);
    }

    #[tokio::test]
    async fn read_store_allow_from_lists_every_paired_sender_for_the_account() {
        let db = db::connect_memory().await.unwrap();
        let store = PairingStore::new(db);
        store
            .upsert_channel_pairing_request("tg", "acct1", "user1", None)
            .await
            .unwrap();
        store
            .upsert_channel_pairing_request("tg", "acct1", "user2", None)
            .await
            .unwrap();
        store
            .upsert_channel_pairing_request("tg", "acct2", "user3", None)
            .await
            .unwrap();

        let mut allow = store
            .read_store_allow_from_for_dm_policy("tg", "acct1")
            .await
            .unwrap();
        allow.sort();
        assert_eq!(allow, vec!["user1", "user2"]);
    }

    #[tokio::test]
    async fn clear_removes_the_pairing_request() {
        let db = db::connect_memory().await.unwrap();
        let store = PairingStore::new(db);
        store
            .upsert_channel_pairing_request("tg", "acct1", "user1", None)
            .await
            .unwrap();

        store.clear("tg", "acct1", "user1").await.unwrap();

        let allow = store
            .read_store_allow_from_for_dm_policy("tg", "acct1")
            .await
            .unwrap();
        assert!(allow.is_empty());
    }

    #[tokio::test]
    async fn find_by_code_reconstructs_the_full_request() {
        let db = db::connect_memory().await.unwrap();
        let store = PairingStore::new(db);
        let meta = serde_json::json!({"note": "hello"});
        let (code, _) = store
            .upsert_channel_pairing_request("tg", "acct1", "user1", Some(meta.clone()))
            .await
            .unwrap();

        let found = store.find_by_code(&code).await.unwrap().unwrap();
        assert_eq!(found.channel, "tg");
        assert_eq!(found.account_id, "acct1");
        assert_eq!(found.id, "user1");
        assert_eq!(found.code, code);
        assert_eq!(found.meta, Some(meta));
    }

    #[tokio::test]
    async fn find_by_code_returns_none_for_unknown_code() {
        let db = db::connect_memory().await.unwrap();
        let store = PairingStore::new(db);
        assert_eq!(store.find_by_code("does-not-exist").await.unwrap(), None);
    }
}
