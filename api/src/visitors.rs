use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;

use crate::{
    crypto::{generate_token, SHORT_TOKEN_BYTES},
    models::visitor::{Flash, PendingOAuth, Visitor},
};

/// Per-browser state that exists before (and independently of) a login:
/// the anonymous CSRF token, flash messages and the OAuth `state` nonce.
#[derive(Clone)]
pub struct VisitorStore {
    pool: SqlitePool,
    lifetime: Duration,
}

impl VisitorStore {
    pub fn new(pool: SqlitePool, lifetime: Duration) -> Self {
        Self { pool, lifetime }
    }

    pub async fn find(&self, id: &str, now: DateTime<Utc>) -> Result<Option<Visitor>, sqlx::Error> {
        if id.is_empty() {
            return Ok(None);
        }
        sqlx::query_as::<_, Visitor>("SELECT * FROM visitor_sessions WHERE id = ? AND expires_at > ?")
            .bind(id)
            .bind(now)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn create(&self, now: DateTime<Utc>) -> Result<Visitor, sqlx::Error> {
        sqlx::query_as::<_, Visitor>(
            "INSERT INTO visitor_sessions (id, created_at, expires_at) VALUES (?, ?, ?) RETURNING *",
        )
        .bind(generate_token(SHORT_TOKEN_BYTES))
        .bind(now)
        .bind(now + self.lifetime)
        .fetch_one(&self.pool)
        .await
    }

    /// Return the visitor's CSRF token, minting one if it has none yet.
    pub async fn ensure_csrf(&self, visitor: &mut Visitor) -> Result<String, sqlx::Error> {
        if let Some(token) = visitor.csrf_token.as_ref().filter(|t| !t.is_empty()) {
            return Ok(token.clone());
        }
        self.regenerate_csrf(visitor).await
    }

    pub async fn regenerate_csrf(&self, visitor: &mut Visitor) -> Result<String, sqlx::Error> {
        let token = generate_token(SHORT_TOKEN_BYTES);
        sqlx::query("UPDATE visitor_sessions SET csrf_token = ? WHERE id = ?")
            .bind(&token)
            .bind(&visitor.id)
            .execute(&self.pool)
            .await?;
        visitor.csrf_token = Some(token.clone());
        Ok(token)
    }

    pub async fn set_flash(&self, id: &str, flash: &Flash) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE visitor_sessions SET flash_message = ?, flash_type = ? WHERE id = ?")
            .bind(&flash.message)
            .bind(&flash.kind)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Read and clear the pending flash message.
    pub async fn take_flash(&self, id: &str) -> Result<Option<Flash>, sqlx::Error> {
        let row = sqlx::query_as::<_, (Option<String>, Option<String>)>(
            "UPDATE visitor_sessions SET flash_message = NULL, flash_type = NULL
             WHERE id = ? AND flash_message IS NOT NULL
             RETURNING flash_message, flash_type",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.and_then(|(message, kind)| {
            message.map(|message| Flash {
                message,
                kind: kind.unwrap_or_else(|| "info".into()),
            })
        }))
    }

    pub async fn begin_oauth(&self, id: &str, pending: &PendingOAuth) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE visitor_sessions SET oauth_state = ?, oauth_provider = ?, oauth_intent = ? WHERE id = ?",
        )
        .bind(&pending.state)
        .bind(&pending.provider)
        .bind(&pending.intent)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Remove and return the stored OAuth handshake. The nonce is cleared
    /// whether or not the caller's `state` turns out to match.
    pub async fn take_oauth(&self, id: &str) -> Result<Option<PendingOAuth>, sqlx::Error> {
        let row = sqlx::query_as::<_, (Option<String>, Option<String>, Option<String>)>(
            "UPDATE visitor_sessions SET oauth_state = NULL, oauth_provider = NULL, oauth_intent = NULL
             WHERE id = ? AND oauth_state IS NOT NULL
             RETURNING oauth_state, oauth_provider, oauth_intent",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.and_then(|(state, provider, intent)| {
            Some(PendingOAuth {
                state: state?,
                provider: provider.unwrap_or_default(),
                intent: intent.unwrap_or_else(|| "login".into()),
            })
        }))
    }

    pub async fn clean_expired(&self, now: DateTime<Utc>) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM visitor_sessions WHERE expires_at <= ?")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
