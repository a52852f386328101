use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;

use crate::{
    crypto::{generate_token, SESSION_TOKEN_BYTES, SHORT_TOKEN_BYTES},
    models::session::Session,
};

/// More distinct IPs than this inside one hour marks an account as suspicious.
const SUSPICIOUS_IP_COUNT: i64 = 3;

/// Login sessions stored in `user_sessions`. The random token is the only
/// credential a client holds after login.
#[derive(Clone)]
pub struct SessionStore {
    pool: SqlitePool,
    lifetime: Duration,
}

impl SessionStore {
    pub fn new(pool: SqlitePool, lifetime: Duration) -> Self {
        Self { pool, lifetime }
    }

    pub async fn create(
        &self,
        user_id: i64,
        ip_address: &str,
        user_agent: &str,
        now: DateTime<Utc>,
    ) -> Result<Session, sqlx::Error> {
        sqlx::query_as::<_, Session>(
            "INSERT INTO user_sessions
                (user_id, session_token, csrf_token, ip_address, user_agent, created_at, last_activity, expires_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING *",
        )
        .bind(user_id)
        .bind(generate_token(SESSION_TOKEN_BYTES))
        .bind(generate_token(SHORT_TOKEN_BYTES))
        .bind(ip_address)
        .bind(user_agent)
        .bind(now)
        .bind(now)
        .bind(now + self.lifetime)
        .fetch_one(&self.pool)
        .await
    }

    /// Look up a live session: the token exists, has not expired, and its
    /// owner is still active. A hit refreshes `last_activity`.
    pub async fn validate(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Session>, sqlx::Error> {
        if token.is_empty() {
            return Ok(None);
        }

        let session = sqlx::query_as::<_, Session>(
            "SELECT s.* FROM user_sessions s
             JOIN users u ON s.user_id = u.id
             WHERE s.session_token = ? AND s.expires_at > ? AND u.is_active = 1",
        )
        .bind(token)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        let Some(mut session) = session else {
            return Ok(None);
        };

        sqlx::query("UPDATE user_sessions SET last_activity = ? WHERE id = ?")
            .bind(now)
            .bind(session.id)
            .execute(&self.pool)
            .await?;
        session.last_activity = now;

        Ok(Some(session))
    }

    /// Swap in a fresh token and CSRF token for an existing session.
    pub async fn regenerate(&self, old_token: &str) -> Result<Option<Session>, sqlx::Error> {
        sqlx::query_as::<_, Session>(
            "UPDATE user_sessions SET session_token = ?, csrf_token = ?
             WHERE session_token = ?
             RETURNING *",
        )
        .bind(generate_token(SESSION_TOKEN_BYTES))
        .bind(generate_token(SHORT_TOKEN_BYTES))
        .bind(old_token)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn extend(&self, token: &str, now: DateTime<Utc>) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("UPDATE user_sessions SET expires_at = ? WHERE session_token = ?")
            .bind(now + self.lifetime)
            .bind(token)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn destroy(&self, token: &str) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM user_sessions WHERE session_token = ?")
            .bind(token)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn destroy_all_for_user(&self, user_id: i64) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM user_sessions WHERE user_id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Log a user out everywhere except the session making the request.
    pub async fn destroy_others(&self, user_id: i64, keep_id: i64) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM user_sessions WHERE user_id = ? AND id != ?")
            .bind(user_id)
            .bind(keep_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn clean_expired(&self, now: DateTime<Utc>) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM user_sessions WHERE expires_at <= ?")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Unexpired sessions of a user, most recently active first.
    pub async fn list_for_user(
        &self,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<Session>, sqlx::Error> {
        sqlx::query_as::<_, Session>(
            "SELECT * FROM user_sessions
             WHERE user_id = ? AND expires_at > ?
             ORDER BY last_activity DESC",
        )
        .bind(user_id)
        .bind(now)
        .fetch_all(&self.pool)
        .await
    }

    /// Logins from more than three addresses within the last hour.
    pub async fn suspicious_activity(
        &self,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, sqlx::Error> {
        let ip_count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(DISTINCT ip_address) FROM user_sessions
             WHERE user_id = ? AND created_at > ?",
        )
        .bind(user_id)
        .bind(now - Duration::hours(1))
        .fetch_one(&self.pool)
        .await?;
        Ok(ip_count > SUSPICIOUS_IP_COUNT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db::test_pool, models::user::CreateUser, users::UserStore};

    async fn setup() -> (SqlitePool, SessionStore, i64) {
        let pool = test_pool().await;
        let users = UserStore::new(pool.clone(), 5, Duration::seconds(900));
        let (user_id, _) = users
            .create(
                &CreateUser {
                    username: "alice",
                    email: "alice@example.com",
                    password: "Secret123",
                    first_name: None,
                    last_name: None,
                },
                Utc::now(),
            )
            .await
            .unwrap();
        let sessions = SessionStore::new(pool.clone(), Duration::hours(24));
        (pool, sessions, user_id)
    }

    #[tokio::test]
    async fn unknown_and_empty_tokens_are_rejected() {
        let (_, sessions, _) = setup().await;
        let now = Utc::now();
        assert!(sessions.validate("", now).await.unwrap().is_none());
        assert!(sessions.validate("deadbeef", now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn session_is_valid_until_expiry() {
        let (_, sessions, user_id) = setup().await;
        let now = Utc::now();
        let session = sessions.create(user_id, "10.0.0.1", "test", now).await.unwrap();
        assert_eq!(session.session_token.len(), SESSION_TOKEN_BYTES * 2);
        assert_eq!(session.csrf_token.len(), SHORT_TOKEN_BYTES * 2);

        let later = now + Duration::hours(23);
        let found = sessions
            .validate(&session.session_token, later)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.user_id, user_id);
        assert_eq!(found.last_activity, later);

        let expired = now + Duration::hours(24);
        assert!(sessions
            .validate(&session.session_token, expired)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn inactive_owner_invalidates_session() {
        let (pool, sessions, user_id) = setup().await;
        let now = Utc::now();
        let session = sessions.create(user_id, "10.0.0.1", "test", now).await.unwrap();

        sqlx::query("UPDATE users SET is_active = 0 WHERE id = ?")
            .bind(user_id)
            .execute(&pool)
            .await
            .unwrap();
        assert!(sessions
            .validate(&session.session_token, now)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn regenerate_retires_old_token() {
        let (_, sessions, user_id) = setup().await;
        let now = Utc::now();
        let session = sessions.create(user_id, "10.0.0.1", "test", now).await.unwrap();

        let rotated = sessions
            .regenerate(&session.session_token)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rotated.id, session.id);
        assert_ne!(rotated.session_token, session.session_token);
        assert_ne!(rotated.csrf_token, session.csrf_token);
        assert!(sessions
            .validate(&session.session_token, now)
            .await
            .unwrap()
            .is_none());
        assert!(sessions
            .validate(&rotated.session_token, now)
            .await
            .unwrap()
            .is_some());
        assert!(sessions.regenerate(&session.session_token).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn extend_destroy_and_sweep() {
        let (_, sessions, user_id) = setup().await;
        let now = Utc::now();
        let a = sessions.create(user_id, "10.0.0.1", "a", now).await.unwrap();
        let b = sessions.create(user_id, "10.0.0.2", "b", now).await.unwrap();
        sessions.create(user_id, "10.0.0.3", "c", now).await.unwrap();

        let later = now + Duration::hours(12);
        assert!(sessions.extend(&a.session_token, later).await.unwrap());

        sessions.destroy(&b.session_token).await.unwrap();
        assert!(sessions.validate(&b.session_token, now).await.unwrap().is_none());

        let swept = sessions
            .clean_expired(now + Duration::hours(25))
            .await
            .unwrap();
        assert_eq!(swept, 1);
        let remaining = sessions
            .list_for_user(user_id, now + Duration::hours(25))
            .await
            .unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, a.id);

        assert_eq!(sessions.destroy_all_for_user(user_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn destroy_others_keeps_current() {
        let (_, sessions, user_id) = setup().await;
        let now = Utc::now();
        let keep = sessions.create(user_id, "10.0.0.1", "a", now).await.unwrap();
        sessions.create(user_id, "10.0.0.2", "b", now).await.unwrap();
        sessions.create(user_id, "10.0.0.3", "c", now).await.unwrap();

        assert_eq!(sessions.destroy_others(user_id, keep.id).await.unwrap(), 2);
        let left = sessions.list_for_user(user_id, now).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, keep.id);
    }

    #[tokio::test]
    async fn many_addresses_in_an_hour_is_suspicious() {
        let (_, sessions, user_id) = setup().await;
        let now = Utc::now();
        for ip in ["10.0.0.1", "10.0.0.2", "10.0.0.3"] {
            sessions.create(user_id, ip, "ua", now).await.unwrap();
        }
        assert!(!sessions.suspicious_activity(user_id, now).await.unwrap());
        sessions.create(user_id, "10.0.0.4", "ua", now).await.unwrap();
        assert!(sessions.suspicious_activity(user_id, now).await.unwrap());
        assert!(!sessions
            .suspicious_activity(user_id, now + Duration::hours(2))
            .await
            .unwrap());
    }
}
