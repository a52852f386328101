use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;

use crate::{
    crypto::{self, SHORT_TOKEN_BYTES},
    error::AppError,
    models::{
        social::{SocialLink, SocialProfile},
        user::{CreateUser, ProfileUpdate, User},
    },
};

const PASSWORD_RESET_LIFETIME_SECS: i64 = 3600;

/// Account lookups and mutations against the `users` table.
#[derive(Clone)]
pub struct UserStore {
    pool: SqlitePool,
    max_failed_attempts: i64,
    lockout: Duration,
}

impl UserStore {
    pub fn new(pool: SqlitePool, max_failed_attempts: i64, lockout: Duration) -> Self {
        Self {
            pool,
            max_failed_attempts,
            lockout,
        }
    }

    pub async fn find_by_email(&self, email: &str) -> Result<Option<User>, sqlx::Error> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE email = ? AND is_active = 1")
            .bind(email)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn find_by_id(&self, id: i64) -> Result<Option<User>, sqlx::Error> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ? AND is_active = 1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    /// Includes deactivated accounts; an email stays taken after deactivation.
    pub async fn email_exists(&self, email: &str) -> Result<bool, sqlx::Error> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM users WHERE email = ?")
            .bind(email)
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }

    pub async fn username_exists(&self, username: &str) -> Result<bool, sqlx::Error> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM users WHERE username = ?")
            .bind(username)
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }

    /// Insert an unverified account and return its id together with the
    /// email verification token.
    pub async fn create(
        &self,
        new_user: &CreateUser<'_>,
        now: DateTime<Utc>,
    ) -> Result<(i64, String), AppError> {
        let mut conn = self.pool.acquire().await?;
        insert_user(&mut conn, new_user, false, now).await
    }

    pub async fn record_login(&self, user_id: i64, now: DateTime<Utc>) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE users SET last_login = ?, failed_login_attempts = 0, locked_until = NULL WHERE id = ?",
        )
        .bind(now)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Count a failed password check and lock the account once the counter
    /// reaches the configured maximum. Returns the user's new counter.
    pub async fn record_failed_attempt(
        &self,
        email: &str,
        now: DateTime<Utc>,
    ) -> Result<i64, sqlx::Error> {
        let attempts = sqlx::query_scalar::<_, i64>(
            "UPDATE users SET failed_login_attempts = failed_login_attempts + 1
             WHERE email = ? RETURNING failed_login_attempts",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?
        .unwrap_or(0);

        if attempts >= self.max_failed_attempts {
            sqlx::query("UPDATE users SET locked_until = ? WHERE email = ?")
                .bind(now + self.lockout)
                .bind(email)
                .execute(&self.pool)
                .await?;
            tracing::warn!(email, attempts, "account locked after repeated failed logins");
        }

        Ok(attempts)
    }

    pub async fn record_login_attempt(
        &self,
        ip_address: &str,
        email: &str,
        success: bool,
        user_agent: &str,
        now: DateTime<Utc>,
    ) {
        let result = sqlx::query(
            "INSERT INTO login_attempts (ip_address, email, success, user_agent, attempted_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(ip_address)
        .bind(email)
        .bind(success)
        .bind(user_agent)
        .bind(now)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            tracing::warn!("Failed to log login attempt: {}", e);
        }
    }

    /// Returns `true` when a pending token matched.
    pub async fn verify_email(&self, token: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE users SET email_verified = 1, email_verification_token = NULL
             WHERE email_verification_token = ? AND email_verified = 0",
        )
        .bind(token)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn update_profile(
        &self,
        user_id: i64,
        update: &ProfileUpdate,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE users SET
                first_name = COALESCE(?, first_name),
                last_name = COALESCE(?, last_name),
                profile_picture = COALESCE(?, profile_picture)
             WHERE id = ?",
        )
        .bind(update.first_name.as_deref())
        .bind(update.last_name.as_deref())
        .bind(update.profile_picture.as_deref())
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn change_password(&self, user_id: i64, new_password: &str) -> Result<bool, AppError> {
        let password_hash = crypto::hash_password(new_password)?;
        let result = sqlx::query("UPDATE users SET password_hash = ? WHERE id = ?")
            .bind(password_hash)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Store a one-hour reset token for the account, if the email is known.
    pub async fn issue_password_reset(
        &self,
        email: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, sqlx::Error> {
        let token = crypto::generate_token(SHORT_TOKEN_BYTES);
        let result = sqlx::query(
            "UPDATE users SET password_reset_token = ?, password_reset_expires = ?
             WHERE email = ? AND is_active = 1",
        )
        .bind(&token)
        .bind(now + Duration::seconds(PASSWORD_RESET_LIFETIME_SECS))
        .bind(email)
        .execute(&self.pool)
        .await?;

        Ok((result.rows_affected() > 0).then_some(token))
    }

    /// Consume a reset token. Returns the user whose password changed.
    pub async fn reset_password(
        &self,
        token: &str,
        new_password: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<i64>, AppError> {
        let user_id = sqlx::query_scalar::<_, i64>(
            "SELECT id FROM users WHERE password_reset_token = ? AND password_reset_expires > ?",
        )
        .bind(token)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        let Some(user_id) = user_id else {
            return Ok(None);
        };

        let password_hash = crypto::hash_password(new_password)?;
        sqlx::query(
            "UPDATE users SET password_hash = ?, password_reset_token = NULL,
                password_reset_expires = NULL, failed_login_attempts = 0, locked_until = NULL
             WHERE id = ?",
        )
        .bind(password_hash)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(Some(user_id))
    }

    pub async fn find_social_link(
        &self,
        provider: &str,
        provider_id: &str,
    ) -> Result<Option<SocialLink>, sqlx::Error> {
        sqlx::query_as::<_, SocialLink>(
            "SELECT * FROM social_providers WHERE provider_name = ? AND provider_id = ?",
        )
        .bind(provider)
        .bind(provider_id)
        .fetch_optional(&self.pool)
        .await
    }

    /// Resolve a provider identity to a local account, creating a verified
    /// account on first sight, and refresh the stored provider link.
    pub async fn upsert_social(
        &self,
        profile: &SocialProfile,
        now: DateTime<Utc>,
    ) -> Result<i64, AppError> {
        let mut tx = self.pool.begin().await?;

        let linked = sqlx::query_scalar::<_, i64>(
            "SELECT u.id FROM social_providers s JOIN users u ON u.id = s.user_id
             WHERE s.provider_name = ? AND s.provider_id = ? AND u.is_active = 1",
        )
        .bind(&profile.provider)
        .bind(&profile.provider_id)
        .fetch_optional(&mut *tx)
        .await?;

        let existing = match linked {
            Some(id) => Some(id),
            None => {
                sqlx::query_scalar::<_, i64>(
                    "SELECT id FROM users WHERE email = ? AND is_active = 1",
                )
                .bind(&profile.email)
                .fetch_optional(&mut *tx)
                .await?
            }
        };

        let user_id = match existing {
            Some(id) => id,
            None => {
                let random_password = crypto::generate_token(SHORT_TOKEN_BYTES);
                let new_user = CreateUser {
                    username: &profile.username,
                    email: &profile.email,
                    password: &random_password,
                    first_name: Some(&profile.first_name),
                    last_name: Some(&profile.last_name),
                };
                let (id, _) = insert_user(&mut tx, &new_user, true, now).await?;
                if !profile.profile_picture.is_empty() {
                    sqlx::query("UPDATE users SET profile_picture = ? WHERE id = ?")
                        .bind(&profile.profile_picture)
                        .bind(id)
                        .execute(&mut *tx)
                        .await?;
                }
                tracing::info!(user_id = id, provider = %profile.provider, "created account from social login");
                id
            }
        };

        let provider_data = serde_json::to_string(profile).unwrap_or_else(|_| "{}".into());
        sqlx::query(
            "INSERT INTO social_providers
                (user_id, provider_name, provider_id, provider_email, provider_data, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (provider_name, provider_id) DO UPDATE SET
                provider_email = excluded.provider_email,
                provider_data = excluded.provider_data,
                updated_at = excluded.updated_at",
        )
        .bind(user_id)
        .bind(&profile.provider)
        .bind(&profile.provider_id)
        .bind(&profile.email)
        .bind(provider_data)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(user_id)
    }
}

async fn insert_user(
    conn: &mut sqlx::SqliteConnection,
    new_user: &CreateUser<'_>,
    email_verified: bool,
    now: DateTime<Utc>,
) -> Result<(i64, String), AppError> {
    let password_hash = crypto::hash_password(new_user.password)?;
    let verification_token = crypto::generate_token(SHORT_TOKEN_BYTES);

    let id = sqlx::query_scalar::<_, i64>(
        "INSERT INTO users
            (username, email, password_hash, first_name, last_name, email_verified,
             email_verification_token, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)
         RETURNING id",
    )
    .bind(new_user.username)
    .bind(new_user.email)
    .bind(password_hash)
    .bind(new_user.first_name.filter(|s| !s.is_empty()))
    .bind(new_user.last_name.filter(|s| !s.is_empty()))
    .bind(email_verified)
    .bind((!email_verified).then_some(&verification_token))
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;

    Ok((id, verification_token))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    fn store(pool: SqlitePool) -> UserStore {
        UserStore::new(pool, 5, Duration::seconds(900))
    }

    async fn alice(users: &UserStore, now: DateTime<Utc>) -> (i64, String) {
        users
            .create(
                &CreateUser {
                    username: "alice",
                    email: "alice@example.com",
                    password: "Secret123",
                    first_name: Some("Alice"),
                    last_name: None,
                },
                now,
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn create_and_lookup() {
        let users = store(test_pool().await);
        let now = Utc::now();
        let (id, _) = alice(&users, now).await;

        let user = users.find_by_email("alice@example.com").await.unwrap().unwrap();
        assert_eq!(user.id, id);
        assert_eq!(user.first_name.as_deref(), Some("Alice"));
        assert_eq!(user.last_name, None);
        assert!(!user.email_verified);
        assert!(crypto::verify_password("Secret123", &user.password_hash));

        assert!(users.email_exists("alice@example.com").await.unwrap());
        assert!(users.username_exists("alice").await.unwrap());
        assert!(!users.username_exists("bob").await.unwrap());
        assert!(users.find_by_id(id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn email_and_username_are_case_insensitive() {
        let users = store(test_pool().await);
        let now = Utc::now();
        let (id, _) = alice(&users, now).await;

        let user = users.find_by_email("ALICE@Example.COM").await.unwrap().unwrap();
        assert_eq!(user.id, id);
        assert!(users.email_exists("Alice@example.com").await.unwrap());
        assert!(users.username_exists("ALICE").await.unwrap());

        let duplicate = users
            .create(
                &CreateUser {
                    username: "Alice",
                    email: "other@example.com",
                    password: "Secret123",
                    first_name: None,
                    last_name: None,
                },
                now,
            )
            .await;
        assert!(duplicate.is_err());
    }

    #[tokio::test]
    async fn lockout_after_max_failures_and_expiry() {
        let users = store(test_pool().await);
        let now = Utc::now();
        alice(&users, now).await;

        for expected in 1..=4 {
            assert_eq!(
                users.record_failed_attempt("alice@example.com", now).await.unwrap(),
                expected
            );
            let user = users.find_by_email("alice@example.com").await.unwrap().unwrap();
            assert!(!user.is_locked(now));
        }

        users.record_failed_attempt("alice@example.com", now).await.unwrap();
        let user = users.find_by_email("alice@example.com").await.unwrap().unwrap();
        assert!(user.is_locked(now));
        assert!(user.is_locked(now + Duration::seconds(899)));
        assert!(!user.is_locked(now + Duration::seconds(900)));

        users.record_login(user.id, now).await.unwrap();
        let user = users.find_by_email("alice@example.com").await.unwrap().unwrap();
        assert_eq!(user.failed_login_attempts, 0);
        assert!(user.locked_until.is_none());
        assert!(user.last_login.is_some());
    }

    #[tokio::test]
    async fn verification_token_is_single_use() {
        let users = store(test_pool().await);
        let (_, token) = alice(&users, Utc::now()).await;

        assert!(!users.verify_email("wrong").await.unwrap());
        assert!(users.verify_email(&token).await.unwrap());
        assert!(!users.verify_email(&token).await.unwrap());
        let user = users.find_by_email("alice@example.com").await.unwrap().unwrap();
        assert!(user.email_verified);
    }

    #[tokio::test]
    async fn password_reset_expires() {
        let users = store(test_pool().await);
        let now = Utc::now();
        let (id, _) = alice(&users, now).await;

        assert!(users
            .issue_password_reset("nobody@example.com", now)
            .await
            .unwrap()
            .is_none());

        let token = users
            .issue_password_reset("alice@example.com", now)
            .await
            .unwrap()
            .unwrap();
        let late = now + Duration::seconds(PASSWORD_RESET_LIFETIME_SECS + 1);
        assert_eq!(users.reset_password(&token, "Changed123", late).await.unwrap(), None);

        assert_eq!(
            users.reset_password(&token, "Changed123", now).await.unwrap(),
            Some(id)
        );
        let user = users.find_by_id(id).await.unwrap().unwrap();
        assert!(crypto::verify_password("Changed123", &user.password_hash));
        assert_eq!(users.reset_password(&token, "Again1234", now).await.unwrap(), None);
    }

    #[tokio::test]
    async fn profile_update_keeps_unset_fields() {
        let users = store(test_pool().await);
        let (id, _) = alice(&users, Utc::now()).await;

        let update = ProfileUpdate {
            last_name: Some("Liddell".into()),
            ..ProfileUpdate::default()
        };
        assert!(users.update_profile(id, &update).await.unwrap());
        let user = users.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(user.first_name.as_deref(), Some("Alice"));
        assert_eq!(user.last_name.as_deref(), Some("Liddell"));

        assert!(users.change_password(id, "Another123").await.unwrap());
        let user = users.find_by_id(id).await.unwrap().unwrap();
        assert!(crypto::verify_password("Another123", &user.password_hash));
    }

    fn profile(provider_id: &str, email: &str) -> SocialProfile {
        SocialProfile {
            provider: "google".into(),
            provider_id: provider_id.into(),
            email: email.into(),
            first_name: "Carol".into(),
            last_name: "Danvers".into(),
            username: email.into(),
            profile_picture: "https://example.com/c.png".into(),
            email_verified: true,
        }
    }

    #[tokio::test]
    async fn social_upsert_creates_then_reuses() {
        let users = store(test_pool().await);
        let now = Utc::now();

        let id = users
            .upsert_social(&profile("g-1", "carol@example.com"), now)
            .await
            .unwrap();
        let user = users.find_by_id(id).await.unwrap().unwrap();
        assert!(user.email_verified);
        assert_eq!(user.profile_picture.as_deref(), Some("https://example.com/c.png"));

        // Same provider identity with a changed email still maps to the same account.
        let again = users
            .upsert_social(&profile("g-1", "carol@new.example.com"), now)
            .await
            .unwrap();
        assert_eq!(again, id);

        let link = users.find_social_link("google", "g-1").await.unwrap().unwrap();
        assert_eq!(link.user_id, id);
        assert_eq!(link.provider_email, "carol@new.example.com");
        assert!(link.provider_data.contains("\"provider_id\":\"g-1\""));
    }

    #[tokio::test]
    async fn social_upsert_links_existing_email() {
        let users = store(test_pool().await);
        let now = Utc::now();
        let (id, _) = alice(&users, now).await;

        let linked = users
            .upsert_social(&profile("g-2", "alice@example.com"), now)
            .await
            .unwrap();
        assert_eq!(linked, id);
        // Linking does not verify an account that registered with a password.
        let user = users.find_by_id(id).await.unwrap().unwrap();
        assert!(!user.email_verified);
    }
}
