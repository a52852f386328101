use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;

use crate::config::RateLimitRule;

/// Action name of the synthetic row that bans an address outright. Its
/// `window_start` holds the time the ban ends.
pub const BLOCKED_ACTION: &str = "blocked";
const BLOCKED_ATTEMPTS: i64 = 999_999;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RateLimitCounter {
    pub ip_address: String,
    pub action_type: String,
    pub attempts: i64,
    pub window_start: DateTime<Utc>,
}

/// Fixed-window attempt counter per (ip, action), stored in `rate_limits`.
#[derive(Clone)]
pub struct RateLimiter {
    pool: SqlitePool,
}

impl RateLimiter {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Count one attempt and report whether it is allowed.
    ///
    /// Store failures allow the request.
    pub async fn check(
        &self,
        ip_address: &str,
        action: &str,
        rule: RateLimitRule,
        now: DateTime<Utc>,
    ) -> bool {
        match self.try_check(ip_address, action, rule, now).await {
            Ok(allowed) => {
                if !allowed {
                    tracing::info!(ip_address, action, "rate limit exceeded");
                }
                allowed
            }
            Err(e) => {
                tracing::warn!("Rate limit check failed: {}", e);
                true
            }
        }
    }

    async fn try_check(
        &self,
        ip_address: &str,
        action: &str,
        rule: RateLimitRule,
        now: DateTime<Utc>,
    ) -> Result<bool, sqlx::Error> {
        if self.is_blocked(ip_address, now).await? {
            return Ok(false);
        }

        // Rows are kept for two windows so recent history stays inspectable.
        self.purge_stale(now - rule.window * 2).await?;

        let Some(counter) = self.counter(ip_address, action).await? else {
            self.start_window(ip_address, action, now).await?;
            return Ok(true);
        };

        if now - counter.window_start < rule.window {
            if counter.attempts >= rule.max_attempts {
                return Ok(false);
            }
            sqlx::query(
                "UPDATE rate_limits SET attempts = attempts + 1 WHERE ip_address = ? AND action_type = ?",
            )
            .bind(ip_address)
            .bind(action)
            .execute(&self.pool)
            .await?;
        } else {
            self.start_window(ip_address, action, now).await?;
        }

        Ok(true)
    }

    pub async fn counter(
        &self,
        ip_address: &str,
        action: &str,
    ) -> Result<Option<RateLimitCounter>, sqlx::Error> {
        sqlx::query_as::<_, RateLimitCounter>(
            "SELECT ip_address, action_type, attempts, window_start FROM rate_limits
             WHERE ip_address = ? AND action_type = ?",
        )
        .bind(ip_address)
        .bind(action)
        .fetch_optional(&self.pool)
        .await
    }

    async fn start_window(
        &self,
        ip_address: &str,
        action: &str,
        now: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO rate_limits (ip_address, action_type, attempts, window_start)
             VALUES (?, ?, 1, ?)
             ON CONFLICT (ip_address, action_type) DO UPDATE SET
                attempts = 1, window_start = excluded.window_start",
        )
        .bind(ip_address)
        .bind(action)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Attempts left in the current window without counting a new one.
    pub async fn remaining_attempts(
        &self,
        ip_address: &str,
        action: &str,
        rule: RateLimitRule,
        now: DateTime<Utc>,
    ) -> Result<i64, sqlx::Error> {
        Ok(match self.counter(ip_address, action).await? {
            Some(counter) if now - counter.window_start < rule.window => {
                (rule.max_attempts - counter.attempts).max(0)
            }
            _ => rule.max_attempts,
        })
    }

    pub async fn seconds_until_reset(
        &self,
        ip_address: &str,
        action: &str,
        rule: RateLimitRule,
        now: DateTime<Utc>,
    ) -> Result<i64, sqlx::Error> {
        let reset_at = if self.is_blocked(ip_address, now).await? {
            self.counter(ip_address, BLOCKED_ACTION)
                .await?
                .map(|c| c.window_start)
        } else {
            self.counter(ip_address, action)
                .await?
                .map(|c| c.window_start + rule.window)
        };
        Ok(reset_at.map_or(0, |at| (at - now).num_seconds().max(0)))
    }

    pub async fn block_ip(
        &self,
        ip_address: &str,
        duration: Duration,
        now: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO rate_limits (ip_address, action_type, attempts, window_start)
             VALUES (?, ?, ?, ?)
             ON CONFLICT (ip_address, action_type) DO UPDATE SET
                attempts = excluded.attempts, window_start = excluded.window_start",
        )
        .bind(ip_address)
        .bind(BLOCKED_ACTION)
        .bind(BLOCKED_ATTEMPTS)
        .bind(now + duration)
        .execute(&self.pool)
        .await?;
        tracing::warn!(ip_address, until = %(now + duration), "address blocked");
        Ok(())
    }

    pub async fn unblock_ip(&self, ip_address: &str) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM rate_limits WHERE ip_address = ? AND action_type = ?")
            .bind(ip_address)
            .bind(BLOCKED_ACTION)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn is_blocked(
        &self,
        ip_address: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, sqlx::Error> {
        Ok(self
            .counter(ip_address, BLOCKED_ACTION)
            .await?
            .is_some_and(|c| c.window_start > now))
    }

    /// Drop counters whose window started before `cutoff`. Expired bans go too.
    pub async fn purge_stale(&self, cutoff: DateTime<Utc>) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM rate_limits WHERE window_start < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
