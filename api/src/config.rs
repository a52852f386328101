use std::{env, fmt::Display, net::SocketAddr, str::FromStr};

use anyhow::{anyhow, Context, Result};
use chrono::Duration;

/// Attempts allowed per fixed window for one rate-limited action.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitRule {
    pub max_attempts: i64,
    pub window: Duration,
}

impl RateLimitRule {
    pub fn new(max_attempts: i64, window_secs: i64) -> Self {
        Self {
            max_attempts,
            window: Duration::seconds(window_secs),
        }
    }
}

/// OAuth client registration plus the provider endpoints it talks to.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub authorize_url: String,
    pub token_url: String,
    pub profile_url: String,
}

impl ProviderConfig {
    pub fn google(client_id: String, client_secret: String, redirect_uri: String) -> Self {
        Self {
            client_id,
            client_secret,
            redirect_uri,
            authorize_url: "https://accounts.google.com/o/oauth2/v2/auth".into(),
            token_url: "https://oauth2.googleapis.com/token".into(),
            profile_url: "https://www.googleapis.com/oauth2/v2/userinfo".into(),
        }
    }

    pub fn discord(client_id: String, client_secret: String, redirect_uri: String) -> Self {
        Self {
            client_id,
            client_secret,
            redirect_uri,
            authorize_url: "https://discord.com/api/oauth2/authorize".into(),
            token_url: "https://discord.com/api/oauth2/token".into(),
            profile_url: "https://discord.com/api/users/@me".into(),
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.client_id.is_empty() && !self.client_secret.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: SocketAddr,
    pub allowed_origins: Vec<String>,
    pub cookie_secure: bool,
    pub app_url: String,
    pub login_page_url: String,
    pub dashboard_url: String,
    pub session_lifetime: Duration,
    pub remember_me_lifetime: Duration,
    pub max_login_attempts: i64,
    pub lockout_duration: Duration,
    pub login_limit: RateLimitRule,
    pub register_limit: RateLimitRule,
    pub password_reset_limit: RateLimitRule,
    pub sweep_interval: std::time::Duration,
    pub google: Option<ProviderConfig>,
    pub discord: Option<ProviderConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite::memory:".into(),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            allowed_origins: Vec::new(),
            cookie_secure: true,
            app_url: "http://localhost:3000".into(),
            login_page_url: "/auth/login".into(),
            dashboard_url: "/dashboard".into(),
            session_lifetime: Duration::hours(24),
            remember_me_lifetime: Duration::days(30),
            max_login_attempts: 5,
            lockout_duration: Duration::seconds(900),
            login_limit: RateLimitRule::new(5, 300),
            register_limit: RateLimitRule::new(3, 300),
            password_reset_limit: RateLimitRule::new(3, 300),
            sweep_interval: std::time::Duration::from_secs(300),
            google: None,
            discord: None,
        }
    }
}

impl Config {
    /// Read configuration from the process environment, falling back to
    /// [`Config::default`] for everything except `DATABASE_URL`.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let window = parse_or("RATE_LIMIT_WINDOW_SECS", 300)?;

        Ok(Self {
            database_url,
            bind_addr: parse_or("BIND_ADDR", defaults.bind_addr)?,
            allowed_origins: env::var("ALLOWED_ORIGINS")
                .map(|v| split_list(&v))
                .unwrap_or_default(),
            cookie_secure: parse_or("COOKIE_SECURE", true)?,
            app_url: env::var("APP_URL").unwrap_or(defaults.app_url),
            login_page_url: env::var("LOGIN_PAGE_URL").unwrap_or(defaults.login_page_url),
            dashboard_url: env::var("DASHBOARD_URL").unwrap_or(defaults.dashboard_url),
            session_lifetime: Duration::seconds(parse_or("SESSION_LIFETIME_SECS", 86_400)?),
            remember_me_lifetime: Duration::days(parse_or("REMEMBER_ME_DAYS", 30)?),
            max_login_attempts: parse_or("MAX_LOGIN_ATTEMPTS", 5)?,
            lockout_duration: Duration::seconds(parse_or("LOCKOUT_SECS", 900)?),
            login_limit: RateLimitRule::new(parse_or("RATE_LIMIT_LOGIN", 5)?, window),
            register_limit: RateLimitRule::new(parse_or("RATE_LIMIT_REGISTER", 3)?, window),
            password_reset_limit: RateLimitRule::new(
                parse_or("RATE_LIMIT_PASSWORD_RESET", 3)?,
                window,
            ),
            sweep_interval: std::time::Duration::from_secs(parse_or("SWEEP_INTERVAL_SECS", 300)?),
            google: provider_from_env("GOOGLE")?.map(|(id, secret, redirect)| {
                ProviderConfig::google(id, secret, redirect)
            }),
            discord: provider_from_env("DISCORD")?.map(|(id, secret, redirect)| {
                ProviderConfig::discord(id, secret, redirect)
            }),
        })
    }
}

fn parse_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow!("invalid value for {key}: {e}")),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(e) => Err(e).with_context(|| format!("failed to read {key}")),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// A provider is only enabled when its client id is set; the redirect URI is
/// mandatory once it is.
fn provider_from_env(prefix: &str) -> Result<Option<(String, String, String)>> {
    let Ok(client_id) = env::var(format!("{prefix}_CLIENT_ID")) else {
        return Ok(None);
    };
    let client_secret = env::var(format!("{prefix}_CLIENT_SECRET")).unwrap_or_default();
    let redirect_uri = env::var(format!("{prefix}_REDIRECT_URI"))
        .with_context(|| format!("{prefix}_REDIRECT_URI must be set when {prefix}_CLIENT_ID is"))?;
    Ok(Some((client_id, client_secret, redirect_uri)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_list_drops_blanks() {
        assert_eq!(
            split_list("https://a.example, ,http://localhost:5173,"),
            vec!["https://a.example", "http://localhost:5173"]
        );
    }

    #[test]
    fn provider_needs_both_credentials() {
        let google = ProviderConfig::google("id".into(), String::new(), "cb".into());
        assert!(!google.is_configured());
        let google = ProviderConfig::google("id".into(), "secret".into(), "cb".into());
        assert!(google.is_configured());
    }

    #[test]
    fn defaults_match_documented_limits() {
        let config = Config::default();
        assert_eq!(config.session_lifetime, Duration::hours(24));
        assert_eq!(config.max_login_attempts, 5);
        assert_eq!(config.login_limit.max_attempts, 5);
        assert_eq!(config.register_limit.max_attempts, 3);
        assert_eq!(config.login_limit.window, Duration::seconds(300));
    }
}
