pub mod config;
pub mod context;
pub mod crypto;
pub mod db;
pub mod error;
pub mod mailer;
pub mod models;
pub mod oauth;
pub mod rate_limit;
pub mod rest;
pub mod sessions;
pub mod sweep;
pub mod users;
pub mod validation;
pub mod visitors;

use std::sync::Arc;

use sqlx::SqlitePool;

use crate::{
    config::Config,
    mailer::{LogMailer, Mailer},
    oauth::OAuthClient,
    rate_limit::RateLimiter,
    sessions::SessionStore,
    users::UserStore,
    visitors::VisitorStore,
};

pub use rest::router;

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db: SqlitePool,
    pub users: UserStore,
    pub sessions: SessionStore,
    pub visitors: VisitorStore,
    pub rate_limiter: RateLimiter,
    pub oauth: OAuthClient,
    pub mailer: Arc<dyn Mailer>,
}

impl AppState {
    pub fn new(config: Config, db: SqlitePool) -> reqwest::Result<Self> {
        Ok(Self {
            users: UserStore::new(db.clone(), config.max_login_attempts, config.lockout_duration),
            sessions: SessionStore::new(db.clone(), config.session_lifetime),
            visitors: VisitorStore::new(db.clone(), config.session_lifetime),
            rate_limiter: RateLimiter::new(db.clone()),
            oauth: OAuthClient::new()?,
            mailer: Arc::new(LogMailer),
            config: Arc::new(config),
            db,
        })
    }

    pub fn with_mailer(mut self, mailer: Arc<dyn Mailer>) -> Self {
        self.mailer = mailer;
        self
    }
}
