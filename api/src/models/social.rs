use chrono::{DateTime, Utc};
use serde::Serialize;

/// Normalized identity returned by an OAuth provider's profile endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct SocialProfile {
    pub provider: String,
    pub provider_id: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub username: String,
    pub profile_picture: String,
    pub email_verified: bool,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SocialLink {
    pub id: i64,
    pub user_id: i64,
    pub provider_name: String,
    pub provider_id: String,
    pub provider_email: String,
    pub provider_data: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
