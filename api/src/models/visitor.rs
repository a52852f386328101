use chrono::{DateTime, Utc};

/// Server-side state for a browser that may not be logged in yet.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Visitor {
    pub id: String,
    pub csrf_token: Option<String>,
    pub flash_message: Option<String>,
    pub flash_type: Option<String>,
    pub oauth_state: Option<String>,
    pub oauth_provider: Option<String>,
    pub oauth_intent: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// OAuth handshake data stashed between the redirect and the callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingOAuth {
    pub state: String,
    pub provider: String,
    pub intent: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flash {
    pub message: String,
    pub kind: String,
}
