//! Authorization-code sign-in against Google and Discord.

use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::{config::ProviderConfig, models::social::SocialProfile};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Google,
    Discord,
}

impl Provider {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "google" => Some(Provider::Google),
            "discord" => Some(Provider::Discord),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Provider::Google => "google",
            Provider::Discord => "discord",
        }
    }

    fn label(self) -> &'static str {
        match self {
            Provider::Google => "Google",
            Provider::Discord => "Discord",
        }
    }

    fn scope(self) -> &'static str {
        match self {
            Provider::Google => "openid email profile",
            Provider::Discord => "identify email",
        }
    }
}

/// Everything that can end a social sign-in. The display text is shown to
/// the user on the login page.
#[derive(Debug, thiserror::Error)]
pub enum OAuthError {
    #[error("Unsupported provider")]
    UnsupportedProvider,
    #[error("{} sign-in is not configured", .0.label())]
    NotConfigured(Provider),
    #[error("Invalid state parameter")]
    InvalidState,
    #[error("Missing authorization code")]
    MissingCode,
    #[error("Authorization was denied by {}", .0.label())]
    Denied(Provider),
    #[error("Failed to obtain an access token from {}", .0.label())]
    TokenExchange(Provider),
    #[error("Failed to fetch user information from {}", .0.label())]
    Profile(Provider),
    #[error("Error processing user data")]
    Account,
}

/// Build the provider's consent URL carrying our `state` nonce.
pub fn authorization_url(
    provider: Provider,
    config: &ProviderConfig,
    state: &str,
) -> Result<Url, url::ParseError> {
    Url::parse_with_params(
        &config.authorize_url,
        [
            ("client_id", config.client_id.as_str()),
            ("redirect_uri", config.redirect_uri.as_str()),
            ("response_type", "code"),
            ("scope", provider.scope()),
            ("state", state),
        ],
    )
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GoogleUser {
    sub: Option<String>,
    id: Option<String>,
    email: Option<String>,
    given_name: Option<String>,
    family_name: Option<String>,
    picture: Option<String>,
    email_verified: Option<bool>,
    verified_email: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct DiscordUser {
    id: String,
    username: String,
    discriminator: Option<String>,
    avatar: Option<String>,
    email: Option<String>,
    verified: Option<bool>,
}

fn google_profile(user: GoogleUser) -> Option<SocialProfile> {
    let email = user.email.filter(|e| !e.is_empty())?;
    Some(SocialProfile {
        provider: Provider::Google.name().into(),
        provider_id: user.sub.or(user.id)?,
        username: email.clone(),
        email,
        first_name: user.given_name.unwrap_or_default(),
        last_name: user.family_name.unwrap_or_default(),
        profile_picture: user.picture.unwrap_or_default(),
        email_verified: user.email_verified.or(user.verified_email).unwrap_or(false),
    })
}

fn discord_profile(user: DiscordUser) -> Option<SocialProfile> {
    let email = user.email.filter(|e| !e.is_empty())?;
    let discriminator: String = user
        .discriminator
        .unwrap_or_default()
        .chars()
        .take(2)
        .collect();
    let profile_picture = user
        .avatar
        .filter(|a| !a.is_empty())
        .map(|avatar| format!("https://cdn.discordapp.com/avatars/{}/{}.png", user.id, avatar))
        .unwrap_or_default();

    Some(SocialProfile {
        provider: Provider::Discord.name().into(),
        username: format!("{}_{}", user.username, discriminator),
        first_name: user.username,
        last_name: String::new(),
        provider_id: user.id,
        email,
        profile_picture,
        email_verified: user.verified.unwrap_or(false),
    })
}

/// HTTP side of the code flow. One request per step, no retries.
#[derive(Clone)]
pub struct OAuthClient {
    http: reqwest::Client,
}

impl OAuthClient {
    pub fn new() -> reqwest::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(crate::APP_USER_AGENT)
            .timeout(HTTP_TIMEOUT)
            .build()?;
        Ok(Self { http })
    }

    pub async fn exchange_code(
        &self,
        provider: Provider,
        config: &ProviderConfig,
        code: &str,
    ) -> Result<String, OAuthError> {
        let params = [
            ("client_id", config.client_id.as_str()),
            ("client_secret", config.client_secret.as_str()),
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", config.redirect_uri.as_str()),
        ];

        let response = self
            .http
            .post(&config.token_url)
            .form(&params)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| {
                tracing::warn!(provider = provider.name(), "token request failed: {}", e);
                OAuthError::TokenExchange(provider)
            })?;

        let token: TokenResponse = response.json().await.map_err(|e| {
            tracing::warn!(provider = provider.name(), "invalid token response: {}", e);
            OAuthError::TokenExchange(provider)
        })?;

        token
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or(OAuthError::TokenExchange(provider))
    }

    pub async fn fetch_profile(
        &self,
        provider: Provider,
        config: &ProviderConfig,
        access_token: &str,
    ) -> Result<SocialProfile, OAuthError> {
        let response = self
            .http
            .get(&config.profile_url)
            .bearer_auth(access_token)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| {
                tracing::warn!(provider = provider.name(), "profile request failed: {}", e);
                OAuthError::Profile(provider)
            })?;

        let profile = match provider {
            Provider::Google => response.json::<GoogleUser>().await.map(google_profile),
            Provider::Discord => response.json::<DiscordUser>().await.map(discord_profile),
        };

        match profile {
            Ok(Some(profile)) => Ok(profile),
            Ok(None) => {
                tracing::warn!(provider = provider.name(), "profile has no email or id");
                Err(OAuthError::Profile(provider))
            }
            Err(e) => {
                tracing::warn!(provider = provider.name(), "invalid profile response: {}", e);
                Err(OAuthError::Profile(provider))
            }
        }
    }
}
