//! Browser-facing half of social sign-in. Both routes answer with a 303
//! redirect; failures land on the login page with the reason attached.

use std::fmt::Display;

use axum::{
    extract::{Path, Query, State},
    response::{IntoResponse, Redirect, Response},
    Extension,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::with_query;
use crate::{
    config::{Config, ProviderConfig},
    context::{ensure_visitor, RequestContext, SetCookies, SESSION_COOKIE},
    crypto::{generate_token, tokens_match, SHORT_TOKEN_BYTES},
    models::visitor::{Flash, PendingOAuth},
    oauth::{authorization_url, OAuthError, Provider},
    AppState,
};

#[derive(Debug, Deserialize)]
pub(super) struct InitiateQuery {
    intent: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(super) struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

fn provider_config(config: &Config, provider: Provider) -> Option<&ProviderConfig> {
    match provider {
        Provider::Google => config.google.as_ref(),
        Provider::Discord => config.discord.as_ref(),
    }
    .filter(|c| c.is_configured())
}

fn internal(e: impl Display) -> OAuthError {
    tracing::error!("Social sign-in failed: {}", e);
    OAuthError::Account
}

pub(super) async fn initiate(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(provider): Path<String>,
    Query(query): Query<InitiateQuery>,
) -> Response {
    let now = Utc::now();
    let mut cookies = SetCookies::new(state.config.cookie_secure);

    match begin(&state, &ctx, &provider, query.intent, &mut cookies, now).await {
        Ok(location) => (cookies, Redirect::to(&location)).into_response(),
        Err(e) => failure(&state, &ctx, cookies, e, now).await,
    }
}

async fn begin(
    state: &AppState,
    ctx: &RequestContext,
    provider: &str,
    intent: Option<String>,
    cookies: &mut SetCookies,
    now: DateTime<Utc>,
) -> Result<String, OAuthError> {
    let provider = Provider::from_name(provider).ok_or(OAuthError::UnsupportedProvider)?;
    let config =
        provider_config(&state.config, provider).ok_or(OAuthError::NotConfigured(provider))?;

    let pending = PendingOAuth {
        state: generate_token(SHORT_TOKEN_BYTES),
        provider: provider.name().to_string(),
        intent: match intent.as_deref() {
            Some("register") => "register".into(),
            _ => "login".into(),
        },
    };
    let location = authorization_url(provider, config, &pending.state).map_err(internal)?;

    let visitor = ensure_visitor(state, ctx, cookies, now)
        .await
        .map_err(internal)?;
    state
        .visitors
        .begin_oauth(&visitor.id, &pending)
        .await
        .map_err(internal)?;

    tracing::debug!(provider = provider.name(), intent = %pending.intent, "redirecting to provider");
    Ok(location.into())
}

pub(super) async fn callback(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(provider): Path<String>,
    Query(query): Query<CallbackQuery>,
) -> Response {
    let now = Utc::now();
    let mut cookies = SetCookies::new(state.config.cookie_secure);

    match complete(&state, &ctx, &provider, query, &mut cookies, now).await {
        Ok(message) => {
            if let Some(visitor) = &ctx.visitor {
                let flash = Flash {
                    message: message.to_string(),
                    kind: "success".into(),
                };
                if let Err(e) = state.visitors.set_flash(&visitor.id, &flash).await {
                    tracing::warn!("Failed to store flash message: {}", e);
                }
            }
            let location = with_query(
                &state.config.dashboard_url,
                &[("success", "1"), ("message", message)],
            );
            (cookies, Redirect::to(&location)).into_response()
        }
        Err(e) => failure(&state, &ctx, cookies, e, now).await,
    }
}

/// Validate the returning `state`, trade the code for a profile, and log
/// the matching local account in. Returns the success message.
async fn complete(
    state: &AppState,
    ctx: &RequestContext,
    provider: &str,
    query: CallbackQuery,
    cookies: &mut SetCookies,
    now: DateTime<Utc>,
) -> Result<&'static str, OAuthError> {
    let provider = Provider::from_name(provider).ok_or(OAuthError::UnsupportedProvider)?;

    // Taken before any check so a nonce is never usable twice.
    let pending = match &ctx.visitor {
        Some(visitor) => state.visitors.take_oauth(&visitor.id).await.map_err(internal)?,
        None => None,
    };

    if query.error.is_some() {
        return Err(OAuthError::Denied(provider));
    }

    let submitted = query.state.unwrap_or_default();
    let pending = pending
        .filter(|p| tokens_match(&p.state, &submitted))
        .ok_or(OAuthError::InvalidState)?;
    if pending.provider != provider.name() {
        return Err(OAuthError::InvalidState);
    }

    let code = query
        .code
        .filter(|c| !c.is_empty())
        .ok_or(OAuthError::MissingCode)?;
    let config =
        provider_config(&state.config, provider).ok_or(OAuthError::NotConfigured(provider))?;

    let access_token = state.oauth.exchange_code(provider, config, &code).await?;
    let profile = state
        .oauth
        .fetch_profile(provider, config, &access_token)
        .await?;

    let user_id = state
        .users
        .upsert_social(&profile, now)
        .await
        .map_err(internal)?;

    if let Some(previous) = &ctx.session {
        state
            .sessions
            .destroy(&previous.session_token)
            .await
            .map_err(internal)?;
    }
    let session = state
        .sessions
        .create(user_id, &ctx.ip_address, &ctx.user_agent, now)
        .await
        .map_err(internal)?;
    state
        .users
        .record_login(user_id, now)
        .await
        .map_err(internal)?;
    tracing::info!(user_id, provider = provider.name(), "social sign-in");

    cookies.set(
        SESSION_COOKIE,
        &session.session_token,
        state.config.session_lifetime,
    );

    Ok(if pending.intent == "register" {
        "Registration successful!"
    } else {
        "Login successful!"
    })
}

async fn failure(
    state: &AppState,
    ctx: &RequestContext,
    mut cookies: SetCookies,
    error: OAuthError,
    now: DateTime<Utc>,
) -> Response {
    let message = error.to_string();
    tracing::info!(ip_address = %ctx.ip_address, "social sign-in rejected: {}", message);

    let flash = Flash {
        message: message.clone(),
        kind: "error".into(),
    };
    match ensure_visitor(state, ctx, &mut cookies, now).await {
        Ok(visitor) => {
            if let Err(e) = state.visitors.set_flash(&visitor.id, &flash).await {
                tracing::warn!("Failed to store flash message: {}", e);
            }
        }
        Err(e) => tracing::warn!("Failed to store flash message: {}", e),
    }

    let location = with_query(
        &state.config.login_page_url,
        &[("error", "1"), ("message", message.as_str())],
    );
    (cookies, Redirect::to(&location)).into_response()
}
