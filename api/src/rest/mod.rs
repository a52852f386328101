//! HTTP surface: the `/api/auth?action=` front controller plus the CSRF,
//! social sign-in and health routes.

mod account;
mod auth;
mod csrf;
mod social;

use std::collections::HashMap;

use axum::{
    body::Bytes,
    extract::State,
    http::{
        header::{CONTENT_TYPE, HeaderName},
        HeaderMap, HeaderValue, Method, Uri,
    },
    middleware::from_fn_with_state,
    response::Response,
    routing::{any, get},
    Extension, Json, Router,
};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};

use crate::{
    config::{Config, RateLimitRule},
    context::{resolve_session, RequestContext, SetCookies},
    crypto::tokens_match,
    error::AppError,
    AppState,
};

/// Form field that carries the CSRF token.
pub const CSRF_FIELD: &str = "_token";
const CSRF_HEADER: &str = "x-csrf-token";

pub fn router(state: AppState) -> Router {
    let middleware = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&state.config));

    Router::new()
        .route("/api/auth", any(dispatch))
        .route("/api/auth/csrf", get(csrf::token))
        .route("/api/auth/social/:provider", get(social::initiate))
        .route("/api/auth/social/:provider/callback", get(social::callback))
        .route("/health", get(health))
        .layer(from_fn_with_state(state.clone(), resolve_session))
        .layer(middleware)
        .with_state(state)
}

fn cors_layer(config: &Config) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            CONTENT_TYPE,
            HeaderName::from_static("x-requested-with"),
            HeaderName::from_static(CSRF_HEADER),
        ])
}

async fn health(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    sqlx::query("SELECT 1").execute(&state.db).await?;
    Ok(Json(json!({"status": "ok"})))
}

/// Decoded `application/x-www-form-urlencoded` pairs. Later duplicates win.
#[derive(Debug, Default)]
pub(crate) struct Params(HashMap<String, String>);

impl Params {
    pub(crate) fn parse(input: &[u8]) -> Self {
        Self(url::form_urlencoded::parse(input).into_owned().collect())
    }

    /// Trimmed value, empty when absent.
    pub(crate) fn text(&self, name: &str) -> &str {
        self.raw(name).trim()
    }

    /// Untrimmed value, for passwords.
    pub(crate) fn raw(&self, name: &str) -> &str {
        self.0.get(name).map_or("", String::as_str)
    }

    pub(crate) fn has(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub(crate) fn optional(&self, name: &str) -> Option<String> {
        self.0.get(name).map(|value| value.trim().to_string())
    }
}

/// Everything an action handler may look at.
pub(crate) struct ActionRequest {
    pub state: AppState,
    pub ctx: RequestContext,
    pub method: Method,
    pub headers: HeaderMap,
    pub query: Params,
    pub form: Params,
    pub now: DateTime<Utc>,
}

impl ActionRequest {
    pub(crate) fn require_post(&self) -> Result<(), AppError> {
        if self.method == Method::POST {
            Ok(())
        } else {
            Err(AppError::MethodNotAllowed)
        }
    }

    /// For links followed straight from an email.
    pub(crate) fn require_get(&self) -> Result<(), AppError> {
        if self.method == Method::GET {
            Ok(())
        } else {
            Err(AppError::MethodNotAllowed)
        }
    }

    pub(crate) fn verify_csrf(&self) -> Result<(), AppError> {
        let submitted = match self.form.raw(CSRF_FIELD) {
            "" => self
                .headers
                .get(CSRF_HEADER)
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default(),
            token => token,
        };
        let expected = self.ctx.expected_csrf().unwrap_or_default();
        if tokens_match(expected, submitted) {
            Ok(())
        } else {
            tracing::info!(ip_address = %self.ctx.ip_address, "csrf token rejected");
            Err(AppError::CsrfMismatch)
        }
    }

    pub(crate) async fn rate_limit(
        &self,
        action: &str,
        rule: RateLimitRule,
        message: &'static str,
    ) -> Result<(), AppError> {
        let limiter = &self.state.rate_limiter;
        let ip_address = self.ctx.ip_address.as_str();
        if limiter.check(ip_address, action, rule, self.now).await {
            return Ok(());
        }
        let retry_after = limiter
            .seconds_until_reset(ip_address, action, rule, self.now)
            .await
            .unwrap_or(rule.window.num_seconds());
        Err(AppError::RateLimited {
            message,
            retry_after,
        })
    }

    /// Query parameter, falling back to the form body.
    pub(crate) fn param(&self, name: &str) -> &str {
        match self.query.text(name) {
            "" => self.form.text(name),
            value => value,
        }
    }

    pub(crate) fn cookies(&self) -> SetCookies {
        SetCookies::new(self.state.config.cookie_secure)
    }
}

async fn dispatch(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    method: Method,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> Result<Response, AppError> {
    let req = ActionRequest {
        state,
        ctx,
        method,
        headers,
        query: Params::parse(uri.query().unwrap_or_default().as_bytes()),
        form: Params::parse(&body),
        now: Utc::now(),
    };
    let action = req.param("action").to_string();
    tracing::debug!(action = %action, method = %req.method, "auth action");

    match action.as_str() {
        "login" => auth::login(req).await,
        "register" => auth::register(req).await,
        "logout" => auth::logout(req).await,
        "getCurrentUser" => auth::current_user(req).await,
        "checkEmail" => auth::check_email(req).await,
        "checkUsername" => auth::check_username(req).await,
        "getFlashMessage" => auth::flash_message(req).await,
        "verifyEmail" => account::verify_email(req).await,
        "requestPasswordReset" => account::request_password_reset(req).await,
        "resetPassword" => account::reset_password(req).await,
        "updateProfile" => account::update_profile(req).await,
        "changePassword" => account::change_password(req).await,
        "getSessions" => account::sessions(req).await,
        "logoutAll" => account::logout_all(req).await,
        "extendSession" => account::extend_session(req).await,
        _ => Err(AppError::BadRequest("Invalid action")),
    }
}

/// Append `pairs` to a possibly relative URL.
pub(crate) fn with_query(base: &str, pairs: &[(&str, &str)]) -> String {
    let query = url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish();
    let separator = if base.contains('?') { '&' } else { '?' };
    format!("{base}{separator}{query}")
}

/// Absolute link back into the front controller, used in emails.
pub(crate) fn action_link(app_url: &str, action: &str, token: &str) -> String {
    let base = format!("{}/api/auth", app_url.trim_end_matches('/'));
    with_query(&base, &[("action", action), ("token", token)])
}
