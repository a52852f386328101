use axum::{
    extract::State,
    response::{IntoResponse, Response},
    Extension, Json,
};
use chrono::Utc;
use serde_json::json;

use super::CSRF_FIELD;
use crate::{
    context::{ensure_visitor, RequestContext, SetCookies},
    error::AppError,
    AppState,
};

/// Hand the browser the token it must echo on state-changing requests.
/// A logged-in caller gets its session's token.
pub(super) async fn token(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
) -> Result<Response, AppError> {
    let mut cookies = SetCookies::new(state.config.cookie_secure);

    let token = match &ctx.session {
        Some(session) => session.csrf_token.clone(),
        None => {
            let mut visitor = ensure_visitor(&state, &ctx, &mut cookies, Utc::now()).await?;
            state.visitors.ensure_csrf(&mut visitor).await?
        }
    };

    Ok((
        cookies,
        Json(json!({
            "success": true,
            "token": token,
            "token_name": CSRF_FIELD,
        })),
    )
        .into_response())
}
