use axum::{
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use super::{action_link, ActionRequest};
use crate::{
    context::{REMEMBER_COOKIE, SESSION_COOKIE},
    crypto,
    error::{AppError, FieldErrors},
    mailer::Email,
    models::{session::SessionInfo, user::ProfileUpdate},
    validation,
};

pub(super) async fn verify_email(req: ActionRequest) -> Result<Response, AppError> {
    req.require_get()?;
    let token = req.param("token");
    if token.is_empty() {
        return Err(AppError::BadRequest("Verification token is required"));
    }
    if !req.state.users.verify_email(token).await? {
        return Err(AppError::BadRequest("Invalid or expired verification token"));
    }

    Ok(Json(json!({
        "success": true,
        "message": "Email verified successfully. You can now log in.",
    }))
    .into_response())
}

/// Answers the same way whether or not the address has an account.
pub(super) async fn request_password_reset(req: ActionRequest) -> Result<Response, AppError> {
    req.require_post()?;
    req.verify_csrf()?;
    req.rate_limit(
        "password_reset",
        req.state.config.password_reset_limit,
        "Too many password reset requests. Please try again later.",
    )
    .await?;

    let email = req.form.text("email");
    if email.is_empty() {
        return Err(AppError::BadRequest("Email is required"));
    }
    if !validation::valid_email(email) {
        return Err(AppError::BadRequest("Invalid email format"));
    }

    if let Some(token) = req.state.users.issue_password_reset(email, req.now).await? {
        req.state.mailer.send(Email::PasswordReset {
            to: email.to_string(),
            link: action_link(&req.state.config.app_url, "resetPassword", &token),
        });
    }

    Ok(Json(json!({
        "success": true,
        "message": "If an account exists for that email, a password reset link has been sent.",
    }))
    .into_response())
}

fn new_password_errors(password: &str, confirm: &str) -> FieldErrors {
    let mut errors = FieldErrors::new();
    if let Some(message) = validation::password_error(password) {
        errors.insert("password", message);
    }
    if password != confirm {
        errors.insert("password_confirm", "Passwords do not match");
    }
    errors
}

pub(super) async fn reset_password(req: ActionRequest) -> Result<Response, AppError> {
    req.require_post()?;
    req.verify_csrf()?;

    let token = req.form.text("token");
    if token.is_empty() {
        return Err(AppError::BadRequest("Reset token is required"));
    }
    let password = req.form.raw("password");
    let errors = new_password_errors(password, req.form.raw("password_confirm"));
    if !errors.is_empty() {
        return Err(AppError::Validation(errors));
    }

    let user_id = req
        .state
        .users
        .reset_password(token, password, req.now)
        .await?
        .ok_or(AppError::BadRequest("Invalid or expired reset token"))?;
    let closed = req.state.sessions.destroy_all_for_user(user_id).await?;
    tracing::info!(user_id, sessions_closed = closed, "password reset");

    let mut cookies = req.cookies();
    cookies.clear(SESSION_COOKIE);
    cookies.clear(REMEMBER_COOKIE);

    Ok((
        cookies,
        Json(json!({
            "success": true,
            "message": "Your password has been reset. Please log in.",
        })),
    )
        .into_response())
}

pub(super) async fn update_profile(req: ActionRequest) -> Result<Response, AppError> {
    req.require_post()?;
    req.verify_csrf()?;
    let session = req.ctx.require_session()?;

    let update = ProfileUpdate {
        first_name: req.form.optional("first_name"),
        last_name: req.form.optional("last_name"),
        profile_picture: req.form.optional("profile_picture"),
    };
    if update.is_empty() {
        return Err(AppError::BadRequest("No changes provided"));
    }
    if let Some(picture) = update.profile_picture.as_deref().filter(|p| !p.is_empty()) {
        let valid = url::Url::parse(picture).is_ok_and(|u| matches!(u.scheme(), "http" | "https"));
        if !valid {
            let mut errors = FieldErrors::new();
            errors.insert("profile_picture", "Profile picture must be an http(s) URL");
            return Err(AppError::Validation(errors));
        }
    }

    let users = &req.state.users;
    users.update_profile(session.user_id, &update).await?;
    let user = users
        .find_by_id(session.user_id)
        .await?
        .ok_or(AppError::NotFound("User not found"))?;

    Ok(Json(json!({
        "success": true,
        "message": "Profile updated",
        "user": user,
    }))
    .into_response())
}

pub(super) async fn change_password(req: ActionRequest) -> Result<Response, AppError> {
    req.require_post()?;
    req.verify_csrf()?;
    let session = req.ctx.require_session()?;
    let users = &req.state.users;

    let user = users
        .find_by_id(session.user_id)
        .await?
        .ok_or(AppError::NotFound("User not found"))?;

    if !crypto::verify_password(req.form.raw("current_password"), &user.password_hash) {
        let mut errors = FieldErrors::new();
        errors.insert("current_password", "Current password is incorrect");
        return Err(AppError::Validation(errors));
    }

    let password = req.form.raw("password");
    let errors = new_password_errors(password, req.form.raw("password_confirm"));
    if !errors.is_empty() {
        return Err(AppError::Validation(errors));
    }

    users.change_password(user.id, password).await?;
    let closed = req.state.sessions.destroy_others(user.id, session.id).await?;
    tracing::info!(user_id = user.id, sessions_closed = closed, "password changed");

    Ok(Json(json!({
        "success": true,
        "message": "Password changed successfully",
    }))
    .into_response())
}

pub(super) async fn sessions(req: ActionRequest) -> Result<Response, AppError> {
    let current = req.ctx.require_session()?;
    let sessions = &req.state.sessions;

    let listed: Vec<SessionInfo> = sessions
        .list_for_user(current.user_id, req.now)
        .await?
        .into_iter()
        .map(|s| SessionInfo::new(s, current.id))
        .collect();
    let suspicious = sessions.suspicious_activity(current.user_id, req.now).await?;

    Ok(Json(json!({
        "success": true,
        "sessions": listed,
        "suspicious_activity": suspicious,
    }))
    .into_response())
}

pub(super) async fn logout_all(req: ActionRequest) -> Result<Response, AppError> {
    req.require_post()?;
    req.verify_csrf()?;
    let session = req.ctx.require_session()?;

    let closed = req.state.sessions.destroy_all_for_user(session.user_id).await?;
    tracing::info!(user_id = session.user_id, sessions_closed = closed, "logged out everywhere");

    let mut cookies = req.cookies();
    cookies.clear(SESSION_COOKIE);
    cookies.clear(REMEMBER_COOKIE);

    Ok((
        cookies,
        Json(json!({
            "success": true,
            "message": "Logged out of all sessions",
            "sessions_closed": closed,
        })),
    )
        .into_response())
}

pub(super) async fn extend_session(req: ActionRequest) -> Result<Response, AppError> {
    req.require_post()?;
    req.verify_csrf()?;
    let session = req.ctx.require_session()?;
    let state = &req.state;

    if !state.sessions.extend(&session.session_token, req.now).await? {
        return Err(AppError::Unauthenticated);
    }

    let mut cookies = req.cookies();
    cookies.set(
        SESSION_COOKIE,
        &session.session_token,
        state.config.session_lifetime,
    );

    Ok((
        cookies,
        Json(json!({
            "success": true,
            "expires_at": req.now + state.config.session_lifetime,
        })),
    )
        .into_response())
}
