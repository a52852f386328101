use axum::{
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use super::{action_link, ActionRequest};
use crate::{
    context::{REMEMBER_COOKIE, SESSION_COOKIE},
    crypto,
    error::AppError,
    mailer::Email,
    models::user::{CreateUser, UserSummary},
    validation::{self, Registration},
};

pub(super) async fn login(req: ActionRequest) -> Result<Response, AppError> {
    req.require_post()?;
    req.verify_csrf()?;
    req.rate_limit(
        "login",
        req.state.config.login_limit,
        "Too many login attempts. Please try again later.",
    )
    .await?;

    let email = req.form.text("email");
    let password = req.form.raw("password");
    let remember_me = req.form.has("remember_me");

    if email.is_empty() || password.is_empty() {
        return Err(AppError::BadRequest("Email and password are required"));
    }
    if !validation::valid_email(email) {
        return Err(AppError::BadRequest("Invalid email format"));
    }

    let state = &req.state;
    let ctx = &req.ctx;
    let now = req.now;

    let Some(user) = state.users.find_by_email(email).await? else {
        state
            .users
            .record_login_attempt(&ctx.ip_address, email, false, &ctx.user_agent, now)
            .await;
        return Err(AppError::LoginFail);
    };

    if user.is_locked(now) {
        return Err(AppError::AccountLocked);
    }

    if !crypto::verify_password(password, &user.password_hash) {
        state.users.record_failed_attempt(email, now).await?;
        state
            .users
            .record_login_attempt(&ctx.ip_address, email, false, &ctx.user_agent, now)
            .await;
        return Err(AppError::LoginFail);
    }

    if !user.email_verified {
        return Err(AppError::EmailNotVerified);
    }

    state.users.record_login(user.id, now).await?;
    state
        .users
        .record_login_attempt(&ctx.ip_address, email, true, &ctx.user_agent, now)
        .await;

    // A new login never reuses the browser's previous session.
    if let Some(previous) = &ctx.session {
        state.sessions.destroy(&previous.session_token).await?;
    }
    let session = state
        .sessions
        .create(user.id, &ctx.ip_address, &ctx.user_agent, now)
        .await?;
    tracing::info!(user_id = user.id, ip_address = %ctx.ip_address, "user logged in");

    let mut cookies = req.cookies();
    cookies.set(
        SESSION_COOKIE,
        &session.session_token,
        state.config.session_lifetime,
    );
    if remember_me {
        cookies.set(
            REMEMBER_COOKIE,
            &session.session_token,
            state.config.remember_me_lifetime,
        );
    }

    Ok((
        cookies,
        Json(json!({
            "success": true,
            "message": "Login successful",
            "user": UserSummary::from(&user),
        })),
    )
        .into_response())
}

pub(super) async fn register(req: ActionRequest) -> Result<Response, AppError> {
    req.require_post()?;
    req.verify_csrf()?;
    req.rate_limit(
        "register",
        req.state.config.register_limit,
        "Too many registration attempts. Please try again later.",
    )
    .await?;

    let form = &req.form;
    let registration = Registration {
        username: form.text("username"),
        email: form.text("email"),
        password: form.raw("password"),
        password_confirm: form.raw("password_confirm"),
        terms_accepted: form.has("terms_accepted"),
    };
    let errors = validation::validate_registration(&registration);
    if !errors.is_empty() {
        return Err(AppError::Validation(errors));
    }

    let users = &req.state.users;
    if users.email_exists(registration.email).await? {
        return Err(AppError::Conflict {
            field: "email",
            message: "Email address is already registered",
        });
    }
    if users.username_exists(registration.username).await? {
        return Err(AppError::Conflict {
            field: "username",
            message: "Username is already taken",
        });
    }

    let (user_id, verification_token) = users
        .create(
            &CreateUser {
                username: registration.username,
                email: registration.email,
                password: registration.password,
                first_name: Some(form.text("first_name")),
                last_name: Some(form.text("last_name")),
            },
            req.now,
        )
        .await?;
    tracing::info!(user_id, "account registered");

    req.state.mailer.send(Email::Verification {
        to: registration.email.to_string(),
        link: action_link(
            &req.state.config.app_url,
            "verifyEmail",
            &verification_token,
        ),
    });

    Ok(Json(json!({
        "success": true,
        "message": "Registration successful. Please check your email to verify your account.",
        "user_id": user_id,
    }))
    .into_response())
}

pub(super) async fn logout(req: ActionRequest) -> Result<Response, AppError> {
    if let Some(session) = &req.ctx.session {
        req.state.sessions.destroy(&session.session_token).await?;
        tracing::info!(user_id = session.user_id, "user logged out");
    }

    let mut cookies = req.cookies();
    cookies.clear(SESSION_COOKIE);
    cookies.clear(REMEMBER_COOKIE);

    Ok((
        cookies,
        Json(json!({"success": true, "message": "Logout successful"})),
    )
        .into_response())
}

pub(super) async fn current_user(req: ActionRequest) -> Result<Response, AppError> {
    let session = req.ctx.require_session()?;
    let user = req
        .state
        .users
        .find_by_id(session.user_id)
        .await?
        .ok_or(AppError::NotFound("User not found"))?;

    Ok(Json(json!({"success": true, "user": user})).into_response())
}

pub(super) async fn check_email(req: ActionRequest) -> Result<Response, AppError> {
    req.require_post()?;
    let email = req.form.text("email");
    if email.is_empty() {
        return Err(AppError::BadRequest("Email is required"));
    }
    if !validation::valid_email(email) {
        return Err(AppError::BadRequest("Invalid email format"));
    }

    let exists = req.state.users.email_exists(email).await?;
    Ok(Json(json!({"exists": exists})).into_response())
}

pub(super) async fn check_username(req: ActionRequest) -> Result<Response, AppError> {
    req.require_post()?;
    let username = req.form.text("username");
    if username.is_empty() {
        return Err(AppError::BadRequest("Username is required"));
    }
    if !validation::valid_username(username) {
        return Err(AppError::BadRequest("Invalid username format"));
    }

    let exists = req.state.users.username_exists(username).await?;
    Ok(Json(json!({"exists": exists})).into_response())
}

pub(super) async fn flash_message(req: ActionRequest) -> Result<Response, AppError> {
    let flash = match &req.ctx.visitor {
        Some(visitor) => req.state.visitors.take_flash(&visitor.id).await?,
        None => None,
    };

    Ok(match flash {
        Some(flash) => Json(json!({"message": flash.message, "type": flash.kind})),
        None => Json(json!({"message": null})),
    }
    .into_response())
}
