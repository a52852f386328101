//! Per-request authentication state.
//!
//! [`resolve_session`] runs in front of every route. It works out who is
//! calling (client address, user agent, login session, visitor state) and
//! stores the result as a [`RequestContext`] extension for handlers.

use std::{convert::Infallible, net::IpAddr, net::SocketAddr};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{
        header::{SET_COOKIE, USER_AGENT},
        HeaderMap, HeaderValue,
    },
    middleware::Next,
    response::{IntoResponse, IntoResponseParts, Response, ResponseParts},
};
use axum_extra::extract::cookie::CookieJar;
use chrono::{DateTime, Duration, Utc};

use crate::{
    error::AppError,
    models::{session::Session, visitor::Visitor},
    AppState,
};

pub const SESSION_COOKIE: &str = "session";
pub const REMEMBER_COOKIE: &str = "remember_token";
pub const VISITOR_COOKIE: &str = "visitor";

const FALLBACK_IP: &str = "0.0.0.0";
const IP_HEADERS: [&str; 3] = ["x-forwarded-for", "x-real-ip", "client-ip"];

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub ip_address: String,
    pub user_agent: String,
    pub session: Option<Session>,
    pub visitor: Option<Visitor>,
}

impl RequestContext {
    pub fn require_session(&self) -> Result<&Session, AppError> {
        self.session.as_ref().ok_or(AppError::Unauthenticated)
    }

    /// The token a state-changing request must echo back: the login
    /// session's when there is one, otherwise the visitor's.
    pub fn expected_csrf(&self) -> Option<&str> {
        match &self.session {
            Some(session) => Some(session.csrf_token.as_str()),
            None => self.visitor.as_ref().and_then(|v| v.csrf_token.as_deref()),
        }
    }
}

/// First proxy-supplied address that parses as an IP, then the peer address.
pub fn client_ip(headers: &HeaderMap, peer: Option<IpAddr>) -> String {
    IP_HEADERS
        .iter()
        .filter_map(|name| headers.get(*name))
        .filter_map(|value| value.to_str().ok())
        .filter_map(|value| value.split(',').next())
        .map(str::trim)
        .find_map(|candidate| candidate.parse::<IpAddr>().ok())
        .or(peer)
        .map_or_else(|| FALLBACK_IP.to_string(), |ip| ip.to_string())
}

pub fn user_agent(headers: &HeaderMap) -> String {
    headers
        .get(USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

/// `Set-Cookie` headers to attach to a response, in order.
#[derive(Debug, Default)]
pub struct SetCookies {
    secure: bool,
    values: Vec<HeaderValue>,
}

impl SetCookies {
    pub fn new(secure: bool) -> Self {
        Self {
            secure,
            values: Vec::new(),
        }
    }

    pub fn set(&mut self, name: &str, value: &str, max_age: Duration) {
        self.push(format!("{name}={value}"), max_age.num_seconds());
    }

    pub fn clear(&mut self, name: &str) {
        self.push(format!("{name}="), 0);
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    // Browsers drop `SameSite=None` without `Secure`, so plain HTTP gets `Lax`.
    fn push(&mut self, pair: String, max_age: i64) {
        let cookie = if self.secure {
            format!("{pair}; Path=/; HttpOnly; SameSite=None; Max-Age={max_age}; Secure")
        } else {
            format!("{pair}; Path=/; HttpOnly; SameSite=Lax; Max-Age={max_age}")
        };
        match HeaderValue::from_str(&cookie) {
            Ok(value) => self.values.push(value),
            Err(e) => tracing::error!("Invalid cookie header: {}", e),
        }
    }
}

impl IntoResponseParts for SetCookies {
    type Error = Infallible;

    fn into_response_parts(self, mut res: ResponseParts) -> Result<ResponseParts, Self::Error> {
        for value in self.values {
            res.headers_mut().append(SET_COOKIE, value);
        }
        Ok(res)
    }
}

/// Return the caller's visitor state, creating it (and queueing its cookie)
/// when the browser has none yet.
pub async fn ensure_visitor(
    state: &AppState,
    ctx: &RequestContext,
    cookies: &mut SetCookies,
    now: DateTime<Utc>,
) -> Result<Visitor, AppError> {
    if let Some(visitor) = &ctx.visitor {
        return Ok(visitor.clone());
    }
    let visitor = state.visitors.create(now).await?;
    cookies.set(VISITOR_COOKIE, &visitor.id, state.config.session_lifetime);
    Ok(visitor)
}

pub async fn resolve_session(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let now = Utc::now();
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let headers = req.headers();
    let jar = CookieJar::from_headers(headers);
    let ip_address = client_ip(headers, peer);
    let user_agent = user_agent(headers);

    let mut cookies = SetCookies::new(state.config.cookie_secure);
    let session = match load_session(&state, &jar, &mut cookies, now).await {
        Ok(session) => session,
        Err(e) => return AppError::from(e).into_response(),
    };
    let visitor = match jar.get(VISITOR_COOKIE) {
        Some(cookie) => match state.visitors.find(cookie.value(), now).await {
            Ok(visitor) => visitor,
            Err(e) => return AppError::from(e).into_response(),
        },
        None => None,
    };

    req.extensions_mut().insert(RequestContext {
        ip_address,
        user_agent,
        session,
        visitor,
    });

    let mut response = next.run(req).await;
    if !cookies.is_empty() {
        // Cookies set by the handler go last so they override a rotation.
        let headers = response.headers_mut();
        let from_handler: Vec<HeaderValue> = headers.get_all(SET_COOKIE).iter().cloned().collect();
        headers.remove(SET_COOKIE);
        for value in cookies.values.into_iter().chain(from_handler) {
            headers.append(SET_COOKIE, value);
        }
    }
    response
}

/// A valid `session` cookie wins. Failing that a valid `remember_token`
/// logs the browser back in under a freshly rotated token; an invalid one is
/// cleared.
async fn load_session(
    state: &AppState,
    jar: &CookieJar,
    cookies: &mut SetCookies,
    now: DateTime<Utc>,
) -> Result<Option<Session>, sqlx::Error> {
    if let Some(cookie) = jar.get(SESSION_COOKIE) {
        if let Some(session) = state.sessions.validate(cookie.value(), now).await? {
            return Ok(Some(session));
        }
    }

    let Some(remember) = jar.get(REMEMBER_COOKIE) else {
        return Ok(None);
    };

    if let Some(session) = state.sessions.validate(remember.value(), now).await? {
        if let Some(rotated) = state.sessions.regenerate(&session.session_token).await? {
            tracing::debug!(user_id = rotated.user_id, "session restored from remember-me cookie");
            cookies.set(
                SESSION_COOKIE,
                &rotated.session_token,
                state.config.session_lifetime,
            );
            cookies.set(
                REMEMBER_COOKIE,
                &rotated.session_token,
                state.config.remember_me_lifetime,
            );
            return Ok(Some(rotated));
        }
    }

    cookies.clear(REMEMBER_COOKIE);
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.insert(*name, HeaderValue::from_static(value));
        }
        headers
    }

    #[test]
    fn forwarded_for_wins() {
        let h = headers(&[
            ("x-forwarded-for", "203.0.113.7, 10.0.0.1"),
            ("x-real-ip", "198.51.100.2"),
        ]);
        assert_eq!(client_ip(&h, None), "203.0.113.7");
    }

    #[test]
    fn invalid_header_values_are_skipped() {
        let h = headers(&[("x-forwarded-for", "unknown"), ("client-ip", "2001:db8::1")]);
        assert_eq!(client_ip(&h, None), "2001:db8::1");

        let peer = "192.0.2.5".parse().ok();
        assert_eq!(client_ip(&headers(&[("x-real-ip", "nope")]), peer), "192.0.2.5");
        assert_eq!(client_ip(&HeaderMap::new(), None), FALLBACK_IP);
    }

    #[test]
    fn cookie_attributes() {
        let mut cookies = SetCookies::new(true);
        cookies.set(SESSION_COOKIE, "abc", Duration::hours(24));
        cookies.clear(REMEMBER_COOKIE);
        assert_eq!(
            cookies.values[0],
            "session=abc; Path=/; HttpOnly; SameSite=None; Max-Age=86400; Secure"
        );
        assert_eq!(
            cookies.values[1],
            "remember_token=; Path=/; HttpOnly; SameSite=None; Max-Age=0; Secure"
        );

        let mut plain = SetCookies::new(false);
        plain.set(VISITOR_COOKIE, "v", Duration::seconds(60));
        plain.clear(SESSION_COOKIE);
        assert_eq!(
            plain.values[0],
            "visitor=v; Path=/; HttpOnly; SameSite=Lax; Max-Age=60"
        );
        assert_eq!(
            plain.values[1],
            "session=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0"
        );
    }
}
