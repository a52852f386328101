// Shared harness for the HTTP-level tests.
//
// Requests go through `tower::ServiceExt::oneshot` against the full router
// backed by a fresh in-memory database. `Browser` keeps cookies between
// requests the way a real client would.

#![allow(dead_code)]

use std::{collections::BTreeMap, sync::Arc};

use axum::{
    body::Body,
    http::{header, HeaderMap, Method, Request, StatusCode},
    Router,
};
use chrono::Utc;
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use warden::{
    config::Config, db, mailer::MemoryMailer, models::user::CreateUser, AppState,
};

pub struct TestApp {
    pub state: AppState,
    pub router: Router,
    pub mailer: Arc<MemoryMailer>,
}

pub fn test_config() -> Config {
    Config {
        cookie_secure: false,
        app_url: "http://warden.test".into(),
        ..Config::default()
    }
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(config: Config) -> Self {
        let pool = db::connect("sqlite::memory:").await.expect("database");
        let mailer = Arc::new(MemoryMailer::default());
        let state = AppState::new(config, pool)
            .expect("state")
            .with_mailer(mailer.clone());
        Self {
            router: warden::router(state.clone()),
            state,
            mailer,
        }
    }

    /// Insert an account directly, optionally already verified.
    pub async fn create_user(&self, username: &str, email: &str, password: &str, verified: bool) -> i64 {
        let (id, token) = self
            .state
            .users
            .create(
                &CreateUser {
                    username,
                    email,
                    password,
                    first_name: Some("Test"),
                    last_name: Some("User"),
                },
                Utc::now(),
            )
            .await
            .expect("create user");
        if verified {
            assert!(self.state.users.verify_email(&token).await.expect("verify"));
        }
        id
    }
}

pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub json: Value,
}

impl TestResponse {
    pub fn set_cookies(&self) -> Vec<String> {
        self.headers
            .get_all(header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(str::to_string)
            .collect()
    }

    pub fn location(&self) -> &str {
        self.headers
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
    }

    pub fn error(&self) -> &str {
        self.json["error"].as_str().unwrap_or_default()
    }
}

pub struct Browser {
    ip: String,
    cookies: BTreeMap<String, String>,
}

impl Browser {
    pub fn new(ip: &str) -> Self {
        Self {
            ip: ip.to_string(),
            cookies: BTreeMap::new(),
        }
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    pub fn set_cookie(&mut self, name: &str, value: &str) {
        self.cookies.insert(name.to_string(), value.to_string());
    }

    pub async fn get(&mut self, app: &TestApp, uri: &str) -> TestResponse {
        self.send(app, Method::GET, uri, Vec::new()).await
    }

    pub async fn post(&mut self, app: &TestApp, uri: &str, fields: &[(&str, &str)]) -> TestResponse {
        let body = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(fields)
            .finish();
        self.send(app, Method::POST, uri, body.into_bytes()).await
    }

    /// POST an action with the browser's current CSRF token attached.
    pub async fn action(&mut self, app: &TestApp, action: &str, fields: &[(&str, &str)]) -> TestResponse {
        let token = self.csrf(app).await;
        let mut all = vec![("_token", token.as_str())];
        all.extend_from_slice(fields);
        self.post(app, &format!("/api/auth?action={action}"), &all).await
    }

    pub async fn csrf(&mut self, app: &TestApp) -> String {
        let response = self.get(app, "/api/auth/csrf").await;
        assert_eq!(response.status, StatusCode::OK);
        response.json["token"].as_str().expect("token").to_string()
    }

    pub async fn login(&mut self, app: &TestApp, email: &str, password: &str) -> TestResponse {
        self.action(app, "login", &[("email", email), ("password", password)])
            .await
    }

    async fn send(&mut self, app: &TestApp, method: Method, uri: &str, body: Vec<u8>) -> TestResponse {
        let mut request = Request::builder()
            .method(method)
            .uri(uri)
            .header("x-forwarded-for", &self.ip)
            .header(header::USER_AGENT, "warden-tests");
        if !body.is_empty() {
            request = request.header(header::CONTENT_TYPE, "application/x-www-form-urlencoded");
        }
        if !self.cookies.is_empty() {
            let cookie = self
                .cookies
                .iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect::<Vec<_>>()
                .join("; ");
            request = request.header(header::COOKIE, cookie);
        }

        let response = app
            .router
            .clone()
            .oneshot(request.body(Body::from(body)).expect("request"))
            .await
            .expect("response");

        let status = response.status();
        let headers = response.headers().clone();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body")
            .to_bytes();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);

        let response = TestResponse {
            status,
            headers,
            json,
        };
        for cookie in response.set_cookies() {
            self.absorb(&cookie);
        }
        response
    }

    fn absorb(&mut self, set_cookie: &str) {
        let pair = set_cookie.split(';').next().unwrap_or_default();
        let Some((name, value)) = pair.split_once('=') else {
            return;
        };
        if set_cookie.contains("Max-Age=0") {
            self.cookies.remove(name);
        } else {
            self.cookies.insert(name.to_string(), value.to_string());
        }
    }
}

/// Value of `name` in the query string of `url`.
pub fn query_param(url: &str, name: &str) -> Option<String> {
    let query = url.split_once('?')?.1;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}
