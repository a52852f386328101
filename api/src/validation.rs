use std::sync::OnceLock;

use regex::Regex;

use crate::error::FieldErrors;

pub const PASSWORD_MIN_LENGTH: usize = 8;
pub const USERNAME_MIN_LENGTH: usize = 3;

fn email_regex() -> Option<&'static Regex> {
    static EMAIL: OnceLock<Option<Regex>> = OnceLock::new();
    EMAIL
        .get_or_init(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").ok())
        .as_ref()
}

pub fn valid_email(email: &str) -> bool {
    email_regex().is_some_and(|regex| regex.is_match(email))
}

pub fn valid_username(username: &str) -> bool {
    username.len() >= USERNAME_MIN_LENGTH
        && username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// At least eight characters with a lowercase letter, an uppercase letter and a digit.
pub fn valid_password(password: &str) -> bool {
    password.chars().count() >= PASSWORD_MIN_LENGTH
        && password.chars().any(|c| c.is_ascii_lowercase())
        && password.chars().any(|c| c.is_ascii_uppercase())
        && password.chars().any(|c| c.is_ascii_digit())
}

/// Field values of a registration form after trimming.
#[derive(Debug, Default)]
pub struct Registration<'a> {
    pub username: &'a str,
    pub email: &'a str,
    pub password: &'a str,
    pub password_confirm: &'a str,
    pub terms_accepted: bool,
}

pub fn validate_registration(form: &Registration<'_>) -> FieldErrors {
    let mut errors = FieldErrors::new();

    if form.username.is_empty() {
        errors.insert("username", "Username is required");
    } else if form.username.len() < USERNAME_MIN_LENGTH {
        errors.insert("username", "Username must be at least 3 characters");
    } else if !valid_username(form.username) {
        errors.insert(
            "username",
            "Username can only contain letters, numbers, and underscores",
        );
    }

    if form.email.is_empty() {
        errors.insert("email", "Email is required");
    } else if !valid_email(form.email) {
        errors.insert("email", "Invalid email format");
    }

    if let Some(message) = password_error(form.password) {
        errors.insert("password", message);
    }

    if form.password != form.password_confirm {
        errors.insert("password_confirm", "Passwords do not match");
    }

    if !form.terms_accepted {
        errors.insert("terms", "You must accept the terms and conditions");
    }

    errors
}

/// Shared by registration and password reset.
pub fn password_error(password: &str) -> Option<&'static str> {
    if password.is_empty() {
        Some("Password is required")
    } else if !valid_password(password) {
        Some("Password must be at least 8 characters and contain uppercase, lowercase, and number")
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emails() {
        assert!(valid_email("a@example.com"));
        assert!(valid_email("name.surname@example.co"));
        assert!(!valid_email("missing-at.example.com"));
        assert!(!valid_email("a@b"));
        assert!(!valid_email("a b@example.com"));
    }

    #[test]
    fn usernames() {
        assert!(valid_username("alice_01"));
        assert!(!valid_username("al"));
        assert!(!valid_username("alice!"));
        assert!(!valid_username("alice@example.com"));
    }

    #[test]
    fn passwords() {
        assert!(valid_password("Secret123"));
        assert!(!valid_password("Sec123"));
        assert!(!valid_password("secret123"));
        assert!(!valid_password("SECRET123"));
        assert!(!valid_password("SecretSecret"));
    }

    #[test]
    fn registration_reports_every_field() {
        let errors = validate_registration(&Registration {
            username: "a!",
            email: "nope",
            password: "short",
            password_confirm: "other",
            terms_accepted: false,
        });
        assert_eq!(errors["username"], "Username must be at least 3 characters");
        assert_eq!(errors["email"], "Invalid email format");
        assert!(errors.contains_key("password"));
        assert_eq!(errors["password_confirm"], "Passwords do not match");
        assert!(errors.contains_key("terms"));
    }

    #[test]
    fn valid_registration_has_no_errors() {
        let errors = validate_registration(&Registration {
            username: "alice",
            email: "alice@example.com",
            password: "Secret123",
            password_confirm: "Secret123",
            terms_accepted: true,
        });
        assert!(errors.is_empty());
    }
}
