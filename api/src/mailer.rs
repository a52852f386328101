//! Outgoing account emails.
//!
//! Nothing here talks SMTP. Handlers hand finished links to a [`Mailer`] and
//! the default [`LogMailer`] writes them to the log, which is enough for local
//! development and for tests that need to pick the link back up.

use std::sync::Mutex;

use tracing::info;

/// A message the service wants delivered to a user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Email {
    Verification { to: String, link: String },
    PasswordReset { to: String, link: String },
}

impl Email {
    pub fn recipient(&self) -> &str {
        match self {
            Email::Verification { to, .. } | Email::PasswordReset { to, .. } => to,
        }
    }
}

pub trait Mailer: Send + Sync {
    fn send(&self, email: Email);
}

/// Logs each message instead of delivering it.
#[derive(Clone, Debug, Default)]
pub struct LogMailer;

impl Mailer for LogMailer {
    fn send(&self, email: Email) {
        match &email {
            Email::Verification { to, link } => {
                info!(to_email = %to, %link, "verification email stub");
            }
            Email::PasswordReset { to, link } => {
                info!(to_email = %to, %link, "password reset email stub");
            }
        }
    }
}

/// Keeps every message in memory so callers can inspect what was sent.
#[derive(Debug, Default)]
pub struct MemoryMailer {
    sent: Mutex<Vec<Email>>,
}

impl MemoryMailer {
    pub fn sent(&self) -> Vec<Email> {
        self.sent
            .lock()
            .map(|sent| sent.clone())
            .unwrap_or_default()
    }

    pub fn last_link_for(&self, to: &str) -> Option<String> {
        self.sent().into_iter().rev().find_map(|email| match email {
            Email::Verification { to: rcpt, link } | Email::PasswordReset { to: rcpt, link }
                if rcpt == to =>
            {
                Some(link)
            }
            _ => None,
        })
    }
}

impl Mailer for MemoryMailer {
    fn send(&self, email: Email) {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(email);
        }
    }
}
