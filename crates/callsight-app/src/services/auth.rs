use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

// Token auth for the admin API.
//
// A single operator credential pair from configuration; successful login
// mints an opaque bearer token with a fixed TTL. Tokens live in memory only,
// so a restart invalidates every session.

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("authentication is not configured")]
    NotConfigured,
}

/// A minted session token and its expiry.
#[derive(Debug, Clone)]
pub struct Session {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

pub struct AuthService {
    admin_email: String,
    password_digest: Option<[u8; 32]>,
    ttl: Duration,
    sessions: RwLock<HashMap<String, DateTime<Utc>>>,
}

impl AuthService {
    /// Build from configured credentials. The plaintext password is digested
    /// immediately and never retained. An empty password leaves the service
    /// in a state where every login is rejected.
    pub fn new(admin_email: impl Into<String>, admin_password: &str, ttl: Duration) -> Self {
        let password_digest = if admin_password.is_empty() {
            None
        } else {
            Some(digest(admin_password))
        };
        Self {
            admin_email: admin_email.into(),
            password_digest,
            ttl,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.password_digest.is_some()
    }

    /// Verify credentials and mint a session token.
    pub fn login(&self, email: &str, password: &str) -> Result<Session, AuthError> {
        let Some(expected) = self.password_digest else {
            return Err(AuthError::NotConfigured);
        };
        if email != self.admin_email || digest(password) != expected {
            return Err(AuthError::InvalidCredentials);
        }

        let token = Uuid::new_v4().to_string();
        let expires_at = Utc::now() + self.ttl;
        self.sessions_mut().insert(token.clone(), expires_at);
        tracing::info!(event = "auth.login", email = %email);
        Ok(Session { token, expires_at })
    }

    /// Whether `token` belongs to a live session. Expired sessions are
    /// pruned as they are seen.
    pub fn validate(&self, token: &str) -> bool {
        let now = Utc::now();
        let mut sessions = self.sessions_mut();
        match sessions.get(token) {
            Some(expires_at) if *expires_at > now => true,
            Some(_) => {
                sessions.remove(token);
                false
            }
            None => false,
        }
    }

    pub fn logout(&self, token: &str) -> bool {
        self.sessions_mut().remove(token).is_some()
    }

    fn sessions_mut(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, DateTime<Utc>>> {
        self.sessions.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn digest(password: &str) -> [u8; 32] {
    Sha256::digest(password.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> AuthService {
        AuthService::new("admin@example.com", "hunter2", Duration::hours(24))
    }

    #[test]
    fn login_mints_distinct_valid_tokens() {
        let auth = service();

        let first = auth.login("admin@example.com", "hunter2").unwrap();
        let second = auth.login("admin@example.com", "hunter2").unwrap();

        assert_ne!(first.token, second.token);
        assert!(auth.validate(&first.token));
        assert!(auth.validate(&second.token));
    }

    #[test]
    fn wrong_credentials_are_rejected() {
        let auth = service();

        assert!(matches!(
            auth.login("admin@example.com", "wrong"),
            Err(AuthError::InvalidCredentials)
        ));
        assert!(matches!(
            auth.login("intruder@example.com", "hunter2"),
            Err(AuthError::InvalidCredentials)
        ));
    }

    #[test]
    fn empty_configured_password_rejects_all_logins() {
        let auth = AuthService::new("admin@example.com", "", Duration::hours(24));

        assert!(!auth.is_configured());
        assert!(matches!(
            auth.login("admin@example.com", ""),
            Err(AuthError::NotConfigured)
        ));
    }

    #[test]
    fn expired_tokens_are_invalid_and_pruned() {
        let auth = AuthService::new("admin@example.com", "hunter2", Duration::milliseconds(-1));

        let session = auth.login("admin@example.com", "hunter2").unwrap();
        assert!(!auth.validate(&session.token));
        // Pruned on first sight, not just rejected.
        assert!(!auth.logout(&session.token));
    }

    #[test]
    fn logout_invalidates_token() {
        let auth = service();
        let session = auth.login("admin@example.com", "hunter2").unwrap();

        assert!(auth.logout(&session.token));
        assert!(!auth.validate(&session.token));
    }

    #[test]
    fn unknown_token_is_invalid() {
        let auth = service();
        assert!(!auth.validate("not-a-token"));
    }
}
