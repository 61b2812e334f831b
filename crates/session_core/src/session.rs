use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};

use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use shared::domain::{Role, UserId};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("malformed access token: {0}")]
    MalformedToken(String),
    #[error("session was cleared before the tokens could be replaced")]
    Cleared,
}

#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    pub user_id: UserId,
    pub role: Role,
    pub expires_at: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("user_id", &self.user_id)
            .field("role", &self.role)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct AccessClaims {
    user_id: i64,
    #[serde(default)]
    role: Option<Role>,
    #[serde(default)]
    exp: Option<i64>,
}

impl Session {
    /// Builds a session from a token pair, reading identity from the access token claims.
    pub fn from_tokens(
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
    ) -> Result<Self, SessionError> {
        let access_token = access_token.into();
        let claims = read_claims(&access_token)?;
        Ok(Self {
            access_token,
            refresh_token: refresh_token.into(),
            user_id: UserId(claims.user_id),
            role: claims.role.unwrap_or(Role::Unknown),
            expires_at: claims
                .exp
                .and_then(|exp| Utc.timestamp_opt(exp, 0).single()),
        })
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }
}

// The client never holds the signing key; the server remains the verifier.
fn read_claims(token: &str) -> Result<AccessClaims, SessionError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();
    decode::<AccessClaims>(token, &DecodingKey::from_secret(&[]), &validation)
        .map(|data| data.claims)
        .map_err(|err| SessionError::MalformedToken(err.to_string()))
}

pub trait SessionObserver: Send + Sync {
    fn on_session_replaced(&self, session: &Session);
    fn on_session_cleared(&self);
}

/// Single source of truth for the current credentials.
pub struct CredentialStore {
    session: StdRwLock<Option<Session>>,
    observers: StdMutex<Vec<Arc<dyn SessionObserver>>>,
}

impl CredentialStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            session: StdRwLock::new(None),
            observers: StdMutex::new(Vec::new()),
        })
    }

    pub fn with_session(session: Session) -> Arc<Self> {
        Arc::new(Self {
            session: StdRwLock::new(Some(session)),
            observers: StdMutex::new(Vec::new()),
        })
    }

    pub fn add_observer(&self, observer: Arc<dyn SessionObserver>) {
        self.observers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(observer);
    }

    pub fn login(&self, session: Session) {
        info!(
            user_id = session.user_id.0,
            role = %session.role,
            "session: established"
        );
        {
            let mut guard = self.write_session();
            *guard = Some(session.clone());
        }
        self.notify_replaced(&session);
    }

    /// Swaps in a refreshed token pair. Keeps the current refresh token when none is rotated in.
    pub fn replace_tokens(
        &self,
        access_token: String,
        refresh_token: Option<String>,
    ) -> Result<Session, SessionError> {
        let replaced = {
            let mut guard = self.write_session();
            let Some(current) = guard.as_ref() else {
                return Err(SessionError::Cleared);
            };
            let refresh_token = refresh_token.unwrap_or_else(|| current.refresh_token.clone());
            let session = Session::from_tokens(access_token, refresh_token)?;
            *guard = Some(session.clone());
            session
        };
        debug!(user_id = replaced.user_id.0, "session: tokens replaced");
        self.notify_replaced(&replaced);
        Ok(replaced)
    }

    pub fn clear(&self) {
        let had_session = self.write_session().take().is_some();
        if had_session {
            info!("session: cleared");
            for observer in self.observers_snapshot() {
                observer.on_session_cleared();
            }
        }
    }

    pub fn access_token(&self) -> Option<String> {
        self.read_session()
            .as_ref()
            .map(|session| session.access_token.clone())
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.read_session()
            .as_ref()
            .map(|session| session.refresh_token.clone())
            .filter(|token| !token.is_empty())
    }

    pub fn snapshot(&self) -> Option<Session> {
        self.read_session().clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.read_session().is_some()
    }

    fn read_session(&self) -> std::sync::RwLockReadGuard<'_, Option<Session>> {
        self.session
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_session(&self) -> std::sync::RwLockWriteGuard<'_, Option<Session>> {
        self.session
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn notify_replaced(&self, session: &Session) {
        for observer in self.observers_snapshot() {
            observer.on_session_replaced(session);
        }
    }

    fn observers_snapshot(&self) -> Vec<Arc<dyn SessionObserver>> {
        self.observers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
