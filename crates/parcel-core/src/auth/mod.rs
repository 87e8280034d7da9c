//! Process-wide relay session and its phone-code handshake.
//!
//! `Unauthenticated → CodeSent → Authorized`, falling back to
//! `Unauthenticated` whenever the backend stops accepting the session.
//! Handshake transitions run under one async mutex so a send-code racing a
//! verify-code cannot mix up phone-code hashes. Readers only see the last
//! published session through a `watch` channel and never queue behind a
//! backend call.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{watch, Mutex};

use crate::backend::{BackendError, RemoteBackendClient};
use crate::models::AuthorizedIdentity;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthState {
    Unauthenticated,
    CodeSent,
    Authorized,
}

impl AuthState {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::CodeSent => "code_sent",
            Self::Authorized => "authorized",
        }
    }
}

#[derive(Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthSession {
    pub state: AuthState,
    #[serde(skip)]
    pub phone_code_hash: Option<String>,
    #[serde(skip)]
    phone_number: Option<String>,
    pub authorized_identity: Option<AuthorizedIdentity>,
}

impl AuthSession {
    const fn unauthenticated() -> Self {
        Self {
            state: AuthState::Unauthenticated,
            phone_code_hash: None,
            phone_number: None,
            authorized_identity: None,
        }
    }

    fn authorized(identity: AuthorizedIdentity) -> Self {
        Self {
            state: AuthState::Authorized,
            authorized_identity: Some(identity),
            ..Self::unauthenticated()
        }
    }

    fn reset(&mut self) {
        *self = Self::unauthenticated();
    }
}

impl fmt::Debug for AuthSession {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("AuthSession")
            .field("state", &self.state)
            .field(
                "phone_code_hash",
                &self.phone_code_hash.as_ref().map(|_| "[REDACTED]"),
            )
            .field("authorized_identity", &self.authorized_identity)
            .finish_non_exhaustive()
    }
}

pub struct AuthSessionManager {
    backend: Arc<dyn RemoteBackendClient>,
    /// Held by handshake transitions for the whole backend round trip.
    transitions: Mutex<()>,
    published: watch::Sender<AuthSession>,
}

impl fmt::Debug for AuthSessionManager {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("AuthSessionManager")
            .field("state", &self.published.borrow().state)
            .finish_non_exhaustive()
    }
}

impl AuthSessionManager {
    pub fn new(backend: Arc<dyn RemoteBackendClient>) -> Self {
        let (published, _) = watch::channel(AuthSession::unauthenticated());
        Self {
            backend,
            transitions: Mutex::new(()),
            published,
        }
    }

    /// Latest published session; never waits on an in-flight handshake.
    pub fn snapshot(&self) -> AuthSession {
        self.published.borrow().clone()
    }

    pub fn is_authorized(&self) -> bool {
        self.published.borrow().state == AuthState::Authorized
    }

    /// Fail fast with `AuthRequired` unless the relay session is usable.
    pub fn require_authorized(&self) -> Result<AuthorizedIdentity> {
        let session = self.published.borrow();
        match (&session.state, &session.authorized_identity) {
            (AuthState::Authorized, Some(identity)) => Ok(identity.clone()),
            _ => Err(Error::AuthRequired),
        }
    }

    /// Probe the backend for a session that survived a restart.
    pub async fn check_existing(&self) -> Result<AuthSession> {
        let _transition = self.transitions.lock().await;
        match self.backend.current_identity().await {
            Ok(Some(identity)) => {
                tracing::info!(user_id = identity.user_id, "Relay session already authorized");
                self.published.send_replace(AuthSession::authorized(identity));
            }
            Ok(None) => {
                self.published.send_if_modified(|session| {
                    if session.state != AuthState::Authorized {
                        return false;
                    }
                    tracing::warn!("Backend no longer recognizes the relay session");
                    session.reset();
                    true
                });
            }
            Err(BackendError::Unauthorized(reason)) => {
                tracing::warn!(reason = %reason, "Relay session rejected by backend");
                self.published.send_replace(AuthSession::unauthenticated());
            }
            Err(error) => return Err(error.into()),
        }
        Ok(self.snapshot())
    }

    /// Dispatch a login code and remember its hash.
    ///
    /// Re-invoking while a code is pending re-sends and replaces the hash.
    pub async fn request_code(&self, phone_number: &str) -> Result<String> {
        let phone_number = phone_number.trim();
        if phone_number.is_empty() {
            return Err(Error::InvalidInput("Phone number must not be empty".to_string()));
        }

        let _transition = self.transitions.lock().await;
        let state = self.published.borrow().state;
        if state == AuthState::Authorized {
            return Err(Error::AlreadyAuthorized);
        }

        let sent = self.backend.send_code(phone_number).await.map_err(|error| {
            tracing::warn!(state = state.label(), "Login code dispatch failed: {}", error);
            Error::from(error)
        })?;

        self.published.send_replace(AuthSession {
            state: AuthState::CodeSent,
            phone_code_hash: Some(sent.phone_code_hash.clone()),
            phone_number: Some(phone_number.to_string()),
            authorized_identity: None,
        });
        tracing::info!("Login code sent for relay account");
        Ok(sent.phone_code_hash)
    }

    /// Complete the handshake with the code the operator received.
    pub async fn verify_code(&self, code: &str) -> Result<AuthorizedIdentity> {
        let code = code.trim();
        if code.is_empty() {
            return Err(Error::InvalidInput("Login code must not be empty".to_string()));
        }

        let _transition = self.transitions.lock().await;
        let (phone_number, phone_code_hash) = {
            let session = self.published.borrow();
            match (&session.state, &session.phone_number, &session.phone_code_hash) {
                (AuthState::CodeSent, Some(phone), Some(hash)) => (phone.clone(), hash.clone()),
                (AuthState::Authorized, _, _) => return Err(Error::AlreadyAuthorized),
                _ => return Err(Error::NoPendingCode),
            }
        };

        match self
            .backend
            .verify_code(&phone_number, &phone_code_hash, code)
            .await
        {
            Ok(identity) => {
                tracing::info!(user_id = identity.user_id, "Relay session authorized");
                self.published.send_replace(AuthSession::authorized(identity.clone()));
                Ok(identity)
            }
            Err(BackendError::PasswordRequired) => {
                self.published.send_replace(AuthSession::unauthenticated());
                tracing::error!(
                    "Relay account has a second-factor password; reconfigure the account without 2FA"
                );
                Err(Error::TwoFactorUnsupported)
            }
            Err(BackendError::InvalidCode) => {
                tracing::warn!("Backend rejected the login code; a new code may be entered");
                Err(Error::InvalidCode)
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Drop back to `Unauthenticated` after the backend refused the session.
    ///
    /// Does not wait for an in-flight handshake.
    pub fn invalidate(&self, reason: &str) {
        self.published.send_if_modified(|session| {
            if session.state == AuthState::Unauthenticated {
                return false;
            }
            tracing::warn!(previous = session.state.label(), reason, "Relay session invalidated");
            session.reset();
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::testing::FakeBackend;

    fn manager(backend: FakeBackend) -> (AuthSessionManager, Arc<FakeBackend>) {
        let backend = Arc::new(backend);
        (AuthSessionManager::new(backend.clone()), backend)
    }

    #[tokio::test]
    async fn starts_unauthenticated_and_requires_auth() {
        let (auth, _) = manager(FakeBackend::new());
        assert_eq!(auth.snapshot().state, AuthState::Unauthenticated);
        assert!(matches!(auth.require_authorized(), Err(Error::AuthRequired)));
    }

    #[tokio::test]
    async fn check_existing_adopts_backend_identity() {
        let (auth, _) = manager(FakeBackend::new().with_identity());
        let session = auth.check_existing().await.unwrap();
        assert_eq!(session.state, AuthState::Authorized);
        assert_eq!(session.authorized_identity.unwrap().user_id, 4242);
    }

    #[tokio::test]
    async fn check_existing_stays_unauthenticated_without_identity() {
        let (auth, _) = manager(FakeBackend::new());
        let session = auth.check_existing().await.unwrap();
        assert_eq!(session.state, AuthState::Unauthenticated);
    }

    #[tokio::test]
    async fn full_handshake_reaches_authorized() {
        let (auth, backend) = manager(FakeBackend::new());
        let hash = auth.request_code("+15550100").await.unwrap();
        assert_eq!(hash, "hash-1");
        assert_eq!(auth.snapshot().state, AuthState::CodeSent);

        let identity = auth.verify_code(" 12345 ").await.unwrap();
        assert_eq!(identity.user_id, 4242);
        assert!(auth.is_authorized());
        assert_eq!(
            backend.sign_in_attempts(),
            vec![("+15550100".to_string(), "hash-1".to_string(), "12345".to_string())]
        );
    }

    #[tokio::test]
    async fn resending_code_replaces_hash() {
        let (auth, backend) = manager(FakeBackend::new());
        auth.request_code("+15550100").await.unwrap();
        let second = auth.request_code("+15550100").await.unwrap();
        assert_eq!(second, "hash-2");

        auth.verify_code("12345").await.unwrap();
        assert_eq!(backend.sign_in_attempts()[0].1, "hash-2");
    }

    #[tokio::test]
    async fn verify_without_pending_code_is_distinct_error() {
        let (auth, backend) = manager(FakeBackend::new());
        assert!(matches!(auth.verify_code("12345").await, Err(Error::NoPendingCode)));
        assert!(backend.sign_in_attempts().is_empty());
    }

    #[tokio::test]
    async fn second_factor_is_terminal_for_the_attempt() {
        let (auth, backend) = manager(FakeBackend::new().requiring_password());
        auth.request_code("+15550100").await.unwrap();

        assert!(matches!(
            auth.verify_code("12345").await,
            Err(Error::TwoFactorUnsupported)
        ));
        let session = auth.snapshot();
        assert_eq!(session.state, AuthState::Unauthenticated);
        assert_eq!(session.phone_code_hash, None);

        // no silent retry: a second verify has nothing pending
        assert!(matches!(auth.verify_code("12345").await, Err(Error::NoPendingCode)));
        assert_eq!(backend.sign_in_attempts().len(), 1);
    }

    #[tokio::test]
    async fn wrong_code_keeps_code_pending() {
        let (auth, _) = manager(FakeBackend::new().rejecting_codes());
        auth.request_code("+15550100").await.unwrap();
        assert!(matches!(auth.verify_code("00000").await, Err(Error::InvalidCode)));
        assert_eq!(auth.snapshot().state, AuthState::CodeSent);
    }

    #[tokio::test]
    async fn request_code_rejected_once_authorized() {
        let (auth, _) = manager(FakeBackend::new().with_identity());
        auth.check_existing().await.unwrap();
        assert!(matches!(
            auth.request_code("+15550100").await,
            Err(Error::AlreadyAuthorized)
        ));
    }

    #[tokio::test]
    async fn invalidate_resets_authorized_session() {
        let (auth, _) = manager(FakeBackend::new().with_identity());
        auth.check_existing().await.unwrap();
        auth.invalidate("test");
        assert!(!auth.is_authorized());
        assert_eq!(auth.snapshot().authorized_identity, None);
    }

    #[tokio::test]
    async fn concurrent_requests_serialize_hash_updates() {
        let (auth, _) = manager(FakeBackend::new());
        let auth = Arc::new(auth);
        let first = tokio::spawn({
            let auth = auth.clone();
            async move { auth.request_code("+15550100").await }
        });
        let second = tokio::spawn({
            let auth = auth.clone();
            async move { auth.request_code("+15550100").await }
        });
        let mut hashes = vec![first.await.unwrap().unwrap(), second.await.unwrap().unwrap()];
        hashes.sort();
        assert_eq!(hashes, vec!["hash-1".to_string(), "hash-2".to_string()]);

        let stored = auth.snapshot().phone_code_hash.unwrap();
        assert_eq!(stored, "hash-2");
    }

    #[tokio::test(start_paused = true)]
    async fn readers_never_wait_for_an_in_flight_handshake() {
        let (auth, backend) =
            manager(FakeBackend::new().with_sign_in_delay(Duration::from_secs(30)));
        let auth = Arc::new(auth);
        auth.request_code("+15550100").await.unwrap();

        let pending = tokio::spawn({
            let auth = auth.clone();
            async move { auth.verify_code("12345").await }
        });
        while backend.sign_in_attempts().is_empty() {
            tokio::task::yield_now().await;
        }

        assert_eq!(auth.snapshot().state, AuthState::CodeSent);
        assert!(matches!(auth.require_authorized(), Err(Error::AuthRequired)));
        auth.invalidate("relay rejected the session");
        assert_eq!(auth.snapshot().state, AuthState::Unauthenticated);

        pending.await.unwrap().unwrap();
        assert!(auth.is_authorized());
    }

    #[test]
    fn debug_output_redacts_code_hash() {
        let mut session = AuthSession::unauthenticated();
        session.phone_code_hash = Some("secret-hash".to_string());
        assert!(!format!("{session:?}").contains("secret-hash"));
    }
}
