//! Credential access.
//!
//! Token storage and refresh belong to the application. The engine only
//! reads the current token and user id through [`CredentialStore`], once per
//! connection attempt, so a refreshed token is picked up on the next
//! reconnect.

use async_trait::async_trait;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use zeroize::Zeroizing;

use chat_types::UserId;

/// Auth token plus the user it belongs to.
///
/// The token is wiped from memory on drop.
#[derive(Clone)]
pub struct Credential {
    token: Zeroizing<String>,
    user_id: UserId,
}

impl Credential {
    /// Create a credential.
    pub fn new(token: impl Into<String>, user_id: UserId) -> Self {
        Self {
            token: Zeroizing::new(token.into()),
            user_id,
        }
    }

    /// Bearer token presented during the handshake.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Local user.
    pub fn user_id(&self) -> UserId {
        self.user_id
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"[REDACTED]")
            .field("user_id", &self.user_id)
            .finish()
    }
}

/// Source of the current credential.
#[async_trait]
pub trait CredentialStore: Send + Sync + 'static {
    /// Current auth token, if signed in.
    async fn token(&self) -> Option<Zeroizing<String>>;

    /// Current user id, if signed in.
    async fn user_id(&self) -> Option<UserId>;

    /// Both halves, or `None` if either is missing.
    async fn credential(&self) -> Option<Credential> {
        let token = self.token().await?;
        let user_id = self.user_id().await?;
        Some(Credential {
            token,
            user_id,
        })
    }
}

/// In-memory credential store.
///
/// Clones share state, so an application (or test) can sign in and out
/// while the engine holds its own handle.
#[derive(Clone, Default)]
pub struct MemoryCredentials {
    inner: Arc<Mutex<Option<Credential>>>,
}

impl MemoryCredentials {
    /// A store holding the given credential.
    pub fn new(token: impl Into<String>, user_id: UserId) -> Self {
        let store = Self::default();
        store.set(token, user_id);
        store
    }

    /// An empty (signed out) store.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Replace the stored credential.
    pub fn set(&self, token: impl Into<String>, user_id: UserId) {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(Credential::new(token, user_id));
    }

    /// Sign out.
    pub fn clear(&self) {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn current(&self) -> Option<Credential> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl fmt::Debug for MemoryCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryCredentials")
            .field("credential", &self.current())
            .finish()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentials {
    async fn token(&self) -> Option<Zeroizing<String>> {
        self.current().map(|c| c.token)
    }

    async fn user_id(&self) -> Option<UserId> {
        self.current().map(|c| c.user_id)
    }

    async fn credential(&self) -> Option<Credential> {
        self.current()
    }
}
