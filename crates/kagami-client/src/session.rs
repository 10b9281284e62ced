//! Authentication lifecycle.
//!
//! [`SessionManager`] owns the session: login, registration, logout,
//! token validation, and the current identity. Everything above it reads
//! the token through accessors; nothing else refreshes or clears it.
//!
//! Failure semantics deliberately separate "wrong credentials" from
//! "can't reach the auth service" so a UI never tells a user to retype a
//! password the network ate. No operation here retries automatically —
//! retry is a caller decision. Validation is fail-closed: a session that
//! cannot be confirmed is treated as dead and cleared locally.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use kagami_types::Identity;

use crate::constants::{AUTH_TIMEOUT, EVENT_BUFFER, LOGOUT_TIMEOUT};
use crate::credentials::{CredentialStore, StoredCredentials};

/// Error from the auth backend.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AuthError {
    /// The service answered and said no (wrong credentials, dead token,
    /// name taken). User-correctable; never retried automatically.
    #[error("rejected: {0}")]
    Rejected(String),
    /// The service could not be reached or did not answer in time.
    /// Distinct from `Rejected` so the caller knows not to re-prompt for
    /// a password.
    #[error("auth service unreachable: {0}")]
    Unreachable(String),
}

/// Internal session errors (credential store trouble).
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Credentials(#[from] crate::credentials::CredentialError),
}

/// Successful authentication: the token, and the identity when the
/// service reported one alongside it.
#[derive(Clone, Debug)]
pub struct AuthGrant {
    pub token: String,
    pub identity: Option<Identity>,
}

/// The remote side of authentication.
///
/// One implementation talks HTTP ([`HttpAuthBackend`]); tests supply
/// their own.
#[async_trait]
pub trait AuthBackend: Send + Sync {
    /// Exchange credentials for a session token.
    async fn login(&self, username: &str, password: &str) -> Result<AuthGrant, AuthError>;
    /// Create an account. Does not log in.
    async fn register(&self, username: &str, password: &str) -> Result<(), AuthError>;
    /// Confirm a token and resolve the identity behind it.
    async fn whoami(&self, token: &str) -> Result<Identity, AuthError>;
    /// Tell the service the session is ending.
    async fn logout(&self, token: &str) -> Result<(), AuthError>;
}

// ============================================================================
// Outcomes
// ============================================================================

/// Result of a login attempt. Never an `Err` across this boundary — every
/// failure mode is a variant with a user-facing message.
#[derive(Clone, Debug)]
pub enum LoginOutcome {
    Success { identity: Identity },
    /// The service rejected the credentials.
    InvalidCredentials,
    /// The service could not be reached; the password was not checked.
    Unreachable(String),
}

impl LoginOutcome {
    pub fn success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn user_id(&self) -> Option<&str> {
        match self {
            Self::Success { identity } => Some(&identity.id),
            _ => None,
        }
    }

    /// User-facing message. Distinguishes "wrong password" from "can't
    /// reach server".
    pub fn message(&self) -> String {
        match self {
            Self::Success { identity } => format!("logged in as {}", identity.display_name),
            Self::InvalidCredentials => "invalid username or password".into(),
            Self::Unreachable(detail) => format!("cannot reach auth service: {detail}"),
        }
    }
}

/// Result of a registration attempt.
#[derive(Clone, Debug)]
pub enum RegisterOutcome {
    /// Account created and session established.
    Success { identity: Identity },
    /// Account created, but the implicit login failed. The caller can
    /// retry `login` separately; the account exists.
    AccountCreatedLoginFailed(String),
    /// The service rejected the registration (e.g. name taken).
    Rejected(String),
    /// The service could not be reached.
    Unreachable(String),
}

impl RegisterOutcome {
    pub fn success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn message(&self) -> String {
        match self {
            Self::Success { identity } => {
                format!("registered and logged in as {}", identity.display_name)
            }
            Self::AccountCreatedLoginFailed(detail) => {
                format!("account created, but login failed ({detail}); try logging in")
            }
            Self::Rejected(detail) => format!("registration rejected: {detail}"),
            Self::Unreachable(detail) => format!("cannot reach auth service: {detail}"),
        }
    }
}

/// Session state transition, for consumers that would otherwise poll.
#[derive(Clone, Debug)]
pub enum SessionEvent {
    LoggedIn(Identity),
    LoggedOut,
}

// ============================================================================
// SessionManager
// ============================================================================

/// In-memory session. Invariant: `identity` is present only alongside a
/// token; a token may exist transiently before identity is confirmed.
#[derive(Clone, Debug, Default)]
struct SessionState {
    token: Option<String>,
    identity: Option<Identity>,
}

/// Owns the authentication lifecycle and the persisted credentials.
pub struct SessionManager {
    backend: Arc<dyn AuthBackend>,
    store: Arc<dyn CredentialStore>,
    state: Mutex<SessionState>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionManager {
    /// Build a manager, restoring any persisted credentials. A corrupt or
    /// unreadable store starts the session logged out rather than failing
    /// construction.
    pub fn new(backend: Arc<dyn AuthBackend>, store: Arc<dyn CredentialStore>) -> Self {
        let state = match store.load() {
            Ok(Some(creds)) => {
                debug!("restored persisted session");
                SessionState { token: Some(creds.token), identity: creds.identity }
            }
            Ok(None) => SessionState::default(),
            Err(e) => {
                warn!("ignoring unreadable credential store: {e}");
                SessionState::default()
            }
        };
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self { backend, store, state: Mutex::new(state), events }
    }

    // ── Accessors (no I/O) ───────────────────────────────────────────────

    pub fn is_authenticated(&self) -> bool {
        self.state.lock().token.is_some()
    }

    pub fn token(&self) -> Option<String> {
        self.state.lock().token.clone()
    }

    pub fn identity(&self) -> Option<Identity> {
        self.state.lock().identity.clone()
    }

    /// Observe login/logout transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    /// Exchange credentials for a session. All failure modes come back as
    /// a [`LoginOutcome`] variant; this never returns an error.
    pub async fn login(&self, username: &str, password: &str) -> LoginOutcome {
        match self.backend.login(username, password).await {
            Ok(grant) => self.install_grant(username, grant).await,
            Err(AuthError::Rejected(detail)) => {
                debug!("login rejected: {detail}");
                LoginOutcome::InvalidCredentials
            }
            Err(AuthError::Unreachable(detail)) => {
                warn!("login unreachable: {detail}");
                LoginOutcome::Unreachable(detail)
            }
        }
    }

    /// Create an account, then log in with the same credentials. A failed
    /// implicit login is reported distinctly — the account exists and the
    /// caller may retry login on its own.
    pub async fn register(&self, username: &str, password: &str) -> RegisterOutcome {
        match self.backend.register(username, password).await {
            Ok(()) => {}
            Err(AuthError::Rejected(detail)) => return RegisterOutcome::Rejected(detail),
            Err(AuthError::Unreachable(detail)) => return RegisterOutcome::Unreachable(detail),
        }
        match self.login(username, password).await {
            LoginOutcome::Success { identity } => RegisterOutcome::Success { identity },
            other => RegisterOutcome::AccountCreatedLoginFailed(other.message()),
        }
    }

    /// End the session. Best-effort remote notification (bounded, failure
    /// swallowed), then unconditional local cleanup. Idempotent: calling
    /// this logged-out does nothing and never errors.
    pub async fn logout(&self) {
        let token = self.state.lock().token.clone();
        if let Some(token) = token {
            // Local cleanliness must never depend on this roundtrip.
            match tokio::time::timeout(LOGOUT_TIMEOUT, self.backend.logout(&token)).await {
                Ok(Ok(())) => debug!("remote logout acknowledged"),
                Ok(Err(e)) => debug!("remote logout failed (ignored): {e}"),
                Err(_) => debug!("remote logout timed out (ignored)"),
            }
        }
        self.clear_local();
    }

    /// Confirm the held token against the identity endpoint.
    ///
    /// No token → `false` with no network call. Any non-success —
    /// including plain network failure — clears the local session
    /// (fail-closed) and returns `false`.
    pub async fn validate_session(&self) -> bool {
        let Some(token) = self.state.lock().token.clone() else {
            return false;
        };
        match tokio::time::timeout(AUTH_TIMEOUT, self.backend.whoami(&token)).await {
            Ok(Ok(identity)) => {
                let mut state = self.state.lock();
                state.identity = Some(identity);
                true
            }
            Ok(Err(e)) => {
                info!("session validation failed, clearing session: {e}");
                self.clear_local();
                false
            }
            Err(_) => {
                info!("session validation timed out, clearing session");
                self.clear_local();
                false
            }
        }
    }

    // ── Internals ────────────────────────────────────────────────────────

    async fn install_grant(&self, username: &str, grant: AuthGrant) -> LoginOutcome {
        // Resolve identity if the login response did not carry it.
        let identity = match &grant.identity {
            Some(identity) => identity.clone(),
            None => match self.backend.whoami(&grant.token).await {
                Ok(identity) => identity,
                Err(e) => {
                    // The token is usable even unconfirmed; fall back to
                    // the name the user logged in with.
                    warn!("could not resolve identity after login: {e}");
                    Identity { id: username.to_string(), display_name: username.to_string() }
                }
            },
        };

        {
            let mut state = self.state.lock();
            state.token = Some(grant.token.clone());
            state.identity = Some(identity.clone());
        }
        let record = StoredCredentials { token: grant.token, identity: Some(identity.clone()) };
        if let Err(e) = self.store.save(&record) {
            warn!("could not persist credentials: {e}");
        }
        let _ = self.events.send(SessionEvent::LoggedIn(identity.clone()));
        LoginOutcome::Success { identity }
    }

    /// Clear token and identity together, in memory and in the store.
    fn clear_local(&self) {
        let was_authenticated = {
            let mut state = self.state.lock();
            let had = state.token.is_some();
            *state = SessionState::default();
            had
        };
        if let Err(e) = self.store.clear() {
            warn!("could not clear credential store: {e}");
        }
        if was_authenticated {
            let _ = self.events.send(SessionEvent::LoggedOut);
        }
    }
}

// ============================================================================
// HTTP backend
// ============================================================================

/// Auth over HTTP: `POST {base}/auth` with Basic credentials returns
/// `{"sessionToken": ...}`; `GET {base}/auth/me` with the bearer token
/// returns the identity; `POST {base}/auth/logout` ends the session.
pub struct HttpAuthBackend {
    base_url: String,
    client: reqwest::Client,
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponse {
    session_token: String,
    #[serde(default)]
    identity: Option<Identity>,
}

impl HttpAuthBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(AUTH_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { base_url: base_url.into(), client }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url.trim_end_matches('/'))
    }

    /// Map a response into Rejected (auth said no) vs Unreachable.
    async fn expect_success(
        response: Result<reqwest::Response, reqwest::Error>,
    ) -> Result<reqwest::Response, AuthError> {
        let response = response.map_err(|e| AuthError::Unreachable(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else if status.is_server_error() {
            Err(AuthError::Unreachable(format!("server error {status}")))
        } else {
            Err(AuthError::Rejected(format!("status {status}")))
        }
    }
}

#[async_trait]
impl AuthBackend for HttpAuthBackend {
    async fn login(&self, username: &str, password: &str) -> Result<AuthGrant, AuthError> {
        // Credentials ride the Authorization header; they are never
        // logged.
        let response = self
            .client
            .post(self.url("/auth"))
            .basic_auth(username, Some(password))
            .send()
            .await;
        let body: TokenResponse = Self::expect_success(response)
            .await?
            .json()
            .await
            .map_err(|e| AuthError::Unreachable(format!("bad auth response: {e}")))?;
        Ok(AuthGrant { token: body.session_token, identity: body.identity })
    }

    async fn register(&self, username: &str, password: &str) -> Result<(), AuthError> {
        let response = self
            .client
            .post(self.url("/auth/register"))
            .basic_auth(username, Some(password))
            .send()
            .await;
        Self::expect_success(response).await.map(|_| ())
    }

    async fn whoami(&self, token: &str) -> Result<Identity, AuthError> {
        let response = self
            .client
            .get(self.url("/auth/me"))
            .bearer_auth(token)
            .send()
            .await;
        Self::expect_success(response)
            .await?
            .json()
            .await
            .map_err(|e| AuthError::Unreachable(format!("bad identity response: {e}")))
    }

    async fn logout(&self, token: &str) -> Result<(), AuthError> {
        let response = self
            .client
            .post(self.url("/auth/logout"))
            .bearer_auth(token)
            .send()
            .await;
        Self::expect_success(response).await.map(|_| ())
    }
}

// ============================================================================
// Tests
// ============================================================================
