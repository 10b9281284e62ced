//! Kagami client library.
//!
//! Mirrors a remote workspace (files owned by a separate worker process)
//! behind filesystem semantics, with all I/O travelling over one
//! persistent message channel.
//!
//! ```text
//!   SessionManager ──token──▶ ChannelClient ◀──requests── VirtualFilesystem
//!        │                        │                            │
//!   CredentialStore          Connector (WS)               path cache
//!        │                        │                            │
//!   ~/.config/kagami      one connection to worker      optimistic updates
//! ```
//!
//! Layering, leaf first: [`CredentialStore`] persists the bearer token,
//! [`SessionManager`] owns the auth lifecycle, [`ChannelClient`]
//! multiplexes request/response exchanges over the single connection by
//! correlation id, and [`VirtualFilesystem`] keeps a local cache of
//! remote file state consistent with the operations issued through it.

pub mod channel;
pub mod constants;
pub mod credentials;
pub mod session;
pub mod transport;
pub mod vfs;

pub use channel::{
    ChannelClient, ChannelError, ChannelEvent, ConnectionState, SubscriptionId,
};
pub use credentials::{
    CredentialError, CredentialStore, FileCredentialStore, MemoryCredentialStore,
    StoredCredentials,
};
pub use session::{
    AuthBackend, AuthError, HttpAuthBackend, LoginOutcome, RegisterOutcome, SessionError,
    SessionEvent, SessionManager,
};
pub use transport::{Connector, TransportError, TransportHandle, WsConnector};
pub use transport::memory::{MemoryConnector, WorkerEnd};
pub use vfs::{CacheEntry, RemoteFailure, VfsChange, VfsChangeKind, VfsError, VirtualFilesystem};
