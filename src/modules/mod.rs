//! Cross-cutting services module
//!
//! Relay-wide state that outlives a single session: the cookie jar, the
//! durable store behind the pending queue and the credential, and the event
//! hooks.

pub mod cookies;
pub mod events;
pub mod state;

// Re-export commonly used types
pub use cookies::SessionCookieJar;
pub use events::{
    AuthEvent, ConnectionEvent, DistressEvent, EventDispatcher, EventHandler, LoggingHandler,
    RecoveryEvent, RelayEvent, RequestEvent, ResetEvent,
};
pub use state::{Credential, CredentialStore, PendingEntry, PendingQueue, StateStore, StoreError};
