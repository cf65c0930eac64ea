//! Executor side of the keyrelay broker.
//!
//! [`ExecutorConnection`] keeps a duplex websocket to the task executor
//! (localhost or a discovered remote environment), reconnecting with a
//! bounded number of fixed-delay attempts. Credential requests arriving on
//! that socket are answered by [`CredentialHandoff`]: resolve through the
//! source registry, seal with the target's RSA key, reply once.

pub mod connection;
pub mod crypto;
pub mod discovery;
pub mod envelope;
pub mod events;
pub mod handoff;
pub mod target;

pub use connection::{ConnectionOptions, ExecutorConnection};
pub use crypto::CredentialEncryptionBridge;
pub use discovery::{HttpDiscovery, RemoteDiscovery, RemoteEnvironment};
pub use envelope::{CredentialResponse, Envelope, Inbound, Outbound};
pub use events::{ConnectionEvent, ConnectionState};
pub use handoff::CredentialHandoff;
pub use target::{ConnectionTarget, TargetKind};
