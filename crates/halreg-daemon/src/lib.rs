//! halreg-daemon - local IPC transport for the halreg registry.
//!
//! Exposes the registry engine from `halreg-core` over a Unix-domain
//! socket speaking length-prefixed JSON-RPC 2.0 frames. The `halregd`
//! binary wraps [`server::RegistryServer`]; [`client::RegistryClient`]
//! is the matching client used by tooling and tests.

pub mod client;
pub mod protocol;
pub mod server;

pub use client::RegistryClient;
pub use protocol::{HandleDescriptor, RegistrationEvent};
pub use server::{RegistryServer, ServerHandle};
