//! Centralized configuration constants for halreg.

use std::time::Duration;

/// Registry-wide configuration.
pub struct RegistryConfig;

impl RegistryConfig {
    /// Instance name the daemon registers itself under.
    pub const MANAGER_INSTANCE: &'static str = "default";

    /// Interface chain the daemon publishes for its own control surface,
    /// most-derived first.
    pub const MANAGER_CHAIN: &'static [&'static str] = &[
        "halreg.manager@1.0::IServiceManager",
        "halreg.base@1.0::IBase",
    ];

    /// Architecture tag reported in diagnostic dumps.
    pub const ARCH: &'static str = std::env::consts::ARCH;
}

/// Configuration for the local IPC transport.
pub struct IpcConfig;

impl IpcConfig {
    /// Default socket filename, created under the system temp directory.
    pub const SOCKET_FILE_NAME: &'static str = "halregd.sock";

    /// Readiness flag filename written once the daemon is accepting calls.
    pub const READY_FILE_NAME: &'static str = "halregd.ready";

    /// Maximum accepted IPC frame payload size in bytes.
    pub const MAX_IPC_MESSAGE_SIZE: usize = 1024 * 1024; // 1MB

    /// Maximum concurrent client connections.
    pub const MAX_IPC_CONNECTIONS: usize = 256;

    /// Client-side connect timeout.
    pub const IPC_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
}
