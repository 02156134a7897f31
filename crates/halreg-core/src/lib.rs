//! halreg-core - Naming and discovery registry for HAL service endpoints.
//!
//! A process-local registry indexing service implementations by versioned
//! interface identity (`package.path@major.minor::InterfaceName`) and
//! instance name. Callers publish handles under a declared interface
//! chain, resolve (interface, version, instance) triples to live handles,
//! or subscribe to be notified when a matching implementation arrives.
//! Entries bound to a terminated remote process are cleared through the
//! transport's death watch.
//!
//! This crate is the headless engine; the IPC transport that feeds it
//! lives in `halreg-daemon`.
//!
//! # Example
//!
//! ```
//! use halreg_core::{HandleId, Registry, ResolveMode, ServiceHandle};
//!
//! let mut registry = Registry::new(ResolveMode::SupportsMinor);
//! let handle = ServiceHandle::new(HandleId(1), Some(4242), 0);
//!
//! let chain = vec!["demo.light@1.1::ILight".to_string()];
//! assert!(registry.publish(&chain, "default", handle));
//!
//! // Same major, lower requested minor resolves.
//! assert!(registry.resolve("demo.light@1.0::ILight", "default").is_some());
//! assert!(registry.resolve("demo.light@2.0::ILight", "default").is_none());
//! ```

pub mod config;
pub mod entry;
pub mod error;
pub mod handle;
pub mod identity;
pub mod index;
pub mod listener;
pub mod registry;
pub mod token;

// Re-export commonly used types
pub use config::{IpcConfig, RegistryConfig};
pub use error::{RegistryError, Result};
pub use handle::{HandleId, ServiceHandle, WeakServiceHandle};
pub use identity::{FqName, Version};
pub use listener::{ListenerGone, RegistrationListener};
pub use registry::{DeathWatch, DumpEntry, NoopDeathWatch, Registry, ResolveMode};
pub use token::TokenStore;

#[cfg(test)]
pub(crate) mod test_util {
    use crate::identity::FqName;
    use crate::listener::{ListenerGone, RegistrationListener};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    /// Listener that records every delivery and can be flipped into a
    /// permanently-failing state.
    #[derive(Default)]
    pub struct RecordingListener {
        events: Mutex<Vec<(String, String, bool)>>,
        broken: AtomicBool,
    }

    impl RecordingListener {
        pub fn arc() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn events(&self) -> Vec<(String, String, bool)> {
            self.events.lock().unwrap().clone()
        }

        pub fn break_delivery(&self) {
            self.broken.store(true, Ordering::SeqCst);
        }
    }

    impl RegistrationListener for RecordingListener {
        fn on_registration(
            &self,
            fq_name: &FqName,
            instance: &str,
            preexisting: bool,
        ) -> std::result::Result<(), ListenerGone> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(ListenerGone);
            }
            self.events
                .lock()
                .unwrap()
                .push((fq_name.to_string(), instance.to_string(), preexisting));
            Ok(())
        }
    }
}
