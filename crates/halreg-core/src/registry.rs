//! The registry facade.
//!
//! [`Registry`] is the sole owner and mutator of every interface table,
//! instance index and service entry below it. Callers get cloned
//! reference-counted handles out, never ownership of registry state. All
//! operations are bounded in-memory traversals designed to run to
//! completion on a single dispatch task; there is no internal locking
//! because there is no concurrent mutation.

use crate::entry::ServiceEntry;
use crate::handle::{HandleId, ServiceHandle};
use crate::identity::FqName;
use crate::index::InterfaceTable;
use crate::listener::RegistrationListener;
use crate::RegistryConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How `resolve` matches a requested version against published entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResolveMode {
    /// Only an entry at exactly the requested version matches. For
    /// deployments where the identity string already names one canonical
    /// version per interface.
    Exact,
    /// An entry with the same major and a published minor >= the requested
    /// minor matches. The requested version is the caller's minimum.
    #[default]
    SupportsMinor,
}

/// Death-watch interface consumed from the transport.
///
/// `link` arms a termination callback for the handle's owning process;
/// `unlink` disarms it when the registry stops referencing the handle.
/// Implementations must tolerate unlinking a handle that was never linked
/// or was already unlinked.
pub trait DeathWatch: Send {
    fn link(&mut self, handle: &ServiceHandle);
    fn unlink(&mut self, handle: &ServiceHandle);
}

/// Death watch that arms nothing. For library use and tests, where no
/// transport is present.
#[derive(Debug, Default)]
pub struct NoopDeathWatch;

impl DeathWatch for NoopDeathWatch {
    fn link(&mut self, _handle: &ServiceHandle) {}
    fn unlink(&mut self, _handle: &ServiceHandle) {}
}

/// One record in the diagnostic dump: an entry with at least one
/// passthrough client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DumpEntry {
    /// Pid owning the registered handle, when one is set.
    pub pid: Option<u32>,
    pub interface: String,
    pub instance: String,
    pub clients: Vec<u32>,
    pub arch: String,
}

/// Process-local naming and discovery registry for HAL service endpoints.
pub struct Registry {
    /// Two-level index: `package::Interface` -> instance name -> entries
    /// by exact version.
    tables: HashMap<String, InterfaceTable>,
    watch: Box<dyn DeathWatch>,
    mode: ResolveMode,
}

impl Registry {
    /// Create a registry with no death watch. Handles are then only
    /// invalidated through explicit [`Registry::on_remote_death`] calls.
    pub fn new(mode: ResolveMode) -> Self {
        Self::with_death_watch(mode, Box::new(NoopDeathWatch))
    }

    /// Create a registry wired to the transport's death-watch mechanism.
    pub fn with_death_watch(mode: ResolveMode, watch: Box<dyn DeathWatch>) -> Self {
        Self {
            tables: HashMap::new(),
            watch,
            mode,
        }
    }

    /// Publish `handle` under `instance` for every identity in the
    /// caller-declared interface chain (an interface and everything it
    /// transitively extends, most-derived first).
    ///
    /// Rejects an empty chain, an empty instance name, or any malformed
    /// identity in the chain; rejection happens before any mutation, so a
    /// malformed chain is never partially published. On success a single
    /// death watch is armed for the handle, covering every identity it was
    /// published under.
    pub fn publish(&mut self, interface_chain: &[String], instance: &str, handle: ServiceHandle) -> bool {
        if interface_chain.is_empty() {
            warn!("Rejecting publish with empty interface chain");
            return false;
        }
        if instance.is_empty() {
            warn!("Rejecting publish with empty instance name");
            return false;
        }

        // Validate the whole chain up front; a bad identity anywhere means
        // nothing is published.
        let mut chain = Vec::with_capacity(interface_chain.len());
        for fqname in interface_chain {
            match FqName::parse(fqname) {
                Ok(fq) => chain.push(fq),
                Err(e) => {
                    warn!("Rejecting publish: {}", e);
                    return false;
                }
            }
        }

        for fq in &chain {
            let table = self.tables.entry(fq.package_interface()).or_default();
            if let Some(previous) = table.publish(fq, instance, handle.clone()) {
                if previous.id() != handle.id() {
                    self.watch.unlink(&previous);
                }
            }
            info!("Registered {}", fq.instance_string(instance));
        }

        self.watch.link(&handle);
        true
    }

    /// Resolve (identity, instance) to a live handle.
    ///
    /// A miss (unknown interface, unknown instance, unsupported version,
    /// placeholder entry, or a handle already known dead) is not an error;
    /// it is `None`.
    pub fn resolve(&self, fq_name: &str, instance: &str) -> Option<ServiceHandle> {
        let fq = match FqName::parse(fq_name) {
            Ok(fq) => fq,
            Err(e) => {
                debug!("Resolve rejected: {}", e);
                return None;
            }
        };

        let table = self.tables.get(&fq.package_interface())?;
        let entry = match self.mode {
            ResolveMode::Exact => table.lookup_exact(instance, fq.version),
            ResolveMode::SupportsMinor => table.lookup_supporting(instance, fq.version),
        }?;

        entry.handle().filter(|h| h.is_alive()).cloned()
    }

    /// Snapshot of every registered instance that currently has a live
    /// handle, formatted `package@major.minor::Interface/instance`.
    /// Placeholder entries are excluded. Order is unspecified.
    pub fn list(&self) -> Vec<String> {
        self.live_entries().map(ServiceEntry::string).collect()
    }

    /// Snapshot of instance names under `fq_name` whose entries have a
    /// live handle supporting the queried version.
    pub fn list_by_interface(&self, fq_name: &str) -> Vec<String> {
        let fq = match FqName::parse(fq_name) {
            Ok(fq) => fq,
            Err(e) => {
                debug!("listByInterface rejected: {}", e);
                return Vec::new();
            }
        };

        let Some(table) = self.tables.get(&fq.package_interface()) else {
            return Vec::new();
        };

        table
            .entries()
            .filter(|e| e.has_live_handle() && e.supports_version(fq.version))
            .map(|e| e.instance_name().to_string())
            .collect()
    }

    /// Subscribe to arrivals of (identity, instance).
    ///
    /// An empty instance name subscribes to the whole interface: the
    /// listener fires for every instance under it, current and future,
    /// with `preexisting=true` replays for instances already live. A named
    /// instance attaches to (creating a placeholder for) that specific
    /// entry, with one synchronous `preexisting=true` delivery when a
    /// handle already exists.
    pub fn subscribe(
        &mut self,
        fq_name: &str,
        instance: &str,
        listener: Arc<dyn RegistrationListener>,
    ) -> bool {
        let fq = match FqName::parse(fq_name) {
            Ok(fq) => fq,
            Err(e) => {
                warn!("Rejecting subscribe: {}", e);
                return false;
            }
        };

        let table = self.tables.entry(fq.package_interface()).or_default();
        if instance.is_empty() {
            table.add_package_listener(listener);
            debug!("Added package listener for {}", fq);
        } else {
            table.entry_or_insert(&fq, instance).add_listener(listener);
            debug!("Added listener for {}", fq.instance_string(instance));
        }
        true
    }

    /// Record that `pid` uses a passthrough implementation of (identity,
    /// instance) in-process. Diagnostic bookkeeping only; no handle is
    /// published. Warns and rejects an empty instance name.
    pub fn register_passthrough_client(&mut self, fq_name: &str, instance: &str, pid: u32) -> bool {
        let fq = match FqName::parse(fq_name) {
            Ok(fq) => fq,
            Err(e) => {
                warn!("Rejecting passthrough registration: {}", e);
                return false;
            }
        };
        if instance.is_empty() {
            warn!("Cannot register passthrough client for {} with empty instance name", fq);
            return false;
        }

        let table = self.tables.entry(fq.package_interface()).or_default();
        table
            .entry_or_insert(&fq, instance)
            .register_passthrough_client(pid);
        debug!(
            "Registered passthrough client {} for {}",
            pid,
            fq.instance_string(instance)
        );
        true
    }

    /// Snapshot of every entry with at least one passthrough client, for
    /// diagnostics. No side effects.
    pub fn debug_dump(&self) -> Vec<DumpEntry> {
        self.tables
            .values()
            .flat_map(InterfaceTable::entries)
            .filter(|e| !e.passthrough_clients().is_empty())
            .map(|e| DumpEntry {
                pid: e.owner_pid(),
                interface: e.fq_name().to_string(),
                instance: e.instance_name().to_string(),
                clients: e.passthrough_clients().iter().copied().collect(),
                arch: RegistryConfig::ARCH.to_string(),
            })
            .collect()
    }

    /// Handle a termination event from the transport's death watch.
    ///
    /// Clears (silently) every entry bound to the dead handle across all
    /// interfaces it was published under, marks the handle dead, disarms
    /// its watch, and prunes entries left with nothing to justify
    /// retention. Returns whether anything was affected.
    pub fn on_remote_death(&mut self, handle_id: HandleId) -> bool {
        let mut dead: Option<ServiceHandle> = None;
        for table in self.tables.values_mut() {
            if let Some(handle) = table.clear_matching_handles(handle_id) {
                dead.get_or_insert(handle);
            }
        }

        let Some(handle) = dead else {
            debug!("Death of unknown handle {}", handle_id);
            return false;
        };

        handle.mark_dead();
        self.watch.unlink(&handle);
        self.prune();
        info!("Removed services owned by dead handle {}", handle_id);
        true
    }

    /// Drop dead-weight entries, empty instance buckets and empty
    /// interface tables. Tables holding package listeners survive with an
    /// empty index.
    fn prune(&mut self) {
        self.tables.retain(|_, table| {
            table.prune();
            !table.is_empty()
        });
    }

    fn live_entries(&self) -> impl Iterator<Item = &ServiceEntry> {
        self.tables
            .values()
            .flat_map(InterfaceTable::entries)
            .filter(|e| e.has_live_handle())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::RecordingListener;

    fn handle(id: u64) -> ServiceHandle {
        ServiceHandle::new(HandleId(id), Some(1234), 0)
    }

    fn chain(fqnames: &[&str]) -> Vec<String> {
        fqnames.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn publish_rejects_bad_input_without_mutation() {
        let mut registry = Registry::new(ResolveMode::SupportsMinor);
        assert!(!registry.publish(&[], "default", handle(1)));
        assert!(!registry.publish(&chain(&["pkg.foo@1.0::IFoo"]), "", handle(1)));
        assert!(!registry.publish(
            &chain(&["pkg.foo@1.0::IFoo", "not an fqname"]),
            "default",
            handle(1)
        ));
        // The valid head of the malformed chain must not have leaked in.
        assert!(registry.list().is_empty());
        assert!(registry.resolve("pkg.foo@1.0::IFoo", "default").is_none());
    }

    #[test]
    fn resolve_minimum_minor() {
        let mut registry = Registry::new(ResolveMode::SupportsMinor);
        assert!(registry.publish(&chain(&["pkg.foo@1.2::IFoo"]), "default", handle(1)));

        assert!(registry.resolve("pkg.foo@1.0::IFoo", "default").is_some());
        assert!(registry.resolve("pkg.foo@1.2::IFoo", "default").is_some());
        assert!(registry.resolve("pkg.foo@1.3::IFoo", "default").is_none());
        assert!(registry.resolve("pkg.foo@2.0::IFoo", "default").is_none());
        assert!(registry.resolve("pkg.foo@1.0::IFoo", "other").is_none());
        assert!(registry.resolve("pkg.bar@1.0::IBar", "default").is_none());
    }

    #[test]
    fn resolve_exact_mode_requires_exact_version() {
        let mut registry = Registry::new(ResolveMode::Exact);
        registry.publish(&chain(&["pkg.foo@1.2::IFoo"]), "default", handle(1));

        assert!(registry.resolve("pkg.foo@1.2::IFoo", "default").is_some());
        assert!(registry.resolve("pkg.foo@1.0::IFoo", "default").is_none());
    }

    #[test]
    fn chain_publish_registers_every_identity() {
        let mut registry = Registry::new(ResolveMode::SupportsMinor);
        let h = handle(1);
        assert!(registry.publish(
            &chain(&["pkg.foo@1.0::IFoo", "pkg.base@1.0::IBase"]),
            "default",
            h.clone()
        ));

        assert_eq!(registry.resolve("pkg.foo@1.0::IFoo", "default").unwrap().id(), h.id());
        assert_eq!(registry.resolve("pkg.base@1.0::IBase", "default").unwrap().id(), h.id());

        let mut listing = registry.list();
        listing.sort();
        assert_eq!(
            listing,
            vec!["pkg.base@1.0::IBase/default", "pkg.foo@1.0::IFoo/default"]
        );
    }

    #[test]
    fn list_excludes_placeholder_entries() {
        let mut registry = Registry::new(ResolveMode::SupportsMinor);
        registry.subscribe("pkg.foo@1.0::IFoo", "pending", RecordingListener::arc());
        assert!(registry.list().is_empty());
        assert!(registry.list_by_interface("pkg.foo@1.0::IFoo").is_empty());
    }

    #[test]
    fn list_by_interface_applies_version_filter() {
        let mut registry = Registry::new(ResolveMode::SupportsMinor);
        registry.publish(&chain(&["pkg.foo@1.2::IFoo"]), "a", handle(1));
        registry.publish(&chain(&["pkg.foo@2.0::IFoo"]), "b", handle(2));

        let mut instances = registry.list_by_interface("pkg.foo@1.0::IFoo");
        instances.sort();
        assert_eq!(instances, vec!["a"]);
        assert_eq!(registry.list_by_interface("pkg.foo@2.0::IFoo"), vec!["b"]);
        assert!(registry.list_by_interface("pkg.foo@3.0::IFoo").is_empty());
    }

    #[test]
    fn death_clears_whole_chain_silently() {
        let mut registry = Registry::new(ResolveMode::SupportsMinor);
        let listener = RecordingListener::arc();
        registry.subscribe("pkg.foo@1.0::IFoo", "default", listener.clone());

        let h = handle(9);
        registry.publish(
            &chain(&["pkg.foo@1.0::IFoo", "pkg.mid@1.0::IMid", "pkg.base@1.0::IBase"]),
            "default",
            h.clone(),
        );
        assert_eq!(listener.events().len(), 1);

        assert!(registry.on_remote_death(h.id()));
        assert!(registry.list().is_empty());
        for fq in ["pkg.foo@1.0::IFoo", "pkg.mid@1.0::IMid", "pkg.base@1.0::IBase"] {
            assert!(registry.resolve(fq, "default").is_none());
        }
        // Removal is silent; the listener saw only the arrival.
        assert_eq!(listener.events().len(), 1);

        assert!(!registry.on_remote_death(h.id()));
    }

    #[test]
    fn listener_survives_death_and_hears_republish() {
        let mut registry = Registry::new(ResolveMode::SupportsMinor);
        let listener = RecordingListener::arc();
        registry.subscribe("pkg.foo@1.0::IFoo", "default", listener.clone());

        let h1 = handle(1);
        registry.publish(&chain(&["pkg.foo@1.0::IFoo"]), "default", h1.clone());
        registry.on_remote_death(h1.id());

        registry.publish(&chain(&["pkg.foo@1.0::IFoo"]), "default", handle(2));
        assert_eq!(
            listener.events(),
            vec![
                ("pkg.foo@1.0::IFoo".to_string(), "default".to_string(), false),
                ("pkg.foo@1.0::IFoo".to_string(), "default".to_string(), false),
            ]
        );
    }

    #[test]
    fn passthrough_dump_round_trip() {
        let mut registry = Registry::new(ResolveMode::SupportsMinor);
        assert!(registry.register_passthrough_client("pkg.foo@1.0::IFoo", "default", 42));
        assert!(registry.register_passthrough_client("pkg.foo@1.0::IFoo", "default", 42));
        assert!(!registry.register_passthrough_client("pkg.foo@1.0::IFoo", "", 42));

        let dump = registry.debug_dump();
        assert_eq!(dump.len(), 1);
        assert_eq!(dump[0].interface, "pkg.foo@1.0::IFoo");
        assert_eq!(dump[0].instance, "default");
        assert_eq!(dump[0].clients, vec![42]);
        assert_eq!(dump[0].pid, None);

        // Entries without passthrough clients stay out of the dump.
        registry.publish(&chain(&["pkg.bar@1.0::IBar"]), "default", handle(1));
        assert_eq!(registry.debug_dump().len(), 1);
    }

    #[test]
    fn death_watch_links_and_unlinks() {
        use std::collections::HashSet;
        use std::sync::{Arc as StdArc, Mutex};

        #[derive(Default)]
        struct TrackingWatch {
            linked: StdArc<Mutex<HashSet<u64>>>,
        }
        impl DeathWatch for TrackingWatch {
            fn link(&mut self, handle: &ServiceHandle) {
                self.linked.lock().unwrap().insert(handle.id().0);
            }
            fn unlink(&mut self, handle: &ServiceHandle) {
                self.linked.lock().unwrap().remove(&handle.id().0);
            }
        }

        let watch = TrackingWatch::default();
        let linked = watch.linked.clone();
        let mut registry = Registry::with_death_watch(ResolveMode::SupportsMinor, Box::new(watch));

        let h1 = handle(1);
        registry.publish(&chain(&["pkg.foo@1.0::IFoo", "pkg.base@1.0::IBase"]), "default", h1.clone());
        assert_eq!(*linked.lock().unwrap(), HashSet::from([1]));

        // Republish with a new handle unlinks the old one.
        registry.publish(&chain(&["pkg.foo@1.0::IFoo", "pkg.base@1.0::IBase"]), "default", handle(2));
        assert_eq!(*linked.lock().unwrap(), HashSet::from([2]));

        registry.on_remote_death(HandleId(2));
        assert!(linked.lock().unwrap().is_empty());
    }
}
