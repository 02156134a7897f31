//! A single registered (interface, instance) binding.

use crate::handle::ServiceHandle;
use crate::identity::{FqName, Version};
use crate::listener::{fan_out, RegistrationListener};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

/// One registered (interface identity, instance name) binding.
///
/// Note the handle can be absent: an entry may exist purely to hold
/// listeners registered before any service arrived, or passthrough-client
/// bookkeeping. Listener and client sets persist across handle-less
/// periods.
pub struct ServiceEntry {
    fq_name: FqName,
    instance_name: String,
    handle: Option<ServiceHandle>,
    owner_pid: Option<u32>,
    listeners: Vec<Arc<dyn RegistrationListener>>,
    passthrough_clients: BTreeSet<u32>,
}

impl ServiceEntry {
    /// Create an entry with no handle (placeholder for listeners or
    /// passthrough bookkeeping).
    pub fn new(fq_name: FqName, instance_name: impl Into<String>) -> Self {
        Self {
            fq_name,
            instance_name: instance_name.into(),
            handle: None,
            owner_pid: None,
            listeners: Vec::new(),
            passthrough_clients: BTreeSet::new(),
        }
    }

    pub fn fq_name(&self) -> &FqName {
        &self.fq_name
    }

    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }

    pub fn version(&self) -> Version {
        self.fq_name.version
    }

    /// Current handle, if any. A returned handle may be invalidated at any
    /// time relative to the caller's use of it.
    pub fn handle(&self) -> Option<&ServiceHandle> {
        self.handle.as_ref()
    }

    /// Whether the entry currently has a live handle.
    pub fn has_live_handle(&self) -> bool {
        self.handle.as_ref().is_some_and(ServiceHandle::is_alive)
    }

    pub fn owner_pid(&self) -> Option<u32> {
        self.owner_pid
    }

    pub fn passthrough_clients(&self) -> &BTreeSet<u32> {
        &self.passthrough_clients
    }

    /// Whether the loaded service at this entry satisfies a request for
    /// `requested`.
    pub fn supports_version(&self, requested: Version) -> bool {
        self.fq_name.version.supports(requested)
    }

    /// Replace the live handle and announce the arrival to every instance
    /// listener (`preexisting=false`). Package-level fan-out is driven by
    /// the owning interface table.
    ///
    /// Returns the previous handle so the caller can unlink its death
    /// watch.
    pub fn set_handle(&mut self, handle: ServiceHandle) -> Option<ServiceHandle> {
        let previous = self.handle.replace(handle);
        self.owner_pid = self.handle.as_ref().and_then(ServiceHandle::owner_pid);

        debug!("Set handle for {}", self.string());
        fan_out(&mut self.listeners, &self.fq_name, &self.instance_name);

        previous
    }

    /// Clear the handle on death or removal. Silent: only arrivals are
    /// announced, never removals.
    pub fn clear_handle(&mut self) -> Option<ServiceHandle> {
        self.owner_pid = None;
        self.handle.take()
    }

    /// Attach a listener. If a handle is already set, one
    /// `preexisting=true` notification is delivered synchronously before
    /// the listener is stored, so a late subscriber observes current state
    /// without waiting for the next publish. A listener that fails that
    /// delivery is already gone and is not stored.
    pub fn add_listener(&mut self, listener: Arc<dyn RegistrationListener>) {
        if self.handle.is_some()
            && listener
                .on_registration(&self.fq_name, &self.instance_name, true)
                .is_err()
        {
            debug!(
                "Listener for {} unreachable during preexisting replay",
                self.string()
            );
            return;
        }
        self.listeners.push(listener);
    }

    /// Record a passthrough client pid. Idempotent: the client set is a
    /// set, not a list.
    pub fn register_passthrough_client(&mut self, pid: u32) {
        self.passthrough_clients.insert(pid);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// An entry with no handle, no listeners and no passthrough clients
    /// is dead weight and may be pruned.
    pub fn is_dead_weight(&self) -> bool {
        self.handle.is_none() && self.listeners.is_empty() && self.passthrough_clients.is_empty()
    }

    /// Human-readable identifier, e.g.
    /// `halreg.manager@1.0::IServiceManager/default`.
    pub fn string(&self) -> String {
        self.fq_name.instance_string(&self.instance_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::HandleId;
    use crate::test_util::RecordingListener;

    fn entry() -> ServiceEntry {
        ServiceEntry::new(FqName::parse("pkg.foo@1.2::IFoo").unwrap(), "default")
    }

    fn handle(id: u64) -> ServiceHandle {
        ServiceHandle::new(HandleId(id), Some(1000), 0)
    }

    #[test]
    fn set_handle_notifies_attached_listeners() {
        let mut e = entry();
        let listener = RecordingListener::arc();
        e.add_listener(listener.clone());
        assert!(listener.events().is_empty());

        e.set_handle(handle(1));
        assert_eq!(
            listener.events(),
            vec![("pkg.foo@1.2::IFoo".to_string(), "default".to_string(), false)]
        );
    }

    #[test]
    fn add_listener_replays_preexisting_handle() {
        let mut e = entry();
        e.set_handle(handle(1));

        let listener = RecordingListener::arc();
        e.add_listener(listener.clone());
        assert_eq!(
            listener.events(),
            vec![("pkg.foo@1.2::IFoo".to_string(), "default".to_string(), true)]
        );
    }

    #[test]
    fn failing_listener_is_dropped_from_fan_out() {
        let mut e = entry();
        let broken = RecordingListener::arc();
        let healthy = RecordingListener::arc();
        e.add_listener(broken.clone());
        e.add_listener(healthy.clone());

        broken.break_delivery();
        e.set_handle(handle(1));
        assert_eq!(e.listener_count(), 1);

        // The surviving listener still hears the next republish; the broken
        // one is never retried.
        e.set_handle(handle(2));
        assert_eq!(healthy.events().len(), 2);
        assert_eq!(broken.events().len(), 0);
    }

    #[test]
    fn clear_handle_is_silent_and_preserves_listeners() {
        let mut e = entry();
        let listener = RecordingListener::arc();
        e.add_listener(listener.clone());
        e.set_handle(handle(1));
        assert_eq!(listener.events().len(), 1);

        e.clear_handle();
        assert!(e.handle().is_none());
        assert_eq!(e.owner_pid(), None);
        assert_eq!(listener.events().len(), 1);
        assert_eq!(e.listener_count(), 1);
        assert!(!e.is_dead_weight());
    }

    #[test]
    fn passthrough_registration_is_idempotent() {
        let mut e = entry();
        e.register_passthrough_client(42);
        e.register_passthrough_client(42);
        e.register_passthrough_client(7);
        assert_eq!(
            e.passthrough_clients().iter().copied().collect::<Vec<_>>(),
            vec![7, 42]
        );
    }

    #[test]
    fn dead_weight_tracks_all_three_sets() {
        let mut e = entry();
        assert!(e.is_dead_weight());
        e.register_passthrough_client(1);
        assert!(!e.is_dead_weight());
    }
}
