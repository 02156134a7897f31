//! Per-interface indexing of service entries.
//!
//! One [`InterfaceTable`] exists per version-less `package::Interface`
//! key. It maps instance names to their entries (one entry per exact
//! published version, insertion order preserved) and carries the
//! package-level listeners that fire for every instance under the
//! interface, current and future.

use crate::entry::ServiceEntry;
use crate::handle::{HandleId, ServiceHandle};
use crate::identity::{FqName, Version};
use crate::listener::{fan_out, RegistrationListener};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Instance name -> entries, one per exact version.
type InstanceIndex = HashMap<String, Vec<ServiceEntry>>;

/// Index of every registered instance of one interface identity, plus the
/// interface-level ("package") listeners.
#[derive(Default)]
pub struct InterfaceTable {
    instances: InstanceIndex,
    package_listeners: Vec<Arc<dyn RegistrationListener>>,
}

impl InterfaceTable {
    /// Find the entry at exactly `version`, if any. The entry's handle may
    /// still be absent when only listeners or passthrough clients exist.
    pub fn lookup_exact(&self, instance: &str, version: Version) -> Option<&ServiceEntry> {
        self.instances
            .get(instance)?
            .iter()
            .find(|e| e.version() == version)
    }

    fn lookup_exact_mut(&mut self, instance: &str, version: Version) -> Option<&mut ServiceEntry> {
        self.instances
            .get_mut(instance)?
            .iter_mut()
            .find(|e| e.version() == version)
    }

    /// Find the first entry (insertion order) whose published version
    /// satisfies a request for `version`.
    pub fn lookup_supporting(&self, instance: &str, version: Version) -> Option<&ServiceEntry> {
        self.instances
            .get(instance)?
            .iter()
            .find(|e| e.supports_version(version))
    }

    /// Find-or-create the entry at (`instance`, exact version of
    /// `fq_name`). Never overwrites an entry at a different version;
    /// coexisting versions stay distinct entries in the same bucket.
    pub fn entry_or_insert(&mut self, fq_name: &FqName, instance: &str) -> &mut ServiceEntry {
        let bucket = self.instances.entry(instance.to_string()).or_default();
        if let Some(idx) = bucket.iter().position(|e| e.version() == fq_name.version) {
            return &mut bucket[idx];
        }
        bucket.push(ServiceEntry::new(fq_name.clone(), instance));
        bucket.last_mut().unwrap()
    }

    /// Bind `handle` at (`instance`, exact version), creating the entry if
    /// needed, then fan the arrival out to instance and package listeners.
    ///
    /// Returns the replaced handle, if any, so the caller can unlink its
    /// death watch.
    pub fn publish(
        &mut self,
        fq_name: &FqName,
        instance: &str,
        handle: ServiceHandle,
    ) -> Option<ServiceHandle> {
        let previous = self.entry_or_insert(fq_name, instance).set_handle(handle);
        fan_out(&mut self.package_listeners, fq_name, instance);
        previous
    }

    /// Attach a listener for every instance under this interface.
    ///
    /// Replays one `preexisting=true` notification per instance that
    /// currently has a live handle before storing the listener. A listener
    /// that fails a replay is already gone and is not stored.
    pub fn add_package_listener(&mut self, listener: Arc<dyn RegistrationListener>) {
        for entry in self.entries() {
            if entry.has_live_handle()
                && listener
                    .on_registration(entry.fq_name(), entry.instance_name(), true)
                    .is_err()
            {
                debug!("Package listener unreachable during preexisting replay");
                return;
            }
        }
        self.package_listeners.push(listener);
    }

    /// All entries under this interface, every instance and version.
    pub fn entries(&self) -> impl Iterator<Item = &ServiceEntry> {
        self.instances.values().flatten()
    }

    /// Clear (silently) every handle matching `handle_id`.
    ///
    /// Returns one cleared handle when anything matched, for death-watch
    /// unlinking.
    pub fn clear_matching_handles(&mut self, handle_id: HandleId) -> Option<ServiceHandle> {
        let mut cleared = None;
        for entry in self.instances.values_mut().flatten() {
            if entry.handle().is_some_and(|h| h.id() == handle_id) {
                let handle = entry.clear_handle();
                debug!("Cleared dead handle {} from {}", handle_id, entry.string());
                cleared = cleared.or(handle);
            }
        }
        cleared
    }

    /// Drop dead-weight entries and empty instance buckets.
    pub fn prune(&mut self) {
        self.instances.retain(|_, bucket| {
            bucket.retain(|e| !e.is_dead_weight());
            !bucket.is_empty()
        });
    }

    /// Whether the table holds nothing worth keeping: no entries and no
    /// package listeners waiting for future arrivals.
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty() && self.package_listeners.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::RecordingListener;

    fn fq(s: &str) -> FqName {
        FqName::parse(s).unwrap()
    }

    fn handle(id: u64) -> ServiceHandle {
        ServiceHandle::new(HandleId(id), Some(1000), 0)
    }

    #[test]
    fn versions_coexist_as_distinct_entries() {
        let mut table = InterfaceTable::default();
        table.publish(&fq("pkg.foo@1.1::IFoo"), "default", handle(1));
        table.publish(&fq("pkg.foo@2.0::IFoo"), "default", handle(2));

        assert_eq!(table.entries().count(), 2);
        let v11 = table.lookup_exact("default", Version::new(1, 1)).unwrap();
        assert_eq!(v11.handle().unwrap().id(), HandleId(1));
        let v20 = table.lookup_exact("default", Version::new(2, 0)).unwrap();
        assert_eq!(v20.handle().unwrap().id(), HandleId(2));
    }

    #[test]
    fn republish_at_same_version_replaces_in_place() {
        let mut table = InterfaceTable::default();
        assert!(table.publish(&fq("pkg.foo@1.1::IFoo"), "default", handle(1)).is_none());
        let previous = table.publish(&fq("pkg.foo@1.1::IFoo"), "default", handle(2));
        assert_eq!(previous.unwrap().id(), HandleId(1));
        assert_eq!(table.entries().count(), 1);
    }

    #[test]
    fn supporting_lookup_honors_minor_direction() {
        let mut table = InterfaceTable::default();
        table.publish(&fq("pkg.foo@1.2::IFoo"), "default", handle(1));

        assert!(table.lookup_supporting("default", Version::new(1, 0)).is_some());
        assert!(table.lookup_supporting("default", Version::new(1, 2)).is_some());
        assert!(table.lookup_supporting("default", Version::new(1, 3)).is_none());
        assert!(table.lookup_supporting("default", Version::new(2, 0)).is_none());
    }

    #[test]
    fn package_listener_hears_every_instance() {
        let mut table = InterfaceTable::default();
        let listener = RecordingListener::arc();
        table.add_package_listener(listener.clone());

        table.publish(&fq("pkg.foo@1.0::IFoo"), "a", handle(1));
        table.publish(&fq("pkg.foo@1.0::IFoo"), "b", handle(2));

        let mut events = listener.events();
        events.sort();
        assert_eq!(
            events,
            vec![
                ("pkg.foo@1.0::IFoo".to_string(), "a".to_string(), false),
                ("pkg.foo@1.0::IFoo".to_string(), "b".to_string(), false),
            ]
        );
    }

    #[test]
    fn package_listener_replays_current_live_instances() {
        let mut table = InterfaceTable::default();
        table.publish(&fq("pkg.foo@1.0::IFoo"), "a", handle(1));
        // Placeholder with no handle must not be replayed.
        table.entry_or_insert(&fq("pkg.foo@1.0::IFoo"), "pending");

        let listener = RecordingListener::arc();
        table.add_package_listener(listener.clone());
        assert_eq!(
            listener.events(),
            vec![("pkg.foo@1.0::IFoo".to_string(), "a".to_string(), true)]
        );
    }

    #[test]
    fn prune_keeps_entries_with_listeners() {
        let mut table = InterfaceTable::default();
        let listener = RecordingListener::arc();
        table.publish(&fq("pkg.foo@1.0::IFoo"), "a", handle(1));
        table
            .entry_or_insert(&fq("pkg.foo@1.0::IFoo"), "a")
            .add_listener(listener.clone());

        table.clear_matching_handles(HandleId(1));
        table.prune();
        assert!(table.lookup_exact("a", Version::new(1, 0)).is_some());

        let mut bare = InterfaceTable::default();
        bare.publish(&fq("pkg.foo@1.0::IFoo"), "a", handle(1));
        bare.clear_matching_handles(HandleId(1));
        bare.prune();
        assert!(bare.is_empty());
    }
}
