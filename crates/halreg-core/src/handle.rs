//! Reference-counted service handles.
//!
//! A [`ServiceHandle`] is the registry's opaque stand-in for a remote
//! service object. The registry's maps hold the counted form; the token
//! store holds the non-owning [`WeakServiceHandle`] and must promote it
//! before use. A handle is invalidated (marked dead) when the transport
//! reports that its owning process terminated; liveness can change at any
//! point relative to a caller's use of the handle, and tolerating that
//! race is the caller's job.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Transport-assigned identifier, unique per published service object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(pub u64);

impl std::fmt::Display for HandleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug)]
struct HandleInner {
    id: HandleId,
    owner_pid: Option<u32>,
    /// Opaque transport routing key (e.g. the connection the handle was
    /// published over). The registry never interprets it.
    transport_cookie: u64,
    alive: AtomicBool,
}

/// Strong, reference-counted handle to a remote service object.
///
/// Two handles refer to the same service object iff their ids are equal;
/// clones share liveness state.
#[derive(Debug, Clone)]
pub struct ServiceHandle {
    inner: Arc<HandleInner>,
}

impl ServiceHandle {
    pub fn new(id: HandleId, owner_pid: Option<u32>, transport_cookie: u64) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id,
                owner_pid,
                transport_cookie,
                alive: AtomicBool::new(true),
            }),
        }
    }

    pub fn id(&self) -> HandleId {
        self.inner.id
    }

    pub fn owner_pid(&self) -> Option<u32> {
        self.inner.owner_pid
    }

    pub fn transport_cookie(&self) -> u64 {
        self.inner.transport_cookie
    }

    /// Whether the owning process is still known to be alive.
    pub fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::Acquire)
    }

    /// Invalidate the handle. Once dead, a handle never comes back; a new
    /// publish produces a new handle.
    pub fn mark_dead(&self) {
        self.inner.alive.store(false, Ordering::Release);
    }

    /// Strong reference count, for diagnostics only.
    pub fn strong_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Downgrade to the non-owning variant used by the token store.
    pub fn downgrade(&self) -> WeakServiceHandle {
        WeakServiceHandle {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

impl PartialEq for ServiceHandle {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for ServiceHandle {}

/// Non-owning handle variant. Promotion fails once every strong handle is
/// gone or the handle has been marked dead.
#[derive(Debug, Clone)]
pub struct WeakServiceHandle {
    inner: Weak<HandleInner>,
}

impl WeakServiceHandle {
    /// Promote to a strong handle, checking liveness.
    pub fn upgrade(&self) -> Option<ServiceHandle> {
        let inner = self.inner.upgrade()?;
        if !inner.alive.load(Ordering::Acquire) {
            return None;
        }
        Some(ServiceHandle { inner })
    }
}
