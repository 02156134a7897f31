//! Registration-notification callbacks.

use crate::identity::FqName;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

/// Returned by a listener whose peer is unreachable. The registry treats
/// this as "listener gone" and drops it from all future fan-out; delivery
/// is never retried.
#[derive(Debug, Error)]
#[error("listener unreachable")]
pub struct ListenerGone;

/// Callback interface for service-arrival notifications.
///
/// `preexisting` is true when the notification replays state that was
/// already current at subscription time, false for a genuinely new
/// arrival. Removals are never announced.
pub trait RegistrationListener: Send + Sync {
    fn on_registration(
        &self,
        fq_name: &FqName,
        instance: &str,
        preexisting: bool,
    ) -> std::result::Result<(), ListenerGone>;
}

/// Fan a `preexisting=false` arrival out to `listeners`, dropping any
/// listener that fails delivery.
///
/// Iterates over the current list by index and removes failures in a
/// separate pass, so the list is never mutated mid-iteration.
pub(crate) fn fan_out(
    listeners: &mut Vec<Arc<dyn RegistrationListener>>,
    fq_name: &FqName,
    instance: &str,
) {
    let mut failed = Vec::new();
    for (idx, listener) in listeners.iter().enumerate() {
        if listener.on_registration(fq_name, instance, false).is_err() {
            failed.push(idx);
        }
    }
    for idx in failed.into_iter().rev() {
        listeners.remove(idx);
        warn!(
            "Dropping unreachable listener for {}",
            fq_name.instance_string(instance)
        );
    }
}
