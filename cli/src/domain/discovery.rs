//! Endpoint candidate selection.

use keel_common::{Endpoint, InstanceRecord, Readiness, StateSnapshot};

/// Primary strategy: the address recorded by the last apply.
#[must_use]
pub fn from_snapshot(snapshot: &StateSnapshot) -> Option<Endpoint> {
    let instance = snapshot.resources.instance.as_ref()?;
    if instance.lifecycle.is_terminated() {
        return None;
    }
    let address = instance.address.clone()?;
    Some(Endpoint {
        address,
        instance_id: Some(instance.id.clone()),
        readiness: Readiness::Unknown,
    })
}

/// Fallback strategy: exactly one live, addressable instance carrying the
/// target tag.
///
/// # Errors
///
/// Returns a reason when zero or several candidates remain.
pub fn select_candidate(instances: &[InstanceRecord]) -> Result<Endpoint, String> {
    let live: Vec<&InstanceRecord> = instances
        .iter()
        .filter(|i| !i.lifecycle.is_terminated())
        .collect();
    match live.as_slice() {
        [] => Err("no live instance carries the target tag".to_string()),
        [only] => {
            let address = only
                .address
                .clone()
                .ok_or_else(|| format!("instance {} has no public address", only.id))?;
            Ok(Endpoint {
                address,
                instance_id: Some(only.id.clone()),
                readiness: Readiness::Unknown,
            })
        }
        many => Err(format!(
            "{} live instances carry the target tag ({})",
            many.len(),
            many.iter().map(|i| i.id.as_str()).collect::<Vec<_>>().join(", ")
        )),
    }
}
