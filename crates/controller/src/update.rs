//! Optimistic-concurrency writes of cluster objects.

use kube::core::DynamicObject;
use kubesync_core::ObjectKey;
use kubesync_kubehub::{is_conflict, ResourceClient};
use kubesync_state::{ChangedSections, Section};
use tracing::debug;

use crate::ReconcileError;

/// Conflicting writes are retried this many times before the pass fails.
pub const RETRY_LIMIT: usize = 1;

/// Applies an idempotent change to `obj` and writes it back.
///
/// `change` reports the top-level sections it modified. Nothing is written when it reports
/// none. A status change goes through the status subresource, anything else through a
/// regular update. On a version conflict the object is fetched again and `change` runs from
/// scratch, at most `max_retries` more times; other errors are returned immediately.
/// Afterwards `obj` holds the object as last returned by the server.
pub async fn update_with_retry<F>(
    client: &dyn ResourceClient,
    obj: &mut DynamicObject,
    mut change: F,
    max_retries: usize,
) -> Result<(), ReconcileError>
where
    F: FnMut(&mut DynamicObject) -> Result<ChangedSections, ReconcileError>,
{
    let key = ObjectKey::from_object(obj);
    // Last known server state; `obj` is only replaced by what the server returned.
    let mut base = obj.clone();
    let mut tries = 0;
    loop {
        if tries > 0 {
            if let Some(key) = &key {
                match client.get(key).await {
                    Ok(Some(fresh)) => base = fresh,
                    // Gone since the conflict; nothing left to write.
                    Ok(None) => return Ok(()),
                    Err(e) => return Err(ReconcileError::Update(e)),
                }
            }
        }
        let mut work = base.clone();
        let mut changed = change(&mut work)?;
        if changed.is_empty() {
            *obj = base;
            return Ok(());
        }
        if changed.remove(&Section::Status) {
            match client.update_status(&work).await {
                Ok(written) => {
                    base = written.clone();
                    work = written;
                    if !changed.is_empty() {
                        // The status response carries the stored metadata; redo the rest on it.
                        changed = change(&mut work)?;
                        changed.remove(&Section::Status);
                    }
                }
                Err(e) if is_conflict(&e) && tries < max_retries => {
                    debug!(resource = ?key, tries, "status update conflict, retrying");
                    tries += 1;
                    continue;
                }
                Err(e) => {
                    *obj = base;
                    return Err(ReconcileError::Update(e));
                }
            }
        }
        if !changed.is_empty() {
            match client.update(&work).await {
                Ok(written) => base = written,
                Err(e) if is_conflict(&e) && tries < max_retries => {
                    debug!(resource = ?key, tries, "update conflict, retrying");
                    tries += 1;
                    continue;
                }
                Err(e) => {
                    *obj = base;
                    return Err(ReconcileError::Update(e));
                }
            }
        }
        *obj = base;
        return Ok(());
    }
}
