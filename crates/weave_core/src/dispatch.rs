//! Parallel notification dispatch.
//!
//! Committed changes fan out to subscribers in waves: every notification
//! in a queue is submitted to the shared worker pool as an independent
//! unit, and the dispatcher joins the whole wave before the next queue
//! starts. Units run their matched subscribers sequentially, each inside
//! its own nested transaction, so subscribers can stage further work.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::error;

use weave_component::Entity;

use crate::registry::Registry;
use crate::subscription::Subscriber;
use crate::transaction::{self, Notification};

/// Submit one notification queue to the pool and block until every unit
/// has finished.
pub(crate) fn dispatch_wave(registry: &Arc<Registry>, notes: Vec<Notification>) {
    if notes.is_empty() {
        return;
    }
    registry.pool().scope(|scope| {
        for note in notes {
            let registry = Arc::clone(registry);
            scope.spawn(move |_| run_unit(&registry, note));
        }
    });
}

fn run_unit(registry: &Arc<Registry>, note: Notification) {
    let subscribers = registry.subscribers_for(note.component.tag(), note.kind);
    if subscribers.is_empty() {
        return;
    }
    // Created/Updated notifications resolve the entity live, after all
    // physical mutation; Destroyed notifications carry the entity that
    // was captured when the detachment was staged.
    let entity = note.entity.clone().or_else(|| note.component.entity());
    for subscriber in subscribers {
        run_subscriber(registry, &subscriber, &note, entity.as_ref());
    }
}

fn run_subscriber(
    registry: &Arc<Registry>,
    subscriber: &Subscriber,
    note: &Notification,
    entity: Option<&Entity>,
) {
    let tx = registry.transaction();
    if accepts(registry, subscriber, entity) {
        transaction::acquire_read(registry, &note.component);
        let outcome =
            panic::catch_unwind(AssertUnwindSafe(|| (subscriber.handler)(&note.component, entity)));
        if let Err(payload) = outcome {
            error!(
                subscriber = %subscriber.label,
                component = registry.type_name_of(note.component.tag()),
                reason = panic_message(payload.as_ref()),
                "subscriber failed"
            );
        }
    }
    // Work the subscriber staged commits here, failures and all; a broken
    // subscriber must not take sibling units down with it.
    if let Err(error) = tx.close() {
        error!(subscriber = %subscriber.label, %error, "nested transaction failed after subscriber");
    }
}

/// All positive filters must find the named type on the entity, all
/// negative filters must find it absent. A notification with no entity
/// rejects every positive filter and passes every negative one.
fn accepts(registry: &Arc<Registry>, subscriber: &Subscriber, entity: Option<&Entity>) -> bool {
    for tag in &subscriber.requires {
        match entity {
            None => return false,
            Some(entity) => {
                if !registry.core_for(*tag).contains(entity) {
                    return false;
                }
            }
        }
    }
    for tag in &subscriber.excludes {
        if let Some(entity) = entity
            && registry.core_for(*tag).contains(entity)
        {
            return false;
        }
    }
    true
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "opaque panic payload"
    }
}
