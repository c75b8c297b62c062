//! Entity identity, slot access, and allocation.
//!
//! An [`Entity`] is a shared handle over an id plus the entity's slot
//! table. The handle is cheap to clone and safe to share across threads;
//! all slot access goes through the entity's own mutex. Attachments signal
//! a condvar so blocking readers can wait for a slot to fill.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::component::Component;
use crate::store::{EntityStore, StoreError};

pub(crate) struct EntityInner {
    id: u64,
    store: Mutex<EntityStore>,
    attached: Condvar,
}

/// A shared handle to one entity.
///
/// Equality and hashing are by entity identity (two handles are equal when
/// they refer to the same entity).
#[derive(Clone)]
pub struct Entity {
    inner: Arc<EntityInner>,
}

impl Entity {
    fn new(id: u64, systems: usize) -> Self {
        trace!(entity = id, systems, "entity created");
        Self {
            inner: Arc::new(EntityInner {
                id,
                store: Mutex::new(EntityStore::with_systems(systems)),
                attached: Condvar::new(),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<EntityInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<EntityInner> {
        Arc::downgrade(&self.inner)
    }

    /// The entity's id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Returns `true` if the slot is occupied.
    #[must_use]
    pub fn has(&self, system: usize, slot: usize) -> bool {
        self.inner.store.lock().has(system, slot)
    }

    /// Returns the occupant of a slot, if any.
    #[must_use]
    pub fn get(&self, system: usize, slot: usize) -> Option<Component> {
        self.inner.store.lock().get(system, slot).cloned()
    }

    /// Place a component into a slot, binding its owner back-reference and
    /// waking any thread blocked on this entity or on the component.
    ///
    /// # Errors
    ///
    /// Passes through [`StoreError`]; the caller is responsible for
    /// growing the table first.
    pub fn set(&self, component: &Component, system: usize, slot: usize) -> Result<(), StoreError> {
        {
            let mut store = self.inner.store.lock();
            store.set(component.clone(), system, slot)?;
            component.bind_owner(&self.downgrade());
            self.inner.attached.notify_all();
        }
        trace!(entity = self.inner.id, system, slot, "component attached");
        Ok(())
    }

    /// Empty a slot, clearing the occupant's owner back-reference.
    pub fn remove(&self, system: usize, slot: usize) -> Option<Component> {
        let removed = self.inner.store.lock().remove(system, slot);
        match &removed {
            Some(component) => {
                component.clear_owner();
                trace!(entity = self.inner.id, system, slot, "component detached");
            }
            None => trace!(entity = self.inner.id, system, slot, "remove on empty slot"),
        }
        removed
    }

    /// Extend the slot table (see [`EntityStore::grow`]).
    pub fn grow(&self, system: usize, min_systems: usize, min_slots: usize) {
        self.inner.store.lock().grow(system, min_systems, min_slots);
    }

    /// Block until the slot holds an occupant accepted by `accept`, or
    /// until `timeout` elapses (`None` waits forever).
    pub fn wait_for(
        &self,
        system: usize,
        slot: usize,
        timeout: Option<Duration>,
        accept: impl Fn(&Component) -> bool,
    ) -> Option<Component> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut store = self.inner.store.lock();
        loop {
            if let Some(component) = store.get(system, slot)
                && accept(component)
            {
                return Some(component.clone());
            }
            match deadline {
                None => self.inner.attached.wait(&mut store),
                Some(deadline) => {
                    if self.inner.attached.wait_until(&mut store, deadline).timed_out() {
                        return None;
                    }
                }
            }
        }
    }

    /// Snapshot of the occupied slots as `(system, slot, component)`,
    /// taken under the entity's lock. This is the read-only walk consumed
    /// by the document builder.
    #[must_use]
    pub fn occupied(&self) -> Vec<(usize, usize, Component)> {
        self.inner
            .store
            .lock()
            .occupied()
            .map(|(system, slot, component)| (system, slot, component.clone()))
            .collect()
    }
}

impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Entity {}

impl std::hash::Hash for Entity {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        state.write_usize(Arc::as_ptr(&self.inner) as usize);
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Entity({})", self.inner.id)
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Entity({})", self.inner.id)
    }
}

/// Issues monotonically increasing entity ids.
///
/// The registry owns one allocator and is the single source of entity
/// identity; ids are never recycled.
#[derive(Default)]
pub struct EntityAllocator {
    next: std::sync::atomic::AtomicU64,
}

impl EntityAllocator {
    /// Create an allocator starting at id 0.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh entity pre-sized for `systems` system rows.
    pub fn allocate(&self, systems: usize) -> Entity {
        let id = self.next.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Entity::new(id, systems)
    }

    /// Number of entities allocated so far.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.next.load(std::sync::atomic::Ordering::Relaxed)
    }
}
