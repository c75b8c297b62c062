//! The component payload contract and the shared, lockable component unit.
//!
//! A component unit pairs a typed payload with the two things the store
//! needs from every component regardless of its type: a reader/writer lock
//! guarding the payload fields, and a back-reference to the owning entity.
//! Units are shared handles — cloning a [`Component`] clones the handle,
//! not the payload; [`Component::duplicate`] copies the payload into a
//! fresh unit with its own lock and no owner.

use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use serde_json::Value;

use crate::entity::{Entity, EntityInner};

/// Stable identity of a registered component type.
///
/// Tags form a closed set: they are only issued by the registry, which
/// also records each tag's owning system, slot address, and supertype
/// chain. A unit's tag is fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeTag(pub u32);

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The payload contract all component data must satisfy.
///
/// Payloads must be `Send + Sync` so units can cross the dispatch pool,
/// and `Any` so typed accessors can recover the concrete type.
pub trait ComponentData: Any + Send + Sync {
    /// A human-readable name for this component type.
    fn type_name() -> &'static str
    where
        Self: Sized;

    /// Copy the payload fields into a fresh boxed payload. Backs
    /// [`Component::duplicate`]; the owner reference and lock are never
    /// part of the copy.
    fn duplicate_data(&self) -> Box<dyn ComponentData>;

    /// A flat name/value document describing the payload fields, consumed
    /// by the entity document walk. Defaults to an empty object.
    fn document(&self) -> Value {
        Value::Object(serde_json::Map::new())
    }
}

impl dyn ComponentData {
    /// Returns a reference to the concrete payload type, if it matches.
    #[must_use]
    pub fn downcast_ref<T: ComponentData>(&self) -> Option<&T> {
        (self as &dyn Any).downcast_ref()
    }

    /// Returns a mutable reference to the concrete payload type, if it
    /// matches.
    #[must_use]
    pub fn downcast_mut<T: ComponentData>(&mut self) -> Option<&mut T> {
        (self as &mut dyn Any).downcast_mut()
    }
}

/// The lock type guarding a unit's payload. Held as an `Arc` so the
/// transaction layer can park owned read guards until commit.
pub type PayloadLock = Arc<RwLock<Box<dyn ComponentData>>>;

struct Unit {
    tag: TypeTag,
    /// Weak so the entity structurally owns the component: dropping the
    /// entity drops its components, never the other way around.
    owner: Mutex<Weak<EntityInner>>,
    attached: Condvar,
    payload: PayloadLock,
}

/// A shared handle to one component unit.
///
/// Equality and hashing are by unit identity, not payload value: two
/// handles are equal exactly when they refer to the same unit.
#[derive(Clone)]
pub struct Component {
    unit: Arc<Unit>,
}

impl Component {
    /// Create a detached unit with the given type tag and payload.
    ///
    /// The tag must be the one the registry issued for the payload's type;
    /// the typed accessor's `create` is the usual way to get this right.
    #[must_use]
    pub fn new<T: ComponentData>(tag: TypeTag, data: T) -> Self {
        Self {
            unit: Arc::new(Unit {
                tag,
                owner: Mutex::new(Weak::new()),
                attached: Condvar::new(),
                payload: Arc::new(RwLock::new(Box::new(data))),
            }),
        }
    }

    /// The type tag fixed at construction.
    #[must_use]
    pub fn tag(&self) -> TypeTag {
        self.unit.tag
    }

    /// The entity this unit is attached to, if any.
    #[must_use]
    pub fn entity(&self) -> Option<Entity> {
        self.unit.owner.lock().upgrade().map(Entity::from_inner)
    }

    /// Like [`Component::entity`], but suspends the calling thread until
    /// another thread attaches this unit somewhere.
    #[must_use]
    pub fn entity_blocking(&self) -> Option<Entity> {
        self.wait_entity(None)
    }

    /// Like [`Component::entity_blocking`] with an upper bound on the
    /// wait. Returns `None` if no attachment happened within `timeout`.
    #[must_use]
    pub fn entity_blocking_for(&self, timeout: Duration) -> Option<Entity> {
        self.wait_entity(Some(timeout))
    }

    fn wait_entity(&self, timeout: Option<Duration>) -> Option<Entity> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut owner = self.unit.owner.lock();
        loop {
            if let Some(inner) = owner.upgrade() {
                return Some(Entity::from_inner(inner));
            }
            match deadline {
                None => self.unit.attached.wait(&mut owner),
                Some(deadline) => {
                    if self.unit.attached.wait_until(&mut owner, deadline).timed_out() {
                        return None;
                    }
                }
            }
        }
    }

    /// The reader/writer lock guarding the payload. One lock per unit;
    /// duplicated units get a fresh one.
    #[must_use]
    pub fn lock(&self) -> &PayloadLock {
        &self.unit.payload
    }

    /// Run `f` against the payload under a briefly-held recursive read
    /// lock. Returns `None` if the payload is not a `T`.
    ///
    /// Safe to call while the current transaction holds this unit's read
    /// lock. Must not be called on the unit currently being mutated by an
    /// update closure — the closure already has `&mut T`.
    pub fn with<T: ComponentData, R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        let payload = self.unit.payload.read_recursive();
        payload.downcast_ref::<T>().map(f)
    }

    /// The payload's document hook (see [`ComponentData::document`]).
    #[must_use]
    pub fn document(&self) -> Value {
        self.unit.payload.read_recursive().document()
    }

    /// Copy the payload into a fresh unit: new lock, no owner, same tag.
    #[must_use]
    pub fn duplicate(&self) -> Component {
        let copy = self.unit.payload.read_recursive().duplicate_data();
        Self {
            unit: Arc::new(Unit {
                tag: self.unit.tag,
                owner: Mutex::new(Weak::new()),
                attached: Condvar::new(),
                payload: Arc::new(RwLock::new(copy)),
            }),
        }
    }

    /// A stable address usable as a grouping/dedup key for this unit.
    #[must_use]
    pub fn addr(&self) -> usize {
        Arc::as_ptr(&self.unit) as usize
    }

    pub(crate) fn bind_owner(&self, owner: &Weak<EntityInner>) {
        *self.unit.owner.lock() = Weak::clone(owner);
        self.unit.attached.notify_all();
    }

    pub(crate) fn clear_owner(&self) {
        *self.unit.owner.lock() = Weak::new();
    }
}

impl PartialEq for Component {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.unit, &other.unit)
    }
}

impl Eq for Component {}

impl Hash for Component {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_usize(self.addr());
    }
}

impl fmt::Debug for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.entity() {
            Some(entity) => write!(f, "Component({} @ Entity({}))", self.unit.tag, entity.id()),
            None => write!(f, "Component({}, detached)", self.unit.tag),
        }
    }
}
