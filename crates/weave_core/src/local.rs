//! Per-owner local data attached to entities, outside the event system.
//!
//! An entity normally carries one component per type. Local components
//! relax that for bookkeeping data: a single unit holds one cell per
//! owner, and each owner addresses its own cell through a
//! [`LocalMapper`] carrying a stable index. Access bypasses transactions
//! and triggers no notifications — this is scratch state, not observable
//! world state.

use std::marker::PhantomData;

use weave_component::{Component, ComponentData, Entity};

use crate::error::CoreError;
use crate::mapper::{self, MapperCore};

/// A component payload that stores one data cell per owner.
///
/// Implementors hold a `Vec<Option<Self::Value>>` and expose it through
/// [`LocalComponent::cells_mut`]; cells are created lazily with
/// [`LocalComponent::default_value`].
pub trait LocalComponent: ComponentData + Default {
    /// The per-owner data stored in each cell.
    type Value: Send + Sync + 'static;

    /// Initial value for a cell touched for the first time.
    fn default_value() -> Self::Value;

    /// The cell vector backing this local component.
    fn cells_mut(&mut self) -> &mut Vec<Option<Self::Value>>;
}

/// Accessor for one owner's cell of a local component type. Obtained from
/// [`Registry::local_mapper`](crate::Registry::local_mapper); the index is
/// stable per (owner, type) pair.
pub struct LocalMapper<L: LocalComponent> {
    core: MapperCore,
    index: usize,
    _marker: PhantomData<fn() -> L>,
}

impl<L: LocalComponent> LocalMapper<L> {
    pub(crate) fn new(core: MapperCore, index: usize) -> Self {
        Self {
            core,
            index,
            _marker: PhantomData,
        }
    }

    /// The cell index this accessor addresses.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Run `f` against this owner's cell on `entity`, attaching the local
    /// component and initializing the cell on first access. Runs under the
    /// unit's write lock, outside any transaction, and triggers no
    /// notifications.
    ///
    /// # Errors
    ///
    /// Propagates attachment errors; a correctly-registered local
    /// component type does not produce any.
    pub fn with<R>(&self, entity: &Entity, f: impl FnOnce(&mut L::Value) -> R) -> Result<R, CoreError> {
        let unit = self.unit_for(entity)?;
        let mut payload = unit.lock().write();
        let Some(local) = payload.downcast_mut::<L>() else {
            return Err(CoreError::UnknownComponentType(L::type_name()));
        };
        let cells = local.cells_mut();
        if cells.len() <= self.index {
            cells.resize_with(self.index + 1, || None);
        }
        let value = cells[self.index].get_or_insert_with(L::default_value);
        Ok(f(value))
    }

    /// The entity's local unit, attached on demand.
    fn unit_for(&self, entity: &Entity) -> Result<Component, CoreError> {
        if let Some(unit) = self.core.read_uncommitted(entity) {
            return Ok(unit);
        }
        let unit = Component::new(self.core.info().tag, L::default());
        match mapper::attach_now(self.core.registry(), self.core.info(), entity, &unit) {
            Ok(()) => Ok(unit),
            // Another thread attached first; use its unit.
            Err(occupied @ CoreError::SlotOccupied { .. }) => {
                self.core.read_uncommitted(entity).ok_or(occupied)
            }
            Err(error) => Err(error),
        }
    }
}
