//! Growable per-entity slot storage.
//!
//! Every entity owns a two-dimensional slot table: the first dimension is
//! the owning system, the second the component slot within that system. A
//! slot holds at most one component unit. The table only ever grows — slot
//! addresses handed out by the registry stay valid for the life of the
//! entity.

use thiserror::Error;

use crate::component::Component;

/// Errors raised by the slot table itself.
///
/// The accessor layer recovers from [`StoreError::OutOfRange`] by growing
/// the table and retrying; [`StoreError::Occupied`] is a real conflict and
/// surfaces to the caller.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The table has not been grown far enough for this address.
    #[error("slot ({system}, {slot}) is out of range")]
    OutOfRange {
        /// System row of the offending address.
        system: usize,
        /// Component slot of the offending address.
        slot: usize,
    },

    /// The slot already holds a component.
    #[error("slot ({system}, {slot}) already holds a component")]
    Occupied {
        /// System row of the offending address.
        system: usize,
        /// Component slot of the offending address.
        slot: usize,
    },
}

/// The 2-D slot table of a single entity.
///
/// All read accessors treat out-of-range addresses as "absent" rather than
/// an error; only [`EntityStore::set`] insists that the table has been
/// grown first.
#[derive(Default)]
pub struct EntityStore {
    /// One row per system; a row shorter than a slot address means the
    /// address is unoccupied.
    rows: Vec<Vec<Option<Component>>>,
}

impl EntityStore {
    /// Create an empty store with no system rows.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-sized for `systems` system rows (each row still
    /// has zero slots until grown).
    #[must_use]
    pub fn with_systems(systems: usize) -> Self {
        Self {
            rows: vec![Vec::new(); systems],
        }
    }

    /// Returns `true` if the slot is occupied. Out-of-range addresses are
    /// simply unoccupied.
    #[must_use]
    pub fn has(&self, system: usize, slot: usize) -> bool {
        self.get(system, slot).is_some()
    }

    /// Returns the occupant of a slot, if any.
    #[must_use]
    pub fn get(&self, system: usize, slot: usize) -> Option<&Component> {
        self.rows.get(system)?.get(slot)?.as_ref()
    }

    /// Place a component into a slot.
    ///
    /// # Errors
    ///
    /// [`StoreError::OutOfRange`] if the table has not been grown to cover
    /// the address, [`StoreError::Occupied`] if the slot already holds a
    /// component.
    pub fn set(&mut self, component: Component, system: usize, slot: usize) -> Result<(), StoreError> {
        let cell = self
            .rows
            .get_mut(system)
            .and_then(|row| row.get_mut(slot))
            .ok_or(StoreError::OutOfRange { system, slot })?;
        if cell.is_some() {
            return Err(StoreError::Occupied { system, slot });
        }
        *cell = Some(component);
        Ok(())
    }

    /// Empty a slot, returning the previous occupant, if any.
    pub fn remove(&mut self, system: usize, slot: usize) -> Option<Component> {
        self.rows.get_mut(system)?.get_mut(slot)?.take()
    }

    /// Extend the table to at least `min_systems` rows and at least
    /// `min_slots` slots in row `system`. Existing occupants are kept; the
    /// table never shrinks, and a call that asks for less than the current
    /// capacity is a no-op.
    pub fn grow(&mut self, system: usize, min_systems: usize, min_slots: usize) {
        if self.rows.len() < min_systems {
            self.rows.resize_with(min_systems, Vec::new);
        }
        if let Some(row) = self.rows.get_mut(system)
            && row.len() < min_slots
        {
            row.resize_with(min_slots, || None);
        }
    }

    /// Number of system rows currently allocated.
    #[must_use]
    pub fn system_count(&self) -> usize {
        self.rows.len()
    }

    /// Number of slots currently allocated in a system row.
    #[must_use]
    pub fn slot_count(&self, system: usize) -> usize {
        self.rows.get(system).map_or(0, Vec::len)
    }

    /// Iterate over the occupied slots as `(system, slot, component)`.
    pub fn occupied(&self) -> impl Iterator<Item = (usize, usize, &Component)> {
        self.rows.iter().enumerate().flat_map(|(system, row)| {
            row.iter()
                .enumerate()
                .filter_map(move |(slot, cell)| cell.as_ref().map(|c| (system, slot, c)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{ComponentData, TypeTag};

    struct Marker;

    impl ComponentData for Marker {
        fn type_name() -> &'static str {
            "Marker"
        }

        fn duplicate_data(&self) -> Box<dyn ComponentData> {
            Box::new(Marker)
        }
    }

    fn unit() -> Component {
        Component::new(TypeTag(0), Marker)
    }

    #[test]
    fn test_out_of_range_reads_are_absent() {
        let store = EntityStore::new();
        for system in 0..10 {
            for slot in 0..10 {
                assert!(!store.has(system, slot));
                assert!(store.get(system, slot).is_none());
            }
        }
    }

    #[test]
    fn test_set_requires_growth() {
        let mut store = EntityStore::new();
        assert!(matches!(
            store.set(unit(), 0, 0),
            Err(StoreError::OutOfRange { .. })
        ));

        store.grow(0, 1, 1);
        store.set(unit(), 0, 0).unwrap();
        assert!(store.has(0, 0));
    }

    #[test]
    fn test_set_rejects_occupied_slot() {
        let mut store = EntityStore::new();
        store.grow(0, 1, 1);
        store.set(unit(), 0, 0).unwrap();
        assert!(matches!(
            store.set(unit(), 0, 0),
            Err(StoreError::Occupied { .. })
        ));
    }

    #[test]
    fn test_remove_empties_slot() {
        let mut store = EntityStore::new();
        store.grow(1, 2, 2);
        store.set(unit(), 1, 0).unwrap();
        assert!(store.remove(1, 0).is_some());
        assert!(store.remove(1, 0).is_none());
        assert!(!store.has(1, 0));
    }

    #[test]
    fn test_grow_keeps_existing_occupants() {
        let mut store = EntityStore::new();
        store.grow(0, 1, 1);
        let c = unit();
        store.set(c.clone(), 0, 0).unwrap();

        store.grow(0, 4, 8);
        store.grow(3, 4, 2);
        assert!(store.get(0, 0).is_some_and(|found| *found == c));
        assert_eq!(store.system_count(), 4);
        assert_eq!(store.slot_count(0), 8);
    }

    #[test]
    fn test_grow_never_shrinks() {
        let mut store = EntityStore::new();
        store.grow(0, 3, 5);
        store.grow(0, 1, 1);
        assert_eq!(store.system_count(), 3);
        assert_eq!(store.slot_count(0), 5);
    }

    #[test]
    fn test_occupied_walk() {
        let mut store = EntityStore::new();
        store.grow(0, 2, 2);
        store.grow(1, 2, 1);
        store.set(unit(), 0, 1).unwrap();
        store.set(unit(), 1, 0).unwrap();

        let addresses: Vec<(usize, usize)> =
            store.occupied().map(|(system, slot, _)| (system, slot)).collect();
        assert_eq!(addresses, vec![(0, 1), (1, 0)]);
    }
}
