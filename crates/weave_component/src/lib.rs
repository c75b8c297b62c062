//! # weave_component
//!
//! The data layer of the weave store — defines what an entity and a
//! component are, independent of the transactional machinery that
//! coordinates them.
//!
//! This crate provides:
//!
//! - [`Entity`] — shared entity handles over a growable 2-D slot table.
//! - [`EntityAllocator`] — monotonically increasing id allocator.
//! - [`EntityStore`] — the slot table itself, addressed by
//!   (system, slot).
//! - [`Component`] — shared, lockable component units.
//! - [`ComponentData`] — the payload contract (naming, duplication, and
//!   the document hook).
//! - [`TypeTag`] — registry-issued component type identities.

pub mod component;
pub mod entity;
pub mod store;

pub use component::{Component, ComponentData, PayloadLock, TypeTag};
pub use entity::{Entity, EntityAllocator};
pub use store::{EntityStore, StoreError};
