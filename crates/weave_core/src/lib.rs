//! # weave_core
//!
//! The control layer of the weave store: a reactive, transactional
//! entity-component substrate. Independent systems share lockable state
//! attached to entities, stage mutations inside per-thread transactions,
//! and observe committed changes through filtered subscriptions
//! dispatched in parallel.
//!
//! This crate provides:
//!
//! - [`Registry`] — system/component identity assignment, the
//!   subscription table, accessor construction, entity creation.
//! - [`Mapper`] — the typed accessor enforcing locking and staging rules
//!   for reads, attaches, detaches, and updates.
//! - [`Transaction`] — the per-thread staging scope whose close commits
//!   in a fixed phase order and dispatches notifications.
//! - [`Subscription`] / [`EventKind`] — declarative, filterable
//!   subscriptions to component lifecycle events.
//! - [`LocalMapper`] — per-owner scratch data on entities, outside the
//!   event system.
//! - [`Registry::entity_document`] — the read-only walk handed to
//!   serialization collaborators.
//!
//! ## Usage
//!
//! ```rust
//! use weave_core::{ComponentData, EventKind, Mapper, Registry, Subscription};
//!
//! struct Health { current: u32 }
//!
//! impl ComponentData for Health {
//!     fn type_name() -> &'static str { "Health" }
//!     fn duplicate_data(&self) -> Box<dyn ComponentData> {
//!         Box::new(Health { current: self.current })
//!     }
//! }
//!
//! let registry = Registry::new();
//! let combat = registry.system_id("combat");
//! let health_tag = registry.register_component::<Health>(combat).unwrap();
//! registry.register_system("combat", vec![
//!     Subscription::new(health_tag, EventKind::Created, "on_spawn", |_, _| {}),
//! ]).unwrap();
//!
//! let healths: Mapper<Health> = registry.mapper().unwrap();
//! let entity = registry.create_entity();
//!
//! let tx = registry.transaction();
//! healths.attach(&entity, healths.create(Health { current: 100 }));
//! tx.close().unwrap();
//!
//! assert!(healths.contains(&entity));
//! ```

pub mod config;
pub mod error;
pub mod local;
pub mod mapper;
pub mod registry;
pub mod subscription;
pub mod transaction;

mod dispatch;
mod document;

pub use config::CoreConfig;
pub use error::CoreError;
pub use local::{LocalComponent, LocalMapper};
pub use mapper::Mapper;
pub use registry::{Registry, SystemId};
pub use subscription::{EventKind, SubscriberFn, Subscription};
pub use transaction::Transaction;

// Re-export the data layer so embedders need a single import path.
pub use weave_component::{Component, ComponentData, Entity, TypeTag};
