//! Core error taxonomy: registration, addressing, conflicts, and protocol
//! violations.

use thiserror::Error;

/// Errors surfaced by the registry, accessors, and transaction commits.
///
/// A correctly-used store raises none of these under normal operation.
/// Commit errors (`SlotOccupied`, `CyclicAttachment`,
/// `ReadLockInWritePhase`) abort the remainder of the commit; mutations
/// already applied by earlier phases are not rolled back, and the calling
/// thread's transaction context is cleared so a fresh transaction can be
/// opened.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A system with this name was already registered on this registry.
    #[error("system '{0}' is already registered")]
    SystemAlreadyRegistered(String),

    /// A system id that this registry never issued.
    #[error("system id {0} is not known")]
    UnknownSystem(u32),

    /// A component type that was never registered on this registry.
    #[error("component type '{0}' is not registered")]
    UnknownComponentType(&'static str),

    /// A component type was re-declared under a different owning system or
    /// parent than its first registration.
    #[error("component type '{name}' is already registered with a different declaration")]
    ComponentDeclarationMismatch {
        /// The re-declared component type.
        name: &'static str,
    },

    /// Attachment into a slot that already holds a component.
    #[error("could not attach '{new}' to entity {entity}: slot ({system}, {slot}) already holds '{existing}'")]
    SlotOccupied {
        /// Type name of the component that could not be attached.
        new: &'static str,
        /// Type name of the current occupant.
        existing: &'static str,
        /// Entity id.
        entity: u64,
        /// System row of the address.
        system: u32,
        /// Component slot of the address.
        slot: u32,
    },

    /// A slot stayed out of range even after growing the entity's table —
    /// a logic bug, not a recoverable condition.
    #[error("slot ({system}, {slot}) is still out of range after growth")]
    Addressing {
        /// System row of the address.
        system: u32,
        /// Component slot of the address.
        slot: u32,
    },

    /// A read lock was still registered when an update job finished — some
    /// code acquired one during the commit's write phase.
    #[error("a read lock was held during the update phase of a commit")]
    ReadLockInWritePhase,

    /// A full attachment sweep completed no job while jobs remained: the
    /// staged attachments form a ring of components none of which ever
    /// acquires an entity.
    #[error("cyclic attachment dependency: {0} staged attachment(s) can never acquire an entity")]
    CyclicAttachment(usize),

    /// The notification dispatch pool could not be built.
    #[error("failed to build the dispatch thread pool: {0}")]
    Dispatch(#[from] rayon::ThreadPoolBuildError),
}
