//! The registry: system and component-type identity assignment, the
//! subscription table, accessor construction, and entity creation.
//!
//! Identities are permanent for the life of the registry instance that
//! issued them. Component types form a closed tag set with precomputed
//! supertype chains — there is no runtime type-hierarchy walk anywhere in
//! the store.

use std::any::TypeId;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use weave_component::{ComponentData, Entity, EntityAllocator, TypeTag};

use crate::config::CoreConfig;
use crate::error::CoreError;
use crate::local::{LocalComponent, LocalMapper};
use crate::mapper::{Mapper, MapperCore};
use crate::subscription::{EventKind, Subscriber, Subscription};
use crate::transaction::{self, Transaction};

/// Stable identity of a system registered (or declared as a component
/// owner) on a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SystemId(pub u32);

impl fmt::Display for SystemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S{}", self.0)
    }
}

/// Everything the registry knows about one component type tag.
pub(crate) struct TypeInfo {
    pub(crate) tag: TypeTag,
    pub(crate) name: &'static str,
    pub(crate) system: SystemId,
    pub(crate) slot: u32,
    /// Supertype chain, the tag itself first, the registration root last.
    pub(crate) chain: Vec<TypeTag>,
}

/// Identity-assignment tables, guarded by one mutex so cross-table
/// invariants hold. Registration is rare; lookups that matter go through
/// the concurrent maps on [`Registry`] instead.
#[derive(Default)]
struct IdTables {
    system_ids: HashMap<String, SystemId>,
    system_names: Vec<String>,
    /// Systems actually registered (vs. merely assigned an id through a
    /// component-ownership declaration).
    registered: HashSet<u32>,
    /// Next free slot index per system.
    slot_counts: Vec<u32>,
    slot_types: HashMap<(u32, u32), TypeTag>,
    local_indices: HashMap<(String, TypeId), usize>,
    local_next: HashMap<TypeId, usize>,
}

static REGISTRY_SEQ: AtomicU64 = AtomicU64::new(0);

/// The registry. Shared behind an `Arc`; all methods take `&self`.
pub struct Registry {
    /// Self-reference so `&self` methods can hand out owning handles
    /// (accessors, transaction scopes) without a second parameter.
    me: Weak<Registry>,
    /// Keys this registry's per-thread transaction contexts.
    instance: u64,
    config: CoreConfig,
    allocator: EntityAllocator,
    tables: Mutex<IdTables>,
    /// Rust type -> tag, for accessor construction and unit creation.
    tags: DashMap<TypeId, TypeTag>,
    /// Tag-indexed type information, append-only.
    infos: RwLock<Vec<Arc<TypeInfo>>>,
    created: DashMap<Option<TypeTag>, Vec<Arc<Subscriber>>>,
    updated: DashMap<Option<TypeTag>, Vec<Arc<Subscriber>>>,
    destroyed: DashMap<Option<TypeTag>, Vec<Arc<Subscriber>>>,
    pool: rayon::ThreadPool,
}

impl Registry {
    /// Create a registry with the default configuration.
    ///
    /// # Panics
    ///
    /// Panics if the dispatch thread pool cannot be built; use
    /// [`Registry::with_config`] to handle that case.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::with_config(CoreConfig::new()).expect("failed to build the dispatch thread pool")
    }

    /// Create a registry with an explicit configuration.
    ///
    /// # Errors
    ///
    /// [`CoreError::Dispatch`] if the dispatch pool cannot be built.
    pub fn with_config(config: CoreConfig) -> Result<Arc<Self>, CoreError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.dispatch_threads)
            .thread_name(|i| format!("weave-dispatch-{i}"))
            .build()?;
        Ok(Arc::new_cyclic(|me| Self {
            me: me.clone(),
            instance: REGISTRY_SEQ.fetch_add(1, Ordering::Relaxed),
            config,
            allocator: EntityAllocator::new(),
            tables: Mutex::new(IdTables::default()),
            tags: DashMap::new(),
            infos: RwLock::new(Vec::new()),
            created: DashMap::new(),
            updated: DashMap::new(),
            destroyed: DashMap::new(),
            pool,
        }))
    }

    /// An owning handle to this registry.
    pub(crate) fn arc(&self) -> Arc<Registry> {
        self.me.upgrade().expect("registry dropped while in use")
    }

    // -- Identity assignment --

    /// The id assigned to the named system, issuing a fresh one on first
    /// request. Requesting an id does not register the system.
    pub fn system_id(&self, name: &str) -> SystemId {
        let mut tables = self.tables.lock();
        Self::assign_system(&mut tables, name)
    }

    fn assign_system(tables: &mut IdTables, name: &str) -> SystemId {
        if let Some(id) = tables.system_ids.get(name) {
            return *id;
        }
        let id = SystemId(tables.system_names.len() as u32);
        tables.system_ids.insert(name.to_string(), id);
        tables.system_names.push(name.to_string());
        tables.slot_counts.push(0);
        debug!(system = name, id = %id, "system id assigned");
        id
    }

    /// Register a system: merge its declared subscriptions into the
    /// subscription table.
    ///
    /// A system name whose id was previously assigned (through a
    /// component-ownership declaration) reuses that id.
    ///
    /// # Errors
    ///
    /// [`CoreError::SystemAlreadyRegistered`] if this name was already
    /// registered on this registry instance.
    pub fn register_system(
        &self,
        name: &str,
        subscriptions: Vec<Subscription>,
    ) -> Result<SystemId, CoreError> {
        let id = {
            let mut tables = self.tables.lock();
            let id = Self::assign_system(&mut tables, name);
            if !tables.registered.insert(id.0) {
                return Err(CoreError::SystemAlreadyRegistered(name.to_string()));
            }
            id
        };

        let count = subscriptions.len();
        for subscription in subscriptions {
            let entry = Arc::new(Subscriber {
                system: id,
                label: subscription.label,
                requires: subscription.requires,
                excludes: subscription.excludes,
                handler: subscription.handler,
            });
            let kinds = match subscription.event {
                EventKind::Any => vec![EventKind::Created, EventKind::Updated, EventKind::Destroyed],
                kind => vec![kind],
            };
            for kind in kinds {
                self.table_for(kind)
                    .entry(subscription.component)
                    .or_default()
                    .push(Arc::clone(&entry));
            }
        }

        debug!(system = name, id = %id, subscriptions = count, "system registered");
        Ok(id)
    }

    /// Register a component type under its owning system, assigning its
    /// permanent (system, slot) address on first request. Repeat
    /// registration of the same type with the same declaration returns the
    /// existing tag.
    ///
    /// # Errors
    ///
    /// [`CoreError::UnknownSystem`] if `system` was never issued by this
    /// registry; [`CoreError::ComponentDeclarationMismatch`] if the type
    /// was first registered with a different owning system or as a
    /// subtype.
    pub fn register_component<T: ComponentData>(&self, system: SystemId) -> Result<TypeTag, CoreError> {
        let mut tables = self.tables.lock();
        if let Some(tag) = self.tags.get(&TypeId::of::<T>()).map(|entry| *entry) {
            let info = self.info(tag);
            return if info.system == system && info.chain.len() == 1 {
                Ok(tag)
            } else {
                Err(CoreError::ComponentDeclarationMismatch {
                    name: T::type_name(),
                })
            };
        }
        if system.0 as usize >= tables.system_names.len() {
            return Err(CoreError::UnknownSystem(system.0));
        }

        let slot = tables.slot_counts[system.0 as usize];
        tables.slot_counts[system.0 as usize] += 1;

        let tag = self.push_info(|tag| TypeInfo {
            tag,
            name: T::type_name(),
            system,
            slot,
            chain: vec![tag],
        });
        tables.slot_types.insert((system.0, slot), tag);
        self.tags.insert(TypeId::of::<T>(), tag);
        debug!(component = T::type_name(), system = %system, slot, tag = %tag, "component type registered");
        Ok(tag)
    }

    /// Register a component type as a subtype of an already-registered
    /// type. The subtype shares its parent's (system, slot) address, so a
    /// supertype accessor finds subtype occupants, and extends the
    /// parent's supertype chain for subscriber matching.
    ///
    /// # Errors
    ///
    /// [`CoreError::ComponentDeclarationMismatch`] if the type was first
    /// registered with a different declaration.
    pub fn register_subtype<T: ComponentData>(&self, parent: TypeTag) -> Result<TypeTag, CoreError> {
        let _tables = self.tables.lock();
        let parent_info = self.info(parent);
        if let Some(tag) = self.tags.get(&TypeId::of::<T>()).map(|entry| *entry) {
            let info = self.info(tag);
            return if info.chain.get(1) == Some(&parent) {
                Ok(tag)
            } else {
                Err(CoreError::ComponentDeclarationMismatch {
                    name: T::type_name(),
                })
            };
        }

        let tag = self.push_info(|tag| {
            let mut chain = Vec::with_capacity(parent_info.chain.len() + 1);
            chain.push(tag);
            chain.extend_from_slice(&parent_info.chain);
            TypeInfo {
                tag,
                name: T::type_name(),
                system: parent_info.system,
                slot: parent_info.slot,
                chain,
            }
        });
        self.tags.insert(TypeId::of::<T>(), tag);
        debug!(component = T::type_name(), parent = %parent, tag = %tag, "component subtype registered");
        Ok(tag)
    }

    fn push_info(&self, build: impl FnOnce(TypeTag) -> TypeInfo) -> TypeTag {
        let mut infos = self.infos.write();
        let tag = TypeTag(infos.len() as u32);
        infos.push(Arc::new(build(tag)));
        tag
    }

    // -- Lookups --

    /// The tag issued for `T`, if `T` has been registered.
    #[must_use]
    pub fn tag_of<T: ComponentData>(&self) -> Option<TypeTag> {
        self.tags.get(&TypeId::of::<T>()).map(|entry| *entry)
    }

    /// The component type registered at a (system, slot) address.
    #[must_use]
    pub fn type_at(&self, system: SystemId, slot: u32) -> Option<TypeTag> {
        self.tables.lock().slot_types.get(&(system.0, slot)).copied()
    }

    /// The name a system id was assigned under.
    ///
    /// # Errors
    ///
    /// [`CoreError::UnknownSystem`] if the id was never issued.
    pub fn system_name(&self, system: SystemId) -> Result<String, CoreError> {
        self.tables
            .lock()
            .system_names
            .get(system.0 as usize)
            .cloned()
            .ok_or(CoreError::UnknownSystem(system.0))
    }

    /// Number of systems that have been assigned an id.
    #[must_use]
    pub fn system_count(&self) -> usize {
        self.tables.lock().system_names.len()
    }

    /// Number of component slots assigned under a system.
    ///
    /// # Errors
    ///
    /// [`CoreError::UnknownSystem`] if the id was never issued.
    pub fn slot_count(&self, system: SystemId) -> Result<u32, CoreError> {
        self.tables
            .lock()
            .slot_counts
            .get(system.0 as usize)
            .copied()
            .ok_or(CoreError::UnknownSystem(system.0))
    }

    /// The registered name of a component type tag.
    #[must_use]
    pub fn type_name_of(&self, tag: TypeTag) -> &'static str {
        self.info(tag).name
    }

    pub(crate) fn info(&self, tag: TypeTag) -> Arc<TypeInfo> {
        Arc::clone(
            self.infos
                .read()
                .get(tag.0 as usize)
                .expect("TypeTag was not issued by this registry"),
        )
    }

    /// `true` if `ancestor` appears in `tag`'s supertype chain (including
    /// `tag` itself) — the closed-set equivalent of an instance-of check.
    pub(crate) fn chain_contains(&self, tag: TypeTag, ancestor: TypeTag) -> bool {
        tag == ancestor || self.info(tag).chain.contains(&ancestor)
    }

    // -- Accessors --

    /// The typed accessor for a registered component type.
    ///
    /// The identity data behind the accessor is assigned once and cached;
    /// the returned handle is a cheap view over it.
    ///
    /// # Errors
    ///
    /// [`CoreError::UnknownComponentType`] if `T` has not been registered.
    pub fn mapper<T: ComponentData>(&self) -> Result<Mapper<T>, CoreError> {
        let tag = self
            .tag_of::<T>()
            .ok_or(CoreError::UnknownComponentType(T::type_name()))?;
        Ok(Mapper::new(self.core_for(tag)))
    }

    /// The local-data accessor for `owner` over the local component type
    /// `L`. Each (owner, type) pair gets a stable cell index.
    ///
    /// # Errors
    ///
    /// [`CoreError::UnknownComponentType`] if `L` has not been registered.
    pub fn local_mapper<L: LocalComponent>(&self, owner: &str) -> Result<LocalMapper<L>, CoreError> {
        let tag = self
            .tag_of::<L>()
            .ok_or(CoreError::UnknownComponentType(L::type_name()))?;
        let index = {
            let mut tables = self.tables.lock();
            let key = (owner.to_string(), TypeId::of::<L>());
            match tables.local_indices.get(&key) {
                Some(index) => *index,
                None => {
                    let next = tables.local_next.entry(TypeId::of::<L>()).or_insert(0);
                    let index = *next;
                    *next += 1;
                    tables.local_indices.insert(key, index);
                    index
                }
            }
        };
        Ok(LocalMapper::new(self.core_for(tag), index))
    }

    pub(crate) fn core_for(&self, tag: TypeTag) -> MapperCore {
        MapperCore::new(self.arc(), self.info(tag))
    }

    // -- Entities and transactions --

    /// Create a fresh entity, pre-sized to the current system count.
    #[must_use]
    pub fn create_entity(&self) -> Entity {
        self.allocator.allocate(self.system_count())
    }

    /// Open a transaction scope on the calling thread.
    ///
    /// Re-entrant: if this thread already has an open transaction on this
    /// registry, the returned handle is a no-op and the outermost scope
    /// owns the commit.
    #[must_use]
    pub fn transaction(&self) -> Transaction {
        transaction::open(&self.arc())
    }

    // -- Dispatch support --

    pub(crate) fn subscribers_for(&self, tag: TypeTag, kind: EventKind) -> Vec<Arc<Subscriber>> {
        let table = self.table_for(kind);
        let mut seen = HashSet::new();
        let mut matched = Vec::new();
        let chain = self.info(tag).chain.clone();
        for link in chain.iter().map(|t| Some(*t)).chain([None]) {
            if let Some(entries) = table.get(&link) {
                for entry in entries.iter() {
                    if seen.insert(Arc::as_ptr(entry) as usize) {
                        matched.push(Arc::clone(entry));
                    }
                }
            }
        }
        matched
    }

    fn table_for(&self, kind: EventKind) -> &DashMap<Option<TypeTag>, Vec<Arc<Subscriber>>> {
        match kind {
            EventKind::Created => &self.created,
            EventKind::Updated => &self.updated,
            EventKind::Destroyed => &self.destroyed,
            EventKind::Any => unreachable!("wildcard subscriptions are expanded at registration"),
        }
    }

    pub(crate) fn pool(&self) -> &rayon::ThreadPool {
        &self.pool
    }

    pub(crate) fn instance(&self) -> u64 {
        self.instance
    }

    pub(crate) fn wait_timeout(&self) -> Option<Duration> {
        self.config.wait_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct C1;
    impl ComponentData for C1 {
        fn type_name() -> &'static str {
            "C1"
        }
        fn duplicate_data(&self) -> Box<dyn ComponentData> {
            Box::new(C1)
        }
    }

    struct C2;
    impl ComponentData for C2 {
        fn type_name() -> &'static str {
            "C2"
        }
        fn duplicate_data(&self) -> Box<dyn ComponentData> {
            Box::new(C2)
        }
    }

    struct C3;
    impl ComponentData for C3 {
        fn type_name() -> &'static str {
            "C3"
        }
        fn duplicate_data(&self) -> Box<dyn ComponentData> {
            Box::new(C3)
        }
    }

    #[test]
    fn test_system_ids_are_sequential_and_stable() {
        let registry = Registry::new();
        let s1 = registry.system_id("routing");
        let s2 = registry.system_id("topology");
        assert_eq!(s1, SystemId(0));
        assert_eq!(s2, SystemId(1));
        assert_eq!(registry.system_id("routing"), s1);
        assert_eq!(registry.system_name(s2).unwrap(), "topology");
    }

    #[test]
    fn test_register_system_twice_fails() {
        let registry = Registry::new();
        registry.register_system("routing", Vec::new()).unwrap();
        assert!(matches!(
            registry.register_system("routing", Vec::new()),
            Err(CoreError::SystemAlreadyRegistered(_))
        ));
    }

    #[test]
    fn test_register_system_reuses_assigned_id() {
        let registry = Registry::new();
        // Id assigned through an ownership declaration before the system
        // itself registers.
        let sid = registry.system_id("routing");
        registry.register_component::<C1>(sid).unwrap();
        let registered = registry.register_system("routing", Vec::new()).unwrap();
        assert_eq!(registered, sid);
    }

    #[test]
    fn test_component_slots_are_sequential_per_system() {
        let registry = Registry::new();
        let s1 = registry.system_id("routing");
        let s2 = registry.system_id("topology");

        let t1 = registry.register_component::<C1>(s1).unwrap();
        let t2 = registry.register_component::<C2>(s1).unwrap();
        let t3 = registry.register_component::<C3>(s2).unwrap();

        assert_eq!(registry.info(t1).slot, 0);
        assert_eq!(registry.info(t2).slot, 1);
        assert_eq!(registry.info(t3).slot, 0);
        assert_eq!(registry.slot_count(s1).unwrap(), 2);
        assert_eq!(registry.slot_count(s2).unwrap(), 1);
        assert_eq!(registry.type_at(s1, 1), Some(t2));
    }

    #[test]
    fn test_register_component_is_idempotent() {
        let registry = Registry::new();
        let sid = registry.system_id("routing");
        let first = registry.register_component::<C1>(sid).unwrap();
        let second = registry.register_component::<C1>(sid).unwrap();
        assert_eq!(first, second);
        assert_eq!(registry.slot_count(sid).unwrap(), 1);
    }

    #[test]
    fn test_register_component_rejects_redeclaration() {
        let registry = Registry::new();
        let s1 = registry.system_id("routing");
        let s2 = registry.system_id("topology");
        registry.register_component::<C1>(s1).unwrap();
        assert!(matches!(
            registry.register_component::<C1>(s2),
            Err(CoreError::ComponentDeclarationMismatch { .. })
        ));
    }

    #[test]
    fn test_register_component_requires_known_system() {
        let registry = Registry::new();
        assert!(matches!(
            registry.register_component::<C1>(SystemId(7)),
            Err(CoreError::UnknownSystem(7))
        ));
    }

    #[test]
    fn test_subtype_shares_address_and_extends_chain() {
        let registry = Registry::new();
        let sid = registry.system_id("routing");
        let base = registry.register_component::<C1>(sid).unwrap();
        let mid = registry.register_subtype::<C2>(base).unwrap();
        let leaf = registry.register_subtype::<C3>(mid).unwrap();

        let leaf_info = registry.info(leaf);
        assert_eq!(leaf_info.system, sid);
        assert_eq!(leaf_info.slot, registry.info(base).slot);
        assert_eq!(leaf_info.chain, vec![leaf, mid, base]);

        assert!(registry.chain_contains(leaf, base));
        assert!(registry.chain_contains(leaf, mid));
        assert!(!registry.chain_contains(base, leaf));
    }

    #[test]
    fn test_mapper_requires_registration() {
        let registry = Registry::new();
        assert!(matches!(
            registry.mapper::<C1>(),
            Err(CoreError::UnknownComponentType("C1"))
        ));
    }

    #[test]
    fn test_entities_are_presized_to_system_count() {
        let registry = Registry::new();
        registry.system_id("routing");
        registry.system_id("topology");
        let entity = registry.create_entity();
        assert_eq!(entity.id(), 0);
        // Slots still need growth, but reads inside the pre-sized range
        // are safely absent.
        assert!(!entity.has(1, 0));
    }

    #[test]
    fn test_wildcard_subscription_lands_in_all_tables() {
        let registry = Registry::new();
        let sid = registry.system_id("routing");
        let tag = registry.register_component::<C1>(sid).unwrap();
        registry
            .register_system(
                "routing",
                vec![Subscription::new(tag, EventKind::Any, "any", |_, _| {})],
            )
            .unwrap();

        for kind in [EventKind::Created, EventKind::Updated, EventKind::Destroyed] {
            assert_eq!(registry.subscribers_for(tag, kind).len(), 1);
        }
    }

    #[test]
    fn test_supertype_subscription_matches_subtype() {
        let registry = Registry::new();
        let sid = registry.system_id("routing");
        let base = registry.register_component::<C1>(sid).unwrap();
        let leaf = registry.register_subtype::<C2>(base).unwrap();
        registry
            .register_system(
                "routing",
                vec![
                    Subscription::new(base, EventKind::Created, "on_base", |_, _| {}),
                    Subscription::global(EventKind::Created, "on_any", |_, _| {}),
                ],
            )
            .unwrap();

        // The subtype matches its supertype's subscription plus the global
        // one; the supertype does not match subtype-only subscriptions.
        assert_eq!(registry.subscribers_for(leaf, EventKind::Created).len(), 2);
        assert_eq!(registry.subscribers_for(base, EventKind::Created).len(), 2);
        assert_eq!(registry.subscribers_for(base, EventKind::Updated).len(), 0);
    }
}
