//! Event kinds and declarative subscriptions.
//!
//! A subscription names a component type (or none, for a global
//! subscription), the event kind it reacts to, optional positive and
//! negative filters over the triggering component's entity, and the
//! handler to run. Systems hand the registry their full subscription list
//! at registration time; there is no runtime discovery.

use std::fmt;
use std::sync::Arc;

use weave_component::{Component, Entity, TypeTag};

use crate::registry::SystemId;

/// The component lifecycle events a subscriber can react to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// The component was attached to an entity.
    Created,
    /// The component's payload was mutated.
    Updated,
    /// The component was detached from its entity.
    Destroyed,
    /// Wildcard: any of the three events above.
    Any,
}

/// Handler invoked with the triggering component and the entity captured
/// for the notification (`None` when the component has no entity by
/// dispatch time).
pub type SubscriberFn = Arc<dyn Fn(&Component, Option<&Entity>) + Send + Sync>;

/// One declared subscription, built with [`Subscription::new`] (or
/// [`Subscription::global`]) plus the `require`/`exclude` filter builders.
pub struct Subscription {
    pub(crate) component: Option<TypeTag>,
    pub(crate) event: EventKind,
    pub(crate) requires: Vec<TypeTag>,
    pub(crate) excludes: Vec<TypeTag>,
    pub(crate) label: String,
    pub(crate) handler: SubscriberFn,
}

impl Subscription {
    /// Subscribe to `event` on components of type `component` (including
    /// its registered subtypes). `label` identifies the handler in logs.
    pub fn new(
        component: TypeTag,
        event: EventKind,
        label: impl Into<String>,
        handler: impl Fn(&Component, Option<&Entity>) + Send + Sync + 'static,
    ) -> Self {
        Self {
            component: Some(component),
            event,
            requires: Vec::new(),
            excludes: Vec::new(),
            label: label.into(),
            handler: Arc::new(handler),
        }
    }

    /// Subscribe to `event` on every component type.
    pub fn global(
        event: EventKind,
        label: impl Into<String>,
        handler: impl Fn(&Component, Option<&Entity>) + Send + Sync + 'static,
    ) -> Self {
        Self {
            component: None,
            event,
            requires: Vec::new(),
            excludes: Vec::new(),
            label: label.into(),
            handler: Arc::new(handler),
        }
    }

    /// Positive filter: only run when the triggering component's entity
    /// also carries a component of type `tag`.
    #[must_use]
    pub fn require(mut self, tag: TypeTag) -> Self {
        self.requires.push(tag);
        self
    }

    /// Negative filter: only run when the triggering component's entity
    /// does not carry a component of type `tag`.
    #[must_use]
    pub fn exclude(mut self, tag: TypeTag) -> Self {
        self.excludes.push(tag);
        self
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("component", &self.component)
            .field("event", &self.event)
            .field("requires", &self.requires)
            .field("excludes", &self.excludes)
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

/// A subscription as registered: the declaring system plus the matching
/// and invocation data.
pub(crate) struct Subscriber {
    pub(crate) system: SystemId,
    pub(crate) label: String,
    pub(crate) requires: Vec<TypeTag>,
    pub(crate) excludes: Vec<TypeTag>,
    pub(crate) handler: SubscriberFn,
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Subscriber({} of {})", self.label, self.system)
    }
}
