//! Per-thread transaction contexts and the ordered commit engine.
//!
//! A transaction is a scope, not a value to mutate through: accessor
//! operations stage work into the calling thread's context, and closing
//! the outermost scope commits everything in a fixed order — release read
//! locks, detach, attach (with retry for anchor-chained attachments),
//! update, then dispatch the update/attachment/detachment notification
//! waves. Contexts are keyed by registry instance, so threads can hold
//! independent transactions against different registries.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::mem;
use std::sync::Arc;

use parking_lot::{ArcRwLockReadGuard, RawRwLock};
use tracing::{debug, error, trace};

use weave_component::{Component, ComponentData, Entity};

use crate::dispatch;
use crate::error::CoreError;
use crate::registry::Registry;
use crate::subscription::EventKind;

/// A read guard parked in the context until commit releases it.
type ReadGuard = ArcRwLockReadGuard<RawRwLock, Box<dyn ComponentData>>;

/// Detachment job: physically empties an entity slot.
pub(crate) type DetachJob = Box<dyn FnOnce()>;

/// Attachment job: `Ok(true)` when complete, `Ok(false)` when blocked on
/// an anchor that has no entity yet (retried in the next sweep).
pub(crate) type AttachJob = Box<dyn FnMut() -> Result<bool, CoreError>>;

/// Mutation closure staged against one target unit.
pub(crate) type UpdateJob = Box<dyn FnOnce(&mut dyn ComponentData)>;

/// One queued notification: the triggering component, the entity captured
/// for it (`None` means "resolve live at dispatch"), and the event kind.
pub(crate) struct Notification {
    pub(crate) component: Component,
    pub(crate) entity: Option<Entity>,
    pub(crate) kind: EventKind,
}

#[derive(Default)]
struct TxData {
    read_guards: Vec<ReadGuard>,
    /// Units whose read lock this context already holds, to keep one
    /// guard per unit per transaction.
    held: HashSet<usize>,
    detach_jobs: Vec<DetachJob>,
    attach_jobs: Vec<AttachJob>,
    /// Update closures grouped per target unit, groups in staging order,
    /// so the commit takes each unit's write lock exactly once.
    update_jobs: Vec<(Component, Vec<UpdateJob>)>,
    update_notes: Vec<Notification>,
    attach_notes: Vec<Notification>,
    detach_notes: Vec<Notification>,
    write_phase: bool,
}

thread_local! {
    static CONTEXTS: RefCell<HashMap<u64, TxData>> = RefCell::new(HashMap::new());
}

fn with_active<R>(instance: u64, f: impl FnOnce(&mut TxData) -> R) -> Option<R> {
    CONTEXTS.with(|contexts| contexts.borrow_mut().get_mut(&instance).map(f))
}

fn open_ctx(instance: u64) -> bool {
    CONTEXTS.with(|contexts| {
        let mut map = contexts.borrow_mut();
        if map.contains_key(&instance) {
            false
        } else {
            map.insert(instance, TxData::default());
            true
        }
    })
}

fn take_ctx(instance: u64) -> Option<TxData> {
    CONTEXTS.with(|contexts| contexts.borrow_mut().remove(&instance))
}

/// Forcibly clear the calling thread's context for a registry, releasing
/// any parked read locks, so a later transaction can open normally.
pub(crate) fn clear(instance: u64) {
    take_ctx(instance);
}

// -- Staging (called by the accessor layer with a transaction open) --

pub(crate) fn stage_detach(instance: u64, job: DetachJob, note: Notification) {
    with_active(instance, |ctx| {
        ctx.detach_notes.push(note);
        ctx.detach_jobs.push(job);
    });
}

pub(crate) fn stage_attach(instance: u64, job: AttachJob, note: Notification) {
    with_active(instance, |ctx| {
        ctx.attach_jobs.push(job);
        ctx.attach_notes.push(note);
    });
}

pub(crate) fn stage_update(instance: u64, component: &Component, job: UpdateJob, note: Notification) {
    with_active(instance, |ctx| {
        match ctx.update_jobs.iter_mut().find(|(unit, _)| unit == component) {
            Some((_, jobs)) => jobs.push(job),
            None => ctx.update_jobs.push((component.clone(), vec![job])),
        }
        ctx.update_notes.push(note);
    });
}

/// Acquire a read lock on `component`, parked in the current context
/// until commit. One guard per unit per transaction.
///
/// # Panics
///
/// Panics if called during the commit's update phase — write-phase code
/// must not re-enter the read path, or it would deadlock against the
/// write lock already held. The context is cleared first so the thread
/// can open a fresh transaction afterwards.
pub(crate) fn acquire_read(registry: &Registry, component: &Component) {
    let instance = registry.instance();
    match with_active(instance, |ctx| ctx.write_phase) {
        None => debug_assert!(false, "read lock requested outside a transaction"),
        Some(true) => {
            clear(instance);
            panic!("a read lock must not be acquired during the update phase of a commit");
        }
        Some(false) => {
            with_active(instance, |ctx| {
                if ctx.held.insert(component.addr()) {
                    ctx.read_guards.push(component.lock().read_arc_recursive());
                    trace!(component = ?component, "read lock acquired");
                }
            });
        }
    }
}

#[cfg(test)]
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct StagedCounts {
    pub read_locks: usize,
    pub detach_jobs: usize,
    pub attach_jobs: usize,
    pub update_groups: usize,
    pub update_notes: usize,
    pub attach_notes: usize,
    pub detach_notes: usize,
}

#[cfg(test)]
pub(crate) fn staged_counts(registry: &Registry) -> Option<StagedCounts> {
    with_active(registry.instance(), |ctx| StagedCounts {
        read_locks: ctx.read_guards.len(),
        detach_jobs: ctx.detach_jobs.len(),
        attach_jobs: ctx.attach_jobs.len(),
        update_groups: ctx.update_jobs.len(),
        update_notes: ctx.update_notes.len(),
        attach_notes: ctx.attach_notes.len(),
        detach_notes: ctx.detach_notes.len(),
    })
}

// -- The transaction scope --

/// Handle for one transaction scope. Closing the outermost handle commits
/// all staged work; nested handles are no-ops.
///
/// [`Transaction::close`] reports commit errors. A handle that is simply
/// dropped still commits, logging any error — open the scope explicitly
/// and call `close` when the caller needs to observe failures.
pub struct Transaction {
    registry: Arc<Registry>,
    owner: bool,
    done: bool,
}

pub(crate) fn open(registry: &Arc<Registry>) -> Transaction {
    let owner = open_ctx(registry.instance());
    if owner {
        trace!("transaction opened");
    }
    Transaction {
        registry: Arc::clone(registry),
        owner,
        done: false,
    }
}

impl Transaction {
    /// `true` if this handle is the outermost scope and will run the
    /// commit.
    #[must_use]
    pub fn owns_commit(&self) -> bool {
        self.owner
    }

    /// Close the scope. On the outermost handle this commits all staged
    /// work and dispatches notifications; on a nested handle it is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// The synchronous commit errors: [`CoreError::SlotOccupied`],
    /// [`CoreError::CyclicAttachment`], [`CoreError::Addressing`], and
    /// [`CoreError::ReadLockInWritePhase`]. Subscriber failures during
    /// dispatch are logged, never returned.
    pub fn close(mut self) -> Result<(), CoreError> {
        self.done = true;
        if self.owner {
            commit(&self.registry)
        } else {
            Ok(())
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.owner && !self.done {
            self.done = true;
            if let Err(error) = commit(&self.registry) {
                error!(%error, "transaction commit failed");
            }
        }
    }
}

/// Clears the context if the commit unwinds or bails early, so the thread
/// is usable afterwards.
struct ClearOnExit {
    instance: u64,
    armed: bool,
}

impl Drop for ClearOnExit {
    fn drop(&mut self) {
        if self.armed {
            clear(self.instance);
        }
    }
}

fn commit(registry: &Arc<Registry>) -> Result<(), CoreError> {
    let instance = registry.instance();
    let mut cleanup = ClearOnExit {
        instance,
        armed: true,
    };

    // 1. Enter the write phase and release every read lock acquired
    // during the transaction body — mutation must never wait behind a
    // read lock held by its own thread.
    let guards = with_active(instance, |ctx| {
        ctx.write_phase = true;
        ctx.held.clear();
        mem::take(&mut ctx.read_guards)
    });
    drop(guards);

    // 2. Detachments, in staging order.
    let detach_jobs = with_active(instance, |ctx| mem::take(&mut ctx.detach_jobs)).unwrap_or_default();
    trace!(jobs = detach_jobs.len(), "processing detachments");
    for job in detach_jobs {
        job();
    }

    // 3. Attachment sweeps: completed jobs drop out, blocked jobs retry.
    // A sweep that completes nothing while jobs remain is a ring of
    // components none of which will ever have an entity.
    let mut attach_jobs =
        with_active(instance, |ctx| mem::take(&mut ctx.attach_jobs)).unwrap_or_default();
    trace!(jobs = attach_jobs.len(), "processing attachments");
    while !attach_jobs.is_empty() {
        let mut blocked = Vec::new();
        let mut progressed = false;
        for mut job in attach_jobs {
            if job()? {
                progressed = true;
            } else {
                blocked.push(job);
            }
        }
        if !progressed && !blocked.is_empty() {
            return Err(CoreError::CyclicAttachment(blocked.len()));
        }
        attach_jobs = blocked;
    }

    // 4. Updates: take each target unit's write lock once and run its
    // closures in staging order.
    let groups = with_active(instance, |ctx| mem::take(&mut ctx.update_jobs)).unwrap_or_default();
    trace!(groups = groups.len(), "processing updates");
    for (component, jobs) in groups {
        let mut guard = component.lock().write_arc();
        for job in jobs {
            job(&mut **guard);
        }
        drop(guard);
        let leftover = with_active(instance, |ctx| !ctx.read_guards.is_empty()).unwrap_or(false);
        if leftover {
            return Err(CoreError::ReadLockInWritePhase);
        }
    }

    // 5-7. Notification waves. The context leaves the thread first so a
    // wave unit that the pool runs inline on this very thread opens a
    // fresh nested transaction instead of observing the committing one.
    cleanup.armed = false;
    let Some(data) = take_ctx(instance) else {
        return Ok(());
    };
    debug!(
        update = data.update_notes.len(),
        attach = data.attach_notes.len(),
        detach = data.detach_notes.len(),
        "dispatching notifications"
    );
    dispatch::dispatch_wave(registry, data.update_notes);
    dispatch::dispatch_wave(registry, data.attach_notes);
    dispatch::dispatch_wave(registry, data.detach_notes);
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::registry::Registry;

    #[test]
    fn test_nested_open_is_a_noop() {
        let registry = Registry::new();
        let outer = registry.transaction();
        let inner = registry.transaction();
        assert!(outer.owns_commit());
        assert!(!inner.owns_commit());
        inner.close().unwrap();
        // The outer scope is still open and still owns the commit.
        assert!(super::staged_counts(&registry).is_some());
        outer.close().unwrap();
        assert!(super::staged_counts(&registry).is_none());
    }

    #[test]
    fn test_contexts_are_per_registry() {
        let a = Registry::new();
        let b = Registry::new();
        let tx_a = a.transaction();
        let tx_b = b.transaction();
        assert!(tx_a.owns_commit());
        assert!(tx_b.owns_commit());
        tx_b.close().unwrap();
        assert!(super::staged_counts(&a).is_some());
        tx_a.close().unwrap();
    }

    #[test]
    fn test_empty_commit_is_clean() {
        let registry = Registry::new();
        registry.transaction().close().unwrap();
        assert!(super::staged_counts(&registry).is_none());
    }
}
