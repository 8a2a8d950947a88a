use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::ctx::Context;
use crate::hamt::PersistentMap;
use crate::var::{ContextVar, VarId};

pub(crate) type Opaque = dyn Any + Send + Sync;

static NEXT_STAMP: AtomicU64 = AtomicU64::new(1);

/// Marks one particular `set`.  Stamps are unique process wide, so a
/// binding inherited by a child still carries the stamp of the write that
/// created it in the parent.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) struct Stamp(u64);

impl Stamp {
    pub(crate) fn next() -> Stamp {
        Stamp(NEXT_STAMP.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Clone)]
pub(crate) struct Binding {
    pub(crate) value: Arc<Opaque>,
    pub(crate) stamp: Stamp,
}

impl Binding {
    pub(crate) fn downcast<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.value.clone().downcast::<T>().ok()
    }
}

lazy_static! {
    static ref EMPTY_SNAPSHOT: Snapshot = Snapshot {
        bindings: PersistentMap::new(),
    };
}

/// An immutable set of bindings: everything one task sees.
///
/// Snapshots never change.  Writing through a [`Context`] derives a new
/// snapshot that shares all untouched parts with the old one, so holding on
/// to a snapshot is a cheap way to remember the state of a flow at a point
/// in time.  Cloning is a reference count bump.
///
/// Snapshots are `Send` and `Sync` and can be handed to other threads.
#[derive(Clone)]
pub struct Snapshot {
    bindings: PersistentMap<VarId, Binding>,
}

impl Default for Snapshot {
    fn default() -> Snapshot {
        Snapshot::empty()
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("bindings", &self.len())
            .finish()
    }
}

impl Snapshot {
    /// Returns the snapshot without any bindings.
    ///
    /// All empty snapshots share the same root.
    pub fn empty() -> Snapshot {
        EMPTY_SNAPSHOT.clone()
    }

    /// Wraps a binding map, folding the empty case into the shared root.
    fn from_bindings(bindings: PersistentMap<VarId, Binding>) -> Snapshot {
        if bindings.is_empty() {
            Snapshot::empty()
        } else {
            Snapshot { bindings }
        }
    }

    pub(crate) fn binding(&self, id: VarId) -> Option<&Binding> {
        self.bindings.get(&id)
    }

    pub(crate) fn with_binding(&self, id: VarId, binding: Binding) -> Snapshot {
        Snapshot::from_bindings(self.bindings.insert(id, binding))
    }

    pub(crate) fn without(&self, id: VarId) -> Snapshot {
        Snapshot::from_bindings(self.bindings.remove(&id))
    }

    /// Returns the value bound to `var` in this snapshot.
    ///
    /// Unlike `Context::get` this does not fall back to the default.
    pub fn lookup<T: Send + Sync + 'static>(&self, var: &ContextVar<T>) -> Option<Arc<T>> {
        self.binding(var.id()).and_then(|binding| binding.downcast())
    }

    /// Checks if `var` is bound in this snapshot.
    pub fn contains<T>(&self, var: &ContextVar<T>) -> bool {
        self.bindings.contains_key(&var.id())
    }

    /// Number of bound variables.
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Iterates over the identities of all bound variables.
    pub fn var_ids(&self) -> impl Iterator<Item = VarId> + '_ {
        self.bindings.keys().cloned()
    }

    /// Returns `true` if both are the same snapshot (not merely equal ones).
    pub fn ptr_eq(&self, other: &Snapshot) -> bool {
        self.bindings.ptr_eq(&other.bindings)
    }

    /// Runs a function in a fresh context seeded from this snapshot.
    ///
    /// Writes made by `f` stay inside that context and never affect this
    /// snapshot.  Because snapshots are `Send` this is the way to carry a
    /// flow into another thread.
    ///
    /// ## Example
    ///
    /// ```
    /// # use std::thread;
    /// # use context_vars::{Context, Registry};
    /// let registry = Registry::new();
    /// let user = registry.declare::<String>("user");
    /// let mut ctx = Context::new();
    /// let _token = ctx.set(&user, "mitsuhiko".to_string());
    ///
    /// let snapshot = ctx.copy_active();
    /// thread::spawn(move || {
    ///     snapshot.run(|ctx| {
    ///         assert_eq!(*ctx.get(&user).unwrap(), "mitsuhiko");
    ///     });
    /// }).join().unwrap();
    /// ```
    pub fn run<F: FnOnce(&mut Context) -> R, R>(&self, f: F) -> R {
        let mut ctx = Context::from_snapshot(self.clone());
        f(&mut ctx)
    }
}
