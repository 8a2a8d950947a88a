use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_REGISTRY_ID: AtomicU64 = AtomicU64::new(1);

/// The identity of a context variable.
///
/// Identities are never reused: two variables declared separately compare
/// unequal even if they share a name and a type.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct VarId {
    registry: u64,
    index: u64,
}

impl fmt::Display for VarId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.registry, self.index)
    }
}

struct RegistryInner {
    id: u64,
    next_index: AtomicU64,
}

/// Hands out context variables.
///
/// A registry is an explicit object rather than a global table.  It can be
/// cloned and shared between threads; all clones allocate from the same
/// identity space and declaring a variable never touches any snapshot.
///
/// ```
/// # use context_vars::Registry;
/// let registry = Registry::new();
/// let a = registry.declare::<u32>("counter");
/// let b = registry.declare::<u32>("counter");
/// assert_ne!(a.id(), b.id());
/// ```
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl Default for Registry {
    fn default() -> Registry {
        Registry::new()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Registry")
            .field("id", &self.inner.id)
            .field("declared", &self.declared())
            .finish()
    }
}

impl Registry {
    /// Creates a registry with its own identity space.
    pub fn new() -> Registry {
        Registry {
            inner: Arc::new(RegistryInner {
                id: NEXT_REGISTRY_ID.fetch_add(1, Ordering::Relaxed),
                next_index: AtomicU64::new(0),
            }),
        }
    }

    /// Declares a variable without a default.
    ///
    /// Reading it before it was set fails with `ContextError::NotBound`.
    pub fn declare<T: Send + Sync + 'static>(&self, name: &str) -> ContextVar<T> {
        self.make_var(name, None)
    }

    /// Declares a variable that reads as `default` until it is set.
    pub fn declare_with_default<T: Send + Sync + 'static>(
        &self,
        name: &str,
        default: T,
    ) -> ContextVar<T> {
        self.make_var(name, Some(Arc::new(default)))
    }

    /// The number of variables declared so far through this registry.
    pub fn declared(&self) -> u64 {
        self.inner.next_index.load(Ordering::Relaxed)
    }

    fn make_var<T>(&self, name: &str, default: Option<Arc<T>>) -> ContextVar<T> {
        let id = VarId {
            registry: self.inner.id,
            index: self.inner.next_index.fetch_add(1, Ordering::Relaxed),
        };
        tracing::trace!(var = %name, id = %id, "declared context variable");
        ContextVar {
            id,
            name: Arc::from(name),
            default,
        }
    }
}

/// A typed handle to one slot of context-local state.
///
/// The handle itself holds no value; values live in snapshots.  The name
/// is only used for diagnostics.
pub struct ContextVar<T> {
    id: VarId,
    name: Arc<str>,
    default: Option<Arc<T>>,
}

impl<T> Clone for ContextVar<T> {
    fn clone(&self) -> ContextVar<T> {
        ContextVar {
            id: self.id,
            name: self.name.clone(),
            default: self.default.clone(),
        }
    }
}

impl<T> fmt::Debug for ContextVar<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ContextVar")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("has_default", &self.default.is_some())
            .finish()
    }
}

impl<T> ContextVar<T> {
    pub fn id(&self) -> VarId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn shared_name(&self) -> &Arc<str> {
        &self.name
    }

    /// The declared default, if any.
    pub fn default_value(&self) -> Option<Arc<T>> {
        self.default.clone()
    }
}
