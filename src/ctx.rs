use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::panic;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{ContextError, TokenRejection};
use crate::snapshot::{Binding, Snapshot, Stamp};
use crate::var::{ContextVar, VarId};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies one activation of a [`Context`].
///
/// A context gets a fresh id when it is created and for the duration of
/// every `run_with` call.  Tokens remember the id they were issued under.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct ContextId(u64);

impl ContextId {
    fn next() -> ContextId {
        ContextId(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ctx#{}", self.0)
    }
}

/// The active context of one task.
///
/// This is the only mutable piece of the system: a pointer to the snapshot
/// currently in effect.  It is owned by exactly one task and every write
/// swaps in a newly derived snapshot.  Snapshots handed out earlier, for
/// instance to spawned children, are never affected.
///
/// A context is not `Clone`.  To branch off a flow take a snapshot with
/// [`copy_active`](Context::copy_active) and seed a new context from it.
pub struct Context {
    id: ContextId,
    current: Snapshot,
}

impl Default for Context {
    fn default() -> Context {
        Context::new()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("bindings", &self.current.len())
            .finish()
    }
}

/// A capability to undo exactly one `set`.
///
/// Tokens are returned by [`Context::set`] and consumed by
/// [`Context::reset`].  Dropping a token is fine; the previous value is
/// then simply never restored.
#[must_use = "a token is needed to restore the previous value"]
pub struct Token<T> {
    var: VarId,
    name: Arc<str>,
    context: ContextId,
    stamp: Stamp,
    prior: Option<Binding>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> fmt::Debug for Token<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Token")
            .field("var", &self.name)
            .field("context", &self.context)
            .field("had_prior_value", &self.prior.is_some())
            .finish()
    }
}

impl<T> Token<T> {
    /// The variable this token was issued for.
    pub fn var_id(&self) -> VarId {
        self.var
    }

    pub fn var_name(&self) -> &str {
        &self.name
    }

    /// The context activation the token belongs to.
    pub fn context_id(&self) -> ContextId {
        self.context
    }

    fn reject(&self, reason: TokenRejection) -> ContextError {
        ContextError::InvalidToken {
            name: self.name.to_string(),
            reason,
        }
    }
}

impl<T: Send + Sync + 'static> Token<T> {
    /// The value the variable was bound to before the `set` that created
    /// this token, or `None` if it was unbound.
    pub fn old_value(&self) -> Option<Arc<T>> {
        self.prior.as_ref().and_then(|binding| binding.downcast())
    }
}

impl Context {
    /// Creates a context with no bindings.
    pub fn new() -> Context {
        Context::from_snapshot(Snapshot::empty())
    }

    /// Creates a context that starts out with `snapshot` in effect.
    pub fn from_snapshot(snapshot: Snapshot) -> Context {
        Context {
            id: ContextId::next(),
            current: snapshot,
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Returns the value of `var`.
    ///
    /// Falls back to the declared default if the variable is not bound and
    /// fails with `ContextError::NotBound` if there is no default either.
    pub fn get<T: Send + Sync + 'static>(
        &self,
        var: &ContextVar<T>,
    ) -> Result<Arc<T>, ContextError> {
        self.current
            .lookup(var)
            .or_else(|| var.default_value())
            .ok_or_else(|| ContextError::NotBound {
                name: var.name().to_string(),
            })
    }

    /// Like `get` but returns `fallback` instead of failing.
    ///
    /// A declared default still takes precedence: `fallback` is only used
    /// when `var` is neither bound nor declared with a default.
    pub fn get_or<T: Send + Sync + 'static>(&self, var: &ContextVar<T>, fallback: T) -> Arc<T> {
        match self.get(var) {
            Ok(value) => value,
            Err(_) => Arc::new(fallback),
        }
    }

    /// Binds `var` to `value`.
    ///
    /// The returned token restores the previous state when passed to
    /// `reset`.  Tokens have to be reset in reverse order of creation for
    /// any one variable.
    pub fn set<T: Send + Sync + 'static>(&mut self, var: &ContextVar<T>, value: T) -> Token<T> {
        let prior = self.current.binding(var.id()).cloned();
        let stamp = Stamp::next();
        self.current = self.current.with_binding(
            var.id(),
            Binding {
                value: Arc::new(value),
                stamp,
            },
        );
        tracing::trace!(var = %var.name(), context = %self.id, "set context variable");
        Token {
            var: var.id(),
            name: var.shared_name().clone(),
            context: self.id,
            stamp,
            prior,
            _marker: PhantomData,
        }
    }

    /// Undoes the `set` that produced `token`.
    ///
    /// The variable goes back to its previous value, or becomes unbound if
    /// it was unbound before.  Fails with `ContextError::InvalidToken` if
    /// the token comes from another context or if its change is not the
    /// latest one still in effect for the variable.
    pub fn reset<T>(&mut self, token: Token<T>) -> Result<(), ContextError> {
        if token.context != self.id {
            return Err(token.reject(TokenRejection::ForeignContext));
        }
        match self.current.binding(token.var) {
            Some(binding) if binding.stamp == token.stamp => {}
            _ => return Err(token.reject(TokenRejection::Superseded)),
        }
        self.current = match token.prior {
            Some(prior) => self.current.with_binding(token.var, prior),
            None => self.current.without(token.var),
        };
        tracing::trace!(var = %token.name, context = %self.id, "reset context variable");
        Ok(())
    }

    /// Binds `var` to `value` for the duration of `f`.
    ///
    /// The binding is reset afterwards, also when `f` panics.  An error is
    /// returned if `f` left a later binding of `var` in place.
    pub fn scoped<T, F, R>(
        &mut self,
        var: &ContextVar<T>,
        value: T,
        f: F,
    ) -> Result<R, ContextError>
    where
        T: Send + Sync + 'static,
        F: FnOnce(&mut Context) -> R,
    {
        let token = self.set(var, value);
        let rv = panic::catch_unwind(panic::AssertUnwindSafe(|| f(&mut *self)));
        let reset = self.reset(token);
        match rv {
            Err(err) => panic::resume_unwind(err),
            Ok(rv) => reset.map(|()| rv),
        }
    }

    /// Returns the snapshot currently in effect.
    ///
    /// This never copies any bindings.  Writes made afterwards are not
    /// reflected in the returned snapshot.
    pub fn copy_active(&self) -> Snapshot {
        self.current.clone()
    }

    /// Runs a function as if `snapshot` was the active snapshot.
    ///
    /// Everything `f` reads comes from `snapshot` and whatever `f` writes is
    /// discarded once it returns, at which point the previous snapshot is
    /// active again.  This also happens if `f` panics.
    ///
    /// ## Example
    ///
    /// ```
    /// # use context_vars::{Context, Registry};
    /// let registry = Registry::new();
    /// let level = registry.declare_with_default("level", 0u32);
    /// let mut ctx = Context::new();
    ///
    /// let before = ctx.copy_active();
    /// let _token = ctx.set(&level, 1);
    /// ctx.run_with(before, |ctx| {
    ///     assert_eq!(*ctx.get(&level).unwrap(), 0);
    ///     let _inner = ctx.set(&level, 2);
    /// });
    /// assert_eq!(*ctx.get(&level).unwrap(), 1);
    /// ```
    pub fn run_with<F: FnOnce(&mut Context) -> R, R>(&mut self, snapshot: Snapshot, f: F) -> R {
        self.run_and_capture(snapshot, f).0
    }

    /// Like `run_with` but also returns the snapshot that was active when
    /// `f` returned.
    pub fn run_and_capture<F: FnOnce(&mut Context) -> R, R>(
        &mut self,
        snapshot: Snapshot,
        f: F,
    ) -> (R, Snapshot) {
        let outer_id = mem::replace(&mut self.id, ContextId::next());
        let outer = mem::replace(&mut self.current, snapshot);

        // a panic must not leave the borrowed snapshot installed, so catch
        // it, restore and resume.
        let rv = panic::catch_unwind(panic::AssertUnwindSafe(|| f(&mut *self)));
        self.id = outer_id;
        let finished = mem::replace(&mut self.current, outer);
        match rv {
            Err(err) => panic::resume_unwind(err),
            Ok(rv) => (rv, finished),
        }
    }
}
