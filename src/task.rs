use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::panic;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::ctx::Context;
use crate::error::ContextError;
use crate::snapshot::Snapshot;

fn unknown_task<Id: fmt::Debug>(task: &Id) -> ContextError {
    ContextError::UnknownTask {
        task: format!("{:?}", task),
    }
}

fn running_task<Id: fmt::Debug>(task: &Id) -> ContextError {
    ContextError::TaskRunning {
        task: format!("{:?}", task),
    }
}

#[derive(Debug)]
enum Slot {
    Parked(Context),
    /// The context is checked out by whoever runs the task.
    Running,
}

impl Slot {
    fn into_parked(self) -> Option<Context> {
        match self {
            Slot::Parked(ctx) => Some(ctx),
            Slot::Running => None,
        }
    }
}

/// Connects a scheduler to the context engine.
///
/// The scheduler reports when tasks start, spawn children and finish; the
/// table keeps one [`Context`] per live task.  It makes no scheduling
/// decisions of its own.
///
/// ```
/// # use context_vars::{Registry, Snapshot, TaskTable};
/// let registry = Registry::new();
/// let request = registry.declare::<&'static str>("request");
///
/// let mut tasks = TaskTable::new();
/// tasks.on_task_start(1, Snapshot::empty());
/// tasks
///     .enter(&1, |task| {
///         let _ = task.set(&request, "req-1");
///         task.spawn(2);
///         let _ = task.set(&request, "req-1b");
///     })
///     .unwrap();
///
/// let seen = tasks.enter(&2, |task| task.get(&request)).unwrap().unwrap();
/// assert_eq!(*seen, "req-1");
/// ```
pub struct TaskTable<Id> {
    slots: HashMap<Id, Slot>,
}

impl<Id: Hash + Eq> Default for TaskTable<Id> {
    fn default() -> TaskTable<Id> {
        TaskTable {
            slots: HashMap::new(),
        }
    }
}

impl<Id: fmt::Debug> fmt::Debug for TaskTable<Id> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_map().entries(self.slots.iter()).finish()
    }
}

impl<Id: Hash + Eq + fmt::Debug> TaskTable<Id> {
    pub fn new() -> TaskTable<Id> {
        TaskTable::default()
    }

    /// Installs `snapshot` as the active context of `task`.
    ///
    /// If the task already had a parked context it is replaced and returned.
    pub fn on_task_start(&mut self, task: Id, snapshot: Snapshot) -> Option<Context> {
        tracing::debug!(task = ?task, bindings = snapshot.len(), "task started");
        let slot = Slot::Parked(Context::from_snapshot(snapshot));
        self.slots.insert(task, slot).and_then(Slot::into_parked)
    }

    /// Returns the snapshot a child of the parked task `parent` starts with.
    ///
    /// This is the parent's active snapshot at this instant.  Nothing is
    /// copied, and later writes on either side stay invisible to the other.
    /// A running parent spawns through [`TaskScope::spawn`] instead; asking
    /// for it here fails with `ContextError::TaskRunning`.
    pub fn on_task_spawn(&self, parent: &Id) -> Result<Snapshot, ContextError> {
        match self.slots.get(parent) {
            Some(&Slot::Parked(ref ctx)) => {
                tracing::debug!(parent = ?parent, "task spawned");
                Ok(ctx.copy_active())
            }
            Some(&Slot::Running) => Err(running_task(parent)),
            None => Err(unknown_task(parent)),
        }
    }

    /// Like `on_task_spawn` but the child starts a new flow from an empty
    /// snapshot instead of inheriting the parent's bindings.
    pub fn on_task_spawn_detached(&self, parent: &Id) -> Result<Snapshot, ContextError> {
        if !self.slots.contains_key(parent) {
            return Err(unknown_task(parent));
        }
        tracing::debug!(parent = ?parent, "task spawned without flow");
        Ok(Snapshot::empty())
    }

    /// Forgets the context of a finished or cancelled task.
    ///
    /// A task that is running when it exits loses its context once it is
    /// handed back.
    pub fn on_task_exit(&mut self, task: &Id) -> Option<Context> {
        let slot = self.slots.remove(task)?;
        tracing::debug!(task = ?task, "task exited");
        slot.into_parked()
    }

    /// Runs `f` as `task`.
    ///
    /// `f` gets a [`TaskScope`] that derefs to the task's context and spawns
    /// children from it.  The context is handed back afterwards, also when
    /// `f` panics.
    pub fn enter<F, R>(&mut self, task: &Id, f: F) -> Result<R, ContextError>
    where
        F: FnOnce(&mut TaskScope<'_, Id>) -> R,
    {
        let mut ctx = self.checkout(task)?;
        let rv = panic::catch_unwind(panic::AssertUnwindSafe(|| {
            let mut scope = TaskScope {
                task,
                ctx: &mut ctx,
                spawner: Spawner::Local(&mut *self),
            };
            f(&mut scope)
        }));
        self.park(task, ctx);
        match rv {
            Err(err) => panic::resume_unwind(err),
            Ok(rv) => Ok(rv),
        }
    }

    /// The context of a parked task.
    pub fn context(&self, task: &Id) -> Option<&Context> {
        match self.slots.get(task) {
            Some(&Slot::Parked(ref ctx)) => Some(ctx),
            _ => None,
        }
    }

    pub fn context_mut(&mut self, task: &Id) -> Option<&mut Context> {
        match self.slots.get_mut(task) {
            Some(&mut Slot::Parked(ref mut ctx)) => Some(ctx),
            _ => None,
        }
    }

    /// Takes the context of `task` out of the table, for instance to run
    /// the task on a worker thread.  The task counts as running until the
    /// context is handed back with `checkin`.
    pub fn checkout(&mut self, task: &Id) -> Result<Context, ContextError> {
        match self.slots.get_mut(task) {
            Some(slot) => match mem::replace(slot, Slot::Running) {
                Slot::Parked(ctx) => Ok(ctx),
                Slot::Running => Err(running_task(task)),
            },
            None => Err(unknown_task(task)),
        }
    }

    /// Puts a context taken with `checkout` back.
    pub fn checkin(&mut self, task: Id, ctx: Context) {
        self.slots.insert(task, Slot::Parked(ctx));
    }

    /// Hands a running task's context back unless the task exited meanwhile.
    fn park(&mut self, task: &Id, ctx: Context) {
        if let Some(slot) = self.slots.get_mut(task) {
            *slot = Slot::Parked(ctx);
        }
    }

    pub fn contains(&self, task: &Id) -> bool {
        self.slots.contains_key(task)
    }

    /// Checks if the context of `task` is currently checked out.
    pub fn is_running(&self, task: &Id) -> bool {
        matches!(self.slots.get(task), Some(&Slot::Running))
    }

    /// Number of live tasks, running ones included.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// A [`TaskTable`] that can be shared between scheduler worker threads.
///
/// The lock only guards the table itself.  While a task runs through
/// [`enter`](SharedTaskTable::enter) its context is checked out, so the
/// task's own code never holds the lock and other workers are not blocked.
pub struct SharedTaskTable<Id> {
    inner: Arc<Mutex<TaskTable<Id>>>,
}

impl<Id> Clone for SharedTaskTable<Id> {
    fn clone(&self) -> SharedTaskTable<Id> {
        SharedTaskTable {
            inner: self.inner.clone(),
        }
    }
}

impl<Id: Hash + Eq> Default for SharedTaskTable<Id> {
    fn default() -> SharedTaskTable<Id> {
        SharedTaskTable {
            inner: Arc::new(Mutex::new(TaskTable::default())),
        }
    }
}

impl<Id: Hash + Eq + fmt::Debug> fmt::Debug for SharedTaskTable<Id> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SharedTaskTable")
            .field("tasks", &self.len())
            .finish()
    }
}

impl<Id: Hash + Eq + fmt::Debug> SharedTaskTable<Id> {
    pub fn new() -> SharedTaskTable<Id> {
        SharedTaskTable::default()
    }

    pub fn on_task_start(&self, task: Id, snapshot: Snapshot) -> Option<Context> {
        self.inner.lock().on_task_start(task, snapshot)
    }

    pub fn on_task_spawn(&self, parent: &Id) -> Result<Snapshot, ContextError> {
        self.inner.lock().on_task_spawn(parent)
    }

    pub fn on_task_spawn_detached(&self, parent: &Id) -> Result<Snapshot, ContextError> {
        self.inner.lock().on_task_spawn_detached(parent)
    }

    pub fn on_task_exit(&self, task: &Id) -> Option<Context> {
        self.inner.lock().on_task_exit(task)
    }

    pub fn checkout(&self, task: &Id) -> Result<Context, ContextError> {
        self.inner.lock().checkout(task)
    }

    pub fn checkin(&self, task: Id, ctx: Context) {
        self.inner.lock().checkin(task, ctx)
    }

    /// Runs `f` as `task` without holding the lock.
    ///
    /// Works like [`TaskTable::enter`]; other workers can start, spawn and
    /// run unrelated tasks in the meantime.
    pub fn enter<F, R>(&self, task: Id, f: F) -> Result<R, ContextError>
    where
        F: FnOnce(&mut TaskScope<'_, Id>) -> R,
    {
        let mut ctx = self.checkout(&task)?;
        let rv = panic::catch_unwind(panic::AssertUnwindSafe(|| {
            let mut scope = TaskScope {
                task: &task,
                ctx: &mut ctx,
                spawner: Spawner::Shared(self),
            };
            f(&mut scope)
        }));
        self.inner.lock().park(&task, ctx);
        match rv {
            Err(err) => panic::resume_unwind(err),
            Ok(rv) => Ok(rv),
        }
    }

    /// Snapshot of the active context of `task`, if it is parked.
    pub fn snapshot(&self, task: &Id) -> Option<Snapshot> {
        self.inner.lock().context(task).map(Context::copy_active)
    }

    pub fn contains(&self, task: &Id) -> bool {
        self.inner.lock().contains(task)
    }

    pub fn is_running(&self, task: &Id) -> bool {
        self.inner.lock().is_running(task)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

enum Spawner<'a, Id> {
    Local(&'a mut TaskTable<Id>),
    Shared(&'a SharedTaskTable<Id>),
}

/// A task while it runs.
///
/// Derefs to the task's [`Context`].  Children spawned through the scope
/// start from the task's snapshot at the instant of the spawn, so writes
/// the task makes afterwards never reach them.
pub struct TaskScope<'a, Id> {
    task: &'a Id,
    ctx: &'a mut Context,
    spawner: Spawner<'a, Id>,
}

impl<'a, Id> Deref for TaskScope<'a, Id> {
    type Target = Context;

    fn deref(&self) -> &Context {
        &*self.ctx
    }
}

impl<'a, Id> DerefMut for TaskScope<'a, Id> {
    fn deref_mut(&mut self) -> &mut Context {
        &mut *self.ctx
    }
}

impl<'a, Id: fmt::Debug> fmt::Debug for TaskScope<'a, Id> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TaskScope")
            .field("task", self.task)
            .field("context", &*self.ctx)
            .finish()
    }
}

impl<'a, Id: Hash + Eq + fmt::Debug> TaskScope<'a, Id> {
    /// The running task.
    pub fn task(&self) -> &Id {
        self.task
    }

    /// Starts `child` with the current snapshot of this task and returns
    /// that snapshot.
    pub fn spawn(&mut self, child: Id) -> Snapshot {
        tracing::debug!(parent = ?self.task, child = ?child, "task spawned");
        let snapshot = self.ctx.copy_active();
        self.start(child, snapshot.clone());
        snapshot
    }

    /// Starts `child` from the empty snapshot.
    pub fn spawn_detached(&mut self, child: Id) {
        tracing::debug!(parent = ?self.task, child = ?child, "task spawned without flow");
        self.start(child, Snapshot::empty());
    }

    fn start(&mut self, child: Id, snapshot: Snapshot) {
        match self.spawner {
            Spawner::Local(ref mut table) => table.on_task_start(child, snapshot),
            Spawner::Shared(table) => table.on_task_start(child, snapshot),
        };
    }
}
