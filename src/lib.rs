//! This crate implements context variables for Rust.  A context variable
//! carries data through a logical flow of execution (a task) and survives
//! the task being suspended and resumed, without leaking into other tasks.
//!
//! It follows the model of Python's `contextvars` but makes every moving
//! part explicit:
//!
//! *   Variables are declared through a [`Registry`] object and identified by
//!     typed [`ContextVar`] handles instead of living in a global table.
//! *   All bindings visible to a task form an immutable [`Snapshot`].  Writes
//!     derive a new snapshot from a persistent hash trie, so capturing the
//!     state of a flow is a reference count bump and not a copy.
//! *   The snapshot in effect for a task is held by a [`Context`], which the
//!     task owns.  Nothing is looked up through thread locals, which means
//!     a task can move between threads freely.
//! *   Every `set` returns a [`Token`] that undoes exactly that write.
//!     Tokens for one variable have to be reset in reverse order.
//! *   A scheduler drives the engine through a [`TaskTable`]: it reports task
//!     starts and spawns, and children inherit the parent's snapshot at the
//!     instant of the spawn.
//!
//! # Example Usage
//!
//! ```
//! use context_vars::{Context, Registry};
//! use std::thread;
//!
//! let registry = Registry::new();
//! let locale = registry.declare_with_default("locale", String::from("en_US"));
//!
//! let mut ctx = Context::new();
//! println!("the current locale is {}", ctx.get(&locale).unwrap());
//! let token = ctx.set(&locale, "de_DE".into());
//! println!("changing locale to {}", ctx.get(&locale).unwrap());
//!
//! let snapshot = ctx.copy_active();
//! let child_locale = locale.clone();
//! thread::spawn(move || {
//!     snapshot.run(|ctx| {
//!         println!("the locale in the child thread is {}", ctx.get(&child_locale).unwrap());
//!         let _ = ctx.set(&child_locale, "fr_FR".into());
//!         println!("the new locale in the child thread is {}", ctx.get(&child_locale).unwrap());
//!     });
//! }).join().unwrap();
//!
//! println!("the locale of the parent thread is again {}", ctx.get(&locale).unwrap());
//! ctx.reset(token).unwrap();
//! assert_eq!(*ctx.get(&locale).unwrap(), "en_US");
//! ```
//!
//! This example will give the following output:
//!
//! ```plain
//! the current locale is en_US
//! changing locale to de_DE
//! the locale in the child thread is de_DE
//! the new locale in the child thread is fr_FR
//! the locale of the parent thread is again de_DE
//! ```
#[macro_use]
extern crate lazy_static;

mod ctx;
mod error;
mod hamt;
mod snapshot;
mod task;
mod var;

pub use ctx::*;
pub use error::*;
pub use hamt::*;
pub use snapshot::Snapshot;
pub use task::*;
pub use var::*;
