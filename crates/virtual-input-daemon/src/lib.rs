//! virtual-input engine
//!
//! Translates raw key transitions from physical or remote sources into
//! logical key actions: per-table code translation, modifier reference
//! counting, software key repeat, subscriber notification and per-session
//! post-lookup remapping. Actions are delivered to a uinput keyboard or to
//! remote sessions over a Unix socket.

pub mod action;
pub mod backend;
pub mod context;
pub mod error;
pub mod keymap;
pub mod link;
pub mod modifier;
pub mod notify;
pub mod post_lookup;
pub mod protocol;
pub mod repeat;
pub mod router;
pub mod source;

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub use action::KeyAction;
pub use backend::KeySink;
pub use context::InputContext;
pub use error::{BackendError, InputError};
pub use notify::{KeyFilter, KeyListener};
pub use router::EventRouter;

// Lock helpers that recover the guard of a poisoned lock

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
