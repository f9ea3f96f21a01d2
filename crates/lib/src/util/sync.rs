//! Lock helpers.
//!
//! A panic while a guard is held must not wedge every other worker, so these
//! helpers recover the guard from a poisoned lock instead of propagating the
//! poison. Package mutations are only ever committed as a whole, which keeps
//! the protected data consistent even when a holder unwinds.

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
  lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
  lock.write().unwrap_or_else(PoisonError::into_inner)
}
