//! Read/write lock around the live snapshot, with writer bookkeeping for the
//! liveness watchdog.
//!
//! Readers take the shared lock just long enough to clone a snapshot handle.
//! Writers register who they are, where they acquired the lock (a captured
//! backtrace) and a [`CancellationToken`] the [`Watchdog`] can fire if the
//! writer appears stuck. Interruption is cooperative: the owner has to notice
//! the cancelled token and drop its guard.

pub mod watchdog;

use std::backtrace::Backtrace;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio_util::sync::CancellationToken;

use crate::error::{RecoError, Result};

pub use watchdog::Watchdog;

#[derive(Clone)]
struct WriteOwner {
    id: u64,
    label: String,
    acquired_at: Instant,
    backtrace: Arc<Backtrace>,
    cancel: CancellationToken,
}

/// What the watchdog knows about the current writer.
#[derive(Clone)]
pub struct OwnerReport {
    pub label: String,
    pub held_for: Duration,
    /// Call stack captured when the write lock was acquired.
    pub backtrace: Arc<Backtrace>,
}

impl fmt::Debug for OwnerReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnerReport")
            .field("label", &self.label)
            .field("held_for", &self.held_for)
            .finish_non_exhaustive()
    }
}

pub struct ManagedLock<T> {
    name: String,
    inner: RwLock<T>,
    owner: Mutex<Option<WriteOwner>>,
    next_owner_id: AtomicU64,
}

impl<T> ManagedLock<T> {
    pub fn new(name: impl Into<String>, value: T) -> Self {
        Self {
            name: name.into(),
            inner: RwLock::new(value),
            owner: Mutex::new(None),
            next_owner_id: AtomicU64::new(1),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, T> {
        self.inner.read().await
    }

    /// Shared acquisition that gives up as soon as `cancel` fires.
    pub async fn read_interruptible(
        &self,
        cancel: &CancellationToken,
    ) -> Result<RwLockReadGuard<'_, T>> {
        tokio::select! {
            guard = self.inner.read() => Ok(guard),
            _ = cancel.cancelled() => Err(RecoError::Interrupted(format!(
                "waiting for read lock on {}", self.name
            ))),
        }
    }

    pub fn try_read(&self) -> Option<RwLockReadGuard<'_, T>> {
        self.inner.try_read().ok()
    }

    /// Exclusive acquisition. The caller becomes the registered owner until the
    /// guard drops; `cancel` is both the abandon signal while waiting and the
    /// token the watchdog fires while holding.
    pub async fn write(
        &self,
        label: impl Into<String>,
        cancel: &CancellationToken,
    ) -> Result<ManagedWriteGuard<'_, T>> {
        let guard = tokio::select! {
            guard = self.inner.write() => guard,
            _ = cancel.cancelled() => {
                return Err(RecoError::Interrupted(format!(
                    "waiting for write lock on {}", self.name
                )));
            }
        };

        let id = self.next_owner_id.fetch_add(1, Ordering::Relaxed);
        let label = label.into();
        tracing::trace!(lock = %self.name, owner = %label, "Write lock acquired");
        *self.owner_slot() = Some(WriteOwner {
            id,
            label,
            acquired_at: Instant::now(),
            backtrace: Arc::new(Backtrace::force_capture()),
            cancel: cancel.clone(),
        });

        Ok(ManagedWriteGuard {
            guard,
            lock: self,
            id,
            cancel: cancel.clone(),
        })
    }

    pub fn is_write_locked(&self) -> bool {
        self.owner_slot().is_some()
    }

    pub fn owner(&self) -> Option<OwnerReport> {
        self.owner_slot().as_ref().map(WriteOwner::report)
    }

    /// Fire the current owner's cancellation token. Returns what was interrupted.
    pub fn interrupt_owner(&self) -> Option<OwnerReport> {
        let slot = self.owner_slot();
        let owner = slot.as_ref()?;
        owner.cancel.cancel();
        Some(owner.report())
    }

    fn owner_slot(&self) -> MutexGuard<'_, Option<WriteOwner>> {
        self.owner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, id: u64) {
        let mut slot = self.owner_slot();
        if slot.as_ref().is_some_and(|o| o.id == id) {
            *slot = None;
        }
    }
}

impl WriteOwner {
    fn report(&self) -> OwnerReport {
        OwnerReport {
            label: self.label.clone(),
            held_for: self.acquired_at.elapsed(),
            backtrace: self.backtrace.clone(),
        }
    }
}

/// Exclusive access to the protected value; clears the owner record on drop.
pub struct ManagedWriteGuard<'a, T> {
    guard: RwLockWriteGuard<'a, T>,
    lock: &'a ManagedLock<T>,
    id: u64,
    cancel: CancellationToken,
}

impl<T> ManagedWriteGuard<'_, T> {
    /// True once the watchdog (or shutdown) asked this owner to let go.
    pub fn is_interrupted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when this owner is asked to let go.
    pub async fn interrupted(&self) {
        self.cancel.cancelled().await
    }
}

impl<T> Deref for ManagedWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for ManagedWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for ManagedWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_registers_and_clears_owner() {
        let lock = ManagedLock::new("test", 0u32);
        let cancel = CancellationToken::new();
        {
            let mut guard = lock.write("unit-test", &cancel).await.unwrap();
            *guard += 1;
            let owner = lock.owner().unwrap();
            assert_eq!(owner.label, "unit-test");
            assert!(lock.try_read().is_none());
        }
        assert!(!lock.is_write_locked());
        assert_eq!(*lock.read().await, 1);
    }

    #[tokio::test]
    async fn interrupt_owner_cancels_its_token() {
        let lock = ManagedLock::new("test", ());
        let cancel = CancellationToken::new();
        let guard = lock.write("holder", &cancel).await.unwrap();
        assert!(!guard.is_interrupted());

        let report = lock.interrupt_owner().unwrap();
        assert_eq!(report.label, "holder");
        assert!(guard.is_interrupted());
        drop(guard);
        assert!(lock.interrupt_owner().is_none());
    }

    #[tokio::test]
    async fn cancelled_write_wait_returns_interrupted() {
        let lock = ManagedLock::new("test", ());
        let _reader = lock.read().await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = lock.write("blocked", &cancel).await.err().unwrap();
        assert!(matches!(err, RecoError::Interrupted(_)));
        assert!(!lock.is_write_locked());
    }

    #[tokio::test]
    async fn cancelled_read_wait_returns_interrupted() {
        let lock = ManagedLock::new("test", ());
        let holder = CancellationToken::new();
        let _guard = lock.write("holder", &holder).await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(lock.read_interruptible(&cancel).await.is_err());
    }
}
