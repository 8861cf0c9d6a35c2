use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use crate::{
    error::{CallSite, HeapError, RecursiveLockSnafu},
    platform::{ContextId, ExecContext},
};

/// Holder value while nobody owns the lock.
const NO_HOLDER: usize = usize::MAX;

/// Mutual exclusion for the segment list.
///
/// Contended callers yield through [`ExecContext::yield_now`] instead of
/// spinning. The lock remembers which context holds it and where it was
/// taken, so a context that tries to take it a second time is reported
/// instead of waiting forever.
#[derive(Debug)]
pub(crate) struct HeapLock<T> {
    locked: AtomicBool,
    holder: AtomicUsize,
    data: UnsafeCell<T>,
    // written and read only by the holder
    locked_at: UnsafeCell<Option<CallSite>>,
}

unsafe impl<T> Sync for HeapLock<T> where T: Send {}
unsafe impl<T> Send for HeapLock<T> where T: Send {}

impl<T> HeapLock<T> {
    pub(crate) const fn new(data: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            holder: AtomicUsize::new(NO_HOLDER),
            data: UnsafeCell::new(data),
            locked_at: UnsafeCell::new(None),
        }
    }

    /// Acquires the lock on behalf of the context running `ctx`.
    ///
    /// `caller` is recorded as the place the lock was taken.
    pub(crate) fn lock<C>(&self, ctx: &C, caller: CallSite) -> Result<HeapLockGuard<'_, T>, HeapError>
    where
        C: ExecContext,
    {
        let me = ctx.current_context();
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            if self.holder() == Some(me) {
                // we are the holder, so reading `locked_at` does not race
                let taken_at = unsafe { *self.locked_at.get() };
                return RecursiveLockSnafu {
                    holder: me,
                    taken_at: taken_at.unwrap_or(caller),
                }
                .fail();
            }
            ctx.yield_now();
        }

        self.holder.store(me.value(), Ordering::Relaxed);
        unsafe {
            *self.locked_at.get() = Some(caller);
        }

        Ok(HeapLockGuard { lock: self })
    }

    /// Context currently holding the lock.
    pub(crate) fn holder(&self) -> Option<ContextId> {
        match self.holder.load(Ordering::Relaxed) {
            NO_HOLDER => None,
            id => Some(ContextId::new(id)),
        }
    }

    /// Whether the lock is taken by anyone.
    pub(crate) fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
pub(crate) struct HeapLockGuard<'a, T> {
    lock: &'a HeapLock<T>,
}

impl<T> Drop for HeapLockGuard<'_, T> {
    fn drop(&mut self) {
        assert!(
            self.lock.is_locked(),
            "HeapLockGuard dropped without holding the lock"
        );
        unsafe {
            *self.lock.locked_at.get() = None;
        }
        self.lock.holder.store(NO_HOLDER, Ordering::Relaxed);
        self.lock.locked.store(false, Ordering::Release);
    }
}

impl<T> Deref for HeapLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for HeapLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.lock.data.get() }
    }
}
