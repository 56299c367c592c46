//! Shared and exclusive locking over one semaphore: a reader takes one unit,
//! a writer takes all of them. Both wait in the same line, so a queued
//! writer holds back the readers arriving after it.
use crate::error::Result;
use crate::sync::semaphore::{get_units, try_get_units, Semaphore, SemaphoreUnits};
use std::cell::{Ref, RefCell, RefMut};
use std::fmt;
use std::future::Future;
use std::ops::{Deref, DerefMut};

const ALL: usize = Semaphore::MAX_UNITS;

/// A read-write lock for tasks of one core, held across await points.
pub struct RwLock<T> {
    sem: Semaphore,
    value: RefCell<T>,
}

// Field order matters: the borrow ends before the units go back.
pub struct RwLockReadGuard<'a, T> {
    value: Ref<'a, T>,
    _units: SemaphoreUnits,
}

pub struct RwLockWriteGuard<'a, T> {
    value: RefMut<'a, T>,
    _units: SemaphoreUnits,
}

impl<T> RwLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            sem: Semaphore::new(ALL),
            value: RefCell::new(value),
        }
    }

    pub async fn read(&self) -> Result<RwLockReadGuard<'_, T>> {
        let units = get_units(&self.sem, 1).await?;
        Ok(RwLockReadGuard {
            value: self.value.borrow(),
            _units: units,
        })
    }

    pub async fn write(&self) -> Result<RwLockWriteGuard<'_, T>> {
        let units = get_units(&self.sem, ALL).await?;
        Ok(RwLockWriteGuard {
            value: self.value.borrow_mut(),
            _units: units,
        })
    }

    pub fn try_read(&self) -> Option<RwLockReadGuard<'_, T>> {
        let units = try_get_units(&self.sem, 1)?;
        Some(RwLockReadGuard {
            value: self.value.borrow(),
            _units: units,
        })
    }

    pub fn try_write(&self) -> Option<RwLockWriteGuard<'_, T>> {
        let units = try_get_units(&self.sem, ALL)?;
        Some(RwLockWriteGuard {
            value: self.value.borrow_mut(),
            _units: units,
        })
    }

    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }
}

impl<T: Default> Default for RwLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> fmt::Debug for RwLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RwLock").field("sem", &self.sem).finish()
    }
}

impl<T> Deref for RwLockReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> Deref for RwLockWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> DerefMut for RwLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

/// A lock without data, with explicit unlock calls.
#[derive(Clone, Debug)]
pub struct SharedMutex {
    sem: Semaphore,
}

impl SharedMutex {
    pub fn new() -> Self {
        Self {
            sem: Semaphore::new(ALL),
        }
    }

    /// Takes the mutex exclusively. Pair with [`SharedMutex::unlock`].
    pub async fn lock(&self) -> Result<()> {
        self.sem.wait(ALL).await
    }

    pub fn try_lock(&self) -> bool {
        self.sem.try_wait(ALL)
    }

    pub fn unlock(&self) {
        self.sem.signal(ALL);
    }

    /// Takes the mutex shared. Pair with [`SharedMutex::unlock_shared`].
    pub async fn lock_shared(&self) -> Result<()> {
        self.sem.wait(1).await
    }

    pub fn try_lock_shared(&self) -> bool {
        self.sem.try_wait(1)
    }

    pub fn unlock_shared(&self) {
        self.sem.signal(1);
    }
}

impl Default for SharedMutex {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs `f` holding `mutex` exclusively.
pub async fn with_lock<F, Fut, R>(mutex: &SharedMutex, f: F) -> Result<R>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = R>,
{
    let _units = get_units(&mutex.sem, ALL).await?;
    Ok(f().await)
}

/// Runs `f` holding `mutex` shared.
pub async fn with_shared<F, Fut, R>(mutex: &SharedMutex, f: F) -> Result<R>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = R>,
{
    let _units = get_units(&mutex.sem, 1).await?;
    Ok(f().await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate as tessel;
    use crate::{spawn, yield_now};
    use anyhow::Result;
    use std::rc::Rc;

    #[tessel::test]
    async fn test_readers_share_writers_exclude() -> Result<()> {
        let lock = RwLock::new(1);
        let r1 = lock.read().await?;
        let r2 = lock.read().await?;
        assert_eq!(*r1 + *r2, 2);
        assert!(lock.try_write().is_none());

        drop((r1, r2));
        let mut w = lock.write().await?;
        *w = 5;
        assert!(lock.try_read().is_none());
        drop(w);

        assert_eq!(*lock.read().await?, 5);
        Ok(())
    }

    #[tessel::test]
    async fn test_queued_writer_holds_back_later_readers() -> Result<()> {
        let lock = Rc::new(RwLock::new(Vec::new()));
        let first = lock.read().await?;

        let l = Rc::clone(&lock);
        let writer = spawn(async move {
            l.write().await?.push("write");
            Ok::<_, crate::Error>(())
        });
        let l = Rc::clone(&lock);
        let reader = spawn(async move {
            let seen = l.read().await?.clone();
            Ok::<_, crate::Error>(seen)
        });
        yield_now().await;

        // Reads are free, yet the reader queued behind the writer.
        assert!(!reader.is_finished());
        drop(first);

        writer.await??;
        assert_eq!(reader.await??, vec!["write"]);
        Ok(())
    }

    #[tessel::test]
    async fn test_shared_mutex() -> Result<()> {
        let m = SharedMutex::new();
        m.lock_shared().await?;
        assert!(m.try_lock_shared());
        assert!(!m.try_lock());
        m.unlock_shared();
        m.unlock_shared();

        m.lock().await?;
        assert!(!m.try_lock_shared());
        m.unlock();

        let n = with_shared(&m, || async { 3 }).await?;
        let n = with_lock(&m, || async move { n + 1 }).await?;
        assert_eq!(n, 4);
        assert!(m.try_lock());
        Ok(())
    }

    #[test]
    fn test_into_inner_and_get_mut() {
        let mut lock = RwLock::new(String::from("a"));
        lock.get_mut().push('b');
        assert_eq!(lock.into_inner(), "ab");
    }
}
