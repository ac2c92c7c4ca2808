//! Threading primitives used by the shared VM structures

pub use parking_lot::{ Mutex, MutexGuard };


/// A scoped Mutex acquirer that releases on all exit paths.
///
/// Unlike a bare guard, the lock can be manually released and re-acquired
/// within the scope; double lock and double unlock are no-ops
pub struct ScopedLock<'m, T> {
  mutex: &'m Mutex<T>,
  guard: Option<MutexGuard<'m, T>>,
}

impl<'m, T> ScopedLock<'m, T> {
  /// Create a new ScopedLock, acquiring the Mutex immediately
  pub fn new (mutex: &'m Mutex<T>) -> Self {
    Self { mutex, guard: Some(mutex.lock()) }
  }

  /// Create a new ScopedLock without acquiring the Mutex
  pub fn deferred (mutex: &'m Mutex<T>) -> Self {
    Self { mutex, guard: None }
  }

  /// Determine if the Mutex is currently held by this ScopedLock
  pub fn is_locked (&self) -> bool { self.guard.is_some() }

  /// Acquire the Mutex if it is not already held by this ScopedLock
  pub fn lock (&mut self) {
    if self.guard.is_none() {
      self.guard = Some(self.mutex.lock())
    }
  }

  /// Release the Mutex if it is held by this ScopedLock
  pub fn unlock (&mut self) {
    self.guard = None
  }

  /// Get a reference to the guarded value.
  /// Acquires the Mutex if it is not already held
  pub fn get (&mut self) -> &T {
    self.lock();
    self.guard.as_deref().unwrap()
  }

  /// Get a mutable reference to the guarded value.
  /// Acquires the Mutex if it is not already held
  pub fn get_mut (&mut self) -> &mut T {
    self.lock();
    self.guard.as_deref_mut().unwrap()
  }
}


#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_scoped_lock_releases_on_drop () {
    let m = Mutex::new(0u32);

    {
      let mut locker = ScopedLock::new(&m);
      *locker.get_mut() += 1;
      assert!(locker.is_locked());
    }

    assert_eq!(*m.lock(), 1);
  }

  #[test]
  fn test_scoped_lock_double_ops () {
    let m = Mutex::new(7u32);

    let mut locker = ScopedLock::deferred(&m);
    assert!(!locker.is_locked());

    locker.lock();
    locker.lock();
    assert_eq!(*locker.get(), 7);

    locker.unlock();
    locker.unlock();
    assert!(!locker.is_locked());

    assert_eq!(*m.lock(), 7);
  }
}
