use core::sync::atomic::{AtomicBool, Ordering};

/// Best-effort per-zone exclusion standing in for "preemption disabled".
///
/// There is no blocking acquire: callers that fail to get the lease take a
/// path that stays correct without it.
pub(crate) struct Lease {
  held: AtomicBool,
}

/// Releases the lease on drop.
#[must_use]
pub(crate) struct LeaseGuard<'a> {
  lease: &'a Lease,
}

impl Lease {
  pub const fn new() -> Self {
    Self {
      held: AtomicBool::new(false),
    }
  }

  #[inline]
  pub fn try_acquire(&self) -> Option<LeaseGuard<'_>> {
    // Test before test-and-set to keep the line shared while somebody holds it.
    if self.held.load(Ordering::Relaxed) {
      return None;
    }
    if self.held.swap(true, Ordering::Acquire) {
      return None;
    }
    Some(LeaseGuard { lease: self })
  }

  #[cfg(test)]
  pub fn is_held(&self) -> bool {
    self.held.load(Ordering::Relaxed)
  }
}

impl Drop for LeaseGuard<'_> {
  #[inline]
  fn drop(&mut self) {
    debug_assert!(self.lease.held.load(Ordering::Relaxed));
    self.lease.held.store(false, Ordering::Release);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn exclusive_until_dropped() {
    let lease = Lease::new();
    let guard = lease.try_acquire().expect("lease is free");
    assert!(lease.is_held());
    assert!(lease.try_acquire().is_none());
    drop(guard);
    assert!(!lease.is_held());
    assert!(lease.try_acquire().is_some());
  }

  #[test]
  fn one_winner_across_threads() {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;

    const THREADS: usize = 8;
    let lease = Lease::new();
    let winners = AtomicUsize::new(0);
    let start = Barrier::new(THREADS);
    let done = Barrier::new(THREADS);

    std::thread::scope(|s| {
      for _ in 0..THREADS {
        s.spawn(|| {
          start.wait();
          let guard = lease.try_acquire();
          if guard.is_some() {
            winners.fetch_add(1, Ordering::Relaxed);
          }
          // Hold whatever we got until everybody has tried.
          done.wait();
          drop(guard);
        });
      }
    });

    assert_eq!(winners.load(Ordering::Relaxed), 1);
    assert!(!lease.is_held());
  }
}
