use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

const SLEEP: u32 = 0;
const WAKE: u32 = 1;

/// Rate-limited wake-up for a sleeping reclamation worker.
///
/// `wake` is best effort: it does nothing while the worker is already awake
/// or when less than `cooldown` has passed since the worker last went back to
/// sleep.
pub(crate) struct WakeSignal {
  var: AtomicU32,
  origin: Instant,
  /// Nanoseconds since `origin` of the last `reset`.
  last_reset: AtomicU64,
  cooldown: Duration,
}

impl WakeSignal {
  pub fn new(cooldown: Duration) -> Self {
    Self {
      var: AtomicU32::new(SLEEP),
      origin: Instant::now(),
      last_reset: AtomicU64::new(0),
      cooldown,
    }
  }

  #[inline]
  fn elapsed_ns(&self) -> u64 {
    self.origin.elapsed().as_nanos() as u64
  }

  #[inline]
  pub fn is_awake(&self) -> bool {
    self.var.load(Ordering::Acquire) == WAKE
  }

  /// Returns whether this call woke the worker.
  pub fn wake(&self) -> bool {
    if self.is_awake() {
      return false;
    }
    let since = self
      .elapsed_ns()
      .saturating_sub(self.last_reset.load(Ordering::Relaxed));
    if since < self.cooldown.as_nanos() as u64 {
      return false;
    }
    self.force_wake()
  }

  /// Wakes the worker regardless of the cooldown.
  pub fn force_wake(&self) -> bool {
    if self
      .var
      .compare_exchange(SLEEP, WAKE, Ordering::AcqRel, Ordering::Relaxed)
      .is_err()
    {
      return false;
    }
    sys::wake_one(&self.var);
    true
  }

  /// Back to sleep; the cooldown starts now.
  pub fn reset(&self) {
    self.last_reset.store(self.elapsed_ns(), Ordering::Relaxed);
    let _ = self
      .var
      .compare_exchange(WAKE, SLEEP, Ordering::AcqRel, Ordering::Relaxed);
  }

  /// Blocks while asleep, for at most `timeout`. Spurious returns are fine.
  pub fn wait(&self, timeout: Duration) {
    if self.is_awake() {
      return;
    }
    sys::wait_while(&self.var, SLEEP, timeout);
  }
}

#[cfg(target_os = "linux")]
mod sys {
  use core::sync::atomic::AtomicU32;
  use std::time::Duration;

  pub fn wait_while(var: &AtomicU32, expected: u32, timeout: Duration) {
    let ts = libc::timespec {
      tv_sec: timeout.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
      tv_nsec: timeout.subsec_nanos() as libc::c_long,
    };
    // EAGAIN, EINTR and ETIMEDOUT all mean "go check again".
    unsafe {
      libc::syscall(
        libc::SYS_futex,
        var.as_ptr(),
        libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
        expected,
        &ts as *const libc::timespec,
      );
    }
  }

  pub fn wake_one(var: &AtomicU32) {
    unsafe {
      libc::syscall(
        libc::SYS_futex,
        var.as_ptr(),
        libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
        1,
      );
    }
  }
}

#[cfg(not(target_os = "linux"))]
mod sys {
  use core::sync::atomic::{AtomicU32, Ordering};
  use std::time::{Duration, Instant};

  const POLL: Duration = Duration::from_micros(200);

  pub fn wait_while(var: &AtomicU32, expected: u32, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while var.load(Ordering::Acquire) == expected {
      let now = Instant::now();
      if now >= deadline {
        return;
      }
      std::thread::sleep(POLL.min(deadline - now));
    }
  }

  pub fn wake_one(_var: &AtomicU32) {}
}
