use core::sync::atomic::{AtomicU32, Ordering};

// Each thread gets a different ID
#[cfg_attr(all(target_arch = "x86_64", target_os = "linux", feature = "rdpid"), allow(dead_code))]
fn thread_id_u32() -> u32 {
  thread_local! {
    static TID: u32 = {
      static CTR: AtomicU32 = AtomicU32::new(0);
      CTR.fetch_add(1, Ordering::Relaxed) // We only need uniqueness, not synchronization
    };
  }
  TID.with(|&id| id)
}

// Only supported in the latest x86 CPUs. Seems to be the fastest way to access CPU ID
#[cfg(all(target_arch = "x86_64", target_os = "linux", feature = "rdpid"))]
pub(crate) fn cpu_id() -> usize {
  let cpu: u64;
  unsafe {
    // nomem - Doesn't read/write memory
    // nostack - Doesn't touch the stack pointer
    // preserves_flags - Doesn't modify CPU flags (EFLAGS/RFLAGS)
    core::arch::asm!("rdpid {}", out(reg) cpu, options(nomem, nostack, preserves_flags));
  }
  (cpu & 0xFFF) as usize
}

#[cfg(all(target_os = "linux", not(all(target_arch = "x86_64", feature = "rdpid"))))]
pub(crate) fn cpu_id() -> usize {
  let cpu = unsafe { libc::sched_getcpu() };
  if cpu < 0 {
    thread_id_u32() as usize
  } else {
    cpu as usize
  }
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn cpu_id() -> usize {
  thread_id_u32() as usize
}

/// Zone of the CPU the calling thread runs on right now.
#[inline]
pub(crate) fn current_zone(zones: usize) -> usize {
  cpu_id() % zones
}

/// Restricts the calling thread to `cpu`.
#[cfg(target_os = "linux")]
pub(crate) fn pin_to(cpu: usize) -> std::io::Result<()> {
  unsafe {
    let mut set: libc::cpu_set_t = core::mem::zeroed();
    libc::CPU_ZERO(&mut set);
    libc::CPU_SET(cpu, &mut set);
    if libc::sched_setaffinity(0, core::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
      return Err(std::io::Error::last_os_error());
    }
  }
  Ok(())
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn pin_to(_cpu: usize) -> std::io::Result<()> {
  Err(std::io::Error::from(std::io::ErrorKind::Unsupported))
}
