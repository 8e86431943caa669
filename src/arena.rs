use core::ptr::NonNull;

use crate::error::{Error, Result};

/// The contiguous region every block is carved from.
///
/// The base is aligned to the largest block size, so each block is naturally
/// aligned to its own size.
pub(crate) struct Arena {
  base: NonNull<u8>,
  size: usize,
  /// Start and length of the whole reservation, alignment padding included.
  raw: NonNull<u8>,
  reserved: usize,
}

// The arena is plain memory: the node table arbitrates who touches which byte.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
  pub fn reserve(size: usize, align: usize) -> Result<Self> {
    debug_assert!(align.is_power_of_two());
    let reserved = size
      .checked_add(align)
      .ok_or_else(|| Error::config("arena size overflows usize"))?;

    // Over-allocate for alignment padding.
    let raw = unsafe { os_reserve(reserved) }.map_err(|source| Error::Reserve {
      size: reserved,
      source,
    })?;

    let offset = align_up(raw.as_ptr() as usize, align) - raw.as_ptr() as usize;
    // SAFETY: `offset < align` and the reservation is `size + align` bytes long.
    let base = unsafe { NonNull::new_unchecked(raw.as_ptr().add(offset)) };

    tracing::debug!(size, align, base = ?base, "arena reserved");

    Ok(Self {
      base,
      size,
      raw,
      reserved,
    })
  }

  #[inline]
  pub fn base(&self) -> usize {
    self.base.as_ptr() as usize
  }

  #[inline]
  pub fn size(&self) -> usize {
    self.size
  }

  #[inline]
  pub fn contains(&self, addr: usize) -> bool {
    addr >= self.base() && addr - self.base() < self.size
  }

  #[inline]
  pub fn offset_of(&self, addr: usize) -> Option<usize> {
    self.contains(addr).then(|| addr - self.base())
  }

  /// # Safety
  ///
  /// `offset` must be within the arena.
  #[inline]
  pub unsafe fn at(&self, offset: usize) -> NonNull<u8> {
    debug_assert!(offset < self.size);
    unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset)) }
  }
}

impl Drop for Arena {
  fn drop(&mut self) {
    unsafe { os_release(self.raw, self.reserved) };
  }
}

impl core::fmt::Debug for Arena {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    f.debug_struct("Arena")
      .field("base", &self.base)
      .field("size", &self.size)
      .finish()
  }
}

// =============================================================================
// Platform
// =============================================================================

#[cfg(unix)]
unsafe fn os_reserve(size: usize) -> std::io::Result<NonNull<u8>> {
  let ptr = unsafe {
    libc::mmap(
      core::ptr::null_mut(),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    return Err(std::io::Error::last_os_error());
  }
  NonNull::new(ptr.cast()).ok_or_else(|| std::io::Error::from(std::io::ErrorKind::OutOfMemory))
}

#[cfg(unix)]
unsafe fn os_release(ptr: NonNull<u8>, size: usize) {
  unsafe { libc::munmap(ptr.as_ptr().cast(), size) };
}

#[cfg(not(unix))]
unsafe fn os_reserve(size: usize) -> std::io::Result<NonNull<u8>> {
  let layout = std::alloc::Layout::from_size_align(size, 4096)
    .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;
  NonNull::new(unsafe { std::alloc::alloc(layout) })
    .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::OutOfMemory))
}

#[cfg(not(unix))]
unsafe fn os_release(ptr: NonNull<u8>, size: usize) {
  if let Ok(layout) = std::alloc::Layout::from_size_align(size, 4096) {
    unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
  }
}

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}
