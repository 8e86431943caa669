use std::io;

/// Errors surfaced by the allocator.
///
/// Transient CAS contention never shows up here: it is always retried locally.
#[derive(Debug)]
pub enum Error {
  /// The request rounds to an order above `MAX_ORDER`.
  TooLarge { requested: usize, max: usize },
  /// No block of the requested order (or larger) was found in any zone.
  OutOfMemory { order: usize },
  /// The address handed back does not belong to the arena.
  OutOfArena { addr: usize },
  InvalidConfig { reason: String },
  /// The operating system refused to reserve the arena.
  Reserve { size: usize, source: io::Error },
  /// A reclamation worker could not be started.
  Spawn { zone: usize, source: io::Error },
}

impl Error {
  pub(crate) fn config(reason: impl Into<String>) -> Self {
    Self::InvalidConfig {
      reason: reason.into(),
    }
  }

  /// Whether this is a capacity failure the caller may recover from by freeing memory.
  pub fn is_exhaustion(&self) -> bool {
    matches!(self, Self::OutOfMemory { .. })
  }
}

impl core::fmt::Display for Error {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    match self {
      Self::TooLarge { requested, max } => write!(
        f,
        "Allocation failed: requested {} bytes, but the largest block is {} bytes",
        requested, max
      ),
      Self::OutOfMemory { order } => {
        write!(f, "Allocation failed: no free block of order >= {}", order)
      }
      Self::OutOfArena { addr } => write!(f, "Address {:#x} is outside the arena", addr),
      Self::InvalidConfig { reason } => write!(f, "Invalid configuration: {}", reason),
      Self::Reserve { size, source } => {
        write!(f, "Failed to reserve an arena of {} bytes: {}", size, source)
      }
      Self::Spawn { zone, source } => write!(
        f,
        "Failed to spawn the reclamation worker of zone {}: {}",
        zone, source
      ),
    }
  }
}

impl std::error::Error for Error {
  fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
    match self {
      Self::Reserve { source, .. } | Self::Spawn { source, .. } => Some(source),
      _ => None,
    }
  }
}

pub type Result<T> = core::result::Result<T, Error>;
