use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{NonNull, null_mut};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_utils::CachePadded;

use crate::arena::Arena;
use crate::config::Config;
use crate::diagnostics::Sweep;
use crate::error::{Error, Result};
use crate::lease::Lease;
use crate::node::Nodes;
use crate::signal::WakeSignal;
use crate::stack::Stack;

// =============================================================================
// Shared state
// =============================================================================

/// Per-core partition: one stack per order, the lease serialising list
/// mutation and the signal of the zone's reclamation worker.
pub(crate) struct Zone {
  pub stacks: Box<[CachePadded<Stack>]>,
  pub lease: CachePadded<Lease>,
  pub signal: WakeSignal,
}

impl Zone {
  fn new(conf: &Config) -> Self {
    Self {
      stacks: (0..=conf.max_order)
        .map(|_| CachePadded::new(Stack::new()))
        .collect(),
      lease: CachePadded::new(Lease::new()),
      signal: WakeSignal::new(conf.wake_cooldown),
    }
  }
}

/// Everything the allocator and its workers share.
pub(crate) struct Shared {
  pub conf: Config,
  pub arena: Arena,
  pub nodes: Nodes,
  pub zones: Box<[Zone]>,
  pub shutdown: AtomicBool,
  /// MAX_ORDER blocks split.
  pub frag: AtomicUsize,
  /// MAX_ORDER blocks restored by merging.
  pub defrag: AtomicUsize,
}

impl Shared {
  fn new(conf: Config) -> Result<Self> {
    conf.validate()?;

    let blocks = conf.arena_blocks();
    let max_blocks = blocks >> conf.max_order;
    let wanted = conf.zones.unwrap_or_else(|| {
      std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
    });
    let zones = wanted.clamp(1, max_blocks);
    if zones < wanted {
      tracing::warn!(
        wanted,
        zones,
        "not enough MAX_ORDER blocks for every core, sharing zones"
      );
    }

    let size = conf
      .arena_size()
      .ok_or_else(|| Error::config("arena size overflows usize"))?;
    let arena = Arena::reserve(size, conf.max_block())?;
    let nodes = Nodes::new(blocks, zones, conf.max_order);
    let zones: Box<[Zone]> = (0..zones).map(|_| Zone::new(&conf)).collect();

    let shared = Self {
      conf,
      arena,
      nodes,
      zones,
      shutdown: AtomicBool::new(false),
      frag: AtomicUsize::new(0),
      defrag: AtomicUsize::new(0),
    };
    shared.seed();
    Ok(shared)
  }

  /// Lists every initial MAX_ORDER block in its owner's zone.
  fn seed(&self) {
    for zone in 0..self.zones.len() {
      let Some(guard) = self.lease(zone).try_acquire() else {
        continue;
      };
      for idx in self.nodes.initial_blocks() {
        if self.nodes.owner(idx) == zone {
          let inserted = self.nodes.insert(&guard, idx);
          debug_assert!(inserted);
        }
      }
    }
  }

  #[inline]
  pub fn zone_count(&self) -> usize {
    self.zones.len()
  }

  #[inline]
  pub fn stack(&self, zone: usize, order: usize) -> &Stack {
    &self.zones[zone].stacks[order]
  }

  #[inline]
  pub fn lease(&self, zone: usize) -> &Lease {
    &self.zones[zone].lease
  }

  #[inline]
  pub fn max_order(&self) -> usize {
    self.conf.max_order
  }

  /// Adjusts the delay counter `D = N - 2S - L` of `(zone, order)`.
  #[inline]
  pub fn account(&self, zone: usize, order: usize, delta: i64) {
    if self.conf.delay_accounting && delta != 0 {
      self
        .nodes
        .delay(zone, order)
        .fetch_add(delta, Ordering::Relaxed);
    }
  }

  #[inline]
  pub fn delay(&self, zone: usize, order: usize) -> i64 {
    self.nodes.delay(zone, order).load(Ordering::Relaxed)
  }

  #[inline]
  pub fn index_of(&self, addr: usize) -> Option<u32> {
    let offset = self.arena.offset_of(addr)?;
    Some((offset / self.conf.min_block) as u32)
  }

  #[inline]
  pub fn address_of(&self, idx: u32) -> NonNull<u8> {
    debug_assert!(self.nodes.is_block(idx));
    // SAFETY: every arena node maps to a block inside the arena.
    unsafe { self.arena.at(idx as usize * self.conf.min_block) }
  }
}

/// Smallest order whose block holds `size` bytes.
#[inline]
pub(crate) fn order_for(size: usize, min_block: usize) -> Option<usize> {
  if size <= min_block {
    return Some(0);
  }
  size
    .div_ceil(min_block)
    .checked_next_power_of_two()
    .map(|blocks| blocks.trailing_zeros() as usize)
}

// =============================================================================
// BuddyAllocator
// =============================================================================

/// Non-blocking buddy allocator over a single pre-reserved arena.
///
/// Blocks are `min_block << order` bytes for `order` in `0..=max_order`, and
/// every block is aligned to its own size. Each CPU maps to a zone with its own
/// free lists and stacks. One background worker per zone merges released
/// blocks back into bigger ones.
///
/// ```no_run
/// use nbbuddy::{BuddyAllocator, Config};
///
/// let alloc = BuddyAllocator::new(Config::default()).unwrap();
/// let block = alloc.allocate(10_000).unwrap();
/// unsafe { alloc.deallocate(block).unwrap() };
/// ```
pub struct BuddyAllocator {
  shared: Arc<Shared>,
  workers: Vec<JoinHandle<()>>,
}

impl BuddyAllocator {
  pub fn new(conf: Config) -> Result<Self> {
    let shared = Arc::new(Shared::new(conf)?);

    tracing::debug!(
      arena_size = shared.arena.size(),
      min_block = shared.conf.min_block,
      max_order = shared.conf.max_order,
      zones = shared.zone_count(),
      workers = shared.conf.workers,
      "buddy allocator ready"
    );

    let mut this = Self {
      shared,
      workers: Vec::new(),
    };
    if this.shared.conf.workers {
      for zone in 0..this.shared.zone_count() {
        // On failure `this` is dropped, which stops the workers already running.
        let handle = crate::reclaim::spawn(&this.shared, zone)?;
        this.workers.push(handle);
      }
    }
    Ok(this)
  }

  /// Hands out a block of at least `size` bytes.
  pub fn allocate(&self, size: usize) -> Result<NonNull<u8>> {
    let max = self.shared.conf.max_block();
    let order = order_for(size, self.shared.conf.min_block)
      .filter(|&order| order <= self.shared.max_order())
      .ok_or(Error::TooLarge {
        requested: size,
        max,
      })?;

    let idx = self
      .shared
      .allocate(order)
      .ok_or(Error::OutOfMemory { order })?;
    Ok(self.shared.address_of(idx))
  }

  /// Returns a block to the allocator.
  ///
  /// Only the bounds are checked.
  ///
  /// # Safety
  ///
  /// `ptr` must come from [`allocate`](Self::allocate) on this allocator and
  /// must not have been released already.
  pub unsafe fn deallocate(&self, ptr: NonNull<u8>) -> Result<()> {
    let addr = ptr.as_ptr() as usize;
    let idx = self
      .shared
      .index_of(addr)
      .ok_or(Error::OutOfArena { addr })?;
    self.shared.release(idx);
    Ok(())
  }

  /// Drains every stack into the lists, merging buddies. Blocks until each
  /// zone's lease is available. Returns the number of blocks drained.
  pub fn reclaim(&self) -> usize {
    self.shared.reclaim_all()
  }

  /// Walks the node table and tallies blocks by state. Only exact at quiescence.
  pub fn diagnostics_sweep(&self) -> Sweep {
    self.shared.sweep()
  }

  /// Order of the block starting at `ptr`, if `ptr` is inside the arena.
  pub fn block_order(&self, ptr: NonNull<u8>) -> Option<usize> {
    let idx = self.shared.index_of(ptr.as_ptr() as usize)?;
    Some(self.shared.nodes.get(idx).load().order())
  }

  #[inline]
  pub fn arena_size(&self) -> usize {
    self.shared.arena.size()
  }

  #[inline]
  pub fn min_block(&self) -> usize {
    self.shared.conf.min_block
  }

  #[inline]
  pub fn max_order(&self) -> usize {
    self.shared.max_order()
  }

  #[inline]
  pub fn max_block(&self) -> usize {
    self.shared.conf.max_block()
  }

  /// Number of zones actually in use, after clamping.
  #[inline]
  pub fn zones(&self) -> usize {
    self.shared.zone_count()
  }

  #[inline]
  pub fn config(&self) -> &Config {
    &self.shared.conf
  }

  #[cfg(test)]
  pub(crate) fn shared(&self) -> &Shared {
    &self.shared
  }
}

impl core::fmt::Debug for BuddyAllocator {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    f.debug_struct("BuddyAllocator")
      .field("arena", &self.shared.arena)
      .field("nodes", &self.shared.nodes)
      .field("workers", &self.workers.len())
      .finish()
  }
}

impl Drop for BuddyAllocator {
  fn drop(&mut self) {
    self.shared.shutdown.store(true, Ordering::Release);
    for zone in self.shared.zones.iter() {
      zone.signal.force_wake();
    }
    for handle in self.workers.drain(..) {
      if handle.join().is_err() {
        tracing::warn!("reclamation worker panicked");
      }
    }
  }
}

// =============================================================================
// GlobalAlloc
// =============================================================================

unsafe impl GlobalAlloc for BuddyAllocator {
  unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
    // Blocks are aligned to their size, up to the arena alignment.
    if layout.align() > self.max_block() {
      return null_mut();
    }
    let size = layout.size().max(layout.align()).max(1);
    self
      .allocate(size)
      .map(NonNull::as_ptr)
      .unwrap_or(null_mut())
  }

  unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
    // It's a foreign pointer, is ignored.
    if let Some(ptr) = NonNull::new(ptr) {
      let _ = unsafe { self.deallocate(ptr) };
    }
  }
}
