#![allow(dead_code)]

use nbbuddy::{BuddyAllocator, Config, Heuristic};
use tracing_subscriber::EnvFilter;

pub fn tracing_init() {
  let _ = tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::from_default_env())
    .with_test_writer()
    .try_init();
}

/// `2^(levels - 1)` blocks of 64 bytes, blocks up to `2^max_order` of them.
pub fn small(levels: usize, max_order: usize, zones: usize) -> Config {
  Config::default()
    .with_min_block(64)
    .with_levels(levels)
    .with_max_order(max_order)
    .with_zones(zones)
    .with_workers(false)
    .with_heuristic(Heuristic::Off)
}

/// Asserts that nothing leaked once every stack has been drained.
pub fn assert_all_free(alloc: &BuddyAllocator) {
  alloc.reclaim();
  let sweep = alloc.diagnostics_sweep();
  assert_eq!(sweep.occupied_blocks, 0, "{sweep:?}");
  assert_eq!(sweep.cached_blocks, 0, "{sweep:?}");
  assert_eq!(sweep.lost_free, 0, "{sweep:?}");
  assert_eq!(sweep.free_bytes, alloc.arena_size(), "{sweep:?}");
}
