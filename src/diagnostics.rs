use core::sync::atomic::Ordering;

use crate::allocator::Shared;
use crate::node::{Reach, State};

/// Snapshot of the node table. Exact only while no other thread touches the
/// allocator.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Sweep {
  pub free_blocks: usize,
  pub free_bytes: usize,
  /// Handed out to callers (or claimed and not yet returned).
  pub occupied_blocks: usize,
  pub occupied_bytes: usize,
  /// Released to a stack and waiting to be merged.
  pub cached_blocks: usize,
  pub cached_bytes: usize,
  /// Nodes in the middle of a bigger block.
  pub invalid_nodes: usize,
  /// FREE blocks not linked in any list. Always zero at quiescence.
  pub lost_free: usize,
  /// Nodes reachable from the lists, whatever their state.
  pub listed_blocks: usize,
  /// MAX_ORDER blocks split so far.
  pub splits_of_max: usize,
  /// MAX_ORDER blocks rebuilt by merging so far.
  pub merges_to_max: usize,
}

impl Sweep {
  /// Every byte of the arena is accounted for exactly once.
  pub fn is_conserved(&self, arena_size: usize) -> bool {
    self.free_bytes + self.occupied_bytes + self.cached_bytes == arena_size
  }

  /// Bytes that are not FREE, wherever they are.
  pub fn in_use_bytes(&self) -> usize {
    self.occupied_bytes + self.cached_bytes
  }
}

impl Shared {
  pub fn sweep(&self) -> Sweep {
    let mut sweep = Sweep {
      splits_of_max: self.frag.load(Ordering::Relaxed),
      merges_to_max: self.defrag.load(Ordering::Relaxed),
      ..Sweep::default()
    };

    for idx in 0..self.nodes.blocks() {
      let word = self.nodes.get(idx).load();
      let bytes = self.conf.min_block << word.order();
      match (word.state, word.reach) {
        (State::Free, reach) => {
          sweep.free_blocks += 1;
          sweep.free_bytes += bytes;
          if reach != Reach::InList {
            sweep.lost_free += 1;
          }
        }
        (State::Occupied, Reach::InStack) => {
          sweep.cached_blocks += 1;
          sweep.cached_bytes += bytes;
        }
        (State::Occupied, _) => {
          sweep.occupied_blocks += 1;
          sweep.occupied_bytes += bytes;
        }
        (State::Invalid, _) => sweep.invalid_nodes += 1,
        (State::Head, _) => debug_assert!(false, "head {idx} inside the arena"),
      }
    }

    sweep.listed_blocks = (0..self.zone_count())
      .flat_map(|zone| (0..=self.max_order()).map(move |order| (zone, order)))
      .map(|(zone, order)| self.nodes.listed(zone, order).count())
      .sum();

    tracing::debug!(?sweep, "diagnostics sweep");
    sweep
  }
}
