//! Deallocation: fast release to the stacks, slow release with coalescing.

use core::sync::atomic::Ordering;

use crossbeam_utils::Backoff;

use crate::allocator::Shared;
use crate::heuristics;
use crate::lease::LeaseGuard;
use crate::node::{Reach, State};

impl Shared {
  /// Gives back the OCCUPIED block at `idx`.
  pub fn release(&self, idx: u32) {
    let nodes = &self.nodes;
    let node = nodes.get(idx);
    let word = node.load();
    debug_assert_eq!(word.state, State::Occupied, "double free of node {idx}");

    let order = word.order();
    let owner = nodes.owner(idx);
    let stack = self.stack(owner, order);

    let wants_fast = stack.len(nodes) < self.conf.low_water()
      || heuristics::is_hot(&self.conf, order)
      || (self.conf.delay_accounting && self.delay(owner, order) > 0);

    if wants_fast && word.reach == Reach::Detached && stack.push(nodes, idx) {
      self.account(owner, order, -2);
    } else if let Some(guard) = self.lease(owner).try_acquire() {
      if node.load().reach == Reach::InList {
        nodes.remove(&guard, idx, |state| state == State::Occupied);
      }
      self.merge_and_list(&guard, idx);
    } else {
      self.release_unleased(idx);
    }

    if (self.conf.delay_accounting && self.delay(owner, order) < 0)
      || stack.len(nodes) > self.conf.stack_threshold
    {
      self.zones[owner].signal.wake();
    }
  }

  /// Coalesces a DETACHED, OCCUPIED block and lists the result.
  pub(crate) fn merge_and_list(&self, guard: &LeaseGuard<'_>, idx: u32) {
    let survivor = self.coalesce(guard, idx);
    let order = self.nodes.get(survivor).load().order();
    let inserted = self.nodes.insert(guard, survivor);
    debug_assert!(inserted, "merged block {survivor} could not be listed");
    self.account(self.nodes.owner(survivor), order, -1);
  }

  /// Without the lease the node cannot be unlinked: mark it FREE where it is,
  /// or park it on the stack.
  fn release_unleased(&self, idx: u32) {
    let nodes = &self.nodes;
    let node = nodes.get(idx);
    let owner = nodes.owner(idx);
    let backoff = Backoff::new();

    loop {
      let word = node.load();
      if word.state != State::Occupied {
        return;
      }
      let order = word.order();

      let done = match word.reach {
        // A remover that sees FREE when it's done inserts the node again.
        Reach::InList | Reach::Transitioning => {
          let freed = node.cas(word, word.with_state(State::Free)).is_ok();
          if freed {
            self.account(owner, order, -1);
          }
          freed
        }
        Reach::Detached => {
          let pushed = self.stack(owner, order).push(nodes, idx);
          if pushed {
            self.account(owner, order, -2);
          }
          pushed
        }
        Reach::InStack => {
          debug_assert!(false, "released node {idx} is already stacked");
          true
        }
      };

      if done {
        return;
      }
      backoff.spin();
    }
  }

  /// Merges the block at `idx` with its FREE buddies as far as possible.
  ///
  /// The block must be DETACHED and OCCUPIED. Returns the surviving node, FREE
  /// and DETACHED, ready to be listed.
  pub(crate) fn coalesce(&self, guard: &LeaseGuard<'_>, idx: u32) -> u32 {
    let nodes = &self.nodes;
    let max_order = self.max_order();
    let owner = nodes.owner(idx);

    let word = nodes.get(idx).load();
    debug_assert!(word.state == State::Occupied && word.reach == Reach::Detached);
    let mut order = word.order();

    if order == max_order || !self.mergeable(idx, order) {
      let _ = nodes
        .get(idx)
        .update(|cur| Some(cur.with_state(State::Free)));
      return idx;
    }

    // Hide the block while it grows.
    let _ = nodes
      .get(idx)
      .update(|cur| Some(cur.with_state(State::Invalid)));

    let mut survivor = idx;
    while order < max_order {
      let buddy = nodes.buddy(survivor, order);
      let bw = nodes.get(buddy).load();
      if bw.state != State::Free || bw.order() != order {
        break;
      }
      // Lost the buddy to an allocation: stop here.
      if !nodes
        .get(buddy)
        .change_state(State::Free, State::Invalid, bw.reach, bw.order)
      {
        break;
      }
      self.account(owner, order, -1);

      if bw.reach == Reach::InList {
        nodes.remove(guard, buddy, |state| state == State::Invalid);
      }

      survivor = survivor.min(buddy);
      order += 1;
      let _ = nodes
        .get(survivor)
        .update(|cur| Some(cur.with_order(order as u8)));

      tracing::trace!(survivor, order, "merged");
    }

    let _ = nodes
      .get(survivor)
      .update(|cur| Some(cur.with_state(State::Free)));

    if order == max_order {
      self.defrag.fetch_add(1, Ordering::Relaxed);
    }
    survivor
  }

  #[inline]
  fn mergeable(&self, idx: u32, order: usize) -> bool {
    let bw = self.nodes.get(self.nodes.buddy(idx, order)).load();
    bw.state == State::Free && bw.order() == order
  }
}

#[cfg(test)]
mod tests {
  use core::sync::atomic::Ordering;

  use crate::allocator::BuddyAllocator;
  use crate::config::{Config, Heuristic};
  use crate::node::{Reach, State};

  /// 16 blocks of 64 bytes in a single zone, every release takes the slow path.
  fn slow_only() -> Config {
    Config::default()
      .with_min_block(64)
      .with_levels(5)
      .with_max_order(4)
      .with_zones(1)
      .with_workers(false)
      .with_heuristic(Heuristic::Off)
      .with_stack_threshold(0)
  }

  #[test]
  fn slow_release_merges_back_to_max_order() {
    let alloc = BuddyAllocator::new(slow_only()).unwrap();
    let shared = alloc.shared();

    let a = alloc.allocate(64).unwrap();
    let b = alloc.allocate(64).unwrap();
    assert_eq!(b.as_ptr() as usize - a.as_ptr() as usize, 64);

    unsafe { alloc.deallocate(a).unwrap() };
    // Buddy still taken: nothing to merge.
    assert_eq!(shared.nodes.listed(0, 0).collect::<Vec<_>>(), [0]);

    unsafe { alloc.deallocate(b).unwrap() };
    assert_eq!(shared.nodes.listed(0, 4).collect::<Vec<_>>(), [0]);
    for order in 0..4 {
      assert_eq!(shared.nodes.listed(0, order).count(), 0);
    }
    assert_eq!(shared.defrag.load(Ordering::Relaxed), 1);
  }

  #[test]
  fn merged_block_takes_the_lower_address() {
    let alloc = BuddyAllocator::new(slow_only()).unwrap();
    let shared = alloc.shared();

    let blocks: Vec<_> = (0..4).map(|_| alloc.allocate(64).unwrap()).collect();
    // Release the upper buddy of the second pair first.
    unsafe {
      alloc.deallocate(blocks[3]).unwrap();
      alloc.deallocate(blocks[2]).unwrap();
    }
    let word = shared.nodes.get(2).load();
    assert_eq!((word.state, word.order()), (State::Free, 1));
    assert_eq!(shared.nodes.get(3).load().state, State::Invalid);
    assert_eq!(shared.nodes.listed(0, 1).collect::<Vec<_>>(), [2]);

    unsafe {
      alloc.deallocate(blocks[0]).unwrap();
      alloc.deallocate(blocks[1]).unwrap();
    }
    assert_eq!(alloc.block_order(blocks[0]), Some(4));
  }

  #[test]
  fn fast_release_parks_on_the_stack() {
    let conf = slow_only().with_stack_threshold(8);
    let alloc = BuddyAllocator::new(conf).unwrap();
    let shared = alloc.shared();

    let a = alloc.allocate(64).unwrap();
    unsafe { alloc.deallocate(a).unwrap() };
    let word = shared.nodes.get(0).load();
    assert_eq!((word.state, word.reach), (State::Occupied, Reach::InStack));

    assert_eq!(alloc.reclaim(), 1);
    assert_eq!(shared.nodes.listed(0, 4).collect::<Vec<_>>(), [0]);
  }

  #[test]
  fn release_without_lease_frees_in_place() {
    let alloc = BuddyAllocator::new(slow_only()).unwrap();
    let shared = alloc.shared();

    // Leave the claimed node listed.
    let held = shared.lease(0).try_acquire().unwrap();
    let a = alloc.allocate(64 * 16).unwrap();
    assert_eq!(shared.nodes.get(0).load().reach, Reach::InList);

    unsafe { alloc.deallocate(a).unwrap() };
    drop(held);
    let word = shared.nodes.get(0).load();
    assert_eq!((word.state, word.reach), (State::Free, Reach::InList));

    // Still usable.
    let again = alloc.allocate(64 * 16).unwrap();
    assert_eq!(again, a);
  }

  #[test]
  fn release_during_removal_is_listed_again() {
    let alloc = BuddyAllocator::new(slow_only()).unwrap();
    let shared = alloc.shared();

    let held = shared.lease(0).try_acquire().unwrap();
    let a = alloc.allocate(64 * 16).unwrap();

    // A remover has marked the claimed node and not unlinked it yet.
    let node = shared.nodes.get(0);
    let word = node.load();
    assert_eq!((word.state, word.reach), (State::Occupied, Reach::InList));
    node.cas(word, word.with_reach(Reach::Transitioning)).unwrap();

    unsafe { alloc.deallocate(a).unwrap() };
    let word = node.load();
    assert_eq!((word.state, word.reach), (State::Free, Reach::Transitioning));

    // The remover finds the node FREE and lists it again.
    let removed = shared.nodes.unlink(&held, 0);
    assert_eq!((removed.state, removed.reach), (State::Free, Reach::Detached));
    assert_eq!(shared.nodes.listed(0, 4).count(), 0);
    assert!(shared.nodes.insert(&held, 0));
    let word = node.load();
    assert_eq!((word.state, word.reach), (State::Free, Reach::InList));
    drop(held);

    let again = alloc.allocate(64 * 16).unwrap();
    assert_eq!(again, a);
    unsafe { alloc.deallocate(again).unwrap() };
    assert_eq!(shared.nodes.listed(0, 4).collect::<Vec<_>>(), [0]);
  }

  #[test]
  fn release_without_lease_of_detached_node_stacks_it() {
    let alloc = BuddyAllocator::new(slow_only()).unwrap();
    let shared = alloc.shared();

    let a = alloc.allocate(64).unwrap();
    let held = shared.lease(0).try_acquire().unwrap();
    unsafe { alloc.deallocate(a).unwrap() };
    assert_eq!(shared.nodes.get(0).load().reach, Reach::InStack);
    drop(held);

    assert_eq!(alloc.reclaim(), 1);
    assert_eq!(alloc.block_order(a), Some(4));
  }

  #[test]
  fn delay_accounting_tracks_stack_and_list() {
    let conf = slow_only()
      .with_stack_threshold(8)
      .with_delay_accounting(true);
    let alloc = BuddyAllocator::new(conf).unwrap();
    let shared = alloc.shared();

    let a = alloc.allocate(64 * 16).unwrap();
    // Taken from the list: L - 1.
    assert_eq!(shared.delay(0, 4), 1);
    unsafe { alloc.deallocate(a).unwrap() };
    // Pushed on the stack: S + 1.
    assert_eq!(shared.delay(0, 4), -1);

    alloc.reclaim();
    // Popped (S - 1) and listed again (L + 1).
    assert_eq!(shared.delay(0, 4), 0);
  }
}
