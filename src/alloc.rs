//! Allocation: search, split and detach.

use core::sync::atomic::Ordering;

use crossbeam_utils::Backoff;

use crate::allocator::Shared;
use crate::cpu;
use crate::heuristics;
use crate::lease::LeaseGuard;
use crate::node::{Reach, State};

/// Rounds of reclaim-then-search before reporting exhaustion.
const STARVATION_ROUNDS: usize = 4;

/// A block claimed by the search, OCCUPIED but possibly still listed.
#[derive(Clone, Copy, Debug)]
struct Claim {
  idx: u32,
  order: usize,
}

impl Shared {
  /// Finds, splits and detaches a block of `order`. Returns its node index.
  pub fn allocate(&self, order: usize) -> Option<u32> {
    debug_assert!(order <= self.max_order());

    let local = cpu::current_zone(self.zone_count());

    let claim = self
      .find(local, order)
      .or_else(|| self.find_starved(local, order))?;
    heuristics::record(&self.conf, order);

    let owner = self.nodes.owner(claim.idx);
    let guard = self.lease(owner).try_acquire();

    if claim.order > order {
      self.split(claim, order, guard.as_ref());
    }
    if let Some(guard) = guard.as_ref() {
      self.detach(guard, claim.idx);
    }

    debug_assert_eq!(self.nodes.get(claim.idx).load().state, State::Occupied);
    Some(claim.idx)
  }

  /// Searches orders `target..=max_order`, each one first in `core`'s zone then
  /// through the rest of the ring.
  fn find(&self, core: usize, target: usize) -> Option<Claim> {
    (target..=self.max_order()).find_map(|order| self.scan(core, order, target))
  }

  /// Last resort: merge whatever sits in the stacks, then search everywhere again.
  fn find_starved(&self, core: usize, target: usize) -> Option<Claim> {
    let backoff = Backoff::new();
    for round in 0..STARVATION_ROUNDS {
      let drained = self.drain_available();
      tracing::trace!(round, drained, target, "starved, reclaimed stacks");

      if let Some(claim) = self.find(core, target) {
        return Some(claim);
      }
      backoff.snooze();
    }
    None
  }

  /// Walks the ring of `order` lists once round every zone, popping each
  /// zone's stack when passing its head.
  fn scan(&self, core: usize, order: usize, target: usize) -> Option<Claim> {
    let nodes = &self.nodes;
    let zones = self.zone_count();

    'restart: loop {
      let mut visited = 0;
      let mut cur = nodes.head(core, order);

      loop {
        let word = nodes.get(cur).load();

        if word.state == State::Head {
          // Followed a node that moved to a list of another order.
          if word.order() != order {
            continue 'restart;
          }
          if visited == zones {
            return None;
          }
          let zone = (core + visited) % zones;
          visited += 1;

          if let Some(idx) = self.stack(zone, order).pop(nodes) {
            self.account(zone, order, 2);
            return Some(Claim { idx, order });
          }
          cur = word.next;
          continue;
        }

        // Removed or recycled while we were looking at it.
        if matches!(word.reach, Reach::Detached | Reach::InStack) {
          continue 'restart;
        }

        match word.state {
          State::Free if word.reach == Reach::Transitioning => cur = word.next,
          State::Free if word.order() >= target => {
            let claimed = nodes.get(cur).cas(word, word.with_state(State::Occupied));
            match claimed {
              Ok(_) => {
                self.account(nodes.owner(cur), word.order(), 1);
                return Some(Claim {
                  idx: cur,
                  order: word.order(),
                });
              }
              Err(now) if now.state == State::Free && now.reach == Reach::InList => {}
              Err(_) => cur = word.next,
            }
          }
          State::Free => {
            // Smaller than asked for and in a list of the wrong order.
            self.relocate(cur);
            cur = word.next;
          }
          State::Occupied => {
            if word.reach == Reach::InList && self.help_remove(cur) {
              // Freed while we removed it and listed again, have a look.
              continue;
            }
            cur = word.next;
          }
          State::Invalid | State::Head => cur = word.next,
        }
      }
    }
  }

  /// Moves a FREE node found in a list of the wrong order to the right one.
  fn relocate(&self, idx: u32) {
    let owner = self.nodes.owner(idx);
    let Some(guard) = self.lease(owner).try_acquire() else {
      return;
    };
    if let Some(word) = self.nodes.remove(&guard, idx, |state| state == State::Free) {
      tracing::trace!(idx, order = word.order(), "relocating misplaced block");
      self.nodes.insert(&guard, idx);
    }
  }

  /// Removes a stale OCCUPIED node from its list. Returns whether it turned
  /// out FREE and went back into a list.
  fn help_remove(&self, idx: u32) -> bool {
    let owner = self.nodes.owner(idx);
    let Some(guard) = self.lease(owner).try_acquire() else {
      return false;
    };
    match self.nodes.remove(&guard, idx, |state| state == State::Occupied) {
      Some(word) if word.state == State::Free => self.nodes.insert(&guard, idx),
      _ => false,
    }
  }

  /// Cuts a claimed block down to `target`, handing out the upper halves.
  fn split(&self, claim: Claim, target: usize, guard: Option<&LeaseGuard<'_>>) {
    let nodes = &self.nodes;
    let owner = nodes.owner(claim.idx);

    let _ = nodes
      .get(claim.idx)
      .update(|cur| Some(cur.with_order(target as u8)));

    for order in (target..claim.order).rev() {
      let buddy = nodes.buddy(claim.idx, order);
      let state = if guard.is_some() {
        State::Free
      } else {
        State::Occupied
      };

      // The upper half was hidden inside the claimed block: nobody else can
      // reach it until it is published here.
      let published = nodes.get(buddy).update(|cur| {
        (cur.state == State::Invalid && cur.reach == Reach::Detached)
          .then(|| cur.with_order(order as u8).with_state(state))
      });
      if let Err(cur) = published {
        tracing::error!(buddy, order, ?cur, "split found its upper half in use");
        continue;
      }

      match guard {
        Some(guard) => {
          let inserted = nodes.insert(guard, buddy);
          debug_assert!(inserted);
          self.account(owner, order, 1);
        }
        None => {
          let pushed = self.stack(owner, order).push(nodes, buddy);
          debug_assert!(pushed);
        }
      }
    }

    if claim.order == self.max_order() {
      self.frag.fetch_add(1, Ordering::Relaxed);
    }
    tracing::trace!(
      idx = claim.idx,
      from = claim.order,
      to = target,
      "split"
    );
  }

  /// Unlinks a claimed block from its list, if it's still listed.
  fn detach(&self, guard: &LeaseGuard<'_>, idx: u32) {
    let word = self.nodes.get(idx).load();
    // TRANSITIONING: somebody else is already removing it.
    if word.reach == Reach::InList {
      let removed = self
        .nodes
        .remove(guard, idx, |state| state == State::Occupied);
      debug_assert!(removed.is_none_or(|w| w.state == State::Occupied));
    }
  }
}
