//! Per-zone doubly linked free lists.
//!
//! Structural changes (insert, remove) require the owner zone's [`LeaseGuard`];
//! claiming a listed block in place does not. Heads of the same order form a
//! ring across zones, so the last node of a zone's list points to the next
//! zone's head. Each `next`/`prev` field is therefore written by exactly one
//! zone: a head's `prev` belongs to the previous zone.

use crate::lease::LeaseGuard;
use crate::node::{NIL, Nodes, Reach, State, Word};

impl Nodes {
  /// Links a DETACHED, FREE node right after its owner's head for its order.
  ///
  /// Returns `false` (and changes nothing) if the node is not DETACHED and FREE.
  pub fn insert(&self, _lease: &LeaseGuard<'_>, idx: u32) -> bool {
    let node = self.get(idx);
    let word = node.load();
    if word.reach != Reach::Detached || word.state != State::Free {
      return false;
    }

    let head_idx = self.head(self.owner(idx), word.order());
    let head = self.get(head_idx);
    let first = head.load().next;

    let marked = node.update(|cur| {
      (cur.reach == Reach::Detached && cur.state == State::Free)
        .then(|| cur.with_next(first).with_reach(Reach::Transitioning))
    });
    if marked.is_err() {
      return false;
    }
    node.set_prev(head_idx);

    let _ = head.update(|cur| Some(cur.with_next(idx)));
    self.get(first).set_prev(idx);

    let _ = node.update(|cur| Some(cur.with_reach(Reach::InList)));
    true
  }

  /// Unlinks a listed node whose state satisfies `accept`.
  ///
  /// The returned word is the node's content once DETACHED. Its state may
  /// differ from the one accepted: an OCCUPIED node can be freed in place while
  /// it is being removed, and then it's up to the caller to insert it again.
  pub fn remove<F>(&self, lease: &LeaseGuard<'_>, idx: u32, accept: F) -> Option<Word>
  where
    F: Fn(State) -> bool,
  {
    self
      .get(idx)
      .update(|cur| {
        (cur.reach == Reach::InList && accept(cur.state))
          .then(|| cur.with_reach(Reach::Transitioning))
      })
      .ok()?;
    Some(self.unlink(lease, idx))
  }

  /// Second half of [`remove`](Self::remove): unlinks a TRANSITIONING node and
  /// publishes it DETACHED.
  pub(crate) fn unlink(&self, _lease: &LeaseGuard<'_>, idx: u32) -> Word {
    let node = self.get(idx);
    let marked = node.load();
    debug_assert_eq!(marked.reach, Reach::Transitioning);

    let next = marked.next;
    let prev = node.prev();

    let unlinked = self
      .get(prev)
      .update(|cur| (cur.next == idx).then(|| cur.with_next(next)));
    debug_assert!(unlinked.is_ok(), "broken back reference on node {idx}");
    self.get(next).set_prev(prev);

    let last = node
      .update(|cur| Some(cur.with_next(NIL).with_reach(Reach::Detached)))
      .unwrap_or_else(|cur| cur);
    node.clear_link();

    last.with_next(NIL).with_reach(Reach::Detached)
  }

  /// Nodes currently linked in `zone`'s list of `order`, in list order.
  ///
  /// Only meaningful at quiescence.
  pub fn listed(&self, zone: usize, order: usize) -> impl Iterator<Item = u32> + '_ {
    let head = self.head(zone, order);
    let mut cur = self.get(head).load().next;
    core::iter::from_fn(move || {
      if !self.is_block(cur) {
        return None;
      }
      let idx = cur;
      cur = self.get(idx).load().next;
      Some(idx)
    })
  }
}
