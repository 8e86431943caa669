use core::sync::atomic::{AtomicU64, Ordering};

use crate::node::{NIL, Nodes, Reach, State, Word};

/// Lock-free Treiber stack of OCCUPIED-but-released blocks, one per zone and order.
///
/// The top word packs the index of the top node with an explicit epoch that is
/// bumped by every successful push or pop, so a stale top never wins a CAS.
pub(crate) struct Stack {
  top: AtomicU64,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct Top {
  idx: u32,
  epoch: u32,
}

impl Top {
  #[inline]
  const fn encode(self) -> u64 {
    self.idx as u64 | (self.epoch as u64) << 32
  }

  #[inline]
  const fn decode(raw: u64) -> Self {
    Self {
      idx: raw as u32,
      epoch: (raw >> 32) as u32,
    }
  }

  #[inline]
  const fn succ(self, idx: u32) -> Self {
    Self {
      idx,
      epoch: self.epoch.wrapping_add(1),
    }
  }
}

impl Stack {
  pub const fn new() -> Self {
    Self {
      top: AtomicU64::new(Top { idx: NIL, epoch: 0 }.encode()),
    }
  }

  #[inline]
  fn load(&self) -> Top {
    Top::decode(self.top.load(Ordering::Acquire))
  }

  #[inline]
  fn cas(&self, current: Top, new: Top) -> bool {
    self
      .top
      .compare_exchange_weak(
        current.encode(),
        new.encode(),
        Ordering::AcqRel,
        Ordering::Relaxed,
      )
      .is_ok()
  }

  #[inline]
  pub fn is_empty(&self) -> bool {
    self.load().idx == NIL
  }

  /// Best effort: the length is recorded on the top node when it is pushed.
  #[inline]
  pub fn len(&self, nodes: &Nodes) -> usize {
    self.len_at(nodes, self.load())
  }

  /// Length recorded on `top`, or 0 if `top` is no longer the top.
  fn len_at(&self, nodes: &Nodes, top: Top) -> usize {
    if top.idx == NIL {
      return 0;
    }
    let node = nodes.get(top.idx);
    if node.load().reach != Reach::InStack {
      return 0;
    }
    let len = node.stack_len();
    // Popped and reused in between: the link holds something else now.
    if self.load() != top {
      return 0;
    }
    len as usize
  }

  /// Pushes `idx`, which must be DETACHED and OCCUPIED; returns false otherwise.
  pub fn push(&self, nodes: &Nodes, idx: u32) -> bool {
    let node = nodes.get(idx);

    // Claim the node first: IN_STACK makes it ours until it is popped.
    let claimed = node.update(|cur| {
      if cur.reach != Reach::Detached || cur.state != State::Occupied {
        return None;
      }
      Some(cur.with_next(NIL).with_reach(Reach::InStack))
    });
    if claimed.is_err() {
      return false;
    }

    loop {
      let top = self.load();
      let len = if top.idx == NIL {
        0
      } else {
        nodes.get(top.idx).stack_len()
      };

      // Nobody else writes an IN_STACK node that is not reachable yet.
      let _ = node.update(|cur| Some(cur.with_next(top.idx)));
      node.set_stack_len(len + 1);

      if self.cas(top, top.succ(idx)) {
        return true;
      }
    }
  }

  pub fn pop(&self, nodes: &Nodes) -> Option<u32> {
    loop {
      let top = self.load();
      if top.idx == NIL {
        return None;
      }

      let word = nodes.get(top.idx).load();
      if word.reach != Reach::InStack {
        // A thread might sleep with an old top.
        continue;
      }

      if self.cas(top, top.succ(word.next)) {
        detach(nodes, top.idx);
        return Some(top.idx);
      }
    }
  }

  /// Detaches the whole chain at once; nodes are released one by one while iterating.
  pub fn drain<'a>(&self, nodes: &'a Nodes) -> Drain<'a> {
    loop {
      let top = self.load();
      if top.idx == NIL {
        return Drain { nodes, next: NIL };
      }
      if nodes.get(top.idx).load().reach != Reach::InStack {
        continue;
      }
      if self.cas(top, top.succ(NIL)) {
        return Drain {
          nodes,
          next: top.idx,
        };
      }
    }
  }
}

/// Clears the stack fields of a node that left its stack.
fn detach(nodes: &Nodes, idx: u32) -> Word {
  let node = nodes.get(idx);
  let mut word = node.load();
  loop {
    match node.cas(word, word.with_next(NIL).with_reach(Reach::Detached)) {
      Ok(_) => break,
      Err(cur) => word = cur,
    }
  }
  node.clear_link();
  word
}

/// Iterator over a drained chain. Every yielded node is DETACHED and OCCUPIED.
pub(crate) struct Drain<'a> {
  nodes: &'a Nodes,
  next: u32,
}

impl Iterator for Drain<'_> {
  type Item = u32;

  fn next(&mut self) -> Option<u32> {
    if self.next == NIL {
      return None;
    }
    let idx = self.next;
    self.next = detach(self.nodes, idx).next;
    Some(idx)
  }
}

impl Drop for Drain<'_> {
  fn drop(&mut self) {
    // Never leave nodes marked IN_STACK without a stack.
    for _ in self.by_ref() {}
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  /// Table with `blocks` order 0 nodes marked OCCUPIED and DETACHED.
  fn occupied_nodes(blocks: usize) -> Nodes {
    let nodes = Nodes::new(blocks, 1, 0);
    for idx in 0..blocks as u32 {
      let node = nodes.get(idx);
      let cur = node.load();
      node.cas(cur, cur.with_state(State::Occupied)).unwrap();
    }
    nodes
  }

  #[test]
  fn lifo_order_and_length() {
    let nodes = occupied_nodes(4);
    let stack = Stack::new();
    assert!(stack.is_empty());
    assert_eq!(stack.pop(&nodes), None);

    for idx in 0..4 {
      assert!(stack.push(&nodes, idx));
      assert_eq!(stack.len(&nodes), idx as usize + 1);
    }

    for expected in (0..4).rev() {
      assert_eq!(stack.pop(&nodes), Some(expected));
      let word = nodes.get(expected).load();
      assert_eq!(word.reach, Reach::Detached);
      assert_eq!(word.next, NIL);
    }
    assert!(stack.is_empty());
    assert_eq!(stack.len(&nodes), 0);
  }

  #[test]
  fn push_requires_detached_occupied() {
    let nodes = occupied_nodes(2);
    let stack = Stack::new();
    assert!(stack.push(&nodes, 0));
    // Already IN_STACK.
    assert!(!stack.push(&nodes, 0));

    let node = nodes.get(1);
    let cur = node.load();
    node.cas(cur, cur.with_state(State::Free)).unwrap();
    assert!(!stack.push(&nodes, 1));
  }

  #[test]
  fn epoch_advances_on_every_change() {
    let nodes = occupied_nodes(1);
    let stack = Stack::new();
    let before = stack.load();
    stack.push(&nodes, 0);
    stack.pop(&nodes);
    let after = stack.load();
    assert_eq!(after.idx, before.idx);
    assert_eq!(after.epoch, before.epoch.wrapping_add(2));
  }

  #[test]
  fn length_of_a_replaced_top_is_not_trusted() {
    let nodes = occupied_nodes(2);
    let stack = Stack::new();
    stack.push(&nodes, 0);
    stack.push(&nodes, 1);
    let stale = stack.load();
    assert_eq!(stack.len_at(&nodes, stale), 2);

    // Same node on top again, recorded length unchanged, newer epoch.
    assert_eq!(stack.pop(&nodes), Some(1));
    assert!(stack.push(&nodes, 1));
    assert_eq!(stack.load().idx, stale.idx);
    assert_eq!(stack.len_at(&nodes, stale), 0);
    assert_eq!(stack.len(&nodes), 2);
  }

  #[test]
  fn drain_yields_everything_detached() {
    let nodes = occupied_nodes(8);
    let stack = Stack::new();
    for idx in 0..8 {
      stack.push(&nodes, idx);
    }

    let drained: Vec<_> = stack.drain(&nodes).collect();
    assert_eq!(drained, (0..8).rev().collect::<Vec<_>>());
    assert!(stack.is_empty());
    for idx in 0..8 {
      assert_eq!(nodes.get(idx).load().reach, Reach::Detached);
    }
  }

  #[test]
  fn dropped_drain_still_detaches() {
    let nodes = occupied_nodes(4);
    let stack = Stack::new();
    for idx in 0..4 {
      stack.push(&nodes, idx);
    }
    let mut drain = stack.drain(&nodes);
    assert_eq!(drain.next(), Some(3));
    drop(drain);
    for idx in 0..4 {
      assert_eq!(nodes.get(idx).load().reach, Reach::Detached);
    }
  }

  #[test]
  fn concurrent_push_pop_loses_nothing() {
    const THREADS: usize = 4;
    const PER_THREAD: usize = 256;
    const ROUNDS: usize = 200;

    let nodes = occupied_nodes(THREADS * PER_THREAD);
    let stack = Stack::new();

    std::thread::scope(|s| {
      for t in 0..THREADS {
        let (nodes, stack) = (&nodes, &stack);
        s.spawn(move || {
          let mut mine: Vec<u32> = (0..PER_THREAD).map(|i| (t * PER_THREAD + i) as u32).collect();
          for _ in 0..ROUNDS {
            for &idx in &mine {
              assert!(stack.push(nodes, idx));
            }
            let mut popped = Vec::with_capacity(PER_THREAD);
            while popped.len() < PER_THREAD {
              if let Some(idx) = stack.pop(nodes) {
                popped.push(idx);
              }
            }
            mine = popped;
          }
          for &idx in &mine {
            assert!(stack.push(nodes, idx));
          }
        });
      }
    });

    let mut all: Vec<_> = stack.drain(&nodes).collect();
    all.sort_unstable();
    assert_eq!(all, (0..(THREADS * PER_THREAD) as u32).collect::<Vec<_>>());
  }
}
