//! Packed node representation.
//!
//! Every arena block of `min_block` bytes has a [`Node`]. The list heads of all
//! zones live in the same table, right after the arena nodes, so that a single
//! 32-bit index can name either kind of node.

use core::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

// =============================================================================
// Constants
// =============================================================================

/// Index of the null node.
pub(crate) const NIL: u32 = u32::MAX;

const NEXT_MASK: u64 = 0xFFFF_FFFF;
const ORDER_SHIFT: u32 = 32;
const ORDER_MASK: u64 = 0xFF;
const STATE_SHIFT: u32 = 40;
const REACH_SHIFT: u32 = 42;
const TWO_BITS: u64 = 0b11;

// =============================================================================
// Types
// =============================================================================

#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum State {
  Free = 0,
  /// Part of a bigger block, or in the middle of a merge.
  Invalid = 1,
  Occupied = 2,
  /// List sentinel, doesn't represent a block.
  Head = 3,
}

/// Which structure currently owns a node.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Reach {
  Detached = 0,
  InList = 1,
  InStack = 2,
  /// An insertion into or removal from a list is in flight.
  Transitioning = 3,
}

impl State {
  #[inline]
  const fn from_bits(bits: u64) -> Self {
    match bits & TWO_BITS {
      0 => Self::Free,
      1 => Self::Invalid,
      2 => Self::Occupied,
      _ => Self::Head,
    }
  }
}

impl Reach {
  #[inline]
  const fn from_bits(bits: u64) -> Self {
    match bits & TWO_BITS {
      0 => Self::Detached,
      1 => Self::InList,
      2 => Self::InStack,
      _ => Self::Transitioning,
    }
  }
}

/// Decoded content of a node's packed word.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct Word {
  pub next: u32,
  pub order: u8,
  pub state: State,
  pub reach: Reach,
}

impl Word {
  #[inline]
  pub const fn new(next: u32, order: u8, state: State, reach: Reach) -> Self {
    Self {
      next,
      order,
      state,
      reach,
    }
  }

  #[inline]
  pub const fn encode(self) -> u64 {
    self.next as u64
      | (self.order as u64) << ORDER_SHIFT
      | (self.state as u64) << STATE_SHIFT
      | (self.reach as u64) << REACH_SHIFT
  }

  #[inline]
  pub const fn decode(raw: u64) -> Self {
    Self {
      next: (raw & NEXT_MASK) as u32,
      order: ((raw >> ORDER_SHIFT) & ORDER_MASK) as u8,
      state: State::from_bits(raw >> STATE_SHIFT),
      reach: Reach::from_bits(raw >> REACH_SHIFT),
    }
  }

  #[inline]
  pub const fn with_next(self, next: u32) -> Self {
    Self { next, ..self }
  }

  #[inline]
  pub const fn with_order(self, order: u8) -> Self {
    Self { order, ..self }
  }

  #[inline]
  pub const fn with_state(self, state: State) -> Self {
    Self { state, ..self }
  }

  #[inline]
  pub const fn with_reach(self, reach: Reach) -> Self {
    Self { reach, ..self }
  }

  #[inline]
  pub const fn order(&self) -> usize {
    self.order as usize
  }
}

/// One arena block or one list head.
#[repr(C, align(64))]
pub(crate) struct Node {
  word: AtomicU64,
  /// `prev` while the node is listed, stack length while it is the top of a stack.
  /// Only the thread holding the node's `reach` lease writes it.
  link: AtomicU64,
}

impl core::fmt::Debug for Node {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    let word = self.load();
    f.debug_struct("Node")
      .field("next", &word.next)
      .field("order", &word.order)
      .field("state", &word.state)
      .field("reach", &word.reach)
      .field("link", &self.link.load(Ordering::Relaxed))
      .finish()
  }
}

impl Node {
  const fn new(word: Word) -> Self {
    Self {
      word: AtomicU64::new(word.encode()),
      link: AtomicU64::new(NIL as u64),
    }
  }

  #[inline]
  pub fn load(&self) -> Word {
    Word::decode(self.word.load(Ordering::Acquire))
  }

  /// Single-word CAS: either every field changes or none does.
  #[inline]
  pub fn cas(&self, current: Word, new: Word) -> Result<Word, Word> {
    match self.word.compare_exchange(
      current.encode(),
      new.encode(),
      Ordering::AcqRel,
      Ordering::Acquire,
    ) {
      Ok(raw) => Ok(Word::decode(raw)),
      Err(raw) => Err(Word::decode(raw)),
    }
  }

  /// CAS loop driven by `f`; stops with `Err` as soon as `f` declines the current word.
  #[inline]
  pub fn update<F>(&self, mut f: F) -> Result<Word, Word>
  where
    F: FnMut(Word) -> Option<Word>,
  {
    self
      .word
      .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
        f(Word::decode(raw)).map(Word::encode)
      })
      .map(Word::decode)
      .map_err(Word::decode)
  }

  /// Moves `state` from `from` to `to` if `reach` and `order` are the expected ones.
  #[inline]
  pub fn change_state(&self, from: State, to: State, reach: Reach, order: u8) -> bool {
    let cur = self.load();
    if cur.state != from || cur.reach != reach || cur.order != order {
      return false;
    }
    self.cas(cur, cur.with_state(to)).is_ok()
  }

  #[inline]
  pub fn prev(&self) -> u32 {
    self.link.load(Ordering::Acquire) as u32
  }

  #[inline]
  pub fn set_prev(&self, prev: u32) {
    self.link.store(prev as u64, Ordering::Release);
  }

  #[inline]
  pub fn stack_len(&self) -> u64 {
    self.link.load(Ordering::Acquire)
  }

  #[inline]
  pub fn set_stack_len(&self, len: u64) {
    self.link.store(len, Ordering::Release);
  }

  #[inline]
  pub fn clear_link(&self) {
    self.link.store(NIL as u64, Ordering::Release);
  }
}

// =============================================================================
// Node table
// =============================================================================

/// Arena nodes followed by `zones * (max_order + 1)` list heads.
pub(crate) struct Nodes {
  slots: Box<[Node]>,
  /// Number of arena nodes.
  blocks: u32,
  zones: u32,
  /// Arena nodes owned by each zone, a multiple of `2^max_order`.
  per_zone: u32,
  max_order: u8,
  /// Per zone and per order `D = N - 2S - L`, only touched with delay accounting on.
  delay: Box<[CachePadded<AtomicI64>]>,
}

impl core::fmt::Debug for Nodes {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    f.debug_struct("Nodes")
      .field("blocks", &self.blocks)
      .field("zones", &self.zones)
      .field("per_zone", &self.per_zone)
      .field("max_order", &self.max_order)
      .finish()
  }
}

impl Nodes {
  /// Builds the table with heads linked in a ring across zones and every
  /// `2^max_order`-th node FREE; inserting those nodes is up to the caller.
  pub fn new(blocks: usize, zones: usize, max_order: usize) -> Self {
    debug_assert!(blocks.is_power_of_two() && blocks >> max_order >= zones && zones >= 1);

    let levels = max_order + 1;
    let per_zone = ((blocks / zones) >> max_order) << max_order;
    let total = blocks + zones * levels;

    let mut slots = Vec::with_capacity(total);
    for i in 0..blocks {
      let word = if i % (1 << max_order) == 0 {
        Word::new(NIL, max_order as u8, State::Free, Reach::Detached)
      } else {
        Word::new(NIL, 0, State::Invalid, Reach::Detached)
      };
      slots.push(Node::new(word));
    }

    for zone in 0..zones {
      for order in 0..levels {
        let next = blocks + ((zone + 1) % zones) * levels + order;
        let prev = blocks + ((zone + zones - 1) % zones) * levels + order;
        let head = Node::new(Word::new(
          next as u32,
          order as u8,
          State::Head,
          Reach::InList,
        ));
        head.set_prev(prev as u32);
        slots.push(head);
      }
    }

    let delay = (0..zones * levels)
      .map(|_| CachePadded::new(AtomicI64::new(0)))
      .collect();

    Self {
      slots: slots.into_boxed_slice(),
      blocks: blocks as u32,
      zones: zones as u32,
      per_zone: per_zone as u32,
      max_order: max_order as u8,
      delay,
    }
  }

  #[inline]
  pub fn get(&self, idx: u32) -> &Node {
    &self.slots[idx as usize]
  }

  #[inline]
  pub fn blocks(&self) -> u32 {
    self.blocks
  }

  #[inline]
  pub fn is_block(&self, idx: u32) -> bool {
    idx < self.blocks
  }

  /// Zone owning the arena node `idx`. Buddies always share the owner.
  #[inline]
  pub fn owner(&self, idx: u32) -> usize {
    debug_assert!(self.is_block(idx));
    ((idx / self.per_zone) % self.zones) as usize
  }

  #[inline]
  pub fn head(&self, zone: usize, order: usize) -> u32 {
    self.blocks + (zone * (self.max_order as usize + 1) + order) as u32
  }

  #[inline]
  pub fn buddy(&self, idx: u32, order: usize) -> u32 {
    idx ^ (1 << order)
  }

  #[inline]
  pub fn delay(&self, zone: usize, order: usize) -> &AtomicI64 {
    &self.delay[zone * (self.max_order as usize + 1) + order]
  }

  /// Indices of the arena nodes that start out FREE.
  pub fn initial_blocks(&self) -> impl Iterator<Item = u32> {
    (0..self.blocks).step_by(1 << self.max_order)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn word_packing() {
    let word = Word::new(0xDEAD_BEEF, 17, State::Occupied, Reach::Transitioning);
    assert_eq!(Word::decode(word.encode()), word);

    let nil = Word::new(NIL, 0, State::Free, Reach::Detached);
    assert_eq!(Word::decode(nil.encode()).next, NIL);

    let head = Word::new(3, 255, State::Head, Reach::InStack);
    let back = Word::decode(head.encode());
    assert_eq!(back.order, 255);
    assert_eq!(back.state, State::Head);
    assert_eq!(back.reach, Reach::InStack);
  }

  #[test]
  fn cas_changes_every_field_at_once() {
    let node = Node::new(Word::new(NIL, 2, State::Free, Reach::InList));
    let cur = node.load();
    let new = Word::new(7, 3, State::Occupied, Reach::Transitioning);

    assert!(node.cas(cur, new).is_ok());
    assert_eq!(node.load(), new);
    // A stale expectation must fail and report the current word.
    assert_eq!(node.cas(cur, cur), Err(new));
  }

  #[test]
  fn change_state_checks_reach_and_order() {
    let node = Node::new(Word::new(NIL, 2, State::Free, Reach::InList));
    assert!(!node.change_state(State::Free, State::Occupied, Reach::Detached, 2));
    assert!(!node.change_state(State::Free, State::Occupied, Reach::InList, 1));
    assert!(node.change_state(State::Free, State::Occupied, Reach::InList, 2));
    assert_eq!(node.load().state, State::Occupied);
  }

  #[test]
  fn table_layout() {
    let nodes = Nodes::new(64, 2, 3);
    assert_eq!(nodes.blocks(), 64);
    assert_eq!(nodes.owner(0), 0);
    assert_eq!(nodes.owner(31), 0);
    assert_eq!(nodes.owner(32), 1);
    assert_eq!(nodes.buddy(8, 3), 0);
    assert_eq!(nodes.buddy(4, 2), 0);
    assert_eq!(nodes.buddy(0, 0), 1);

    let free: Vec<_> = nodes.initial_blocks().collect();
    assert_eq!(free, (0..64).step_by(8).collect::<Vec<u32>>());
    for idx in 0..64 {
      let word = nodes.get(idx).load();
      if idx % 8 == 0 {
        assert_eq!((word.state, word.order), (State::Free, 3));
      } else {
        assert_eq!(word.state, State::Invalid);
      }
    }
  }

  #[test]
  fn heads_form_a_ring_per_order() {
    let nodes = Nodes::new(64, 3, 3);
    for order in 0..=3 {
      let mut cur = nodes.head(0, order);
      for step in 1..=3 {
        let word = nodes.get(cur).load();
        assert_eq!(word.state, State::Head);
        assert_eq!(word.order(), order);
        assert_eq!(nodes.get(word.next).prev(), cur);
        cur = word.next;
        assert_eq!(cur, nodes.head(step % 3, order));
      }
    }
  }

  #[test]
  fn uneven_zones_round_down_to_max_blocks() {
    // 64 blocks over 3 zones: 21 per zone, rounded down to 16 (max order 3 is 8 blocks).
    let nodes = Nodes::new(64, 3, 3);
    assert_eq!(nodes.owner(15), 0);
    assert_eq!(nodes.owner(16), 1);
    assert_eq!(nodes.owner(48), 0);
  }
}
