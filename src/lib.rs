//! Non-blocking buddy allocator with per-core zones.
//!
//! A single arena is reserved up front and carved into power-of-two blocks.
//! Every CPU maps to a zone owning a slice of the arena, with one free list
//! and one stack of recently released blocks per order. Allocation and release
//! never block: list mutation needs the zone's lease, and whoever cannot get
//! it takes a path that stays correct without it. A background worker per
//! zone merges the stacked blocks back with their buddies.

mod alloc;
mod allocator;
mod arena;
mod config;
mod cpu;
mod diagnostics;
mod error;
mod free;
mod heuristics;
mod lease;
mod list;
mod node;
mod reclaim;
mod signal;
mod stack;

pub use allocator::BuddyAllocator;
pub use config::{
  Config, DEFAULT_EMA_WEIGHT, DEFAULT_HISTOGRAM_WINDOW, DEFAULT_IDLE_TIMEOUT, DEFAULT_LEVELS,
  DEFAULT_MAX_ORDER, DEFAULT_MIN_BLOCK, DEFAULT_STACK_THRESHOLD, DEFAULT_WAKE_COOLDOWN, Heuristic,
  ORDER_LIMIT,
};
pub use diagnostics::Sweep;
pub use error::{Error, Result};
