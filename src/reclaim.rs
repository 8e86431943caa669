//! Background reclamation: one worker per zone moves released blocks from
//! the stacks back into the lists, merging buddies on the way.

use core::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_utils::Backoff;

use crate::allocator::Shared;
use crate::cpu;
use crate::error::{Error, Result};
use crate::lease::LeaseGuard;

pub(crate) fn spawn(shared: &Arc<Shared>, zone: usize) -> Result<JoinHandle<()>> {
  let shared = Arc::clone(shared);
  thread::Builder::new()
    .name(format!("nbbuddy-reclaim-{zone}"))
    .spawn(move || worker(&shared, zone))
    .map_err(|source| Error::Spawn { zone, source })
}

fn worker(shared: &Shared, zone: usize) {
  if shared.conf.pin_workers
    && let Err(err) = cpu::pin_to(zone)
  {
    tracing::warn!(zone, %err, "could not pin reclamation worker");
  }
  tracing::debug!(zone, "reclamation worker started");

  let signal = &shared.zones[zone].signal;
  while !shared.shutdown.load(Ordering::Acquire) {
    signal.wait(shared.conf.idle_timeout);
    if shared.shutdown.load(Ordering::Acquire) {
      break;
    }

    let moved = shared.clean_zone(zone);
    if moved > 0 {
      tracing::debug!(zone, moved, "reclaimed");
    }
    signal.reset();
  }

  tracing::debug!(zone, "reclamation worker stopped");
}

impl Shared {
  /// One worker round over `zone`. Pops one block at a time so that blocks
  /// left in the stack can still be reused as they are. Returns the number of
  /// blocks moved.
  pub fn clean_zone(&self, zone: usize) -> usize {
    let nodes = &self.nodes;
    let mut moved = 0;

    for order in 0..=self.max_order() {
      let stack = self.stack(zone, order);
      if stack.is_empty() {
        continue;
      }
      if self.conf.delay_accounting && self.delay(zone, order) >= 0 {
        continue;
      }

      // Somebody is already working on the lists, try later.
      let Some(guard) = self.lease(zone).try_acquire() else {
        break;
      };

      while !self.conf.delay_accounting || self.delay(zone, order) < 0 {
        let Some(idx) = stack.pop(nodes) else {
          break;
        };
        self.account(zone, order, 2);
        self.merge_and_list(&guard, idx);
        moved += 1;
      }
    }
    moved
  }

  /// Empties every stack of `zone`. The caller holds the zone's lease.
  fn drain_zone(&self, guard: &LeaseGuard<'_>, zone: usize) -> usize {
    let mut drained = 0;
    for order in 0..=self.max_order() {
      for idx in self.stack(zone, order).drain(&self.nodes) {
        self.account(zone, order, 2);
        self.merge_and_list(guard, idx);
        drained += 1;
      }
    }
    drained
  }

  /// Drains the zones whose lease is free right now.
  pub fn drain_available(&self) -> usize {
    (0..self.zone_count())
      .filter_map(|zone| {
        let guard = self.lease(zone).try_acquire()?;
        Some(self.drain_zone(&guard, zone))
      })
      .sum()
  }

  /// Drains every zone, waiting for each lease in turn.
  pub fn reclaim_all(&self) -> usize {
    let mut drained = 0;
    for zone in 0..self.zone_count() {
      let backoff = Backoff::new();
      let guard = loop {
        if let Some(guard) = self.lease(zone).try_acquire() {
          break guard;
        }
        if backoff.is_completed() {
          thread::yield_now();
        } else {
          backoff.snooze();
        }
      };
      drained += self.drain_zone(&guard, zone);
    }
    tracing::debug!(drained, "reclaimed every zone");
    drained
  }
}
