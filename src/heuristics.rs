//! Per-thread estimators for the fast release decision.
//!
//! A block whose order is "hot" for the releasing thread goes straight to the
//! zone stack, betting that the same thread will ask for that order again
//! soon. Cold orders take the coalescing path. Neither choice affects
//! correctness.

use std::cell::RefCell;

use crate::config::{Config, Heuristic};

/// Online model of the orders a thread allocates.
pub(crate) trait FastFree {
  fn record(&mut self, order: usize);

  fn is_hot(&self, order: usize) -> bool;
}

/// Exponential moving average of the requested order.
#[derive(Debug, Clone)]
pub(crate) struct Ema {
  avg: f32,
  weight: f32,
}

impl Ema {
  pub fn new(weight: f32) -> Self {
    Self { avg: 0.0, weight }
  }
}

impl FastFree for Ema {
  #[inline]
  fn record(&mut self, order: usize) {
    self.avg = self.avg * (1.0 - self.weight) + self.weight * order as f32;
  }

  #[inline]
  fn is_hot(&self, order: usize) -> bool {
    order as f32 >= self.avg
  }
}

/// Windowed estimate of the order distribution.
///
/// Every `window` allocations the distribution is blended half and half with
/// the frequencies observed in the window, and the decision for every order is
/// precomputed in a bitmap: an order is hot when the requests at or below it
/// are at least as likely as the ones above it.
#[derive(Debug, Clone)]
pub(crate) struct Histogram {
  distrib: Vec<f32>,
  counts: Vec<u32>,
  seen: usize,
  window: usize,
  decision: u64,
}

impl Histogram {
  pub fn new(max_order: usize, window: usize) -> Self {
    let levels = max_order + 1;
    let mut hist = Self {
      distrib: vec![1.0 / levels as f32; levels],
      counts: vec![0; levels],
      seen: 0,
      window,
      decision: 0,
    };
    hist.decide();
    hist
  }

  #[inline]
  fn max_order(&self) -> usize {
    self.distrib.len() - 1
  }

  fn refresh(&mut self) {
    for (p, count) in self.distrib.iter_mut().zip(self.counts.iter_mut()) {
      *p = 0.5 * *p + 0.5 * (*count as f32 / self.window as f32);
      *count = 0;
    }
    self.seen = 0;
    self.decide();
  }

  fn decide(&mut self) {
    // MAX_ORDER blocks never merge any further, always hot.
    let mut decision = 1u64 << self.max_order();
    let mut p = 0.0;
    for (order, weight) in self.distrib[..self.max_order()].iter().enumerate() {
      p += weight;
      if p >= 0.5 {
        decision |= 1 << order;
      }
    }
    self.decision = decision;
  }
}

impl FastFree for Histogram {
  fn record(&mut self, order: usize) {
    let slot = order.min(self.max_order());
    self.counts[slot] += 1;
    self.seen += 1;
    if self.seen >= self.window {
      self.refresh();
    }
  }

  #[inline]
  fn is_hot(&self, order: usize) -> bool {
    self.decision & (1 << order) != 0
  }
}

// =============================================================================
// Thread-local model
// =============================================================================

enum Model {
  Ema(Ema),
  Histogram(Histogram),
}

impl Model {
  fn build(conf: &Config) -> Option<Self> {
    match conf.heuristic {
      Heuristic::Off => None,
      Heuristic::Ema => Some(Self::Ema(Ema::new(conf.ema_weight))),
      Heuristic::Histogram => Some(Self::Histogram(Histogram::new(
        conf.max_order,
        conf.histogram_window,
      ))),
    }
  }

  fn fits(&self, conf: &Config) -> bool {
    match self {
      Self::Ema(ema) => conf.heuristic == Heuristic::Ema && ema.weight == conf.ema_weight,
      Self::Histogram(hist) => {
        conf.heuristic == Heuristic::Histogram
          && hist.max_order() == conf.max_order
          && hist.window == conf.histogram_window
      }
    }
  }

  fn as_dyn(&mut self) -> &mut dyn FastFree {
    match self {
      Self::Ema(m) => m,
      Self::Histogram(m) => m,
    }
  }
}

thread_local! {
  static MODEL: RefCell<Option<Model>> = const { RefCell::new(None) };
}

fn with_model<R>(conf: &Config, f: impl FnOnce(&mut dyn FastFree) -> R) -> Option<R> {
  MODEL
    .try_with(|cell| {
      let mut slot = cell.try_borrow_mut().ok()?;
      if !slot.as_ref().is_some_and(|m| m.fits(conf)) {
        *slot = Model::build(conf);
      }
      slot.as_mut().map(|m| f(m.as_dyn()))
    })
    .ok()
    .flatten()
}

/// Feeds an allocation of `order` to the calling thread's model.
#[inline]
pub(crate) fn record(conf: &Config, order: usize) {
  if conf.heuristic != Heuristic::Off {
    with_model(conf, |m| m.record(order));
  }
}

/// Whether the calling thread's model wants blocks of `order` released to the stack.
#[inline]
pub(crate) fn is_hot(conf: &Config, order: usize) -> bool {
  if conf.heuristic == Heuristic::Off {
    return false;
  }
  with_model(conf, |m| m.is_hot(order)).unwrap_or(false)
}
