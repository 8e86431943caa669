use std::time::Duration;

use crate::error::{Error, Result};

// =============================================================================
// Defaults
// =============================================================================

pub const DEFAULT_MIN_BLOCK: usize = 4096;
pub const DEFAULT_MAX_ORDER: usize = 10;
/// 2^15 minimum blocks, 128MB with the default block size.
pub const DEFAULT_LEVELS: usize = 16;
/// Determines the laziness of the buddy system.
pub const DEFAULT_STACK_THRESHOLD: usize = 32;
pub const DEFAULT_WAKE_COOLDOWN: Duration = Duration::from_millis(5);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(100);
pub const DEFAULT_EMA_WEIGHT: f32 = 0.5;
pub const DEFAULT_HISTOGRAM_WINDOW: usize = 128;

/// Upper bound for `max_order` and `levels - 1`: node indices are 32 bits wide.
pub const ORDER_LIMIT: usize = 31;

// =============================================================================
// Config
// =============================================================================

/// Which estimator decides between fast (stack) and slow (coalescing) release.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Heuristic {
  /// Only the stack low-water mark (and delay accounting, if on) picks the fast path.
  Off,
  /// Exponential moving average of the allocation order, per thread.
  Ema,
  /// Windowed histogram of allocation orders, per thread.
  Histogram,
}

impl core::str::FromStr for Heuristic {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    match s.trim().to_ascii_lowercase().as_str() {
      "off" | "none" => Ok(Self::Off),
      "ema" | "avg" => Ok(Self::Ema),
      "histogram" | "hist" => Ok(Self::Histogram),
      other => Err(Error::config(format!("unknown heuristic `{other}`"))),
    }
  }
}

#[derive(Clone, Debug)]
pub struct Config {
  /// Size of an order 0 block, a power of two.
  pub min_block: usize,
  pub max_order: usize,
  /// The arena holds `2^(levels - 1)` minimum blocks.
  pub levels: usize,
  /// Requested number of core zones; `None` uses the available parallelism.
  pub zones: Option<usize>,
  /// Stack length that triggers a wake-up; half of it is the fast path low-water mark.
  pub stack_threshold: usize,
  /// Minimum delay between two wake-ups of the same worker.
  pub wake_cooldown: Duration,
  /// How long a worker sleeps when nobody signals it.
  pub idle_timeout: Duration,
  pub workers: bool,
  /// Pin each worker to the CPU with the same index as its zone (Linux only).
  pub pin_workers: bool,
  pub heuristic: Heuristic,
  pub ema_weight: f32,
  pub histogram_window: usize,
  /// Track `D = N - 2S - L` per zone and order to drive the fast path and wake-ups.
  pub delay_accounting: bool,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      min_block: DEFAULT_MIN_BLOCK,
      max_order: DEFAULT_MAX_ORDER,
      levels: DEFAULT_LEVELS,
      zones: None,
      stack_threshold: DEFAULT_STACK_THRESHOLD,
      wake_cooldown: DEFAULT_WAKE_COOLDOWN,
      idle_timeout: DEFAULT_IDLE_TIMEOUT,
      workers: true,
      pin_workers: false,
      heuristic: Heuristic::Ema,
      ema_weight: DEFAULT_EMA_WEIGHT,
      histogram_window: DEFAULT_HISTOGRAM_WINDOW,
      delay_accounting: false,
    }
  }
}

impl Config {
  pub fn with_min_block(self, min_block: usize) -> Self {
    Self { min_block, ..self }
  }

  pub fn with_max_order(self, max_order: usize) -> Self {
    Self { max_order, ..self }
  }

  pub fn with_levels(self, levels: usize) -> Self {
    Self { levels, ..self }
  }

  pub fn with_zones(self, zones: usize) -> Self {
    Self {
      zones: Some(zones),
      ..self
    }
  }

  pub fn with_stack_threshold(self, stack_threshold: usize) -> Self {
    Self {
      stack_threshold,
      ..self
    }
  }

  pub fn with_wake_cooldown(self, wake_cooldown: Duration) -> Self {
    Self {
      wake_cooldown,
      ..self
    }
  }

  pub fn with_idle_timeout(self, idle_timeout: Duration) -> Self {
    Self {
      idle_timeout,
      ..self
    }
  }

  pub fn with_workers(self, workers: bool) -> Self {
    Self { workers, ..self }
  }

  pub fn with_pin_workers(self, pin_workers: bool) -> Self {
    Self {
      pin_workers,
      ..self
    }
  }

  pub fn with_heuristic(self, heuristic: Heuristic) -> Self {
    Self { heuristic, ..self }
  }

  pub fn with_ema_weight(self, ema_weight: f32) -> Self {
    Self { ema_weight, ..self }
  }

  pub fn with_histogram_window(self, histogram_window: usize) -> Self {
    Self {
      histogram_window,
      ..self
    }
  }

  pub fn with_delay_accounting(self, delay_accounting: bool) -> Self {
    Self {
      delay_accounting,
      ..self
    }
  }

  /// Defaults overlaid with the `NBBUDDY_*` environment variables.
  pub fn from_env() -> Result<Self> {
    Self::from_lookup(|key| std::env::var(key).ok())
  }

  /// Defaults overlaid with whatever `lookup` returns for each `NBBUDDY_*` key.
  pub fn from_lookup<F>(lookup: F) -> Result<Self>
  where
    F: Fn(&str) -> Option<String>,
  {
    let mut conf = Self::default();

    if let Some(v) = parse::<usize>(&lookup, "NBBUDDY_MIN_BLOCK")? {
      conf.min_block = v;
    }
    if let Some(v) = parse::<usize>(&lookup, "NBBUDDY_MAX_ORDER")? {
      conf.max_order = v;
    }
    if let Some(v) = parse::<usize>(&lookup, "NBBUDDY_LEVELS")? {
      conf.levels = v;
    }
    if let Some(v) = parse::<usize>(&lookup, "NBBUDDY_ZONES")? {
      conf.zones = Some(v);
    }
    if let Some(v) = parse::<usize>(&lookup, "NBBUDDY_STACK_THRESHOLD")? {
      conf.stack_threshold = v;
    }
    if let Some(v) = parse::<u64>(&lookup, "NBBUDDY_WAKE_COOLDOWN_US")? {
      conf.wake_cooldown = Duration::from_micros(v);
    }
    if let Some(v) = parse_flag(&lookup, "NBBUDDY_WORKERS")? {
      conf.workers = v;
    }
    if let Some(v) = parse::<Heuristic>(&lookup, "NBBUDDY_HEURISTIC")? {
      conf.heuristic = v;
    }
    if let Some(v) = parse_flag(&lookup, "NBBUDDY_DELAY_ACCOUNTING")? {
      conf.delay_accounting = v;
    }

    conf.validate()?;
    Ok(conf)
  }

  pub fn validate(&self) -> Result<()> {
    if !self.min_block.is_power_of_two() {
      return Err(Error::config("min_block must be a power of two"));
    }
    if self.levels == 0 || self.levels - 1 > ORDER_LIMIT {
      return Err(Error::config(format!(
        "levels must be within 1..={}",
        ORDER_LIMIT + 1
      )));
    }
    if self.max_order > self.levels - 1 {
      return Err(Error::config(
        "the arena must hold at least one MAX_ORDER block (max_order <= levels - 1)",
      ));
    }
    if self.arena_size().is_none() {
      return Err(Error::config("arena size overflows usize"));
    }
    if self.zones == Some(0) {
      return Err(Error::config("zones must be at least 1"));
    }
    if !(self.ema_weight > 0.0 && self.ema_weight <= 1.0) {
      return Err(Error::config("ema_weight must be within (0, 1]"));
    }
    if self.histogram_window == 0 {
      return Err(Error::config("histogram_window must be at least 1"));
    }
    Ok(())
  }

  /// Number of minimum blocks in the arena.
  #[inline]
  pub fn arena_blocks(&self) -> usize {
    1 << (self.levels - 1)
  }

  #[inline]
  pub fn arena_size(&self) -> Option<usize> {
    self.arena_blocks().checked_mul(self.min_block)
  }

  #[inline]
  pub fn max_block(&self) -> usize {
    self.min_block << self.max_order
  }

  /// Fast path release happens while the stack is shorter than this.
  #[inline]
  pub fn low_water(&self) -> usize {
    self.stack_threshold / 2
  }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
  T: core::str::FromStr,
{
  match lookup(key) {
    None => Ok(None),
    Some(raw) => raw
      .trim()
      .parse::<T>()
      .map(Some)
      .map_err(|_| Error::config(format!("{key}: cannot parse `{raw}`"))),
  }
}

fn parse_flag(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<bool>> {
  match lookup(key) {
    None => Ok(None),
    Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
      "1" | "true" | "on" | "yes" => Ok(Some(true)),
      "0" | "false" | "off" | "no" => Ok(Some(false)),
      _ => Err(Error::config(format!("{key}: expected a boolean, got `{raw}`"))),
    },
  }
}
