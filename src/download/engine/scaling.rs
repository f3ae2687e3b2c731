//! Worker-count feedback controller.
//!
//! The controller never touches transfers. It receives one
//! [`ScalingSample`] per interval and answers with a [`ScalingDecision`];
//! the dispatcher applies the new target by dispatching more tasks or by
//! withholding dispatch until enough in-flight transfers finish.

use std::time::Duration;

use tracing::debug;

use crate::download::constants::{DEFAULT_SCALING_INTERVAL, MAX_WORKERS_CEILING};

/// Worker count a dynamically scaled run starts with.
const INITIAL_DYNAMIC_WORKERS: usize = 4;

/// Tuning knobs for [`ScalingController`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScalingConfig {
    /// When false the target stays at the configured maximum.
    pub enabled: bool,
    /// Time between samples.
    pub interval: Duration,
    /// Growth requires a failure rate strictly below this.
    pub grow_below_failure_rate: f64,
    /// A failure rate at or above this halves the target.
    pub halve_at_failure_rate: f64,
    /// Relative throughput gain that counts as "rose".
    pub min_gain: f64,
    /// Intervals to hold after a plateau shrink.
    pub cooldown_intervals: u32,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: DEFAULT_SCALING_INTERVAL,
            grow_below_failure_rate: 0.05,
            halve_at_failure_rate: 0.25,
            min_gain: 0.05,
            cooldown_intervals: 3,
        }
    }
}

impl ScalingConfig {
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

/// Observations over one interval.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScalingSample {
    /// Aggregate body bytes per second.
    pub bytes_per_sec: f64,
    /// Transfers that completed.
    pub completions: u64,
    /// Transfer attempts that failed (retried or terminal).
    pub failures: u64,
    /// Transfers running at sample time.
    pub active: usize,
}

impl ScalingSample {
    #[allow(clippy::cast_precision_loss)]
    fn failure_rate(&self) -> f64 {
        let attempts = self.completions + self.failures;
        if attempts == 0 {
            0.0
        } else {
            self.failures as f64 / attempts as f64
        }
    }

    fn is_idle(&self) -> bool {
        self.active == 0 && self.completions == 0 && self.failures == 0
    }
}

/// Outcome of one observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingDecision {
    Grow(usize),
    Shrink(usize),
    Hold,
}

/// Bounded worker-count controller.
#[derive(Debug, Clone)]
pub struct ScalingController {
    config: ScalingConfig,
    ceiling: usize,
    current: usize,
    last_throughput: Option<f64>,
    throughput_before_grow: Option<f64>,
    cooldown: u32,
}

impl ScalingController {
    /// Creates a controller for at most `max_workers` (clamped to 1..=64).
    #[must_use]
    pub fn new(max_workers: usize, config: ScalingConfig) -> Self {
        let ceiling = max_workers.clamp(1, MAX_WORKERS_CEILING);
        let current = if config.enabled {
            ceiling.min(INITIAL_DYNAMIC_WORKERS)
        } else {
            ceiling
        };
        Self {
            config,
            ceiling,
            current,
            last_throughput: None,
            throughput_before_grow: None,
            cooldown: 0,
        }
    }

    /// Current worker target.
    #[must_use]
    pub fn target(&self) -> usize {
        self.current
    }

    #[must_use]
    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// Feeds one interval of observations and returns the decision.
    pub fn observe(&mut self, sample: ScalingSample) -> ScalingDecision {
        if !self.config.enabled || sample.is_idle() {
            return ScalingDecision::Hold;
        }

        let failure_rate = sample.failure_rate();
        let previous = self.last_throughput.replace(sample.bytes_per_sec);
        let before_grow = self.throughput_before_grow.take();

        if failure_rate >= self.config.halve_at_failure_rate {
            self.cooldown = self.config.cooldown_intervals;
            return self.set((self.current / 2).max(1));
        }

        if self.cooldown > 0 {
            self.cooldown -= 1;
            return ScalingDecision::Hold;
        }

        let gained = |baseline: f64| sample.bytes_per_sec > baseline * (1.0 + self.config.min_gain);

        if let Some(baseline) = before_grow
            && !gained(baseline)
        {
            debug!(
                baseline,
                observed = sample.bytes_per_sec,
                "growth did not pay off"
            );
            self.cooldown = self.config.cooldown_intervals;
            return self.set(self.current.saturating_sub(1).max(1));
        }

        let rose = previous.is_none_or(gained) && sample.bytes_per_sec > 0.0;
        if rose && failure_rate < self.config.grow_below_failure_rate && self.current < self.ceiling
        {
            self.throughput_before_grow = Some(sample.bytes_per_sec);
            return self.set(self.current + 1);
        }

        ScalingDecision::Hold
    }

    fn set(&mut self, target: usize) -> ScalingDecision {
        let target = target.clamp(1, self.ceiling);
        let decision = match target.cmp(&self.current) {
            std::cmp::Ordering::Greater => ScalingDecision::Grow(target),
            std::cmp::Ordering::Less => ScalingDecision::Shrink(target),
            std::cmp::Ordering::Equal => ScalingDecision::Hold,
        };
        self.current = target;
        decision
    }
}
