//! Adaptive rate control
//!
//! A token bucket whose refill rate follows observed probe health. Every
//! `batch_size` completed probes the controller compares the batch success
//! ratio and the moving-average latency against two threshold pairs, picks a
//! target rate one growth step up or down (or stays), and moves the current
//! rate a `smoothing` fraction of the way there, clamped to `[min, max]`.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use crate::config::RateConfig;

/// Point-in-time view of the controller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateSnapshot {
    pub current_rate: f64,
    pub admitted: u64,
    pub completed: u64,
    pub succeeded: u64,
    pub adjustments: u64,
    pub avg_latency_ms: f64,
}

#[derive(Debug)]
struct RateState {
    current_rate: f64,
    permits: f64,
    last_refill: Instant,
    latencies: VecDeque<Duration>,
    batch_completed: u32,
    batch_succeeded: u32,
    admitted: u64,
    completed: u64,
    succeeded: u64,
    adjustments: u64,
}

impl RateState {
    fn refill(&mut self, now: Instant, burst: f64) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        let added = elapsed * self.current_rate;
        if added.is_finite() && added > 0.0 {
            self.permits = (self.permits + added).min(burst);
        }
        self.last_refill = now;
    }

    fn avg_latency(&self) -> Duration {
        if self.latencies.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = self.latencies.iter().sum();
        total / self.latencies.len() as u32
    }
}

pub struct AdaptiveRateController {
    config: RateConfig,
    state: RwLock<RateState>,
}

impl AdaptiveRateController {
    pub fn new(config: RateConfig) -> Self {
        let current_rate = config.initial_rate.clamp(config.min_rate, config.max_rate);
        let state = RateState {
            current_rate,
            permits: config.burst,
            last_refill: Instant::now(),
            latencies: VecDeque::with_capacity(config.latency_window),
            batch_completed: 0,
            batch_succeeded: 0,
            admitted: 0,
            completed: 0,
            succeeded: 0,
            adjustments: 0,
        };

        Self {
            config,
            state: RwLock::new(state),
        }
    }

    /// Take one permit if available. Never blocks.
    pub fn try_admit(&self) -> bool {
        let mut state = match self.state.write() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.refill(Instant::now(), self.config.burst);

        if state.permits >= 1.0 {
            state.permits -= 1.0;
            state.admitted += 1;
            true
        } else {
            false
        }
    }

    /// Time until the next permit accrues at the current rate
    pub fn delay_until_next(&self) -> Duration {
        let state = match self.state.read() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if state.permits >= 1.0 {
            return Duration::ZERO;
        }

        let elapsed = state.last_refill.elapsed().as_secs_f64();
        let available = state.permits + elapsed * state.current_rate;
        if available >= 1.0 {
            return Duration::ZERO;
        }
        let secs = (1.0 - available) / state.current_rate;
        if secs.is_finite() && secs >= 0.0 {
            Duration::from_secs_f64(secs.min(1.0))
        } else {
            Duration::from_millis(100)
        }
    }

    /// Record one finished probe; may trigger a rate adjustment
    pub fn record_result(&self, success: bool, latency: Duration) {
        let mut state = match self.state.write() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };

        if state.latencies.len() == self.config.latency_window {
            state.latencies.pop_front();
        }
        state.latencies.push_back(latency);

        state.completed += 1;
        state.batch_completed += 1;
        if success {
            state.succeeded += 1;
            state.batch_succeeded += 1;
        }

        if state.batch_completed >= self.config.batch_size {
            self.adjust(&mut state);
        }
    }

    fn adjust(&self, state: &mut RateState) {
        let success_ratio = state.batch_succeeded as f64 / state.batch_completed as f64;
        let avg_latency = state.avg_latency();
        state.batch_completed = 0;
        state.batch_succeeded = 0;

        let config = &self.config;
        let target = if success_ratio > config.increase_success_ratio
            && avg_latency < Duration::from_millis(config.increase_latency_ms)
        {
            state.current_rate * config.growth_factor
        } else if success_ratio < config.decrease_success_ratio
            || avg_latency > Duration::from_millis(config.decrease_latency_ms)
        {
            state.current_rate / config.growth_factor
        } else {
            log::debug!(
                "rate unchanged rate={:.1} success_ratio={:.3} avg_latency_ms={}",
                state.current_rate,
                success_ratio,
                avg_latency.as_millis()
            );
            return;
        };

        // Refill at the old rate up to now so the change only affects the future
        state.refill(Instant::now(), config.burst);

        let smoothed = state.current_rate * (1.0 - config.smoothing) + target * config.smoothing;
        let new_rate = smoothed.clamp(config.min_rate, config.max_rate);
        if (new_rate - state.current_rate).abs() > f64::EPSILON {
            state.adjustments += 1;
            log::info!(
                "rate adjusted old_rate={:.1} new_rate={:.1} target={:.1} success_ratio={:.3} avg_latency_ms={}",
                state.current_rate,
                new_rate,
                target,
                success_ratio,
                avg_latency.as_millis()
            );
        }
        state.current_rate = new_rate;
    }

    pub fn current_rate(&self) -> f64 {
        match self.state.read() {
            Ok(state) => state.current_rate,
            Err(poisoned) => poisoned.into_inner().current_rate,
        }
    }

    pub fn snapshot(&self) -> RateSnapshot {
        let state = match self.state.read() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        RateSnapshot {
            current_rate: state.current_rate,
            admitted: state.admitted,
            completed: state.completed,
            succeeded: state.succeeded,
            adjustments: state.adjustments,
            avg_latency_ms: state.avg_latency().as_secs_f64() * 1000.0,
        }
    }
}
