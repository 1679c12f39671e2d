//! Shared upstream circuit breaker
//!
//! Failures raise a score and successes lower it. Once the score reaches
//! the threshold the breaker opens and new proxy attempts fail fast. After
//! the cooldown the next check closes it again with a clean score
//! (half-open: that attempt is let through and decides what happens next).

use crate::config::CircuitBreakerSettings;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Default)]
struct BreakerState {
    score: u32,
    opened_at: Option<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    state: Mutex<BreakerState>,
    threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            state: Mutex::new(BreakerState::default()),
            threshold: threshold.max(1),
            cooldown,
        }
    }

    pub fn from_settings(settings: &CircuitBreakerSettings) -> Self {
        Self::new(
            settings.failure_threshold,
            Duration::from_secs(settings.cooldown_secs),
        )
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock();
        state.score = state.score.saturating_sub(1);
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        state.score = state.score.saturating_add(1);
        if state.score >= self.threshold && state.opened_at.is_none() {
            state.opened_at = Some(Instant::now());
            warn!(
                score = state.score,
                cooldown_secs = self.cooldown.as_secs(),
                "Circuit breaker opened"
            );
        }
    }

    /// Whether new attempts must be refused right now
    pub fn is_open(&self) -> bool {
        let mut state = self.state.lock();
        match state.opened_at {
            Some(opened_at) if opened_at.elapsed() >= self.cooldown => {
                *state = BreakerState::default();
                info!("Circuit breaker cooldown elapsed; admitting next attempt");
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Time left until the breaker lets an attempt through
    pub fn retry_after(&self) -> Option<Duration> {
        let state = self.state.lock();
        state
            .opened_at
            .map(|opened_at| self.cooldown.saturating_sub(opened_at.elapsed()))
            .filter(|remaining| !remaining.is_zero())
    }

    pub fn score(&self) -> u32 {
        self.state.lock().score
    }
}
