use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::config::Rate;

/// Spaces archive API calls, backing off while the service answers slowly.
///
/// One limiter is shared by every worker, so the delay reflects the service as a whole.
#[derive(Debug, Clone)]
pub struct AdaptiveRateLimiter {
    config: RateLimiterConfig,
    state: Arc<RwLock<RateLimiterState>>,
}

#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Delay used at start and after a reset
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub min_delay: Duration,
    /// Responses slower than this count as slow
    pub slow_request_threshold: Duration,
    pub backoff_multiplier: f64,
    pub recovery_multiplier: f64,
    /// Consecutive slow responses before the delay grows
    pub slow_request_tolerance: u32,
    /// Consecutive fast responses before the delay shrinks
    pub fast_request_tolerance: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            min_delay: Duration::from_millis(50),
            slow_request_threshold: Duration::from_secs(3),
            backoff_multiplier: 1.5,
            recovery_multiplier: 0.8,
            slow_request_tolerance: 2,
            fast_request_tolerance: 3,
        }
    }
}

impl From<&Rate> for RateLimiterConfig {
    fn from(rate: &Rate) -> Self {
        let min_delay = Duration::from_millis(rate.min_delay_ms);
        let max_delay = Duration::from_millis(rate.max_delay_ms.max(rate.min_delay_ms));
        Self {
            base_delay: Duration::from_millis(rate.base_delay_ms).clamp(min_delay, max_delay),
            max_delay,
            min_delay,
            slow_request_threshold: Duration::from_millis(rate.slow_request_threshold_ms),
            ..Self::default()
        }
    }
}

#[derive(Debug)]
struct RateLimiterState {
    current_delay: Duration,
    consecutive_slow_requests: u32,
    consecutive_fast_requests: u32,
    last_request_time: Option<Instant>,
}

impl AdaptiveRateLimiter {
    pub fn new() -> Self {
        Self::with_config(RateLimiterConfig::default())
    }

    pub fn with_config(config: RateLimiterConfig) -> Self {
        let state = RateLimiterState {
            current_delay: config.base_delay,
            consecutive_slow_requests: 0,
            consecutive_fast_requests: 0,
            last_request_time: None,
        };
        Self {
            config,
            state: Arc::new(RwLock::new(state)),
        }
    }

    /// Waits until the current delay has passed since the last request, then claims the slot.
    pub async fn wait_for_request(&self) -> Duration {
        let wait = {
            let mut state = self.state.write();
            let now = Instant::now();
            let ready_at = state
                .last_request_time
                .map(|last| last + state.current_delay)
                .unwrap_or(now);
            let slot = ready_at.max(now);
            // Reserve the slot before sleeping so concurrent callers queue up behind it.
            state.last_request_time = Some(slot);
            slot - now
        };

        if !wait.is_zero() {
            debug!("Rate limiter waiting for {:?}", wait);
            tokio::time::sleep(wait).await;
        }
        wait
    }

    /// Feeds a response time back into the delay.
    pub fn record_response_time(&self, response_time: Duration) {
        let mut state = self.state.write();

        let is_slow = response_time >= self.config.slow_request_threshold;
        let is_fast = response_time < self.config.slow_request_threshold / 2;

        if is_slow {
            state.consecutive_slow_requests += 1;
            state.consecutive_fast_requests = 0;
            warn!("Slow archive response: {:?}", response_time);
        } else if is_fast {
            state.consecutive_fast_requests += 1;
            state.consecutive_slow_requests = 0;
        } else {
            state.consecutive_slow_requests = 0;
            state.consecutive_fast_requests = 0;
        }

        let old_delay = state.current_delay;
        if state.consecutive_slow_requests >= self.config.slow_request_tolerance {
            state.current_delay = Duration::from_secs_f64(
                state.current_delay.as_secs_f64() * self.config.backoff_multiplier,
            )
            .min(self.config.max_delay);
            state.consecutive_slow_requests = 0;
            info!(
                "Archive responding slowly, request delay {:?} -> {:?}",
                old_delay, state.current_delay
            );
        } else if state.consecutive_fast_requests >= self.config.fast_request_tolerance {
            state.current_delay = Duration::from_secs_f64(
                state.current_delay.as_secs_f64() * self.config.recovery_multiplier,
            )
            .max(self.config.min_delay);
            state.consecutive_fast_requests = 0;
            debug!("Request delay {:?} -> {:?}", old_delay, state.current_delay);
        }
    }

    /// Forces the delay up after the archive asked us to slow down.
    pub fn penalize(&self) {
        let mut state = self.state.write();
        state.current_delay = (state.current_delay * 2).min(self.config.max_delay);
        state.consecutive_fast_requests = 0;
    }

    pub fn current_delay(&self) -> Duration {
        self.state.read().current_delay
    }
}

impl Default for AdaptiveRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_request_does_not_wait() {
        let limiter = AdaptiveRateLimiter::new();
        assert_eq!(limiter.wait_for_request().await, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_back_to_back_requests_are_spaced() {
        let limiter = AdaptiveRateLimiter::with_config(RateLimiterConfig {
            base_delay: Duration::from_millis(40),
            ..RateLimiterConfig::default()
        });
        let start = Instant::now();
        limiter.wait_for_request().await;
        limiter.wait_for_request().await;
        limiter.wait_for_request().await;
        assert!(start.elapsed() >= Duration::from_millis(75));
    }

    #[test]
    fn test_slow_responses_increase_delay() {
        let limiter = AdaptiveRateLimiter::new();
        for _ in 0..2 {
            limiter.record_response_time(Duration::from_secs(4));
        }
        assert!(limiter.current_delay() > Duration::from_millis(250));
    }

    #[test]
    fn test_fast_responses_recover_but_respect_floor() {
        let limiter = AdaptiveRateLimiter::new();
        for _ in 0..2 {
            limiter.record_response_time(Duration::from_secs(4));
        }
        let raised = limiter.current_delay();

        for _ in 0..60 {
            limiter.record_response_time(Duration::from_millis(100));
        }
        assert!(limiter.current_delay() < raised);
        assert_eq!(limiter.current_delay(), Duration::from_millis(50));
    }

    #[test]
    fn test_penalize_caps_at_max() {
        let limiter = AdaptiveRateLimiter::new();
        for _ in 0..20 {
            limiter.penalize();
        }
        assert_eq!(limiter.current_delay(), Duration::from_secs(10));
    }

    #[test]
    fn test_config_from_rate_section() {
        let rate = Rate {
            base_delay_ms: 10,
            min_delay_ms: 100,
            max_delay_ms: 2000,
            slow_request_threshold_ms: 1500,
        };
        let config = RateLimiterConfig::from(&rate);
        assert_eq!(config.base_delay, Duration::from_millis(100));
        assert_eq!(config.slow_request_threshold, Duration::from_millis(1500));
    }
}
