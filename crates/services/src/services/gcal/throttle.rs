//! Adaptive per-call throttle for outbound calendar requests.
//!
//! One instance lives for exactly one bulk sync run. The baseline delay only
//! ever grows within a run: once the remote API pushes back, the rest of the
//! run stays slow. A fresh run starts fast again.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::warn;

use super::client::CalendarApiError;

const BASE_DELAY: Duration = Duration::from_secs(1);
const DELAY_INCREMENT: Duration = Duration::from_millis(500);
const BASE_BACKOFF: Duration = Duration::from_secs(2);
const MAX_RETRIES: u32 = 3;

pub struct AdaptiveThrottle {
    delay: Duration,
    increment: Duration,
    base_backoff: Duration,
    max_retries: u32,
}

impl Default for AdaptiveThrottle {
    fn default() -> Self {
        Self::new()
    }
}

impl AdaptiveThrottle {
    pub fn new() -> Self {
        Self::with_params(BASE_DELAY, DELAY_INCREMENT, BASE_BACKOFF, MAX_RETRIES)
    }

    pub fn with_params(
        delay: Duration,
        increment: Duration,
        base_backoff: Duration,
        max_retries: u32,
    ) -> Self {
        Self {
            delay,
            increment,
            base_backoff,
            max_retries,
        }
    }

    /// The current baseline delay. Monotonically non-decreasing over the life
    /// of the throttle.
    pub fn current_delay(&self) -> Duration {
        self.delay
    }

    /// Runs one API call: sleeps the baseline delay, then retries rate-limit
    /// errors with exponential backoff (base × 2^attempt), raising the
    /// baseline permanently on every hit. Any other error returns immediately
    /// — calendar-level errors are circuit-breaker triggers, not transients.
    pub async fn run<T, F, Fut>(&mut self, mut call: F) -> Result<T, CalendarApiError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CalendarApiError>>,
    {
        let mut attempt = 0u32;
        loop {
            sleep(self.delay).await;
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_rate_limit() && attempt < self.max_retries => {
                    self.delay += self.increment;
                    let backoff = self.base_backoff * 2u32.pow(attempt);
                    attempt += 1;
                    warn!(
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        delay_ms = self.delay.as_millis() as u64,
                        "Calendar rate limit hit, backing off"
                    );
                    sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
