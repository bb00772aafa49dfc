//! Claim rate limiting for worker pools

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// At most `max_jobs` claims per `window`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub max_jobs: u32,
    pub window: Duration,
}

impl RateLimit {
    pub fn per_second(max_jobs: u32) -> Self {
        Self {
            max_jobs,
            window: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ClaimWindow {
    count: u32,
    window_start: Instant,
}

impl ClaimWindow {
    fn fresh() -> Self {
        Self {
            count: 0,
            window_start: Instant::now(),
        }
    }
}

/// Rate limit error
#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error("Rate limited, retry after {retry_after:?}")]
    Limited { retry_after: Duration },
}

/// Fixed-window limiter shared by the dispatch loop of one pool
#[derive(Debug)]
pub struct ClaimLimiter {
    limit: RateLimit,
    window: Mutex<ClaimWindow>,
}

impl ClaimLimiter {
    pub fn new(limit: RateLimit) -> Self {
        Self {
            limit,
            window: Mutex::new(ClaimWindow::fresh()),
        }
    }

    /// Wait until a claim slot is free without consuming it
    pub async fn wait_ready(&self) {
        while let Err(RateLimitError::Limited { retry_after }) = self.check().await {
            tokio::time::sleep(retry_after).await;
        }
    }

    /// Check whether a claim is allowed in the current window (doesn't consume)
    pub async fn check(&self) -> Result<(), RateLimitError> {
        let mut window = self.window.lock().await;

        let elapsed = window.window_start.elapsed();
        if elapsed >= self.limit.window {
            *window = ClaimWindow::fresh();
            return Ok(());
        }

        if window.count >= self.limit.max_jobs {
            let retry_after = self.limit.window.saturating_sub(elapsed);
            return Err(RateLimitError::Limited { retry_after });
        }
        Ok(())
    }

    /// Count a successful claim against the current window
    pub async fn record(&self) {
        let mut window = self.window.lock().await;
        if window.window_start.elapsed() >= self.limit.window {
            *window = ClaimWindow::fresh();
        }
        window.count += 1;
    }

    pub fn limit(&self) -> RateLimit {
        self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_claim_limiter_window() {
        let limiter = ClaimLimiter::new(RateLimit {
            max_jobs: 2,
            window: Duration::from_millis(100),
        });

        // Checking alone never consumes
        assert!(limiter.check().await.is_ok());
        assert!(limiter.check().await.is_ok());
        assert!(limiter.check().await.is_ok());

        limiter.record().await;
        limiter.record().await;
        assert!(matches!(
            limiter.check().await,
            Err(RateLimitError::Limited { .. })
        ));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(limiter.check().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_ready_blocks_until_next_window() {
        let limiter = ClaimLimiter::new(RateLimit::per_second(1));
        let start = Instant::now();

        limiter.wait_ready().await;
        limiter.record().await;
        limiter.wait_ready().await;

        assert!(start.elapsed() >= Duration::from_secs(1));
    }
}
