use std::collections::HashMap;
use std::sync::Mutex;
use time::{OffsetDateTime, Duration};
use tracing::{warn, error};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RateLimitError {
    #[error("Rate limit exceeded. Please try again in {retry_after_minutes} minutes.")]
    Exceeded { retry_after_minutes: i64 },
    #[error("Internal rate limit error")]
    LockFailed,
}

#[derive(Debug)]
struct Window {
    requests: u32,
    started: OffsetDateTime,
}

/// Fixed-window request counter keyed by client fingerprint.
#[derive(Debug)]
pub struct RateLimiter {
    windows: Mutex<HashMap<String, Window>>,
    max_requests: u32,
    window: Duration,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(100, 15)
    }
}

impl RateLimiter {
    pub fn new(max_requests: u32, window_minutes: i64) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            max_requests,
            window: Duration::minutes(window_minutes),
        }
    }

    pub fn check(&self, key: &str) -> Result<(), RateLimitError> {
        self.check_at(key, OffsetDateTime::now_utc())
    }

    fn check_at(&self, key: &str, now: OffsetDateTime) -> Result<(), RateLimitError> {
        let mut windows = self.windows.lock().map_err(|e| {
            error!("Failed to acquire rate limit lock: {}", e);
            RateLimitError::LockFailed
        })?;

        windows.retain(|_, w| now - w.started <= self.window * 2);

        let window = windows.entry(key.to_string()).or_insert(Window { requests: 0, started: now });
        if now - window.started > self.window {
            *window = Window { requests: 0, started: now };
        }

        if window.requests >= self.max_requests {
            let retry_after_minutes = (window.started + self.window - now).whole_minutes().max(1);
            warn!("Rate limit triggered for key {}", key);
            return Err(RateLimitError::Exceeded { retry_after_minutes });
        }

        window.requests += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocks_after_max_requests() {
        let limiter = RateLimiter::new(2, 15);
        let now = OffsetDateTime::now_utc();

        assert!(limiter.check_at("a", now).is_ok());
        assert!(limiter.check_at("a", now).is_ok());
        assert!(matches!(limiter.check_at("a", now), Err(RateLimitError::Exceeded { .. })));
        assert!(limiter.check_at("b", now).is_ok(), "keys are independent");
    }

    #[test]
    fn test_window_resets() {
        let limiter = RateLimiter::new(1, 15);
        let now = OffsetDateTime::now_utc();

        assert!(limiter.check_at("a", now).is_ok());
        assert!(limiter.check_at("a", now).is_err());
        assert!(limiter.check_at("a", now + Duration::minutes(16)).is_ok());
    }
}
