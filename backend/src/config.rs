use std::{fmt::Display, str::FromStr, time::Duration};
use tracing::{info, warn};
use crate::{processor::DEFAULT_STORE_TIMEOUT, publisher::DEFAULT_CHANNEL_CAPACITY};

const DEFAULT_ALLOWED_ORIGINS: &str = "http://localhost:3000,http://localhost:3001,http://127.0.0.1:3000";

/// Runtime settings, read from the deployment's secret store.
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub allowed_origins: Vec<String>,
    pub rate_limit_max_requests: u32,
    pub rate_limit_window_minutes: i64,
    pub store_timeout: Duration,
    pub broadcast_capacity: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::load(|_| None)
    }
}

impl AppConfig {
    /// Builds the config from any key lookup; missing or unparsable values fall back to defaults.
    pub fn load<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let origins = try_load(&lookup, "ALLOWED_ORIGINS", DEFAULT_ALLOWED_ORIGINS.to_string());

        Self {
            allowed_origins: origins
                .split(',')
                .map(str::trim)
                .filter(|o| !o.is_empty())
                .map(str::to_string)
                .collect(),
            rate_limit_max_requests: try_load(&lookup, "RATE_LIMIT_MAX_REQUESTS", 100),
            rate_limit_window_minutes: try_load(&lookup, "RATE_LIMIT_WINDOW_MINUTES", 15),
            store_timeout: Duration::from_millis(try_load(
                &lookup,
                "STORE_TIMEOUT_MS",
                DEFAULT_STORE_TIMEOUT.as_millis() as u64,
            )),
            broadcast_capacity: try_load(&lookup, "BROADCAST_CAPACITY", DEFAULT_CHANNEL_CAPACITY),
        }
    }
}

fn try_load<T, F>(lookup: &F, key: &str, default: T) -> T
where
    T: FromStr + Display,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|e| {
            warn!("Invalid {key} value {raw:?}: {e}, using default: {default}");
            default
        }),
        None => {
            info!("{key} not set, using default: {default}");
            default
        }
    }
}
