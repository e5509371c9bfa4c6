use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Records per transport call
pub const DEFAULT_BATCH_SIZE: usize = 50;
/// Period between flush ticks of one run
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 10_000;
/// A run still registered after this long is cancelled and removed
pub const MAX_RUN_HOURS: u64 = 24;

/// Tuning of the delivery subsystem.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub max_run_duration: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval: Duration::from_millis(DEFAULT_FLUSH_INTERVAL_MS),
            max_run_duration: Duration::from_secs(MAX_RUN_HOURS * 60 * 60),
        }
    }
}

impl DeliveryConfig {
    pub fn new(batch_size: usize, flush_interval: Duration) -> Self {
        Self {
            batch_size: batch_size.max(1),
            flush_interval,
            ..Self::default()
        }
    }

    /// Override the leak guard. Not exposed through the environment.
    pub fn with_max_run(mut self, max_run_duration: Duration) -> Self {
        self.max_run_duration = max_run_duration;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub delivery: DeliveryConfig,
    /// Backend base URL. Batches are only logged when unset.
    pub endpoint: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        let batch_size = parse_or(
            "STEPWIRE_BATCH_SIZE",
            env::var("STEPWIRE_BATCH_SIZE").ok(),
            DEFAULT_BATCH_SIZE,
        );
        let flush_interval_ms = parse_or(
            "STEPWIRE_FLUSH_INTERVAL_MS",
            env::var("STEPWIRE_FLUSH_INTERVAL_MS").ok(),
            DEFAULT_FLUSH_INTERVAL_MS,
        );
        let endpoint = env::var("STEPWIRE_ENDPOINT")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        Self {
            delivery: DeliveryConfig::new(batch_size, Duration::from_millis(flush_interval_ms)),
            endpoint,
        }
    }
}

/// Parse an optional raw value, falling back to `default` when missing or invalid.
fn parse_or<T>(key: &str, raw: Option<String>, default: T) -> T
where
    T: FromStr + std::fmt::Display,
{
    let Some(raw) = raw else {
        return default;
    };
    match raw.trim().parse() {
        Ok(value) => value,
        Err(_) => {
            log::warn!(
                "[CONFIG] Invalid value '{}' for {}, using default {}",
                raw,
                key,
                default
            );
            default
        }
    }
}
