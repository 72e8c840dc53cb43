use std::env;
use std::time::Duration;

use tracing::warn;

use crate::error::ConfigError;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(4 * 60);
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveConfig {
    /// Overall budget for processing one push. Zero waits without deadline.
    pub timeout: Duration,
    pub thread_pool_size: usize,
    /// Refuse uploads while real refs exist under the magic `refs/for/`
    /// namespace.
    pub check_magic_refs: bool,
    /// Applied when the pusher cannot read the whole project.
    pub check_referenced_objects_are_reachable: bool,
    /// Idle timeout of the transfer itself, handed to the protocol codec.
    /// Zero disables it.
    pub transfer_timeout: Duration,
    pub progress_interval: Duration,
}

impl ReceiveConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            timeout: env_duration("TIDEGATE_RECEIVE_TIMEOUT", TimeUnit::Milliseconds)
                .unwrap_or(defaults.timeout),
            thread_pool_size: env::var("TIDEGATE_RECEIVE_THREAD_POOL_SIZE")
                .ok()
                .and_then(|val| val.trim().parse().ok())
                .filter(|size: &usize| *size > 0)
                .unwrap_or(defaults.thread_pool_size),
            check_magic_refs: env_bool("TIDEGATE_RECEIVE_CHECK_MAGIC_REFS")
                .unwrap_or(defaults.check_magic_refs),
            check_referenced_objects_are_reachable: env_bool(
                "TIDEGATE_RECEIVE_CHECK_REFERENCED_OBJECTS_ARE_REACHABLE",
            )
            .unwrap_or(defaults.check_referenced_objects_are_reachable),
            transfer_timeout: env_duration("TIDEGATE_TRANSFER_TIMEOUT", TimeUnit::Seconds)
                .unwrap_or(defaults.transfer_timeout),
            progress_interval: env_duration(
                "TIDEGATE_RECEIVE_PROGRESS_INTERVAL",
                TimeUnit::Milliseconds,
            )
            .filter(|interval| !interval.is_zero())
            .unwrap_or(defaults.progress_interval),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_thread_pool_size(mut self, size: usize) -> Self {
        self.thread_pool_size = size.max(1);
        self
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    /// `None` when pushes may run without a deadline.
    pub fn deadline(&self) -> Option<Duration> {
        (!self.timeout.is_zero()).then_some(self.timeout)
    }
}

impl Default for ReceiveConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            thread_pool_size: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            check_magic_refs: true,
            check_referenced_objects_are_reachable: true,
            transfer_timeout: Duration::ZERO,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    Milliseconds,
    Seconds,
    Minutes,
}

impl TimeUnit {
    fn duration(self, amount: u64) -> Duration {
        match self {
            TimeUnit::Milliseconds => Duration::from_millis(amount),
            TimeUnit::Seconds => Duration::from_secs(amount),
            TimeUnit::Minutes => Duration::from_secs(amount.saturating_mul(60)),
        }
    }
}

/// Parses `"4 min"`, `"90s"`, `"250 ms"` or a bare number in `default_unit`.
pub fn parse_duration(value: &str, default_unit: TimeUnit) -> Result<Duration, ConfigError> {
    let trimmed = value.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, unit) = trimmed.split_at(split);
    let amount: u64 = digits
        .parse()
        .map_err(|_| ConfigError::InvalidDuration(value.to_string()))?;
    let unit = unit.trim().to_ascii_lowercase();

    let secs = |n: u64| Duration::from_secs(amount.saturating_mul(n));
    let duration = match unit.as_str() {
        "" => default_unit.duration(amount),
        "ms" | "milliseconds" | "millisecond" => Duration::from_millis(amount),
        "s" | "sec" | "second" | "seconds" => secs(1),
        "m" | "min" | "minute" | "minutes" => secs(60),
        "h" | "hr" | "hour" | "hours" => secs(60 * 60),
        "d" | "day" | "days" => secs(24 * 60 * 60),
        "w" | "week" | "weeks" => secs(7 * 24 * 60 * 60),
        _ => {
            return Err(ConfigError::UnknownUnit {
                value: value.to_string(),
                unit,
            })
        }
    };
    Ok(duration)
}

pub fn parse_bool(value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidBool(value.to_string())),
    }
}

fn env_duration(key: &str, default_unit: TimeUnit) -> Option<Duration> {
    let raw = env::var(key).ok()?;
    match parse_duration(&raw, default_unit) {
        Ok(duration) => Some(duration),
        Err(err) => {
            warn!(key, error = %err, "ignoring invalid duration setting");
            None
        }
    }
}

fn env_bool(key: &str) -> Option<bool> {
    let raw = env::var(key).ok()?;
    match parse_bool(&raw) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(key, error = %err, "ignoring invalid boolean setting");
            None
        }
    }
}
