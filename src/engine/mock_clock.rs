//! Clock used for flow timestamps
//!
//! Flow state records and sessions read time through `MockClock`. It reports
//! real UTC time until a virtual time is set, after which time only moves when
//! the clock is explicitly forwarded. Tests use this to age flow records
//! without sleeping.
//!
//! # Example
//!
//! ```rust
//! use api_flows::engine::MockClock;
//! use std::time::Duration;
//!
//! let clock = MockClock::new();
//! let start = clock.freeze();
//! clock.forward(Duration::from_secs(90));
//! assert_eq!((clock.now() - start).num_seconds(), 90);
//! ```

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Default)]
pub struct MockClock {
    inner: Arc<RwLock<ClockState>>,
}

#[derive(Debug, Clone, Default)]
struct ClockState {
    /// The current virtual time, or None if using real time
    virtual_time: Option<DateTime<Utc>>,
}

impl MockClock {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, ClockState> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, ClockState> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Get the current time (virtual or real)
    pub fn now(&self) -> DateTime<Utc> {
        self.read().virtual_time.unwrap_or_else(Utc::now)
    }

    /// Freeze the clock at the current real time and return it
    pub fn freeze(&self) -> DateTime<Utc> {
        let mut state = self.write();
        let now = state.virtual_time.unwrap_or_else(Utc::now);
        state.virtual_time = Some(now);
        now
    }

    /// Advance the clock by a duration
    pub fn forward(&self, duration: Duration) {
        let mut state = self.write();
        let current = state.virtual_time.unwrap_or_else(Utc::now);
        let step = chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX);
        state.virtual_time = Some(current.checked_add_signed(step).unwrap_or(current));
    }

    /// Milliseconds elapsed since `since`, never negative
    pub fn millis_since(&self, since: DateTime<Utc>) -> u64 {
        (self.now() - since).num_milliseconds().max(0) as u64
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClockError {
    #[error("Invalid duration format: {0}")]
    InvalidDurationFormat(String),
}

/// Parse a duration string like "1h30m", "500ms", "2d"
pub fn parse_duration(s: &str) -> Result<Duration, ClockError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(ClockError::InvalidDurationFormat(
            "empty string".to_string(),
        ));
    }

    let mut total = Duration::ZERO;
    let mut chars = s.chars().peekable();

    while chars.peek().is_some() {
        let mut number = String::new();
        while let Some(c) = chars.peek().copied().filter(|c| c.is_ascii_digit() || *c == '.') {
            number.push(c);
            chars.next();
        }

        let mut unit = String::new();
        while let Some(c) = chars.peek().copied().filter(|c| c.is_ascii_alphabetic()) {
            unit.push(c);
            chars.next();
        }

        if number.is_empty() {
            return Err(ClockError::InvalidDurationFormat(format!(
                "expected number before '{}'",
                chars.next().map(String::from).unwrap_or(unit)
            )));
        }

        let num: f64 = number.parse().map_err(|_| {
            ClockError::InvalidDurationFormat(format!("invalid number: {}", number))
        })?;

        let millis = match unit.as_str() {
            "d" => num * 24.0 * 60.0 * 60.0 * 1000.0,
            "h" => num * 60.0 * 60.0 * 1000.0,
            "m" => num * 60.0 * 1000.0,
            // Trailing number without a unit is seconds
            "s" | "" => num * 1000.0,
            "ms" => num,
            other => {
                return Err(ClockError::InvalidDurationFormat(format!(
                    "unknown unit '{}'",
                    other
                )))
            }
        };

        if !millis.is_finite() || millis >= u64::MAX as f64 {
            return Err(ClockError::InvalidDurationFormat(format!("duration too large: {}", s)));
        }
        total = total
            .checked_add(Duration::from_millis(millis as u64))
            .ok_or_else(|| ClockError::InvalidDurationFormat(format!("duration too large: {}", s)))?;
    }

    Ok(total)
}
