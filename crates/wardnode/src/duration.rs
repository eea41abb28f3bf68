//! Human-readable durations such as `250ms`, `2s` or `1m30s`.
//!
//! Parsing and formatting go through `humantime`; this module only maps
//! failures onto [`ConfigError`]. Serde fields use `humantime_serde` directly.

use std::time::Duration;

use crate::error::ConfigError;

/// Parses a duration such as `15s`, `1m30s` or `250ms`. A bare `0` is zero.
pub fn parse_duration(input: &str) -> Result<Duration, ConfigError> {
    let text = input.trim();
    if text == "0" {
        return Ok(Duration::ZERO);
    }
    humantime::parse_duration(text).map_err(|e| ConfigError::duration(input, e.to_string()))
}

/// Formats a duration in the notation [`parse_duration`] accepts.
pub fn format_duration(duration: Duration) -> String {
    humantime::format_duration(duration).to_string()
}
