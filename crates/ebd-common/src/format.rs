//! Human-readable durations and sizes for run summaries

use crate::error::{EbdError, Result};
use byte_unit::{Byte, UnitType};
use std::time::Duration;

/// Parse a memory limit such as "2GiB", "512 MB" or "1073741824"
pub fn parse_size(input: &str) -> Result<u64> {
    let trimmed = input.trim();
    let byte = Byte::parse_str(trimmed, true)
        .map_err(|e| EbdError::Parse(format!("invalid size '{}': {}", trimmed, e)))?;
    Ok(byte.as_u64())
}

/// Render a byte count with binary units, e.g. "1.50 GiB"
pub fn format_size(bytes: u64) -> String {
    let adjusted = Byte::from_u64(bytes).get_appropriate_unit(UnitType::Binary);
    format!("{:.2}", adjusted)
}

/// Render a duration as "1h 02m 03s", "4m 05s" or "1.25s"
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);

    if hours > 0 {
        format!("{}h {:02}m {:02}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {:02}s", minutes, seconds)
    } else {
        format!("{:.2}s", duration.as_secs_f64())
    }
}
