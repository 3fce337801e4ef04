//! Human-friendly durations: `500ms`, `5s`, `2m`, `1.5h`

use std::time::Duration;

use anyhow::{Context, Result};

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Parse a duration such as `250us`, `250ms`, `10s`, `2m` or `1h`.
///
/// A bare number is taken as seconds. Whole numbers are converted exactly.
pub fn parse_duration(duration_str: &str) -> Result<Duration> {
    let duration_str = duration_str.trim().to_lowercase();

    let split = duration_str
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(duration_str.len());
    let (num_str, unit_str) = duration_str.split_at(split);

    let unit_nanos: u128 = match unit_str.trim() {
        "ns" | "nsec" | "nanos" | "nanoseconds" => 1,
        "us" | "µs" | "usec" | "micros" | "microseconds" => 1_000,
        "ms" | "msec" | "millis" | "milliseconds" => 1_000_000,
        "" | "s" | "sec" | "second" | "seconds" => NANOS_PER_SEC,
        "m" | "min" | "minute" | "minutes" => 60 * NANOS_PER_SEC,
        "h" | "hour" | "hours" => 3600 * NANOS_PER_SEC,
        other => anyhow::bail!("Unknown duration unit '{other}'. Valid units: ns/us/ms/s/m/h"),
    };

    if let Ok(whole) = num_str.parse::<u128>() {
        let nanos = whole
            .checked_mul(unit_nanos)
            .with_context(|| format!("Duration out of range: {duration_str}"))?;
        let secs = u64::try_from(nanos / NANOS_PER_SEC)
            .with_context(|| format!("Duration out of range: {duration_str}"))?;
        // The remainder is below one second, so it fits.
        let subsec = u32::try_from(nanos % NANOS_PER_SEC).unwrap_or(0);
        return Ok(Duration::new(secs, subsec));
    }

    let value: f64 = num_str
        .parse()
        .with_context(|| format!("Invalid duration value: {duration_str}"))?;

    #[allow(clippy::cast_precision_loss)]
    let seconds = value * (unit_nanos as f64) / 1e9;
    Duration::try_from_secs_f64(seconds)
        .with_context(|| format!("Duration out of range: {duration_str}"))
}

/// Render a duration in the shortest form [`parse_duration`] reads back exactly.
#[must_use]
pub fn format_duration(duration: Duration) -> String {
    let nanos = duration.subsec_nanos();
    if nanos == 0 {
        format!("{}s", duration.as_secs())
    } else if nanos % 1_000_000 == 0 {
        format!("{}ms", duration.as_millis())
    } else if nanos % 1_000 == 0 {
        format!("{}us", duration.as_micros())
    } else {
        format!("{}ns", duration.as_nanos())
    }
}
