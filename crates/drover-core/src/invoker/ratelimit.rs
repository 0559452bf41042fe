//! Rate-limit detection in captured agent output.
//!
//! The marker text and timestamp format vary across agent CLI versions, so
//! parsing is deliberately lenient: detect the marker, try the known reset
//! formats, and fall back to a fixed sleep when none parse.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

/// Substring that identifies a rate-limit message (matched case-insensitively).
pub const MARKER: &str = "usage limit reached";

/// Buffer added on top of the reported reset time.
pub const RESET_BUFFER: Duration = Duration::from_secs(30);

/// Sleep used when the marker is present but no reset time parses.
const FALLBACK_SLEEP: Duration = Duration::from_secs(60);

/// A detected rate-limit event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitHit {
    /// Wall-clock reset time, when one could be parsed.
    pub reset_at: Option<DateTime<Utc>>,
}

/// Scan captured output for the rate-limit marker.
pub fn detect(output: &str) -> Option<RateLimitHit> {
    let line = output
        .lines()
        .find(|l| l.to_ascii_lowercase().contains(MARKER))?;
    Some(RateLimitHit {
        reset_at: parse_reset(line),
    })
}

/// How long to sleep before retrying the same attempt.
pub fn sleep_duration(hit: &RateLimitHit, now: DateTime<Utc>) -> Duration {
    let base = match hit.reset_at {
        Some(reset) => (reset - now)
            .to_std()
            .unwrap_or(Duration::ZERO),
        None => FALLBACK_SLEEP,
    };
    base + RESET_BUFFER
}

/// Try the known reset-time encodings on the marker line.
///
/// 1. `...|<epoch-seconds>` -- the CLI's machine-readable suffix.
/// 2. `resets at <RFC 3339>` -- timezone-aware human form.
fn parse_reset(line: &str) -> Option<DateTime<Utc>> {
    if let Some((_, tail)) = line.rsplit_once('|') {
        if let Ok(epoch) = tail.trim().parse::<i64>() {
            if let Some(ts) = Utc.timestamp_opt(epoch, 0).single() {
                return Some(ts);
            }
        }
    }

    let lower = line.to_ascii_lowercase();
    if let Some(idx) = lower.find("resets at") {
        let tail = line[idx + "resets at".len()..].trim();
        // Take the leading token run that parses as RFC 3339.
        let candidate = tail.split_whitespace().next().unwrap_or("");
        if let Ok(ts) = DateTime::parse_from_rfc3339(candidate) {
            return Some(ts.with_timezone(&Utc));
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_marker_no_hit() {
        assert!(detect("all quiet\nnothing to see\n").is_none());
    }

    #[test]
    fn epoch_suffix_parses() {
        let hit = detect("Claude AI usage limit reached|1790000000\n").unwrap();
        assert_eq!(hit.reset_at, Utc.timestamp_opt(1_790_000_000, 0).single());
    }

    #[test]
    fn rfc3339_reset_parses_with_timezone() {
        let hit = detect("usage limit reached, resets at 2026-07-30T15:00:00+02:00\n").unwrap();
        let reset = hit.reset_at.unwrap();
        assert_eq!(reset, Utc.with_ymd_and_hms(2026, 7, 30, 13, 0, 0).unwrap());
    }

    #[test]
    fn unparseable_reset_falls_back() {
        let hit = detect("Usage limit reached, try later\n").unwrap();
        assert_eq!(hit.reset_at, None);
        let sleep = sleep_duration(&hit, Utc::now());
        assert_eq!(sleep, FALLBACK_SLEEP + RESET_BUFFER);
    }

    #[test]
    fn sleep_includes_buffer_and_never_negative() {
        let now = Utc.with_ymd_and_hms(2026, 7, 30, 12, 0, 0).unwrap();
        let hit = RateLimitHit {
            reset_at: Some(now + chrono::Duration::seconds(90)),
        };
        assert_eq!(sleep_duration(&hit, now), Duration::from_secs(120));

        // Reset already in the past: only the buffer remains.
        let stale = RateLimitHit {
            reset_at: Some(now - chrono::Duration::seconds(90)),
        };
        assert_eq!(sleep_duration(&stale, now), RESET_BUFFER);
    }

    #[test]
    fn marker_is_case_insensitive() {
        assert!(detect("USAGE LIMIT REACHED|12345\n").is_some());
    }
}
