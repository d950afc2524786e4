//! Normalized on-tape timestamps.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Latest second representable in an index timestamp (9999-12-31T23:59:59).
const MAX_SECONDS: u64 = 253_402_300_799;

/// Nanosecond-precision time as stored in the index.
///
/// Out-of-range inputs are clamped rather than rejected; the tape already
/// holds the value and refusing to mount over a bad timestamp helps nobody.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LtfsTime {
    pub secs: u64,
    pub nsecs: u32,
}

impl LtfsTime {
    pub const EPOCH: LtfsTime = LtfsTime { secs: 0, nsecs: 0 };

    pub fn new(secs: u64, nsecs: u32) -> Self {
        let mut t = LtfsTime { secs, nsecs };
        LtfsTime::clamp(&mut t);
        t
    }

    pub fn now() -> Self {
        let now = Utc::now();
        LtfsTime {
            secs: now.timestamp().max(0) as u64,
            nsecs: now.timestamp_subsec_nanos(),
        }
    }

    fn clamp(&mut self) {
        if self.secs > MAX_SECONDS {
            warn!("timestamp {} past year 9999, clamping", self.secs);
            self.secs = MAX_SECONDS;
        }
        if self.nsecs >= 1_000_000_000 {
            warn!("nanosecond field {} out of range, clamping", self.nsecs);
            self.nsecs = 999_999_999;
        }
    }

    /// Format as the Z-suffixed 9-digit fractional form used in index XML.
    pub fn format(&self) -> String {
        let dt: DateTime<Utc> = Utc
            .timestamp_opt(self.secs as i64, self.nsecs)
            .single()
            .unwrap_or_else(|| Utc.timestamp_opt(0, 0).unwrap());
        format!("{}Z", dt.format("%Y-%m-%dT%H:%M:%S%.9f"))
    }

    /// Parse an index timestamp. Tolerates missing fractional digits and a
    /// numeric UTC offset in place of the trailing Z.
    pub fn parse(s: &str) -> Option<Self> {
        let trimmed = s.trim();
        if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
            let utc = dt.with_timezone(&Utc);
            return Some(LtfsTime::new(
                utc.timestamp().max(0) as u64,
                utc.timestamp_subsec_nanos(),
            ));
        }
        // Some writers emit a bare "...SS" with no zone designator.
        chrono::NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S")
            .ok()
            .map(|naive| {
                LtfsTime::new(naive.and_utc().timestamp().max(0) as u64, 0)
            })
    }
}

impl Default for LtfsTime {
    fn default() -> Self {
        LtfsTime::EPOCH
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_round_trip() {
        let t = LtfsTime::new(1_700_000_000, 123_456_789);
        let s = t.format();
        assert!(s.ends_with('Z'));
        assert_eq!(LtfsTime::parse(&s), Some(t));
    }

    #[test]
    fn clamps_past_year_9999() {
        let t = LtfsTime::new(u64::MAX, 0);
        assert_eq!(t.secs, MAX_SECONDS);
    }

    #[test]
    fn parses_seconds_only() {
        let t = LtfsTime::parse("2023-01-01T00:00:00").unwrap();
        assert_eq!(t.nsecs, 0);
        assert!(t.secs > 0);
    }
}
