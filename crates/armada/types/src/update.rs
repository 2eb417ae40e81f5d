//! Rollout settings

use crate::error::TypesError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Upper bound on concurrent instance updates per job
pub const MAX_IN_FLIGHT_LIMIT: u32 = 32;

/// Inclusive watch window in milliseconds
///
/// Written in manifests as `"1000-5000"`, `"3000"` or `3000`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WatchRangeRepr", into = "String")]
pub struct WatchRange {
    min_ms: u64,
    max_ms: u64,
}

impl WatchRange {
    pub fn new(min_ms: u64, max_ms: u64) -> Result<Self, TypesError> {
        if min_ms > max_ms {
            return Err(TypesError::InvertedWatchRange {
                min: min_ms,
                max: max_ms,
            });
        }
        Ok(Self { min_ms, max_ms })
    }

    pub fn fixed(ms: u64) -> Self {
        Self {
            min_ms: ms,
            max_ms: ms,
        }
    }

    pub fn min_ms(&self) -> u64 {
        self.min_ms
    }

    pub fn max_ms(&self) -> u64 {
        self.max_ms
    }

    pub fn min(&self) -> Duration {
        Duration::from_millis(self.min_ms)
    }

    pub fn max(&self) -> Duration {
        Duration::from_millis(self.max_ms)
    }
}

impl FromStr for WatchRange {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TypesError::InvalidWatchTime(s.to_string());
        let parse = |part: &str| part.trim().parse::<u64>().map_err(|_| invalid());

        match s.split_once('-') {
            Some((min, max)) => WatchRange::new(parse(min)?, parse(max)?),
            None => Ok(WatchRange::fixed(parse(s)?)),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WatchRangeRepr {
    Millis(u64),
    Text(String),
}

impl TryFrom<WatchRangeRepr> for WatchRange {
    type Error = TypesError;

    fn try_from(value: WatchRangeRepr) -> Result<Self, Self::Error> {
        match value {
            WatchRangeRepr::Millis(ms) => Ok(WatchRange::fixed(ms)),
            WatchRangeRepr::Text(text) => text.parse(),
        }
    }
}

impl From<WatchRange> for String {
    fn from(range: WatchRange) -> Self {
        range.to_string()
    }
}

impl fmt::Display for WatchRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.min_ms == self.max_ms {
            write!(f, "{}", self.min_ms)
        } else {
            write!(f, "{}-{}", self.min_ms, self.max_ms)
        }
    }
}

/// Fully resolved update settings for one job
///
/// Job-level settings inherit missing fields from the deployment default when
/// the plan is built; nothing is resolved lazily.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateConfig {
    pub canaries: u32,
    pub canary_watch_time: WatchRange,
    pub max_in_flight: u32,
    pub update_watch_time: WatchRange,
    pub max_errors: u32,
}

impl UpdateConfig {
    pub fn new(
        canaries: u32,
        canary_watch_time: WatchRange,
        max_in_flight: u32,
        update_watch_time: WatchRange,
        max_errors: u32,
    ) -> Result<Self, TypesError> {
        let config = Self {
            canaries,
            canary_watch_time,
            max_in_flight,
            update_watch_time,
            max_errors,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), TypesError> {
        if self.max_in_flight == 0 || self.max_in_flight > MAX_IN_FLIGHT_LIMIT {
            return Err(TypesError::InvalidMaxInFlight {
                value: self.max_in_flight,
                limit: MAX_IN_FLIGHT_LIMIT,
            });
        }
        Ok(())
    }

    /// Watch window for a canary or a regular batch instance
    pub fn watch_range(&self, canary: bool) -> WatchRange {
        if canary {
            self.canary_watch_time
        } else {
            self.update_watch_time
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watch_range_parsing() {
        let range: WatchRange = "1000-5000".parse().unwrap();
        assert_eq!((range.min_ms(), range.max_ms()), (1000, 5000));

        let range: WatchRange = " 3000 ".parse().unwrap();
        assert_eq!((range.min_ms(), range.max_ms()), (3000, 3000));

        let range: WatchRange = "1000 - 2000".parse().unwrap();
        assert_eq!(range.max(), Duration::from_millis(2000));
    }

    #[test]
    fn test_watch_range_rejects_garbage_and_inversion() {
        assert!(matches!(
            "soon".parse::<WatchRange>(),
            Err(TypesError::InvalidWatchTime(_))
        ));
        assert!(matches!(
            "5000-1000".parse::<WatchRange>(),
            Err(TypesError::InvertedWatchRange { min: 5000, max: 1000 })
        ));
    }

    #[test]
    fn test_watch_range_serde_uses_string_form() {
        let range = WatchRange::new(1000, 3000).unwrap();
        let json = serde_json::to_string(&range).unwrap();
        assert_eq!(json, "\"1000-3000\"");
        let back: WatchRange = serde_json::from_str(&json).unwrap();
        assert_eq!(back, range);

        let bare: WatchRange = serde_json::from_str("2500").unwrap();
        assert_eq!(bare, WatchRange::fixed(2500));
    }

    #[test]
    fn test_max_in_flight_bounds() {
        let watch = WatchRange::fixed(1000);
        assert!(UpdateConfig::new(1, watch, 0, watch, 1).is_err());
        assert!(UpdateConfig::new(1, watch, 33, watch, 1).is_err());
        assert!(UpdateConfig::new(1, watch, 32, watch, 1).is_ok());
    }
}
