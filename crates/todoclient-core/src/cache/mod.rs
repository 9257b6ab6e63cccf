//! Timestamped wrappers for data fetched from the service.
//!
//! The session keeps the user's to-do items in memory as a `CachedData`
//! so callers can show how old the list is and decide when to reload it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default age after which a cached list should be reloaded.
pub const DEFAULT_STALE_MINUTES: i64 = 15;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedData<T> {
    pub data: T,
    pub cached_at: DateTime<Utc>,
}

impl<T> CachedData<T> {
    pub fn new(data: T) -> Self {
        Self {
            data,
            cached_at: Utc::now(),
        }
    }

    pub fn age_minutes(&self) -> i64 {
        (Utc::now() - self.cached_at).num_minutes()
    }

    /// Short human form: "just now", "5m ago", "3h ago", "2d ago".
    pub fn age_display(&self) -> String {
        match self.age_minutes() {
            // Clock skew reads as fresh
            m if m < 1 => "just now".to_string(),
            m if m < 60 => format!("{}m ago", m),
            m if m < 1440 => format!("{}h ago", (m + 30) / 60),
            m => format!("{}d ago", (m + 720) / 1440),
        }
    }

    pub fn is_stale(&self, stale_minutes: i64) -> bool {
        self.age_minutes() > stale_minutes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn aged(minutes: i64) -> CachedData<Vec<u8>> {
        let mut cached = CachedData::new(vec![1]);
        cached.cached_at = Utc::now() - Duration::minutes(minutes);
        cached
    }

    #[test]
    fn test_age_display() {
        assert_eq!(CachedData::new(()).age_display(), "just now");
        assert_eq!(aged(5).age_display(), "5m ago");
        assert_eq!(aged(90).age_display(), "2h ago");
        assert_eq!(aged(60 * 30).age_display(), "1d ago");
        assert_eq!(aged(-10).age_display(), "just now");
    }

    #[test]
    fn test_is_stale() {
        assert!(!CachedData::new(()).is_stale(DEFAULT_STALE_MINUTES));
        assert!(aged(DEFAULT_STALE_MINUTES + 1).is_stale(DEFAULT_STALE_MINUTES));
    }
}
