use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Identifiers handed back for a freshly stored secret.
#[derive(Debug, Clone, PartialEq)]
pub struct Inserted {
    pub access_key: Uuid,
    pub deletion_key: Uuid,
    pub expires_at: DateTime<Utc>,
}

/// Bounds applied to caller-requested view and duration limits.
#[derive(Debug, Clone)]
pub struct SecretPolicy {
    pub min_lifetime: Duration,
    pub default_lifetime: Duration,
    pub max_lifetime: Duration,
    pub default_view_limit: u32,
}

impl Default for SecretPolicy {
    fn default() -> Self {
        Self {
            min_lifetime: Duration::from_secs(60),
            default_lifetime: Duration::from_secs(24 * 3600),
            max_lifetime: Duration::from_secs(7 * 24 * 3600),
            default_view_limit: 1,
        }
    }
}

impl SecretPolicy {
    /// Lifetime for a requested duration string such as `"30m"` or `"2d"`.
    /// Missing or unparsable input gets the default; anything else is
    /// clamped to `[min_lifetime, max_lifetime]`.
    pub fn lifetime(&self, requested: Option<&str>) -> Duration {
        match requested.map(str::trim).filter(|s| !s.is_empty()) {
            None => self.default_lifetime,
            Some(s) => match humantime::parse_duration(s) {
                Ok(d) => d.clamp(self.min_lifetime, self.max_lifetime),
                Err(_) => self.default_lifetime,
            },
        }
    }

    /// View limit for a requested count. Anything below 1 or unparsable
    /// falls back to the default.
    pub fn view_limit(&self, requested: Option<&str>) -> u32 {
        requested
            .and_then(|s| s.trim().parse::<u32>().ok())
            .filter(|n| *n >= 1)
            .unwrap_or(self.default_view_limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifetime_defaults_and_clamps() {
        let p = SecretPolicy::default();
        assert_eq!(p.lifetime(None), Duration::from_secs(86400));
        assert_eq!(p.lifetime(Some("")), Duration::from_secs(86400));
        assert_eq!(p.lifetime(Some("garbage")), Duration::from_secs(86400));
        assert_eq!(p.lifetime(Some("5s")), Duration::from_secs(60));
        assert_eq!(p.lifetime(Some("30m")), Duration::from_secs(1800));
        assert_eq!(p.lifetime(Some("30d")), Duration::from_secs(7 * 86400));
    }

    #[test]
    fn view_limit_defaults() {
        let p = SecretPolicy::default();
        assert_eq!(p.view_limit(None), 1);
        assert_eq!(p.view_limit(Some("0")), 1);
        assert_eq!(p.view_limit(Some("-3")), 1);
        assert_eq!(p.view_limit(Some("abc")), 1);
        assert_eq!(p.view_limit(Some("5")), 5);
    }
}
