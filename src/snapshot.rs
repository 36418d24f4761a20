//! Authoritative quota readings handed to the governor by the transport.

/// Header carrying the window's total quota.
pub const LIMIT_HEADER: &str = "x-ratelimit-limit";
/// Header carrying the quota left in the current window.
pub const REMAINING_HEADER: &str = "x-ratelimit-remaining";
/// Header carrying the Unix timestamp (seconds) at which the window refills.
pub const RESET_HEADER: &str = "x-ratelimit-reset";

/// A `(limit, remaining, reset_at)` reading for one bucket.
///
/// Each field is optional: a response that only carries some of the headers
/// overwrites only those fields of the stored bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Snapshot {
    /// Total quota per window.
    pub limit: Option<u64>,
    /// Units left in the window. Negative readings are clamped to zero on apply.
    pub remaining: Option<i64>,
    /// Window refill instant, Unix seconds.
    pub reset_at: Option<u64>,
}

impl Snapshot {
    /// A complete reading.
    pub fn new(limit: u64, remaining: i64, reset_at: u64) -> Self {
        Self { limit: Some(limit), remaining: Some(remaining), reset_at: Some(reset_at) }
    }

    /// True when no field is present.
    pub fn is_empty(&self) -> bool {
        self.limit.is_none() && self.remaining.is_none() && self.reset_at.is_none()
    }

    /// Parse the `X-RateLimit-*` headers. Names are matched case-insensitively;
    /// missing or unparsable values are left as `None`.
    pub fn from_headers<'a, I>(headers: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut snapshot = Snapshot::default();
        for (name, value) in headers {
            if name.eq_ignore_ascii_case(LIMIT_HEADER) {
                snapshot.limit = parse_int(value).and_then(|v| u64::try_from(v).ok());
            } else if name.eq_ignore_ascii_case(REMAINING_HEADER) {
                snapshot.remaining = parse_int(value);
            } else if name.eq_ignore_ascii_case(RESET_HEADER) {
                snapshot.reset_at = parse_int(value).and_then(|v| u64::try_from(v).ok());
            }
        }
        snapshot
    }
}

/// Responses that carry a quota reading for the governor to record.
pub trait ReportsQuota {
    fn quota_snapshot(&self) -> Option<Snapshot>;
}

impl ReportsQuota for Snapshot {
    fn quota_snapshot(&self) -> Option<Snapshot> {
        Some(*self)
    }
}

impl<T> ReportsQuota for (T, Snapshot) {
    fn quota_snapshot(&self) -> Option<Snapshot> {
        Some(self.1)
    }
}

impl<T: ReportsQuota> ReportsQuota for Option<T> {
    fn quota_snapshot(&self) -> Option<Snapshot> {
        self.as_ref().and_then(ReportsQuota::quota_snapshot)
    }
}

fn parse_int(raw: &str) -> Option<i64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed.parse::<i64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rate_limit_headers() {
        let headers = [
            ("X-RateLimit-Limit", "5000"),
            ("X-RateLimit-Remaining", "4999"),
            ("X-RateLimit-Reset", "1700000000"),
            ("Content-Type", "application/json"),
        ];
        let snap = Snapshot::from_headers(headers);
        assert_eq!(snap, Snapshot::new(5000, 4999, 1_700_000_000));
    }

    #[test]
    fn missing_and_garbage_headers_are_none() {
        let snap = Snapshot::from_headers([("x-ratelimit-limit", " "), ("x-ratelimit-reset", "soon")]);
        assert!(snap.is_empty());
    }

    #[test]
    fn header_names_are_case_insensitive() {
        let snap = Snapshot::from_headers([("x-RATELIMIT-remaining", " 12 ")]);
        assert_eq!(snap.remaining, Some(12));
        assert_eq!(snap.limit, None);
    }
}
