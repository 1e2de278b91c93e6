pub mod store;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Quota sentinel meaning "unlimited".
pub const QUOTA_UNLIMITED: i64 = -1;

/// Per-API access granted to a session: which versions it may call and,
/// optionally, granular path rules within the API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccessDefinition {
    #[serde(default)]
    pub api_name: String,
    #[serde(default)]
    pub api_id: String,
    #[serde(default)]
    pub versions: Vec<String>,
    /// When non-empty, the request must match one of these to pass the
    /// granular-access gate.
    #[serde(default)]
    pub allowed_urls: Vec<AccessSpec>,
    /// A match against any of these rejects the request outright.
    #[serde(default)]
    pub blocked_urls: Vec<AccessSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccessSpec {
    pub url: String,
    #[serde(default)]
    pub methods: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BasicAuthData {
    #[serde(default)]
    pub password: String,
}

/// Per-caller record fetched from the session store on authentication.
///
/// Rate accounting mutates `allowance`/`last_check`, quota accounting
/// mutates `quota_remaining`/`quota_renews`; mutations are written back
/// lazily when the pipeline schedules a session update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    #[serde(default)]
    pub allowance: f64,
    #[serde(default)]
    pub rate: f64,
    /// Refill interval for the rate bucket, in seconds.
    #[serde(default)]
    pub per: f64,
    /// Unix seconds of the last rate-bucket refill.
    #[serde(default)]
    pub last_check: i64,
    /// Unix seconds; 0 means the key never expires.
    #[serde(default)]
    pub expires: i64,
    #[serde(default = "unlimited")]
    pub quota_max: i64,
    #[serde(default)]
    pub quota_remaining: i64,
    /// Window length in seconds.
    #[serde(default)]
    pub quota_renewal_rate: i64,
    /// Unix seconds at which the window resets.
    #[serde(default)]
    pub quota_renews: i64,
    #[serde(default)]
    pub access_rights: HashMap<String, AccessDefinition>,
    #[serde(default)]
    pub org_id: String,
    #[serde(default)]
    pub alias: String,
    #[serde(default)]
    pub oauth_client_id: String,
    #[serde(default)]
    pub basic_auth_data: BasicAuthData,
    #[serde(default)]
    pub hmac_enabled: bool,
    #[serde(default)]
    pub hmac_secret: String,
    #[serde(default)]
    pub is_inactive: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Cached store-side hash of the key this session was fetched under.
    #[serde(skip)]
    pub key_hash: String,
}

fn unlimited() -> i64 {
    QUOTA_UNLIMITED
}

impl Default for Session {
    fn default() -> Self {
        Self {
            allowance: 0.0,
            rate: 0.0,
            per: 0.0,
            last_check: 0,
            expires: 0,
            quota_max: QUOTA_UNLIMITED,
            quota_remaining: 0,
            quota_renewal_rate: 0,
            quota_renews: 0,
            access_rights: HashMap::new(),
            org_id: String::new(),
            alias: String::new(),
            oauth_client_id: String::new(),
            basic_auth_data: BasicAuthData::default(),
            hmac_enabled: false,
            hmac_secret: String::new(),
            is_inactive: false,
            tags: Vec::new(),
            key_hash: String::new(),
        }
    }
}

/// Outcome of one fixed-window quota consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaOutcome {
    Allowed { remaining: i64 },
    Exceeded,
}

impl Session {
    pub fn expired(&self, now: i64) -> bool {
        self.expires > 0 && self.expires < now
    }

    pub fn quota_unlimited(&self) -> bool {
        self.quota_max == QUOTA_UNLIMITED
    }

    /// Token-bucket rate check: refill `allowance` from elapsed time at
    /// `rate / per` tokens per second (capped at `rate`), then consume one.
    /// A zero rate disables the check.
    pub fn take_rate_token(&mut self, now: i64) -> bool {
        if self.rate <= 0.0 {
            return true;
        }
        let per = if self.per > 0.0 { self.per } else { 1.0 };
        let elapsed = (now - self.last_check).max(0) as f64;
        self.allowance = (self.allowance + elapsed * self.rate / per).min(self.rate);
        self.last_check = now;
        if self.allowance < 1.0 {
            return false;
        }
        self.allowance -= 1.0;
        true
    }

    /// Fixed-window quota: when the window has rolled over, remaining resets
    /// to `quota_max` and the renewal timestamp advances. `quota_max == -1`
    /// is the unlimited sentinel and always passes with remaining -1.
    pub fn consume_quota(&mut self, now: i64) -> QuotaOutcome {
        if self.quota_unlimited() {
            return QuotaOutcome::Allowed {
                remaining: QUOTA_UNLIMITED,
            };
        }
        if self.quota_renews < now && self.quota_renewal_rate > 0 {
            self.quota_remaining = self.quota_max;
            self.quota_renews = now + self.quota_renewal_rate;
        }
        if self.quota_remaining <= 0 {
            return QuotaOutcome::Exceeded;
        }
        self.quota_remaining -= 1;
        QuotaOutcome::Allowed {
            remaining: self.quota_remaining,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_with_rate(rate: f64, per: f64) -> Session {
        Session {
            rate,
            per,
            allowance: rate,
            last_check: 1_000,
            ..Session::default()
        }
    }

    #[test]
    fn rate_tokens_run_out() {
        let mut s = session_with_rate(3.0, 60.0);
        assert!(s.take_rate_token(1_000));
        assert!(s.take_rate_token(1_000));
        assert!(s.take_rate_token(1_000));
        assert!(!s.take_rate_token(1_000));
    }

    #[test]
    fn rate_tokens_refill_over_time() {
        let mut s = session_with_rate(2.0, 1.0);
        assert!(s.take_rate_token(1_000));
        assert!(s.take_rate_token(1_000));
        assert!(!s.take_rate_token(1_000));
        // One second at 2 tokens/sec refills the bucket.
        assert!(s.take_rate_token(1_001));
    }

    #[test]
    fn zero_rate_disables_check() {
        let mut s = Session::default();
        for now in 0..100 {
            assert!(s.take_rate_token(now));
        }
    }

    #[test]
    fn quota_decrements_and_exceeds() {
        let mut s = Session {
            quota_max: 2,
            quota_remaining: 2,
            quota_renewal_rate: 300,
            quota_renews: 10_000,
            ..Session::default()
        };
        assert_eq!(s.consume_quota(5_000), QuotaOutcome::Allowed { remaining: 1 });
        assert_eq!(s.consume_quota(5_001), QuotaOutcome::Allowed { remaining: 0 });
        assert_eq!(s.consume_quota(5_002), QuotaOutcome::Exceeded);
    }

    #[test]
    fn quota_window_renews() {
        let mut s = Session {
            quota_max: 5,
            quota_remaining: 0,
            quota_renewal_rate: 300,
            quota_renews: 1_000,
            ..Session::default()
        };
        // Window expired at 1_000; at 2_000 remaining resets to max.
        assert_eq!(s.consume_quota(2_000), QuotaOutcome::Allowed { remaining: 4 });
        assert_eq!(s.quota_renews, 2_300);
    }

    #[test]
    fn unlimited_quota_sentinel() {
        let mut s = Session::default();
        assert_eq!(
            s.consume_quota(1_000),
            QuotaOutcome::Allowed {
                remaining: QUOTA_UNLIMITED
            }
        );
    }

    #[test]
    fn key_expiry() {
        let s = Session {
            expires: 500,
            ..Session::default()
        };
        assert!(s.expired(501));
        assert!(!s.expired(499));
        let never = Session::default();
        assert!(!never.expired(i64::MAX));
    }
}
