use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::firewall::Address;

/// Identity of an authenticated caller, as issued by the auth flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallerId(pub i64);

impl fmt::Display for CallerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// TrustedAddress model - an address currently trusted on a remote firewall
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustedAddress {
    pub id: Option<i64>,
    pub address: Address,
    pub owner: Option<CallerId>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl TrustedAddress {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Convert a timestamp to the stored unix seconds
    pub fn timestamp_to_i64(time: DateTime<Utc>) -> i64 {
        time.timestamp()
    }

    /// Convert stored unix seconds back to a timestamp
    pub fn i64_to_timestamp(timestamp: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(timestamp, 0).single().unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }
}

/// Tenant model - one enforcement host and the credentials to reach it
///
/// `id` is `None` for the configured fallback tenant, which has no row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: Option<i64>,
    pub name: String,
    pub host: String,
    pub channel_user: String,
    pub credential_reference: String,
}

impl Tenant {
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        channel_user: impl Into<String>,
        credential_reference: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            name: name.into(),
            host: host.into(),
            channel_user: channel_user.into(),
            credential_reference: credential_reference.into(),
        }
    }
}

/// Caller model - the account link the registry follows
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    pub id: CallerId,
    pub tenant_id: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_expiry_boundary_is_inclusive() {
        let now = TrustedAddress::i64_to_timestamp(1_700_000_000);
        let record = TrustedAddress {
            id: None,
            address: Address::parse("10.0.0.5").unwrap(),
            owner: Some(CallerId(7)),
            created_at: now,
            expires_at: now + Duration::hours(2),
        };
        assert_eq!(record.expires_at - record.created_at, Duration::hours(2));
        assert!(record.expires_at > record.created_at);
        assert!(!record.is_expired(now));
        assert!(record.is_expired(now + Duration::hours(2)));
    }

    #[test]
    fn test_timestamp_round_trip() {
        let ts = 1_700_000_123;
        assert_eq!(TrustedAddress::timestamp_to_i64(TrustedAddress::i64_to_timestamp(ts)), ts);
    }
}
