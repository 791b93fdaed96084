//! The board message record.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// A message identifier, assigned by the store.
pub type MessageId = i64;

/// A persisted board message.
///
/// Instances are only produced by the store; the server never accepts one
/// from a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Store-assigned identifier, strictly increasing in insertion order.
    pub id: MessageId,
    /// Trimmed, non-empty message text.
    pub text: String,
    /// Moment the message was durably inserted.
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Create a new message record.
    #[must_use]
    pub fn new(id: MessageId, text: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            text: text.into(),
            created_at,
        }
    }
}

/// Format a timestamp the way it is stored and sent: RFC 3339, UTC,
/// microsecond precision, `Z` suffix.
#[must_use]
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a timestamp produced by [`format_timestamp`].
///
/// # Errors
///
/// Returns an error if the string is not valid RFC 3339.
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|ts| ts.with_timezone(&Utc))
}

mod timestamp {
    use chrono::{DateTime, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_timestamp(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let s = String::deserialize(deserializer)?;
        super::parse_timestamp(&s).map_err(de::Error::custom)
    }
}
