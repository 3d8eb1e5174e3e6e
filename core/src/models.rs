//! Data models for RideChat

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Identifiers
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RideId(pub i64);

impl fmt::Display for RideId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Employee id. Both the local user and counterparts are employees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EmpId(pub i64);

impl fmt::Display for EmpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A conversation as seen from the local user: one ride, one counterpart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConversationKey {
    pub ride_id: RideId,
    pub counterpart_id: EmpId,
}

impl ConversationKey {
    pub fn new(ride_id: RideId, counterpart_id: EmpId) -> Self {
        Self {
            ride_id,
            counterpart_id,
        }
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ride {} / emp {}", self.ride_id, self.counterpart_id)
    }
}

// ============================================================================
// Messages
// ============================================================================

/// Identity of a message inside a timeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageKey {
    /// Server-assigned id.
    Durable(i64),
    /// Derived from (ride, timestamp, sender, recipient) when the server sent no id.
    Synthetic(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub ride_id: RideId,
    pub from_id: EmpId,
    pub to_id: EmpId,
    pub content: String,
    #[serde(with = "wire_time")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub read: bool,
}

impl Message {
    pub fn key(&self) -> MessageKey {
        match self.id {
            Some(id) => MessageKey::Durable(id),
            None => MessageKey::Synthetic(self.synthetic_key()),
        }
    }

    pub fn synthetic_key(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.ride_id,
            self.timestamp.timestamp_millis(),
            self.from_id,
            self.to_id
        )
    }

    pub fn is_from(&self, emp: EmpId) -> bool {
        self.from_id == emp
    }

    /// The other participant, from `me`'s point of view.
    pub fn counterpart(&self, me: EmpId) -> EmpId {
        if self.from_id == me {
            self.to_id
        } else {
            self.from_id
        }
    }

    pub fn conversation_key(&self, me: EmpId) -> ConversationKey {
        ConversationKey::new(self.ride_id, self.counterpart(me))
    }
}

// ============================================================================
// Conversation
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Conversation {
    pub key: ConversationKey,
    pub counterpart_name: Option<String>,
    pub last_preview: Option<String>,
    pub last_timestamp: Option<DateTime<Utc>>,
    /// When the entry was first listed or created locally.
    pub listed_at: DateTime<Utc>,
    pub unread_count: u32,
    pub closed: bool,
}

impl Conversation {
    pub fn new(key: ConversationKey, listed_at: DateTime<Utc>) -> Self {
        Self {
            key,
            counterpart_name: None,
            last_preview: None,
            last_timestamp: None,
            listed_at,
            unread_count: 0,
            closed: false,
        }
    }

    /// Recency used for ordering: last message, else listing time.
    pub fn recency(&self) -> DateTime<Utc> {
        self.last_timestamp.unwrap_or(self.listed_at)
    }
}

// ============================================================================
// REST payloads
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub ride_id: RideId,
    pub counterpart_id: EmpId,
    #[serde(default)]
    pub counterpart_name: Option<String>,
    #[serde(default, with = "wire_time::option")]
    pub last_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_preview: Option<String>,
    #[serde(default)]
    pub unread_count: u32,
}

impl ConversationSummary {
    pub fn key(&self) -> ConversationKey {
        ConversationKey::new(self.ride_id, self.counterpart_id)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct UnreadCount {
    pub unread: u32,
}

// ============================================================================
// Outbound publishes
// ============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendPayload<'a> {
    pub ride_id: RideId,
    pub to_emp_id: EmpId,
    pub content: &'a str,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceiptPayload {
    pub ride_id: RideId,
    pub other_emp_id: EmpId,
    #[serde(with = "wire_time")]
    pub up_to: DateTime<Utc>,
}

// ============================================================================
// Timestamps
// ============================================================================

/// Timestamps are written as RFC 3339 and read leniently: RFC 3339, a zone-less
/// ISO local date-time (taken as UTC) or epoch milliseconds.
pub(crate) mod wire_time {
    use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Millis(i64),
        Text(String),
    }

    pub fn parse(text: &str) -> Option<DateTime<Utc>> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
            return Some(dt.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .map(|naive| Utc.from_utc_datetime(&naive))
    }

    fn from_raw(raw: Raw) -> Option<DateTime<Utc>> {
        match raw {
            Raw::Millis(ms) => Utc.timestamp_millis_opt(ms).single(),
            Raw::Text(text) => parse(&text),
        }
    }

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        from_raw(Raw::deserialize(d)?).ok_or_else(|| D::Error::custom("unrecognised timestamp"))
    }

    pub mod option {
        use super::{from_raw, Raw};
        use chrono::{DateTime, Utc};
        use serde::de::Error as _;
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            ts: &Option<DateTime<Utc>>,
            s: S,
        ) -> Result<S::Ok, S::Error> {
            match ts {
                Some(ts) => super::serialize(ts, s),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            d: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            match Option::<Raw>::deserialize(d)? {
                Some(raw) => from_raw(raw)
                    .map(Some)
                    .ok_or_else(|| D::Error::custom("unrecognised timestamp")),
                None => Ok(None),
            }
        }
    }
}
