//! Push events delivered on the per-user inbound channel.
//!
//! The server sends four envelope shapes. A bare message has no `type` field;
//! the others carry `type` = `read`, `closed` or `deleted`. Everything is decoded
//! here, once, so subscribers match on [`PushEvent`] instead of probing JSON.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::models::{wire_time, ConversationKey, EmpId, Message, RideId};

#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    ChatMessage(Message),
    ReadReceipt {
        ride_id: RideId,
        reader: EmpId,
        up_to: DateTime<Utc>,
    },
    Closed {
        ride_id: RideId,
    },
    Deleted {
        ride_id: RideId,
        by: EmpId,
        other: EmpId,
    },
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum Tagged {
    Read {
        #[serde(rename = "rideId")]
        ride_id: RideId,
        reader: EmpId,
        #[serde(rename = "upTo", with = "wire_time")]
        up_to: DateTime<Utc>,
    },
    Closed {
        #[serde(rename = "rideId")]
        ride_id: RideId,
    },
    Deleted {
        #[serde(rename = "rideId")]
        ride_id: RideId,
        by: EmpId,
        other: EmpId,
    },
}

impl From<Tagged> for PushEvent {
    fn from(tagged: Tagged) -> Self {
        match tagged {
            Tagged::Read {
                ride_id,
                reader,
                up_to,
            } => PushEvent::ReadReceipt {
                ride_id,
                reader,
                up_to,
            },
            Tagged::Closed { ride_id } => PushEvent::Closed { ride_id },
            Tagged::Deleted { ride_id, by, other } => PushEvent::Deleted { ride_id, by, other },
        }
    }
}

impl PushEvent {
    /// Decode one envelope. Malformed or unknown payloads yield `None`.
    pub fn decode(body: &str) -> Option<Self> {
        let value: serde_json::Value = match serde_json::from_str(body) {
            Ok(value) => value,
            Err(e) => {
                tracing::debug!("Dropping unparseable push payload: {}", e);
                return None;
            }
        };

        let decoded = if value.get("type").is_some() {
            serde_json::from_value::<Tagged>(value).map(PushEvent::from)
        } else {
            serde_json::from_value::<Message>(value).map(PushEvent::ChatMessage)
        };

        match decoded {
            Ok(event) => Some(event),
            Err(e) => {
                tracing::debug!("Dropping malformed push payload: {}", e);
                None
            }
        }
    }

    pub fn ride_id(&self) -> RideId {
        match self {
            PushEvent::ChatMessage(msg) => msg.ride_id,
            PushEvent::ReadReceipt { ride_id, .. }
            | PushEvent::Closed { ride_id }
            | PushEvent::Deleted { ride_id, .. } => *ride_id,
        }
    }

    /// Conversation named by a deletion, from `me`'s point of view.
    pub fn deleted_key(&self, me: EmpId) -> Option<ConversationKey> {
        match self {
            PushEvent::Deleted { ride_id, by, other } => {
                let counterpart = if *by == me { *other } else { *by };
                Some(ConversationKey::new(*ride_id, counterpart))
            }
            _ => None,
        }
    }
}
