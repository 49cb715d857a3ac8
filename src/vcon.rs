//! The vCon data model (§3 of the spec).
//!
//! The core treats a vCon as an opaque JSON document; it only reaches into
//! the structure for four things: the UUID, the creation timestamp, the
//! party list (secondary indexing), and the tags attachment (routing
//! decisions made by stages). Everything else — dialog, analysis bodies,
//! vendor-specific attachment payloads — passes through untouched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A party entry inside a vCon's `parties` array.
///
/// All fields are optional per the spec; a party with none of them set is
/// legal (e.g. a silent participant placeholder).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Party {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mailto: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Any other vendor fields the producer attached; preserved on round-trip.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// The normalized, indexable filter keys derived from a party list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartyIndexKeys {
    pub tel: Vec<String>,
    pub mailto: Vec<String>,
    pub name: Vec<String>,
}

/// Normalize a vCon's `parties` array into index keys, per §4.2's
/// secondary-index policy: `tel` strips non-digits, `mailto` lowercases,
/// `name` lowercases and trims.
pub fn normalize_party_filters(parties: &[Party]) -> PartyIndexKeys {
    let mut keys = PartyIndexKeys::default();
    for party in parties {
        if let Some(tel) = &party.tel {
            let digits: String = tel.chars().filter(|c| c.is_ascii_digit()).collect();
            if !digits.is_empty() {
                keys.tel.push(digits);
            }
        }
        if let Some(mailto) = &party.mailto {
            let lowered = mailto.to_lowercase();
            if !lowered.is_empty() {
                keys.mailto.push(lowered);
            }
        }
        if let Some(name) = &party.name {
            let normalized = name.trim().to_lowercase();
            if !normalized.is_empty() {
                keys.name.push(normalized);
            }
        }
    }
    keys.tel.sort();
    keys.tel.dedup();
    keys.mailto.sort();
    keys.mailto.dedup();
    keys.name.sort();
    keys.name.dedup();
    keys
}

/// An attachment entry. The distinguished `tags` attachment carries
/// `name:value` strings in its body and is the only attachment type the
/// core interprets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(rename = "type")]
    pub kind: String,
    pub body: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
}

pub const TAGS_ATTACHMENT_TYPE: &str = "tags";

/// A vCon document, as stored and moved through the pipeline.
///
/// Only the fields the core reasons about are typed; `dialog` and
/// `analysis` are kept as opaque JSON since the spec states the core never
/// interprets them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VCon {
    pub uuid: String,
    pub vcon: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub parties: Vec<Party>,
    #[serde(default)]
    pub dialog: Vec<Value>,
    #[serde(default)]
    pub analysis: Vec<Value>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl VCon {
    /// Parse a vCon from its JSON wire representation.
    pub fn from_json(value: &Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value.clone())
    }

    pub fn to_json(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    /// Epoch seconds of `created_at`, used as the score in the `vcons`
    /// sorted set.
    pub fn created_at_epoch(&self) -> i64 {
        self.created_at.timestamp()
    }

    /// Normalized secondary-index keys for this document's parties.
    pub fn party_index_keys(&self) -> PartyIndexKeys {
        normalize_party_filters(&self.parties)
    }

    /// Append (or, if one already exists, extend) a `name:value` tag.
    /// Stages append-only to tags per the invariant in §3; this never
    /// removes a prior tag attachment.
    pub fn add_tag(&mut self, name: &str, value: &str) {
        let entry = format!("{name}:{value}");
        if let Some(existing) = self
            .attachments
            .iter_mut()
            .find(|a| a.kind == TAGS_ATTACHMENT_TYPE)
        {
            match &mut existing.body {
                Value::Array(items) => {
                    if !items.iter().any(|v| v.as_str() == Some(entry.as_str())) {
                        items.push(Value::String(entry));
                    }
                }
                other => {
                    *other = Value::Array(vec![Value::String(entry)]);
                }
            }
        } else {
            self.attachments.push(Attachment {
                kind: TAGS_ATTACHMENT_TYPE.to_string(),
                body: Value::Array(vec![Value::String(entry)]),
                encoding: None,
            });
        }
    }

    /// Read the current set of `name:value` tag strings, flattened across
    /// any tags attachments present (there should be at most one, but
    /// nothing enforces that upstream).
    pub fn tags(&self) -> Vec<String> {
        self.attachments
            .iter()
            .filter(|a| a.kind == TAGS_ATTACHMENT_TYPE)
            .filter_map(|a| a.body.as_array())
            .flatten()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect()
    }

    /// Append a structured DLQ failure marker to `attachments`, per §4.4 /
    /// §7's requirement that a permanent-failure classification be recorded
    /// on the item.
    pub fn add_dlq_marker(&mut self, class: &str, stage: &str, message: &str) {
        let body = serde_json::json!({
            "class": class,
            "stage": stage,
            "message": message,
            "at": Utc::now().to_rfc3339(),
        });
        self.attachments.push(Attachment {
            kind: "dlq_marker".to_string(),
            body,
            encoding: None,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> VCon {
        VCon {
            uuid: "11111111-1111-1111-1111-111111111111".to_string(),
            vcon: "0.0.1".to_string(),
            created_at: "2024-01-01T00:00:00Z".parse().unwrap(),
            parties: vec![Party {
                tel: Some("+1 (555) 123-4567".to_string()),
                mailto: Some("Alice@Example.COM".to_string()),
                name: Some("  Alice Smith  ".to_string()),
                role: None,
                extra: Default::default(),
            }],
            dialog: vec![],
            analysis: vec![],
            attachments: vec![],
        }
    }

    #[test]
    fn normalizes_party_filters() {
        let v = sample();
        let keys = v.party_index_keys();
        assert_eq!(keys.tel, vec!["15551234567".to_string()]);
        assert_eq!(keys.mailto, vec!["alice@example.com".to_string()]);
        assert_eq!(keys.name, vec!["alice smith".to_string()]);
    }

    #[test]
    fn add_tag_appends_and_dedupes() {
        let mut v = sample();
        v.add_tag("processed", "true");
        v.add_tag("processed", "true");
        v.add_tag("sampled", "false");
        assert_eq!(
            v.tags(),
            vec!["processed:true".to_string(), "sampled:false".to_string()]
        );
    }

    #[test]
    fn created_at_epoch_matches_rfc3339() {
        let v = sample();
        assert_eq!(v.created_at_epoch(), 1704067200);
    }

    #[test]
    fn round_trips_through_json() {
        let v = sample();
        let json = v.to_json().unwrap();
        let back = VCon::from_json(&json).unwrap();
        assert_eq!(back.uuid, v.uuid);
        assert_eq!(back.created_at, v.created_at);
    }
}
