//! Persisted document format.
//!
//! A document is an ordered list of entity records. The first record always
//! describes the application; every other record names its parent by uuid so
//! the tree can be rebuilt regardless of the order records are visited in.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entity::{EntityKind, FaderPoint};
use crate::note::Note;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Document {
    pub entities: Vec<EntityRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub kind: EntityKind,
    pub meta: EntityMeta,
    #[serde(default, skip_serializing_if = "EntitySpec::is_empty")]
    pub spec: EntitySpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityMeta {
    pub uuid: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Owning entity; structural containers are implied by the record kind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<Uuid>,
    /// Enclosing context, for entities that live inside one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<Uuid>,
}

/// Type-specific attributes. Only the fields relevant to a record's kind are set.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EntitySpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_count: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tempo: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_signature: Option<[u32; 2]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<FaderPoint>,
    /// Send destination; absent means the owning track's default destination.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gain: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synthdef: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clip: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_looping: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<Note>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_muted: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_soloed: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_cued: bool,
}

impl EntitySpec {
    pub fn is_empty(&self) -> bool {
        *self == EntitySpec::default()
    }
}

impl EntityRecord {
    pub fn new(kind: EntityKind, uuid: Uuid) -> Self {
        Self {
            kind,
            meta: EntityMeta {
                uuid,
                name: None,
                parent: None,
                owner: None,
            },
            spec: EntitySpec::default(),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.meta.uuid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_fields_are_omitted() {
        let record = EntityRecord::new(EntityKind::Scene, Uuid::nil());
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "kind": "Scene",
                "meta": {"uuid": "00000000-0000-0000-0000-000000000000"}
            })
        );
    }

    #[test]
    fn missing_spec_deserializes_as_empty() {
        let json = r#"{"kind":"Slot","meta":{"uuid":"00000000-0000-0000-0000-000000000000","parent":"00000000-0000-0000-0000-000000000001"}}"#;
        let record: EntityRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.kind, EntityKind::Slot);
        assert!(record.spec.is_empty());
        assert!(record.meta.parent.is_some());
    }

    #[test]
    fn notes_survive_json() {
        let mut record = EntityRecord::new(EntityKind::Clip, Uuid::nil());
        record.spec.notes = vec![Note::new(0.0, 0.25, 60, 100.0)];
        record.spec.duration = Some(1.0);
        let json = serde_json::to_string(&record).unwrap();
        let back: EntityRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
