//! Typed graph mutations carried by stream events
//!
//! Wire format:
//!
//! ```json
//! {"mutationType": "upsertEntity",    "payload": {"type": "user", "id": "u42", "attrs": {"name": "Ada"}}}
//! {"mutationType": "addRelationship", "payload": {"src": "u42", "dst": "item7", "type": "viewed", "weight": 1}}
//! {"mutationType": "tombstoneEntity", "payload": {"id": "item7"}}
//! ```
//!
//! The long camelCase names (`entityType`, `attributes`, `source`,
//! `target`, `relType`) are accepted as aliases.

use graphrec_storage::{AttrValue, Attributes, RawEvent};
use serde::Deserialize;

use crate::errors::{CoreError, Result};
use crate::features::graph::GraphAdapter;

pub const UPSERT_ENTITY: &str = "upsertEntity";
pub const ADD_RELATIONSHIP: &str = "addRelationship";
pub const TOMBSTONE_ENTITY: &str = "tombstoneEntity";

#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    UpsertEntity {
        entity_type: String,
        id: String,
        attributes: Attributes,
    },
    AddRelationship {
        source: String,
        target: String,
        rel_type: String,
        weight: f64,
    },
    TombstoneEntity {
        id: String,
    },
}

#[derive(Deserialize)]
struct UpsertEntityPayload {
    #[serde(rename = "type", alias = "entityType")]
    entity_type: String,
    id: String,
    #[serde(default, rename = "attrs", alias = "attributes")]
    attributes: serde_json::Map<String, serde_json::Value>,
}

#[derive(Deserialize)]
struct AddRelationshipPayload {
    #[serde(rename = "src", alias = "source")]
    source: String,
    #[serde(rename = "dst", alias = "target")]
    target: String,
    #[serde(rename = "type", alias = "relType")]
    rel_type: String,
    weight: f64,
}

#[derive(Deserialize)]
struct TombstonePayload {
    id: String,
}

impl Mutation {
    /// Validate a raw event; any error makes the event poison
    pub fn parse(event: &RawEvent) -> Result<Self> {
        let mutation = match event.mutation_type.as_str() {
            UPSERT_ENTITY => {
                let payload: UpsertEntityPayload = decode(event)?;
                let mut attributes = Attributes::new();
                for (key, value) in &payload.attributes {
                    let value = AttrValue::from_json(value).ok_or_else(|| {
                        CoreError::validation(format!("attribute {} is not a scalar", key))
                    })?;
                    attributes.insert(key.clone(), value);
                }
                Mutation::UpsertEntity {
                    entity_type: payload.entity_type,
                    id: payload.id,
                    attributes,
                }
            }
            ADD_RELATIONSHIP => {
                let payload: AddRelationshipPayload = decode(event)?;
                Mutation::AddRelationship {
                    source: payload.source,
                    target: payload.target,
                    rel_type: payload.rel_type,
                    weight: payload.weight,
                }
            }
            TOMBSTONE_ENTITY => {
                let payload: TombstonePayload = decode(event)?;
                Mutation::TombstoneEntity { id: payload.id }
            }
            other => {
                return Err(CoreError::validation(format!(
                    "unknown mutation type {:?}",
                    other
                )))
            }
        };
        mutation.check()?;
        Ok(mutation)
    }

    fn check(&self) -> Result<()> {
        let ids: Vec<&str> = match self {
            Mutation::UpsertEntity {
                entity_type, id, ..
            } => {
                if entity_type.trim().is_empty() {
                    return Err(CoreError::validation("empty entity type"));
                }
                vec![id]
            }
            Mutation::AddRelationship {
                source,
                target,
                rel_type,
                weight,
            } => {
                if rel_type.trim().is_empty() {
                    return Err(CoreError::validation("empty relationship type"));
                }
                if !weight.is_finite() || *weight < 0.0 {
                    return Err(CoreError::validation(format!(
                        "weight must be finite and >= 0, got {}",
                        weight
                    )));
                }
                vec![source, target]
            }
            Mutation::TombstoneEntity { id } => vec![id],
        };
        if ids.iter().any(|id| id.trim().is_empty()) {
            return Err(CoreError::validation("empty entity id"));
        }
        Ok(())
    }

    pub async fn apply(&self, graph: &GraphAdapter) -> Result<()> {
        match self {
            Mutation::UpsertEntity {
                entity_type,
                id,
                attributes,
            } => {
                graph
                    .upsert_entity(entity_type, id, attributes.clone())
                    .await?;
            }
            Mutation::AddRelationship {
                source,
                target,
                rel_type,
                weight,
            } => {
                graph
                    .upsert_relationship(source, target, rel_type, *weight)
                    .await?;
            }
            Mutation::TombstoneEntity { id } => {
                graph.tombstone_entity(id).await?;
            }
        }
        Ok(())
    }
}

fn decode<T: serde::de::DeserializeOwned>(event: &RawEvent) -> Result<T> {
    serde_json::from_value(event.payload.clone()).map_err(|e| {
        CoreError::validation(format!(
            "malformed {} payload: {}",
            event.mutation_type, e
        ))
    })
}
