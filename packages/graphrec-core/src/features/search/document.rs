//! Graph → index document projection

use graphrec_storage::{Entity, IndexDocument, Relationship};

/// Project an entity and its strongest neighbors into an index document
///
/// `text` holds the type, the id and every attribute value, space separated.
pub fn build_document(entity: &Entity, neighbors: &[Relationship]) -> IndexDocument {
    let mut text = format!("{} {}", entity.entity_type, entity.id);
    for value in entity.attributes.values() {
        text.push(' ');
        text.push_str(&value.as_text());
    }

    IndexDocument {
        entity_id: entity.id.clone(),
        entity_type: entity.entity_type.clone(),
        version: entity.version,
        tombstoned: entity.tombstoned,
        text,
        attributes: entity.attributes.clone(),
        top_neighbors: neighbors.iter().map(|r| r.target.clone()).collect(),
    }
}
