//! Domain models shared by every component.
//!
//! - `Entity` / `Relationship`: the canonical graph
//! - `RawEvent` / `DeadLetter`: the ingestion stream
//! - `Lease` / `Checkpoint`: batch coordination
//! - `CacheEntry` / `IndexDocument`: derived read models
//! - `ChangeNotification`: graph → subscriber messages

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Entity identifier (e.g. `"u42"`, `"item7"`)
pub type EntityId = String;

/// Globally unique event identifier
pub type EventId = String;

/// Type tag given to entities created implicitly as relationship endpoints
pub const UNKNOWN_ENTITY_TYPE: &str = "unknown";

// ═══════════════════════════════════════════════════════════════════════════
// Graph
// ═══════════════════════════════════════════════════════════════════════════

/// Scalar attribute value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl AttrValue {
    /// Convert a JSON value. Arrays, objects and null are not scalars.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Bool(b) => Some(AttrValue::Bool(*b)),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(AttrValue::Int)
                .or_else(|| n.as_f64().map(AttrValue::Float)),
            serde_json::Value::String(s) => Some(AttrValue::Str(s.clone())),
            _ => None,
        }
    }

    /// Text form used when building search documents
    pub fn as_text(&self) -> String {
        match self {
            AttrValue::Bool(b) => b.to_string(),
            AttrValue::Int(i) => i.to_string(),
            AttrValue::Float(f) => f.to_string(),
            AttrValue::Str(s) => s.clone(),
        }
    }
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        AttrValue::Str(value.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(value: String) -> Self {
        AttrValue::Str(value)
    }
}

impl From<i64> for AttrValue {
    fn from(value: i64) -> Self {
        AttrValue::Int(value)
    }
}

impl From<f64> for AttrValue {
    fn from(value: f64) -> Self {
        AttrValue::Float(value)
    }
}

impl From<bool> for AttrValue {
    fn from(value: bool) -> Self {
        AttrValue::Bool(value)
    }
}

/// Ordered attribute map (ordering keeps stored JSON and documents stable)
pub type Attributes = BTreeMap<String, AttrValue>;

/// Graph node
///
/// Entities are never physically deleted. `tombstoned` hides them from
/// recommendations while keeping relationships referentially valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub entity_type: String,
    #[serde(default)]
    pub attributes: Attributes,
    /// Monotonic, starts at 1 on creation, +1 per mutation
    pub version: u64,
    #[serde(default)]
    pub tombstoned: bool,
    pub updated_at: DateTime<Utc>,
}

impl Entity {
    /// A freshly created entity (version 1)
    pub fn new(
        id: impl Into<String>,
        entity_type: impl Into<String>,
        attributes: Attributes,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            entity_type: entity_type.into(),
            attributes,
            version: 1,
            tombstoned: false,
            updated_at: now,
        }
    }

    /// Copy of this entity with the version bumped
    pub fn next_version(&self, now: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        next.version += 1;
        next.updated_at = now;
        next
    }
}

/// Identity of a relationship: at most one per triple
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RelationshipKey {
    pub source: EntityId,
    pub target: EntityId,
    pub rel_type: String,
}

impl RelationshipKey {
    pub fn new(
        source: impl Into<String>,
        target: impl Into<String>,
        rel_type: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            rel_type: rel_type.into(),
        }
    }
}

/// Directed, typed, weighted edge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub source: EntityId,
    pub target: EntityId,
    pub rel_type: String,
    pub weight: f64,
    pub updated_at: DateTime<Utc>,
}

impl Relationship {
    pub fn new(
        source: impl Into<String>,
        target: impl Into<String>,
        rel_type: impl Into<String>,
        weight: f64,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            rel_type: rel_type.into(),
            weight,
            updated_at,
        }
    }

    pub fn key(&self) -> RelationshipKey {
        RelationshipKey::new(&self.source, &self.target, &self.rel_type)
    }
}

/// Conditional write against the graph store
///
/// `expected_version = None` means the entity must not exist yet. When a
/// relationship is attached it is committed atomically with the entity.
#[derive(Debug, Clone)]
pub struct ConditionalWrite {
    pub entity: Entity,
    pub expected_version: Option<u64>,
    pub relationship: Option<Relationship>,
}

/// Result of a conditional write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Applied,
    /// Another writer got there first
    Conflict { current_version: Option<u64> },
}

/// What kind of mutation produced a change notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    EntityUpserted,
    RelationshipUpserted,
    Tombstoned,
}

impl MutationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationKind::EntityUpserted => "entity_upserted",
            MutationKind::RelationshipUpserted => "relationship_upserted",
            MutationKind::Tombstoned => "tombstoned",
        }
    }
}

/// Emitted after every committed graph mutation (at-least-once)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangeNotification {
    pub entity_id: EntityId,
    pub entity_type: String,
    pub version: u64,
    pub kind: MutationKind,
}

// ═══════════════════════════════════════════════════════════════════════════
// Event stream
// ═══════════════════════════════════════════════════════════════════════════

/// Event as delivered by the stream, before validation
///
/// Wire names follow the upstream schema (`eventId`, `partitionKey`,
/// `mutationType`, `payload`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEvent {
    pub event_id: EventId,
    pub partition_key: String,
    /// Position within the partition, assigned by the stream
    #[serde(default)]
    pub offset: u64,
    pub mutation_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default = "Utc::now")]
    pub arrived_at: DateTime<Utc>,
}

impl RawEvent {
    pub fn new(
        event_id: impl Into<String>,
        partition_key: impl Into<String>,
        mutation_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            partition_key: partition_key.into(),
            offset: 0,
            mutation_type: mutation_type.into(),
            payload,
            arrived_at: Utc::now(),
        }
    }
}

/// Poison event parked for operators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub event: RawEvent,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

// ═══════════════════════════════════════════════════════════════════════════
// Batch coordination
// ═══════════════════════════════════════════════════════════════════════════

/// Exclusive, time-bounded execution grant for a named job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub job_name: String,
    pub holder_id: String,
    /// Set by the lease store's clock, never the caller's
    pub expires_at: DateTime<Utc>,
    /// Increases every time the lease changes hands
    pub fencing_token: u64,
}

impl Lease {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }

    /// Same grant (holder and token), regardless of expiry
    pub fn same_grant(&self, other: &Lease) -> bool {
        self.job_name == other.job_name
            && self.holder_id == other.holder_id
            && self.fencing_token == other.fencing_token
    }
}

/// Resume position of a chunked job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Cursor {
    Start,
    /// Entity range boundary: resume strictly after this id
    EntityAfter(EntityId),
    /// Event stream offset
    Offset(u64),
}

impl Cursor {
    /// Entity id to scan after (None = from the beginning)
    pub fn entity_after(&self) -> Option<&str> {
        match self {
            Cursor::EntityAfter(id) => Some(id.as_str()),
            _ => None,
        }
    }
}

/// Last committed position of a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub job_name: String,
    pub cursor: Cursor,
    pub chunks_committed: u64,
    pub items_processed: u64,
    pub updated_at: DateTime<Utc>,
    /// Token of the lease the last write was made under
    #[serde(default)]
    pub fencing_token: u64,
}

impl Checkpoint {
    pub fn start(job_name: impl Into<String>) -> Self {
        Self {
            job_name: job_name.into(),
            cursor: Cursor::Start,
            chunks_committed: 0,
            items_processed: 0,
            updated_at: Utc::now(),
            fencing_token: 0,
        }
    }

    /// Checkpoint after one more committed chunk
    pub fn advance(&self, cursor: Cursor, items: u64) -> Self {
        Self {
            job_name: self.job_name.clone(),
            cursor,
            chunks_committed: self.chunks_committed + 1,
            items_processed: self.items_processed + items,
            updated_at: Utc::now(),
            fencing_token: self.fencing_token,
        }
    }

    pub fn fenced(mut self, fencing_token: u64) -> Self {
        self.fencing_token = fencing_token;
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Derived read models
// ═══════════════════════════════════════════════════════════════════════════

/// Precomputed recommendation list for one entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub entity_id: EntityId,
    pub items: Vec<EntityId>,
    /// Entity version the list was computed against
    pub graph_version: u64,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Denormalized search document for one entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDocument {
    pub entity_id: EntityId,
    pub entity_type: String,
    /// Entity version this document was derived from
    pub version: u64,
    pub tombstoned: bool,
    /// Free text built from attributes (full-text searchable)
    pub text: String,
    #[serde(default)]
    pub attributes: Attributes,
    /// Strongest outgoing neighbors at derivation time
    #[serde(default)]
    pub top_neighbors: Vec<EntityId>,
}
