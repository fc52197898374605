//! SQLite graph store
//!
//! Entities and relationships live in two tables; a conditional write is a
//! single transaction that re-checks the version before writing.

use async_trait::async_trait;
use rusqlite::{params, OptionalExtension};
use std::path::Path;

use super::{from_millis, open_connection, to_millis, SharedConnection};
use crate::domain::models::*;
use crate::domain::ports::GraphStore;
use crate::error::{Result, StorageError};

const ENTITY_COLUMNS: &str = "id, entity_type, attributes, version, tombstoned, updated_at";
const RELATIONSHIP_COLUMNS: &str = "source, target, rel_type, weight, updated_at";

/// Raw entity row; attributes are decoded outside the rusqlite closure
struct EntityRow {
    id: String,
    entity_type: String,
    attributes: String,
    version: i64,
    tombstoned: bool,
    updated_at: i64,
}

impl EntityRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            entity_type: row.get(1)?,
            attributes: row.get(2)?,
            version: row.get(3)?,
            tombstoned: row.get(4)?,
            updated_at: row.get(5)?,
        })
    }

    fn into_entity(self) -> Result<Entity> {
        Ok(Entity {
            id: self.id,
            entity_type: self.entity_type,
            attributes: serde_json::from_str(&self.attributes)?,
            version: self.version as u64,
            tombstoned: self.tombstoned,
            updated_at: from_millis(self.updated_at),
        })
    }
}

fn relationship_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Relationship> {
    Ok(Relationship {
        source: row.get(0)?,
        target: row.get(1)?,
        rel_type: row.get(2)?,
        weight: row.get(3)?,
        updated_at: from_millis(row.get(4)?),
    })
}

#[derive(Clone)]
pub struct SqliteGraphStore {
    conn: SharedConnection,
}

impl SqliteGraphStore {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let store = Self {
            conn: open_connection(Some(db_path.as_ref()))?,
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        let store = Self {
            conn: open_connection(None)?,
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS entities (
                id TEXT PRIMARY KEY,
                entity_type TEXT NOT NULL,
                attributes TEXT NOT NULL,
                version INTEGER NOT NULL,
                tombstoned INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS relationships (
                source TEXT NOT NULL,
                target TEXT NOT NULL,
                rel_type TEXT NOT NULL,
                weight REAL NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (source, target, rel_type),
                FOREIGN KEY (source) REFERENCES entities(id),
                FOREIGN KEY (target) REFERENCES entities(id)
            );
            CREATE INDEX IF NOT EXISTS idx_relationships_target
                ON relationships(target, rel_type);",
        )?;
        Ok(())
    }

    fn query_relationships(
        &self,
        column: &str,
        id: &str,
        rel_type: Option<&str>,
    ) -> Result<Vec<Relationship>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} FROM relationships
             WHERE {} = ?1 AND (?2 IS NULL OR rel_type = ?2)
             ORDER BY source, target, rel_type",
            RELATIONSHIP_COLUMNS, column
        );
        let mut stmt = conn.prepare(&sql)?;
        let rels = stmt
            .query_map(params![id, rel_type], relationship_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rels)
    }
}

#[async_trait]
impl GraphStore for SqliteGraphStore {
    async fn get_entity(&self, id: &str) -> Result<Option<Entity>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                &format!("SELECT {} FROM entities WHERE id = ?1", ENTITY_COLUMNS),
                params![id],
                EntityRow::from_row,
            )
            .optional()?;
        row.map(EntityRow::into_entity).transpose()
    }

    async fn conditional_write(&self, write: ConditionalWrite) -> Result<WriteOutcome> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let current_version: Option<i64> = tx
            .query_row(
                "SELECT version FROM entities WHERE id = ?1",
                params![write.entity.id],
                |row| row.get(0),
            )
            .optional()?;
        let current_version = current_version.map(|v| v as u64);
        if current_version != write.expected_version {
            return Ok(WriteOutcome::Conflict { current_version });
        }

        if let Some(rel) = &write.relationship {
            for endpoint in [&rel.source, &rel.target] {
                if endpoint == &write.entity.id {
                    continue;
                }
                let exists: bool = tx.query_row(
                    "SELECT EXISTS(SELECT 1 FROM entities WHERE id = ?1)",
                    params![endpoint],
                    |row| row.get(0),
                )?;
                if !exists {
                    return Err(StorageError::not_found(format!("entity {}", endpoint)));
                }
            }
        }

        let entity = &write.entity;
        tx.execute(
            "INSERT INTO entities (id, entity_type, attributes, version, tombstoned, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                entity_type = excluded.entity_type,
                attributes = excluded.attributes,
                version = excluded.version,
                tombstoned = excluded.tombstoned,
                updated_at = excluded.updated_at",
            params![
                entity.id,
                entity.entity_type,
                serde_json::to_string(&entity.attributes)?,
                entity.version as i64,
                entity.tombstoned,
                to_millis(entity.updated_at),
            ],
        )?;

        if let Some(rel) = &write.relationship {
            tx.execute(
                "INSERT INTO relationships (source, target, rel_type, weight, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(source, target, rel_type) DO UPDATE SET
                    weight = excluded.weight,
                    updated_at = excluded.updated_at",
                params![
                    rel.source,
                    rel.target,
                    rel.rel_type,
                    rel.weight,
                    to_millis(rel.updated_at),
                ],
            )?;
        }

        tx.commit()?;
        Ok(WriteOutcome::Applied)
    }

    async fn get_relationship(&self, key: &RelationshipKey) -> Result<Option<Relationship>> {
        let conn = self.conn.lock();
        let rel = conn
            .query_row(
                &format!(
                    "SELECT {} FROM relationships
                     WHERE source = ?1 AND target = ?2 AND rel_type = ?3",
                    RELATIONSHIP_COLUMNS
                ),
                params![key.source, key.target, key.rel_type],
                relationship_from_row,
            )
            .optional()?;
        Ok(rel)
    }

    async fn relationships_from(
        &self,
        source: &str,
        rel_type: Option<&str>,
    ) -> Result<Vec<Relationship>> {
        self.query_relationships("source", source, rel_type)
    }

    async fn relationships_to(
        &self,
        target: &str,
        rel_type: Option<&str>,
    ) -> Result<Vec<Relationship>> {
        self.query_relationships("target", target, rel_type)
    }

    async fn scan_entities(&self, after: Option<&str>, limit: usize) -> Result<Vec<Entity>> {
        let rows = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM entities
                 WHERE (?1 IS NULL OR id > ?1)
                 ORDER BY id LIMIT ?2",
                ENTITY_COLUMNS
            ))?;
            let mapped = stmt.query_map(params![after, limit as i64], EntityRow::from_row)?;
            mapped.collect::<rusqlite::Result<Vec<_>>>()?
        };
        rows.into_iter().map(EntityRow::into_entity).collect()
    }

    async fn count_entities(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM entities", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn create(id: &str, entity_type: &str) -> ConditionalWrite {
        let mut attrs = Attributes::new();
        attrs.insert("name".to_string(), AttrValue::from(id));
        ConditionalWrite {
            entity: Entity::new(id, entity_type, attrs, Utc::now()),
            expected_version: None,
            relationship: None,
        }
    }

    #[tokio::test]
    async fn test_entity_roundtrip() {
        let store = SqliteGraphStore::in_memory().unwrap();
        store.conditional_write(create("u42", "user")).await.unwrap();

        let entity = store.get_entity("u42").await.unwrap().unwrap();
        assert_eq!(entity.entity_type, "user");
        assert_eq!(entity.version, 1);
        assert_eq!(
            entity.attributes.get("name"),
            Some(&AttrValue::Str("u42".to_string()))
        );
        assert!(store.get_entity("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_version_conflicts() {
        let store = SqliteGraphStore::in_memory().unwrap();
        store.conditional_write(create("u1", "user")).await.unwrap();

        let mut stale = create("u1", "user");
        stale.expected_version = Some(7);
        stale.entity.version = 8;
        assert_eq!(
            store.conditional_write(stale).await.unwrap(),
            WriteOutcome::Conflict {
                current_version: Some(1)
            }
        );
    }

    #[tokio::test]
    async fn test_relationship_write_and_queries() {
        let store = SqliteGraphStore::in_memory().unwrap();
        store.conditional_write(create("item7", "item")).await.unwrap();

        let mut write = create("u42", "user");
        write.relationship = Some(Relationship::new("u42", "item7", "viewed", 2.5, Utc::now()));
        store.conditional_write(write).await.unwrap();

        let key = RelationshipKey::new("u42", "item7", "viewed");
        let rel = store.get_relationship(&key).await.unwrap().unwrap();
        assert_eq!(rel.weight, 2.5);

        assert_eq!(store.relationships_from("u42", None).await.unwrap().len(), 1);
        assert_eq!(
            store
                .relationships_to("item7", Some("viewed"))
                .await
                .unwrap()
                .len(),
            1
        );
        assert!(store
            .relationships_to("item7", Some("bought"))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_relationship_to_missing_target_rolls_back() {
        let store = SqliteGraphStore::in_memory().unwrap();
        let mut write = create("u42", "user");
        write.relationship = Some(Relationship::new("u42", "ghost", "viewed", 1.0, Utc::now()));

        assert!(store.conditional_write(write).await.is_err());
        assert!(store.get_entity("u42").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_scan_and_count() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteGraphStore::open(dir.path().join("graph.db")).unwrap();
        for id in ["b", "a", "c"] {
            store.conditional_write(create(id, "item")).await.unwrap();
        }
        assert_eq!(store.count_entities().await.unwrap(), 3);

        let ids: Vec<_> = store
            .scan_entities(Some("a"), 5)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec!["b", "c"]);
    }
}
