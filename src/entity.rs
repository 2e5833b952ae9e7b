//! Entity Registry
//!
//! The in-memory entity graph a node serves from. The master mutates it
//! through the API and persists it; passive nodes have it replaced
//! wholesale by rebind passes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::ha::Epoch;
use crate::store::EntitySnapshot;

/// A supervised entity (application or infrastructure resource)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Unique entity ID
    pub id: String,
    /// Entity type, e.g. "application"
    pub kind: String,
    /// Display name
    pub name: String,
    /// Free-form configuration
    #[serde(default)]
    pub config: serde_json::Value,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl Entity {
    /// Create a new entity with a fresh ID
    pub fn new(kind: impl Into<String>, name: impl Into<String>, config: serde_json::Value) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            kind: kind.into(),
            name: name.into(),
            config,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Default)]
struct EntityGraph {
    version: u64,
    entities: BTreeMap<String, Entity>,
}

/// Shared in-memory entity graph
pub struct EntityRegistry {
    graph: RwLock<EntityGraph>,
}

impl EntityRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            graph: RwLock::new(EntityGraph::default()),
        }
    }

    /// Current graph version
    pub async fn version(&self) -> u64 {
        self.graph.read().await.version
    }

    /// Number of entities
    pub async fn len(&self) -> usize {
        self.graph.read().await.entities.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// All entities of a kind
    pub async fn list(&self, kind: &str) -> Vec<Entity> {
        let graph = self.graph.read().await;
        graph
            .entities
            .values()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }

    /// Look up an entity by ID
    pub async fn get(&self, id: &str) -> Option<Entity> {
        self.graph.read().await.entities.get(id).cloned()
    }

    /// Insert a new entity
    pub async fn create(&self, entity: Entity) -> Entity {
        let mut graph = self.graph.write().await;
        graph.version += 1;
        graph.entities.insert(entity.id.clone(), entity.clone());
        entity
    }

    /// Rename and/or reconfigure an entity
    pub async fn update(
        &self,
        id: &str,
        name: Option<String>,
        config: Option<serde_json::Value>,
    ) -> Result<Entity> {
        let mut graph = self.graph.write().await;
        let entity = graph
            .entities
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        if let Some(name) = name {
            entity.name = name;
        }
        if let Some(config) = config {
            entity.config = config;
        }
        entity.updated_at = chrono::Utc::now();
        let updated = entity.clone();
        graph.version += 1;
        Ok(updated)
    }

    /// Remove an entity
    pub async fn delete(&self, id: &str) -> Result<Entity> {
        let mut graph = self.graph.write().await;
        let removed = graph
            .entities
            .remove(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        graph.version += 1;
        Ok(removed)
    }

    /// Replace the whole graph with a persisted snapshot
    pub async fn replace_from(&self, snapshot: &EntitySnapshot) {
        let mut graph = self.graph.write().await;
        graph.version = snapshot.version;
        graph.entities = snapshot.entities.clone();
    }

    /// Drop all state (node no longer holds usable data)
    pub async fn clear(&self) {
        let mut graph = self.graph.write().await;
        graph.version = 0;
        graph.entities.clear();
    }

    /// Capture the graph for persistence
    pub async fn to_snapshot(&self, written_by: &str, epoch: Option<Epoch>) -> EntitySnapshot {
        let graph = self.graph.read().await;
        EntitySnapshot {
            version: graph.version,
            written_by: written_by.to_string(),
            epoch,
            written_at: chrono::Utc::now(),
            entities: graph.entities.clone(),
        }
    }
}

impl Default for EntityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_crud_bumps_version() {
        let registry = EntityRegistry::new();
        let app = registry
            .create(Entity::new("application", "web", serde_json::json!({})))
            .await;
        assert_eq!(registry.version().await, 1);

        let updated = registry
            .update(&app.id, Some("web-2".into()), None)
            .await
            .unwrap();
        assert_eq!(updated.name, "web-2");
        assert_eq!(registry.version().await, 2);

        registry.delete(&app.id).await.unwrap();
        assert!(registry.get(&app.id).await.is_none());
        assert_eq!(registry.version().await, 3);
    }

    #[tokio::test]
    async fn test_missing_entity() {
        let registry = EntityRegistry::new();
        assert!(matches!(registry.delete("nope").await, Err(Error::NotFound(_))));
        assert!(matches!(
            registry.update("nope", None, None).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_snapshot_replace() {
        let source = EntityRegistry::new();
        source
            .create(Entity::new("application", "db", serde_json::json!({"size": "m"})))
            .await;
        source
            .create(Entity::new("location", "eu-west", serde_json::Value::Null))
            .await;
        let snapshot = source.to_snapshot("mgmt-1", Some(Epoch(2))).await;

        let replica = EntityRegistry::new();
        replica.replace_from(&snapshot).await;
        assert_eq!(replica.len().await, 2);
        assert_eq!(replica.list("application").await.len(), 1);
        assert_eq!(replica.version().await, source.version().await);

        replica.clear().await;
        assert!(replica.is_empty().await);
    }
}
