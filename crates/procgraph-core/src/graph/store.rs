use async_trait::async_trait;

use super::entities::{RelationKind, Vertex, VertexKey, VertexProperties};
use crate::error::GraphStoreError;

/// Idempotent, key-addressed graph persistence.
///
/// Every call is atomic on its own; there are no cross-call transactions, so
/// callers must be safe to re-run after a partial failure.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Return the vertex stored under `key`, creating it with `properties` when absent.
    /// An existing vertex is returned unchanged.
    async fn get_or_create(
        &self,
        key: &VertexKey,
        properties: VertexProperties,
    ) -> Result<Vertex, GraphStoreError>;

    /// Persist the current properties of a vertex previously returned by `get_or_create`
    async fn save(&self, vertex: &Vertex) -> Result<(), GraphStoreError>;

    /// Create `from -[kind]-> to` unless it already exists
    async fn add_relationship(
        &self,
        from: &VertexKey,
        to: &VertexKey,
        kind: RelationKind,
    ) -> Result<(), GraphStoreError>;
}

/// In-memory store for tests and embedded use
#[cfg(feature = "testing")]
pub mod memory {
    use super::*;
    use crate::graph::entities::{Relationship, VertexKind};
    use chrono::Utc;
    use std::collections::{BTreeSet, HashMap};
    use std::sync::Arc;
    use tokio::sync::RwLock;

    #[derive(Debug, Clone, Default)]
    pub struct InMemoryGraphStore {
        vertices: Arc<RwLock<HashMap<VertexKey, Vertex>>>,
        relationships: Arc<RwLock<BTreeSet<Relationship>>>,
    }

    impl InMemoryGraphStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub async fn vertex_count(&self) -> usize {
            self.vertices.read().await.len()
        }

        pub async fn relationship_count(&self) -> usize {
            self.relationships.read().await.len()
        }

        pub async fn find(&self, key: &VertexKey) -> Option<Vertex> {
            self.vertices.read().await.get(key).cloned()
        }

        pub async fn vertices_of_kind(&self, kind: VertexKind) -> Vec<Vertex> {
            let mut vertices: Vec<Vertex> = self
                .vertices
                .read()
                .await
                .values()
                .filter(|v| v.key.kind == kind)
                .cloned()
                .collect();
            vertices.sort_by(|a, b| a.key.cmp(&b.key));
            vertices
        }

        pub async fn relationships_of_kind(&self, kind: RelationKind) -> Vec<Relationship> {
            self.relationships
                .read()
                .await
                .iter()
                .filter(|r| r.kind == kind)
                .cloned()
                .collect()
        }

        pub async fn relationships(&self) -> Vec<Relationship> {
            self.relationships.read().await.iter().cloned().collect()
        }
    }

    #[async_trait]
    impl GraphStore for InMemoryGraphStore {
        async fn get_or_create(
            &self,
            key: &VertexKey,
            properties: VertexProperties,
        ) -> Result<Vertex, GraphStoreError> {
            let mut vertices = self.vertices.write().await;
            let vertex = vertices
                .entry(key.clone())
                .or_insert_with(|| Vertex::new(key.clone(), properties));
            Ok(vertex.clone())
        }

        async fn save(&self, vertex: &Vertex) -> Result<(), GraphStoreError> {
            let mut vertices = self.vertices.write().await;
            match vertices.get_mut(&vertex.key) {
                Some(stored) => {
                    stored.properties = vertex.properties.clone();
                    stored.updated_at = Utc::now();
                    Ok(())
                }
                None => Err(GraphStoreError::MissingVertex(vertex.key.to_string())),
            }
        }

        async fn add_relationship(
            &self,
            from: &VertexKey,
            to: &VertexKey,
            kind: RelationKind,
        ) -> Result<(), GraphStoreError> {
            {
                let vertices = self.vertices.read().await;
                for key in [from, to] {
                    if !vertices.contains_key(key) {
                        return Err(GraphStoreError::MissingVertex(key.to_string()));
                    }
                }
            }
            self.relationships.write().await.insert(Relationship {
                from: from.clone(),
                kind,
                to: to.clone(),
            });
            Ok(())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use serde_json::json;

        fn props(name: &str) -> VertexProperties {
            let mut properties = VertexProperties::new();
            properties.insert("name".to_string(), json!(name));
            properties
        }

        #[tokio::test]
        async fn test_get_or_create_is_idempotent() {
            let store = InMemoryGraphStore::new();
            let key = VertexKey::new(VertexKind::Client, "acme");

            let first = store.get_or_create(&key, props("first")).await.unwrap();
            let second = store.get_or_create(&key, props("second")).await.unwrap();

            assert_eq!(first.graph_id, second.graph_id);
            assert_eq!(second.property_str("name"), Some("first"));
            assert_eq!(store.vertex_count().await, 1);
        }

        #[tokio::test]
        async fn test_save_overwrites_properties() {
            let store = InMemoryGraphStore::new();
            let key = VertexKey::new(VertexKind::Process, "p");
            let mut vertex = store.get_or_create(&key, props("old")).await.unwrap();

            vertex.properties.insert("name".to_string(), json!("new"));
            store.save(&vertex).await.unwrap();

            let stored = store.find(&key).await.unwrap();
            assert_eq!(stored.property_str("name"), Some("new"));
        }

        #[tokio::test]
        async fn test_save_unknown_vertex_fails() {
            let store = InMemoryGraphStore::new();
            let vertex = Vertex::new(VertexKey::new(VertexKind::Root, "r"), props("r"));
            assert!(matches!(
                store.save(&vertex).await,
                Err(GraphStoreError::MissingVertex(_))
            ));
        }

        #[tokio::test]
        async fn test_add_relationship_is_idempotent_and_checks_endpoints() {
            let store = InMemoryGraphStore::new();
            let a = VertexKey::new(VertexKind::FlowNode, "a");
            let b = VertexKey::new(VertexKind::FlowNode, "b");
            store.get_or_create(&a, props("a")).await.unwrap();

            assert!(store
                .add_relationship(&a, &b, RelationKind::FollowedBy)
                .await
                .is_err());

            store.get_or_create(&b, props("b")).await.unwrap();
            store.add_relationship(&a, &b, RelationKind::FollowedBy).await.unwrap();
            store.add_relationship(&a, &b, RelationKind::FollowedBy).await.unwrap();

            assert_eq!(store.relationship_count().await, 1);
            assert_eq!(
                store.relationships_of_kind(RelationKind::FollowedBy).await[0].to,
                b
            );
        }
    }
}
