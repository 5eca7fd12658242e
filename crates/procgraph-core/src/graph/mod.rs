//! Persisted running/archive graphs and the builder that produces them.

pub mod builder;
pub mod entities;
pub mod store;

pub use builder::{GraphBuilder, ProcessRoots, ROOT_KEY};
pub use entities::{RelationKind, Relationship, Vertex, VertexKey, VertexKind, VertexProperties};
#[cfg(feature = "testing")]
pub use store::memory;
pub use store::GraphStore;
