//! 存储层：会话内共享的版本化工件存储

pub mod artifact;

pub use artifact::{Artifact, ArtifactStore, InMemoryArtifactStore};
