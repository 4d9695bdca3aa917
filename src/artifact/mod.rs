// Artifact data model, naming convention and persisted catalog

pub mod catalog;
pub mod naming;
pub mod types;

pub use catalog::Catalog;
pub use naming::{artifact_prefix, validate_environment, wal_object_name, ArtifactName};
pub use types::*;
