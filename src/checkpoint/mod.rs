//! Checkpoints: the version registry and the parameter artifacts it points at.

pub mod artifact;
pub mod registry;

pub use artifact::ParameterArtifact;
pub use registry::{version_key, Checkpoints};
