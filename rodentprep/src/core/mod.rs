//! Core domain model types for rodentprep.
//!
//! This module contains the fundamental types shared by every layer:
//! - Step lifecycle status
//! - Artifact descriptors and materialised artifact values
//! - Resource requests and run budgets

mod artifact;
mod resources;
mod status;

pub use artifact::{ArtifactDescriptor, ArtifactKind, ArtifactMap, ArtifactValue};
pub use resources::{Budget, ResourceRequest};
pub use status::StepStatus;
