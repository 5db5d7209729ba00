//! The rodent MRI preprocessing workflow.
//!
//! Discovers a BIDS dataset and assembles the per-participant step graph.
//! Each processing step runs a tool from the configuration file, or a copy
//! placeholder when no tool is configured for its kind.

mod actions;
mod bids;
mod rodent;

pub use actions::{BidsValidateAction, CommandAction, CopyAction, DerivativesAction};
pub use bids::{normalize_label, BidsDataset, BoldRun, Subject};
pub use rodent::{build_workflow, WorkflowOptions, ANAT_TAG, DEFAULT_TEMPLATE};
