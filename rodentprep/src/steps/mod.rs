//! Steps: the units of work in a workflow.
//!
//! A step is a declarative node: named inputs, named outputs, a resource
//! request and an opaque [`StepAction`]. Its [`Fingerprint`] identifies its
//! cacheable result.

mod action;
mod fingerprint;
mod spec;

pub use action::{ActionContext, FnAction, StepAction};
pub use fingerprint::{fingerprint_graph, step_fingerprint, Fingerprint, HashMethod};
pub use spec::{InputSource, Step, StepInput};
