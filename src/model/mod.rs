//! Workflow data model: step identities, retry policies, branch rules,
//! and validated DAG definitions.

pub mod definition;
pub mod step;

pub use definition::{WorkflowBuilder, WorkflowDefinition, WorkflowError};
pub use step::{BranchRule, RetryPolicy, StepName};
