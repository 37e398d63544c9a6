//! Execution engine: the capability registry, step executor, and the
//! coordinator that drives runs through their workflows.

pub mod context;
pub mod coordinator;
pub mod executor;
pub mod registry;

pub use context::{ContextError, ExecutionContext};
pub use coordinator::{Coordinator, CoordinatorError};
pub use executor::{ExecutorError, StepExecutor, StepOutcome, StepStatus};
pub use registry::{Capability, CapabilityError, RegistryError, StepRegistry};
