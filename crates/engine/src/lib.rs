//! TestForge Engine
//!
//! Test composition and execution orchestration: step definition registry,
//! composition store, execution state machine, step executors, and the
//! dispatcher that drives submitted executions through a worker pool.

pub mod access;
pub mod dispatcher;
pub mod executor;
pub mod machine;
pub mod registry;
pub mod store;

pub use access::{AccessControl, PolicyEngine, Scope};
pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use executor::{ExecutorRegistry, HttpStepExecutor, SimulatedStepExecutor, StepExecutor};
pub use machine::{derive_status, ExecutionMachine};
pub use registry::{validate_parameters, StepRegistry, PREDEFINED_STEPS};
pub use store::CompositionStore;
