//! Control loop and reflection engine for the autonomous research agent.
//!
//! [`AgentRuntime::research`] drives one session through
//! plan → reason → act → observe → store → reflect until the goal
//! completes, the iteration budget runs out, or the run is cancelled.

pub mod bind;
pub mod plan;
pub mod reflection;
pub mod report;
mod runtime;

pub use bind::{bind_params, params_to_input};
pub use plan::{GENERAL_RESEARCH, create_plan, fallback_plan};
pub use reflection::{AgentReflection, AppliedReflection, ReflectTrigger, ReflectionEngine};
pub use report::{ExecutionReport, ResearchResult};
pub use runtime::AgentRuntime;
