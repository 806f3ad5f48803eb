pub mod executor;
pub mod guard;
pub mod task;

pub use executor::{
    EmailTransport, ExecutionLog, Executor, ExecutorStats, HandlerError, ModelGateway,
};
pub use guard::{GuardDecision, SecurityGuard};
pub use task::{Task, TaskQueue, TaskStatus, TaskType};
