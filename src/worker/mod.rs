//! 工作者层：隔离上下文与受预算约束的执行循环

pub mod context;
pub mod runtime;

pub use context::IsolatedContext;
pub use runtime::{DelegationRequest, SuspendedWorker, WorkerOutcome, WorkerRun, WorkerRuntime};
