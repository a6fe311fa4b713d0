//! 核心编排层：错误、事件、路由状态机、监督者、评审门、会话驱动循环

pub mod error;
pub mod events;
pub mod orchestrator;
pub mod review;
pub mod router;
pub mod supervisor;

pub use error::OrchestratorError;
pub use events::{send_event, OrchestratorEvent};
pub use orchestrator::{Orchestrator, WorkerProfile};
pub use review::{ReviewGate, ReviewVerdict};
pub use router::{
    Router, RouterState, RoutingStrategy, SupervisorSignal, TransitionRecord, TurnOutput,
};
pub use supervisor::{
    parse_directive, Delegation, PlannedItem, Supervisor, SupervisorDirective,
};
