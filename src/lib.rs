//! Hive - Rust 多智能体任务编排核心
//!
//! 模块划分：
//! - **agent**: 无头编排运行时（供 CLI / HTTP 等调用）
//! - **boundary**: 对外请求/响应 schema 与保留字段校验
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 路由状态机、监督者、评审门、会话驱动循环
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock / 重试包装）
//! - **plan**: 计划追踪（PlanItem 状态簿记，不触发执行）
//! - **session**: 会话状态管理与检查点、主体级长期事实
//! - **store**: 共享工件存储（版本化、仅追加）
//! - **tools**: 工具箱（注册表、执行器、内置工具）与审批标记
//! - **worker**: 隔离工作者运行时（步数预算 + 墙钟超时）

pub mod agent;
pub mod boundary;
pub mod config;
pub mod core;
pub mod llm;
pub mod observability;
pub mod plan;
pub mod session;
pub mod store;
pub mod tools;
pub mod worker;

pub use agent::Hive;
pub use boundary::{InboundRequest, OutboundResult, ResumeSignal, RunOutcome};
