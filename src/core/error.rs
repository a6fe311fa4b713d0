//! 编排错误类型
//!
//! 路由契约违规（MalformedHandoff 等）对当前会话轮次是致命的；预算类错误
//! （StepBudgetExceeded / RecursionBudgetExceeded）作为部分结果上报调用方，不做静默重试。

use thiserror::Error;

use crate::llm::LlmError;

/// 编排过程中可能出现的错误（路由、预算、工具、评审、持久化等）
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// 路由契约违规：缺少占位结果的委派、未知路由目标等
    #[error("Malformed handoff: {0}")]
    MalformedHandoff(String),

    /// 对未知 PlanItem 调用 update_status，属编程错误
    #[error("Unknown plan item: {0}")]
    UnknownPlanItem(String),

    /// 单个工作者循环耗尽步数预算（墙钟超时按同一错误处理）
    #[error("Step budget exceeded ({budget} steps)")]
    StepBudgetExceeded { budget: usize },

    /// 会话级路由步数耗尽
    #[error("Recursion budget exceeded ({max_steps} total steps)")]
    RecursionBudgetExceeded { max_steps: u64 },

    /// 同一工具连续相同失败达到上限，工作者终止
    #[error("Tool '{tool}' failed repeatedly: {reason}")]
    ToolRepeatedFailure { tool: String, reason: String },

    /// 评审门拒绝且重试次数耗尽
    #[error("Review rejected: {feedback}")]
    ReviewRejected { feedback: String },

    /// 调用方在路由边界取消会话
    #[error("Cancelled")]
    Cancelled,

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),

    #[error("Tool timeout: {0}")]
    ToolTimeout(String),

    #[error("JSON parse error: {0}")]
    JsonParse(String),

    /// 对外 schema 含保留的内部运行时字段（构建期校验）
    #[error("Boundary schema violation: {0}")]
    SchemaViolation(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Config error: {0}")]
    ConfigError(String),
}

impl OrchestratorError {
    /// 稳定的错误种类标识，随结构化失败结果返回给调用方
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MalformedHandoff(_) => "malformed_handoff",
            Self::UnknownPlanItem(_) => "unknown_plan_item",
            Self::StepBudgetExceeded { .. } => "step_budget_exceeded",
            Self::RecursionBudgetExceeded { .. } => "recursion_budget_exceeded",
            Self::ToolRepeatedFailure { .. } => "tool_repeated_failure",
            Self::ReviewRejected { .. } => "review_rejected",
            Self::Cancelled => "cancelled",
            Self::Llm(_) => "llm_error",
            Self::ToolExecutionFailed(_) => "tool_execution_failed",
            Self::ToolTimeout(_) => "tool_timeout",
            Self::JsonParse(_) => "json_parse_error",
            Self::SchemaViolation(_) => "schema_violation",
            Self::Persistence(_) => "persistence_error",
            Self::ConfigError(_) => "config_error",
        }
    }

    /// 是否对当前会话轮次致命（路由自身的错误永远致命，§7 传播策略）
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::MalformedHandoff(_)
                | Self::UnknownPlanItem(_)
                | Self::RecursionBudgetExceeded { .. }
                | Self::SchemaViolation(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_is_stable() {
        let err = OrchestratorError::MalformedHandoff("no placeholder".into());
        assert_eq!(err.kind(), "malformed_handoff");
        assert!(err.is_fatal());
    }

    #[test]
    fn test_budget_errors_not_fatal() {
        let err = OrchestratorError::StepBudgetExceeded { budget: 25 };
        assert_eq!(err.kind(), "step_budget_exceeded");
        assert!(!err.is_fatal());
    }
}
