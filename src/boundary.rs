//! 对外边界 schema
//!
//! 入站请求、出站结果与恢复信号；与内部 SessionState 严格分离，一个结构
//! 绝不同时扮演「输入」与「运行时计数器」两种角色。构建编排器时校验这些
//! schema 不含任何保留的内部运行时字段名，冲突即致命 SchemaViolation。

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::core::OrchestratorError;

/// 入站请求
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct InboundRequest {
    pub session_id: String,
    pub principal_id: String,
    pub request_text: String,
}

/// 出站结果中的单个工件
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct ArtifactPayload {
    pub key: String,
    pub content: String,
}

/// 出站结果
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct OutboundResult {
    pub final_message: String,
    pub artifacts: Vec<ArtifactPayload>,
    pub plan_summary: String,
}

/// 人工审批决策
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ResumeDecision {
    Accept,
    Edit,
    Reject,
}

/// 恢复信号：针对某个挂起会话的待审批工具调用
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct ResumeSignal {
    pub session_id: String,
    pub decision: ResumeDecision,
    /// decision = edit 时替换原调用参数
    #[serde(default)]
    pub edited_arguments: Option<serde_json::Value>,
    /// decision = reject 时可附理由，作为观察喂回工作者
    #[serde(default)]
    pub feedback: Option<String>,
}

/// 一次会话驱动的结构化结果；调用方永远拿到其中之一，绝不是裸异常
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    /// 正常完成
    Completed(OutboundResult),
    /// 挂起等待人工审批
    Suspended {
        session_id: String,
        worker: String,
        tool: String,
        args: serde_json::Value,
    },
    /// 结构化失败：错误种类 + 最后已知计划 + 部分工件
    Failed {
        error_kind: String,
        error: String,
        plan_summary: String,
        artifacts: Vec<ArtifactPayload>,
    },
}

/// 路由/预算运行时保留的字段名；对外 schema 出现任何一个都是构建期致命错误
pub const RESERVED_RUNTIME_FIELDS: &[&str] = &[
    "step_counter",
    "router_state",
    "active_worker",
    "review_status",
    "review_attempts",
    "steps_used",
    "fail_count",
];

fn check_schema<T: JsonSchema>(type_name: &str) -> Result<(), OrchestratorError> {
    let schema = schemars::gen::SchemaGenerator::default().into_root_schema_for::<T>();
    if let Some(object) = schema.schema.object {
        for field in object.properties.keys() {
            if RESERVED_RUNTIME_FIELDS.contains(&field.as_str()) {
                return Err(OrchestratorError::SchemaViolation(format!(
                    "boundary type {} exposes reserved runtime field '{}'",
                    type_name, field
                )));
            }
        }
    }
    Ok(())
}

/// 构建期校验：所有边界类型都不得携带保留的运行时字段
pub fn validate_boundary_schemas() -> Result<(), OrchestratorError> {
    check_schema::<InboundRequest>("InboundRequest")?;
    check_schema::<OutboundResult>("OutboundResult")?;
    check_schema::<ResumeSignal>("ResumeSignal")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boundary_schemas_clean() {
        validate_boundary_schemas().unwrap();
    }

    #[test]
    fn test_reserved_field_detected() {
        // 故意冲突的边界类型必须被拒绝
        #[derive(Serialize, Deserialize, JsonSchema)]
        struct BadBoundary {
            session_id: String,
            step_counter: u64,
        }
        let err = check_schema::<BadBoundary>("BadBoundary").unwrap_err();
        assert_eq!(err.kind(), "schema_violation");
    }
}
