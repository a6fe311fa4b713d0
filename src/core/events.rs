//! 编排过程事件：用于流式展示路由转移、委派、工具调用与评审结论

use serde::Serialize;

/// 单步过程事件（可序列化为 JSON 供前端展示）；传输方式由部署方决定
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    /// 路由转移（step 单调递增）
    RouteTransition {
        step: u64,
        from: String,
        to: String,
    },
    /// 监督者正在调用模型
    SupervisorThinking,
    /// 计划已记录
    PlanRecorded { item_count: usize },
    /// 委派给工作者
    Delegated {
        worker: String,
        item_id: String,
        output_key: String,
    },
    /// 工作者循环步数更新
    WorkerStep {
        worker: String,
        step: usize,
        max_steps: usize,
    },
    /// 工作者调用工具
    ToolCall { worker: String, tool: String },
    /// 工具返回（预览，避免过长）
    Observation {
        worker: String,
        tool: String,
        preview: String,
    },
    /// 工作者挂起等待人工审批
    Suspended { worker: String, tool: String },
    /// 评审结论
    ReviewVerdict {
        artifact_key: String,
        accepted: bool,
        feedback: Option<String>,
    },
    /// 会话结束，最终回复预览
    Completed { preview: String },
    /// 错误
    Error { text: String },
}

/// Observation / Completed 预览最大字符数
pub const PREVIEW_CHARS: usize = 200;

/// 截断预览，超长加省略号
pub fn preview(text: &str) -> String {
    let p: String = text.chars().take(PREVIEW_CHARS).collect();
    if text.chars().count() > PREVIEW_CHARS {
        format!("{}...", p)
    } else {
        p
    }
}

/// 事件发送（无接收端时静默丢弃）
pub fn send_event(
    tx: &Option<tokio::sync::mpsc::UnboundedSender<OrchestratorEvent>>,
    ev: OrchestratorEvent,
) {
    if let Some(t) = tx {
        let _ = t.send(ev);
    }
}
