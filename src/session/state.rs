//! 会话状态
//!
//! 内部执行状态 schema，与对外边界 schema（boundary 模块）严格分离：
//! step_counter、router_state 等运行时字段只存在于这里，绝不出现在
//! 入站/出站结构中。每次路由转移后整体检查点。

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::core::RouterState;
use crate::plan::Plan;
use crate::session::Transcript;
use crate::store::Artifact;
use crate::worker::SuspendedWorker;

/// 评审状态
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ReviewStatus {
    None,
    Pending,
    Accepted,
    Rejected { feedback: String },
}

/// 单会话的完整内部状态
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: String,
    pub principal_id: String,
    /// 仅监督者可见的消息历史
    pub messages: Transcript,
    pub plan: Plan,
    /// 工件存储的存活头版本快照
    pub artifacts: Vec<Artifact>,
    /// 挂起等待人工审批的在途工作者
    pub active_worker: Option<SuspendedWorker>,
    pub review_status: ReviewStatus,
    /// 每个计划条目的评审拒绝次数（重试上限在编排器里强制）
    pub review_attempts: HashMap<String, usize>,
    /// 路由步数计数器（内部运行时字段）
    pub step_counter: u64,
    /// 检查点时刻的路由状态
    pub router_state: RouterState,
    pub updated_at: i64,
}

impl SessionState {
    /// 为新会话创建初始状态
    pub fn fresh(session_id: &str, principal_id: &str, max_turns: usize) -> Self {
        Self {
            session_id: session_id.to_string(),
            principal_id: principal_id.to_string(),
            messages: Transcript::new(max_turns),
            plan: Plan::default(),
            artifacts: Vec::new(),
            active_worker: None,
            review_status: ReviewStatus::None,
            review_attempts: HashMap::new(),
            step_counter: 0,
            router_state: RouterState::Supervisor,
            updated_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_serde_round_trip() {
        let state = SessionState::fresh("s1", "alice", 20);
        let json = serde_json::to_string(&state).unwrap();
        let back: SessionState = serde_json::from_str(&json).unwrap();
        assert_eq!(back.session_id, "s1");
        assert_eq!(back.review_status, ReviewStatus::None);
        assert_eq!(back.router_state, RouterState::Supervisor);
    }
}
