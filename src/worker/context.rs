//! 隔离上下文
//!
//! 传给工作者的上下文只含任务描述与显式播种的工件视图：没有监督者的
//! 消息历史，没有其他工作者的在途对话，没有路由内部状态。违反这条
//! 是整个系统最主要的正确性风险（重复劳动 + 上下文窗口耗尽）。

use crate::session::{Message, Transcript};

/// 工作者的起始上下文：全新誊本（仅任务描述）+ 显式播种的工件 key
#[derive(Clone, Debug)]
pub struct IsolatedContext {
    pub transcript: Transcript,
    /// 允许工作者通过 artifact_read 读取的 key
    pub seeded_artifacts: Vec<String>,
}

impl IsolatedContext {
    /// 以任务描述为唯一初始消息构造
    pub fn seeded(
        task_description: &str,
        seeded_artifacts: Vec<String>,
        max_turns: usize,
    ) -> Self {
        let mut transcript = Transcript::new(max_turns);
        transcript.push(Message::user(task_description.to_string()));
        Self {
            transcript,
            seeded_artifacts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Role;

    #[test]
    fn test_context_contains_only_task() {
        let ctx = IsolatedContext::seeded("summarize notes_1", vec!["notes_1".into()], 20);
        assert_eq!(ctx.transcript.len(), 1);
        assert_eq!(ctx.transcript.messages()[0].role, Role::User);
        assert_eq!(ctx.transcript.messages()[0].content, "summarize notes_1");
    }
}
