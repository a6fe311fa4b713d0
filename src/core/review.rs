//! 评审门：独立实例化的工件评审
//!
//! 只读工件内容与静态质量标准，返回 accept / reject+feedback；
//! 严格评价性，从不修改工件，也不进入计划委派。可用与主模型不同的
//! 模型实例（避免自我认同）。

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::OrchestratorError;
use crate::llm::LlmClient;
use crate::session::Message;
use crate::store::Artifact;

/// 评审结论
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewVerdict {
    pub accepted: bool,
    #[serde(default)]
    pub feedback: Option<String>,
}

/// 评审门：持有独立 LLM 与 prompt 模板（占位符 {criteria} / {artifact}）
pub struct ReviewGate {
    llm: Arc<dyn LlmClient>,
    prompt_template: String,
}

impl ReviewGate {
    pub fn new(llm: Arc<dyn LlmClient>, prompt_template: impl Into<String>) -> Self {
        Self {
            llm,
            prompt_template: prompt_template.into(),
        }
    }

    /// 评审一个工件；输入只有工件内容与标准，不含任何会话历史
    pub async fn evaluate(
        &self,
        artifact: &Artifact,
        criteria: &[String],
    ) -> Result<ReviewVerdict, OrchestratorError> {
        let criteria_block = criteria
            .iter()
            .map(|c| format!("- {}", c))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = self
            .prompt_template
            .replace("{criteria}", &criteria_block)
            .replace("{artifact}", &artifact.content);

        let messages = vec![Message::user(prompt)];
        let response = self.llm.complete(&messages).await?;
        Ok(parse_verdict(&response))
    }
}

/// 解析评审输出：优先 JSON {"accepted": bool, "feedback": "..."}，
/// 否则按 ACCEPT/REJECT 前缀兜底；其余整体视为拒绝意见
fn parse_verdict(response: &str) -> ReviewVerdict {
    let trimmed = response.trim();

    if let Some(start) = trimmed.find('{') {
        if let Some(end) = trimmed.rfind('}') {
            if let Ok(v) = serde_json::from_str::<ReviewVerdict>(&trimmed[start..=end]) {
                return v;
            }
        }
    }

    let head: String = trimmed
        .chars()
        .take(6)
        .collect::<String>()
        .to_ascii_uppercase();
    if head.starts_with("ACCEPT") || head.starts_with("OK") {
        ReviewVerdict {
            accepted: true,
            feedback: None,
        }
    } else if head == "REJECT" {
        let rest: String = trimmed.chars().skip(6).collect();
        let feedback = rest.trim_start_matches([':', ' ']).to_string();
        ReviewVerdict {
            accepted: false,
            feedback: (!feedback.is_empty()).then_some(feedback),
        }
    } else {
        ReviewVerdict {
            accepted: false,
            feedback: Some(trimmed.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlmClient;

    fn artifact(content: &str) -> Artifact {
        Artifact {
            key: "draft_report".into(),
            content: content.into(),
            written_by: "writer".into(),
            version: 1,
            tombstone: false,
            written_at: 0,
        }
    }

    #[tokio::test]
    async fn test_json_verdict() {
        let gate = ReviewGate::new(
            Arc::new(ScriptedLlmClient::new(vec![
                r#"{"accepted": false, "feedback": "missing sources"}"#,
            ])),
            "{criteria}\n{artifact}",
        );
        let verdict = gate
            .evaluate(&artifact("draft"), &["has sources".into()])
            .await
            .unwrap();
        assert!(!verdict.accepted);
        assert_eq!(verdict.feedback.as_deref(), Some("missing sources"));
    }

    #[tokio::test]
    async fn test_accept_prefix_fallback() {
        let gate = ReviewGate::new(
            Arc::new(ScriptedLlmClient::new(vec!["ACCEPT"])),
            "{criteria}\n{artifact}",
        );
        let verdict = gate.evaluate(&artifact("fine"), &[]).await.unwrap();
        assert!(verdict.accepted);
    }

    #[test]
    fn test_free_text_is_rejection() {
        let v = parse_verdict("The draft lacks a conclusion section.");
        assert!(!v.accepted);
        assert!(v.feedback.unwrap().contains("conclusion"));
    }
}
