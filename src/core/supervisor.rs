//! 监督者：规划、委派与汇总
//!
//! 持有自己的 LLM 句柄、system prompt 与私有誊本；模型输出解析为封闭的
//! SupervisorDirective（JSON，支持 ```json 围栏）；不含 JSON 对象的输出视为
//! Finish。委派时把合成的占位结果写入自身誊本，保证誊本自洽。

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::OrchestratorError;
use crate::llm::LlmClient;
use crate::session::{Message, Transcript};

/// Plan 指令中的单个条目；id 省略时由追踪器生成
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedItem {
    #[serde(default)]
    pub id: Option<String>,
    pub description: String,
}

/// 一次委派的全部参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delegation {
    pub item_id: String,
    pub worker: String,
    pub task: String,
    /// 工作者最终产出写入的工件 key；每个在途委派唯一
    pub output_key: String,
    /// 合成的占位结果，写入监督者自身誊本（deterministic 模式必填）
    #[serde(default)]
    pub placeholder: Option<String>,
    /// 限制该工作者可用的工具名；None 时用该工作者档案的默认集合
    #[serde(default)]
    pub tools: Option<Vec<String>>,
    /// 播种给工作者的工件 key（显式只读视图）
    #[serde(default)]
    pub seed_artifacts: Vec<String>,
}

/// 监督者的结构化意图（封闭枚举，由路由器消费，不做自由字符串匹配）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SupervisorDirective {
    /// 记录计划；纯簿记，不触发执行
    Plan { items: Vec<PlannedItem> },
    /// 委派单个条目
    Delegate(Delegation),
    /// scatter-gather：并发委派多个无数据依赖的条目
    DelegateParallel { delegations: Vec<Delegation> },
    /// 请求评审门评审某个工件
    Review {
        artifact_key: String,
        #[serde(default)]
        criteria: Vec<String>,
    },
    /// 写入主体级长期事实
    Remember { fact: String },
    /// 结束会话，返回最终回复
    Finish { message: String },
}

/// 解析监督者输出：提取 JSON（```json 围栏或首个 { 到末个 }），解析为指令；
/// 无 JSON 对象时整体视为 Finish
pub fn parse_directive(output: &str) -> Result<SupervisorDirective, OrchestratorError> {
    let trimmed = output.trim();

    let json_str = if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        rest.find("```")
            .map(|end| rest[..end].trim())
            .unwrap_or(rest.trim())
    } else if let Some(start) = trimmed.find('{') {
        if let Some(end) = trimmed.rfind('}') {
            &trimmed[start..=end]
        } else {
            trimmed
        }
    } else {
        return Ok(SupervisorDirective::Finish {
            message: trimmed.to_string(),
        });
    };

    serde_json::from_str(json_str)
        .map_err(|e| OrchestratorError::JsonParse(format!("{}: {}", e, json_str)))
}

/// 监督者：私有誊本 + system prompt，每回合拼 计划摘要/工件清单 后调用模型
pub struct Supervisor {
    llm: Arc<dyn LlmClient>,
    system_prompt: String,
    transcript: Transcript,
}

impl Supervisor {
    pub fn new(llm: Arc<dyn LlmClient>, system_prompt: impl Into<String>, max_turns: usize) -> Self {
        Self {
            llm,
            system_prompt: system_prompt.into(),
            transcript: Transcript::new(max_turns),
        }
    }

    /// 从检查点恢复誊本
    pub fn restore(
        llm: Arc<dyn LlmClient>,
        system_prompt: impl Into<String>,
        transcript: Transcript,
    ) -> Self {
        Self {
            llm,
            system_prompt: system_prompt.into(),
            transcript,
        }
    }

    /// 首轮播种：用户请求 + 只读合并的长期事实
    pub fn seed(&mut self, request_text: &str, long_term_facts: &[String]) {
        if !long_term_facts.is_empty() {
            self.transcript.push(Message::system(format!(
                "Known facts about this principal:\n{}",
                long_term_facts.join("\n")
            )));
        }
        self.transcript.push(Message::user(request_text.to_string()));
    }

    /// 向誊本注入一条观察（工件引用、评审结论等，永远只带 key 不带负载）
    pub fn observe(&mut self, observation: impl Into<String>) {
        self.transcript.push(Message::user(observation.into()));
    }

    /// 委派后写入占位结果，保持誊本自洽（实际工作尚未发生）
    pub fn push_placeholder(&mut self, placeholder: impl Into<String>) {
        self.transcript.push(Message::assistant(placeholder.into()));
    }

    /// 非委派指令直接把原始输出入誊本
    pub fn push_raw(&mut self, raw: impl Into<String>) {
        self.transcript.push(Message::assistant(raw.into()));
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    /// 执行一轮监督者推理，返回模型原始输出；誊本写入由调用方按指令类型决定
    pub async fn turn(
        &self,
        plan_summary: &str,
        artifact_keys: &[String],
    ) -> Result<String, OrchestratorError> {
        let mut system = self.system_prompt.clone();
        if !plan_summary.is_empty() {
            system.push_str(&format!("\n\n## Current Plan\n{}\n", plan_summary));
        }
        if !artifact_keys.is_empty() {
            system.push_str(&format!(
                "\n## Available Artifacts\n{}\n",
                artifact_keys.join("\n")
            ));
        }

        let mut messages = vec![Message::system(system)];
        messages.extend(self.transcript.messages().to_vec());
        Ok(self.llm.complete(&messages).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plan_directive() {
        let out = r#"{"action": "plan", "items": [{"description": "research"}, {"id": "t2", "description": "draft"}]}"#;
        match parse_directive(out).unwrap() {
            SupervisorDirective::Plan { items } => {
                assert_eq!(items.len(), 2);
                assert_eq!(items[1].id.as_deref(), Some("t2"));
            }
            other => panic!("unexpected directive: {:?}", other),
        }
    }

    #[test]
    fn test_parse_delegate_with_fence() {
        let out = "Delegating now.\n```json\n{\"action\": \"delegate\", \"item_id\": \"t1\", \"worker\": \"research\", \"task\": \"find sources\", \"output_key\": \"notes_1\", \"placeholder\": \"(research underway)\"}\n```";
        match parse_directive(out).unwrap() {
            SupervisorDirective::Delegate(d) => {
                assert_eq!(d.worker, "research");
                assert_eq!(d.output_key, "notes_1");
                assert!(d.placeholder.is_some());
            }
            other => panic!("unexpected directive: {:?}", other),
        }
    }

    #[test]
    fn test_plain_text_is_finish() {
        match parse_directive("All done, here is the answer.").unwrap() {
            SupervisorDirective::Finish { message } => {
                assert_eq!(message, "All done, here is the answer.");
            }
            other => panic!("unexpected directive: {:?}", other),
        }
    }

    #[test]
    fn test_malformed_json_is_parse_error() {
        let err = parse_directive(r#"{"action": "delegate", "worker": }"#).unwrap_err();
        assert_eq!(err.kind(), "json_parse_error");
    }
}
