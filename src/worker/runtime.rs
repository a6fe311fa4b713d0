//! 工作者运行时
//!
//! 执行一段隔离的 模型调用⇄工具调用 循环：步数预算（默认 25）与墙钟超时
//! 都是构造参数而非事后补丁，墙钟超时按 StepBudgetExceeded 处理。
//! 工具失败先以观察形式喂回模型（循环内自愈）；同一工具连续相同失败达到
//! 上限则以 ToolRepeatedFailure 终止，由路由器按委派失败处理。
//! 需要审批的工具调用令循环挂起，完整在途状态交会话管理器持久化。

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::boundary::ResumeDecision;
use crate::core::events::{preview, send_event, OrchestratorEvent};
use crate::core::OrchestratorError;
use crate::llm::LlmClient;
use crate::session::{Message, Transcript};
use crate::store::ArtifactStore;
use crate::tools::ToolExecutor;
use crate::worker::IsolatedContext;

/// 委派请求：只由监督者回合构造，由路由器消费恰好一次，从不持久化
#[derive(Clone, Debug)]
pub struct DelegationRequest {
    pub worker_name: String,
    pub task_description: String,
    /// 空表示使用执行器的全部工具
    pub allowed_tools: Vec<String>,
    pub output_artifact_key: String,
    /// 播种给工作者的只读工件 key
    pub seed_artifacts: Vec<String>,
}

/// 工作者正常完成的产出
#[derive(Clone, Debug)]
pub struct WorkerOutcome {
    pub result_message: String,
    pub artifacts_written: Vec<String>,
    pub steps_used: usize,
}

/// 挂起的在途工作者状态；经 SessionState.active_worker 持久化，
/// 由显式 ResumeSignal 恢复
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SuspendedWorker {
    pub worker_name: String,
    pub task_description: String,
    pub allowed_tools: Vec<String>,
    pub output_artifact_key: String,
    pub seeded_artifacts: Vec<String>,
    /// 所属计划条目，恢复后由编排器继续簿记
    pub item_id: Option<String>,
    pub transcript: Transcript,
    /// 等待审批的工具调用
    pub pending_tool: String,
    pub pending_args: Value,
    pub steps_used: usize,
    fail_tool: Option<String>,
    fail_args: String,
    fail_count: usize,
}

/// 一次 run / resume 的结果
#[derive(Debug)]
pub enum WorkerRun {
    Done(WorkerOutcome),
    Suspended(SuspendedWorker),
}

/// 工作者模型输出的结构化解析结果
enum WorkerStep {
    ToolCall { tool: String, args: Value },
    Final(String),
}

/// 解析工作者输出：含 {"tool": ..., "args": ...} JSON 则为工具调用，否则为最终回答
fn parse_worker_output(output: &str) -> Result<WorkerStep, OrchestratorError> {
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
        return Ok(WorkerStep::Final(trimmed.to_string()));
    };

    #[derive(Deserialize)]
    struct RawCall {
        tool: String,
        #[serde(default)]
        args: Value,
    }

    let parsed: RawCall = serde_json::from_str(json_str)
        .map_err(|e| OrchestratorError::JsonParse(format!("{}: {}", e, json_str)))?;

    if parsed.tool.is_empty() {
        Ok(WorkerStep::Final(trimmed.to_string()))
    } else {
        Ok(WorkerStep::ToolCall {
            tool: parsed.tool,
            args: parsed.args,
        })
    }
}

/// 循环内部状态（run 与 resume 共用）
struct LoopState {
    worker_name: String,
    task_description: String,
    allowed_tools: Vec<String>,
    output_key: String,
    seeded_artifacts: Vec<String>,
    transcript: Transcript,
    steps_used: usize,
    fail_tool: Option<String>,
    fail_args: String,
    fail_count: usize,
    json_repair_used: bool,
}

impl LoopState {
    fn from_context(ctx: IsolatedContext, req: &DelegationRequest) -> Self {
        Self {
            worker_name: req.worker_name.clone(),
            task_description: req.task_description.clone(),
            allowed_tools: req.allowed_tools.clone(),
            output_key: req.output_artifact_key.clone(),
            seeded_artifacts: ctx.seeded_artifacts,
            transcript: ctx.transcript,
            steps_used: 0,
            fail_tool: None,
            fail_args: String::new(),
            fail_count: 0,
            json_repair_used: false,
        }
    }

    fn from_suspended(s: SuspendedWorker) -> Self {
        Self {
            worker_name: s.worker_name,
            task_description: s.task_description,
            allowed_tools: s.allowed_tools,
            output_key: s.output_artifact_key,
            seeded_artifacts: s.seeded_artifacts,
            transcript: s.transcript,
            steps_used: s.steps_used,
            fail_tool: s.fail_tool,
            fail_args: s.fail_args,
            fail_count: s.fail_count,
            json_repair_used: false,
        }
    }

    fn suspend(&self, tool: String, args: Value) -> SuspendedWorker {
        SuspendedWorker {
            worker_name: self.worker_name.clone(),
            task_description: self.task_description.clone(),
            allowed_tools: self.allowed_tools.clone(),
            output_artifact_key: self.output_key.clone(),
            seeded_artifacts: self.seeded_artifacts.clone(),
            item_id: None,
            transcript: self.transcript.clone(),
            pending_tool: tool,
            pending_args: args,
            steps_used: self.steps_used,
            fail_tool: self.fail_tool.clone(),
            fail_args: self.fail_args.clone(),
            fail_count: self.fail_count,
        }
    }
}

/// 工作者运行时：每次委派实例化一份，步数预算与超时由构造参数给定
pub struct WorkerRuntime {
    llm: Arc<dyn LlmClient>,
    step_budget: usize,
    wall_clock: Duration,
    tool_failure_limit: usize,
    /// 配置层面额外标记需审批的工具名（与 Tool::requires_approval 并集）
    approval_required: Vec<String>,
    cancel: CancellationToken,
    events: Option<UnboundedSender<OrchestratorEvent>>,
}

impl WorkerRuntime {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        step_budget: usize,
        wall_clock: Duration,
        tool_failure_limit: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            llm,
            step_budget,
            wall_clock,
            tool_failure_limit,
            approval_required: Vec::new(),
            cancel,
            events: None,
        }
    }

    pub fn with_approval_required(mut self, tools: Vec<String>) -> Self {
        self.approval_required = tools;
        self
    }

    pub fn with_events(mut self, tx: UnboundedSender<OrchestratorEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// 从头执行一次委派
    pub async fn run(
        &self,
        executor: &ToolExecutor,
        system_prompt: &str,
        ctx: IsolatedContext,
        req: &DelegationRequest,
        store: &Arc<dyn ArtifactStore>,
    ) -> Result<WorkerRun, OrchestratorError> {
        let mut state = LoopState::from_context(ctx, req);
        self.bounded_drive(executor, system_prompt, &mut state, store, None)
            .await
    }

    /// 从挂起状态恢复：先按决策处理待审批调用，再继续循环。
    /// feedback 仅在 reject 时使用，作为观察喂回工作者。
    pub async fn resume(
        &self,
        executor: &ToolExecutor,
        system_prompt: &str,
        suspended: SuspendedWorker,
        decision: ResumeDecision,
        feedback: Option<String>,
        store: &Arc<dyn ArtifactStore>,
    ) -> Result<WorkerRun, OrchestratorError> {
        let pending_tool = suspended.pending_tool.clone();
        let pending_args = suspended.pending_args.clone();
        let mut state = LoopState::from_suspended(suspended);
        self.bounded_drive(
            executor,
            system_prompt,
            &mut state,
            store,
            Some((pending_tool, pending_args, decision, feedback)),
        )
        .await
    }

    /// 墙钟超时独立于步数预算，超时按 StepBudgetExceeded 处理
    async fn bounded_drive(
        &self,
        executor: &ToolExecutor,
        system_prompt: &str,
        state: &mut LoopState,
        store: &Arc<dyn ArtifactStore>,
        resume: Option<(String, Value, ResumeDecision, Option<String>)>,
    ) -> Result<WorkerRun, OrchestratorError> {
        match timeout(
            self.wall_clock,
            self.drive(executor, system_prompt, state, store, resume),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(OrchestratorError::StepBudgetExceeded {
                budget: self.step_budget,
            }),
        }
    }

    fn needs_approval(&self, executor: &ToolExecutor, tool: &str) -> bool {
        executor.requires_approval(tool) || self.approval_required.iter().any(|t| t == tool)
    }

    fn system_for(&self, executor: &ToolExecutor, state: &LoopState, base: &str) -> String {
        let tools: Vec<String> = executor
            .tool_descriptions()
            .into_iter()
            .filter(|(name, _)| {
                state.allowed_tools.is_empty() || state.allowed_tools.iter().any(|t| t == name)
            })
            .map(|(name, desc)| format!("- {}: {}", name, desc))
            .collect();
        format!(
            "{}\n\n## Available tools\n{}\n\nTo call a tool, output exactly one JSON object: \
             {{\"tool\": \"name\", \"args\": {{...}}}}. \
             When the task is complete, output your final answer as plain text with no JSON.",
            base,
            tools.join("\n")
        )
    }

    async fn drive(
        &self,
        executor: &ToolExecutor,
        system_prompt: &str,
        state: &mut LoopState,
        store: &Arc<dyn ArtifactStore>,
        resume: Option<(String, Value, ResumeDecision, Option<String>)>,
    ) -> Result<WorkerRun, OrchestratorError> {
        // 恢复路径：先消化待审批的调用
        if let Some((tool, args, decision, feedback)) = resume {
            match decision {
                ResumeDecision::Accept => {
                    self.invoke_tool(executor, state, &tool, args).await?;
                }
                ResumeDecision::Edit => {
                    // edited_arguments 已由编排器替换进 args
                    self.invoke_tool(executor, state, &tool, args).await?;
                }
                ResumeDecision::Reject => {
                    let reason = feedback.unwrap_or_default();
                    state.transcript.push(Message::user(format!(
                        "Observation from {}: Error: tool call rejected by user{}",
                        tool,
                        if reason.is_empty() {
                            String::new()
                        } else {
                            format!(" ({})", reason)
                        }
                    )));
                }
            }
        }

        loop {
            if self.cancel.is_cancelled() {
                return Err(OrchestratorError::Cancelled);
            }
            if state.steps_used >= self.step_budget {
                return Err(OrchestratorError::StepBudgetExceeded {
                    budget: self.step_budget,
                });
            }
            send_event(
                &self.events,
                OrchestratorEvent::WorkerStep {
                    worker: state.worker_name.clone(),
                    step: state.steps_used,
                    max_steps: self.step_budget,
                },
            );

            let mut messages = vec![Message::system(self.system_for(executor, state, system_prompt))];
            messages.extend(state.transcript.messages().to_vec());
            let output = self.llm.complete(&messages).await?;
            state.steps_used += 1;

            match parse_worker_output(&output) {
                Ok(WorkerStep::Final(text)) => {
                    // 最终回答写入约定的输出工件；监督者只收到 key 引用
                    store.write(&state.output_key, &text, &state.worker_name);
                    return Ok(WorkerRun::Done(WorkerOutcome {
                        result_message: text,
                        artifacts_written: vec![state.output_key.clone()],
                        steps_used: state.steps_used,
                    }));
                }
                Ok(WorkerStep::ToolCall { tool, args }) => {
                    state.transcript.push(Message::assistant(output.clone()));
                    send_event(
                        &self.events,
                        OrchestratorEvent::ToolCall {
                            worker: state.worker_name.clone(),
                            tool: tool.clone(),
                        },
                    );

                    let allowed = state.allowed_tools.is_empty()
                        || state.allowed_tools.iter().any(|t| t == &tool);
                    if !allowed {
                        let names = if state.allowed_tools.is_empty() {
                            executor.tool_names()
                        } else {
                            state.allowed_tools.clone()
                        };
                        self.record_failure(
                            state,
                            &tool,
                            &args,
                            &format!("tool not available; use one of: {}", names.join(", ")),
                        )?;
                        continue;
                    }

                    if self.needs_approval(executor, &tool) {
                        send_event(
                            &self.events,
                            OrchestratorEvent::Suspended {
                                worker: state.worker_name.clone(),
                                tool: tool.clone(),
                            },
                        );
                        return Ok(WorkerRun::Suspended(state.suspend(tool, args)));
                    }

                    self.invoke_tool(executor, state, &tool, args).await?;
                }
                Err(OrchestratorError::JsonParse(detail)) if !state.json_repair_used => {
                    // 一次纠错机会：格式错误作为可纠正条件喂回模型
                    state.json_repair_used = true;
                    state.transcript.push(Message::user(format!(
                        "Your last output was not a valid tool call ({}). Output exactly one \
                         JSON object {{\"tool\": \"name\", \"args\": {{...}}}} or a plain-text \
                         final answer.",
                        detail
                    )));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// 执行工具并把结果（或错误）作为观察写回誊本；连续相同失败达到上限时终止
    async fn invoke_tool(
        &self,
        executor: &ToolExecutor,
        state: &mut LoopState,
        tool: &str,
        args: Value,
    ) -> Result<(), OrchestratorError> {
        match executor.execute(tool, args.clone()).await {
            Ok(observation) => {
                state.fail_tool = None;
                state.fail_count = 0;
                send_event(
                    &self.events,
                    OrchestratorEvent::Observation {
                        worker: state.worker_name.clone(),
                        tool: tool.to_string(),
                        preview: preview(&observation),
                    },
                );
                state.transcript.push(Message::user(format!(
                    "Observation from {}: {}",
                    tool, observation
                )));
                Ok(())
            }
            Err(e) => self.record_failure(state, tool, &args, &e.to_string()),
        }
    }

    /// 失败计数按（工具, 参数）配对；换参数或换工具即重置
    fn record_failure(
        &self,
        state: &mut LoopState,
        tool: &str,
        args: &Value,
        reason: &str,
    ) -> Result<(), OrchestratorError> {
        let signature = args.to_string();
        if state.fail_tool.as_deref() == Some(tool) && state.fail_args == signature {
            state.fail_count += 1;
        } else {
            state.fail_tool = Some(tool.to_string());
            state.fail_args = signature;
            state.fail_count = 1;
        }

        if state.fail_count >= self.tool_failure_limit {
            return Err(OrchestratorError::ToolRepeatedFailure {
                tool: tool.to_string(),
                reason: reason.to_string(),
            });
        }

        state.transcript.push(Message::user(format!(
            "Observation from {}: Error: {}",
            tool, reason
        )));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlmClient;
    use crate::store::InMemoryArtifactStore;
    use crate::tools::{EchoTool, Tool, ToolRegistry};
    use async_trait::async_trait;

    fn request(key: &str) -> DelegationRequest {
        DelegationRequest {
            worker_name: "research".into(),
            task_description: "look things up".into(),
            allowed_tools: vec![],
            output_artifact_key: key.into(),
            seed_artifacts: vec![],
        }
    }

    fn runtime(llm: ScriptedLlmClient) -> WorkerRuntime {
        WorkerRuntime::new(
            Arc::new(llm),
            25,
            Duration::from_secs(30),
            3,
            CancellationToken::new(),
        )
    }

    fn executor() -> ToolExecutor {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        ToolExecutor::new(registry, 5)
    }

    /// 永远失败的工具
    struct BrokenTool;

    #[async_trait]
    impl Tool for BrokenTool {
        fn name(&self) -> &str {
            "broken"
        }

        fn description(&self) -> &str {
            "always fails"
        }

        async fn execute(&self, _args: serde_json::Value) -> Result<String, String> {
            Err("permanent failure".to_string())
        }
    }

    #[tokio::test]
    async fn test_final_answer_written_to_output_key() {
        let llm = ScriptedLlmClient::new(vec!["The answer is 42."]);
        let store: Arc<dyn ArtifactStore> = Arc::new(InMemoryArtifactStore::new());
        let req = request("notes_1");
        let ctx = IsolatedContext::seeded(&req.task_description, vec![], 20);

        let run = runtime(llm)
            .run(&executor(), "You are a research worker.", ctx, &req, &store)
            .await
            .unwrap();

        match run {
            WorkerRun::Done(outcome) => {
                assert_eq!(outcome.result_message, "The answer is 42.");
                assert_eq!(outcome.artifacts_written, vec!["notes_1".to_string()]);
                assert_eq!(store.read("notes_1").unwrap().content, "The answer is 42.");
            }
            other => panic!("unexpected run result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_tool_loop_then_final() {
        let llm = ScriptedLlmClient::new(vec![
            r#"{"tool": "echo", "args": {"text": "probe"}}"#,
            "Done: probe confirmed.",
        ]);
        let store: Arc<dyn ArtifactStore> = Arc::new(InMemoryArtifactStore::new());
        let req = request("notes_2");
        let ctx = IsolatedContext::seeded(&req.task_description, vec![], 20);

        let run = runtime(llm)
            .run(&executor(), "worker", ctx, &req, &store)
            .await
            .unwrap();
        match run {
            WorkerRun::Done(outcome) => {
                assert_eq!(outcome.steps_used, 2);
                assert_eq!(outcome.result_message, "Done: probe confirmed.");
            }
            other => panic!("unexpected run result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_step_budget_is_hard_bound() {
        // 模型永远请求工具，循环必须在预算内终止
        let outputs: Vec<String> = (0..30)
            .map(|_| r#"{"tool": "echo", "args": {"text": "again"}}"#.to_string())
            .collect();
        let llm = ScriptedLlmClient::new(outputs);
        let store: Arc<dyn ArtifactStore> = Arc::new(InMemoryArtifactStore::new());
        let req = request("notes_3");
        let ctx = IsolatedContext::seeded(&req.task_description, vec![], 20);

        let rt = WorkerRuntime::new(
            Arc::new(llm),
            5,
            Duration::from_secs(30),
            3,
            CancellationToken::new(),
        );
        let err = rt
            .run(&executor(), "worker", ctx, &req, &store)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "step_budget_exceeded");
    }

    #[tokio::test]
    async fn test_three_identical_failures_terminate_worker() {
        let outputs: Vec<String> = (0..5)
            .map(|_| r#"{"tool": "broken", "args": {"q": "same"}}"#.to_string())
            .collect();
        let llm = ScriptedLlmClient::new(outputs);
        let store: Arc<dyn ArtifactStore> = Arc::new(InMemoryArtifactStore::new());
        let req = request("notes_4");
        let ctx = IsolatedContext::seeded(&req.task_description, vec![], 20);

        let mut registry = ToolRegistry::new();
        registry.register(BrokenTool);
        let executor = ToolExecutor::new(registry, 5);

        let err = runtime(llm)
            .run(&executor, "worker", ctx, &req, &store)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "tool_repeated_failure");
    }

    #[tokio::test]
    async fn test_single_failure_is_recoverable_in_loop() {
        // 第一次失败作为观察喂回，模型换成 echo 后正常完成
        let llm = ScriptedLlmClient::new(vec![
            r#"{"tool": "broken", "args": {}}"#,
            r#"{"tool": "echo", "args": {"text": "recovered"}}"#,
            "All good.",
        ]);
        let store: Arc<dyn ArtifactStore> = Arc::new(InMemoryArtifactStore::new());
        let req = request("notes_5");
        let ctx = IsolatedContext::seeded(&req.task_description, vec![], 20);

        let mut registry = ToolRegistry::new();
        registry.register(BrokenTool);
        registry.register(EchoTool);
        let executor = ToolExecutor::new(registry, 5);

        let run = runtime(llm)
            .run(&executor, "worker", ctx, &req, &store)
            .await
            .unwrap();
        assert!(matches!(run, WorkerRun::Done(_)));
    }

    #[tokio::test]
    async fn test_malformed_json_gets_one_repair_round() {
        let llm = ScriptedLlmClient::new(vec![
            r#"{"tool": "echo", "args": "#,
            "Recovered final answer.",
        ]);
        let store: Arc<dyn ArtifactStore> = Arc::new(InMemoryArtifactStore::new());
        let req = request("notes_6");
        let ctx = IsolatedContext::seeded(&req.task_description, vec![], 20);

        let run = runtime(llm)
            .run(&executor(), "worker", ctx, &req, &store)
            .await
            .unwrap();
        match run {
            WorkerRun::Done(outcome) => {
                assert_eq!(outcome.result_message, "Recovered final answer.");
            }
            other => panic!("unexpected run result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_approval_flagged_tool_suspends() {
        let llm = ScriptedLlmClient::new(vec![r#"{"tool": "echo", "args": {"text": "hi"}}"#]);
        let store: Arc<dyn ArtifactStore> = Arc::new(InMemoryArtifactStore::new());
        let req = request("notes_7");
        let ctx = IsolatedContext::seeded(&req.task_description, vec![], 20);

        let rt = runtime(llm).with_approval_required(vec!["echo".to_string()]);
        let run = rt
            .run(&executor(), "worker", ctx, &req, &store)
            .await
            .unwrap();
        match run {
            WorkerRun::Suspended(s) => {
                assert_eq!(s.pending_tool, "echo");
                assert_eq!(s.steps_used, 1);
            }
            other => panic!("unexpected run result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_resume_accept_executes_pending_call() {
        let llm = ScriptedLlmClient::new(vec![r#"{"tool": "echo", "args": {"text": "hi"}}"#]);
        let store: Arc<dyn ArtifactStore> = Arc::new(InMemoryArtifactStore::new());
        let req = request("notes_8");
        let ctx = IsolatedContext::seeded(&req.task_description, vec![], 20);

        let rt = runtime(llm).with_approval_required(vec!["echo".to_string()]);
        let suspended = match rt
            .run(&executor(), "worker", ctx, &req, &store)
            .await
            .unwrap()
        {
            WorkerRun::Suspended(s) => s,
            other => panic!("unexpected run result: {:?}", other),
        };

        // 恢复后的运行时带新的脚本尾部
        let rt2 = WorkerRuntime::new(
            Arc::new(ScriptedLlmClient::new(vec!["Final after approval."])),
            25,
            Duration::from_secs(30),
            3,
            CancellationToken::new(),
        );
        let run = rt2
            .resume(
                &executor(),
                "worker",
                suspended,
                ResumeDecision::Accept,
                None,
                &store,
            )
            .await
            .unwrap();
        match run {
            WorkerRun::Done(outcome) => {
                assert_eq!(outcome.result_message, "Final after approval.");
            }
            other => panic!("unexpected run result: {:?}", other),
        }
    }
}
