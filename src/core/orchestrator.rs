//! 会话驱动循环
//!
//! 把监督者、路由器、工作者运行时、评审门与会话管理器接成一个回合制主循环：
//! 监督者回合产出指令 -> 路由器转移 -> 工作者/评审门执行 -> 回到监督者，
//! 每次转移后检查点。评审重试上限在这里以代码强制，与模型行为无关；
//! 取消只发生在路由边界。调用方永远拿到结构化的 RunOutcome。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::boundary::{
    validate_boundary_schemas, ArtifactPayload, InboundRequest, OutboundResult, ResumeDecision,
    ResumeSignal, RunOutcome,
};
use crate::config::AppConfig;
use crate::core::events::{preview, send_event, OrchestratorEvent};
use crate::core::review::ReviewGate;
use crate::core::router::{Router, RouterState, RoutingStrategy, SupervisorSignal, TurnOutput};
use crate::core::supervisor::{parse_directive, Delegation, Supervisor, SupervisorDirective};
use crate::core::OrchestratorError;
use crate::llm::LlmClient;
use crate::plan::{ItemStatus, PlanItem, PlanTracker};
use crate::session::{ReviewStatus, SessionState, SessionStateManager};
use crate::store::ArtifactStore;
use crate::tools::{ArtifactReadTool, ToolExecutor, ToolRegistry};
use crate::worker::{
    DelegationRequest, IsolatedContext, SuspendedWorker, WorkerRun, WorkerRuntime,
};

/// 工作者档案：部署方注册的角色（名称、system prompt、默认工具集）
#[derive(Clone, Debug)]
pub struct WorkerProfile {
    pub name: String,
    pub system_prompt: String,
    /// 默认工具允许列表；空表示执行器全部工具
    pub default_tools: Vec<String>,
}

impl WorkerProfile {
    pub fn new(name: impl Into<String>, system_prompt: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            system_prompt: system_prompt.into(),
            default_tools: Vec::new(),
        }
    }

    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        self.default_tools = tools;
        self
    }
}

const DEFAULT_SUPERVISOR_PROMPT: &str = "You are a supervisor agent. Decompose the request \
into a plan, delegate items to workers, and synthesize the final answer. Respond with exactly \
one JSON directive per turn:\n\
{\"action\": \"plan\", \"items\": [{\"id\": \"t1\", \"description\": \"...\"}]}\n\
{\"action\": \"delegate\", \"item_id\": \"t1\", \"worker\": \"name\", \"task\": \"...\", \
\"output_key\": \"unique_key\", \"placeholder\": \"(work in progress summary)\"}\n\
{\"action\": \"delegate_parallel\", \"delegations\": [ ... ]}\n\
{\"action\": \"review\", \"artifact_key\": \"key\", \"criteria\": [\"...\"]}\n\
{\"action\": \"remember\", \"fact\": \"...\"}\n\
{\"action\": \"finish\", \"message\": \"final answer for the caller\"}\n\
Messages you receive reference artifacts by key; never inline large payloads.";

/// 已排队、尚未派发的委派（构造一次、消费一次）
struct QueuedDelegation {
    item_id: String,
    request: DelegationRequest,
}

/// 工作者完成但条目终态未定（等下一个监督者回合决定 完成/送审）
struct PendingCompletion {
    item_id: String,
    output_key: String,
}

/// 编排器：组件持有者 + 主循环
pub struct Orchestrator {
    config: AppConfig,
    strategy: RoutingStrategy,
    llm: Arc<dyn LlmClient>,
    review_llm: Arc<dyn LlmClient>,
    registry: ToolRegistry,
    store: Arc<dyn ArtifactStore>,
    sessions: SessionStateManager,
    workers: HashMap<String, WorkerProfile>,
    supervisor_prompt: String,
    events: Option<UnboundedSender<OrchestratorEvent>>,
    cancel: CancellationToken,
}

impl Orchestrator {
    /// 构建编排器；边界 schema 校验在此执行（构建期而非运行期）
    pub fn new(
        config: AppConfig,
        llm: Arc<dyn LlmClient>,
        review_llm: Arc<dyn LlmClient>,
        registry: ToolRegistry,
        store: Arc<dyn ArtifactStore>,
        sessions: SessionStateManager,
    ) -> Result<Self, OrchestratorError> {
        validate_boundary_schemas()?;
        let strategy = RoutingStrategy::from_name(&config.router.strategy)?;
        Ok(Self {
            config,
            strategy,
            llm,
            review_llm,
            registry,
            store,
            sessions,
            workers: HashMap::new(),
            supervisor_prompt: DEFAULT_SUPERVISOR_PROMPT.to_string(),
            events: None,
            cancel: CancellationToken::new(),
        })
    }

    /// 注册一个工作者角色
    pub fn with_worker(mut self, profile: WorkerProfile) -> Self {
        self.workers.insert(profile.name.clone(), profile);
        self
    }

    pub fn with_supervisor_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.supervisor_prompt = prompt.into();
        self
    }

    pub fn with_events(mut self, tx: UnboundedSender<OrchestratorEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// 请求在下一个路由边界取消当前会话
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// 处理一条入站请求，驱动会话直到 完成/挂起/失败
    pub async fn handle(&self, req: InboundRequest) -> RunOutcome {
        let (mut state, facts, fresh) = match self
            .sessions
            .load_or_create(&req.session_id, &req.principal_id)
            .await
        {
            Ok(v) => v,
            Err(e) => return self.bare_failure(e),
        };

        // 已挂起的会话只接受 ResumeSignal
        if let Some(suspended) = &state.active_worker {
            return RunOutcome::Suspended {
                session_id: state.session_id.clone(),
                worker: suspended.worker_name.clone(),
                tool: suspended.pending_tool.clone(),
                args: suspended.pending_args.clone(),
            };
        }

        if !fresh && !state.artifacts.is_empty() {
            self.store.restore(state.artifacts.clone());
        }

        let mut supervisor = if fresh {
            let mut s = Supervisor::new(
                self.llm.clone(),
                self.supervisor_prompt.clone(),
                self.sessions.max_turns(),
            );
            s.seed(&req.request_text, &facts);
            s
        } else {
            let mut s = Supervisor::restore(
                self.llm.clone(),
                self.supervisor_prompt.clone(),
                state.messages.clone(),
            );
            s.observe(req.request_text.clone());
            s
        };

        let mut tracker = PlanTracker::from_plan(state.plan.clone());
        let mut router = Router::restore(
            self.strategy,
            self.config.router.max_total_steps,
            self.workers.keys().cloned(),
            RouterState::Supervisor,
            state.step_counter,
        );

        self.drive(&mut state, &mut supervisor, &mut tracker, &mut router, None)
            .await
    }

    /// 恢复一个挂起的会话（human-in-the-loop 审批决策）
    pub async fn resume(&self, signal: ResumeSignal) -> RunOutcome {
        let mut state = match self.sessions.load(&signal.session_id).await {
            Ok(Some(s)) => s,
            Ok(None) => {
                return self.bare_failure(OrchestratorError::Persistence(format!(
                    "unknown session '{}'",
                    signal.session_id
                )))
            }
            Err(e) => return self.bare_failure(e),
        };

        let Some(mut suspended) = state.active_worker.take() else {
            return self.bare_failure(OrchestratorError::MalformedHandoff(
                "resume signal for a session with no suspended worker".to_string(),
            ));
        };

        if signal.decision == ResumeDecision::Edit {
            if let Some(args) = signal.edited_arguments.clone() {
                suspended.pending_args = args;
            }
        }

        if !state.artifacts.is_empty() {
            self.store.restore(state.artifacts.clone());
        }

        let mut supervisor = Supervisor::restore(
            self.llm.clone(),
            self.supervisor_prompt.clone(),
            state.messages.clone(),
        );
        let mut tracker = PlanTracker::from_plan(state.plan.clone());
        let mut router = Router::restore(
            self.strategy,
            self.config.router.max_total_steps,
            self.workers.keys().cloned(),
            RouterState::Worker(suspended.worker_name.clone()),
            state.step_counter,
        );

        self.drive(
            &mut state,
            &mut supervisor,
            &mut tracker,
            &mut router,
            Some((suspended, signal.decision, signal.feedback.clone())),
        )
        .await
    }

    /// 主循环外壳：把内部错误转成结构化失败（附最后已知计划与部分工件）
    async fn drive(
        &self,
        state: &mut SessionState,
        supervisor: &mut Supervisor,
        tracker: &mut PlanTracker,
        router: &mut Router,
        resume: Option<(SuspendedWorker, ResumeDecision, Option<String>)>,
    ) -> RunOutcome {
        match self
            .drive_inner(state, supervisor, tracker, router, resume)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                if matches!(e, OrchestratorError::Cancelled) {
                    tracker.fail_in_progress();
                }
                send_event(
                    &self.events,
                    OrchestratorEvent::Error {
                        text: e.to_string(),
                    },
                );
                self.sync_state(state, supervisor, tracker, router);
                let _ = self.sessions.checkpoint(state).await;
                RunOutcome::Failed {
                    error_kind: e.kind().to_string(),
                    error: e.to_string(),
                    plan_summary: tracker.read_plan().summary(),
                    artifacts: self.artifact_payloads(),
                }
            }
        }
    }

    #[allow(clippy::too_many_lines)]
    async fn drive_inner(
        &self,
        state: &mut SessionState,
        supervisor: &mut Supervisor,
        tracker: &mut PlanTracker,
        router: &mut Router,
        mut resume: Option<(SuspendedWorker, ResumeDecision, Option<String>)>,
    ) -> Result<RunOutcome, OrchestratorError> {
        let mut queued: Vec<QueuedDelegation> = Vec::new();
        let mut pending_review: Option<(String, Vec<String>)> = None;
        let mut pending_completions: Vec<PendingCompletion> = Vec::new();
        let mut parse_retry_used = false;

        loop {
            if self.cancel.is_cancelled() {
                return Err(OrchestratorError::Cancelled);
            }

            match router.state().clone() {
                RouterState::Supervisor => {
                    send_event(&self.events, OrchestratorEvent::SupervisorThinking);
                    let raw = supervisor
                        .turn(&tracker.read_plan().summary(), &self.store.list(""))
                        .await?;

                    let directive = match parse_directive(&raw) {
                        Ok(d) => {
                            parse_retry_used = false;
                            d
                        }
                        Err(e) if !parse_retry_used => {
                            // 一次纠错机会，第二次解析失败才致命
                            parse_retry_used = true;
                            supervisor.observe(format!(
                                "Your last directive was not valid JSON ({}). Respond with \
                                 exactly one JSON directive.",
                                e
                            ));
                            continue;
                        }
                        Err(e) => return Err(e),
                    };

                    // 工作者完成后的首个监督者回合敲定条目终态：
                    // 送审的 key 保持 in_progress，其余标记 completed
                    self.resolve_completions(&directive, &mut pending_completions, tracker)?;

                    match directive {
                        SupervisorDirective::Plan { items } => {
                            let count = items.len();
                            tracker.record_plan(
                                items
                                    .into_iter()
                                    .map(|p| {
                                        PlanItem::new(
                                            p.id.unwrap_or_else(|| {
                                                uuid::Uuid::new_v4().to_string()
                                            }),
                                            p.description,
                                        )
                                    })
                                    .collect(),
                            );
                            supervisor.push_raw(raw);
                            send_event(
                                &self.events,
                                OrchestratorEvent::PlanRecorded { item_count: count },
                            );
                            router.transition(TurnOutput::Supervisor(
                                SupervisorSignal::PlanRecorded,
                            ))?;
                        }
                        SupervisorDirective::Remember { fact } => {
                            self.sessions.remember(&state.principal_id, &fact).await?;
                            supervisor.push_raw(raw);
                            router.transition(TurnOutput::Supervisor(
                                SupervisorSignal::FactRecorded,
                            ))?;
                        }
                        SupervisorDirective::Delegate(d) => {
                            let placeholders = d.placeholder.is_some();
                            self.queue_delegation(&d, tracker, &mut queued)?;
                            supervisor.push_placeholder(d.placeholder.clone().unwrap_or_else(
                                || format!("(delegated item {} to {})", d.item_id, d.worker),
                            ));
                            send_event(
                                &self.events,
                                OrchestratorEvent::Delegated {
                                    worker: d.worker.clone(),
                                    item_id: d.item_id.clone(),
                                    output_key: d.output_key.clone(),
                                },
                            );
                            router.transition(TurnOutput::Supervisor(
                                SupervisorSignal::Delegated {
                                    workers: vec![d.worker.clone()],
                                    placeholders,
                                },
                            ))?;
                        }
                        SupervisorDirective::DelegateParallel { delegations } => {
                            validate_disjoint_namespaces(&delegations)?;
                            let placeholders =
                                delegations.iter().all(|d| d.placeholder.is_some());
                            let workers: Vec<String> =
                                delegations.iter().map(|d| d.worker.clone()).collect();
                            for d in &delegations {
                                self.queue_delegation(d, tracker, &mut queued)?;
                                supervisor.push_placeholder(
                                    d.placeholder.clone().unwrap_or_else(|| {
                                        format!(
                                            "(delegated item {} to {})",
                                            d.item_id, d.worker
                                        )
                                    }),
                                );
                                send_event(
                                    &self.events,
                                    OrchestratorEvent::Delegated {
                                        worker: d.worker.clone(),
                                        item_id: d.item_id.clone(),
                                        output_key: d.output_key.clone(),
                                    },
                                );
                            }
                            router.transition(TurnOutput::Supervisor(
                                SupervisorSignal::Delegated {
                                    workers,
                                    placeholders,
                                },
                            ))?;
                        }
                        SupervisorDirective::Review {
                            artifact_key,
                            criteria,
                        } => {
                            let criteria = if criteria.is_empty() {
                                self.config.review.criteria.clone()
                            } else {
                                criteria
                            };
                            pending_review = Some((artifact_key, criteria));
                            state.review_status = ReviewStatus::Pending;
                            supervisor.push_raw(raw);
                            router.transition(TurnOutput::Supervisor(
                                SupervisorSignal::ReviewRequested,
                            ))?;
                        }
                        SupervisorDirective::Finish { message } => {
                            router
                                .transition(TurnOutput::Supervisor(SupervisorSignal::Finished))?;
                            supervisor.push_raw(message.clone());
                            self.sync_state(state, supervisor, tracker, router);
                            self.sessions.checkpoint(state).await?;
                            send_event(
                                &self.events,
                                OrchestratorEvent::Completed {
                                    preview: preview(&message),
                                },
                            );
                            return Ok(RunOutcome::Completed(OutboundResult {
                                final_message: message,
                                artifacts: self.artifact_payloads(),
                                plan_summary: tracker.read_plan().summary(),
                            }));
                        }
                    }

                    self.sync_state(state, supervisor, tracker, router);
                    self.sessions.checkpoint(state).await?;
                }

                RouterState::Worker(_) => {
                    let results = if let Some((suspended, decision, feedback)) = resume.take() {
                        vec![self.run_resumed(suspended, decision, feedback).await]
                    } else {
                        let delegations = std::mem::take(&mut queued);
                        if delegations.is_empty() {
                            return Err(OrchestratorError::MalformedHandoff(
                                "worker state with no pending delegation".to_string(),
                            ));
                        }
                        self.run_delegations(delegations).await
                    };

                    let parallel = results.len() > 1;
                    let mut any_failed = false;
                    for (item_id, worker, output_key, run) in results {
                        match run {
                            Ok(WorkerRun::Done(outcome)) => {
                                supervisor.observe(format!(
                                    "Worker {} finished item {} in {} steps. Result stored \
                                     in artifact '{}'.",
                                    worker, item_id, outcome.steps_used, output_key
                                ));
                                pending_completions.push(PendingCompletion {
                                    item_id,
                                    output_key,
                                });
                            }
                            Ok(WorkerRun::Suspended(mut suspended)) => {
                                if parallel {
                                    // scatter-gather 下不支持挂起，按委派失败处理
                                    any_failed = true;
                                    tracker.update_status(&item_id, ItemStatus::Failed, None)?;
                                    supervisor.observe(format!(
                                        "Worker {} required approval during parallel \
                                         dispatch; item {} marked failed.",
                                        worker, item_id
                                    ));
                                } else {
                                    suspended.item_id = Some(item_id);
                                    let outcome = RunOutcome::Suspended {
                                        session_id: state.session_id.clone(),
                                        worker: suspended.worker_name.clone(),
                                        tool: suspended.pending_tool.clone(),
                                        args: suspended.pending_args.clone(),
                                    };
                                    state.active_worker = Some(suspended);
                                    self.sync_state(state, supervisor, tracker, router);
                                    self.sessions.checkpoint(state).await?;
                                    return Ok(outcome);
                                }
                            }
                            Err(e) if e.is_fatal() || matches!(e, OrchestratorError::Cancelled) => {
                                return Err(e)
                            }
                            Err(e) => {
                                // 委派失败：条目 failed，监督者以普通观察收到
                                any_failed = true;
                                tracker.update_status(&item_id, ItemStatus::Failed, None)?;
                                supervisor.observe(format!(
                                    "Worker {} failed item {}: {} [{}].",
                                    worker, item_id, e, e.kind()
                                ));
                            }
                        }
                    }

                    router.transition(if any_failed {
                        TurnOutput::WorkerFailed
                    } else {
                        TurnOutput::WorkerDone
                    })?;
                    self.sync_state(state, supervisor, tracker, router);
                    self.sessions.checkpoint(state).await?;
                }

                RouterState::Review => {
                    let (key, criteria) = pending_review.take().ok_or_else(|| {
                        OrchestratorError::MalformedHandoff(
                            "review state with no pending review".to_string(),
                        )
                    })?;
                    self.run_review(
                        &key,
                        &criteria,
                        state,
                        supervisor,
                        tracker,
                        &mut pending_completions,
                    )
                    .await?;
                    router.transition(TurnOutput::ReviewDone)?;
                    self.sync_state(state, supervisor, tracker, router);
                    self.sessions.checkpoint(state).await?;
                }

                RouterState::Terminated => {
                    return Err(OrchestratorError::MalformedHandoff(
                        "drive loop entered terminated state".to_string(),
                    ));
                }
            }
        }
    }

    /// 工作者完成后的条目终态敲定；Review 指令引用的 key 保持 in_progress
    fn resolve_completions(
        &self,
        directive: &SupervisorDirective,
        pending: &mut Vec<PendingCompletion>,
        tracker: &mut PlanTracker,
    ) -> Result<(), OrchestratorError> {
        let under_review = match directive {
            SupervisorDirective::Review { artifact_key, .. } => Some(artifact_key.clone()),
            _ => None,
        };
        let mut keep = Vec::new();
        for completion in pending.drain(..) {
            if under_review.as_deref() == Some(completion.output_key.as_str()) {
                keep.push(completion);
                continue;
            }
            tracker.update_status(
                &completion.item_id,
                ItemStatus::Completed,
                Some(completion.output_key.clone()),
            )?;
        }
        *pending = keep;
        Ok(())
    }

    /// 登记一次委派：条目不存在则按监督者意图创建，标记 in_progress 并构造请求。
    /// 顺序不变式：除被重试的条目本身外，不允许其它条目处于 in_progress。
    fn queue_delegation(
        &self,
        d: &Delegation,
        tracker: &mut PlanTracker,
        queued: &mut Vec<QueuedDelegation>,
    ) -> Result<(), OrchestratorError> {
        let batch_ids: Vec<&str> = queued
            .iter()
            .map(|q| q.item_id.as_str())
            .chain(std::iter::once(d.item_id.as_str()))
            .collect();
        for item in &tracker.read_plan().items {
            if item.status == ItemStatus::InProgress && !batch_ids.contains(&item.id.as_str()) {
                return Err(OrchestratorError::MalformedHandoff(format!(
                    "item {} still in progress while delegating {}",
                    item.id, d.item_id
                )));
            }
        }

        if tracker.read_plan().get(&d.item_id).is_none() {
            tracker.record_plan(vec![PlanItem::new(d.item_id.clone(), d.task.clone())]);
        }
        tracker.update_status(&d.item_id, ItemStatus::InProgress, None)?;
        tracker.assign_owner(&d.item_id, &d.worker)?;

        let profile = self.workers.get(&d.worker);
        let allowed_tools = d
            .tools
            .clone()
            .or_else(|| profile.map(|p| p.default_tools.clone()))
            .unwrap_or_default();

        queued.push(QueuedDelegation {
            item_id: d.item_id.clone(),
            request: DelegationRequest {
                worker_name: d.worker.clone(),
                task_description: d.task.clone(),
                allowed_tools,
                output_artifact_key: d.output_key.clone(),
                seed_artifacts: d.seed_artifacts.clone(),
            },
        });
        Ok(())
    }

    /// 为一次委派构造执行器：注册表副本 + 按播种 key 限定的 artifact_read
    fn executor_for(&self, seed_artifacts: &[String]) -> ToolExecutor {
        let mut registry = self.registry.clone();
        registry.register(ArtifactReadTool::new(
            self.store.clone(),
            seed_artifacts.iter().cloned(),
        ));
        ToolExecutor::new(registry, self.config.tools.tool_timeout_secs)
    }

    fn runtime(&self) -> WorkerRuntime {
        let mut rt = WorkerRuntime::new(
            self.llm.clone(),
            self.config.worker.step_budget,
            Duration::from_secs(self.config.worker.wall_clock_secs),
            self.config.worker.tool_failure_limit,
            self.cancel.child_token(),
        )
        .with_approval_required(self.config.worker.approval_required.clone());
        if let Some(tx) = &self.events {
            rt = rt.with_events(tx.clone());
        }
        rt
    }

    fn worker_prompt(&self, worker: &str) -> String {
        self.workers
            .get(worker)
            .map(|p| p.system_prompt.clone())
            .unwrap_or_else(|| "You are a worker agent. Complete the delegated task.".to_string())
    }

    /// 并发执行一批委派（单条时即顺序执行）；全部 join 后才返回
    async fn run_delegations(
        &self,
        delegations: Vec<QueuedDelegation>,
    ) -> Vec<(String, String, String, Result<WorkerRun, OrchestratorError>)> {
        let futures = delegations.iter().map(|q| async move {
            let executor = self.executor_for(&q.request.seed_artifacts);
            let prompt = self.worker_prompt(&q.request.worker_name);
            // 每次委派都是全新隔离上下文：只含任务描述与播种视图
            let ctx = IsolatedContext::seeded(
                &q.request.task_description,
                q.request.seed_artifacts.clone(),
                self.sessions.max_turns(),
            );
            let run = self
                .runtime()
                .run(&executor, &prompt, ctx, &q.request, &self.store)
                .await;
            (
                q.item_id.clone(),
                q.request.worker_name.clone(),
                q.request.output_artifact_key.clone(),
                run,
            )
        });
        futures_util::future::join_all(futures).await
    }

    async fn run_resumed(
        &self,
        suspended: SuspendedWorker,
        decision: ResumeDecision,
        feedback: Option<String>,
    ) -> (String, String, String, Result<WorkerRun, OrchestratorError>) {
        let item_id = suspended.item_id.clone().unwrap_or_default();
        let worker = suspended.worker_name.clone();
        let output_key = suspended.output_artifact_key.clone();
        let executor = self.executor_for(&suspended.seeded_artifacts);
        let prompt = self.worker_prompt(&worker);
        let run = self
            .runtime()
            .resume(&executor, &prompt, suspended, decision, feedback, &self.store)
            .await;
        (item_id, worker, output_key, run)
    }

    /// 评审门一跳：读工件、评审、把结论（和重试预算）落到计划与监督者观察里
    async fn run_review(
        &self,
        key: &str,
        criteria: &[String],
        state: &mut SessionState,
        supervisor: &mut Supervisor,
        tracker: &mut PlanTracker,
        pending_completions: &mut Vec<PendingCompletion>,
    ) -> Result<(), OrchestratorError> {
        let Some(artifact) = self.store.read(key) else {
            state.review_status = ReviewStatus::None;
            supervisor.observe(format!(
                "Review failed: artifact '{}' does not exist.",
                key
            ));
            return Ok(());
        };

        let gate = ReviewGate::new(
            self.review_llm.clone(),
            self.config.review.prompt_template.clone(),
        );
        let verdict = gate.evaluate(&artifact, criteria).await?;
        send_event(
            &self.events,
            OrchestratorEvent::ReviewVerdict {
                artifact_key: key.to_string(),
                accepted: verdict.accepted,
                feedback: verdict.feedback.clone(),
            },
        );

        // 工件归属的计划条目：优先在途完成，其次已落 output_ref 的条目
        let item_id = pending_completions
            .iter()
            .find(|c| c.output_key == key)
            .map(|c| c.item_id.clone())
            .or_else(|| {
                tracker
                    .read_plan()
                    .items
                    .iter()
                    .find(|i| i.output_ref.as_deref() == Some(key))
                    .map(|i| i.id.clone())
            });

        if verdict.accepted {
            state.review_status = ReviewStatus::Accepted;
            if let Some(id) = &item_id {
                tracker.update_status(id, ItemStatus::Completed, Some(key.to_string()))?;
                pending_completions.retain(|c| c.output_key != key);
            }
            supervisor.observe(format!("Review of artifact '{}' accepted.", key));
            return Ok(());
        }

        let feedback = verdict
            .feedback
            .unwrap_or_else(|| "no feedback given".to_string());
        state.review_status = ReviewStatus::Rejected {
            feedback: feedback.clone(),
        };
        pending_completions.retain(|c| c.output_key != key);

        let Some(id) = item_id else {
            supervisor.observe(format!(
                "Review of artifact '{}' rejected: {}",
                key, feedback
            ));
            return Ok(());
        };

        let attempts = state.review_attempts.entry(id.clone()).or_insert(0);
        *attempts += 1;
        if *attempts > self.config.review.max_retries {
            tracker.update_status(&id, ItemStatus::Failed, Some(key.to_string()))?;
            supervisor.observe(format!(
                "Review of artifact '{}' rejected again: {}. Retry budget exhausted, item {} \
                 marked failed; surface this to the caller.",
                key, feedback, id
            ));
        } else {
            supervisor.observe(format!(
                "Review of artifact '{}' rejected: {}. Re-delegate item {} to a fresh worker \
                 with this feedback appended to the task description, or finish and escalate.",
                key, feedback, id
            ));
        }
        Ok(())
    }

    fn sync_state(
        &self,
        state: &mut SessionState,
        supervisor: &Supervisor,
        tracker: &PlanTracker,
        router: &Router,
    ) {
        state.messages = supervisor.transcript().clone();
        state.plan = tracker.read_plan().clone();
        state.artifacts = self.store.snapshot();
        state.step_counter = router.step();
        state.router_state = router.state().clone();
    }

    fn artifact_payloads(&self) -> Vec<ArtifactPayload> {
        self.store
            .snapshot()
            .into_iter()
            .map(|a| ArtifactPayload {
                key: a.key,
                content: a.content,
            })
            .collect()
    }

    /// 状态尚不可用时的结构化失败
    fn bare_failure(&self, e: OrchestratorError) -> RunOutcome {
        RunOutcome::Failed {
            error_kind: e.kind().to_string(),
            error: e.to_string(),
            plan_summary: String::new(),
            artifacts: Vec::new(),
        }
    }
}

/// scatter-gather 命名空间约束：输出 key 的首段（首个 '/' 之前）两两不同，
/// 派发前校验，违规即 MalformedHandoff
fn validate_disjoint_namespaces(delegations: &[Delegation]) -> Result<(), OrchestratorError> {
    let mut seen = std::collections::HashSet::new();
    for d in delegations {
        let namespace = d
            .output_key
            .split_once('/')
            .map(|(ns, _)| ns)
            .unwrap_or(&d.output_key);
        if !seen.insert(namespace.to_string()) {
            return Err(OrchestratorError::MalformedHandoff(format!(
                "parallel delegations share artifact namespace '{}'",
                namespace
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delegation(key: &str) -> Delegation {
        Delegation {
            item_id: "t1".into(),
            worker: "research".into(),
            task: "task".into(),
            output_key: key.into(),
            placeholder: Some("(pending)".into()),
            tools: None,
            seed_artifacts: vec![],
        }
    }

    #[test]
    fn test_disjoint_namespaces_accepted() {
        let ds = vec![delegation("north/notes"), delegation("south/notes")];
        assert!(validate_disjoint_namespaces(&ds).is_ok());
    }

    #[test]
    fn test_shared_namespace_rejected() {
        let ds = vec![delegation("north/notes"), delegation("north/extra")];
        let err = validate_disjoint_namespaces(&ds).unwrap_err();
        assert_eq!(err.kind(), "malformed_handoff");
    }
}
