//! 无头编排运行时
//!
//! 供 CLI / HTTP 等前端调用的无界面入口：从配置装配 LLM、工具、存储、
//! 会话管理器与编排器，暴露 handle / resume / cancel 三个操作。

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;

use crate::boundary::{InboundRequest, ResumeSignal, RunOutcome};
use crate::config::AppConfig;
use crate::core::{Orchestrator, OrchestratorError, OrchestratorEvent, WorkerProfile};
use crate::llm::{LlmClient, MockLlmClient, OpenAiClient, RetryConfig, RetryingLlmClient};
use crate::session::{create_session_backend, FactsStore, SessionStateManager};
use crate::store::{ArtifactStore, InMemoryArtifactStore};
use crate::tools::{EchoTool, ToolRegistry};

/// 根据配置与环境变量选择 LLM 后端（OpenAI 兼容 / Mock），并加重试包装
pub fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    let provider = cfg.llm.provider.to_lowercase();
    let has_key = std::env::var("OPENAI_API_KEY").is_ok();

    let inner: Arc<dyn LlmClient> = if provider == "openai" && has_key {
        tracing::info!("Using OpenAI-compatible LLM ({})", cfg.llm.model);
        Arc::new(OpenAiClient::new(
            cfg.llm.base_url.as_deref(),
            &cfg.llm.model,
            std::env::var("OPENAI_API_KEY").ok().as_deref(),
        ))
    } else {
        tracing::warn!("No API key set or provider unknown, using Mock LLM");
        Arc::new(MockLlmClient)
    };

    Arc::new(RetryingLlmClient::new(
        inner,
        RetryConfig {
            max_retries: cfg.llm.retry.max_retries,
            backoff_ms: cfg.llm.retry.backoff_ms,
        },
    ))
}

/// 评审门模型：配置了独立 review_model 时单独实例化，否则复用主模型
fn create_review_llm(cfg: &AppConfig, main: &Arc<dyn LlmClient>) -> Arc<dyn LlmClient> {
    match (&cfg.llm.review_model, std::env::var("OPENAI_API_KEY").ok()) {
        (Some(model), Some(key)) => Arc::new(OpenAiClient::new(
            cfg.llm.base_url.as_deref(),
            model,
            Some(&key),
        )),
        _ => main.clone(),
    }
}

/// 无头运行时：编排器 + 默认组件装配
pub struct Hive {
    orchestrator: Orchestrator,
}

impl Hive {
    /// 默认装配：配置驱动的 LLM、内存工件存储、配置目录决定的会话后端、echo 工具
    pub fn from_config(cfg: AppConfig) -> Result<Self, OrchestratorError> {
        let llm = create_llm_from_config(&cfg);
        let review_llm = create_review_llm(&cfg, &llm);

        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);

        let store: Arc<dyn ArtifactStore> = Arc::new(InMemoryArtifactStore::new());
        Self::from_parts(cfg, llm, review_llm, registry, store)
    }

    /// 完整装配入口：部署方自带 LLM、工具与存储
    pub fn from_parts(
        cfg: AppConfig,
        llm: Arc<dyn LlmClient>,
        review_llm: Arc<dyn LlmClient>,
        registry: ToolRegistry,
        store: Arc<dyn ArtifactStore>,
    ) -> Result<Self, OrchestratorError> {
        let backend = create_session_backend(cfg.session.checkpoint_dir.as_deref());
        let facts = Arc::new(match &cfg.session.facts_dir {
            Some(dir) => FactsStore::with_dir(dir.clone()),
            None => FactsStore::in_memory(),
        });
        let sessions = SessionStateManager::new(backend, facts, cfg.app.max_context_turns);

        let orchestrator = Orchestrator::new(cfg, llm, review_llm, registry, store, sessions)?;
        Ok(Self { orchestrator })
    }

    /// 注册一个工作者角色
    pub fn with_worker(mut self, profile: WorkerProfile) -> Self {
        self.orchestrator = self.orchestrator.with_worker(profile);
        self
    }

    pub fn with_supervisor_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.orchestrator = self.orchestrator.with_supervisor_prompt(prompt);
        self
    }

    pub fn with_events(mut self, tx: UnboundedSender<OrchestratorEvent>) -> Self {
        self.orchestrator = self.orchestrator.with_events(tx);
        self
    }

    /// 处理一条入站请求
    pub async fn handle(&self, req: InboundRequest) -> RunOutcome {
        self.orchestrator.handle(req).await
    }

    /// 恢复挂起的会话（人工审批决策）
    pub async fn resume(&self, signal: ResumeSignal) -> RunOutcome {
        self.orchestrator.resume(signal).await
    }

    /// 在下一个路由边界取消
    pub fn cancel(&self) {
        self.orchestrator.cancel();
    }
}
