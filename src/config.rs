//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__ROUTER__STRATEGY=conditional`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub router: RouterSection,
    #[serde(default)]
    pub worker: WorkerSection,
    #[serde(default)]
    pub review: ReviewSection,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub tools: ToolsSection,
    #[serde(default)]
    pub session: SessionSection,
}

/// [app] 段：应用名、监督者对话轮数上限
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    pub name: Option<String>,
    /// 监督者对话历史保留轮数
    #[serde(default = "default_max_context_turns")]
    pub max_context_turns: usize,
}

fn default_max_context_turns() -> usize {
    20
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            max_context_turns: default_max_context_turns(),
        }
    }
}

/// [router] 段：路由策略与会话级总步数上限
#[derive(Debug, Clone, Deserialize)]
pub struct RouterSection {
    /// deterministic（监督者显式 goto）/ conditional（按指令类型查表）
    #[serde(default = "default_strategy")]
    pub strategy: String,
    /// 整个会话允许的最大路由步数，超出即 RecursionBudgetExceeded
    #[serde(default = "default_max_total_steps")]
    pub max_total_steps: u64,
}

fn default_strategy() -> String {
    "deterministic".to_string()
}

fn default_max_total_steps() -> u64 {
    50
}

impl Default for RouterSection {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            max_total_steps: default_max_total_steps(),
        }
    }
}

/// [worker] 段：单个工作者循环的步数预算、墙钟超时与工具失败上限
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSection {
    /// 单次委派内最大 模型调用⇄工具调用 迭代数（硬上限）
    #[serde(default = "default_step_budget")]
    pub step_budget: usize,
    /// 单次委派的墙钟超时（秒），独立于步数预算
    #[serde(default = "default_wall_clock_secs")]
    pub wall_clock_secs: u64,
    /// 同一工具连续相同失败多少次后终止工作者
    #[serde(default = "default_tool_failure_limit")]
    pub tool_failure_limit: usize,
    /// 调用前需要人工审批的工具名（human-in-the-loop）
    #[serde(default)]
    pub approval_required: Vec<String>,
}

fn default_step_budget() -> usize {
    25
}

fn default_wall_clock_secs() -> u64 {
    300
}

fn default_tool_failure_limit() -> usize {
    3
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            step_budget: default_step_budget(),
            wall_clock_secs: default_wall_clock_secs(),
            tool_failure_limit: default_tool_failure_limit(),
            approval_required: Vec::new(),
        }
    }
}

/// [review] 段：评审门重试上限与默认质量标准
#[derive(Debug, Clone, Deserialize)]
pub struct ReviewSection {
    /// 评审被拒后同一 PlanItem 最多重新委派次数，超出即标记 failed
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    /// 监督者未显式给出标准时使用的默认质量标准
    #[serde(default = "default_criteria")]
    pub criteria: Vec<String>,
    /// 评审 prompt 模板，占位符 {criteria} / {artifact}
    #[serde(default = "default_review_prompt")]
    pub prompt_template: String,
}

fn default_max_retries() -> usize {
    3
}

fn default_criteria() -> Vec<String> {
    vec![
        "完整回答了任务要求".into(),
        "内容自洽，无明显事实矛盾".into(),
    ]
}

fn default_review_prompt() -> String {
    "You are an independent reviewer. Criteria:\n{criteria}\n\nArtifact:\n{artifact}\n\n\
     Respond with exactly one JSON object: {\"accepted\": true} or \
     {\"accepted\": false, \"feedback\": \"one short sentence\"}."
        .to_string()
}

impl Default for ReviewSection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            criteria: default_criteria(),
            prompt_template: default_review_prompt(),
        }
    }
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：openai / mock；无 API Key 时自动退到 mock
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    /// 评审门可用独立模型，未设置时与主模型相同
    pub review_model: Option<String>,
    #[serde(default)]
    pub retry: LlmRetrySection,
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            review_model: None,
            retry: LlmRetrySection::default(),
        }
    }
}

/// [llm.retry] 段：外部模型调用的重试策略
#[derive(Debug, Clone, Deserialize)]
pub struct LlmRetrySection {
    #[serde(default = "default_llm_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_llm_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_llm_max_retries() -> usize {
    2
}

fn default_llm_backoff_ms() -> u64 {
    500
}

impl Default for LlmRetrySection {
    fn default() -> Self {
        Self {
            max_retries: default_llm_max_retries(),
            backoff_ms: default_llm_backoff_ms(),
        }
    }
}

/// [tools] 段：单次工具调用超时
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
}

fn default_tool_timeout_secs() -> u64 {
    30
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: default_tool_timeout_secs(),
        }
    }
}

/// [session] 段：检查点与长期事实的落盘目录（未设置时使用内存后端）
#[derive(Debug, Clone, Deserialize, Default)]
pub struct SessionSection {
    /// 会话检查点目录，每会话一个 JSON 文件
    pub checkpoint_dir: Option<PathBuf>,
    /// 主体级长期事实目录，每 principal 一个 JSON 文件
    pub facts_dir: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            app: AppSection::default(),
            router: RouterSection::default(),
            worker: WorkerSection::default(),
            review: ReviewSection::default(),
            llm: LlmSection::default(),
            tools: ToolsSection::default(),
            session: SessionSection::default(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.router.strategy, "deterministic");
        assert_eq!(cfg.router.max_total_steps, 50);
        assert_eq!(cfg.worker.step_budget, 25);
        assert_eq!(cfg.worker.tool_failure_limit, 3);
        assert_eq!(cfg.review.max_retries, 3);
    }
}
