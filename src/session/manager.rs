//! 会话存储与检查点
//!
//! 定义统一的会话持久化接口，支持内存和文件两种实现；每次路由转移后
//! checkpoint，进程重启从最后一次转移恢复而不是从头开始。

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::core::{OrchestratorError, RouterState};
use crate::session::{FactsStore, SessionState};

/// 会话持久化接口
#[async_trait]
pub trait SessionBackend: Send + Sync {
    /// 写入一份完整状态快照
    async fn checkpoint(&self, state: &SessionState) -> Result<(), OrchestratorError>;

    /// 按会话 id 读取最近的快照
    async fn load(&self, session_id: &str) -> Result<Option<SessionState>, OrchestratorError>;
}

/// 内存会话存储
#[derive(Default)]
pub struct MemorySessionBackend {
    sessions: RwLock<std::collections::HashMap<String, SessionState>>,
}

impl MemorySessionBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionBackend for MemorySessionBackend {
    async fn checkpoint(&self, state: &SessionState) -> Result<(), OrchestratorError> {
        self.sessions
            .write()
            .await
            .insert(state.session_id.clone(), state.clone());
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<Option<SessionState>, OrchestratorError> {
        Ok(self.sessions.read().await.get(session_id).cloned())
    }
}

/// 文件会话存储：每会话一个 JSON 文件
pub struct FileSessionBackend {
    dir: PathBuf,
}

impl FileSessionBackend {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        let safe: String = session_id
            .chars()
            .map(|c| {
                if c.is_alphanumeric() || c == '_' || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("session_{}.json", safe))
    }
}

#[async_trait]
impl SessionBackend for FileSessionBackend {
    async fn checkpoint(&self, state: &SessionState) -> Result<(), OrchestratorError> {
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| OrchestratorError::Persistence(e.to_string()))?;
        let data = serde_json::to_string_pretty(state)
            .map_err(|e| OrchestratorError::Persistence(e.to_string()))?;
        std::fs::write(self.path_for(&state.session_id), data)
            .map_err(|e| OrchestratorError::Persistence(e.to_string()))?;
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<Option<SessionState>, OrchestratorError> {
        let path = self.path_for(session_id);
        if !path.exists() {
            return Ok(None);
        }
        let data = std::fs::read_to_string(path)
            .map_err(|e| OrchestratorError::Persistence(e.to_string()))?;
        let state = serde_json::from_str(&data)
            .map_err(|e| OrchestratorError::Persistence(e.to_string()))?;
        Ok(Some(state))
    }
}

/// 创建会话后端：给定目录则落盘，否则内存
pub fn create_session_backend(dir: Option<&Path>) -> Arc<dyn SessionBackend> {
    match dir {
        Some(d) => {
            tracing::info!("Using file session backend: {:?}", d);
            Arc::new(FileSessionBackend::new(d))
        }
        None => {
            tracing::info!("Using in-memory session backend");
            Arc::new(MemorySessionBackend::new())
        }
    }
}

/// 会话状态管理器：load-or-create、检查点、长期事实的只读合并
pub struct SessionStateManager {
    backend: Arc<dyn SessionBackend>,
    facts: Arc<FactsStore>,
    max_turns: usize,
}

impl SessionStateManager {
    pub fn new(backend: Arc<dyn SessionBackend>, facts: Arc<FactsStore>, max_turns: usize) -> Self {
        Self {
            backend,
            facts,
            max_turns,
        }
    }

    /// 加载已有会话或新建；返回 (状态, 该主体的长期事实, 是否新建)。
    /// 崩溃恢复：快照的路由状态若停在 Worker / Review 且无挂起工作者，
    /// 降级回 Supervisor，从最后一次转移继续。
    pub async fn load_or_create(
        &self,
        session_id: &str,
        principal_id: &str,
    ) -> Result<(SessionState, Vec<String>, bool), OrchestratorError> {
        let facts = self.facts.facts_for(principal_id).await;
        match self.backend.load(session_id).await? {
            Some(mut state) => {
                if state.active_worker.is_none()
                    && !matches!(state.router_state, RouterState::Supervisor)
                {
                    tracing::warn!(
                        session = session_id,
                        "checkpoint stopped mid-step, resuming at supervisor"
                    );
                    state.router_state = RouterState::Supervisor;
                }
                Ok((state, facts, false))
            }
            None => Ok((
                SessionState::fresh(session_id, principal_id, self.max_turns),
                facts,
                true,
            )),
        }
    }

    /// 只读已有会话（恢复信号用；不存在不会新建）
    pub async fn load(
        &self,
        session_id: &str,
    ) -> Result<Option<SessionState>, OrchestratorError> {
        self.backend.load(session_id).await
    }

    /// 写检查点（更新时间戳后整体落盘）
    pub async fn checkpoint(&self, state: &mut SessionState) -> Result<(), OrchestratorError> {
        state.updated_at = chrono::Utc::now().timestamp_millis();
        self.backend.checkpoint(state).await
    }

    /// 监督者 Remember 指令的唯一入口
    pub async fn remember(
        &self,
        principal_id: &str,
        fact: &str,
    ) -> Result<(), OrchestratorError> {
        self.facts.remember(principal_id, fact).await
    }

    pub fn max_turns(&self) -> usize {
        self.max_turns
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_load_or_create_fresh_then_existing() {
        let manager = SessionStateManager::new(
            Arc::new(MemorySessionBackend::new()),
            Arc::new(FactsStore::in_memory()),
            20,
        );
        let (mut state, _, fresh) = manager.load_or_create("s1", "alice").await.unwrap();
        assert!(fresh);

        state.step_counter = 7;
        manager.checkpoint(&mut state).await.unwrap();

        let (loaded, _, fresh) = manager.load_or_create("s1", "alice").await.unwrap();
        assert!(!fresh);
        assert_eq!(loaded.step_counter, 7);
    }

    #[tokio::test]
    async fn test_file_backend_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileSessionBackend::new(dir.path());
        let mut state = SessionState::fresh("s2", "bob", 20);
        state.step_counter = 3;
        backend.checkpoint(&state).await.unwrap();

        let other = FileSessionBackend::new(dir.path());
        let loaded = other.load("s2").await.unwrap().unwrap();
        assert_eq!(loaded.step_counter, 3);
        assert_eq!(loaded.principal_id, "bob");
    }

    #[tokio::test]
    async fn test_mid_step_checkpoint_degrades_to_supervisor() {
        let manager = SessionStateManager::new(
            Arc::new(MemorySessionBackend::new()),
            Arc::new(FactsStore::in_memory()),
            20,
        );
        let (mut state, _, _) = manager.load_or_create("s3", "carol").await.unwrap();
        state.router_state = RouterState::Worker("research".into());
        manager.checkpoint(&mut state).await.unwrap();

        let (loaded, _, _) = manager.load_or_create("s3", "carol").await.unwrap();
        assert_eq!(loaded.router_state, RouterState::Supervisor);
    }
}
