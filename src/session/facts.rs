//! 主体级长期事实
//!
//! 跨会话事实按 principal id 命名空间隔离，与会话 id 无关；
//! 只有监督者显式的 Remember 指令可以写入，工作者永远无法直接修改。
//! 新会话创建时只读合并进初始上下文。

use std::collections::HashMap;
use std::path::PathBuf;

use tokio::sync::RwLock;

use crate::core::OrchestratorError;

/// 事实存储：内存缓存 + 可选按主体落盘（每 principal 一个 JSON 文件）
pub struct FactsStore {
    dir: Option<PathBuf>,
    cache: RwLock<HashMap<String, Vec<String>>>,
}

impl FactsStore {
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_dir(dir: PathBuf) -> Self {
        Self {
            dir: Some(dir),
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn path_for(&self, principal_id: &str) -> Option<PathBuf> {
        self.dir
            .as_ref()
            .map(|d| d.join(format!("facts_{}.json", sanitize_principal_id(principal_id))))
    }

    /// 读取某主体的全部事实（优先缓存，其次磁盘）
    pub async fn facts_for(&self, principal_id: &str) -> Vec<String> {
        {
            let cache = self.cache.read().await;
            if let Some(facts) = cache.get(principal_id) {
                return facts.clone();
            }
        }

        let loaded = self
            .path_for(principal_id)
            .filter(|p| p.exists())
            .and_then(|p| std::fs::read_to_string(p).ok())
            .and_then(|data| serde_json::from_str::<Vec<String>>(&data).ok())
            .unwrap_or_default();

        self.cache
            .write()
            .await
            .insert(principal_id.to_string(), loaded.clone());
        loaded
    }

    /// 追加一条事实并持久化（仅监督者 Remember 指令调用）
    pub async fn remember(
        &self,
        principal_id: &str,
        fact: &str,
    ) -> Result<(), OrchestratorError> {
        let fact = fact.trim();
        if fact.is_empty() {
            return Ok(());
        }

        let mut cache = self.cache.write().await;
        let facts = cache.entry(principal_id.to_string()).or_default();
        if !facts.iter().any(|f| f == fact) {
            facts.push(fact.to_string());
        }

        if let Some(path) = self.path_for(principal_id) {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| OrchestratorError::Persistence(e.to_string()))?;
            }
            let data = serde_json::to_string_pretty(&facts)
                .map_err(|e| OrchestratorError::Persistence(e.to_string()))?;
            std::fs::write(path, data)
                .map_err(|e| OrchestratorError::Persistence(e.to_string()))?;
        }
        Ok(())
    }
}

/// 清理 principal id 中的特殊字符用于文件名
fn sanitize_principal_id(principal_id: &str) -> String {
    principal_id
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_principal_isolation() {
        let store = FactsStore::in_memory();
        store.remember("alice", "prefers short answers").await.unwrap();
        store.remember("bob", "works in UTC+8").await.unwrap();

        assert_eq!(store.facts_for("alice").await, vec!["prefers short answers"]);
        assert_eq!(store.facts_for("bob").await, vec!["works in UTC+8"]);
        assert!(store.facts_for("carol").await.is_empty());
    }

    #[tokio::test]
    async fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FactsStore::with_dir(dir.path().to_path_buf());
        store.remember("alice@corp", "fact one").await.unwrap();

        // 新实例从磁盘读取
        let reloaded = FactsStore::with_dir(dir.path().to_path_buf());
        assert_eq!(reloaded.facts_for("alice@corp").await, vec!["fact one"]);
    }

    #[test]
    fn test_sanitize_principal_id() {
        assert_eq!(sanitize_principal_id("user@example.com"), "user_example_com");
        assert_eq!(sanitize_principal_id("user-123_abc"), "user-123_abc");
    }
}
