//! 共享工件存储
//!
//! 会话命名空间内的 key/value 存储：write 产生单调递增版本，旧版本保留可审计；
//! 不做物理删除，逻辑删除写 tombstone。大负载只经此通道流转，
//! 智能体之间的消息只携带 key。

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

/// 一次写入产生的工件版本
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Artifact {
    pub key: String,
    pub content: String,
    /// 写入者标识（supervisor / worker 名）
    pub written_by: String,
    /// 键内单调递增，从 1 开始
    pub version: u64,
    /// 逻辑删除标记
    pub tombstone: bool,
    pub written_at: i64,
}

/// 工件存储接口；单键单写者由 Router 通过 DelegationRequest 的 key 唯一性保证，存储自身不加锁约束
pub trait ArtifactStore: Send + Sync {
    /// 写入内容，返回新版本号
    fn write(&self, key: &str, content: &str, written_by: &str) -> u64;

    /// 读取最新版本；不存在或已 tombstone 时返回 None
    fn read(&self, key: &str) -> Option<Artifact>;

    /// 按前缀枚举存活的 key（有序）
    fn list(&self, prefix: &str) -> Vec<String>;

    /// 某个 key 的全部历史版本（含 tombstone），用于审计
    fn history(&self, key: &str) -> Vec<Artifact>;

    /// 逻辑删除：追加一条 tombstone 版本
    fn tombstone(&self, key: &str, written_by: &str) -> u64;

    /// 所有存活 key 的最新版本快照（检查点与最终结果用）
    fn snapshot(&self) -> Vec<Artifact>;

    /// 从检查点快照恢复（恢复为各 key 的当前版本，历史不回放）
    fn restore(&self, artifacts: Vec<Artifact>);
}

/// 内存实现：每 key 一条版本链
#[derive(Clone, Default)]
pub struct InMemoryArtifactStore {
    entries: Arc<RwLock<HashMap<String, Vec<Artifact>>>>,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn append(&self, key: &str, content: &str, written_by: &str, tombstone: bool) -> u64 {
        let mut entries = self.entries.write().unwrap();
        let chain = entries.entry(key.to_string()).or_default();
        let version = chain.last().map(|a| a.version).unwrap_or(0) + 1;
        chain.push(Artifact {
            key: key.to_string(),
            content: content.to_string(),
            written_by: written_by.to_string(),
            version,
            tombstone,
            written_at: chrono::Utc::now().timestamp_millis(),
        });
        version
    }
}

impl ArtifactStore for InMemoryArtifactStore {
    fn write(&self, key: &str, content: &str, written_by: &str) -> u64 {
        self.append(key, content, written_by, false)
    }

    fn read(&self, key: &str) -> Option<Artifact> {
        let entries = self.entries.read().unwrap();
        entries
            .get(key)
            .and_then(|chain| chain.last())
            .filter(|a| !a.tombstone)
            .cloned()
    }

    fn list(&self, prefix: &str) -> Vec<String> {
        let entries = self.entries.read().unwrap();
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(k, chain)| {
                k.starts_with(prefix) && chain.last().map(|a| !a.tombstone).unwrap_or(false)
            })
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    fn history(&self, key: &str) -> Vec<Artifact> {
        let entries = self.entries.read().unwrap();
        entries.get(key).cloned().unwrap_or_default()
    }

    fn tombstone(&self, key: &str, written_by: &str) -> u64 {
        self.append(key, "", written_by, true)
    }

    fn snapshot(&self) -> Vec<Artifact> {
        let entries = self.entries.read().unwrap();
        let mut heads: Vec<Artifact> = entries
            .values()
            .filter_map(|chain| chain.last())
            .filter(|a| !a.tombstone)
            .cloned()
            .collect();
        heads.sort_by(|a, b| a.key.cmp(&b.key));
        heads
    }

    fn restore(&self, artifacts: Vec<Artifact>) {
        let mut entries = self.entries.write().unwrap();
        entries.clear();
        for artifact in artifacts {
            entries
                .entry(artifact.key.clone())
                .or_default()
                .push(artifact);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_same_content() {
        let store = InMemoryArtifactStore::new();
        let v = store.write("notes_1", "hello world", "research");
        let got = store.read("notes_1").unwrap();
        assert_eq!(got.content, "hello world");
        assert!(got.version >= v);
    }

    #[test]
    fn test_versions_monotonic_and_history_retained() {
        let store = InMemoryArtifactStore::new();
        let v1 = store.write("draft", "first", "writer");
        let v2 = store.write("draft", "second", "writer");
        assert!(v2 > v1);
        assert_eq!(store.read("draft").unwrap().content, "second");
        let history = store.history("draft");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content, "first");
    }

    #[test]
    fn test_tombstone_hides_but_keeps_history() {
        let store = InMemoryArtifactStore::new();
        store.write("tmp", "data", "worker");
        store.tombstone("tmp", "supervisor");
        assert!(store.read("tmp").is_none());
        assert!(store.list("").is_empty());
        assert_eq!(store.history("tmp").len(), 2);
    }

    #[test]
    fn test_list_by_prefix() {
        let store = InMemoryArtifactStore::new();
        store.write("notes/1", "a", "w");
        store.write("notes/2", "b", "w");
        store.write("draft/1", "c", "w");
        assert_eq!(store.list("notes/"), vec!["notes/1", "notes/2"]);
    }
}
