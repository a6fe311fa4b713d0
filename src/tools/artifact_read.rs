//! 工件读取工具
//!
//! 工作者通过 key 读取播种给它的工件内容，使上一跳的产出以引用方式进入
//! 本跳上下文，而不是把负载塞进委派消息。只能读到委派时显式播种的 key。

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::store::ArtifactStore;
use crate::tools::Tool;

/// 按 key 读取工件；委派未播种的 key 一律拒绝（隔离约束）
pub struct ArtifactReadTool {
    store: Arc<dyn ArtifactStore>,
    readable: HashSet<String>,
}

impl ArtifactReadTool {
    pub fn new(store: Arc<dyn ArtifactStore>, readable: impl IntoIterator<Item = String>) -> Self {
        Self {
            store,
            readable: readable.into_iter().collect(),
        }
    }
}

#[async_trait]
impl Tool for ArtifactReadTool {
    fn name(&self) -> &str {
        "artifact_read"
    }

    fn description(&self) -> &str {
        "Read a shared artifact by key. Args: {\"key\": \"notes_1\"}"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "key": { "type": "string", "description": "artifact key" }
            },
            "required": ["key"]
        })
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let key = args
            .get("key")
            .and_then(|v| v.as_str())
            .ok_or_else(|| "missing 'key' argument".to_string())?;
        if !self.readable.contains(key) {
            return Err(format!("artifact '{}' not seeded for this task", key));
        }
        self.store
            .read(key)
            .map(|a| a.content)
            .ok_or_else(|| format!("artifact '{}' not found", key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryArtifactStore;

    #[tokio::test]
    async fn test_reads_only_seeded_keys() {
        let store = Arc::new(InMemoryArtifactStore::new());
        store.write("notes_1", "findings", "research");
        store.write("secret", "hidden", "supervisor");

        let tool = ArtifactReadTool::new(store, vec!["notes_1".to_string()]);
        let ok = tool
            .execute(serde_json::json!({"key": "notes_1"}))
            .await
            .unwrap();
        assert_eq!(ok, "findings");

        let denied = tool.execute(serde_json::json!({"key": "secret"})).await;
        assert!(denied.is_err());
    }
}
