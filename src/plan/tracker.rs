//! 计划追踪
//!
//! 监督者声明的任务分解与逐项状态。记录计划不会触发任何执行，
//! 推进永远由监督者决策驱动；条目只追加、只改状态，从不删除。

use serde::{Deserialize, Serialize};

use crate::core::OrchestratorError;

/// 计划条目状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// 单个计划条目
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlanItem {
    pub id: String,
    pub description: String,
    pub status: ItemStatus,
    /// 承接该条目的工作者名（委派后填入）
    pub owner: Option<String>,
    /// 产出工件 key（完成后填入）
    pub output_ref: Option<String>,
}

impl PlanItem {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            status: ItemStatus::Pending,
            owner: None,
            output_ref: None,
        }
    }
}

/// 有序计划；每会话一份，工作者只读
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Plan {
    pub items: Vec<PlanItem>,
}

impl Plan {
    pub fn get(&self, item_id: &str) -> Option<&PlanItem> {
        self.items.iter().find(|i| i.id == item_id)
    }

    /// 正在执行的条目数；顺序模式下恒 ≤ 1，scatter-gather 下等于并发委派数
    pub fn in_progress_count(&self) -> usize {
        self.items
            .iter()
            .filter(|i| i.status == ItemStatus::InProgress)
            .count()
    }

    /// 人类可读摘要（对外结果与监督者 system prompt 共用）
    pub fn summary(&self) -> String {
        self.items
            .iter()
            .map(|i| {
                format!(
                    "[{}] {:?} {}{}",
                    i.id,
                    i.status,
                    i.description,
                    i.output_ref
                        .as_deref()
                        .map(|r| format!(" -> {}", r))
                        .unwrap_or_default()
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// 计划追踪器：record_plan / update_status / read_plan，纯簿记
#[derive(Clone, Debug, Default)]
pub struct PlanTracker {
    plan: Plan,
}

impl PlanTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_plan(plan: Plan) -> Self {
        Self { plan }
    }

    /// 追加一批条目；已有条目不受影响（条目从不删除）
    pub fn record_plan(&mut self, items: Vec<PlanItem>) {
        self.plan.items.extend(items);
    }

    /// 更新条目状态；未知 id 返回 UnknownPlanItem。幂等：
    /// 相同参数重复调用与调用一次等价。
    pub fn update_status(
        &mut self,
        item_id: &str,
        status: ItemStatus,
        output_ref: Option<String>,
    ) -> Result<(), OrchestratorError> {
        let item = self
            .plan
            .items
            .iter_mut()
            .find(|i| i.id == item_id)
            .ok_or_else(|| OrchestratorError::UnknownPlanItem(item_id.to_string()))?;
        item.status = status;
        if output_ref.is_some() {
            item.output_ref = output_ref;
        }
        Ok(())
    }

    /// 委派时登记承接者
    pub fn assign_owner(
        &mut self,
        item_id: &str,
        owner: &str,
    ) -> Result<(), OrchestratorError> {
        let item = self
            .plan
            .items
            .iter_mut()
            .find(|i| i.id == item_id)
            .ok_or_else(|| OrchestratorError::UnknownPlanItem(item_id.to_string()))?;
        item.owner = Some(owner.to_string());
        Ok(())
    }

    pub fn read_plan(&self) -> &Plan {
        &self.plan
    }

    /// 取消会话时将所有 in_progress 条目标记 failed
    pub fn fail_in_progress(&mut self) {
        for item in &mut self.plan.items {
            if item.status == ItemStatus::InProgress {
                item.status = ItemStatus::Failed;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_item_rejected() {
        let mut tracker = PlanTracker::new();
        let err = tracker
            .update_status("nope", ItemStatus::Completed, None)
            .unwrap_err();
        assert_eq!(err.kind(), "unknown_plan_item");
    }

    #[test]
    fn test_update_status_idempotent() {
        let mut tracker = PlanTracker::new();
        tracker.record_plan(vec![PlanItem::new("t1", "research topic")]);
        tracker
            .update_status("t1", ItemStatus::Completed, Some("notes_1".into()))
            .unwrap();
        let first = tracker.read_plan().clone();
        tracker
            .update_status("t1", ItemStatus::Completed, Some("notes_1".into()))
            .unwrap();
        let second = tracker.read_plan();
        assert_eq!(first.items[0].status, second.items[0].status);
        assert_eq!(first.items[0].output_ref, second.items[0].output_ref);
    }

    #[test]
    fn test_record_plan_is_pure_bookkeeping() {
        let mut tracker = PlanTracker::new();
        tracker.record_plan(vec![
            PlanItem::new("t1", "step one"),
            PlanItem::new("t2", "step two"),
        ]);
        // 记录后无任何条目被推进
        assert!(tracker
            .read_plan()
            .items
            .iter()
            .all(|i| i.status == ItemStatus::Pending));
        assert_eq!(tracker.read_plan().in_progress_count(), 0);
    }

    #[test]
    fn test_fail_in_progress_on_cancel() {
        let mut tracker = PlanTracker::new();
        tracker.record_plan(vec![PlanItem::new("t1", "step")]);
        tracker
            .update_status("t1", ItemStatus::InProgress, None)
            .unwrap();
        tracker.fail_in_progress();
        assert_eq!(tracker.read_plan().items[0].status, ItemStatus::Failed);
    }
}
