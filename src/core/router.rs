//! 路由状态机
//!
//! 每个回合之后决定下一个执行者：SUPERVISOR / WORKER(name) / REVIEW / TERMINATED。
//! 两种策略：deterministic（监督者显式点名下一状态，委派必须附带占位结果）、
//! conditional（按指令类型查表，所有中间指令一律回到 SUPERVISOR）。
//! 每次转移步数计数器单调递增并记录日志；总步数超限即 RecursionBudgetExceeded。
//! WORKER 只能从 SUPERVISOR 进入，工作者与评审门完成后必回 SUPERVISOR。

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::core::OrchestratorError;

/// 路由状态
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouterState {
    Supervisor,
    /// 单委派时为工作者名；scatter-gather 时为逗号连接的名单
    Worker(String),
    Review,
    Terminated,
}

impl std::fmt::Display for RouterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Supervisor => write!(f, "SUPERVISOR"),
            Self::Worker(name) => write!(f, "WORKER({})", name),
            Self::Review => write!(f, "REVIEW"),
            Self::Terminated => write!(f, "TERMINATED"),
        }
    }
}

/// 路由策略
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoutingStrategy {
    /// 监督者输出显式点名下一状态；路由器只校验目标存在与占位结果
    Deterministic,
    /// 按最近一回合的指令类型查表；对小幅 prompt 漂移更稳健
    Conditional,
}

impl RoutingStrategy {
    pub fn from_name(name: &str) -> Result<Self, OrchestratorError> {
        match name {
            "deterministic" => Ok(Self::Deterministic),
            "conditional" => Ok(Self::Conditional),
            other => Err(OrchestratorError::ConfigError(format!(
                "unknown routing strategy: {}",
                other
            ))),
        }
    }
}

/// 监督者回合产出的路由信号（封闭枚举）
#[derive(Clone, Debug)]
pub enum SupervisorSignal {
    /// 记录了计划（中间指令，回到监督者）
    PlanRecorded,
    /// 写入了长期事实（中间指令，回到监督者）
    FactRecorded,
    /// 委派；workers 为目标工作者名，placeholders 表示占位结果是否齐全
    Delegated {
        workers: Vec<String>,
        placeholders: bool,
    },
    /// 请求评审
    ReviewRequested,
    /// 结束
    Finished,
}

/// 路由器消费的回合产出
#[derive(Clone, Debug)]
pub enum TurnOutput {
    Supervisor(SupervisorSignal),
    /// 工作者（或 scatter-gather 的全部工作者）正常完成
    WorkerDone,
    /// 工作者以委派失败告终（预算耗尽、工具反复失败等）
    WorkerFailed,
    ReviewDone,
}

/// 一次转移的审计记录
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub step: u64,
    pub from: String,
    pub to: String,
    pub at: i64,
}

/// 状态机本体：当前状态、单调步数计数器、转移日志与已注册工作者集合
pub struct Router {
    state: RouterState,
    step: u64,
    max_total_steps: u64,
    strategy: RoutingStrategy,
    known_workers: HashSet<String>,
    log: Vec<TransitionRecord>,
}

impl Router {
    pub fn new(
        strategy: RoutingStrategy,
        max_total_steps: u64,
        known_workers: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            state: RouterState::Supervisor,
            step: 0,
            max_total_steps,
            strategy,
            known_workers: known_workers.into_iter().collect(),
            log: Vec::new(),
        }
    }

    /// 从检查点恢复：状态与步数计数器接着最后一次转移继续
    pub fn restore(
        strategy: RoutingStrategy,
        max_total_steps: u64,
        known_workers: impl IntoIterator<Item = String>,
        state: RouterState,
        step: u64,
    ) -> Self {
        let mut router = Self::new(strategy, max_total_steps, known_workers);
        router.state = state;
        router.step = step;
        router
    }

    pub fn state(&self) -> &RouterState {
        &self.state
    }

    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn log(&self) -> &[TransitionRecord] {
        &self.log
    }

    /// 校验委派目标存在
    fn validate_workers(&self, workers: &[String]) -> Result<(), OrchestratorError> {
        for w in workers {
            if !self.known_workers.contains(w) {
                return Err(OrchestratorError::MalformedHandoff(format!(
                    "unknown worker '{}'",
                    w
                )));
            }
        }
        if workers.is_empty() {
            return Err(OrchestratorError::MalformedHandoff(
                "delegation names no worker".to_string(),
            ));
        }
        Ok(())
    }

    /// 由监督者信号得出下一状态
    ///
    /// conditional 模式的关键约束：每个中间指令（Plan / Remember）都必须映射回
    /// Supervisor，否则工作流在第一次工具调用后静默截断。
    fn next_for_supervisor(
        &self,
        signal: &SupervisorSignal,
    ) -> Result<RouterState, OrchestratorError> {
        match signal {
            SupervisorSignal::PlanRecorded | SupervisorSignal::FactRecorded => {
                Ok(RouterState::Supervisor)
            }
            SupervisorSignal::Delegated {
                workers,
                placeholders,
            } => {
                self.validate_workers(workers)?;
                if self.strategy == RoutingStrategy::Deterministic && !placeholders {
                    // 历史上最常见的集成错误：缺占位结果的委派
                    return Err(OrchestratorError::MalformedHandoff(
                        "delegation without synthesized placeholder result".to_string(),
                    ));
                }
                Ok(RouterState::Worker(workers.join(",")))
            }
            SupervisorSignal::ReviewRequested => Ok(RouterState::Review),
            SupervisorSignal::Finished => Ok(RouterState::Terminated),
        }
    }

    /// 执行一次转移；返回新状态。总步数超限返回 RecursionBudgetExceeded（上报调用方，不重试）。
    pub fn transition(&mut self, output: TurnOutput) -> Result<RouterState, OrchestratorError> {
        let next = match (&self.state, &output) {
            (RouterState::Supervisor, TurnOutput::Supervisor(signal)) => {
                self.next_for_supervisor(signal)?
            }
            // 工作者与评审门永远回到监督者，不互相转移也不直接终止
            (RouterState::Worker(_), TurnOutput::WorkerDone)
            | (RouterState::Worker(_), TurnOutput::WorkerFailed)
            | (RouterState::Review, TurnOutput::ReviewDone) => RouterState::Supervisor,
            (state, output) => {
                return Err(OrchestratorError::MalformedHandoff(format!(
                    "turn output {:?} not valid in state {}",
                    output, state
                )));
            }
        };

        self.step += 1;
        if self.step > self.max_total_steps {
            return Err(OrchestratorError::RecursionBudgetExceeded {
                max_steps: self.max_total_steps,
            });
        }

        let record = TransitionRecord {
            step: self.step,
            from: self.state.to_string(),
            to: next.to_string(),
            at: chrono::Utc::now().timestamp_millis(),
        };
        tracing::info!(
            step = record.step,
            from = %record.from,
            to = %record.to,
            "route"
        );
        self.log.push(record);
        self.state = next.clone();
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router(strategy: RoutingStrategy) -> Router {
        Router::new(
            strategy,
            50,
            vec!["research".to_string(), "writer".to_string()],
        )
    }

    fn delegated(workers: &[&str], placeholders: bool) -> TurnOutput {
        TurnOutput::Supervisor(SupervisorSignal::Delegated {
            workers: workers.iter().map(|s| s.to_string()).collect(),
            placeholders,
        })
    }

    #[test]
    fn test_worker_only_reachable_from_supervisor() {
        let mut r = router(RoutingStrategy::Deterministic);
        r.transition(delegated(&["research"], true)).unwrap();
        assert_eq!(r.state(), &RouterState::Worker("research".into()));
        // 工作者状态下不接受监督者信号
        assert!(r.transition(delegated(&["writer"], true)).is_err());
    }

    #[test]
    fn test_worker_returns_to_supervisor() {
        let mut r = router(RoutingStrategy::Deterministic);
        r.transition(delegated(&["research"], true)).unwrap();
        let next = r.transition(TurnOutput::WorkerDone).unwrap();
        assert_eq!(next, RouterState::Supervisor);
    }

    #[test]
    fn test_missing_placeholder_is_malformed_handoff() {
        let mut r = router(RoutingStrategy::Deterministic);
        let err = r.transition(delegated(&["research"], false)).unwrap_err();
        assert_eq!(err.kind(), "malformed_handoff");
    }

    #[test]
    fn test_conditional_allows_missing_placeholder() {
        let mut r = router(RoutingStrategy::Conditional);
        r.transition(delegated(&["research"], false)).unwrap();
        assert_eq!(r.state(), &RouterState::Worker("research".into()));
    }

    #[test]
    fn test_unknown_worker_rejected() {
        let mut r = router(RoutingStrategy::Deterministic);
        let err = r.transition(delegated(&["nonexistent"], true)).unwrap_err();
        assert_eq!(err.kind(), "malformed_handoff");
    }

    #[test]
    fn test_intermediate_directives_return_to_supervisor() {
        let mut r = router(RoutingStrategy::Conditional);
        r.transition(TurnOutput::Supervisor(SupervisorSignal::PlanRecorded))
            .unwrap();
        assert_eq!(r.state(), &RouterState::Supervisor);
        r.transition(TurnOutput::Supervisor(SupervisorSignal::FactRecorded))
            .unwrap();
        assert_eq!(r.state(), &RouterState::Supervisor);
    }

    #[test]
    fn test_step_counter_strictly_increases() {
        let mut r = router(RoutingStrategy::Deterministic);
        let mut last = r.step();
        for _ in 0..3 {
            r.transition(delegated(&["research"], true)).unwrap();
            assert!(r.step() > last);
            last = r.step();
            r.transition(TurnOutput::WorkerDone).unwrap();
            assert!(r.step() > last);
            last = r.step();
        }
        assert_eq!(r.log().len(), 6);
    }

    #[test]
    fn test_recursion_budget_exceeded() {
        let mut r = Router::new(
            RoutingStrategy::Deterministic,
            4,
            vec!["research".to_string()],
        );
        let mut steps = 0;
        let err = loop {
            if let Err(e) = r.transition(delegated(&["research"], true)) {
                break e;
            }
            steps += 1;
            if let Err(e) = r.transition(TurnOutput::WorkerDone) {
                break e;
            }
            steps += 1;
        };
        assert_eq!(err.kind(), "recursion_budget_exceeded");
        assert!(steps <= 4);
    }

    #[test]
    fn test_review_roundtrip() {
        let mut r = router(RoutingStrategy::Deterministic);
        r.transition(TurnOutput::Supervisor(SupervisorSignal::ReviewRequested))
            .unwrap();
        assert_eq!(r.state(), &RouterState::Review);
        let next = r.transition(TurnOutput::ReviewDone).unwrap();
        assert_eq!(next, RouterState::Supervisor);
    }
}
