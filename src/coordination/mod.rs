//! 多实例任务协调：计划文档、认领、验证门与恢复

pub mod branch;
pub mod coordinator;
pub mod document;
pub mod gates;
pub mod plan;
pub mod recovery;

pub use branch::{find_task_branch, is_task_branch, slugify, task_branch_name};
pub use coordinator::{
    build_task_prompt, ClaimedTask, CoordinatorSettings, PlanSnapshot, TaskCoordinator, TaskResult,
};
pub use document::{PlanStore, WriteOutcome};
pub use gates::{run_gates, Gate, GateContext, GateFailure, GateReport, FULL_CHAIN, RESUME_CHAIN};
pub use plan::{ExtraSection, Plan, PlanRef, SectionAnchor, Task, TaskStatus};
pub use recovery::{
    live_task_keys, needs_recovery, RecoveryPolicy, RecoveryReport, StuckTaskEntry,
    StuckTaskTracker,
};
