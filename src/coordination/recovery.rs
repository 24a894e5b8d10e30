//! 卡住 / 孤儿任务恢复
//!
//! 卡住：claimed / in_progress 且有 assignee 的任务按首次观察时间计时，超过阈值且没有对应的开放 PR 时
//! 重置为 pending、清空 assignee 并评论说明。有开放 PR 则刷新计时。同一任务重置次数达到上限后永久跳过，
//! 并且只发一次「需要人工介入」通知。
//!
//! 孤儿：blocked 且无 assignee 的任务，在远端找对应分支（当前命名、历史命名、编号兜底）；
//! 分支存在但没有 PR 时重跑验证门 2–5，通过后由本实例开 PR 并完成任务。
//!
//! 跟踪表只在进程内存在，不持久化。

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};

use crate::config::RecoverySection;
use crate::coordination::branch::{find_task_branch, is_task_branch};
use crate::coordination::coordinator::{PlanSnapshot, TaskCoordinator};
use crate::coordination::document::WriteOutcome;
use crate::coordination::gates::{run_gates, GateContext, RESUME_CHAIN};
use crate::coordination::plan::{PlanRef, Task, TaskStatus};
use crate::core::{tolerate, HiveResult};
use crate::platform::{PrStateFilter, PullRequest};

#[derive(Debug, Clone)]
pub struct RecoveryPolicy {
    pub stuck_timeout: Duration,
    pub max_retries: u32,
    pub orphan_recheck: Duration,
}

impl RecoveryPolicy {
    pub fn from_config(cfg: &RecoverySection) -> Self {
        Self {
            stuck_timeout: Duration::minutes(cfg.stuck_timeout_mins),
            max_retries: cfg.max_retries,
            orphan_recheck: Duration::minutes(cfg.orphan_recheck_mins),
        }
    }
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self::from_config(&RecoverySection::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StuckTaskEntry {
    pub task_key: String,
    /// 当前这一轮占用的首次观察时间；未在计时时为 None
    pub first_seen: Option<DateTime<Utc>>,
    /// 观察到的占用者；换人即重新计时
    pub assignee: Option<String>,
    pub retry_count: u32,
    pub abandon_notified: bool,
}

#[derive(Debug, Default)]
pub struct StuckTaskTracker {
    policy: RecoveryPolicy,
    entries: HashMap<String, StuckTaskEntry>,
    orphan_checked: HashMap<String, DateTime<Utc>>,
}

impl StuckTaskTracker {
    pub fn new(policy: RecoveryPolicy) -> Self {
        Self {
            policy,
            entries: HashMap::new(),
            orphan_checked: HashMap::new(),
        }
    }

    pub fn policy(&self) -> &RecoveryPolicy {
        &self.policy
    }

    pub fn entry(&self, key: &str) -> Option<&StuckTaskEntry> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 观察到任务处于占用状态
    pub fn observe(&mut self, key: &str, assignee: &str, now: DateTime<Utc>) {
        let entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| StuckTaskEntry {
                task_key: key.to_string(),
                first_seen: None,
                assignee: None,
                retry_count: 0,
                abandon_notified: false,
            });
        let same_holder = entry
            .assignee
            .as_deref()
            .is_some_and(|a| a.eq_ignore_ascii_case(assignee));
        if entry.first_seen.is_none() || !same_holder {
            entry.first_seen = Some(now);
            entry.assignee = Some(assignee.to_string());
        }
    }

    pub fn is_overdue(&self, key: &str, now: DateTime<Utc>) -> bool {
        self.entries
            .get(key)
            .and_then(|e| e.first_seen)
            .is_some_and(|seen| now - seen >= self.policy.stuck_timeout)
    }

    /// 有开放 PR：视为仍在推进，重新计时
    pub fn refresh(&mut self, key: &str, now: DateTime<Utc>) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.first_seen = Some(now);
        }
    }

    pub fn retries_exhausted(&self, key: &str) -> bool {
        self.entries
            .get(key)
            .is_some_and(|e| e.retry_count >= self.policy.max_retries)
    }

    pub fn record_reset(&mut self, key: &str) -> u32 {
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.retry_count += 1;
                entry.first_seen = None;
                entry.assignee = None;
                entry.retry_count
            }
            None => 0,
        }
    }

    /// 标记已发放弃通知；返回是否是第一次
    pub fn mark_abandon_notified(&mut self, key: &str) -> bool {
        match self.entries.get_mut(key) {
            Some(entry) if !entry.abandon_notified => {
                entry.abandon_notified = true;
                true
            }
            _ => false,
        }
    }

    pub fn stop_tracking(&mut self, key: &str) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.first_seen = None;
            entry.assignee = None;
        }
    }

    /// 孤儿检查是否到期；到期时记录本次检查时间
    pub fn orphan_check_due(&mut self, key: &str, now: DateTime<Utc>) -> bool {
        match self.orphan_checked.get(key) {
            Some(last) if now - *last < self.policy.orphan_recheck => false,
            _ => {
                self.orphan_checked.insert(key.to_string(), now);
                true
            }
        }
    }

    /// 丢弃不再相关的条目（任务已完成或计划已关闭）
    pub fn retain_keys(&mut self, live: &HashSet<String>) -> usize {
        let before = self.entries.len() + self.orphan_checked.len();
        self.entries.retain(|k, _| live.contains(k));
        self.orphan_checked.retain(|k, _| live.contains(k));
        before - (self.entries.len() + self.orphan_checked.len())
    }
}

/// 仍需跟踪的任务键：所有未完成任务
pub fn live_task_keys(plans: &[PlanSnapshot]) -> HashSet<String> {
    plans
        .iter()
        .flat_map(|s| {
            s.plan
                .tasks
                .iter()
                .filter(|t| t.status != TaskStatus::Completed)
                .map(move |t| s.plan_ref.task_key(t.number))
        })
        .collect()
}

/// 是否有需要恢复子系统关注的任务
pub fn needs_recovery(snapshot: &PlanSnapshot) -> bool {
    snapshot.plan.tasks.iter().any(|t| {
        (t.status.is_active() && t.assignee.is_some())
            || (t.status == TaskStatus::Blocked && t.assignee.is_none())
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub reset: Vec<u64>,
    pub refreshed: Vec<u64>,
    pub abandoned: Vec<u64>,
    pub resumed: Vec<u64>,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.reset.is_empty()
            && self.refreshed.is_empty()
            && self.abandoned.is_empty()
            && self.resumed.is_empty()
    }
}

impl TaskCoordinator {
    /// 对一个计划做一次恢复扫描
    pub async fn recover_plan(
        &self,
        snapshot: &PlanSnapshot,
        tracker: &mut StuckTaskTracker,
        now: DateTime<Utc>,
    ) -> HiveResult<RecoveryReport> {
        let plan_ref = &snapshot.plan_ref;
        let repo = &plan_ref.repo;
        let mut report = RecoveryReport::default();
        let mut open_prs: Option<Vec<PullRequest>> = None;
        let mut all_prs: Option<Vec<PullRequest>> = None;
        let mut branches: Option<Vec<String>> = None;

        for task in &snapshot.plan.tasks {
            let key = plan_ref.task_key(task.number);
            match (task.status, task.assignee.as_deref()) {
                (status, Some(assignee)) if status.is_active() => {
                    tracker.observe(&key, assignee, now);
                    if !tracker.is_overdue(&key, now) {
                        continue;
                    }

                    if open_prs.is_none() {
                        open_prs = Some(self.forge.list_pull_requests(repo, PrStateFilter::Open).await?);
                    }
                    let has_pr = open_prs.iter().flatten().any(|pr| {
                        is_task_branch(&pr.head, task.number, &task.title, Some(assignee))
                    });
                    if has_pr {
                        tracing::debug!(task = %key, "Open PR found, refreshing stuck timer");
                        tracker.refresh(&key, now);
                        report.refreshed.push(task.number);
                        continue;
                    }

                    if tracker.retries_exhausted(&key) {
                        if tracker.mark_abandon_notified(&key) {
                            self.notify_abandoned(plan_ref, task, tracker.policy().max_retries)
                                .await?;
                            report.abandoned.push(task.number);
                        }
                        continue;
                    }

                    let attempt = tracker.entry(&key).map_or(0, |e| e.retry_count) + 1;
                    if self.reset_stuck_task(plan_ref, task, assignee, attempt).await? {
                        tracker.record_reset(&key);
                        report.reset.push(task.number);
                    } else {
                        tracker.stop_tracking(&key);
                    }
                }
                (TaskStatus::Blocked, None) => {
                    tracker.stop_tracking(&key);
                    if !tracker.orphan_check_due(&key, now) {
                        continue;
                    }
                    if branches.is_none() {
                        branches = tolerate("list branches", self.forge.list_branches(repo).await)?;
                    }
                    let Some(branch) = branches.as_deref().and_then(|b| {
                        find_task_branch(b, task.number, &task.title, Some(&self.settings.login))
                    }) else {
                        continue;
                    };
                    if all_prs.is_none() {
                        all_prs = Some(self.forge.list_pull_requests(repo, PrStateFilter::All).await?);
                    }
                    if all_prs.iter().flatten().any(|pr| pr.head == *branch) {
                        tracing::debug!(task = %key, %branch, "Orphaned branch already has a PR");
                        continue;
                    }
                    if self.resume_orphan(plan_ref, task, branch).await? {
                        report.resumed.push(task.number);
                    }
                }
                _ => tracker.stop_tracking(&key),
            }
        }

        if !report.is_empty() {
            tracing::info!(plan = %plan_ref, ?report, "Recovery pass finished");
        }
        Ok(report)
    }

    async fn reset_stuck_task(
        &self,
        plan_ref: &PlanRef,
        task: &Task,
        assignee: &str,
        attempt: u32,
    ) -> HiveResult<bool> {
        let number = task.number;
        let observed = task.status;
        let outcome = self
            .store
            .read_modify_write(
                plan_ref,
                |plan| {
                    let t = plan
                        .task_mut(number)
                        .ok_or_else(|| format!("task {number} disappeared"))?;
                    if t.status != observed || !t.is_assigned_to(assignee) {
                        return Err(format!("task {number} changed since it was observed"));
                    }
                    t.status = TaskStatus::Pending;
                    t.assignee = None;
                    Ok(())
                },
                |fresh, _| {
                    fresh
                        .task(number)
                        .is_some_and(|t| t.status == TaskStatus::Pending && t.assignee.is_none())
                },
            )
            .await?;

        match outcome {
            WriteOutcome::Applied { .. } => {
                let comment = format!(
                    "Task {number} ({}) was {observed} by @{assignee} for more than {} minutes without an open pull request. \
Resetting it to pending so it can be picked up again (reset {attempt} of {}).",
                    task.title,
                    self.settings.stuck_timeout_mins,
                    self.settings.max_retries,
                );
                tolerate(
                    "post reset comment",
                    self.forge
                        .create_comment(&plan_ref.repo, plan_ref.number, &comment)
                        .await,
                )?;
                tracing::info!(plan = %plan_ref, task = number, %assignee, attempt, "Stuck task reset");
                Ok(true)
            }
            WriteOutcome::Skipped(reason) => {
                tracing::debug!(plan = %plan_ref, task = number, %reason, "Stuck task moved on");
                Ok(false)
            }
            WriteOutcome::Lost { .. } => Ok(false),
        }
    }

    async fn notify_abandoned(&self, plan_ref: &PlanRef, task: &Task, retries: u32) -> HiveResult<()> {
        let comment = format!(
            "Task {} ({}) has been reset {retries} times and keeps getting stuck. \
It is abandoned and needs manual intervention; automatic recovery will skip it from now on.",
            task.number, task.title
        );
        tracing::warn!(plan = %plan_ref, task = task.number, "Task abandoned after retry cap");
        tolerate(
            "post abandonment notice",
            self.forge
                .create_comment(&plan_ref.repo, plan_ref.number, &comment)
                .await,
        )?;
        Ok(())
    }

    /// 复用孤儿分支：检出、重跑门 2–5、开 PR、完成任务
    async fn resume_orphan(&self, plan_ref: &PlanRef, task: &Task, branch: &str) -> HiveResult<bool> {
        let repo = &plan_ref.repo;
        let clone_url = self.forge.clone_url(repo);
        let Some(path) = tolerate(
            "prepare workspace",
            self.workspace
                .prepare(repo, &clone_url, &self.settings.base_branch)
                .await,
        )?
        else {
            return Ok(false);
        };
        if tolerate(
            "checkout orphaned branch",
            self.workspace.checkout_remote_branch(&path, branch).await,
        )?
        .is_none()
        {
            return Ok(false);
        }

        let ctx = GateContext {
            workspace: self.workspace.as_ref(),
            forge: self.forge.as_ref(),
            repo,
            path: &path,
            branch,
            base: &self.settings.base_branch,
        };
        let report = run_gates(&ctx, &RESUME_CHAIN).await?;
        if let Some(failure) = report.failure {
            tracing::info!(
                plan = %plan_ref,
                task = task.number,
                %branch,
                gate = %failure.gate,
                "Orphaned branch not recoverable yet"
            );
            return Ok(false);
        }

        let pr = self
            .open_task_pr(plan_ref, task, branch, &report.changed_files)
            .await?;
        let completed = self
            .write_completed(plan_ref, task.number, |t| {
                if t.status == TaskStatus::Blocked && t.assignee.is_none() {
                    Ok(())
                } else {
                    Err(format!("task {} picked up by someone else", t.number))
                }
            })
            .await?;

        let comment = if completed {
            format!(
                "Recovered orphaned branch `{branch}` for task {} and opened #{}.",
                task.number, pr.number
            )
        } else {
            format!(
                "Opened #{} from orphaned branch `{branch}`, but task {} was picked up by someone else \
before it could be marked completed. The plan was left as is.",
                pr.number, task.number
            )
        };
        tolerate(
            "post recovery comment",
            self.forge
                .create_comment(&plan_ref.repo, plan_ref.number, &comment)
                .await,
        )?;
        if !completed {
            tracing::info!(plan = %plan_ref, task = task.number, pr = pr.number, "Orphaned task taken over before completion");
            return Ok(false);
        }
        tracing::info!(plan = %plan_ref, task = task.number, pr = pr.number, "Orphaned branch recovered");
        self.check_plan_completion(plan_ref).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> StuckTaskTracker {
        StuckTaskTracker::new(RecoveryPolicy::default())
    }

    #[test]
    fn test_overdue_after_timeout() {
        let mut t = tracker();
        let start = Utc::now();
        t.observe("k", "peer", start);
        assert!(!t.is_overdue("k", start + Duration::minutes(29)));
        // 再次观察不重置计时
        t.observe("k", "peer", start + Duration::minutes(20));
        assert!(t.is_overdue("k", start + Duration::minutes(30)));
    }

    #[test]
    fn test_new_holder_restarts_timer() {
        let mut t = tracker();
        let start = Utc::now();
        t.observe("k", "peer-a", start);
        t.observe("k", "peer-b", start + Duration::minutes(25));
        assert!(!t.is_overdue("k", start + Duration::minutes(40)));
    }

    #[test]
    fn test_retry_cap_and_single_notification() {
        let mut t = tracker();
        let now = Utc::now();
        for expected in 1..=3 {
            t.observe("k", "peer", now);
            assert!(!t.retries_exhausted("k"));
            assert_eq!(t.record_reset("k"), expected);
        }
        t.observe("k", "peer", now);
        assert!(t.retries_exhausted("k"));
        assert!(t.mark_abandon_notified("k"));
        assert!(!t.mark_abandon_notified("k"));
    }

    #[test]
    fn test_orphan_recheck_interval() {
        let mut t = tracker();
        let now = Utc::now();
        assert!(t.orphan_check_due("k", now));
        assert!(!t.orphan_check_due("k", now + Duration::minutes(10)));
        assert!(t.orphan_check_due("k", now + Duration::minutes(61)));
    }

    #[test]
    fn test_retain_keys() {
        let mut t = tracker();
        let now = Utc::now();
        t.observe("a", "peer", now);
        t.observe("b", "peer", now);
        t.orphan_check_due("b", now);
        let live: HashSet<String> = ["a".to_string()].into_iter().collect();
        assert_eq!(t.retain_keys(&live), 2);
        assert!(t.entry("a").is_some());
        assert!(t.entry("b").is_none());
    }
}
