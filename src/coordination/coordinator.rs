//! 任务协调：认领 → 执行 → 验证 → 汇报
//!
//! 多个实例没有共享数据库，唯一的共享状态是代码托管平台上的计划文档。
//! 认领时挑选最新文档中编号最小的可认领任务，写入后回读确认；被覆盖就让给对方、转去下一个计划，不重试同一任务。
//! 失败的任务一律在计划上留下可读的评论。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::AppConfig;
use crate::coordination::branch::task_branch_name;
use crate::coordination::document::{PlanStore, WriteOutcome};
use crate::coordination::gates::{run_gates, GateContext, FULL_CHAIN};
use crate::coordination::plan::{Plan, PlanRef, Task, TaskStatus};
use crate::core::{tolerate, HiveResult};
use crate::platform::{
    CodingAgent, CodingOutcome, ForgeClient, IssueState, IssueUpdate, NewPullRequest, PullRequest,
    RepoRef, RepoWorkspace, SocialClient,
};

/// 失败评论里保留的输出尾部长度
const COMMENT_OUTPUT_CHARS: usize = 1500;

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    /// 写入 assignee 的登录名
    pub login: String,
    pub repos: Vec<RepoRef>,
    pub plan_label: String,
    pub base_branch: String,
    pub reviewers: Vec<String>,
    pub coding_timeout: Duration,
    pub claim_settle: Duration,
    pub announce_completion: bool,
    /// 卡住判定阈值（分钟），写进重置说明
    pub stuck_timeout_mins: i64,
    pub max_retries: u32,
}

impl CoordinatorSettings {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            login: cfg.agent.forge_login.clone(),
            repos: cfg.coordination.repo_refs(),
            plan_label: cfg.coordination.plan_label.clone(),
            base_branch: cfg.coordination.base_branch.clone(),
            reviewers: cfg.coordination.reviewers.clone(),
            coding_timeout: Duration::from_secs(cfg.coordination.coding_timeout_secs),
            claim_settle: Duration::from_millis(cfg.coordination.claim_settle_ms),
            announce_completion: cfg.coordination.announce_completion,
            stuck_timeout_mins: cfg.recovery.stuck_timeout_mins,
            max_retries: cfg.recovery.max_retries,
        }
    }
}

/// 一次发现周期读到的计划
#[derive(Debug, Clone)]
pub struct PlanSnapshot {
    pub plan_ref: PlanRef,
    pub plan: Plan,
}

/// 认领成功的任务，连同写入后回读到的计划
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub plan_ref: PlanRef,
    pub task: Task,
    pub plan: Plan,
}

#[derive(Debug, Clone)]
pub enum TaskResult {
    Completed { pr: PullRequest, plan_completed: bool },
    /// 在某个阶段（工作区、编码、或某个验证门）失败；任务已标记 blocked 并释放
    Failed { stage: &'static str, reason: String },
    /// 编码代理显式声明阻塞；任务保留 assignee
    Blocked { reason: String },
    /// 与其他实例的写入冲突，正常让步
    Conflict(String),
}

pub struct TaskCoordinator {
    pub(crate) forge: Arc<dyn ForgeClient>,
    pub(crate) social: Arc<dyn SocialClient>,
    pub(crate) workspace: Arc<dyn RepoWorkspace>,
    coder: Arc<dyn CodingAgent>,
    pub(crate) store: PlanStore,
    pub(crate) settings: CoordinatorSettings,
}

fn tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    text.chars().skip(count - max_chars).collect()
}

impl TaskCoordinator {
    pub fn new(
        forge: Arc<dyn ForgeClient>,
        social: Arc<dyn SocialClient>,
        workspace: Arc<dyn RepoWorkspace>,
        coder: Arc<dyn CodingAgent>,
        settings: CoordinatorSettings,
    ) -> Self {
        let store = PlanStore::new(forge.clone(), settings.claim_settle);
        Self {
            forge,
            social,
            workspace,
            coder,
            store,
            settings,
        }
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.settings
    }

    /// 扫描关注仓库中带计划标签的打开 issue
    pub async fn discover_plans(&self) -> HiveResult<Vec<PlanSnapshot>> {
        let mut plans = Vec::new();
        for repo in &self.settings.repos {
            let Some(issues) = tolerate(
                "list plan issues",
                self.forge.list_issues(repo, Some(&self.settings.plan_label)).await,
            )?
            else {
                continue;
            };
            for issue in issues {
                if issue.is_pull_request || issue.state != IssueState::Open {
                    continue;
                }
                match Plan::parse(&issue.title, &issue.body) {
                    Ok(plan) => plans.push(PlanSnapshot {
                        plan_ref: PlanRef::new(repo.clone(), issue.number),
                        plan,
                    }),
                    Err(e) => {
                        tracing::debug!(repo = %repo, issue = issue.number, error = %e, "Skipping unparseable plan");
                    }
                }
            }
        }
        plans.sort_by(|a, b| a.plan_ref.cmp(&b.plan_ref));
        Ok(plans)
    }

    /// 在单个计划中认领编号最小的可认领任务
    ///
    /// 返回 None 表示没有可认领任务或输掉了写竞争。
    pub async fn claim_in_plan(&self, plan_ref: &PlanRef) -> HiveResult<Option<ClaimedTask>> {
        let login = self.settings.login.as_str();
        let outcome = self
            .store
            .read_modify_write(
                plan_ref,
                |plan| {
                    let number = plan
                        .claimable_tasks()
                        .first()
                        .map(|t| t.number)
                        .ok_or_else(|| "no claimable task".to_string())?;
                    if let Some(task) = plan.task_mut(number) {
                        task.assignee = Some(login.to_string());
                        task.status = TaskStatus::Claimed;
                    }
                    Ok(number)
                },
                |fresh, number| {
                    fresh
                        .task(*number)
                        .is_some_and(|t| t.is_assigned_to(login) && t.status == TaskStatus::Claimed)
                },
            )
            .await?;

        match outcome {
            WriteOutcome::Applied { plan, value } => {
                let Some(task) = plan.task(value).cloned() else {
                    return Ok(None);
                };
                tracing::info!(plan = %plan_ref, task = value, title = %task.title, "Task claimed");
                Ok(Some(ClaimedTask {
                    plan_ref: plan_ref.clone(),
                    task,
                    plan,
                }))
            }
            WriteOutcome::Skipped(reason) => {
                tracing::debug!(plan = %plan_ref, %reason, "Nothing to claim");
                Ok(None)
            }
            WriteOutcome::Lost { plan, value } => {
                let winner = plan.task(value).and_then(|t| t.assignee.clone());
                tracing::info!(
                    plan = %plan_ref,
                    task = value,
                    winner = winner.as_deref().unwrap_or("unknown"),
                    "Lost claim race, deferring"
                );
                Ok(None)
            }
        }
    }

    /// 依次尝试每个有可认领任务的计划，返回第一个认领成功的
    pub async fn claim_next(&self, plans: &[PlanSnapshot]) -> HiveResult<Option<ClaimedTask>> {
        for snapshot in plans {
            if snapshot.plan.claimable_tasks().is_empty() {
                continue;
            }
            if let Some(claimed) = self.claim_in_plan(&snapshot.plan_ref).await? {
                return Ok(Some(claimed));
            }
        }
        Ok(None)
    }

    async fn mark_in_progress(&self, plan_ref: &PlanRef, number: u64) -> HiveResult<WriteOutcome<()>> {
        let login = self.settings.login.as_str();
        self.store
            .read_modify_write(
                plan_ref,
                |plan| {
                    let task = plan
                        .task_mut(number)
                        .ok_or_else(|| format!("task {number} disappeared"))?;
                    if !task.is_assigned_to(login) || task.status != TaskStatus::Claimed {
                        return Err(format!(
                            "task {number} is now {} / {}",
                            task.status,
                            task.assignee.as_deref().unwrap_or("unassigned")
                        ));
                    }
                    task.status = TaskStatus::InProgress;
                    Ok(())
                },
                |fresh, _| {
                    fresh
                        .task(number)
                        .is_some_and(|t| t.is_assigned_to(login) && t.status == TaskStatus::InProgress)
                },
            )
            .await
    }

    async fn prepare_branch(&self, repo: &RepoRef, branch: &str) -> crate::platform::PlatformResult<PathBuf> {
        let clone_url = self.forge.clone_url(repo);
        let path = self
            .workspace
            .prepare(repo, &clone_url, &self.settings.base_branch)
            .await?;
        self.workspace.create_branch(&path, branch).await?;
        Ok(path)
    }

    /// 执行已认领的任务并汇报结果
    pub async fn execute_task(&self, claimed: &ClaimedTask) -> HiveResult<TaskResult> {
        let plan_ref = &claimed.plan_ref;
        let task = &claimed.task;
        let number = task.number;

        match self.mark_in_progress(plan_ref, number).await? {
            WriteOutcome::Applied { .. } => {}
            WriteOutcome::Skipped(reason) => {
                tracing::info!(plan = %plan_ref, task = number, %reason, "Claim no longer ours");
                return Ok(TaskResult::Conflict(reason));
            }
            WriteOutcome::Lost { .. } => {
                return Ok(TaskResult::Conflict(format!(
                    "in_progress write for task {number} was overwritten"
                )));
            }
        }

        let branch = task_branch_name(number, &task.title);
        let path = match self.prepare_branch(&plan_ref.repo, &branch).await {
            Ok(path) => path,
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => return self.report_failure(plan_ref, task, "workspace", &e.to_string()).await,
        };

        let prompt = build_task_prompt(&claimed.plan, task, &branch);
        tracing::info!(plan = %plan_ref, task = number, %branch, "Handing task to coding agent");
        let outcome = match tokio::time::timeout(
            self.settings.coding_timeout,
            self.coder.run(&prompt, &path),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => CodingOutcome::failed(format!(
                "coding agent timed out after {}s",
                self.settings.coding_timeout.as_secs()
            )),
        };

        if outcome.blocked {
            let reason = outcome
                .block_reason
                .unwrap_or_else(|| "no reason given".to_string());
            return self.report_blocked(plan_ref, task, &reason).await;
        }
        if !outcome.success {
            let reason = outcome
                .error
                .unwrap_or_else(|| "coding agent reported failure".to_string());
            return self.report_failure(plan_ref, task, "coding", &reason).await;
        }

        let ctx = GateContext {
            workspace: self.workspace.as_ref(),
            forge: self.forge.as_ref(),
            repo: &plan_ref.repo,
            path: &path,
            branch: &branch,
            base: &self.settings.base_branch,
        };
        let report = run_gates(&ctx, &FULL_CHAIN).await?;
        if let Some(failure) = report.failure {
            return self
                .report_failure(plan_ref, task, failure.gate.name(), &failure.reason)
                .await;
        }

        let pr = match self
            .open_task_pr(plan_ref, task, &branch, &report.changed_files)
            .await
        {
            Ok(pr) => pr,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                // 分支已推送：释放任务，交给孤儿恢复补开 PR
                return self
                    .report_failure(plan_ref, task, "pull_request", &e.to_string())
                    .await;
            }
        };
        let login = self.settings.login.clone();
        let completed = self
            .write_completed(plan_ref, number, move |t| {
                if t.is_assigned_to(&login) {
                    Ok(())
                } else {
                    Err(format!("task {} reassigned", t.number))
                }
            })
            .await?;
        if !completed {
            return Ok(TaskResult::Conflict(format!(
                "PR #{} opened but completing task {number} lost a write race",
                pr.number
            )));
        }

        let plan_completed = self.check_plan_completion(plan_ref).await?;
        tracing::info!(plan = %plan_ref, task = number, pr = pr.number, "Task completed");
        Ok(TaskResult::Completed { pr, plan_completed })
    }

    /// 门失败 / 编码失败：任务标记 blocked 并释放 assignee，评论说明
    async fn report_failure(
        &self,
        plan_ref: &PlanRef,
        task: &Task,
        stage: &'static str,
        reason: &str,
    ) -> HiveResult<TaskResult> {
        let number = task.number;
        let login = self.settings.login.as_str();
        let outcome = self
            .store
            .read_modify_write(
                plan_ref,
                |plan| {
                    let t = plan
                        .task_mut(number)
                        .ok_or_else(|| format!("task {number} disappeared"))?;
                    if !t.is_assigned_to(login) {
                        return Err(format!("task {number} no longer assigned to {login}"));
                    }
                    t.status = TaskStatus::Blocked;
                    t.assignee = None;
                    Ok(())
                },
                |fresh, _| {
                    fresh
                        .task(number)
                        .is_some_and(|t| t.status == TaskStatus::Blocked && t.assignee.is_none())
                },
            )
            .await?;
        if !outcome.is_applied() {
            tracing::warn!(plan = %plan_ref, task = number, "Could not record task failure on plan");
        }

        let comment = format!(
            "Task {number} ({}) failed at gate `{stage}`.\n\n```\n{}\n```\n\nThe task is blocked and unassigned. If the branch can be recovered it will be picked up again.",
            task.title,
            tail(reason, COMMENT_OUTPUT_CHARS)
        );
        tolerate(
            "post failure comment",
            self.forge
                .create_comment(&plan_ref.repo, plan_ref.number, &comment)
                .await,
        )?;
        Ok(TaskResult::Failed {
            stage,
            reason: reason.to_string(),
        })
    }

    /// 编码代理显式阻塞：任务标记 blocked，保留 assignee
    async fn report_blocked(&self, plan_ref: &PlanRef, task: &Task, reason: &str) -> HiveResult<TaskResult> {
        let number = task.number;
        let login = self.settings.login.as_str();
        self.store
            .read_modify_write(
                plan_ref,
                |plan| {
                    let t = plan
                        .task_mut(number)
                        .ok_or_else(|| format!("task {number} disappeared"))?;
                    if !t.is_assigned_to(login) {
                        return Err(format!("task {number} no longer assigned to {login}"));
                    }
                    t.status = TaskStatus::Blocked;
                    Ok(())
                },
                |fresh, _| fresh.task(number).is_some_and(|t| t.status == TaskStatus::Blocked),
            )
            .await?;

        let comment = format!(
            "Task {number} ({}) is blocked: {reason}\n\nIt needs input before work can continue.",
            task.title
        );
        tolerate(
            "post blocked comment",
            self.forge
                .create_comment(&plan_ref.repo, plan_ref.number, &comment)
                .await,
        )?;
        tracing::info!(plan = %plan_ref, task = number, %reason, "Task blocked by coding agent");
        Ok(TaskResult::Blocked {
            reason: reason.to_string(),
        })
    }

    /// 创建 PR 并请求审阅
    pub(crate) async fn open_task_pr(
        &self,
        plan_ref: &PlanRef,
        task: &Task,
        branch: &str,
        changed_files: &[String],
    ) -> HiveResult<PullRequest> {
        let mut body = format!(
            "Implements task {} of plan #{}.\n\n{}\n",
            task.number,
            plan_ref.number,
            task.description.trim()
        );
        if !changed_files.is_empty() {
            body.push_str("\nChanged files:\n");
            for file in changed_files {
                body.push_str(&format!("- `{file}`\n"));
            }
        }

        let pr = self
            .forge
            .create_pull_request(
                &plan_ref.repo,
                &NewPullRequest {
                    title: format!("Task {}: {}", task.number, task.title),
                    body,
                    head: branch.to_string(),
                    base: self.settings.base_branch.clone(),
                },
            )
            .await?;

        if !self.settings.reviewers.is_empty() {
            tolerate(
                "request reviewers",
                self.forge
                    .request_reviewers(&plan_ref.repo, pr.number, &self.settings.reviewers)
                    .await,
            )?;
        }
        Ok(pr)
    }

    /// 写入 completed；`precondition` 在最新文档上检查
    pub(crate) async fn write_completed<P>(
        &self,
        plan_ref: &PlanRef,
        number: u64,
        precondition: P,
    ) -> HiveResult<bool>
    where
        P: FnOnce(&Task) -> Result<(), String>,
    {
        let login = self.settings.login.as_str();
        let outcome = self
            .store
            .read_modify_write(
                plan_ref,
                |plan| {
                    let t = plan
                        .task_mut(number)
                        .ok_or_else(|| format!("task {number} disappeared"))?;
                    precondition(t)?;
                    t.status = TaskStatus::Completed;
                    t.assignee = Some(login.to_string());
                    Ok(())
                },
                |fresh, _| {
                    fresh
                        .task(number)
                        .is_some_and(|t| t.status == TaskStatus::Completed)
                },
            )
            .await?;
        Ok(outcome.is_applied())
    }

    /// 重新读取计划；全部完成时评论、关闭并公告
    pub(crate) async fn check_plan_completion(&self, plan_ref: &PlanRef) -> HiveResult<bool> {
        let (issue, plan) = self.store.fetch(plan_ref).await?;
        if issue.state != IssueState::Open || !plan.is_complete() {
            return Ok(false);
        }

        let mut summary = format!("All {} tasks of this plan are completed:\n\n", plan.tasks.len());
        for task in &plan.tasks {
            summary.push_str(&format!(
                "- Task {}: {} ({})\n",
                task.number,
                task.title,
                task.assignee.as_deref().map(|a| format!("@{a}")).unwrap_or_default()
            ));
        }
        summary.push_str("\nClosing the plan.");
        tolerate(
            "post plan summary",
            self.forge
                .create_comment(&plan_ref.repo, plan_ref.number, &summary)
                .await,
        )?;

        self.forge
            .update_issue(
                &plan_ref.repo,
                plan_ref.number,
                &IssueUpdate {
                    state: Some(IssueState::Closed),
                    ..Default::default()
                },
            )
            .await?;
        tracing::info!(plan = %plan_ref, "Plan completed and closed");

        if self.settings.announce_completion {
            let text = format!(
                "Plan complete: \"{}\" in {} ({} tasks shipped by the team).",
                plan.title,
                plan_ref.repo,
                plan.tasks.len()
            );
            tolerate("announce plan completion", self.social.post_text(&text).await)?;
        }
        Ok(true)
    }
}

/// 交给编码代理的任务说明
pub fn build_task_prompt(plan: &Plan, task: &Task, branch: &str) -> String {
    let mut prompt = format!(
        "You are working on task {} of the plan \"{}\".\n\nPlan goal:\n{}\n\nTask: {}\n\n{}\n",
        task.number,
        plan.title,
        plan.goal,
        task.title,
        task.description
    );
    if !task.files.is_empty() {
        prompt.push_str(&format!("\nLikely relevant files: {}\n", task.files.join(", ")));
    }
    if !plan.context.is_empty() {
        prompt.push_str(&format!("\nContext:\n{}\n", plan.context));
    }
    prompt.push_str(&format!(
        "\nYou are on branch `{branch}`. Commit your changes on this branch. Do not merge other branches. \
If the task cannot be done, say you are blocked and explain why.\n"
    ));
    prompt
}
