//! 验证门：有序、失败即关闭
//!
//! 1. 分支卫生：当前在任务分支上且没有合并提交
//! 2. 有变更：至少 1 个提交、至少 1 个改动文件
//! 3. 测试：能发现的测试套件必须通过（没有测试不算失败）
//! 4. 推送成功
//! 5. 远端独立确认分支存在
//!
//! 第一个失败的门终止整条链。认证类错误不算门失败，而是原样向上传播。

use std::fmt;
use std::path::Path;

use crate::core::HiveResult;
use crate::platform::{ForgeClient, PlatformError, RepoRef, RepoWorkspace, TestOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Gate {
    BranchHygiene,
    Changes,
    Tests,
    Push,
    RemoteBranch,
}

/// 新任务执行后的完整验证链
pub const FULL_CHAIN: [Gate; 5] = [
    Gate::BranchHygiene,
    Gate::Changes,
    Gate::Tests,
    Gate::Push,
    Gate::RemoteBranch,
];

/// 孤儿分支恢复：分支来自远端，跳过卫生检查
pub const RESUME_CHAIN: [Gate; 4] = [Gate::Changes, Gate::Tests, Gate::Push, Gate::RemoteBranch];

impl Gate {
    pub fn name(&self) -> &'static str {
        match self {
            Gate::BranchHygiene => "branch_hygiene",
            Gate::Changes => "changes",
            Gate::Tests => "tests",
            Gate::Push => "push",
            Gate::RemoteBranch => "remote_branch",
        }
    }

    pub fn ordinal(&self) -> u8 {
        match self {
            Gate::BranchHygiene => 1,
            Gate::Changes => 2,
            Gate::Tests => 3,
            Gate::Push => 4,
            Gate::RemoteBranch => 5,
        }
    }
}

impl fmt::Display for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateFailure {
    pub gate: Gate,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct GateReport {
    pub passed: Vec<Gate>,
    pub failure: Option<GateFailure>,
    pub commits: usize,
    pub changed_files: Vec<String>,
    pub tests: Option<TestOutcome>,
}

impl GateReport {
    pub fn is_pass(&self) -> bool {
        self.failure.is_none()
    }
}

pub struct GateContext<'a> {
    pub workspace: &'a dyn RepoWorkspace,
    pub forge: &'a dyn ForgeClient,
    pub repo: &'a RepoRef,
    pub path: &'a Path,
    pub branch: &'a str,
    pub base: &'a str,
}

/// 单个门的结论：Ok(None) 通过，Ok(Some(reason)) 失败
type GateVerdict = Result<Option<String>, PlatformError>;

/// 非致命的协作方错误计为该门失败
fn soft(verdict: GateVerdict) -> HiveResult<Option<String>> {
    match verdict {
        Ok(v) => Ok(v),
        Err(e) if e.is_fatal() => Err(e.into()),
        Err(e) => Ok(Some(e.to_string())),
    }
}

async fn check(ctx: &GateContext<'_>, gate: Gate, report: &mut GateReport) -> GateVerdict {
    match gate {
        Gate::BranchHygiene => {
            let current = ctx.workspace.current_branch(ctx.path).await?;
            if current != ctx.branch {
                return Ok(Some(format!(
                    "on branch '{current}', expected '{}'",
                    ctx.branch
                )));
            }
            if ctx.workspace.has_merge_commits(ctx.path, ctx.base).await? {
                return Ok(Some(format!("merge commits found since '{}'", ctx.base)));
            }
            Ok(None)
        }
        Gate::Changes => {
            report.commits = ctx.workspace.commits_ahead(ctx.path, ctx.base).await?;
            report.changed_files = ctx.workspace.changed_files(ctx.path, ctx.base).await?;
            if report.commits == 0 {
                return Ok(Some("no commits on the task branch".to_string()));
            }
            if report.changed_files.is_empty() {
                return Ok(Some("commits change no files".to_string()));
            }
            Ok(None)
        }
        Gate::Tests => {
            let outcome = ctx.workspace.run_tests(ctx.path).await?;
            report.tests = Some(outcome.clone());
            match outcome {
                TestOutcome::NoTests | TestOutcome::Passed { .. } => Ok(None),
                TestOutcome::Failed { runner, output } => {
                    Ok(Some(format!("{runner} failed:\n{output}")))
                }
            }
        }
        Gate::Push => {
            ctx.workspace.push(ctx.path, ctx.branch).await?;
            Ok(None)
        }
        Gate::RemoteBranch => {
            if ctx.forge.verify_remote_branch(ctx.repo, ctx.branch).await? {
                Ok(None)
            } else {
                Ok(Some(format!("branch '{}' not found on remote after push", ctx.branch)))
            }
        }
    }
}

/// 依次运行给定的门，遇到第一个失败即停止
pub async fn run_gates(ctx: &GateContext<'_>, gates: &[Gate]) -> HiveResult<GateReport> {
    let mut report = GateReport::default();
    for gate in gates {
        let verdict = check(ctx, *gate, &mut report).await;
        match soft(verdict)? {
            None => {
                tracing::debug!(gate = %gate, branch = ctx.branch, "Gate passed");
                report.passed.push(*gate);
            }
            Some(reason) => {
                tracing::warn!(gate = %gate, branch = ctx.branch, %reason, "Gate failed");
                report.failure = Some(GateFailure { gate: *gate, reason });
                break;
            }
        }
    }
    Ok(report)
}
