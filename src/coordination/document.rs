//! 计划文档的读改写
//!
//! 认领与汇报共用同一个写入纪律：写入前重新读取最新文档、在新鲜副本上做修改，写回后等待落定再读一次校验。
//! 校验失败说明有其他实例的写入覆盖了我们，按「别人先到了」处理，不重试同一个任务。

use std::sync::Arc;
use std::time::Duration;

use crate::coordination::plan::{Plan, PlanRef};
use crate::core::HiveResult;
use crate::platform::{ForgeClient, Issue, IssueUpdate};

/// 一次读改写的结果
#[derive(Debug, Clone)]
pub enum WriteOutcome<T> {
    /// 写入生效且回读校验通过
    Applied { plan: Plan, value: T },
    /// 在新鲜副本上前置条件已不成立，未写入
    Skipped(String),
    /// 写入后回读发现被覆盖
    Lost { plan: Plan, value: T },
}

impl<T> WriteOutcome<T> {
    pub fn is_applied(&self) -> bool {
        matches!(self, WriteOutcome::Applied { .. })
    }
}

#[derive(Clone)]
pub struct PlanStore {
    forge: Arc<dyn ForgeClient>,
    settle: Duration,
}

impl PlanStore {
    pub fn new(forge: Arc<dyn ForgeClient>, settle: Duration) -> Self {
        Self { forge, settle }
    }

    pub async fn fetch(&self, plan_ref: &PlanRef) -> HiveResult<(Issue, Plan)> {
        let issue = self.forge.get_issue(&plan_ref.repo, plan_ref.number).await?;
        let plan = Plan::parse(&issue.title, &issue.body)?;
        Ok((issue, plan))
    }

    /// 读取最新文档 → `mutate` → 写回 → 等待落定 → 回读并用 `verify` 校验
    ///
    /// `mutate` 返回 Err(reason) 表示前置条件不成立；其 Ok 值在写入成功时原样带回。
    pub async fn read_modify_write<T, M, V>(
        &self,
        plan_ref: &PlanRef,
        mutate: M,
        verify: V,
    ) -> HiveResult<WriteOutcome<T>>
    where
        M: FnOnce(&mut Plan) -> Result<T, String>,
        V: Fn(&Plan, &T) -> bool,
    {
        let (_, mut plan) = self.fetch(plan_ref).await?;
        let value = match mutate(&mut plan) {
            Ok(value) => value,
            Err(reason) => return Ok(WriteOutcome::Skipped(reason)),
        };

        let update = IssueUpdate {
            body: Some(plan.render()),
            ..Default::default()
        };
        self.forge
            .update_issue(&plan_ref.repo, plan_ref.number, &update)
            .await?;

        if !self.settle.is_zero() {
            tokio::time::sleep(self.settle).await;
        }

        let (_, fresh) = self.fetch(plan_ref).await?;
        if verify(&fresh, &value) {
            Ok(WriteOutcome::Applied { plan: fresh, value })
        } else {
            tracing::debug!(plan = %plan_ref, "Post-write verification failed");
            Ok(WriteOutcome::Lost { plan: fresh, value })
        }
    }
}
