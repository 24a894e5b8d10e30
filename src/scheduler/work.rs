//! 工作类周期：计划感知与任务执行、承诺履约、反思与自我改进、心跳、版本检查

use std::time::Duration;

use chrono::Utc;

use crate::coordination::{live_task_keys, needs_recovery, TaskResult};
use crate::core::{HiveError, HiveResult, Mode};
use crate::platform::{core_tool_definitions, ChatMessage, PlatformError, SelfImproveArgs, SELF_IMPROVE};
use crate::scheduler::prompts;
use crate::scheduler::SchedulerInner;

impl SchedulerInner {
    /// 远端版本与本地不一致时返回 VersionMismatch，由分诊终止调度器
    pub(crate) async fn version_check_cycle(&self) -> HiveResult<()> {
        let Some(source) = &self.version else {
            return Ok(());
        };
        let timeout = Duration::from_secs(self.config.scheduler.version_check_timeout_secs);
        let remote = match tokio::time::timeout(timeout, source.remote_version()).await {
            Ok(result) => result?,
            Err(_) => return Err(PlatformError::Timeout("version check".to_string()).into()),
        };
        let local = self.config.agent.local_version();
        match remote {
            Some(remote) if remote.trim() != local => Err(HiveError::VersionMismatch {
                local,
                remote: remote.trim().to_string(),
            }),
            _ => Ok(()),
        }
    }

    /// 恢复卡住 / 孤立的任务，然后认领并执行至多一个任务
    pub(crate) async fn plan_awareness_cycle(&self) -> HiveResult<()> {
        let Some(_guard) = self.modes.try_enter(Mode::TaskExecuting) else {
            return Ok(());
        };
        let now = Utc::now();
        let mut plans = self.coordinator.discover_plans().await?;

        let mut changed = false;
        {
            let mut stuck = self.stuck.lock().await;
            for snapshot in plans.iter().filter(|s| needs_recovery(s)) {
                match self.coordinator.recover_plan(snapshot, &mut stuck, now).await {
                    Ok(report) if !report.is_empty() => {
                        tracing::info!(
                            plan = %snapshot.plan_ref,
                            reset = ?report.reset,
                            refreshed = ?report.refreshed,
                            abandoned = ?report.abandoned,
                            resumed = ?report.resumed,
                            "Recovery pass"
                        );
                        changed |= !report.reset.is_empty() || !report.resumed.is_empty();
                    }
                    Ok(_) => {}
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => tracing::warn!(plan = %snapshot.plan_ref, error = %e, "Recovery failed"),
                }
            }
            let dropped = stuck.retain_keys(&live_task_keys(&plans));
            if dropped > 0 {
                tracing::debug!(dropped, "Stopped tracking settled tasks");
            }
        }
        if changed {
            plans = self.coordinator.discover_plans().await?;
        }

        let Some(claimed) = self.coordinator.claim_next(&plans).await? else {
            tracing::debug!(plans = plans.len(), "Nothing claimable");
            return Ok(());
        };
        let key = claimed.plan_ref.task_key(claimed.task.number);
        match self.coordinator.execute_task(&claimed).await? {
            TaskResult::Completed { pr, plan_completed } => {
                tracing::info!(task = %key, pr = pr.number, plan_completed, "Task delivered");
                Ok(())
            }
            TaskResult::Blocked { reason } => {
                tracing::info!(task = %key, %reason, "Task blocked by coding agent");
                Ok(())
            }
            TaskResult::Failed { stage, reason } => Err(HiveError::Gate { gate: stage, reason }),
            TaskResult::Conflict(reason) => Err(HiveError::Conflict(reason)),
        }
    }

    /// 履约全部待办承诺；队列为空时不占用模式
    pub(crate) async fn commitment_cycle(&self) -> HiveResult<()> {
        let now = Utc::now();
        let pending = {
            let mut queue = self.commitments.lock().await;
            let swept = queue.sweep_stale(now);
            let pruned = queue.prune(now);
            if swept + pruned > 0 {
                queue.save()?;
            }
            queue.pending_ids()
        };
        if pending.is_empty() {
            return Ok(());
        }
        let Some(_guard) = self.modes.try_enter(Mode::Responding) else {
            return Ok(());
        };

        for id in pending {
            let Some(commitment) = self.commitments.lock().await.start(&id, Utc::now()) else {
                continue;
            };
            let outcome = self.fulfiller.fulfill(&commitment).await;
            let mut queue = self.commitments.lock().await;
            match outcome {
                Ok(result) => {
                    tracing::info!(id = %id, kind = %commitment.kind(), %result, "Commitment fulfilled");
                    queue.complete(&id, result, Utc::now());
                }
                Err(e) => {
                    queue.fail(&id, e.to_string(), Utc::now());
                    if e.is_fatal() {
                        queue.save()?;
                        return Err(e);
                    }
                    tracing::warn!(id = %id, kind = %commitment.kind(), error = %e, "Commitment failed");
                }
            }
            queue.save()?;
        }
        Ok(())
    }

    /// 回顾近期帖子；有改进目标且配置了自身工作区时进入 improving
    pub(crate) async fn reflection_cycle(&self) -> HiveResult<()> {
        let Some(mut guard) = self.modes.try_enter(Mode::Reflecting) else {
            return Ok(());
        };
        let agent = &self.config.agent;
        let recent: Vec<_> = self.ledger.lock().await.recent_posts.iter().cloned().collect();
        let system = prompts::reflection_system(&agent.persona);
        let messages = [ChatMessage::user(prompts::recent_posts_summary(&recent))];
        let reply = self
            .collab
            .generator
            .chat_with_tools(&system, &messages, &core_tool_definitions())
            .await?;
        if !reply.text.trim().is_empty() {
            tracing::info!(summary = %reply.text.trim(), "Reflection");
        }

        let mut goals = std::mem::take(&mut *self.improvement_requests.lock().await);
        for call in reply.tool_calls.iter().filter(|c| c.name == SELF_IMPROVE) {
            match serde_json::from_value::<SelfImproveArgs>(call.arguments.clone()) {
                Ok(args) => goals.push(args.goal),
                Err(e) => tracing::warn!(error = %e, "Malformed self_improve arguments"),
            }
        }

        let now = Utc::now();
        {
            let mut ledger = self.ledger.lock().await;
            ledger.last_reflection = Some(now);
            self.ledger_store.save(&ledger)?;
        }
        if goals.is_empty() {
            return Ok(());
        }
        let Some(workspace) = agent.self_workspace.clone() else {
            tracing::warn!(goals = goals.len(), "Self-improvement requested but no self workspace configured");
            return Ok(());
        };

        guard.switch(Mode::Improving);
        let timeout = Duration::from_secs(self.config.coordination.coding_timeout_secs);
        for goal in goals {
            let prompt = format!(
                "Improve your own implementation.\n\nGoal: {goal}\n\nKeep the change small and focused, \
and make sure the existing tests still pass."
            );
            match tokio::time::timeout(timeout, self.collab.coder.run(&prompt, &workspace)).await {
                Ok(outcome) if outcome.success => {
                    tracing::info!(%goal, output = ?outcome.output, "Self-improvement applied");
                }
                Ok(outcome) => {
                    tracing::warn!(
                        %goal,
                        error = ?outcome.error,
                        blocked = ?outcome.block_reason,
                        "Self-improvement did not complete"
                    );
                }
                Err(_) => tracing::warn!(%goal, "Self-improvement timed out"),
            }
        }
        Ok(())
    }

    /// 存活记录：不占用模式
    pub(crate) async fn heartbeat_cycle(&self) -> HiveResult<()> {
        let now = Utc::now();
        {
            let mut ledger = self.ledger.lock().await;
            ledger.last_heartbeat = Some(now);
            self.ledger_store.save(&ledger)?;
        }
        let stats = self.commitments.lock().await.stats();
        let social = self.social_conversations.lock().await.len();
        let forge = self.forge_conversations.lock().await.len();
        let failing: Vec<&str> = self
            .telemetry
            .snapshot()
            .into_iter()
            .filter(|(_, health)| health.consecutive_failures > 0)
            .map(|(name, _)| name)
            .collect();
        tracing::info!(
            mode = %self.modes.current(),
            social_conversations = social,
            forge_conversations = forge,
            commitments_pending = stats.pending,
            commitments_failed = stats.failed,
            failing_loops = ?failing,
            "Heartbeat"
        );
        Ok(())
    }
}
