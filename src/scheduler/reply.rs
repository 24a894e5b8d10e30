//! 回复周期共用的部分：工具调用的解释与承诺捕获

use chrono::{DateTime, Utc};

use crate::commitment::{extract_commitments, CommitmentKind, ExtractionContext};
use crate::core::{tolerate, HiveResult};
use crate::platform::{GracefulExitArgs, SelfImproveArgs, ToolCall, GRACEFUL_EXIT, SELF_IMPROVE};
use crate::scheduler::SchedulerInner;

/// 一轮工具调用对会话产生的影响
#[derive(Debug, Default)]
pub(crate) struct ToolEffects {
    pub(crate) exit: Option<GracefulExitArgs>,
    /// 本轮直接创建了 issue / 计划，会话因此关联到工作
    pub(crate) work_linked: bool,
}

impl SchedulerInner {
    /// 解释 `graceful_exit` / `self_improve`，其余交给分发器；成功的直接动作按轮次登记
    pub(crate) async fn apply_tool_calls(&self, calls: &[ToolCall], turn: &str) -> HiveResult<ToolEffects> {
        let mut effects = ToolEffects::default();
        for call in calls {
            match call.name.as_str() {
                GRACEFUL_EXIT => {
                    let args = serde_json::from_value::<GracefulExitArgs>(call.arguments.clone())
                        .unwrap_or_else(|e| {
                            tracing::warn!(error = %e, "Malformed graceful_exit arguments");
                            GracefulExitArgs {
                                reason: "unspecified".to_string(),
                                closing_message: None,
                            }
                        });
                    effects.exit = Some(args);
                }
                SELF_IMPROVE => match serde_json::from_value::<SelfImproveArgs>(call.arguments.clone()) {
                    Ok(args) => {
                        tracing::info!(goal = %args.goal, "Self-improvement requested");
                        self.improvement_requests.lock().await.push(args.goal);
                    }
                    Err(e) => tracing::warn!(error = %e, "Malformed self_improve arguments"),
                },
                name => {
                    let Some(outcome) = tolerate(name, self.collab.dispatcher.dispatch(call).await)? else {
                        continue;
                    };
                    if !outcome.success {
                        tracing::warn!(tool = name, summary = %outcome.summary, "Tool call reported failure");
                        continue;
                    }
                    if let Some(kind) = CommitmentKind::from_action(name) {
                        self.session_actions.lock().await.record(kind, turn);
                        if kind != CommitmentKind::PostFollowUp {
                            effects.work_linked = true;
                        }
                    }
                }
            }
        }
        Ok(effects)
    }

    /// 从我方刚发出的文本中提取承诺入队；本轮已直接完成的同类动作不再入队
    pub(crate) async fn capture_commitments(
        &self,
        text: &str,
        ctx: &ExtractionContext,
        turn: &str,
        now: DateTime<Utc>,
    ) -> usize {
        let drafts = extract_commitments(text, ctx);
        if drafts.is_empty() {
            return 0;
        }
        let actions = self.session_actions.lock().await;
        let mut queue = self.commitments.lock().await;
        let mut queued = 0;
        for draft in drafts {
            if actions.already_fulfilled(draft.kind(), turn) {
                tracing::debug!(kind = %draft.kind(), turn, "Promise already kept by a direct action");
                continue;
            }
            if queue.enqueue(draft, &ctx.thread_root, text, now).is_some() {
                queued += 1;
            }
        }
        queued
    }
}
