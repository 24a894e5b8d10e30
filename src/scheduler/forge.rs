//! 代码托管平台的感知与回复周期

use chrono::Utc;

use crate::commitment::ExtractionContext;
use crate::conversation::{forge_key, ConclusionReason, Platform, ResponseDecision, SkipReason};
use crate::core::jitter::response_jitter_within;
use crate::core::{tolerate, HiveResult, Mode};
use crate::platform::{core_tool_definitions, ChatMessage, ForgeNotification, ForgeReason, ReviewVerdict};
use crate::scheduler::prompts;
use crate::scheduler::SchedulerInner;

fn links_work(n: &ForgeNotification) -> bool {
    n.is_pull_request || matches!(n.reason, ForgeReason::ReviewRequested | ForgeReason::Assigned)
}

impl SchedulerInner {
    pub(crate) async fn forge_awareness_cycle(&self) -> HiveResult<()> {
        let Some(mut guard) = self.modes.try_enter(Mode::Awareness) else {
            return Ok(());
        };
        let agent = &self.config.agent;
        let now = Utc::now();

        let since = self.ledger.lock().await.forge_cursor;
        let notifications = self.collab.forge.list_notifications(since).await?;
        let mut fresh: Vec<ForgeNotification> = {
            let ledger = self.ledger.lock().await;
            notifications
                .into_iter()
                .filter(|n| ledger.is_new(Platform::Forge, &n.id, n.updated_at))
                .collect()
        };
        if fresh.is_empty() {
            return Ok(());
        }
        fresh.sort_by_key(|n| n.updated_at);

        let mut candidates: Vec<ForgeNotification> = Vec::new();
        {
            let mut tracker = self.forge_conversations.lock().await;
            for n in &fresh {
                if n.author.eq_ignore_ascii_case(&agent.forge_login) {
                    continue;
                }
                let key = forge_key(&n.repo, n.number);
                if agent.is_peer(&n.author) && tracker.get(&key).is_some() {
                    tracker.record_peer_activity(&key, &n.author, &n.body, n.updated_at);
                    continue;
                }
                tracker.record_inbound(&key, &n.author, &n.body, n.updated_at);
                if links_work(n) {
                    tracker.mark_work_linked(&key, now);
                }
                candidates.retain(|c| c.repo != n.repo || c.number != n.number);
                candidates.push(n.clone());
            }
        }

        {
            let mut ledger = self.ledger.lock().await;
            for n in &fresh {
                ledger.mark_seen(Platform::Forge, &n.id, n.updated_at);
            }
            self.ledger_store.save(&ledger)?;
        }

        let mut respond_to = Vec::new();
        {
            let mut tracker = self.forge_conversations.lock().await;
            for n in candidates {
                let key = forge_key(&n.repo, n.number);
                match tracker.should_respond(&key) {
                    ResponseDecision::Respond { .. } => respond_to.push(n),
                    ResponseDecision::Skip(SkipReason::ReplyLimit) => {
                        tracker.conclude(&key, ConclusionReason::ReplyLimit, now);
                    }
                    ResponseDecision::Skip(reason) => {
                        tracing::debug!(key = %key, ?reason, "Not responding");
                    }
                }
            }
            tracker.save()?;
        }
        respond_to.truncate(self.config.scheduler.max_responses_per_cycle);
        tracing::info!(fresh = fresh.len(), replies = respond_to.len(), "Forge awareness pass");
        if respond_to.is_empty() {
            return Ok(());
        }

        guard.switch(Mode::PlatformBResponding);
        for n in &respond_to {
            if let Err(e) = self.answer_forge(n).await {
                if e.is_fatal() {
                    self.forge_conversations.lock().await.save()?;
                    return Err(e);
                }
                tracing::warn!(repo = %n.repo, number = n.number, error = %e, "Forge reply failed");
            }
        }

        self.forge_conversations.lock().await.save()?;
        self.commitments.lock().await.save()?;
        Ok(())
    }

    async fn answer_forge(&self, n: &ForgeNotification) -> HiveResult<()> {
        let agent = &self.config.agent;
        let key = forge_key(&n.repo, n.number);

        if agent.has_peers() {
            let (min, max) = self.config.scheduler.response_jitter_bounds();
            tokio::time::sleep(response_jitter_within(&agent.id, min, max)).await;

            // 抖动期间同一 issue 上的新评论
            let later = tolerate(
                "forge notifications",
                self.collab.forge.list_notifications(Some(n.updated_at)).await,
            )?
            .unwrap_or_default();
            let answers: Vec<_> = later
                .iter()
                .filter(|m| m.repo == n.repo && m.number == n.number)
                .filter(|m| m.author.eq_ignore_ascii_case(&agent.forge_login) || agent.is_peer(&m.author))
                .collect();
            if !answers.is_empty() {
                let mut tracker = self.forge_conversations.lock().await;
                for m in answers.iter().filter(|m| agent.is_peer(&m.author)) {
                    tracker.record_peer_activity(&key, &m.author, &m.body, m.updated_at);
                }
                tracing::info!(key = %key, "Already answered, standing down");
                return Ok(());
            }
        }

        let (warning, history) = {
            let tracker = self.forge_conversations.lock().await;
            let warning = match tracker.should_respond(&key) {
                ResponseDecision::Respond { warning } => warning,
                ResponseDecision::Skip(reason) => {
                    tracing::debug!(key = %key, ?reason, "Re-check says skip");
                    return Ok(());
                }
            };
            let history = match tracker.get(&key) {
                Some(conv) => prompts::history_messages(conv),
                None => vec![ChatMessage::user(format!("@{}: {}", n.author, n.body))],
            };
            (warning, history)
        };

        let system = prompts::forge_reply_system(&agent.persona, &agent.forge_login, n, warning.as_deref());
        let mut tools = core_tool_definitions();
        tools.extend(self.collab.dispatcher.definitions());
        let reply = self
            .collab
            .generator
            .chat_with_tools(&system, &history, &tools)
            .await?;
        let effects = self.apply_tool_calls(&reply.tool_calls, &n.id).await?;
        let now = Utc::now();

        if let Some(exit) = effects.exit {
            let closing = exit
                .closing_message
                .as_deref()
                .map(str::trim)
                .filter(|t| !t.is_empty());
            if let Some(text) = closing {
                let posted = tolerate(
                    "closing comment",
                    self.collab.forge.create_comment(&n.repo, n.number, text).await,
                )?;
                if posted.is_some() {
                    self.forge_conversations
                        .lock()
                        .await
                        .record_outbound(&key, &agent.forge_login, None, text, now);
                }
            }
            tracing::info!(key = %key, reason = %exit.reason, "Leaving conversation");
            self.forge_conversations
                .lock()
                .await
                .conclude(&key, ConclusionReason::ExplicitClose, now);
            return Ok(());
        }

        if effects.work_linked {
            self.forge_conversations.lock().await.mark_work_linked(&key, now);
        }
        let text = reply.text.trim();
        if text.is_empty() {
            tracing::debug!(key = %key, "Generator produced no reply text");
            return Ok(());
        }

        if n.is_pull_request && n.reason == ForgeReason::ReviewRequested {
            self.collab
                .forge
                .create_review(&n.repo, n.number, ReviewVerdict::Comment, text)
                .await?;
        } else {
            self.collab.forge.create_comment(&n.repo, n.number, text).await?;
        }
        self.forge_conversations
            .lock()
            .await
            .record_outbound(&key, &agent.forge_login, None, text, now);
        tracing::info!(key = %key, "Commented");

        let ctx = ExtractionContext {
            repo: Some(n.repo.clone()),
            thread_root: key.clone(),
            parent: key.clone(),
        };
        self.capture_commitments(text, &ctx, &n.id, now).await;
        Ok(())
    }
}
