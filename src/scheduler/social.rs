//! 社交平台相关周期：通知感知与回复、主动发帖、互动数据回收

use chrono::{Duration as ChronoDuration, Utc};

use crate::commitment::ExtractionContext;
use crate::conversation::{ConclusionReason, Platform, ResponseDecision, SkipReason};
use crate::core::jitter::response_jitter_within;
use crate::core::{tolerate, HiveResult, Mode};
use crate::platform::{core_tool_definitions, ChatMessage, Notification, NotificationKind, ReplyTarget};
use crate::scheduler::prompts;
use crate::scheduler::SchedulerInner;

impl SchedulerInner {
    pub(crate) async fn session_refresh_cycle(&self) -> HiveResult<()> {
        self.collab.social.refresh_session().await?;
        tracing::debug!("Social session refreshed");
        Ok(())
    }

    /// 拉取新通知、更新会话状态，并在 responding 模式下逐个回复
    pub(crate) async fn social_awareness_cycle(&self) -> HiveResult<()> {
        let Some(mut guard) = self.modes.try_enter(Mode::Awareness) else {
            return Ok(());
        };
        let agent = &self.config.agent;
        let now = Utc::now();

        let notifications = self
            .collab
            .social
            .list_notifications(self.config.scheduler.notification_limit)
            .await?;
        let mut fresh: Vec<Notification> = {
            let ledger = self.ledger.lock().await;
            notifications
                .into_iter()
                .filter(|n| ledger.is_new(Platform::Social, &n.id, n.indexed_at))
                .collect()
        };
        if fresh.is_empty() {
            return Ok(());
        }
        fresh.sort_by_key(|n| n.indexed_at);

        // 每个线程只保留最新一条待回复消息
        let mut candidates: Vec<Notification> = Vec::new();
        {
            let mut tracker = self.social_conversations.lock().await;
            for n in &fresh {
                if n.author.eq_ignore_ascii_case(&agent.handle) {
                    continue;
                }
                match n.kind {
                    NotificationKind::Like => {
                        if let Some(subject) = &n.subject {
                            tracker.record_like(subject, &n.author, n.indexed_at);
                        }
                    }
                    kind if kind.is_message() => {
                        let key = n.thread_root();
                        if agent.is_peer(&n.author) && tracker.get(key).is_some() {
                            tracker.record_peer_activity(key, &n.author, &n.text, n.indexed_at);
                            continue;
                        }
                        tracker.record_inbound(key, &n.author, &n.text, n.indexed_at);
                        candidates.retain(|c| c.thread_root() != key);
                        candidates.push(n.clone());
                    }
                    _ => {}
                }
            }
        }

        // 先标记已读再回复：回复软失败时该通知直接跳过，不会重复回复
        {
            let mut ledger = self.ledger.lock().await;
            for n in &fresh {
                ledger.mark_seen(Platform::Social, &n.id, n.indexed_at);
            }
            self.ledger_store.save(&ledger)?;
        }

        let mut respond_to = Vec::new();
        {
            let mut tracker = self.social_conversations.lock().await;
            for n in candidates {
                let key = n.thread_root().to_string();
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
        tracing::info!(fresh = fresh.len(), replies = respond_to.len(), "Social awareness pass");
        if respond_to.is_empty() {
            return Ok(());
        }

        guard.switch(Mode::Responding);
        for n in &respond_to {
            if let Err(e) = self.answer_social(n).await {
                if e.is_fatal() {
                    self.social_conversations.lock().await.save()?;
                    return Err(e);
                }
                tracing::warn!(uri = %n.uri, error = %e, "Reply failed");
            }
        }

        self.social_conversations.lock().await.save()?;
        self.commitments.lock().await.save()?;
        Ok(())
    }

    /// 回复一条通知：先抖动并复查，再生成、发送，最后捕获回复中的承诺
    async fn answer_social(&self, n: &Notification) -> HiveResult<()> {
        let agent = &self.config.agent;
        let key = n.thread_root().to_string();

        if agent.has_peers() {
            let (min, max) = self.config.scheduler.response_jitter_bounds();
            tokio::time::sleep(response_jitter_within(&agent.id, min, max)).await;

            if let Some(thread) = tolerate("get_thread", self.collab.social.get_thread(&key).await)? {
                let answers: Vec<_> = thread
                    .iter()
                    .filter(|p| p.parent.as_deref() == Some(n.uri.as_str()))
                    .filter(|p| p.author.eq_ignore_ascii_case(&agent.handle) || agent.is_peer(&p.author))
                    .collect();
                if !answers.is_empty() {
                    let mut tracker = self.social_conversations.lock().await;
                    for p in answers.iter().filter(|p| agent.is_peer(&p.author)) {
                        tracker.record_peer_activity(&key, &p.author, &p.text, p.indexed_at);
                    }
                    tracing::info!(uri = %n.uri, "Already answered, standing down");
                    return Ok(());
                }
            }
        }

        let (warning, history) = {
            let tracker = self.social_conversations.lock().await;
            let warning = match tracker.should_respond(&key) {
                ResponseDecision::Respond { warning } => warning,
                ResponseDecision::Skip(reason) => {
                    tracing::debug!(key = %key, ?reason, "Re-check says skip");
                    return Ok(());
                }
            };
            let history = match tracker.get(&key) {
                Some(conv) => prompts::history_messages(conv),
                None => vec![ChatMessage::user(format!("@{}: {}", n.author, n.text))],
            };
            (warning, history)
        };

        let system = prompts::social_reply_system(&agent.persona, &agent.handle, warning.as_deref());
        let mut tools = core_tool_definitions();
        tools.extend(self.collab.dispatcher.definitions());
        let reply = self
            .collab
            .generator
            .chat_with_tools(&system, &history, &tools)
            .await?;
        let effects = self.apply_tool_calls(&reply.tool_calls, &n.uri).await?;

        let target = ReplyTarget {
            parent: n.uri.clone(),
            root: key.clone(),
        };
        let now = Utc::now();

        if let Some(exit) = effects.exit {
            let closing = exit
                .closing_message
                .as_deref()
                .map(str::trim)
                .filter(|t| !t.is_empty());
            if let Some(text) = closing {
                if let Some(post) = tolerate("closing reply", self.collab.social.reply(text, &target).await)? {
                    self.social_conversations
                        .lock()
                        .await
                        .record_outbound(&key, &agent.handle, Some(&post.uri), text, now);
                    self.ledger.lock().await.note_post(&post.uri, text, now);
                }
            }
            tracing::info!(key = %key, reason = %exit.reason, "Leaving conversation");
            self.social_conversations
                .lock()
                .await
                .conclude(&key, ConclusionReason::ExplicitClose, now);
            return Ok(());
        }

        if effects.work_linked {
            self.social_conversations.lock().await.mark_work_linked(&key, now);
        }
        let text = reply.text.trim();
        if text.is_empty() {
            tracing::debug!(key = %key, "Generator produced no reply text");
            return Ok(());
        }

        let post = self.collab.social.reply(text, &target).await?;
        self.social_conversations
            .lock()
            .await
            .record_outbound(&key, &agent.handle, Some(&post.uri), text, now);
        self.ledger.lock().await.note_post(&post.uri, text, now);
        tracing::info!(key = %key, uri = %post.uri, "Replied");

        let ctx = ExtractionContext {
            repo: None,
            thread_root: key.clone(),
            parent: post.uri.clone(),
        };
        self.capture_commitments(text, &ctx, &n.uri, now).await;
        Ok(())
    }

    /// 主动发一条帖子
    pub(crate) async fn expression_cycle(&self) -> HiveResult<()> {
        let Some(_guard) = self.modes.try_enter(Mode::Expressing) else {
            return Ok(());
        };
        let recent: Vec<_> = {
            let ledger = self.ledger.lock().await;
            let skip = ledger.recent_posts.len().saturating_sub(10);
            ledger.recent_posts.iter().skip(skip).cloned().collect()
        };
        let system = prompts::expression_system(&self.config.agent.persona);
        let messages = [ChatMessage::user(prompts::recent_posts_summary(&recent))];
        let tools = self.collab.dispatcher.definitions();
        let reply = self
            .collab
            .generator
            .chat_with_tools(&system, &messages, &tools)
            .await?;

        let now = Utc::now();
        let turn = format!("expression-{}", now.timestamp());
        self.apply_tool_calls(&reply.tool_calls, &turn).await?;
        let text = reply.text.trim();
        if text.is_empty() {
            tracing::debug!("Nothing to say this time");
            return Ok(());
        }

        let post = self.collab.social.post_text(text).await?;
        tracing::info!(uri = %post.uri, "Posted");
        {
            let mut ledger = self.ledger.lock().await;
            ledger.note_post(&post.uri, text, now);
            ledger.last_expression = Some(now);
            self.ledger_store.save(&ledger)?;
        }

        let ctx = ExtractionContext {
            repo: None,
            thread_root: post.uri.clone(),
            parent: post.uri.clone(),
        };
        if self.capture_commitments(text, &ctx, &turn, now).await > 0 {
            self.commitments.lock().await.save()?;
        }
        Ok(())
    }

    /// 回收近期帖子的互动数据，供反思使用
    pub(crate) async fn engagement_cycle(&self) -> HiveResult<()> {
        let Some(_guard) = self.modes.try_enter(Mode::Awareness) else {
            return Ok(());
        };
        let now = Utc::now();
        let due = self.ledger.lock().await.posts_due_for_metrics(
            now,
            ChronoDuration::days(2),
            ChronoDuration::hours(1),
        );
        if due.is_empty() {
            return Ok(());
        }

        let mut updated = 0;
        for uri in &due {
            if let Some(metrics) = tolerate("post_metrics", self.collab.social.post_metrics(uri).await)? {
                self.ledger.lock().await.record_metrics(uri, metrics, now);
                updated += 1;
            }
        }
        tracing::debug!(due = due.len(), updated, "Engagement metrics refreshed");
        let ledger = self.ledger.lock().await;
        self.ledger_store.save(&ledger)?;
        Ok(())
    }
}
