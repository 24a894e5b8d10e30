//! 会话状态跟踪
//!
//! 每个平台一个 ConversationTracker，按会话键（社交平台为线程根 URI，代码托管平台为 `owner/repo#N`）
//! 维护状态机：active → awaiting_response（我方刚回复）→ concluded。
//! 结束状态是粘性的：之后的收尾语、表情、点赞都不会重新打开会话；只有实质性的新消息可以，
//! 且由循环检测或显式结束导致的结束永远不会被重新打开。

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ConversationSection;
use crate::conversation::signals::{self, CircularAssessment, Confidence, ExchangeMessage, MessageSignal};
use crate::core::HiveResult;
use crate::persistence::JsonStore;
use crate::platform::RepoRef;

const STORE_VERSION: u32 = 1;
/// 每个会话保留的最近消息数
const MESSAGE_HISTORY: usize = 16;
const MESSAGE_TEXT_LIMIT: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Social,
    Forge,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Social => "social",
            Platform::Forge => "forge",
        }
    }
}

/// 代码托管平台会话键：`owner/repo#N`
pub fn forge_key(repo: &RepoRef, number: u64) -> String {
    format!("{repo}#{number}")
}

/// 解析 `owner/repo#N`；社交平台的线程 URI 返回 None
pub fn parse_forge_key(key: &str) -> Option<(RepoRef, u64)> {
    let (repo, number) = key.rsplit_once('#')?;
    let number = number.parse().ok()?;
    let repo = repo.parse().ok()?;
    Some((repo, number))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
    Active,
    AwaitingResponse,
    Concluded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConclusionReason {
    /// 我方调用 graceful_exit
    ExplicitClose,
    /// 对方发来致谢 / 告别
    ClosingMessage,
    EmojiOnly,
    /// 对方点赞了我方回复而没有回复
    LikeWithoutReply,
    Circular,
    ReplyLimit,
}

impl ConclusionReason {
    /// 这类结束之后，实质性消息也不会重新打开会话
    pub fn is_final(&self) -> bool {
        matches!(self, ConclusionReason::ExplicitClose | ConclusionReason::Circular)
    }
}

impl fmt::Display for ConclusionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConclusionReason::ExplicitClose => "explicit close",
            ConclusionReason::ClosingMessage => "closing message",
            ConclusionReason::EmojiOnly => "emoji-only reply",
            ConclusionReason::LikeWithoutReply => "like without reply",
            ConclusionReason::Circular => "circular exchange",
            ConclusionReason::ReplyLimit => "reply limit reached",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEntry {
    pub author: String,
    pub from_self: bool,
    pub text: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantActivity {
    pub messages: u32,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub key: String,
    pub platform: Platform,
    pub state: ConversationState,
    pub participants: BTreeMap<String, ParticipantActivity>,
    pub messages: VecDeque<MessageEntry>,
    /// 我方在该会话中发出的回复数
    pub our_replies: u32,
    /// 往来消息总数
    pub depth: u32,
    /// 我方帖子的 URI，用于把点赞映射回会话
    #[serde(default)]
    pub our_posts: Vec<String>,
    pub conclusion: Option<ConclusionReason>,
    /// 关联到计划 / PR 的会话不受回复上限约束
    #[serde(default)]
    pub work_linked: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    fn new(key: &str, platform: Platform, now: DateTime<Utc>) -> Self {
        Self {
            key: key.to_string(),
            platform,
            state: ConversationState::Active,
            participants: BTreeMap::new(),
            messages: VecDeque::new(),
            our_replies: 0,
            depth: 0,
            our_posts: Vec::new(),
            conclusion: None,
            work_linked: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_concluded(&self) -> bool {
        self.state == ConversationState::Concluded
    }

    fn push_message(&mut self, author: &str, from_self: bool, text: &str, at: DateTime<Utc>) {
        let text: String = text.chars().take(MESSAGE_TEXT_LIMIT).collect();
        self.messages.push_back(MessageEntry {
            author: author.to_string(),
            from_self,
            text,
            at,
        });
        while self.messages.len() > MESSAGE_HISTORY {
            self.messages.pop_front();
        }
        let activity = self
            .participants
            .entry(author.to_string())
            .or_insert(ParticipantActivity { messages: 0, last_seen: at });
        activity.messages += 1;
        activity.last_seen = at;
        self.depth += 1;
        self.updated_at = at;
    }

    fn conclude(&mut self, reason: ConclusionReason, at: DateTime<Utc>) {
        self.state = ConversationState::Concluded;
        self.conclusion = Some(reason);
        self.updated_at = at;
    }

    fn circular(&self, window: usize) -> Option<CircularAssessment> {
        let exchange: Vec<ExchangeMessage<'_>> = self
            .messages
            .iter()
            .map(|m| ExchangeMessage {
                from_self: m.from_self,
                text: &m.text,
            })
            .collect();
        signals::detect_circular(&exchange, window)
    }
}

/// 每个平台的会话策略
#[derive(Debug, Clone)]
pub struct ConversationPolicy {
    pub max_replies: u32,
    pub circular_window: usize,
    pub block_at: Confidence,
    pub prune_after: Duration,
}

impl ConversationPolicy {
    pub fn for_platform(cfg: &ConversationSection, platform: Platform) -> Self {
        Self {
            max_replies: match platform {
                Platform::Social => cfg.max_social_replies,
                Platform::Forge => cfg.max_forge_replies,
            },
            circular_window: cfg.circular_window,
            block_at: cfg.circular_block_at,
            prune_after: Duration::days(cfg.prune_days),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    Concluded(ConclusionReason),
    /// 我方已回复，对方尚未再发言
    AwaitingResponse,
    ReplyLimit,
    Circular(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseDecision {
    /// 可以回复；`warning` 为低置信度循环提示，拼进提示词
    Respond { warning: Option<String> },
    Skip(SkipReason),
}

impl ResponseDecision {
    pub fn should_respond(&self) -> bool {
        matches!(self, ResponseDecision::Respond { .. })
    }
}

pub struct ConversationTracker {
    platform: Platform,
    policy: ConversationPolicy,
    conversations: HashMap<String, Conversation>,
    store: Option<JsonStore<HashMap<String, Conversation>>>,
}

impl ConversationTracker {
    /// 纯内存跟踪器
    pub fn new(platform: Platform, policy: ConversationPolicy) -> Self {
        Self {
            platform,
            policy,
            conversations: HashMap::new(),
            store: None,
        }
    }

    /// 从状态文件恢复，并立即清理过期会话
    pub fn open(platform: Platform, policy: ConversationPolicy, path: &Path) -> HiveResult<Self> {
        let store = JsonStore::new(path, STORE_VERSION);
        let conversations = store.load()?;
        let mut tracker = Self {
            platform,
            policy,
            conversations,
            store: Some(store),
        };
        let pruned = tracker.prune(Utc::now());
        tracing::debug!(
            platform = platform.as_str(),
            loaded = tracker.len(),
            pruned,
            "Conversation state loaded"
        );
        Ok(tracker)
    }

    pub fn save(&self) -> HiveResult<()> {
        if let Some(store) = &self.store {
            store.save(&self.conversations)?;
        }
        Ok(())
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn get(&self, key: &str) -> Option<&Conversation> {
        self.conversations.get(key)
    }

    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    fn entry(&mut self, key: &str, now: DateTime<Utc>) -> &mut Conversation {
        let platform = self.platform;
        self.conversations
            .entry(key.to_string())
            .or_insert_with(|| Conversation::new(key, platform, now))
    }

    /// 记录一条他人发来的消息，返回更新后的状态
    pub fn record_inbound(
        &mut self,
        key: &str,
        author: &str,
        text: &str,
        now: DateTime<Utc>,
    ) -> ConversationState {
        let window = self.policy.circular_window;
        let block_at = self.policy.block_at;
        let conv = self.entry(key, now);
        conv.push_message(author, false, text, now);

        let signal = signals::classify(text);

        if conv.is_concluded() {
            let reopenable = conv.conclusion.map_or(true, |r| !r.is_final());
            if signal == MessageSignal::Substantive && reopenable {
                tracing::debug!(key, author, "Substantive message reopened conversation");
                conv.state = ConversationState::Active;
                conv.conclusion = None;
            }
            return conv.state;
        }

        match signal {
            MessageSignal::EmojiOnly => conv.conclude(ConclusionReason::EmojiOnly, now),
            MessageSignal::Closing => conv.conclude(ConclusionReason::ClosingMessage, now),
            MessageSignal::Substantive => {
                conv.state = ConversationState::Active;
                if let Some(found) = conv.circular(window) {
                    if found.confidence >= block_at {
                        tracing::info!(key, reason = %found.reason, "Circular exchange detected, concluding");
                        conv.conclude(ConclusionReason::Circular, now);
                    }
                }
            }
        }
        conv.state
    }

    /// 记录同伴对同一消息的回复：只更新参与者日志，不改变状态
    pub fn record_peer_activity(&mut self, key: &str, author: &str, text: &str, at: DateTime<Utc>) {
        if let Some(conv) = self.conversations.get_mut(key) {
            let before = conv.state;
            conv.push_message(author, false, text, at);
            conv.state = before;
        }
    }

    /// 记录我方发出的回复
    pub fn record_outbound(
        &mut self,
        key: &str,
        author: &str,
        post_uri: Option<&str>,
        text: &str,
        now: DateTime<Utc>,
    ) {
        let conv = self.entry(key, now);
        conv.push_message(author, true, text, now);
        conv.our_replies += 1;
        if let Some(uri) = post_uri {
            conv.our_posts.push(uri.to_string());
        }
        if !conv.is_concluded() {
            conv.state = ConversationState::AwaitingResponse;
        }
    }

    /// 我方帖子被点赞；若对方点赞而没有回复，会话结束
    ///
    /// 返回该点赞是否结束了会话。
    pub fn record_like(&mut self, post_uri: &str, liker: &str, now: DateTime<Utc>) -> bool {
        let Some(conv) = self
            .conversations
            .values_mut()
            .find(|c| c.our_posts.iter().any(|p| p == post_uri))
        else {
            return false;
        };
        if conv.state != ConversationState::AwaitingResponse {
            return false;
        }
        let replied_after = conv
            .messages
            .iter()
            .rev()
            .take_while(|m| !m.from_self)
            .any(|m| m.author.eq_ignore_ascii_case(liker));
        if replied_after {
            return false;
        }
        tracing::debug!(key = %conv.key, liker, "Like without reply, concluding");
        conv.conclude(ConclusionReason::LikeWithoutReply, now);
        true
    }

    /// 查找包含某条我方帖子的会话键
    pub fn key_for_post(&self, post_uri: &str) -> Option<&str> {
        self.conversations
            .values()
            .find(|c| c.our_posts.iter().any(|p| p == post_uri))
            .map(|c| c.key.as_str())
    }

    pub fn conclude(&mut self, key: &str, reason: ConclusionReason, now: DateTime<Utc>) {
        let conv = self.entry(key, now);
        if !conv.is_concluded() {
            tracing::info!(key, %reason, "Conversation concluded");
        }
        conv.conclude(reason, now);
    }

    pub fn mark_work_linked(&mut self, key: &str, now: DateTime<Utc>) {
        self.entry(key, now).work_linked = true;
    }

    /// 是否应当回复该会话
    pub fn should_respond(&self, key: &str) -> ResponseDecision {
        let Some(conv) = self.conversations.get(key) else {
            return ResponseDecision::Respond { warning: None };
        };

        match conv.state {
            ConversationState::Concluded => {
                let reason = conv.conclusion.unwrap_or(ConclusionReason::ClosingMessage);
                return ResponseDecision::Skip(SkipReason::Concluded(reason));
            }
            ConversationState::AwaitingResponse => {
                return ResponseDecision::Skip(SkipReason::AwaitingResponse);
            }
            ConversationState::Active => {}
        }

        if !conv.work_linked && conv.our_replies >= self.policy.max_replies {
            return ResponseDecision::Skip(SkipReason::ReplyLimit);
        }

        match conv.circular(self.policy.circular_window) {
            Some(found) if found.confidence >= self.policy.block_at => {
                ResponseDecision::Skip(SkipReason::Circular(found.reason))
            }
            Some(found) => ResponseDecision::Respond {
                warning: Some(format!(
                    "This exchange may be going in circles ({}). Only reply if you add something new, otherwise end it.",
                    found.reason
                )),
            },
            None => ResponseDecision::Respond { warning: None },
        }
    }

    /// 删除超过保留期未更新的会话
    pub fn prune(&mut self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.policy.prune_after;
        let before = self.conversations.len();
        self.conversations.retain(|_, c| c.updated_at >= cutoff);
        before - self.conversations.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(platform: Platform) -> ConversationTracker {
        ConversationTracker::new(
            platform,
            ConversationPolicy::for_platform(&ConversationSection::default(), platform),
        )
    }

    const ROOT: &str = "at://alice/post/1";

    #[test]
    fn test_forge_key_round_trip() {
        let repo = RepoRef::new("octo", "hive");
        let key = forge_key(&repo, 12);
        assert_eq!(key, "octo/hive#12");
        assert_eq!(parse_forge_key(&key), Some((repo, 12)));
        assert_eq!(parse_forge_key(ROOT), None);
    }

    #[test]
    fn test_reply_moves_to_awaiting() {
        let mut t = tracker(Platform::Social);
        let now = Utc::now();
        assert_eq!(
            t.record_inbound(ROOT, "alice", "How do you schedule peers?", now),
            ConversationState::Active
        );
        assert!(t.should_respond(ROOT).should_respond());
        t.record_outbound(ROOT, "hive", Some("at://hive/post/9"), "With jittered timers.", now);
        assert_eq!(t.get(ROOT).unwrap().state, ConversationState::AwaitingResponse);
        assert_eq!(t.should_respond(ROOT), ResponseDecision::Skip(SkipReason::AwaitingResponse));
    }

    #[test]
    fn test_concluded_stays_concluded_after_terminal_messages() {
        let mut t = tracker(Platform::Social);
        let now = Utc::now();
        t.record_inbound(ROOT, "alice", "Can you explain the queue?", now);
        t.record_outbound(ROOT, "hive", None, "It is durable.", now);
        t.record_inbound(ROOT, "alice", "Thanks!", now);
        assert!(t.get(ROOT).unwrap().is_concluded());

        for text in ["thank you so much", "👍", "ok cool", "🙏🙏"] {
            assert_eq!(t.record_inbound(ROOT, "alice", text, now), ConversationState::Concluded);
            assert!(!t.should_respond(ROOT).should_respond());
        }
    }

    #[test]
    fn test_substantive_message_reopens_soft_conclusion() {
        let mut t = tracker(Platform::Social);
        let now = Utc::now();
        t.record_inbound(ROOT, "alice", "👍", now);
        assert!(t.get(ROOT).unwrap().is_concluded());
        assert_eq!(
            t.record_inbound(ROOT, "alice", "Actually, how are retries capped in recovery", now),
            ConversationState::Active
        );
    }

    #[test]
    fn test_explicit_close_is_never_reopened() {
        let mut t = tracker(Platform::Social);
        let now = Utc::now();
        t.record_inbound(ROOT, "alice", "Let's keep debating tabs versus spaces", now);
        t.conclude(ROOT, ConclusionReason::ExplicitClose, now);
        assert_eq!(
            t.record_inbound(ROOT, "alice", "But seriously, spaces are objectively better here", now),
            ConversationState::Concluded
        );
    }

    #[test]
    fn test_like_without_reply_concludes() {
        let mut t = tracker(Platform::Social);
        let now = Utc::now();
        t.record_inbound(ROOT, "alice", "What does the coordinator do on a lost race", now);
        t.record_outbound(ROOT, "hive", Some("at://hive/post/2"), "It defers to the winner.", now);
        assert_eq!(t.key_for_post("at://hive/post/2"), Some(ROOT));
        assert!(t.record_like("at://hive/post/2", "alice", now));
        assert_eq!(
            t.get(ROOT).unwrap().conclusion,
            Some(ConclusionReason::LikeWithoutReply)
        );
        assert!(!t.record_like("at://hive/post/unknown", "alice", now));
    }

    #[test]
    fn test_reply_cap_and_work_link_exemption() {
        let mut t = tracker(Platform::Social);
        let now = Utc::now();
        let exchanges = [
            ("Why order the gates with hygiene first", "Merge commits poison everything after"),
            ("Which runner gets picked for mixed repos", "Cargo wins, then npm, go, pytest"),
            ("Do pushes get retried on rejection", "No, the gate fails closed instead"),
            ("What triggers orphan recovery exactly", "A blocked unassigned task with a branch"),
        ];
        for (question, answer) in exchanges {
            t.record_inbound(ROOT, "alice", question, now);
            t.record_outbound(ROOT, "hive", None, answer, now);
        }
        t.record_inbound(ROOT, "alice", "Last one, how long is the settle delay", now);
        assert_eq!(t.should_respond(ROOT), ResponseDecision::Skip(SkipReason::ReplyLimit));

        t.mark_work_linked(ROOT, now);
        assert!(t.should_respond(ROOT).should_respond());
    }

    #[test]
    fn test_circular_exchange_concludes() {
        let mut t = tracker(Platform::Forge);
        let now = Utc::now();
        let key = "octo/hive#12";
        t.record_inbound(key, "peer", "Agreed!", now);
        t.record_outbound(key, "hive", None, "Exactly, well said", now);
        assert_eq!(
            t.record_inbound(key, "peer", "So true", now),
            ConversationState::Concluded
        );
        assert_eq!(t.get(key).unwrap().conclusion, Some(ConclusionReason::Circular));
        assert!(!t.should_respond(key).should_respond());
    }

    #[test]
    fn test_prune_and_persist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("social.json");
        let policy = ConversationPolicy::for_platform(&ConversationSection::default(), Platform::Social);

        let mut t = ConversationTracker::open(Platform::Social, policy.clone(), &path).unwrap();
        let old = Utc::now() - Duration::days(10);
        t.record_inbound("at://old/1", "bob", "Old question about caching layers", old);
        t.record_inbound(ROOT, "alice", "Fresh question about plan parsing", Utc::now());
        t.save().unwrap();

        let reopened = ConversationTracker::open(Platform::Social, policy, &path).unwrap();
        assert_eq!(reopened.len(), 1);
        assert!(reopened.get(ROOT).is_some());
    }
}
