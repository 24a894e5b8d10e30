//! 持久化承诺队列
//!
//! 回复里许下的承诺（"I'll open an issue for that"）被提取成 Commitment 入队，由固定间隔的履约循环逐个执行。
//! 状态流转：pending → in_progress → completed | failed；24 小时无进展的被扫为 abandoned。
//! 至少一次语义：进程在 in_progress 期间退出时，重新打开队列会把这些承诺放回 pending 重试。

use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::CommitmentSection;
use crate::core::HiveResult;
use crate::persistence::JsonStore;

const STORE_VERSION: u32 = 1;

pub type CommitmentId = String;

/// 承诺类型（封闭集合）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitmentKind {
    CreateIssue,
    CreatePlan,
    PostFollowUp,
}

impl CommitmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommitmentKind::CreateIssue => "create_issue",
            CommitmentKind::CreatePlan => "create_plan",
            CommitmentKind::PostFollowUp => "post_follow_up",
        }
    }

    /// 直接动作（工具调用）名对应的承诺类型，用于本会话「已直接完成」标记
    pub fn from_action(name: &str) -> Option<Self> {
        match name {
            "create_issue" => Some(CommitmentKind::CreateIssue),
            "create_plan" => Some(CommitmentKind::CreatePlan),
            "post_follow_up" | "follow_up" => Some(CommitmentKind::PostFollowUp),
            _ => None,
        }
    }
}

impl fmt::Display for CommitmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitmentStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Abandoned,
}

impl CommitmentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CommitmentStatus::Completed | CommitmentStatus::Failed | CommitmentStatus::Abandoned
        )
    }
}

/// 类型化的履约参数；类型由变体决定
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommitmentParams {
    CreateIssue {
        /// owner/name；为空时使用配置的默认仓库
        repo: Option<String>,
        title: String,
        body: String,
    },
    CreatePlan {
        repo: Option<String>,
        title: String,
        goal: String,
    },
    PostFollowUp {
        topic: String,
        /// 回复到哪个线程
        thread_root: String,
        parent: String,
    },
}

impl CommitmentParams {
    pub fn kind(&self) -> CommitmentKind {
        match self {
            CommitmentParams::CreateIssue { .. } => CommitmentKind::CreateIssue,
            CommitmentParams::CreatePlan { .. } => CommitmentKind::CreatePlan,
            CommitmentParams::PostFollowUp { .. } => CommitmentKind::PostFollowUp,
        }
    }
}

/// 提取出的、尚未入队的承诺
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitmentDraft {
    pub description: String,
    pub params: CommitmentParams,
}

impl CommitmentDraft {
    pub fn kind(&self) -> CommitmentKind {
        self.params.kind()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Commitment {
    pub id: CommitmentId,
    pub description: String,
    pub status: CommitmentStatus,
    pub source_thread_uri: String,
    pub source_reply_text: String,
    pub params: CommitmentParams,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub attempts: u32,
    pub result: Option<String>,
    pub error: Option<String>,
}

impl Commitment {
    pub fn kind(&self) -> CommitmentKind {
        self.params.kind()
    }
}

/// 本会话中已经通过直接动作完成的事项，按 (类型, 轮次) 记录
///
/// 轮次是产生回复的那次交互（通知 URI、或一次发帖周期的标识）。同一轮里既调用了 create_issue
/// 又在文字里说了 "I'll file an issue"，文字中的承诺不再入队。
#[derive(Debug, Default)]
pub struct SessionActions {
    performed: HashSet<(CommitmentKind, String)>,
}

impl SessionActions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, kind: CommitmentKind, turn: &str) {
        self.performed.insert((kind, turn.to_string()));
    }

    pub fn already_fulfilled(&self, kind: CommitmentKind, turn: &str) -> bool {
        self.performed.contains(&(kind, turn.to_string()))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub abandoned: usize,
}

pub struct CommitmentQueue {
    items: Vec<Commitment>,
    stale_after: Duration,
    retain: Duration,
    store: Option<JsonStore<Vec<Commitment>>>,
}

impl CommitmentQueue {
    pub fn new(cfg: &CommitmentSection) -> Self {
        Self {
            items: Vec::new(),
            stale_after: Duration::hours(cfg.stale_hours),
            retain: Duration::days(cfg.retain_days),
            store: None,
        }
    }

    pub fn open(cfg: &CommitmentSection, path: &Path) -> HiveResult<Self> {
        let store = JsonStore::new(path, STORE_VERSION);
        let mut items: Vec<Commitment> = store.load()?;
        let mut requeued = 0;
        for c in items.iter_mut().filter(|c| c.status == CommitmentStatus::InProgress) {
            c.status = CommitmentStatus::Pending;
            requeued += 1;
        }
        if requeued > 0 {
            tracing::info!(requeued, "Interrupted commitments returned to pending");
        }
        let queue = Self {
            items,
            stale_after: Duration::hours(cfg.stale_hours),
            retain: Duration::days(cfg.retain_days),
            store: Some(store),
        };
        tracing::debug!(entries = queue.items.len(), "Commitment queue loaded");
        Ok(queue)
    }

    pub fn save(&self) -> HiveResult<()> {
        if let Some(store) = &self.store {
            store.save(&self.items)?;
        }
        Ok(())
    }

    /// 入队；同一线程已有同类型的待办承诺时返回 None
    pub fn enqueue(
        &mut self,
        draft: CommitmentDraft,
        source_thread_uri: &str,
        source_reply_text: &str,
        now: DateTime<Utc>,
    ) -> Option<CommitmentId> {
        let kind = draft.kind();
        let duplicate = self.items.iter().any(|c| {
            c.kind() == kind
                && c.source_thread_uri == source_thread_uri
                && !c.status.is_terminal()
        });
        if duplicate {
            tracing::debug!(%kind, thread = source_thread_uri, "Commitment already queued for thread");
            return None;
        }

        let id = format!("commitment_{}", uuid::Uuid::new_v4());
        tracing::info!(id = %id, %kind, description = %draft.description, "Commitment queued");
        self.items.push(Commitment {
            id: id.clone(),
            description: draft.description,
            status: CommitmentStatus::Pending,
            source_thread_uri: source_thread_uri.to_string(),
            source_reply_text: source_reply_text.to_string(),
            params: draft.params,
            created_at: now,
            updated_at: now,
            attempts: 0,
            result: None,
            error: None,
        });
        Some(id)
    }

    pub fn get(&self, id: &str) -> Option<&Commitment> {
        self.items.iter().find(|c| c.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Commitment> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// 按入队顺序的待办承诺 id
    pub fn pending_ids(&self) -> Vec<CommitmentId> {
        self.items
            .iter()
            .filter(|c| c.status == CommitmentStatus::Pending)
            .map(|c| c.id.clone())
            .collect()
    }

    fn transition(&mut self, id: &str, now: DateTime<Utc>, f: impl FnOnce(&mut Commitment)) -> bool {
        match self.items.iter_mut().find(|c| c.id == id) {
            Some(c) => {
                f(c);
                c.updated_at = now;
                true
            }
            None => false,
        }
    }

    /// pending → in_progress；返回副本供履约使用
    pub fn start(&mut self, id: &str, now: DateTime<Utc>) -> Option<Commitment> {
        let item = self
            .items
            .iter_mut()
            .find(|c| c.id == id && c.status == CommitmentStatus::Pending)?;
        item.status = CommitmentStatus::InProgress;
        item.attempts += 1;
        item.updated_at = now;
        Some(item.clone())
    }

    pub fn complete(&mut self, id: &str, result: impl Into<String>, now: DateTime<Utc>) -> bool {
        let result = result.into();
        self.transition(id, now, |c| {
            c.status = CommitmentStatus::Completed;
            c.result = Some(result);
            c.error = None;
        })
    }

    pub fn fail(&mut self, id: &str, error: impl Into<String>, now: DateTime<Utc>) -> bool {
        let error = error.into();
        self.transition(id, now, |c| {
            c.status = CommitmentStatus::Failed;
            c.error = Some(error);
        })
    }

    /// 超过陈旧期未推进的 pending / in_progress 承诺标记为 abandoned
    pub fn sweep_stale(&mut self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.stale_after;
        let mut swept = 0;
        for c in self.items.iter_mut() {
            if !c.status.is_terminal() && c.updated_at < cutoff {
                tracing::warn!(id = %c.id, kind = %c.kind(), "Commitment stale, abandoning");
                c.status = CommitmentStatus::Abandoned;
                c.updated_at = now;
                swept += 1;
            }
        }
        swept
    }

    /// 删除保留期之前结束的终态承诺
    pub fn prune(&mut self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.retain;
        let before = self.items.len();
        self.items
            .retain(|c| !(c.status.is_terminal() && c.updated_at < cutoff));
        before - self.items.len()
    }

    pub fn stats(&self) -> QueueStats {
        let mut stats = QueueStats::default();
        for c in &self.items {
            match c.status {
                CommitmentStatus::Pending => stats.pending += 1,
                CommitmentStatus::InProgress => stats.in_progress += 1,
                CommitmentStatus::Completed => stats.completed += 1,
                CommitmentStatus::Failed => stats.failed += 1,
                CommitmentStatus::Abandoned => stats.abandoned += 1,
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issue_draft(title: &str) -> CommitmentDraft {
        CommitmentDraft {
            description: format!("Open an issue: {title}"),
            params: CommitmentParams::CreateIssue {
                repo: Some("octo/hive".into()),
                title: title.into(),
                body: String::new(),
            },
        }
    }

    #[test]
    fn test_lifecycle() {
        let mut q = CommitmentQueue::new(&CommitmentSection::default());
        let now = Utc::now();
        let id = q.enqueue(issue_draft("Flaky test"), "at://t/1", "I'll file an issue", now).unwrap();
        assert_eq!(q.pending_ids(), vec![id.clone()]);

        let started = q.start(&id, now).unwrap();
        assert_eq!(started.status, CommitmentStatus::InProgress);
        assert!(q.start(&id, now).is_none());
        assert!(q.pending_ids().is_empty());

        assert!(q.complete(&id, "octo/hive#7", now));
        let done = q.get(&id).unwrap();
        assert_eq!(done.status, CommitmentStatus::Completed);
        assert_eq!(done.attempts, 1);
    }

    #[test]
    fn test_one_pending_per_kind_and_thread() {
        let mut q = CommitmentQueue::new(&CommitmentSection::default());
        let now = Utc::now();
        assert!(q.enqueue(issue_draft("A"), "at://t/1", "", now).is_some());
        assert!(q.enqueue(issue_draft("B"), "at://t/1", "", now).is_none());
        assert!(q.enqueue(issue_draft("B"), "at://t/2", "", now).is_some());
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_sweep_stale_and_prune() {
        let mut q = CommitmentQueue::new(&CommitmentSection::default());
        let old = Utc::now() - Duration::hours(25);
        let now = Utc::now();
        let stale = q.enqueue(issue_draft("old"), "at://t/1", "", old).unwrap();
        let fresh = q.enqueue(issue_draft("new"), "at://t/2", "", now).unwrap();

        assert_eq!(q.sweep_stale(now), 1);
        assert_eq!(q.get(&stale).unwrap().status, CommitmentStatus::Abandoned);
        assert_eq!(q.get(&fresh).unwrap().status, CommitmentStatus::Pending);

        assert_eq!(q.prune(now + Duration::days(8)), 1);
        assert!(q.get(&stale).is_none());
        assert!(q.get(&fresh).is_some());
    }

    #[test]
    fn test_session_actions() {
        let mut actions = SessionActions::new();
        actions.record(CommitmentKind::CreateIssue, "at://t/1");
        assert!(actions.already_fulfilled(CommitmentKind::CreateIssue, "at://t/1"));
        assert!(!actions.already_fulfilled(CommitmentKind::CreateIssue, "at://t/2"));
        assert!(!actions.already_fulfilled(CommitmentKind::CreatePlan, "at://t/1"));
        assert_eq!(CommitmentKind::from_action("create_issue"), Some(CommitmentKind::CreateIssue));
        assert_eq!(CommitmentKind::from_action("like"), None);
    }

    #[test]
    fn test_persisted_queue_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("commitments.json");
        let cfg = CommitmentSection::default();
        let mut q = CommitmentQueue::open(&cfg, &path).unwrap();
        let id = q.enqueue(issue_draft("persist"), "at://t/1", "", Utc::now()).unwrap();
        q.save().unwrap();

        let reloaded = CommitmentQueue::open(&cfg, &path).unwrap();
        let item = reloaded.get(&id).unwrap();
        assert_eq!(item.kind(), CommitmentKind::CreateIssue);
        assert_eq!(item.status, CommitmentStatus::Pending);
    }

    #[test]
    fn test_interrupted_commitment_is_retried_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("commitments.json");
        let cfg = CommitmentSection::default();
        let now = Utc::now();
        let mut q = CommitmentQueue::open(&cfg, &path).unwrap();
        let id = q.enqueue(issue_draft("interrupted"), "at://t/1", "", now).unwrap();
        q.start(&id, now).unwrap();
        q.save().unwrap();
        drop(q);

        let mut reloaded = CommitmentQueue::open(&cfg, &path).unwrap();
        assert_eq!(reloaded.pending_ids(), vec![id.clone()]);
        assert_eq!(reloaded.sweep_stale(now + Duration::hours(1)), 0);

        let retried = reloaded.start(&id, now).unwrap();
        assert_eq!(retried.attempts, 2);
        assert!(reloaded.complete(&id, "octo/hive#3", now));
        assert_eq!(reloaded.get(&id).unwrap().status, CommitmentStatus::Completed);
    }
}
