//! 会话簿记：通知游标、已处理通知、近期自有帖子及其互动数据、各类活动的最近时间
//!
//! 与会话状态、承诺队列一样是独立的版本化 JSON 文件。

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::conversation::Platform;
use crate::platform::PostMetrics;

pub(crate) const LEDGER_VERSION: u32 = 1;
const SEEN_LIMIT: usize = 500;
const POST_LIMIT: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OwnPost {
    pub uri: String,
    pub text: String,
    pub posted_at: DateTime<Utc>,
    pub metrics: Option<PostMetrics>,
    pub metrics_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionLedger {
    pub session_started: DateTime<Utc>,
    pub social_cursor: Option<DateTime<Utc>>,
    pub forge_cursor: Option<DateTime<Utc>>,
    seen: VecDeque<String>,
    pub recent_posts: VecDeque<OwnPost>,
    pub last_expression: Option<DateTime<Utc>>,
    pub last_reflection: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl Default for SessionLedger {
    fn default() -> Self {
        Self {
            session_started: Utc::now(),
            social_cursor: None,
            forge_cursor: None,
            seen: VecDeque::new(),
            recent_posts: VecDeque::new(),
            last_expression: None,
            last_reflection: None,
            last_heartbeat: None,
        }
    }
}

impl SessionLedger {
    pub fn begin_session(&mut self, now: DateTime<Utc>) {
        self.session_started = now;
    }

    fn cursor(&self, platform: Platform) -> Option<DateTime<Utc>> {
        match platform {
            Platform::Social => self.social_cursor,
            Platform::Forge => self.forge_cursor,
        }
    }

    /// 通知是否尚未处理：不早于游标，且 id 未见过
    pub fn is_new(&self, platform: Platform, id: &str, at: DateTime<Utc>) -> bool {
        let after_cursor = self.cursor(platform).map_or(true, |c| at >= c);
        after_cursor && !self.seen.iter().any(|s| s == id)
    }

    pub fn mark_seen(&mut self, platform: Platform, id: &str, at: DateTime<Utc>) {
        self.seen.push_back(id.to_string());
        while self.seen.len() > SEEN_LIMIT {
            self.seen.pop_front();
        }
        let cursor = match platform {
            Platform::Social => &mut self.social_cursor,
            Platform::Forge => &mut self.forge_cursor,
        };
        if cursor.map_or(true, |c| at > c) {
            *cursor = Some(at);
        }
    }

    pub fn note_post(&mut self, uri: &str, text: &str, now: DateTime<Utc>) {
        self.recent_posts.push_back(OwnPost {
            uri: uri.to_string(),
            text: text.to_string(),
            posted_at: now,
            metrics: None,
            metrics_at: None,
        });
        while self.recent_posts.len() > POST_LIMIT {
            self.recent_posts.pop_front();
        }
    }

    /// 需要刷新互动数据的帖子：发布不超过 `window`，且距上次刷新超过 `every`
    pub fn posts_due_for_metrics(&self, now: DateTime<Utc>, window: Duration, every: Duration) -> Vec<String> {
        self.recent_posts
            .iter()
            .filter(|p| now - p.posted_at <= window)
            .filter(|p| p.metrics_at.map_or(true, |at| now - at >= every))
            .map(|p| p.uri.clone())
            .collect()
    }

    pub fn record_metrics(&mut self, uri: &str, metrics: PostMetrics, now: DateTime<Utc>) {
        if let Some(post) = self.recent_posts.iter_mut().find(|p| p.uri == uri) {
            post.metrics = Some(metrics);
            post.metrics_at = Some(now);
        }
    }
}
