//! 社交平台客户端抽象（平台 A）

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::platform::PlatformResult;

/// 已发布帖子的引用
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PostRef {
    pub uri: String,
}

/// 回复目标：直接父帖与线程根帖
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyTarget {
    pub parent: String,
    pub root: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Reply,
    Mention,
    Quote,
    Like,
    Repost,
    Follow,
}

impl NotificationKind {
    /// 是否为需要考虑回应的消息类通知
    pub fn is_message(&self) -> bool {
        matches!(
            self,
            NotificationKind::Reply | NotificationKind::Mention | NotificationKind::Quote
        )
    }
}

/// 通知
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub kind: NotificationKind,
    /// 作者 handle
    pub author: String,
    /// 消息类通知的正文；点赞 / 关注为空
    #[serde(default)]
    pub text: String,
    /// 通知本身对应的帖子 URI
    pub uri: String,
    /// 回复的父帖
    pub parent: Option<String>,
    /// 线程根帖；为空时以 uri 作为根
    pub root: Option<String>,
    /// 点赞 / 转发的目标帖
    pub subject: Option<String>,
    pub indexed_at: DateTime<Utc>,
}

impl Notification {
    /// 会话键：线程根，缺省为帖子本身
    pub fn thread_root(&self) -> &str {
        self.root.as_deref().unwrap_or(&self.uri)
    }
}

/// 线程中的一条帖子（用于回复前的刷新视图）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadPost {
    pub uri: String,
    pub author: String,
    pub text: String,
    pub parent: Option<String>,
    pub indexed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostMetrics {
    pub likes: u32,
    pub replies: u32,
    pub reposts: u32,
}

#[async_trait]
pub trait SocialClient: Send + Sync {
    async fn post_text(&self, text: &str) -> PlatformResult<PostRef>;

    async fn reply(&self, text: &str, target: &ReplyTarget) -> PlatformResult<PostRef>;

    async fn like(&self, uri: &str) -> PlatformResult<()>;

    /// 最近的通知，按时间倒序
    async fn list_notifications(&self, limit: usize) -> PlatformResult<Vec<Notification>>;

    /// 线程的当前视图，用于「是否仍应回复」的复查
    async fn get_thread(&self, root_uri: &str) -> PlatformResult<Vec<ThreadPost>>;

    async fn post_metrics(&self, uri: &str) -> PlatformResult<PostMetrics>;

    /// 刷新会话令牌；认证失败返回 `PlatformError::Auth`
    async fn refresh_session(&self) -> PlatformResult<()>;
}
