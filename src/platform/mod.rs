//! 外部协作方抽象
//!
//! 核心只依赖这些 trait：社交平台（SocialClient）、代码托管平台（ForgeClient）、
//! 本地仓库操作（RepoWorkspace）、编码代理（CodingAgent）、内容生成（ContentGenerator / ToolDispatcher）
//! 与远程版本源（VersionSource）。所有调用对普通 API 失败返回 `Err(PlatformError)`，从不 panic。

pub mod coder;
pub mod forge;
pub mod generator;
pub mod mock;
pub mod social;
pub mod version;
pub mod workspace;

use thiserror::Error;

pub use coder::{CodingAgent, CodingOutcome};
pub use forge::{
    ForgeClient, ForgeNotification, ForgeReason, Issue, IssueState, IssueUpdate, NewIssue,
    NewPullRequest, PrState, PrStateFilter, PullRequest, RepoRef, ReviewVerdict,
};
pub use generator::{
    core_tool_definitions, ChatMessage, ChatReply, ChatRole, ContentGenerator, GracefulExitArgs,
    SelfImproveArgs, ToolCall, ToolDefinition, ToolDispatcher, ToolOutcome, GRACEFUL_EXIT,
    SELF_IMPROVE,
};
pub use social::{
    Notification, NotificationKind, PostMetrics, PostRef, ReplyTarget, SocialClient, ThreadPost,
};
pub use version::{HttpVersionSource, VersionSource};
pub use workspace::{discover_test_command, GitWorkspace, RepoWorkspace, TestCommand, TestOutcome};

/// 协作方调用错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlatformError {
    /// 凭证 / 认证失败：唯一被视为致命的错误类别
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Rate limited (retry after {retry_after_secs:?}s)")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("{0}")]
    Other(String),
}

impl PlatformError {
    /// 认证类错误：调度器应停止全部循环并退出进程
    pub fn is_fatal(&self) -> bool {
        matches!(self, PlatformError::Auth(_))
    }
}

pub type PlatformResult<T> = Result<T, PlatformError>;
