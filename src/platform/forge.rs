//! 代码托管平台客户端抽象（平台 B）：issue / PR 增删改查、分支查询、通知

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::platform::PlatformResult;

/// 仓库坐标 owner/name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RepoRef {
    pub owner: String,
    pub name: String,
}

impl RepoRef {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for RepoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

impl FromStr for RepoRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().split_once('/') {
            Some((owner, name)) if !owner.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(Self::new(owner, name))
            }
            _ => Err(format!("Invalid repository coordinate: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueState {
    Open,
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub number: u64,
    pub title: String,
    pub body: String,
    pub state: IssueState,
    #[serde(default)]
    pub labels: Vec<String>,
    pub author: String,
    #[serde(default)]
    pub is_pull_request: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewIssue {
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub labels: Vec<String>,
}

/// 整体更新 issue；None 字段保持不变
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IssueUpdate {
    pub title: Option<String>,
    pub body: Option<String>,
    pub state: Option<IssueState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrState {
    Open,
    Closed,
    Merged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrStateFilter {
    Open,
    All,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    pub title: String,
    /// 源分支名
    pub head: String,
    pub base: String,
    pub state: PrState,
    pub author: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPullRequest {
    pub title: String,
    pub body: String,
    pub head: String,
    pub base: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewVerdict {
    Approve,
    RequestChanges,
    Comment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForgeReason {
    Mention,
    Comment,
    ReviewRequested,
    Assigned,
}

/// 代码托管平台通知：某个 issue / PR 上的新动态
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForgeNotification {
    pub id: String,
    pub repo: RepoRef,
    pub number: u64,
    pub title: String,
    pub reason: ForgeReason,
    #[serde(default)]
    pub is_pull_request: bool,
    /// 最新评论作者
    pub author: String,
    /// 最新评论正文
    pub body: String,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait ForgeClient: Send + Sync {
    /// 打开状态的 issue；label 为 Some 时只返回带该标签的
    async fn list_issues(&self, repo: &RepoRef, label: Option<&str>) -> PlatformResult<Vec<Issue>>;

    async fn get_issue(&self, repo: &RepoRef, number: u64) -> PlatformResult<Issue>;

    async fn create_issue(&self, repo: &RepoRef, issue: &NewIssue) -> PlatformResult<Issue>;

    async fn update_issue(
        &self,
        repo: &RepoRef,
        number: u64,
        update: &IssueUpdate,
    ) -> PlatformResult<Issue>;

    async fn create_comment(&self, repo: &RepoRef, number: u64, body: &str) -> PlatformResult<()>;

    async fn list_pull_requests(
        &self,
        repo: &RepoRef,
        filter: PrStateFilter,
    ) -> PlatformResult<Vec<PullRequest>>;

    async fn create_pull_request(
        &self,
        repo: &RepoRef,
        pr: &NewPullRequest,
    ) -> PlatformResult<PullRequest>;

    async fn merge_pull_request(&self, repo: &RepoRef, number: u64) -> PlatformResult<()>;

    async fn create_review(
        &self,
        repo: &RepoRef,
        number: u64,
        verdict: ReviewVerdict,
        body: &str,
    ) -> PlatformResult<()>;

    async fn request_reviewers(
        &self,
        repo: &RepoRef,
        number: u64,
        reviewers: &[String],
    ) -> PlatformResult<()>;

    /// 远端分支名列表
    async fn list_branches(&self, repo: &RepoRef) -> PlatformResult<Vec<String>>;

    /// 独立确认远端分支存在（推送后的校验）
    async fn verify_remote_branch(&self, repo: &RepoRef, branch: &str) -> PlatformResult<bool>;

    async fn list_notifications(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> PlatformResult<Vec<ForgeNotification>>;

    /// 克隆地址
    fn clone_url(&self, repo: &RepoRef) -> String {
        format!("https://github.com/{repo}.git")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repo_ref_parse() {
        let repo: RepoRef = "octo/hive".parse().unwrap();
        assert_eq!(repo, RepoRef::new("octo", "hive"));
        assert_eq!(repo.to_string(), "octo/hive");
        assert!("octo".parse::<RepoRef>().is_err());
        assert!("a/b/c".parse::<RepoRef>().is_err());
        assert!("/hive".parse::<RepoRef>().is_err());
    }
}
