//! 内存中的协作方实现（测试与本地演练用，不访问网络）
//!
//! 每个操作先 `yield_now` 一次，再在锁内同步完成。这样 `tokio::join!` 并发跑的两个实例会逐步交错，
//! 可以稳定复现「都读到旧文档、先后写入、回读发现被覆盖」的竞争。

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::platform::{
    ChatMessage, ChatReply, CodingAgent, CodingOutcome, ContentGenerator, ForgeClient,
    ForgeNotification, Issue, IssueState, IssueUpdate, NewIssue, NewPullRequest, Notification,
    PlatformError, PlatformResult, PostMetrics, PostRef, PrState, PrStateFilter, PullRequest,
    RepoRef, RepoWorkspace, ReplyTarget, ReviewVerdict, SocialClient, TestOutcome, ThreadPost,
    ToolCall, ToolDefinition, ToolDispatcher, ToolOutcome, VersionSource,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn step() {
    tokio::task::yield_now().await;
}

// ---------------------------------------------------------------------------
// 社交平台
// ---------------------------------------------------------------------------

/// 本实例发出的一条帖子
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockPost {
    pub uri: String,
    pub text: String,
    pub reply_to: Option<ReplyTarget>,
}

#[derive(Default)]
struct SocialState {
    posts: Vec<MockPost>,
    likes: Vec<String>,
    notifications: Vec<Notification>,
    threads: HashMap<String, Vec<ThreadPost>>,
    metrics: HashMap<String, PostMetrics>,
    refreshes: usize,
}

pub struct MockSocial {
    handle: String,
    state: Mutex<SocialState>,
    next_id: AtomicU64,
    auth_failed: AtomicBool,
}

impl MockSocial {
    pub fn new(handle: impl Into<String>) -> Self {
        Self {
            handle: handle.into(),
            state: Mutex::new(SocialState::default()),
            next_id: AtomicU64::new(1),
            auth_failed: AtomicBool::new(false),
        }
    }

    pub fn handle(&self) -> &str {
        &self.handle
    }

    /// 之后所有调用都返回认证失败
    pub fn fail_auth(&self, failed: bool) {
        self.auth_failed.store(failed, Ordering::SeqCst);
    }

    pub fn push_notification(&self, notification: Notification) {
        let mut state = lock(&self.state);
        let root = notification.thread_root().to_string();
        if notification.kind.is_message() {
            state.threads.entry(root).or_default().push(ThreadPost {
                uri: notification.uri.clone(),
                author: notification.author.clone(),
                text: notification.text.clone(),
                parent: notification.parent.clone(),
                indexed_at: notification.indexed_at,
            });
        }
        state.notifications.push(notification);
    }

    /// 构造一条回复通知并加入收件箱
    pub fn push_reply(&self, author: &str, text: &str, root: &str, parent: &str, at: DateTime<Utc>) -> String {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let uri = format!("at://{author}/post/{id}");
        self.push_notification(Notification {
            id: format!("n-{id}"),
            kind: crate::platform::NotificationKind::Reply,
            author: author.to_string(),
            text: text.to_string(),
            uri: uri.clone(),
            parent: Some(parent.to_string()),
            root: Some(root.to_string()),
            subject: None,
            indexed_at: at,
        });
        uri
    }

    pub fn set_thread(&self, root: &str, posts: Vec<ThreadPost>) {
        lock(&self.state).threads.insert(root.to_string(), posts);
    }

    pub fn set_metrics(&self, uri: &str, metrics: PostMetrics) {
        lock(&self.state).metrics.insert(uri.to_string(), metrics);
    }

    pub fn posts(&self) -> Vec<MockPost> {
        lock(&self.state).posts.clone()
    }

    pub fn replies(&self) -> Vec<MockPost> {
        lock(&self.state)
            .posts
            .iter()
            .filter(|p| p.reply_to.is_some())
            .cloned()
            .collect()
    }

    pub fn likes(&self) -> Vec<String> {
        lock(&self.state).likes.clone()
    }

    pub fn refresh_count(&self) -> usize {
        lock(&self.state).refreshes
    }

    fn check_auth(&self) -> PlatformResult<()> {
        if self.auth_failed.load(Ordering::SeqCst) {
            Err(PlatformError::Auth("session expired".to_string()))
        } else {
            Ok(())
        }
    }

    fn publish(&self, text: &str, reply_to: Option<ReplyTarget>) -> PostRef {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let uri = format!("at://{}/post/{id}", self.handle);
        let mut state = lock(&self.state);
        if let Some(target) = &reply_to {
            let post = ThreadPost {
                uri: uri.clone(),
                author: self.handle.clone(),
                text: text.to_string(),
                parent: Some(target.parent.clone()),
                indexed_at: Utc::now(),
            };
            state.threads.entry(target.root.clone()).or_default().push(post);
        }
        state.posts.push(MockPost {
            uri: uri.clone(),
            text: text.to_string(),
            reply_to,
        });
        PostRef { uri }
    }
}

#[async_trait]
impl SocialClient for MockSocial {
    async fn post_text(&self, text: &str) -> PlatformResult<PostRef> {
        step().await;
        self.check_auth()?;
        Ok(self.publish(text, None))
    }

    async fn reply(&self, text: &str, target: &ReplyTarget) -> PlatformResult<PostRef> {
        step().await;
        self.check_auth()?;
        Ok(self.publish(text, Some(target.clone())))
    }

    async fn like(&self, uri: &str) -> PlatformResult<()> {
        step().await;
        self.check_auth()?;
        lock(&self.state).likes.push(uri.to_string());
        Ok(())
    }

    async fn list_notifications(&self, limit: usize) -> PlatformResult<Vec<Notification>> {
        step().await;
        self.check_auth()?;
        let state = lock(&self.state);
        let mut items = state.notifications.clone();
        items.sort_by(|a, b| b.indexed_at.cmp(&a.indexed_at));
        items.truncate(limit);
        Ok(items)
    }

    async fn get_thread(&self, root_uri: &str) -> PlatformResult<Vec<ThreadPost>> {
        step().await;
        self.check_auth()?;
        Ok(lock(&self.state)
            .threads
            .get(root_uri)
            .cloned()
            .unwrap_or_default())
    }

    async fn post_metrics(&self, uri: &str) -> PlatformResult<PostMetrics> {
        step().await;
        self.check_auth()?;
        Ok(lock(&self.state).metrics.get(uri).copied().unwrap_or_default())
    }

    async fn refresh_session(&self) -> PlatformResult<()> {
        step().await;
        self.check_auth()?;
        lock(&self.state).refreshes += 1;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// 代码托管平台
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockReview {
    pub number: u64,
    pub verdict: ReviewVerdict,
    pub body: String,
}

#[derive(Default)]
struct ForgeState {
    issues: BTreeMap<(RepoRef, u64), Issue>,
    comments: HashMap<(RepoRef, u64), Vec<String>>,
    pulls: BTreeMap<(RepoRef, u64), PullRequest>,
    next_number: HashMap<RepoRef, u64>,
    branches: HashMap<RepoRef, BTreeSet<String>>,
    reviewers: Vec<(RepoRef, u64, Vec<String>)>,
    reviews: Vec<MockReview>,
    notifications: Vec<ForgeNotification>,
    body_writes: usize,
}

impl ForgeState {
    fn allocate(&mut self, repo: &RepoRef) -> u64 {
        let next = self.next_number.entry(repo.clone()).or_insert(1);
        let number = *next;
        *next += 1;
        number
    }
}

pub struct MockForge {
    login: String,
    state: Mutex<ForgeState>,
    auth_failed: AtomicBool,
    pull_requests_failing: AtomicBool,
}

impl MockForge {
    pub fn new(login: impl Into<String>) -> Self {
        Self {
            login: login.into(),
            state: Mutex::new(ForgeState::default()),
            auth_failed: AtomicBool::new(false),
            pull_requests_failing: AtomicBool::new(false),
        }
    }

    pub fn fail_auth(&self, failed: bool) {
        self.auth_failed.store(failed, Ordering::SeqCst);
    }

    /// 打开后 create_pull_request 返回 502
    pub fn fail_pull_requests(&self, failing: bool) {
        self.pull_requests_failing.store(failing, Ordering::SeqCst);
    }

    /// 直接插入一个打开的 issue，返回编号
    pub fn insert_issue(&self, repo: &RepoRef, title: &str, body: &str, labels: &[&str]) -> u64 {
        let mut state = lock(&self.state);
        let number = state.allocate(repo);
        state.issues.insert(
            (repo.clone(), number),
            Issue {
                number,
                title: title.to_string(),
                body: body.to_string(),
                state: IssueState::Open,
                labels: labels.iter().map(|l| l.to_string()).collect(),
                author: self.login.clone(),
                is_pull_request: false,
            },
        );
        number
    }

    pub fn issue(&self, repo: &RepoRef, number: u64) -> Option<Issue> {
        lock(&self.state).issues.get(&(repo.clone(), number)).cloned()
    }

    pub fn issue_body(&self, repo: &RepoRef, number: u64) -> Option<String> {
        self.issue(repo, number).map(|i| i.body)
    }

    /// 模拟外部编辑
    pub fn set_issue_body(&self, repo: &RepoRef, number: u64, body: &str) {
        if let Some(issue) = lock(&self.state).issues.get_mut(&(repo.clone(), number)) {
            issue.body = body.to_string();
        }
    }

    pub fn issues(&self, repo: &RepoRef) -> Vec<Issue> {
        lock(&self.state)
            .issues
            .iter()
            .filter(|((r, _), _)| r == repo)
            .map(|(_, i)| i.clone())
            .collect()
    }

    pub fn comments(&self, repo: &RepoRef, number: u64) -> Vec<String> {
        lock(&self.state)
            .comments
            .get(&(repo.clone(), number))
            .cloned()
            .unwrap_or_default()
    }

    pub fn pull_requests(&self, repo: &RepoRef) -> Vec<PullRequest> {
        lock(&self.state)
            .pulls
            .iter()
            .filter(|((r, _), _)| r == repo)
            .map(|(_, p)| p.clone())
            .collect()
    }

    /// 模拟其他实例开的 PR
    pub fn add_pull_request(&self, repo: &RepoRef, head: &str, author: &str, state: PrState) -> u64 {
        let mut inner = lock(&self.state);
        let number = inner.allocate(repo);
        inner.pulls.insert(
            (repo.clone(), number),
            PullRequest {
                number,
                title: format!("Work on {head}"),
                head: head.to_string(),
                base: "main".to_string(),
                state,
                author: author.to_string(),
                url: format!("https://forge.test/{repo}/pull/{number}"),
            },
        );
        number
    }

    pub fn add_branch(&self, repo: &RepoRef, branch: &str) {
        lock(&self.state)
            .branches
            .entry(repo.clone())
            .or_default()
            .insert(branch.to_string());
    }

    pub fn branches(&self, repo: &RepoRef) -> Vec<String> {
        lock(&self.state)
            .branches
            .get(repo)
            .map(|b| b.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn requested_reviewers(&self) -> Vec<(RepoRef, u64, Vec<String>)> {
        lock(&self.state).reviewers.clone()
    }

    pub fn reviews(&self) -> Vec<MockReview> {
        lock(&self.state).reviews.clone()
    }

    pub fn push_notification(&self, notification: ForgeNotification) {
        lock(&self.state).notifications.push(notification);
    }

    /// 计划正文被写入的次数
    pub fn body_writes(&self) -> usize {
        lock(&self.state).body_writes
    }

    fn check_auth(&self) -> PlatformResult<()> {
        if self.auth_failed.load(Ordering::SeqCst) {
            Err(PlatformError::Auth("token revoked".to_string()))
        } else {
            Ok(())
        }
    }

    fn not_found(repo: &RepoRef, number: u64) -> PlatformError {
        PlatformError::NotFound(format!("{repo}#{number}"))
    }
}

#[async_trait]
impl ForgeClient for MockForge {
    async fn list_issues(&self, repo: &RepoRef, label: Option<&str>) -> PlatformResult<Vec<Issue>> {
        step().await;
        self.check_auth()?;
        Ok(lock(&self.state)
            .issues
            .iter()
            .filter(|((r, _), i)| {
                r == repo
                    && i.state == IssueState::Open
                    && label.map_or(true, |l| i.labels.iter().any(|x| x == l))
            })
            .map(|(_, i)| i.clone())
            .collect())
    }

    async fn get_issue(&self, repo: &RepoRef, number: u64) -> PlatformResult<Issue> {
        step().await;
        self.check_auth()?;
        self.issue(repo, number).ok_or_else(|| Self::not_found(repo, number))
    }

    async fn create_issue(&self, repo: &RepoRef, issue: &NewIssue) -> PlatformResult<Issue> {
        step().await;
        self.check_auth()?;
        let labels: Vec<&str> = issue.labels.iter().map(String::as_str).collect();
        let number = self.insert_issue(repo, &issue.title, &issue.body, &labels);
        self.issue(repo, number).ok_or_else(|| Self::not_found(repo, number))
    }

    async fn update_issue(
        &self,
        repo: &RepoRef,
        number: u64,
        update: &IssueUpdate,
    ) -> PlatformResult<Issue> {
        step().await;
        self.check_auth()?;
        let mut state = lock(&self.state);
        let wrote_body = update.body.is_some();
        let issue = state
            .issues
            .get_mut(&(repo.clone(), number))
            .ok_or_else(|| Self::not_found(repo, number))?;
        if let Some(title) = &update.title {
            issue.title = title.clone();
        }
        if let Some(body) = &update.body {
            issue.body = body.clone();
        }
        if let Some(s) = update.state {
            issue.state = s;
        }
        let updated = issue.clone();
        if wrote_body {
            state.body_writes += 1;
        }
        Ok(updated)
    }

    async fn create_comment(&self, repo: &RepoRef, number: u64, body: &str) -> PlatformResult<()> {
        step().await;
        self.check_auth()?;
        lock(&self.state)
            .comments
            .entry((repo.clone(), number))
            .or_default()
            .push(body.to_string());
        Ok(())
    }

    async fn list_pull_requests(
        &self,
        repo: &RepoRef,
        filter: PrStateFilter,
    ) -> PlatformResult<Vec<PullRequest>> {
        step().await;
        self.check_auth()?;
        Ok(self
            .pull_requests(repo)
            .into_iter()
            .filter(|p| filter == PrStateFilter::All || p.state == PrState::Open)
            .collect())
    }

    async fn create_pull_request(
        &self,
        repo: &RepoRef,
        pr: &NewPullRequest,
    ) -> PlatformResult<PullRequest> {
        step().await;
        self.check_auth()?;
        if self.pull_requests_failing.load(Ordering::SeqCst) {
            return Err(PlatformError::Api {
                status: 502,
                message: "bad gateway".to_string(),
            });
        }
        let mut state = lock(&self.state);
        if state.pulls.values().any(|p| p.head == pr.head && p.state == PrState::Open) {
            return Err(PlatformError::Api {
                status: 422,
                message: format!("a pull request for {} already exists", pr.head),
            });
        }
        let number = state.allocate(repo);
        let created = PullRequest {
            number,
            title: pr.title.clone(),
            head: pr.head.clone(),
            base: pr.base.clone(),
            state: PrState::Open,
            author: self.login.clone(),
            url: format!("https://forge.test/{repo}/pull/{number}"),
        };
        state.pulls.insert((repo.clone(), number), created.clone());
        Ok(created)
    }

    async fn merge_pull_request(&self, repo: &RepoRef, number: u64) -> PlatformResult<()> {
        step().await;
        self.check_auth()?;
        let mut state = lock(&self.state);
        let pr = state
            .pulls
            .get_mut(&(repo.clone(), number))
            .ok_or_else(|| Self::not_found(repo, number))?;
        pr.state = PrState::Merged;
        Ok(())
    }

    async fn create_review(
        &self,
        _repo: &RepoRef,
        number: u64,
        verdict: ReviewVerdict,
        body: &str,
    ) -> PlatformResult<()> {
        step().await;
        self.check_auth()?;
        lock(&self.state).reviews.push(MockReview {
            number,
            verdict,
            body: body.to_string(),
        });
        Ok(())
    }

    async fn request_reviewers(
        &self,
        repo: &RepoRef,
        number: u64,
        reviewers: &[String],
    ) -> PlatformResult<()> {
        step().await;
        self.check_auth()?;
        lock(&self.state)
            .reviewers
            .push((repo.clone(), number, reviewers.to_vec()));
        Ok(())
    }

    async fn list_branches(&self, repo: &RepoRef) -> PlatformResult<Vec<String>> {
        step().await;
        self.check_auth()?;
        Ok(self.branches(repo))
    }

    async fn verify_remote_branch(&self, repo: &RepoRef, branch: &str) -> PlatformResult<bool> {
        step().await;
        self.check_auth()?;
        Ok(lock(&self.state)
            .branches
            .get(repo)
            .is_some_and(|b| b.contains(branch)))
    }

    async fn list_notifications(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> PlatformResult<Vec<ForgeNotification>> {
        step().await;
        self.check_auth()?;
        Ok(lock(&self.state)
            .notifications
            .iter()
            .filter(|n| since.map_or(true, |s| n.updated_at > s))
            .cloned()
            .collect())
    }

    fn clone_url(&self, repo: &RepoRef) -> String {
        format!("https://forge.test/{repo}.git")
    }
}

// ---------------------------------------------------------------------------
// 本地仓库
// ---------------------------------------------------------------------------

/// 工作区各项检查返回什么，由测试脚本设定
#[derive(Debug, Clone)]
pub struct WorkspaceScript {
    pub prepare_error: Option<PlatformError>,
    pub checkout_error: Option<PlatformError>,
    /// 覆盖 `current_branch` 的返回值
    pub current_branch: Option<String>,
    pub merge_commits: bool,
    pub commits_ahead: usize,
    pub changed_files: Vec<String>,
    pub tests: TestOutcome,
    pub push_error: Option<PlatformError>,
    /// 推送报告成功但远端没有分支
    pub silent_push_failure: bool,
}

impl Default for WorkspaceScript {
    fn default() -> Self {
        Self {
            prepare_error: None,
            checkout_error: None,
            current_branch: None,
            merge_commits: false,
            commits_ahead: 1,
            changed_files: vec!["src/lib.rs".to_string()],
            tests: TestOutcome::Passed {
                runner: "cargo test".to_string(),
            },
            push_error: None,
            silent_push_failure: false,
        }
    }
}

#[derive(Default)]
struct WorkspaceState {
    repo: Option<RepoRef>,
    branch: Option<String>,
    calls: Vec<String>,
}

pub struct MockWorkspace {
    script: Mutex<WorkspaceScript>,
    state: Mutex<WorkspaceState>,
    forge: Option<Arc<MockForge>>,
}

impl MockWorkspace {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(WorkspaceScript::default()),
            state: Mutex::new(WorkspaceState::default()),
            forge: None,
        }
    }

    /// 推送成功时把分支登记到这个托管平台上
    pub fn with_forge(mut self, forge: Arc<MockForge>) -> Self {
        self.forge = Some(forge);
        self
    }

    pub fn script(&self, edit: impl FnOnce(&mut WorkspaceScript)) {
        edit(&mut lock(&self.script));
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.state).calls.clone()
    }

    fn record(&self, call: String) {
        lock(&self.state).calls.push(call);
    }
}

impl Default for MockWorkspace {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RepoWorkspace for MockWorkspace {
    async fn prepare(&self, repo: &RepoRef, _clone_url: &str, base: &str) -> PlatformResult<PathBuf> {
        step().await;
        self.record(format!("prepare {repo} {base}"));
        if let Some(err) = lock(&self.script).prepare_error.clone() {
            return Err(err);
        }
        let mut state = lock(&self.state);
        state.repo = Some(repo.clone());
        state.branch = Some(base.to_string());
        Ok(PathBuf::from(format!("/tmp/hive-mock/{}/{}", repo.owner, repo.name)))
    }

    async fn create_branch(&self, _path: &Path, branch: &str) -> PlatformResult<()> {
        step().await;
        self.record(format!("create_branch {branch}"));
        lock(&self.state).branch = Some(branch.to_string());
        Ok(())
    }

    async fn checkout_remote_branch(&self, _path: &Path, branch: &str) -> PlatformResult<()> {
        step().await;
        self.record(format!("checkout {branch}"));
        if let Some(err) = lock(&self.script).checkout_error.clone() {
            return Err(err);
        }
        lock(&self.state).branch = Some(branch.to_string());
        Ok(())
    }

    async fn current_branch(&self, _path: &Path) -> PlatformResult<String> {
        step().await;
        if let Some(forced) = lock(&self.script).current_branch.clone() {
            return Ok(forced);
        }
        Ok(lock(&self.state)
            .branch
            .clone()
            .unwrap_or_else(|| "main".to_string()))
    }

    async fn has_merge_commits(&self, _path: &Path, _base: &str) -> PlatformResult<bool> {
        step().await;
        Ok(lock(&self.script).merge_commits)
    }

    async fn commits_ahead(&self, _path: &Path, _base: &str) -> PlatformResult<usize> {
        step().await;
        Ok(lock(&self.script).commits_ahead)
    }

    async fn changed_files(&self, _path: &Path, _base: &str) -> PlatformResult<Vec<String>> {
        step().await;
        Ok(lock(&self.script).changed_files.clone())
    }

    async fn run_tests(&self, _path: &Path) -> PlatformResult<TestOutcome> {
        step().await;
        self.record("run_tests".to_string());
        Ok(lock(&self.script).tests.clone())
    }

    async fn push(&self, _path: &Path, branch: &str) -> PlatformResult<()> {
        step().await;
        self.record(format!("push {branch}"));
        let (error, silent) = {
            let script = lock(&self.script);
            (script.push_error.clone(), script.silent_push_failure)
        };
        if let Some(err) = error {
            return Err(err);
        }
        if !silent {
            let repo = lock(&self.state).repo.clone();
            if let (Some(forge), Some(repo)) = (&self.forge, repo) {
                forge.add_branch(&repo, branch);
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// 编码代理 / 内容生成 / 工具执行 / 版本源
// ---------------------------------------------------------------------------

pub struct MockCodingAgent {
    outcome: Mutex<CodingOutcome>,
    delay: Mutex<Option<Duration>>,
    prompts: Mutex<Vec<String>>,
}

impl MockCodingAgent {
    pub fn new(outcome: CodingOutcome) -> Self {
        Self {
            outcome: Mutex::new(outcome),
            delay: Mutex::new(None),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn succeeding() -> Self {
        Self::new(CodingOutcome::succeeded("done"))
    }

    pub fn set_outcome(&self, outcome: CodingOutcome) {
        *lock(&self.outcome) = outcome;
    }

    /// 每次运行前先睡眠，用于超时测试
    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.delay) = Some(delay);
    }

    pub fn prompts(&self) -> Vec<String> {
        lock(&self.prompts).clone()
    }
}

#[async_trait]
impl CodingAgent for MockCodingAgent {
    async fn run(&self, prompt: &str, _workspace: &Path) -> CodingOutcome {
        step().await;
        lock(&self.prompts).push(prompt.to_string());
        let delay = *lock(&self.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        lock(&self.outcome).clone()
    }
}

/// 一次生成请求的记录
#[derive(Debug, Clone)]
pub struct GeneratorCall {
    pub system: String,
    pub messages: Vec<ChatMessage>,
    pub tool_names: Vec<String>,
}

/// 按队列返回预设回复；队列空时返回默认文本
pub struct MockGenerator {
    queue: Mutex<VecDeque<PlatformResult<ChatReply>>>,
    fallback: String,
    calls: Mutex<Vec<GeneratorCall>>,
}

impl MockGenerator {
    pub fn new(fallback: impl Into<String>) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            fallback: fallback.into(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn push_text(&self, text: &str) {
        self.push_reply(ChatReply {
            text: text.to_string(),
            tool_calls: Vec::new(),
        });
    }

    pub fn push_reply(&self, reply: ChatReply) {
        lock(&self.queue).push_back(Ok(reply));
    }

    pub fn push_error(&self, err: PlatformError) {
        lock(&self.queue).push_back(Err(err));
    }

    pub fn calls(&self) -> Vec<GeneratorCall> {
        lock(&self.calls).clone()
    }
}

impl Default for MockGenerator {
    fn default() -> Self {
        Self::new("Interesting, tell me more.")
    }
}

#[async_trait]
impl ContentGenerator for MockGenerator {
    async fn chat_with_tools(
        &self,
        system: &str,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> PlatformResult<ChatReply> {
        step().await;
        lock(&self.calls).push(GeneratorCall {
            system: system.to_string(),
            messages: messages.to_vec(),
            tool_names: tools.iter().map(|t| t.name.clone()).collect(),
        });
        lock(&self.queue).pop_front().unwrap_or_else(|| {
            Ok(ChatReply {
                text: self.fallback.clone(),
                tool_calls: Vec::new(),
            })
        })
    }
}

/// 记录收到的工具调用，一律报告成功
#[derive(Default)]
pub struct MockDispatcher {
    definitions: Vec<ToolDefinition>,
    calls: Mutex<Vec<ToolCall>>,
}

impl MockDispatcher {
    pub fn new(definitions: Vec<ToolDefinition>) -> Self {
        Self {
            definitions,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<ToolCall> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl ToolDispatcher for MockDispatcher {
    fn definitions(&self) -> Vec<ToolDefinition> {
        self.definitions.clone()
    }

    async fn dispatch(&self, call: &ToolCall) -> PlatformResult<ToolOutcome> {
        step().await;
        lock(&self.calls).push(call.clone());
        Ok(ToolOutcome {
            success: true,
            summary: format!("{} executed", call.name),
        })
    }
}

/// 返回预设版本号的版本源
pub struct StaticVersion {
    answer: Mutex<PlatformResult<Option<String>>>,
}

impl StaticVersion {
    pub fn new(version: Option<&str>) -> Self {
        Self {
            answer: Mutex::new(Ok(version.map(str::to_string))),
        }
    }

    pub fn set(&self, answer: PlatformResult<Option<String>>) {
        *lock(&self.answer) = answer;
    }
}

#[async_trait]
impl VersionSource for StaticVersion {
    async fn remote_version(&self) -> PlatformResult<Option<String>> {
        step().await;
        lock(&self.answer).clone()
    }
}
