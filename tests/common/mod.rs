//! 集成测试共用的装配代码
#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use hive::config::AppConfig;
use hive::coordination::{CoordinatorSettings, Plan, PlanRef, Task, TaskCoordinator, TaskStatus};
use hive::platform::mock::{
    MockCodingAgent, MockDispatcher, MockForge, MockGenerator, MockSocial, MockWorkspace,
    StaticVersion,
};
use hive::platform::{RepoRef, ToolDefinition, VersionSource};
use hive::{Collaborators, Scheduler};

pub const REPO: &str = "octo/hive";

pub fn repo() -> RepoRef {
    RepoRef::new("octo", "hive")
}

/// 单测用配置：无认领落定等待、无回复抖动
pub fn config(login: &str, state_dir: &Path) -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.agent.id = format!("{login}-instance");
    cfg.agent.handle = login.to_string();
    cfg.agent.forge_login = login.to_string();
    cfg.agent.version = Some("1.0.0".to_string());
    cfg.coordination.repos = vec![REPO.to_string()];
    cfg.coordination.claim_settle_ms = 0;
    cfg.scheduler.response_jitter_min_secs = 0;
    cfg.scheduler.response_jitter_max_secs = 0;
    cfg.commitments.default_repo = Some(REPO.to_string());
    cfg.state.dir = state_dir.to_path_buf();
    cfg
}

/// 一个实例的协调器及其私有工作区 / 编码代理
pub struct Peer {
    pub coordinator: TaskCoordinator,
    pub workspace: Arc<MockWorkspace>,
    pub coder: Arc<MockCodingAgent>,
}

pub fn peer(forge: &Arc<MockForge>, social: &Arc<MockSocial>, login: &str) -> Peer {
    let cfg = config(login, Path::new("unused"));
    let workspace = Arc::new(MockWorkspace::new().with_forge(forge.clone()));
    let coder = Arc::new(MockCodingAgent::succeeding());
    let coordinator = TaskCoordinator::new(
        forge.clone(),
        social.clone(),
        workspace.clone(),
        coder.clone(),
        CoordinatorSettings::from_config(&cfg),
    );
    Peer {
        coordinator,
        workspace,
        coder,
    }
}

/// 建一个带计划标签的 issue
pub fn seed_plan(forge: &MockForge, tasks: Vec<Task>) -> PlanRef {
    let mut plan = Plan::new("Retry pipeline", "Make the sync pipeline retry safely.");
    plan.tasks = tasks;
    let number = forge.insert_issue(&repo(), &plan.title, &plan.render(), &["plan"]);
    PlanRef::new(repo(), number)
}

pub fn read_plan(forge: &MockForge, plan_ref: &PlanRef) -> Plan {
    let issue = forge
        .issue(&plan_ref.repo, plan_ref.number)
        .expect("plan issue exists");
    Plan::parse(&issue.title, &issue.body).expect("plan parses")
}

/// 直接改写计划里某个任务的状态，模拟其他实例的写入
pub fn set_task(forge: &MockForge, plan_ref: &PlanRef, number: u64, status: TaskStatus, assignee: Option<&str>) {
    let mut plan = read_plan(forge, plan_ref);
    let task = plan.task_mut(number).expect("task exists");
    task.status = status;
    task.assignee = assignee.map(str::to_string);
    forge.set_issue_body(&plan_ref.repo, plan_ref.number, &plan.render());
}

pub fn comments_containing(forge: &MockForge, plan_ref: &PlanRef, needle: &str) -> usize {
    forge
        .comments(&plan_ref.repo, plan_ref.number)
        .iter()
        .filter(|c| c.contains(needle))
        .count()
}

/// 装配好的调度器及其全部内存协作方
pub struct Harness {
    scheduler: Option<Scheduler>,
    pub social: Arc<MockSocial>,
    pub forge: Arc<MockForge>,
    pub workspace: Arc<MockWorkspace>,
    pub coder: Arc<MockCodingAgent>,
    pub generator: Arc<MockGenerator>,
    pub dispatcher: Arc<MockDispatcher>,
    pub version: Arc<StaticVersion>,
    pub dir: tempfile::TempDir,
}

pub fn dispatcher_tools() -> Vec<ToolDefinition> {
    vec![ToolDefinition {
        name: "create_issue".to_string(),
        description: "Open an issue on the code host.".to_string(),
        parameters: serde_json::json!({"type": "object"}),
    }]
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(edit: impl FnOnce(&mut AppConfig)) -> Self {
        hive::observability::init();
        let dir = tempfile::tempdir().expect("tempdir");
        let mut cfg = config("bee", dir.path());
        edit(&mut cfg);

        let social = Arc::new(MockSocial::new("bee"));
        let forge = Arc::new(MockForge::new("bee"));
        let workspace = Arc::new(MockWorkspace::new().with_forge(forge.clone()));
        let coder = Arc::new(MockCodingAgent::succeeding());
        let generator = Arc::new(MockGenerator::default());
        let dispatcher = Arc::new(MockDispatcher::new(dispatcher_tools()));
        let version = Arc::new(StaticVersion::new(Some("1.0.0")));

        let mut harness = Self {
            scheduler: None,
            social,
            forge,
            workspace,
            coder,
            generator,
            dispatcher,
            version,
            dir,
        };
        harness.scheduler = Some(Scheduler::new(cfg, harness.collaborators()).expect("scheduler builds"));
        harness
    }

    pub fn scheduler(&self) -> &Scheduler {
        self.scheduler.as_ref().expect("scheduler built")
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            social: self.social.clone(),
            forge: self.forge.clone(),
            workspace: self.workspace.clone(),
            coder: self.coder.clone(),
            generator: self.generator.clone(),
            dispatcher: self.dispatcher.clone(),
            version: Some(self.version.clone() as Arc<dyn VersionSource>),
        }
    }

    /// 在同一状态目录上重新打开一个调度器，模拟进程重启
    pub fn reopen(&self) -> Scheduler {
        let cfg = self.scheduler().config().clone();
        Scheduler::new(cfg, self.collaborators()).expect("scheduler reopens")
    }
}
