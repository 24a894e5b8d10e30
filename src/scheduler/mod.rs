//! 调度器：独立定时的循环 + 单活动模式互斥
//!
//! 每个循环各自带确定性抖动的定时器。会改变外部状态的周期先经 ModeController 进入独占模式，
//! 模式忙时本次直接跳过、按原定时器再触发。单个周期内的错误或 panic 只记录并重新调度；
//! 致命错误（认证失败、版本不一致）停止全部循环。

mod forge;
pub mod ledger;
pub mod prompts;
mod reply;
mod social;
mod work;

use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use futures_util::FutureExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::commitment::{CommitmentQueue, Fulfiller, PlatformFulfiller, SessionActions};
use crate::config::AppConfig;
use crate::conversation::{ConversationPolicy, ConversationTracker, Platform};
use crate::coordination::{
    CoordinatorSettings, RecoveryPolicy, StuckTaskTracker, TaskCoordinator,
};
use crate::core::jitter::jittered_interval_with;
use crate::core::{
    triage, CycleAction, HiveError, HiveResult, Mode, ModeController, ShutdownCleanup,
    ShutdownCoordinator, ShutdownManager, ShutdownReason,
};
use crate::observability::{LoopHealth, LoopTelemetry};
use crate::persistence::JsonStore;
use crate::platform::{
    CodingAgent, ContentGenerator, ForgeClient, HttpVersionSource, RepoRef, RepoWorkspace,
    SocialClient, ToolDispatcher, VersionSource,
};

pub use ledger::{OwnPost, SessionLedger};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoopKind {
    SessionRefresh,
    VersionCheck,
    SocialAwareness,
    ForgeAwareness,
    Expression,
    Reflection,
    Engagement,
    PlanAwareness,
    Commitments,
    Heartbeat,
}

impl LoopKind {
    pub const ALL: [LoopKind; 10] = [
        LoopKind::SessionRefresh,
        LoopKind::VersionCheck,
        LoopKind::SocialAwareness,
        LoopKind::ForgeAwareness,
        LoopKind::Expression,
        LoopKind::Reflection,
        LoopKind::Engagement,
        LoopKind::PlanAwareness,
        LoopKind::Commitments,
        LoopKind::Heartbeat,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            LoopKind::SessionRefresh => "session_refresh",
            LoopKind::VersionCheck => "version_check",
            LoopKind::SocialAwareness => "social_awareness",
            LoopKind::ForgeAwareness => "forge_awareness",
            LoopKind::Expression => "expression",
            LoopKind::Reflection => "reflection",
            LoopKind::Engagement => "engagement",
            LoopKind::PlanAwareness => "plan_awareness",
            LoopKind::Commitments => "commitments",
            LoopKind::Heartbeat => "heartbeat",
        }
    }

    /// 承诺履约使用固定间隔，其余都加抖动
    pub fn jittered(&self) -> bool {
        !matches!(self, LoopKind::Commitments)
    }

    /// 启动后立即跑一次的循环
    pub fn fires_on_start(&self) -> bool {
        matches!(
            self,
            LoopKind::SessionRefresh | LoopKind::VersionCheck | LoopKind::Heartbeat
        )
    }

    pub fn base_interval(&self, cfg: &AppConfig) -> Duration {
        let s = &cfg.scheduler;
        let secs = match self {
            LoopKind::SessionRefresh => s.session_refresh_secs,
            LoopKind::VersionCheck => s.version_check_secs,
            LoopKind::SocialAwareness => s.awareness_secs,
            LoopKind::ForgeAwareness => s.forge_awareness_secs,
            LoopKind::Expression => s.expression_secs,
            LoopKind::Reflection => s.reflection_secs,
            LoopKind::Engagement => s.engagement_secs,
            LoopKind::PlanAwareness => s.plan_awareness_secs,
            LoopKind::Commitments => cfg.commitments.interval_secs,
            LoopKind::Heartbeat => s.heartbeat_secs,
        };
        Duration::from_secs(secs.max(1))
    }

    pub fn interval(&self, cfg: &AppConfig) -> Duration {
        let base = self.base_interval(cfg);
        if self.jittered() {
            jittered_interval_with(&cfg.agent.id, self.name(), base, cfg.scheduler.jitter_fraction)
        } else {
            base
        }
    }
}

/// 注入的外部协作方
#[derive(Clone)]
pub struct Collaborators {
    pub social: Arc<dyn SocialClient>,
    pub forge: Arc<dyn ForgeClient>,
    pub workspace: Arc<dyn RepoWorkspace>,
    pub coder: Arc<dyn CodingAgent>,
    pub generator: Arc<dyn ContentGenerator>,
    pub dispatcher: Arc<dyn ToolDispatcher>,
    /// 为 None 且配置了版本检查 URL 时使用 HttpVersionSource
    pub version: Option<Arc<dyn VersionSource>>,
}

pub(crate) struct SchedulerInner {
    pub(crate) config: AppConfig,
    pub(crate) collab: Collaborators,
    pub(crate) version: Option<Arc<dyn VersionSource>>,
    pub(crate) modes: ModeController,
    pub(crate) shutdown: ShutdownManager,
    pub(crate) telemetry: LoopTelemetry,
    pub(crate) coordinator: TaskCoordinator,
    pub(crate) fulfiller: Arc<dyn Fulfiller>,
    pub(crate) social_conversations: Mutex<ConversationTracker>,
    pub(crate) forge_conversations: Mutex<ConversationTracker>,
    pub(crate) commitments: Mutex<CommitmentQueue>,
    pub(crate) session_actions: Mutex<SessionActions>,
    pub(crate) ledger: Mutex<SessionLedger>,
    pub(crate) ledger_store: JsonStore<SessionLedger>,
    pub(crate) stuck: Mutex<StuckTaskTracker>,
    /// 回复中请求的自我改进目标，由反思周期处理
    pub(crate) improvement_requests: Mutex<Vec<String>>,
}

impl SchedulerInner {
    pub(crate) async fn run_cycle(&self, kind: LoopKind) -> HiveResult<()> {
        match kind {
            LoopKind::SessionRefresh => self.session_refresh_cycle().await,
            LoopKind::VersionCheck => self.version_check_cycle().await,
            LoopKind::SocialAwareness => self.social_awareness_cycle().await,
            LoopKind::ForgeAwareness => self.forge_awareness_cycle().await,
            LoopKind::Expression => self.expression_cycle().await,
            LoopKind::Reflection => self.reflection_cycle().await,
            LoopKind::Engagement => self.engagement_cycle().await,
            LoopKind::PlanAwareness => self.plan_awareness_cycle().await,
            LoopKind::Commitments => self.commitment_cycle().await,
            LoopKind::Heartbeat => self.heartbeat_cycle().await,
        }
    }

    /// 记录结果并分诊；需要终止时返回关闭原因
    fn settle(&self, kind: LoopKind, result: &HiveResult<()>) -> Option<ShutdownReason> {
        let now = Utc::now();
        let err = match result {
            Ok(()) => {
                self.telemetry.record_success(kind.name(), now);
                return None;
            }
            Err(err) => err,
        };
        self.telemetry.record_failure(kind.name(), &err.to_string(), now);
        match triage(kind.name(), err) {
            CycleAction::Continue => None,
            CycleAction::Terminate(message) => Some(match err {
                HiveError::VersionMismatch { local, remote } => ShutdownReason::VersionMismatch {
                    local: local.clone(),
                    remote: remote.clone(),
                },
                _ => ShutdownReason::Fatal(message),
            }),
        }
    }

    /// 一个周期：panic 被捕获并当作普通失败
    async fn guarded_cycle(&self, kind: LoopKind) -> Option<ShutdownReason> {
        match AssertUnwindSafe(self.run_cycle(kind)).catch_unwind().await {
            Ok(result) => self.settle(kind, &result),
            Err(_) => {
                tracing::error!(loop_name = kind.name(), "Cycle panicked, rescheduling");
                self.telemetry
                    .record_failure(kind.name(), "cycle panicked", Utc::now());
                None
            }
        }
    }

    /// 把会话、承诺与簿记落盘
    pub(crate) async fn persist(&self) -> HiveResult<()> {
        self.social_conversations.lock().await.save()?;
        self.forge_conversations.lock().await.save()?;
        self.commitments.lock().await.save()?;
        self.ledger_store.save(&*self.ledger.lock().await)?;
        Ok(())
    }
}

async fn run_loop(inner: Arc<SchedulerInner>, kind: LoopKind) {
    let token = inner.shutdown.token();
    let period = kind.interval(&inner.config);
    tracing::info!(loop_name = kind.name(), period_secs = period.as_secs_f64(), "Loop started");

    let mut first = true;
    loop {
        let delay = if first && kind.fires_on_start() {
            Duration::ZERO
        } else {
            period
        };
        first = false;

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }

        // 关闭信号同时取消正在进行的周期；模式守卫随之释放
        let verdict = tokio::select! {
            _ = token.cancelled() => break,
            verdict = inner.guarded_cycle(kind) => verdict,
        };
        if let Some(reason) = verdict {
            inner.shutdown.shutdown(reason);
            break;
        }
    }
    tracing::debug!(loop_name = kind.name(), "Loop stopped");
}

struct PersistOnShutdown {
    inner: Arc<SchedulerInner>,
}

#[async_trait::async_trait]
impl ShutdownCleanup for PersistOnShutdown {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.inner.persist().await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "persist_state"
    }
}

pub struct Scheduler {
    inner: Arc<SchedulerInner>,
    handles: StdMutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// 打开本地状态并装配协调器、履约器
    pub fn new(config: AppConfig, collab: Collaborators) -> HiveResult<Self> {
        let dir: PathBuf = config.state.dir.clone();
        std::fs::create_dir_all(&dir)?;

        let social_conversations = ConversationTracker::open(
            Platform::Social,
            ConversationPolicy::for_platform(&config.conversation, Platform::Social),
            &dir.join("conversations_social.json"),
        )?;
        let forge_conversations = ConversationTracker::open(
            Platform::Forge,
            ConversationPolicy::for_platform(&config.conversation, Platform::Forge),
            &dir.join("conversations_forge.json"),
        )?;
        let commitments = CommitmentQueue::open(&config.commitments, &dir.join("commitments.json"))?;
        let ledger_store = JsonStore::<SessionLedger>::new(dir.join("session.json"), ledger::LEDGER_VERSION);
        let mut ledger = ledger_store.load()?;
        ledger.begin_session(Utc::now());

        let version = match (&collab.version, &config.scheduler.version_check_url) {
            (Some(source), _) => Some(source.clone()),
            (None, Some(url)) => {
                let timeout = Duration::from_secs(config.scheduler.version_check_timeout_secs);
                let source = HttpVersionSource::new(url.clone(), timeout)?;
                Some(Arc::new(source) as Arc<dyn VersionSource>)
            }
            (None, None) => None,
        };

        let default_repo = config
            .commitments
            .default_repo
            .as_deref()
            .map(|raw| raw.parse::<RepoRef>().map_err(HiveError::Config))
            .transpose()?;
        let fulfiller: Arc<dyn Fulfiller> = Arc::new(PlatformFulfiller::new(
            collab.forge.clone(),
            collab.social.clone(),
            collab.generator.clone(),
            default_repo,
            config.coordination.plan_label.clone(),
            config.agent.persona.clone(),
        ));

        let coordinator = TaskCoordinator::new(
            collab.forge.clone(),
            collab.social.clone(),
            collab.workspace.clone(),
            collab.coder.clone(),
            CoordinatorSettings::from_config(&config),
        );
        let stuck = StuckTaskTracker::new(RecoveryPolicy::from_config(&config.recovery));

        tracing::info!(
            agent = %config.agent.id,
            version = %config.agent.local_version(),
            state_dir = %dir.display(),
            "Scheduler initialised"
        );

        let inner = SchedulerInner {
            config,
            collab,
            version,
            modes: ModeController::new(),
            shutdown: ShutdownManager::new(),
            telemetry: LoopTelemetry::new(),
            coordinator,
            fulfiller,
            social_conversations: Mutex::new(social_conversations),
            forge_conversations: Mutex::new(forge_conversations),
            commitments: Mutex::new(commitments),
            session_actions: Mutex::new(SessionActions::new()),
            ledger: Mutex::new(ledger),
            ledger_store,
            stuck: Mutex::new(stuck),
            improvement_requests: Mutex::new(Vec::new()),
        };
        Ok(Self {
            inner: Arc::new(inner),
            handles: StdMutex::new(Vec::new()),
        })
    }

    /// 启动全部循环；重复调用无效
    pub fn start(&self) {
        let mut handles = self.handles.lock().unwrap_or_else(|p| p.into_inner());
        if !handles.is_empty() {
            return;
        }
        for kind in LoopKind::ALL {
            handles.push(tokio::spawn(run_loop(self.inner.clone(), kind)));
        }
        tracing::info!(loops = handles.len(), "Scheduler started");
    }

    /// 请求停止并等待所有循环退出
    pub async fn stop(&self) -> ShutdownReason {
        self.inner.shutdown.shutdown(ShutdownReason::Requested);
        self.wait().await
    }

    /// 等待关闭（任一原因），收尾落盘后返回首个关闭原因
    pub async fn wait(&self) -> ShutdownReason {
        self.inner.shutdown.wait_for_shutdown().await;
        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self.handles.lock().unwrap_or_else(|p| p.into_inner());
            guard.drain(..).collect()
        };
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Loop task ended abnormally");
            }
        }

        let mut cleanup =
            ShutdownCoordinator::new().with_timeout(self.inner.config.scheduler.cleanup_timeout_secs);
        cleanup.register(Arc::new(PersistOnShutdown {
            inner: self.inner.clone(),
        }));
        cleanup.run_cleanup().await;

        let reason = self
            .inner
            .shutdown
            .reason()
            .unwrap_or(ShutdownReason::Requested);
        tracing::info!(?reason, "Scheduler stopped");
        reason
    }

    /// 立即跑一次指定循环的周期（不经过 panic 捕获），结果同样参与分诊
    pub async fn run_once(&self, kind: LoopKind) -> HiveResult<()> {
        let result = self.inner.run_cycle(kind).await;
        if let Some(reason) = self.inner.settle(kind, &result) {
            self.inner.shutdown.shutdown(reason);
        }
        result
    }

    pub fn mode(&self) -> Mode {
        self.inner.modes.current()
    }

    pub fn modes(&self) -> &ModeController {
        &self.inner.modes
    }

    pub fn shutdown_manager(&self) -> &ShutdownManager {
        &self.inner.shutdown
    }

    /// Ctrl+C / SIGTERM 触发以 Signal 为原因的关闭
    pub fn install_signal_handlers(&self) {
        self.inner.shutdown.install_signal_handlers();
    }

    pub fn shutdown_reason(&self) -> Option<ShutdownReason> {
        self.inner.shutdown.reason()
    }

    pub fn loop_health(&self, kind: LoopKind) -> Option<LoopHealth> {
        self.inner.telemetry.get(kind.name())
    }

    pub fn coordinator(&self) -> &TaskCoordinator {
        &self.inner.coordinator
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    pub async fn commitment_stats(&self) -> crate::commitment::QueueStats {
        self.inner.commitments.lock().await.stats()
    }

    pub async fn commitments_snapshot(&self) -> Vec<crate::commitment::Commitment> {
        self.inner.commitments.lock().await.iter().cloned().collect()
    }

    pub async fn conversation(
        &self,
        platform: Platform,
        key: &str,
    ) -> Option<crate::conversation::Conversation> {
        let tracker = match platform {
            Platform::Social => &self.inner.social_conversations,
            Platform::Forge => &self.inner.forge_conversations,
        };
        tracker.lock().await.get(key).cloned()
    }

    pub async fn ledger(&self) -> SessionLedger {
        self.inner.ledger.lock().await.clone()
    }

    pub async fn persist(&self) -> HiveResult<()> {
        self.inner.persist().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loop_intervals() {
        let cfg = AppConfig::default();
        let fixed = LoopKind::Commitments.interval(&cfg);
        assert_eq!(fixed, Duration::from_secs(15));

        let base = LoopKind::SocialAwareness.base_interval(&cfg);
        let jittered = LoopKind::SocialAwareness.interval(&cfg);
        let spread = base.mul_f64(cfg.scheduler.jitter_fraction);
        assert!(jittered >= base - spread && jittered <= base + spread);
        assert_eq!(LoopKind::ALL.len(), 10);
    }

    #[test]
    fn test_names_unique() {
        let names: std::collections::HashSet<_> = LoopKind::ALL.iter().map(LoopKind::name).collect();
        assert_eq!(names.len(), LoopKind::ALL.len());
    }
}
