//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__AGENT__ID=peer-2`）。
//! 所有段都有默认值，空配置即可运行。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::conversation::Confidence;
use crate::platform::RepoRef;

/// 应用配置根
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub agent: AgentSection,
    pub scheduler: SchedulerSection,
    pub coordination: CoordinationSection,
    pub recovery: RecoverySection,
    pub conversation: ConversationSection,
    pub commitments: CommitmentSection,
    pub state: StateSection,
}

/// [agent] 段：身份、人设、已知同伴
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    /// 实例标识，参与抖动哈希与任务认领
    pub id: String,
    /// 社交平台 handle
    pub handle: String,
    /// 代码托管平台登录名（写入任务 assignee）
    pub forge_login: String,
    pub persona: String,
    /// 同伴实例的 handle / 登录名；非空时回复前施加响应抖动
    pub peers: Vec<String>,
    /// 本地版本，默认取包版本
    pub version: Option<String>,
    /// 自我改进目标仓库与工作区
    pub self_repo: Option<String>,
    pub self_workspace: Option<PathBuf>,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            id: "hive".to_string(),
            handle: "hive.example".to_string(),
            forge_login: "hive-bot".to_string(),
            persona: "A collaborative software agent.".to_string(),
            peers: Vec::new(),
            version: None,
            self_repo: None,
            self_workspace: None,
        }
    }
}

impl AgentSection {
    pub fn local_version(&self) -> String {
        self.version
            .clone()
            .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string())
    }

    pub fn has_peers(&self) -> bool {
        !self.peers.is_empty()
    }

    pub fn is_peer(&self, name: &str) -> bool {
        self.peers.iter().any(|p| p.eq_ignore_ascii_case(name))
    }
}

/// [scheduler] 段：各循环的名义间隔（秒）与抖动参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub session_refresh_secs: u64,
    pub version_check_secs: u64,
    pub awareness_secs: u64,
    pub forge_awareness_secs: u64,
    pub expression_secs: u64,
    pub reflection_secs: u64,
    pub engagement_secs: u64,
    pub plan_awareness_secs: u64,
    pub heartbeat_secs: u64,
    /// 间隔抖动比例（默认 ±12%）
    pub jitter_fraction: f64,
    pub response_jitter_min_secs: u64,
    pub response_jitter_max_secs: u64,
    /// 未设置时跳过版本检查
    pub version_check_url: Option<String>,
    pub version_check_timeout_secs: u64,
    pub notification_limit: usize,
    /// 单次感知周期最多处理的通知数
    pub max_responses_per_cycle: usize,
    /// 关闭时每个清理任务的超时
    pub cleanup_timeout_secs: u64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            session_refresh_secs: 3600,
            version_check_secs: 300,
            awareness_secs: 60,
            forge_awareness_secs: 120,
            expression_secs: 2 * 3600,
            reflection_secs: 6 * 3600,
            engagement_secs: 3600,
            plan_awareness_secs: 180,
            heartbeat_secs: 300,
            jitter_fraction: crate::core::jitter::DEFAULT_JITTER_FRACTION,
            response_jitter_min_secs: 15,
            response_jitter_max_secs: 90,
            version_check_url: None,
            version_check_timeout_secs: 10,
            notification_limit: 50,
            max_responses_per_cycle: 5,
            cleanup_timeout_secs: 5,
        }
    }
}

impl SchedulerSection {
    pub fn response_jitter_bounds(&self) -> (Duration, Duration) {
        (
            Duration::from_secs(self.response_jitter_min_secs),
            Duration::from_secs(self.response_jitter_max_secs),
        )
    }
}

/// [coordination] 段：关注的仓库、计划标签、工作区与审阅人
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoordinationSection {
    /// owner/name 列表
    pub repos: Vec<String>,
    pub plan_label: String,
    pub workspace_root: PathBuf,
    pub base_branch: String,
    pub reviewers: Vec<String>,
    /// 写入后等待多久再回读校验（毫秒），给并发写入留出落地时间
    pub claim_settle_ms: u64,
    pub coding_timeout_secs: u64,
    pub test_timeout_secs: u64,
    /// 计划全部完成时在社交平台公告
    pub announce_completion: bool,
}

impl Default for CoordinationSection {
    fn default() -> Self {
        Self {
            repos: Vec::new(),
            plan_label: "plan".to_string(),
            workspace_root: PathBuf::from("./workspaces"),
            base_branch: "main".to_string(),
            reviewers: Vec::new(),
            claim_settle_ms: 1500,
            coding_timeout_secs: 30 * 60,
            test_timeout_secs: 10 * 60,
            announce_completion: true,
        }
    }
}

impl CoordinationSection {
    /// 解析仓库坐标；非法项记录警告后跳过
    pub fn repo_refs(&self) -> Vec<RepoRef> {
        self.repos
            .iter()
            .filter_map(|r| match r.parse::<RepoRef>() {
                Ok(repo) => Some(repo),
                Err(e) => {
                    tracing::warn!("Ignoring watched repo: {}", e);
                    None
                }
            })
            .collect()
    }
}

/// [recovery] 段：卡住任务超时、重试上限、孤儿分支复查间隔
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecoverySection {
    pub stuck_timeout_mins: i64,
    pub max_retries: u32,
    pub orphan_recheck_mins: i64,
}

impl Default for RecoverySection {
    fn default() -> Self {
        Self {
            stuck_timeout_mins: 30,
            max_retries: 3,
            orphan_recheck_mins: 60,
        }
    }
}

/// [conversation] 段：回复上限、循环对话检测阈值、清理周期
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConversationSection {
    pub max_social_replies: u32,
    pub max_forge_replies: u32,
    /// 循环对话检测考察的最近消息数
    pub circular_window: usize,
    /// 达到该置信度即硬性阻止回复；低于它只作提示
    pub circular_block_at: Confidence,
    pub prune_days: i64,
}

impl Default for ConversationSection {
    fn default() -> Self {
        Self {
            max_social_replies: 4,
            max_forge_replies: 10,
            circular_window: 4,
            circular_block_at: Confidence::Medium,
            prune_days: 7,
        }
    }
}

/// [commitments] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CommitmentSection {
    /// 履约循环固定间隔（不抖动）
    pub interval_secs: u64,
    pub stale_hours: i64,
    /// 终态承诺保留天数
    pub retain_days: i64,
    /// 社交平台上的承诺没有仓库上下文时使用
    pub default_repo: Option<String>,
}

impl Default for CommitmentSection {
    fn default() -> Self {
        Self {
            interval_secs: 15,
            stale_hours: 24,
            retain_days: 7,
            default_repo: None,
        }
    }
}

/// [state] 段：本地 JSON 状态文件目录
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StateSection {
    pub dir: PathBuf,
}

impl Default for StateSection {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./state"),
        }
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("agent.peers")
            .with_list_parse_key("coordination.repos")
            .with_list_parse_key("coordination.reviewers")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.recovery.stuck_timeout_mins, 30);
        assert_eq!(cfg.recovery.max_retries, 3);
        assert_eq!(cfg.commitments.stale_hours, 24);
        assert_eq!(cfg.commitments.interval_secs, 15);
        assert_eq!(cfg.conversation.circular_block_at, Confidence::Medium);
        assert!((cfg.scheduler.jitter_fraction - 0.12).abs() < f64::EPSILON);
        assert!(!cfg.agent.has_peers());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hive.toml");
        std::fs::write(
            &path,
            r#"
[agent]
id = "peer-7"
peers = ["peer-3.example"]

[coordination]
repos = ["octo/hive", "broken"]
reviewers = ["maintainer"]

[conversation]
circular_block_at = "high"
"#,
        )
        .unwrap();

        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.agent.id, "peer-7");
        assert!(cfg.agent.is_peer("PEER-3.example"));
        assert_eq!(cfg.coordination.repo_refs(), vec![RepoRef::new("octo", "hive")]);
        assert_eq!(cfg.conversation.circular_block_at, Confidence::High);
        // 未写的键保持默认
        assert_eq!(cfg.coordination.base_branch, "main");
        assert_eq!(cfg.scheduler.awareness_secs, 60);
    }
}
