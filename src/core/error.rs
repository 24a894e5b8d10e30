//! 核心错误类型与失败分类
//!
//! 组件边界把内部失败统一转换为 HiveError，再由 `class()` 归入四类之一：
//! 软失败（记录后下轮重试）、门失败（任务标记 failed/blocked 并汇报）、协调冲突（正常让步）、致命（终止进程）。

use thiserror::Error;

use crate::platform::PlatformError;

#[derive(Error, Debug)]
pub enum HiveError {
    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error("Plan parse error: {0}")]
    PlanParse(String),

    #[error("Gate '{gate}' failed: {reason}")]
    Gate { gate: &'static str, reason: String },

    /// 与其他实例的写竞争失败
    #[error("Lost write race: {0}")]
    Conflict(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Version mismatch: local {local}, remote {remote}")]
    VersionMismatch { local: String, remote: String },
}

/// 失败分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Soft,
    Gate,
    Conflict,
    Fatal,
}

impl HiveError {
    pub fn class(&self) -> FailureClass {
        match self {
            HiveError::Platform(e) if e.is_fatal() => FailureClass::Fatal,
            HiveError::VersionMismatch { .. } => FailureClass::Fatal,
            HiveError::Gate { .. } => FailureClass::Gate,
            HiveError::Conflict(_) => FailureClass::Conflict,
            _ => FailureClass::Soft,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.class() == FailureClass::Fatal
    }
}

impl From<config::ConfigError> for HiveError {
    fn from(e: config::ConfigError) -> Self {
        HiveError::Config(e.to_string())
    }
}

pub type HiveResult<T> = Result<T, HiveError>;

/// 循环包装器对一次失败周期的处置
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleAction {
    /// 记录并按原计划重新调度同一个定时器
    Continue,
    /// 停止调度器并终止进程
    Terminate(String),
}
