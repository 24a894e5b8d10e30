//! 核心层：错误分类与分诊、模式互斥、确定性抖动、关闭处理

pub mod error;
pub mod jitter;
pub mod mode;
pub mod shutdown;
pub mod triage;

pub use error::{CycleAction, FailureClass, HiveError, HiveResult};
pub use mode::{Mode, ModeController, ModeGuard};
pub use shutdown::{ShutdownCleanup, ShutdownCoordinator, ShutdownManager, ShutdownReason};
pub use triage::{tolerate, triage};
