//! 失败分诊
//!
//! 把一次循环周期的错误映射为 CycleAction：只有致命类会终止调度器，其余全部记录后继续。

use crate::core::{CycleAction, FailureClass, HiveError, HiveResult};
use crate::platform::PlatformResult;

pub fn triage(loop_name: &str, err: &HiveError) -> CycleAction {
    match err.class() {
        FailureClass::Fatal => {
            tracing::error!(loop_name, error = %err, "Fatal error, stopping scheduler");
            CycleAction::Terminate(format!("{loop_name}: {err}"))
        }
        FailureClass::Conflict => {
            tracing::debug!(loop_name, error = %err, "Deferred after coordination conflict");
            CycleAction::Continue
        }
        FailureClass::Gate => {
            tracing::warn!(loop_name, error = %err, "Verification gate failed");
            CycleAction::Continue
        }
        FailureClass::Soft => {
            tracing::warn!(loop_name, error = %err, "Cycle failed, will retry next tick");
            CycleAction::Continue
        }
    }
}

/// 组件内部的非关键调用：致命错误向上传播，其余记录后降级为 None
pub fn tolerate<T>(what: &str, result: PlatformResult<T>) -> HiveResult<Option<T>> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.is_fatal() => Err(e.into()),
        Err(e) => {
            tracing::warn!(what, error = %e, "Call failed, continuing");
            Ok(None)
        }
    }
}
