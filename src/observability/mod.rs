//! 可观测性：日志初始化与各循环的运行状况

use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 初始化全局日志；`RUST_LOG` 未设置时默认 info。重复调用无副作用
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .try_init();
}

/// 单个循环的运行记录
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoopHealth {
    pub runs: u64,
    pub last_run: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
}

#[derive(Debug, Default)]
pub struct LoopTelemetry {
    loops: Mutex<BTreeMap<&'static str, LoopHealth>>,
}

impl LoopTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entry(&self, name: &'static str, f: impl FnOnce(&mut LoopHealth)) {
        let mut loops = self.loops.lock().unwrap_or_else(|p| p.into_inner());
        f(loops.entry(name).or_default());
    }

    pub fn record_success(&self, name: &'static str, at: DateTime<Utc>) {
        self.with_entry(name, |h| {
            h.runs += 1;
            h.last_run = Some(at);
            h.last_success = Some(at);
            h.consecutive_failures = 0;
        });
    }

    pub fn record_failure(&self, name: &'static str, error: &str, at: DateTime<Utc>) {
        self.with_entry(name, |h| {
            h.runs += 1;
            h.last_run = Some(at);
            h.last_error = Some(error.to_string());
            h.consecutive_failures += 1;
        });
        tracing::debug!(loop_name = name, error, "Loop failure recorded");
    }

    pub fn get(&self, name: &str) -> Option<LoopHealth> {
        self.loops
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(name)
            .cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<&'static str, LoopHealth> {
        self.loops.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failures_reset_on_success() {
        let t = LoopTelemetry::new();
        let now = Utc::now();
        t.record_failure("heartbeat", "boom", now);
        t.record_failure("heartbeat", "boom", now);
        assert_eq!(t.get("heartbeat").unwrap().consecutive_failures, 2);
        t.record_success("heartbeat", now);
        let h = t.get("heartbeat").unwrap();
        assert_eq!(h.consecutive_failures, 0);
        assert_eq!(h.runs, 3);
        assert_eq!(h.last_error.as_deref(), Some("boom"));
        assert!(t.get("other").is_none());
    }
}
