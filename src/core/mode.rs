//! 模式控制：协作式单写者互斥
//!
//! 进程内同一时刻只允许一个活动处于非 idle 模式。`try_enter` 是唯一的入口：当前非 idle 时拒绝，
//! 返回的 ModeGuard 在 drop 时恢复 idle（相当于 finally）。

use std::fmt;
use std::sync::Mutex;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Idle,
    Awareness,
    Responding,
    Expressing,
    Reflecting,
    Improving,
    PlatformBResponding,
    TaskExecuting,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Idle => "idle",
            Mode::Awareness => "awareness",
            Mode::Responding => "responding",
            Mode::Expressing => "expressing",
            Mode::Reflecting => "reflecting",
            Mode::Improving => "improving",
            Mode::PlatformBResponding => "platform_b_responding",
            Mode::TaskExecuting => "task_executing",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub struct ModeController {
    current: Mutex<Mode>,
}

impl Default for ModeController {
    fn default() -> Self {
        Self::new()
    }
}

impl ModeController {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(Mode::Idle),
        }
    }

    pub fn current(&self) -> Mode {
        *self.current.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_idle(&self) -> bool {
        self.current() == Mode::Idle
    }

    /// 仅当当前为 idle 时进入 `mode`；检查与设置在同一把锁内完成
    pub fn try_enter(&self, mode: Mode) -> Option<ModeGuard<'_>> {
        if mode == Mode::Idle {
            return None;
        }
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        if *current != Mode::Idle {
            tracing::debug!(requested = %mode, active = %*current, "Mode busy, skipping");
            return None;
        }
        *current = mode;
        tracing::debug!(mode = %mode, "Entered mode");
        Some(ModeGuard {
            controller: self,
            mode,
        })
    }

    fn set(&self, mode: Mode) {
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = mode;
    }
}

/// 持有期间独占当前模式
#[derive(Debug)]
pub struct ModeGuard<'a> {
    controller: &'a ModeController,
    mode: Mode,
}

impl ModeGuard<'_> {
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// 持有者在不经过 idle 的情况下切换到下一个模式（如 awareness → responding）
    pub fn switch(&mut self, next: Mode) {
        if next == Mode::Idle {
            return;
        }
        tracing::debug!(from = %self.mode, to = %next, "Switching mode");
        self.mode = next;
        self.controller.set(next);
    }
}

impl Drop for ModeGuard<'_> {
    fn drop(&mut self) {
        self.controller.set(Mode::Idle);
        tracing::debug!(mode = %self.mode, "Returned to idle");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};

    #[test]
    fn test_enter_and_restore() {
        let modes = ModeController::new();
        {
            let guard = modes.try_enter(Mode::Responding).unwrap();
            assert_eq!(guard.mode(), Mode::Responding);
            assert_eq!(modes.current(), Mode::Responding);
            assert!(modes.try_enter(Mode::Expressing).is_none());
            assert_eq!(modes.current(), Mode::Responding);
        }
        assert!(modes.is_idle());
    }

    #[test]
    fn test_cannot_enter_idle() {
        let modes = ModeController::new();
        assert!(modes.try_enter(Mode::Idle).is_none());
    }

    #[test]
    fn test_switch_keeps_exclusion() {
        let modes = ModeController::new();
        let mut guard = modes.try_enter(Mode::Awareness).unwrap();
        guard.switch(Mode::Responding);
        assert_eq!(modes.current(), Mode::Responding);
        assert!(modes.try_enter(Mode::TaskExecuting).is_none());
        drop(guard);
        assert!(modes.is_idle());
    }

    #[test]
    fn test_restored_on_panic() {
        let modes = Arc::new(ModeController::new());
        let inner = Arc::clone(&modes);
        let result = std::thread::spawn(move || {
            let _guard = inner.try_enter(Mode::Reflecting).unwrap();
            panic!("cycle blew up");
        })
        .join();
        assert!(result.is_err());
        assert!(modes.is_idle());
    }

    #[test]
    fn test_overlapping_fires_admit_one() {
        let modes = Arc::new(ModeController::new());
        let wins = Arc::new(AtomicUsize::new(0));
        let ready = Arc::new(Barrier::new(8));
        let done = Arc::new(Barrier::new(8));
        let candidates = [
            Mode::Awareness,
            Mode::Responding,
            Mode::Expressing,
            Mode::Reflecting,
            Mode::Improving,
            Mode::PlatformBResponding,
            Mode::TaskExecuting,
            Mode::Responding,
        ];

        let handles: Vec<_> = candidates
            .into_iter()
            .map(|mode| {
                let modes = Arc::clone(&modes);
                let wins = Arc::clone(&wins);
                let ready = Arc::clone(&ready);
                let done = Arc::clone(&done);
                std::thread::spawn(move || {
                    ready.wait();
                    let guard = modes.try_enter(mode);
                    if guard.is_some() {
                        wins.fetch_add(1, Ordering::SeqCst);
                    }
                    // 所有线程都尝试过之后才释放
                    done.wait();
                    drop(guard);
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(wins.load(Ordering::SeqCst), 1);
        assert!(modes.is_idle());
    }
}
