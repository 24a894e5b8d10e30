//! Hive - 多实例协作智能体控制核心
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类与分诊、模式互斥、确定性抖动、关闭处理
//! - **platform**: 外部协作方抽象（社交平台、代码托管、工作区、编码代理、内容生成、版本源）与内存实现
//! - **coordination**: 计划文档、任务认领、验证门、卡住 / 孤立任务恢复
//! - **conversation**: 会话状态跟踪与结束信号
//! - **commitment**: 承诺提取、队列与履约
//! - **scheduler**: 各定时循环与调度器
//! - **observability**: 日志初始化与循环运行状况
//! - **persistence**: 版本化 JSON 状态文件

pub mod commitment;
pub mod config;
pub mod conversation;
pub mod coordination;
pub mod core;
pub mod observability;
pub mod persistence;
pub mod platform;
pub mod scheduler;

pub use config::{load_config, AppConfig};
pub use core::{HiveError, HiveResult, Mode, ShutdownReason};
pub use scheduler::{Collaborators, LoopKind, Scheduler};
