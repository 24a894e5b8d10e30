//! 编码代理调用契约：核心只关心结果，不关心修改是如何完成的

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CodingOutcome {
    pub success: bool,
    pub output: Option<String>,
    pub error: Option<String>,
    /// 代理显式声明任务无法继续
    #[serde(default)]
    pub blocked: bool,
    pub block_reason: Option<String>,
}

impl CodingOutcome {
    pub fn succeeded(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: Some(output.into()),
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn blocked(reason: impl Into<String>) -> Self {
        Self {
            blocked: true,
            block_reason: Some(reason.into()),
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait CodingAgent: Send + Sync {
    async fn run(&self, prompt: &str, workspace: &Path) -> CodingOutcome;
}
