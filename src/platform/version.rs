//! 远程版本源：部署的最新版本号与本地不一致时，调度器自行终止

use std::time::Duration;

use async_trait::async_trait;

use crate::platform::{PlatformError, PlatformResult};

#[async_trait]
pub trait VersionSource: Send + Sync {
    /// 远端声明的版本；未声明时返回 None
    async fn remote_version(&self) -> PlatformResult<Option<String>>;
}

/// 从 URL 拉取纯文本版本号
pub struct HttpVersionSource {
    client: reqwest::Client,
    url: String,
}

impl HttpVersionSource {
    pub fn new(url: impl Into<String>, timeout: Duration) -> PlatformResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PlatformError::Other(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

fn map_reqwest_error(e: reqwest::Error) -> PlatformError {
    if e.is_timeout() {
        PlatformError::Timeout(e.to_string())
    } else if e.is_connect() || e.is_request() {
        PlatformError::Network(e.to_string())
    } else {
        PlatformError::Other(e.to_string())
    }
}

#[async_trait]
impl VersionSource for HttpVersionSource {
    async fn remote_version(&self) -> PlatformResult<Option<String>> {
        let resp = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = resp.status();
        if !status.is_success() {
            return Err(PlatformError::Api {
                status: status.as_u16(),
                message: format!("version endpoint returned {status}"),
            });
        }

        let body = resp.text().await.map_err(map_reqwest_error)?;
        Ok(parse_version_body(&body))
    }
}

/// 接受纯文本 `1.2.3` 或 JSON `{"version": "1.2.3"}`
pub(crate) fn parse_version_body(body: &str) -> Option<String> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.starts_with('{') {
        return serde_json::from_str::<serde_json::Value>(trimmed)
            .ok()
            .and_then(|v| v.get("version").and_then(|s| s.as_str()).map(str::to_string));
    }
    Some(trimmed.to_string())
}
