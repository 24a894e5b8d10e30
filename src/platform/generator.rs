//! 内容生成协作方：带工具的对话补全 + 工具调用分发
//!
//! 核心把工具调用视为不透明的动作请求交给 ToolDispatcher；只有 `graceful_exit` 与 `self_improve`
//! 两个工具由核心自己解释（结束会话 / 进入自我改进模式）。

use async_trait::async_trait;
use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::platform::PlatformResult;

pub const GRACEFUL_EXIT: &str = "graceful_exit";
pub const SELF_IMPROVE: &str = "self_improve";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema
    pub parameters: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatReply {
    pub text: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub success: bool,
    pub summary: String,
}

#[async_trait]
pub trait ContentGenerator: Send + Sync {
    async fn chat_with_tools(
        &self,
        system: &str,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> PlatformResult<ChatReply>;
}

/// 核心之外的工具执行器（发帖、建 issue 等直接动作）
#[async_trait]
pub trait ToolDispatcher: Send + Sync {
    /// 执行器提供的工具定义，随核心工具一起交给内容生成方
    fn definitions(&self) -> Vec<ToolDefinition>;

    async fn dispatch(&self, call: &ToolCall) -> PlatformResult<ToolOutcome>;
}

/// `graceful_exit` 参数：主动结束当前会话
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct GracefulExitArgs {
    /// 结束原因
    pub reason: String,
    /// 可选的告别语；为空时只结束不回复
    #[serde(default)]
    pub closing_message: Option<String>,
}

/// `self_improve` 参数：请求对自身代码做一次改进
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct SelfImproveArgs {
    /// 改进目标描述
    pub goal: String,
}

fn schema_value<T: JsonSchema>() -> Value {
    serde_json::to_value(schema_for!(T)).unwrap_or(Value::Null)
}

/// 核心自有工具的定义（Schema 由 schemars 生成）
pub fn core_tool_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: GRACEFUL_EXIT.to_string(),
            description: "End this conversation. Optionally send one short closing message."
                .to_string(),
            parameters: schema_value::<GracefulExitArgs>(),
        },
        ToolDefinition {
            name: SELF_IMPROVE.to_string(),
            description: "Request a code change to your own implementation.".to_string(),
            parameters: schema_value::<SelfImproveArgs>(),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_tool_schemas() {
        let defs = core_tool_definitions();
        assert_eq!(defs.len(), 2);
        let exit = &defs[0];
        assert_eq!(exit.name, GRACEFUL_EXIT);
        let props = exit.parameters.get("properties").expect("properties");
        assert!(props.get("reason").is_some());
        assert!(props.get("closing_message").is_some());
    }

    #[test]
    fn test_graceful_exit_args_parse() {
        let args: GracefulExitArgs =
            serde_json::from_value(serde_json::json!({"reason": "done"})).unwrap();
        assert_eq!(args.reason, "done");
        assert!(args.closing_message.is_none());
    }
}
