//! 会话状态跟踪：决定一个会话是否还值得回复
//!
//! - signals: 收尾语 / 纯表情 / 循环对话识别
//! - tracker: 每平台的会话状态机、回复上限、持久化

pub mod signals;
pub mod tracker;

pub use signals::{classify, detect_circular, CircularAssessment, Confidence, MessageSignal};
pub use tracker::{
    forge_key, parse_forge_key, ConclusionReason, Conversation, ConversationPolicy,
    ConversationState, ConversationTracker, Platform, ResponseDecision, SkipReason,
};
