//! 交给内容生成方的系统提示与消息历史

use crate::conversation::Conversation;
use crate::platform::{ChatMessage, ForgeNotification};
use crate::scheduler::ledger::OwnPost;

const EXIT_HINT: &str = "If the conversation has run its course, call `graceful_exit` instead of replying. \
Never promise work you will not do.";

fn with_warning(mut prompt: String, warning: Option<&str>) -> String {
    if let Some(w) = warning {
        prompt.push_str("\n\nNote: ");
        prompt.push_str(w);
    }
    prompt
}

pub fn social_reply_system(persona: &str, handle: &str, warning: Option<&str>) -> String {
    let prompt = format!(
        "{persona}\n\nYou are @{handle}, replying in a public thread. Keep it under 280 characters. \
{EXIT_HINT}"
    );
    with_warning(prompt, warning)
}

pub fn forge_reply_system(
    persona: &str,
    login: &str,
    notification: &ForgeNotification,
    warning: Option<&str>,
) -> String {
    let kind = if notification.is_pull_request {
        "pull request"
    } else {
        "issue"
    };
    let prompt = format!(
        "{persona}\n\nYou are @{login} on the code host, answering on {kind} {}#{} \"{}\". \
Be concrete and technical. {EXIT_HINT}",
        notification.repo, notification.number, notification.title
    );
    with_warning(prompt, warning)
}

pub fn expression_system(persona: &str) -> String {
    format!(
        "{persona}\n\nWrite one original post for your timeline: something you learned, built, or are \
thinking about. Under 280 characters. Do not repeat earlier posts."
    )
}

pub fn reflection_system(persona: &str) -> String {
    format!(
        "{persona}\n\nReflect on your recent activity and how it landed. Summarise what worked and what \
did not in a few sentences. If a concrete change to your own code would help, call `self_improve` \
with a precise goal."
    )
}

/// 会话历史转成对话消息：我方为 assistant，其余为 user（带作者前缀）
pub fn history_messages(conversation: &Conversation) -> Vec<ChatMessage> {
    conversation
        .messages
        .iter()
        .map(|m| {
            if m.from_self {
                ChatMessage::assistant(m.text.clone())
            } else {
                ChatMessage::user(format!("@{}: {}", m.author, m.text))
            }
        })
        .collect()
}

pub fn recent_posts_summary(posts: &[OwnPost]) -> String {
    if posts.is_empty() {
        return "No posts yet this session.".to_string();
    }
    let mut out = String::from("Your recent posts:\n");
    for post in posts {
        let stats = post
            .metrics
            .map(|m| format!(" [{} likes, {} replies, {} reposts]", m.likes, m.replies, m.reposts))
            .unwrap_or_default();
        out.push_str(&format!("- {}{}\n", post.text, stats));
    }
    out
}
