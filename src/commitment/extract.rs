//! 承诺提取：用规则从我方回复文本中识别许诺
//!
//! 每条规则对应一种承诺类型；逐句匹配，每种类型每段文本最多产生一条。

use std::sync::OnceLock;

use regex::Regex;

use crate::commitment::queue::{CommitmentDraft, CommitmentKind, CommitmentParams};
use crate::platform::RepoRef;

const TITLE_MAX_CHARS: usize = 80;

/// 回复发生的上下文
#[derive(Debug, Clone)]
pub struct ExtractionContext {
    /// 代码托管平台会话的仓库；社交平台为 None
    pub repo: Option<RepoRef>,
    /// 线程根（承诺来源）
    pub thread_root: String,
    /// 被回复的那条消息
    pub parent: String,
}

struct Rule {
    kind: CommitmentKind,
    pattern: Regex,
}

fn rules() -> &'static [Rule] {
    static RULES: OnceLock<Vec<Rule>> = OnceLock::new();
    RULES.get_or_init(|| {
        let subject = r"(?:i'll|i will|i'm going to|i am going to|let me|i can)\s+(?:go ahead and\s+|also\s+)?";
        vec![
            Rule {
                kind: CommitmentKind::CreateIssue,
                pattern: Regex::new(&format!(
                    r"(?i)\b{subject}(?:open|file|create|raise|log|write up)\s+(?:an?\s+|the\s+)?(?:new\s+)?(?:github\s+)?(?:issue|ticket|bug report)\b(?:\s+(?:for|about|on|to track|tracking)\s+(?P<topic>[^.!?\n]+))?"
                ))
                .expect("issue rule is valid"),
            },
            Rule {
                kind: CommitmentKind::CreatePlan,
                pattern: Regex::new(&format!(
                    r"(?i)\b{subject}(?:write|draft|put together|create|start|open|sketch)\s+(?:up\s+|out\s+)?(?:an?\s+|the\s+)?(?:\w+\s+)?plan\b(?:\s+(?:for|to|on|covering)\s+(?P<topic>[^.!?\n]+))?"
                ))
                .expect("plan rule is valid"),
            },
            Rule {
                kind: CommitmentKind::PostFollowUp,
                pattern: Regex::new(
                    r"(?i)\b(?:i'll|i will|i'm going to)\s+(?:follow up|report back|circle back|post an update|share an update|share (?:the )?results|let you know)\b(?:\s+(?:on|about|with|once|when|after)\s+(?P<topic>[^.!?\n]+))?",
                )
                .expect("follow-up rule is valid"),
            },
        ]
    })
}

fn sentences(text: &str) -> impl Iterator<Item = &str> {
    text.split(|c| matches!(c, '.' | '!' | '?' | '\n'))
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn make_title(raw: &str) -> String {
    let cleaned = raw.trim().trim_end_matches([',', ';', ':']).trim();
    let mut title: String = cleaned.chars().take(TITLE_MAX_CHARS).collect();
    if let Some(first) = title.chars().next() {
        let upper: String = first.to_uppercase().collect();
        title.replace_range(..first.len_utf8(), &upper);
    }
    title
}

/// 从我方回复中提取承诺草稿
pub fn extract_commitments(text: &str, ctx: &ExtractionContext) -> Vec<CommitmentDraft> {
    let normalized = text.replace(['\u{2019}', '\u{2018}'], "'");
    let mut drafts: Vec<CommitmentDraft> = Vec::new();

    for rule in rules() {
        let found = sentences(&normalized).find_map(|sentence| {
            rule.pattern.captures(sentence).map(|caps| {
                let topic = caps.name("topic").map(|m| m.as_str().trim().to_string());
                (sentence.to_string(), topic)
            })
        });
        let Some((sentence, topic)) = found else {
            continue;
        };

        let title = make_title(topic.as_deref().unwrap_or(&sentence));
        let repo = ctx.repo.as_ref().map(|r| r.to_string());
        let params = match rule.kind {
            CommitmentKind::CreateIssue => CommitmentParams::CreateIssue {
                repo,
                title: title.clone(),
                body: format!(
                    "{sentence}.\n\nPromised in conversation: {}",
                    ctx.thread_root
                ),
            },
            CommitmentKind::CreatePlan => CommitmentParams::CreatePlan {
                repo,
                title: title.clone(),
                goal: topic.unwrap_or_else(|| sentence.clone()),
            },
            CommitmentKind::PostFollowUp => CommitmentParams::PostFollowUp {
                topic: topic.unwrap_or_else(|| sentence.clone()),
                thread_root: ctx.thread_root.clone(),
                parent: ctx.parent.clone(),
            },
        };

        drafts.push(CommitmentDraft {
            description: format!("{}: {}", rule.kind, title),
            params,
        });
    }

    drafts
}
