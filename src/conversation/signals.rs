//! 会话信号识别：结束语 / 纯表情 / 循环对话
//!
//! 全部是确定性的规则匹配，不调用内容生成方。

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// 单条入站消息的性质
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSignal {
    Substantive,
    /// 致谢 / 告别 / 确认之类的收尾语
    Closing,
    EmojiOnly,
}

impl MessageSignal {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, MessageSignal::Substantive)
    }
}

/// 收尾语的最大词数，更长的消息视为有实质内容
const CLOSING_MAX_WORDS: usize = 12;

fn closing_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)^(?:@\S+\s+)*(?:thanks|thank you|thx|ty|cheers|appreciate it|appreciated|much appreciated|got it|sounds good|will do|perfect|great|awesome|cool|nice|ok|okay|k|kk|bye|goodbye|see you|see ya|talk soon|later|have a good one|take care|no worries|np|all good|done|noted|good night|gn)\b",
        )
        .expect("closing pattern is valid")
    })
}

fn acknowledgment_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)^(?:@\S+\s+)*(?:agreed|exactly|absolutely|totally|same|yes|yep|yeah|right|true|indeed|love (?:this|that|it)|so true|well said|\+1|100%|this|couldn't agree more|fair point|good point|makes sense)\b",
        )
        .expect("acknowledgment pattern is valid")
    })
}

/// 收尾 / 附和语里常见的词；消息中除此之外的词超过一个即视为有实质内容
const FILLER_WORDS: &[&str] = &[
    "a", "absolutely", "again", "agree", "agreed", "all", "and", "appreciate", "appreciated",
    "bye", "care", "cheers", "cool", "couldn't", "do", "done", "exactly", "fair", "for", "friend",
    "gn", "good", "goodbye", "got", "great", "have", "help", "indeed", "it", "k", "kk", "later",
    "lot", "love", "made", "makes", "man", "mate", "more", "much", "my", "nice", "night", "no",
    "noted", "np", "ok", "okay", "one", "perfect", "point", "really", "right", "said", "same",
    "see", "sense", "so", "soon", "sounds", "take", "talk", "thank", "thanks", "that", "the",
    "this", "thx", "too", "totally", "true", "ty", "very", "well", "will", "worries", "ya", "yeah",
    "yep", "yes", "you",
];

fn words(text: &str) -> Vec<String> {
    text.split_whitespace()
        .filter(|w| !w.starts_with('@'))
        .map(|w| {
            w.trim_matches(|c: char| !c.is_alphanumeric() && c != '\'')
                .to_lowercase()
        })
        .filter(|w| !w.is_empty())
        .collect()
}

fn mostly_filler(text: &str) -> bool {
    let words = words(text);
    if words.len() > CLOSING_MAX_WORDS {
        return false;
    }
    words
        .iter()
        .filter(|w| !FILLER_WORDS.contains(&w.as_str()))
        .count()
        <= 1
}

/// 只含表情 / 符号（无字母数字）且至少一个非 ASCII 符号
pub fn is_emoji_only(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return false;
    }
    let mut saw_symbol = false;
    for c in trimmed.chars() {
        if c.is_alphanumeric() {
            return false;
        }
        if !c.is_ascii() && !c.is_whitespace() {
            saw_symbol = true;
        }
    }
    saw_symbol
}

/// 短的致谢 / 告别，不含问句
pub fn is_closing(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed.contains('?') {
        return false;
    }
    closing_pattern().is_match(trimmed) && mostly_filler(trimmed)
}

/// 附和类短句（比收尾语宽松，用于循环对话检测）
pub fn is_acknowledgment(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed.contains('?') {
        return false;
    }
    if is_emoji_only(trimmed) {
        return true;
    }
    (closing_pattern().is_match(trimmed) || acknowledgment_pattern().is_match(trimmed))
        && mostly_filler(trimmed)
}

pub fn classify(text: &str) -> MessageSignal {
    if is_emoji_only(text) {
        MessageSignal::EmojiOnly
    } else if is_closing(text) {
        MessageSignal::Closing
    } else {
        MessageSignal::Substantive
    }
}

/// 循环对话检测的置信度
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircularAssessment {
    pub confidence: Confidence,
    pub reason: String,
}

/// 参与循环检测的一条消息
#[derive(Debug, Clone, Copy)]
pub struct ExchangeMessage<'a> {
    pub from_self: bool,
    pub text: &'a str,
}

fn token_set(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2)
        .map(|w| w.to_lowercase())
        .collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let inter = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    inter / union
}

/// 与窗口内更早的消息高度重复
const REPETITION_THRESHOLD: f64 = 0.6;

/// 检查最近 `window` 条消息是否陷入互相附和 / 重复的循环
///
/// 至少需要 3 条消息。低信息量消息（附和或与之前消息高度重复）占比决定置信度，
/// 只有双方都在低信息量地来回时才可能达到 Medium 以上。
pub fn detect_circular(messages: &[ExchangeMessage<'_>], window: usize) -> Option<CircularAssessment> {
    let window = window.max(3);
    let start = messages.len().saturating_sub(window);
    let recent = &messages[start..];
    if recent.len() < 3 {
        return None;
    }

    let tokens: Vec<HashSet<String>> = recent.iter().map(|m| token_set(m.text)).collect();
    let mut low_info = 0usize;
    let mut low_self = false;
    let mut low_other = false;

    for (i, msg) in recent.iter().enumerate() {
        let repeated = (0..i).any(|j| jaccard(&tokens[i], &tokens[j]) >= REPETITION_THRESHOLD);
        if repeated || is_acknowledgment(msg.text) {
            low_info += 1;
            if msg.from_self {
                low_self = true;
            } else {
                low_other = true;
            }
        }
    }

    let ratio = low_info as f64 / recent.len() as f64;
    let mutual = low_self && low_other;

    let confidence = if ratio >= 1.0 && mutual {
        Confidence::High
    } else if ratio >= 0.75 && mutual {
        Confidence::Medium
    } else if ratio >= 0.5 {
        Confidence::Low
    } else {
        return None;
    };

    Some(CircularAssessment {
        confidence,
        reason: format!(
            "{low_info} of the last {} messages add nothing new",
            recent.len()
        ),
    })
}
