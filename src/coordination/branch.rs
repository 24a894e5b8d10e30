//! 任务分支命名与匹配
//!
//! 当前命名：`task-<n>-<slug>`。为了找回旧版本实例留下的分支，匹配时还会尝试
//! `task/<n>-<slug>`、`task-<n>`、`<agent>/task-<n>` 等历史形式。编号匹配按边界进行，`task-1` 不会命中 `task-12`。

use regex::Regex;

const SLUG_MAX_CHARS: usize = 40;

/// 标题转 slug：小写、非字母数字折叠为单个连字符、最长 40 字符
pub fn slugify(title: &str) -> String {
    let mut slug = String::new();
    let mut pending_dash = false;
    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    if slug.len() > SLUG_MAX_CHARS {
        slug.truncate(SLUG_MAX_CHARS);
        // 尽量在单词边界截断
        if let Some(cut) = slug.rfind('-') {
            if cut > SLUG_MAX_CHARS / 2 {
                slug.truncate(cut);
            }
        }
    }
    slug.trim_matches('-').to_string()
}

/// 当前命名规则下的任务分支名
pub fn task_branch_name(number: u64, title: &str) -> String {
    let slug = slugify(title);
    if slug.is_empty() {
        format!("task-{number}")
    } else {
        format!("task-{number}-{slug}")
    }
}

/// 按优先级排列的候选分支名（当前命名在前，历史命名在后）
pub fn branch_candidates(number: u64, title: &str, agent: Option<&str>) -> Vec<String> {
    let slug = slugify(title);
    let mut candidates = vec![task_branch_name(number, title)];
    if !slug.is_empty() {
        candidates.push(format!("task/{number}-{slug}"));
    }
    candidates.push(format!("task-{number}"));
    if let Some(agent) = agent.filter(|a| !a.is_empty()) {
        candidates.push(format!("{agent}/task-{number}"));
        if !slug.is_empty() {
            candidates.push(format!("{agent}/task-{number}-{slug}"));
        }
    }
    let mut seen = std::collections::HashSet::new();
    candidates.retain(|c| seen.insert(c.clone()));
    candidates
}

/// 分支名中是否含有按边界匹配的任务编号
pub fn matches_task_number(branch: &str, number: u64) -> bool {
    let pattern = format!(r"(?i)(?:^|[/_\-])task[/_\-]?{number}(?:$|[^0-9])");
    Regex::new(&pattern).map(|re| re.is_match(branch)).unwrap_or(false)
}

/// 开放 PR 的源分支是否属于该任务（候选名精确匹配，或以当前命名为前缀）
pub fn is_task_branch(branch: &str, number: u64, title: &str, agent: Option<&str>) -> bool {
    let canonical = task_branch_name(number, title);
    branch == canonical
        || branch.starts_with(&format!("{canonical}-"))
        || branch_candidates(number, title, agent).iter().any(|c| c == branch)
}

/// 在远端分支中查找任务分支：先按候选名，再按编号子串兜底
pub fn find_task_branch<'a>(
    branches: &'a [String],
    number: u64,
    title: &str,
    agent: Option<&str>,
) -> Option<&'a String> {
    for candidate in branch_candidates(number, title, agent) {
        if let Some(found) = branches.iter().find(|b| **b == candidate) {
            return Some(found);
        }
    }
    branches.iter().find(|b| matches_task_number(b, number))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Add OAuth login!"), "add-oauth-login");
        assert_eq!(slugify("  --Weird__Title--  "), "weird-title");
        assert_eq!(slugify("日本語"), "");
        let long = slugify("Implement the orphaned branch recovery path with retries and notifications");
        assert!(long.len() <= 40);
        assert!(!long.ends_with('-'));
    }

    #[test]
    fn test_branch_name() {
        assert_eq!(task_branch_name(3, "Fix flaky test"), "task-3-fix-flaky-test");
        assert_eq!(task_branch_name(7, "???"), "task-7");
    }

    #[test]
    fn test_candidates_include_legacy_forms() {
        let c = branch_candidates(2, "Parse plans", Some("peer-a"));
        assert_eq!(
            c,
            vec![
                "task-2-parse-plans",
                "task/2-parse-plans",
                "task-2",
                "peer-a/task-2",
                "peer-a/task-2-parse-plans",
            ]
        );
    }

    #[test]
    fn test_number_match_is_boundary_aware() {
        assert!(matches_task_number("task-1-setup", 1));
        assert!(matches_task_number("peer/task-1", 1));
        assert!(matches_task_number("task/1-setup", 1));
        assert!(!matches_task_number("task-12-setup", 1));
        assert!(!matches_task_number("subtask-1", 1));
        assert!(!matches_task_number("feature-1", 1));
    }

    #[test]
    fn test_find_prefers_candidates() {
        let branches = vec![
            "main".to_string(),
            "task-12-other".to_string(),
            "old/task-1-something-renamed".to_string(),
            "task/1-setup-ci".to_string(),
        ];
        assert_eq!(
            find_task_branch(&branches, 1, "Setup CI", None).map(String::as_str),
            Some("task/1-setup-ci")
        );
        let fallback = vec!["main".to_string(), "old/task-1-something-renamed".to_string()];
        assert_eq!(
            find_task_branch(&fallback, 1, "Setup CI", None).map(String::as_str),
            Some("old/task-1-something-renamed")
        );
        assert!(find_task_branch(&["task-12-x".to_string()], 1, "Setup CI", None).is_none());
    }

    #[test]
    fn test_is_task_branch() {
        assert!(is_task_branch("task-4-write-docs", 4, "Write docs", None));
        assert!(is_task_branch("peer-b/task-4", 4, "Write docs", Some("peer-b")));
        assert!(!is_task_branch("task-44-write-docs", 4, "Write docs", None));
    }
}
