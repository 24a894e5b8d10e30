//! 计划文档模型
//!
//! 计划以 markdown 形式存放在代码托管平台的 issue 正文中，任何实例都可以整体读改写：
//!
//! ```text
//! ## Goal
//! <目标>
//!
//! ## Tasks
//!
//! ### Task 1: <标题>
//! - **Status:** pending
//! - **Assignee:** none
//! - **Dependencies:** none
//! - **Files:** src/lib.rs
//!
//! <描述>
//!
//! ## Context
//! <背景>
//! ```
//!
//! 首个标题前的文字和其他 `##` 小节属于人工内容，原样保留，写回时放在原先相邻的位置。

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::{HiveError, HiveResult};
use crate::platform::RepoRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Claimed,
    InProgress,
    Blocked,
    Completed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Claimed => "claimed",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Completed => "completed",
        }
    }

    /// 有人正在处理（卡住检测的对象）
    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::Claimed | TaskStatus::InProgress)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = HiveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace([' ', '-'], "_");
        match normalized.as_str() {
            "pending" | "todo" => Ok(TaskStatus::Pending),
            "claimed" => Ok(TaskStatus::Claimed),
            "in_progress" => Ok(TaskStatus::InProgress),
            "blocked" | "failed" => Ok(TaskStatus::Blocked),
            "completed" | "done" => Ok(TaskStatus::Completed),
            _ => Err(HiveError::PlanParse(format!("unknown task status '{s}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub number: u64,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    pub assignee: Option<String>,
    pub dependencies: BTreeSet<u64>,
    pub files: Vec<String>,
}

impl Task {
    pub fn new(number: u64, title: impl Into<String>) -> Self {
        Self {
            number,
            title: title.into(),
            description: String::new(),
            status: TaskStatus::Pending,
            assignee: None,
            dependencies: BTreeSet::new(),
            files: Vec::new(),
        }
    }

    pub fn with_dependencies(mut self, deps: impl IntoIterator<Item = u64>) -> Self {
        self.dependencies = deps.into_iter().collect();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn is_assigned_to(&self, login: &str) -> bool {
        self.assignee
            .as_deref()
            .is_some_and(|a| a.eq_ignore_ascii_case(login))
    }
}

/// 额外小节写回时跟在哪个已知小节之后
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionAnchor {
    Start,
    Goal,
    Tasks,
    Context,
}

/// 非 Goal / Tasks / Context 的小节，如人工写的 `## Notes`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtraSection {
    pub heading: String,
    pub body: String,
    pub after: SectionAnchor,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub title: String,
    pub goal: String,
    pub tasks: Vec<Task>,
    pub context: String,
    #[serde(default)]
    pub preamble: String,
    #[serde(default)]
    pub extra_sections: Vec<ExtraSection>,
}

/// 计划的标识：仓库 + issue 编号
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlanRef {
    pub repo: RepoRef,
    pub number: u64,
}

impl PlanRef {
    pub fn new(repo: RepoRef, number: u64) -> Self {
        Self { repo, number }
    }

    /// 跨周期跟踪任务用的键
    pub fn task_key(&self, task_number: u64) -> String {
        format!("{self}/task-{task_number}")
    }
}

impl fmt::Display for PlanRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.repo, self.number)
    }
}

fn task_header() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^###\s+Task\s+(\d+)\s*[:.\-]\s*(.*)$").expect("task header is valid"))
}

fn field_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[-*]\s+\*\*(Status|Assignee|Dependencies|Files):?\*\*:?\s*(.*)$")
            .expect("field line is valid")
    })
}

fn is_none_marker(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "" | "none" | "-" | "n/a" | "unassigned")
}

fn number_list() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d+").expect("number list is valid"))
}

fn flush_task(current: &mut Option<(Task, Vec<&str>)>, tasks: &mut Vec<Task>) {
    if let Some((mut task, lines)) = current.take() {
        task.description = lines.join("\n").trim().to_string();
        tasks.push(task);
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Section {
    Preamble,
    Goal,
    Tasks,
    Context,
    Other,
}

fn flush_extra(extra: &mut Option<(ExtraSection, Vec<&str>)>, sections: &mut Vec<ExtraSection>) {
    if let Some((mut section, lines)) = extra.take() {
        section.body = lines.join("\n").trim().to_string();
        sections.push(section);
    }
}

impl Plan {
    pub fn new(title: impl Into<String>, goal: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            goal: goal.into(),
            tasks: Vec::new(),
            context: String::new(),
            preamble: String::new(),
            extra_sections: Vec::new(),
        }
    }

    /// 解析 issue 正文；标题取自 issue 标题
    pub fn parse(title: &str, body: &str) -> HiveResult<Self> {
        let mut plan = Plan::new(title.trim(), "");
        let mut section = Section::Preamble;
        let mut saw_tasks = false;
        let mut goal_lines: Vec<&str> = Vec::new();
        let mut context_lines: Vec<&str> = Vec::new();
        let mut preamble_lines: Vec<&str> = Vec::new();
        let mut current: Option<(Task, Vec<&str>)> = None;
        let mut extra: Option<(ExtraSection, Vec<&str>)> = None;
        let mut anchor = SectionAnchor::Start;

        for line in body.lines() {
            let trimmed = line.trim();

            if let Some(heading) = trimmed.strip_prefix("## ") {
                flush_task(&mut current, &mut plan.tasks);
                flush_extra(&mut extra, &mut plan.extra_sections);
                section = match heading.trim().to_lowercase().as_str() {
                    "goal" => Section::Goal,
                    "tasks" => {
                        saw_tasks = true;
                        Section::Tasks
                    }
                    "context" => Section::Context,
                    _ => Section::Other,
                };
                match section {
                    Section::Goal => anchor = SectionAnchor::Goal,
                    Section::Tasks => anchor = SectionAnchor::Tasks,
                    Section::Context => anchor = SectionAnchor::Context,
                    _ => {
                        let heading = heading.trim().to_string();
                        extra = Some((ExtraSection { heading, body: String::new(), after: anchor }, Vec::new()));
                    }
                }
                continue;
            }

            match section {
                Section::Goal => goal_lines.push(line),
                Section::Context => context_lines.push(line),
                Section::Tasks => {
                    if let Some(caps) = task_header().captures(trimmed) {
                        flush_task(&mut current, &mut plan.tasks);
                        let number: u64 = caps[1]
                            .parse()
                            .map_err(|_| HiveError::PlanParse(format!("bad task number in '{trimmed}'")))?;
                        current = Some((Task::new(number, caps[2].trim()), Vec::new()));
                        continue;
                    }
                    let Some((task, desc)) = current.as_mut() else {
                        continue;
                    };
                    if let Some(caps) = field_line().captures(trimmed) {
                        let value = caps[2].trim();
                        match &caps[1] {
                            "Status" => task.status = value.parse()?,
                            "Assignee" => {
                                task.assignee = (!is_none_marker(value))
                                    .then(|| value.trim_start_matches('@').to_string());
                            }
                            "Dependencies" => {
                                task.dependencies = number_list()
                                    .find_iter(value)
                                    .filter_map(|m| m.as_str().parse().ok())
                                    .collect();
                            }
                            _ => {
                                task.files = if is_none_marker(value) {
                                    Vec::new()
                                } else {
                                    value
                                        .split(',')
                                        .map(|f| f.trim().trim_matches('`').to_string())
                                        .filter(|f| !f.is_empty())
                                        .collect()
                                };
                            }
                        }
                    } else {
                        desc.push(line);
                    }
                }
                Section::Preamble => preamble_lines.push(line),
                Section::Other => {
                    if let Some((_, lines)) = extra.as_mut() {
                        lines.push(line);
                    }
                }
            }
        }
        flush_task(&mut current, &mut plan.tasks);
        flush_extra(&mut extra, &mut plan.extra_sections);

        if !saw_tasks {
            return Err(HiveError::PlanParse("missing '## Tasks' section".to_string()));
        }
        let mut seen = BTreeSet::new();
        for task in &plan.tasks {
            if !seen.insert(task.number) {
                return Err(HiveError::PlanParse(format!("duplicate task number {}", task.number)));
            }
        }

        plan.goal = goal_lines.join("\n").trim().to_string();
        plan.context = context_lines.join("\n").trim().to_string();
        plan.preamble = preamble_lines.join("\n").trim().to_string();
        Ok(plan)
    }

    /// 渲染回 markdown 正文
    pub fn render(&self) -> String {
        let mut out = String::new();
        if !self.preamble.trim().is_empty() {
            out.push_str(self.preamble.trim());
            out.push_str("\n\n");
        }
        self.render_extras(SectionAnchor::Start, &mut out);
        out.push_str("## Goal\n\n");
        out.push_str(self.goal.trim());
        out.push_str("\n\n");
        self.render_extras(SectionAnchor::Goal, &mut out);
        out.push_str("## Tasks\n");

        for task in &self.tasks {
            let deps = if task.dependencies.is_empty() {
                "none".to_string()
            } else {
                task.dependencies
                    .iter()
                    .map(|d| d.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            };
            let files = if task.files.is_empty() {
                "none".to_string()
            } else {
                task.files.join(", ")
            };
            out.push_str(&format!(
                "\n### Task {}: {}\n- **Status:** {}\n- **Assignee:** {}\n- **Dependencies:** {}\n- **Files:** {}\n",
                task.number,
                task.title,
                task.status,
                task.assignee.as_deref().map(|a| format!("@{a}")).unwrap_or_else(|| "none".to_string()),
                deps,
                files,
            ));
            if !task.description.trim().is_empty() {
                out.push('\n');
                out.push_str(task.description.trim());
                out.push('\n');
            }
        }

        self.render_extras(SectionAnchor::Tasks, &mut out);
        if !self.context.trim().is_empty() {
            out.push_str("\n## Context\n\n");
            out.push_str(self.context.trim());
            out.push('\n');
        }
        self.render_extras(SectionAnchor::Context, &mut out);
        out
    }

    fn render_extras(&self, anchor: SectionAnchor, out: &mut String) {
        for section in self.extra_sections.iter().filter(|s| s.after == anchor) {
            if !out.is_empty() && !out.ends_with("\n\n") {
                out.push('\n');
            }
            out.push_str(&format!("## {}\n\n", section.heading));
            if !section.body.is_empty() {
                out.push_str(&section.body);
                out.push_str("\n\n");
            }
        }
    }

    pub fn task(&self, number: u64) -> Option<&Task> {
        self.tasks.iter().find(|t| t.number == number)
    }

    pub fn task_mut(&mut self, number: u64) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.number == number)
    }

    fn dependencies_met(&self, task: &Task) -> bool {
        task.dependencies.iter().all(|dep| {
            self.task(*dep)
                .is_some_and(|d| d.status == TaskStatus::Completed)
        })
    }

    /// 可认领的任务，按编号升序
    pub fn claimable_tasks(&self) -> Vec<&Task> {
        let mut claimable: Vec<&Task> = self
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending && t.assignee.is_none())
            .filter(|t| self.dependencies_met(t))
            .collect();
        claimable.sort_by_key(|t| t.number);
        claimable
    }

    pub fn is_complete(&self) -> bool {
        !self.tasks.is_empty() && self.tasks.iter().all(|t| t.status == TaskStatus::Completed)
    }
}
