//! 本地仓库操作：克隆 / 刷新私有工作区、建分支、校验提交、跑测试、推送
//!
//! GitWorkspace 通过 `git` 子进程实现；测试套件用 walkdir 在工作区内发现。

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use walkdir::WalkDir;

use crate::platform::{PlatformError, PlatformResult, RepoRef};

/// 测试门的结果；没有可发现的测试套件不算失败
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestOutcome {
    NoTests,
    Passed { runner: String },
    Failed { runner: String, output: String },
}

#[async_trait]
pub trait RepoWorkspace: Send + Sync {
    /// 克隆或刷新到 base 分支的干净状态，返回工作区路径
    async fn prepare(&self, repo: &RepoRef, clone_url: &str, base: &str) -> PlatformResult<PathBuf>;

    async fn create_branch(&self, path: &Path, branch: &str) -> PlatformResult<()>;

    /// 检出远端已有分支（孤儿分支恢复用）
    async fn checkout_remote_branch(&self, path: &Path, branch: &str) -> PlatformResult<()>;

    async fn current_branch(&self, path: &Path) -> PlatformResult<String>;

    /// 相对 base 是否出现合并提交
    async fn has_merge_commits(&self, path: &Path, base: &str) -> PlatformResult<bool>;

    async fn commits_ahead(&self, path: &Path, base: &str) -> PlatformResult<usize>;

    async fn changed_files(&self, path: &Path, base: &str) -> PlatformResult<Vec<String>>;

    async fn run_tests(&self, path: &Path) -> PlatformResult<TestOutcome>;

    async fn push(&self, path: &Path, branch: &str) -> PlatformResult<()>;
}

/// 发现到的测试命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCommand {
    pub program: String,
    pub args: Vec<String>,
    pub label: String,
}

impl TestCommand {
    fn new(program: &str, args: &[&str], label: &str) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            label: label.to_string(),
        }
    }
}

const SKIP_DIRS: &[&str] = &[".git", "node_modules", "target", "vendor", ".venv", "dist"];

/// 按项目类型发现测试命令；都不匹配时返回 None
pub fn discover_test_command(path: &Path) -> Option<TestCommand> {
    if path.join("Cargo.toml").exists() {
        return Some(TestCommand::new("cargo", &["test", "--quiet"], "cargo test"));
    }

    if let Ok(raw) = std::fs::read_to_string(path.join("package.json")) {
        let script = serde_json::from_str::<serde_json::Value>(&raw)
            .ok()
            .and_then(|v| v.pointer("/scripts/test").and_then(|s| s.as_str()).map(str::to_string));
        // npm init 生成的占位脚本永远失败，不算测试套件
        if let Some(script) = script {
            if !script.contains("no test specified") {
                return Some(TestCommand::new("npm", &["test", "--silent"], "npm test"));
            }
        }
    }

    if path.join("go.mod").exists() {
        return Some(TestCommand::new("go", &["test", "./..."], "go test"));
    }

    let has_python_tests = WalkDir::new(path)
        .max_depth(4)
        .into_iter()
        .filter_entry(|e| {
            e.file_name()
                .to_str()
                .map(|name| !SKIP_DIRS.contains(&name))
                .unwrap_or(false)
        })
        .filter_map(Result::ok)
        .any(|e| {
            let name = e.file_name().to_string_lossy();
            e.file_type().is_file()
                && name.ends_with(".py")
                && (name.starts_with("test_") || name.ends_with("_test.py"))
        });
    if has_python_tests {
        return Some(TestCommand::new("python", &["-m", "pytest", "-q"], "pytest"));
    }

    None
}

/// 基于 git CLI 的工作区实现
pub struct GitWorkspace {
    root: PathBuf,
    test_timeout: Duration,
}

impl GitWorkspace {
    pub fn new(root: impl AsRef<Path>, test_timeout: Duration) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            test_timeout,
        }
    }

    fn repo_dir(&self, repo: &RepoRef) -> PathBuf {
        self.root.join(&repo.owner).join(&repo.name)
    }

    async fn git(&self, dir: &Path, args: &[&str]) -> PlatformResult<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .await
            .map_err(|e| PlatformError::Other(format!("Failed to run git {}: {}", args[0], e)))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(classify_git_failure(args[0], &stderr))
        }
    }
}

fn classify_git_failure(subcommand: &str, stderr: &str) -> PlatformError {
    let lower = stderr.to_lowercase();
    if lower.contains("authentication failed") || lower.contains("permission denied (publickey)") {
        PlatformError::Auth(format!("git {subcommand}: {}", stderr.trim()))
    } else if lower.contains("could not resolve host") || lower.contains("connection timed out") {
        PlatformError::Network(format!("git {subcommand}: {}", stderr.trim()))
    } else {
        PlatformError::Other(format!("git {subcommand} failed: {}", stderr.trim()))
    }
}

#[async_trait]
impl RepoWorkspace for GitWorkspace {
    async fn prepare(&self, repo: &RepoRef, clone_url: &str, base: &str) -> PlatformResult<PathBuf> {
        let dir = self.repo_dir(repo);
        if dir.join(".git").exists() {
            self.git(&dir, &["fetch", "--prune", "origin"]).await?;
            self.git(&dir, &["checkout", "-f", base]).await?;
            let remote_base = format!("origin/{base}");
            self.git(&dir, &["reset", "--hard", &remote_base]).await?;
            self.git(&dir, &["clean", "-fdx"]).await?;
        } else {
            let parent = dir
                .parent()
                .ok_or_else(|| PlatformError::Other("workspace has no parent".to_string()))?;
            std::fs::create_dir_all(parent)
                .map_err(|e| PlatformError::Other(format!("Failed to create workspace: {e}")))?;
            let target = dir.to_string_lossy().to_string();
            self.git(parent, &["clone", "--branch", base, clone_url, &target])
                .await?;
        }
        Ok(dir)
    }

    async fn create_branch(&self, path: &Path, branch: &str) -> PlatformResult<()> {
        self.git(path, &["checkout", "-B", branch]).await.map(|_| ())
    }

    async fn checkout_remote_branch(&self, path: &Path, branch: &str) -> PlatformResult<()> {
        self.git(path, &["fetch", "origin", branch]).await?;
        let remote = format!("origin/{branch}");
        self.git(path, &["checkout", "-B", branch, &remote]).await.map(|_| ())
    }

    async fn current_branch(&self, path: &Path) -> PlatformResult<String> {
        self.git(path, &["rev-parse", "--abbrev-ref", "HEAD"]).await
    }

    async fn has_merge_commits(&self, path: &Path, base: &str) -> PlatformResult<bool> {
        let range = format!("origin/{base}..HEAD");
        let merges = self.git(path, &["rev-list", "--merges", &range]).await?;
        Ok(!merges.is_empty())
    }

    async fn commits_ahead(&self, path: &Path, base: &str) -> PlatformResult<usize> {
        let range = format!("origin/{base}..HEAD");
        let count = self.git(path, &["rev-list", "--count", &range]).await?;
        count
            .parse()
            .map_err(|_| PlatformError::Other(format!("Unexpected rev-list output: {count}")))
    }

    async fn changed_files(&self, path: &Path, base: &str) -> PlatformResult<Vec<String>> {
        let range = format!("origin/{base}...HEAD");
        let out = self.git(path, &["diff", "--name-only", &range]).await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn run_tests(&self, path: &Path) -> PlatformResult<TestOutcome> {
        let Some(cmd) = discover_test_command(path) else {
            return Ok(TestOutcome::NoTests);
        };

        let output = tokio::time::timeout(
            self.test_timeout,
            Command::new(&cmd.program)
                .args(&cmd.args)
                .current_dir(path)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| PlatformError::Timeout(format!("{} exceeded {:?}", cmd.label, self.test_timeout)))?
        .map_err(|e| PlatformError::Other(format!("Failed to run {}: {}", cmd.label, e)))?;

        if output.status.success() {
            Ok(TestOutcome::Passed { runner: cmd.label })
        } else {
            let mut text = String::from_utf8_lossy(&output.stdout).to_string();
            text.push_str(&String::from_utf8_lossy(&output.stderr));
            Ok(TestOutcome::Failed {
                runner: cmd.label,
                output: tail(&text, 2000),
            })
        }
    }

    async fn push(&self, path: &Path, branch: &str) -> PlatformResult<()> {
        self.git(path, &["push", "--force-with-lease", "-u", "origin", branch])
            .await
            .map(|_| ())
    }
}

/// 保留输出末尾（失败信息通常在最后）
fn tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    text.chars().skip(count - max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discover_cargo() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Cargo.toml"), "[package]\nname = \"x\"\n").unwrap();
        let cmd = discover_test_command(dir.path()).unwrap();
        assert_eq!(cmd.label, "cargo test");
    }

    #[test]
    fn test_discover_ignores_placeholder_npm_script() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("package.json"),
            r#"{"scripts":{"test":"echo \"Error: no test specified\" && exit 1"}}"#,
        )
        .unwrap();
        assert!(discover_test_command(dir.path()).is_none());

        std::fs::write(dir.path().join("package.json"), r#"{"scripts":{"test":"vitest run"}}"#)
            .unwrap();
        assert_eq!(discover_test_command(dir.path()).unwrap().label, "npm test");
    }

    #[test]
    fn test_discover_pytest_skips_vendored_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let vendored = dir.path().join("node_modules").join("pkg");
        std::fs::create_dir_all(&vendored).unwrap();
        std::fs::write(vendored.join("test_vendor.py"), "").unwrap();
        assert!(discover_test_command(dir.path()).is_none());

        let tests = dir.path().join("tests");
        std::fs::create_dir_all(&tests).unwrap();
        std::fs::write(tests.join("test_core.py"), "def test_x(): pass\n").unwrap();
        assert_eq!(discover_test_command(dir.path()).unwrap().label, "pytest");
    }

    #[test]
    fn test_no_suite_discovered() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("README.md"), "hi").unwrap();
        assert!(discover_test_command(dir.path()).is_none());
    }

    #[test]
    fn test_classify_git_failure() {
        assert!(classify_git_failure("push", "fatal: Authentication failed for 'x'").is_fatal());
        assert!(matches!(
            classify_git_failure("fetch", "Could not resolve host: github.com"),
            PlatformError::Network(_)
        ));
    }

    #[test]
    fn test_tail_keeps_end() {
        assert_eq!(tail("abcdef", 3), "def");
        assert_eq!(tail("ab", 3), "ab");
    }
}
