//! 承诺履约：把队列里的承诺变成真实的平台动作

use std::sync::Arc;

use async_trait::async_trait;

use crate::commitment::queue::{Commitment, CommitmentParams};
use crate::conversation::parse_forge_key;
use crate::coordination::plan::{Plan, Task};
use crate::core::{HiveError, HiveResult};
use crate::platform::{
    ChatMessage, ContentGenerator, ForgeClient, NewIssue, RepoRef, ReplyTarget, SocialClient,
};

/// 履约器：成功时返回可读的结果摘要（例如新 issue 的坐标）
#[async_trait]
pub trait Fulfiller: Send + Sync {
    async fn fulfill(&self, commitment: &Commitment) -> HiveResult<String>;
}

/// 基于平台协作方的默认履约器
pub struct PlatformFulfiller {
    forge: Arc<dyn ForgeClient>,
    social: Arc<dyn SocialClient>,
    generator: Arc<dyn ContentGenerator>,
    default_repo: Option<RepoRef>,
    plan_label: String,
    persona: String,
}

impl PlatformFulfiller {
    pub fn new(
        forge: Arc<dyn ForgeClient>,
        social: Arc<dyn SocialClient>,
        generator: Arc<dyn ContentGenerator>,
        default_repo: Option<RepoRef>,
        plan_label: impl Into<String>,
        persona: impl Into<String>,
    ) -> Self {
        Self {
            forge,
            social,
            generator,
            default_repo,
            plan_label: plan_label.into(),
            persona: persona.into(),
        }
    }

    fn resolve_repo(&self, repo: Option<&str>) -> HiveResult<RepoRef> {
        match repo {
            Some(raw) => raw.parse().map_err(HiveError::Config),
            None => self.default_repo.clone().ok_or_else(|| {
                HiveError::Config("commitment names no repository and no default is set".to_string())
            }),
        }
    }

    async fn compose_follow_up(&self, commitment: &Commitment, topic: &str) -> HiveResult<String> {
        let system = format!(
            "{}\n\nEarlier you promised to follow up in a conversation. Write the follow-up now: \
one short post, under 280 characters, no greeting.",
            self.persona
        );
        let messages = [
            ChatMessage::assistant(commitment.source_reply_text.clone()),
            ChatMessage::user(format!("Follow up on: {topic}")),
        ];
        let reply = self.generator.chat_with_tools(&system, &messages, &[]).await?;
        let text = reply.text.trim();
        if text.is_empty() {
            return Err(HiveError::Config("generator returned an empty follow-up".to_string()));
        }
        Ok(text.to_string())
    }
}

/// 承诺对应的计划文档：一个目标加一个「界定范围」任务，后续由认领者细化
pub fn plan_from_goal(title: &str, goal: &str, source_thread: &str) -> Plan {
    let mut plan = Plan::new(title, goal);
    plan.tasks.push(
        Task::new(1, "Scope the work and split it into tasks")
            .with_description(format!("Break \"{title}\" down into concrete, independently shippable tasks.")),
    );
    plan.context = format!("Came out of the conversation at {source_thread}.");
    plan
}

#[async_trait]
impl Fulfiller for PlatformFulfiller {
    async fn fulfill(&self, commitment: &Commitment) -> HiveResult<String> {
        match &commitment.params {
            CommitmentParams::CreateIssue { repo, title, body } => {
                let repo = self.resolve_repo(repo.as_deref())?;
                let body = format!(
                    "{body}\n\n---\nFiled from the conversation at {}.",
                    commitment.source_thread_uri
                );
                let issue = self
                    .forge
                    .create_issue(
                        &repo,
                        &NewIssue {
                            title: title.clone(),
                            body,
                            labels: Vec::new(),
                        },
                    )
                    .await?;
                Ok(format!("{repo}#{}", issue.number))
            }
            CommitmentParams::CreatePlan { repo, title, goal } => {
                let repo = self.resolve_repo(repo.as_deref())?;
                let plan = plan_from_goal(title, goal, &commitment.source_thread_uri);
                let issue = self
                    .forge
                    .create_issue(
                        &repo,
                        &NewIssue {
                            title: plan.title.clone(),
                            body: plan.render(),
                            labels: vec![self.plan_label.clone()],
                        },
                    )
                    .await?;
                Ok(format!("{repo}#{}", issue.number))
            }
            CommitmentParams::PostFollowUp {
                topic,
                thread_root,
                parent,
            } => {
                let text = self.compose_follow_up(commitment, topic).await?;
                // 代码托管平台会话的跟进落在原 issue / PR 的评论里
                if let Some((repo, number)) = parse_forge_key(thread_root) {
                    self.forge.create_comment(&repo, number, &text).await?;
                    return Ok(format!("{repo}#{number}"));
                }
                let post = self
                    .social
                    .reply(
                        &text,
                        &ReplyTarget {
                            parent: parent.clone(),
                            root: thread_root.clone(),
                        },
                    )
                    .await?;
                Ok(post.uri)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commitment::queue::CommitmentStatus;
    use crate::platform::mock::{MockForge, MockGenerator, MockSocial};
    use chrono::Utc;

    fn commitment(params: CommitmentParams) -> Commitment {
        Commitment {
            id: "c1".into(),
            description: "test".into(),
            status: CommitmentStatus::InProgress,
            source_thread_uri: "at://alice/post/1".into(),
            source_reply_text: "I'll look into it".into(),
            params,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            attempts: 1,
            result: None,
            error: None,
        }
    }

    fn fulfiller(forge: Arc<MockForge>, social: Arc<MockSocial>, generator: Arc<MockGenerator>) -> PlatformFulfiller {
        PlatformFulfiller::new(
            forge,
            social,
            generator,
            Some(RepoRef::new("octo", "hive")),
            "plan",
            "You are a helpful bee.",
        )
    }

    #[tokio::test]
    async fn test_create_plan_is_parseable() {
        let forge = Arc::new(MockForge::new("bee"));
        let f = fulfiller(forge.clone(), Arc::new(MockSocial::new("bee")), Arc::new(MockGenerator::default()));
        let result = f
            .fulfill(&commitment(CommitmentParams::CreatePlan {
                repo: None,
                title: "Faster sync".into(),
                goal: "Cut sync time in half".into(),
            }))
            .await
            .unwrap();
        assert_eq!(result, "octo/hive#1");

        let issue = forge.issue(&RepoRef::new("octo", "hive"), 1).unwrap();
        assert_eq!(issue.labels, vec!["plan".to_string()]);
        let plan = Plan::parse(&issue.title, &issue.body).unwrap();
        assert_eq!(plan.goal, "Cut sync time in half");
        assert_eq!(plan.claimable_tasks().len(), 1);
    }

    #[tokio::test]
    async fn test_follow_up_replies_in_thread() {
        let social = Arc::new(MockSocial::new("bee"));
        let generator = Arc::new(MockGenerator::default());
        generator.push_text("Benchmarks are in: 2x faster.");
        let f = fulfiller(Arc::new(MockForge::new("bee")), social.clone(), generator);
        f.fulfill(&commitment(CommitmentParams::PostFollowUp {
            topic: "benchmarks".into(),
            thread_root: "at://alice/post/1".into(),
            parent: "at://alice/post/2".into(),
        }))
        .await
        .unwrap();

        let replies = social.replies();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].text, "Benchmarks are in: 2x faster.");
        assert_eq!(replies[0].reply_to.as_ref().unwrap().parent, "at://alice/post/2");
    }

    #[tokio::test]
    async fn test_forge_follow_up_becomes_comment() {
        let forge = Arc::new(MockForge::new("bee"));
        let social = Arc::new(MockSocial::new("bee"));
        let f = fulfiller(forge.clone(), social.clone(), Arc::new(MockGenerator::new("Fixed in #9.")));
        let result = f
            .fulfill(&commitment(CommitmentParams::PostFollowUp {
                topic: "the fix".into(),
                thread_root: "octo/hive#4".into(),
                parent: "octo/hive#4".into(),
            }))
            .await
            .unwrap();
        assert_eq!(result, "octo/hive#4");
        assert_eq!(forge.comments(&RepoRef::new("octo", "hive"), 4), vec!["Fixed in #9.".to_string()]);
        assert!(social.posts().is_empty());
    }

    #[tokio::test]
    async fn test_bad_repo_is_an_error() {
        let f = fulfiller(
            Arc::new(MockForge::new("bee")),
            Arc::new(MockSocial::new("bee")),
            Arc::new(MockGenerator::default()),
        );
        let err = f
            .fulfill(&commitment(CommitmentParams::CreateIssue {
                repo: Some("not-a-repo".into()),
                title: "x".into(),
                body: "y".into(),
            }))
            .await
            .unwrap_err();
        assert!(matches!(err, HiveError::Config(_)));
    }
}
