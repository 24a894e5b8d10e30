//! 调度器集成测试：分诊与关闭、模式互斥、回复周期、承诺履约、计划感知与状态持久化

mod common;

use std::path::PathBuf;

use chrono::{Duration, Utc};
use common::{comments_containing, read_plan, repo, seed_plan, set_task, Harness};
use hive::commitment::{CommitmentKind, CommitmentStatus};
use hive::conversation::{ConclusionReason, ConversationState, Platform};
use hive::coordination::{Task, TaskStatus};
use hive::platform::{
    ChatReply, ForgeNotification, ForgeReason, IssueState, PlatformError, PostMetrics, ThreadPost,
    ToolCall, GRACEFUL_EXIT, SELF_IMPROVE,
};
use hive::{HiveError, LoopKind, Mode, ShutdownReason};

const ROOT: &str = "at://alice/post/root";

fn tool_call(name: &str, arguments: serde_json::Value) -> ToolCall {
    ToolCall {
        id: format!("call-{name}"),
        name: name.to_string(),
        arguments,
    }
}

fn forge_mention(id: &str, number: u64, body: &str) -> ForgeNotification {
    ForgeNotification {
        id: id.to_string(),
        repo: repo(),
        number,
        title: "Retries are flaky".to_string(),
        reason: ForgeReason::Mention,
        is_pull_request: false,
        author: "alice".to_string(),
        body: body.to_string(),
        updated_at: Utc::now(),
    }
}

#[tokio::test]
async fn test_version_mismatch_requests_shutdown() {
    let h = Harness::new();
    h.version.set(Ok(Some("2.0.0\n".to_string())));

    let result = h.scheduler().run_once(LoopKind::VersionCheck).await;
    assert!(matches!(result, Err(HiveError::VersionMismatch { .. })));
    assert_eq!(
        h.scheduler().shutdown_reason(),
        Some(ShutdownReason::VersionMismatch {
            local: "1.0.0".to_string(),
            remote: "2.0.0".to_string(),
        })
    );
}

#[tokio::test]
async fn test_matching_or_missing_version_keeps_running() {
    let h = Harness::new();
    h.scheduler().run_once(LoopKind::VersionCheck).await.unwrap();
    h.version.set(Ok(None));
    h.scheduler().run_once(LoopKind::VersionCheck).await.unwrap();
    h.version.set(Err(PlatformError::Network("unreachable".into())));
    assert!(h.scheduler().run_once(LoopKind::VersionCheck).await.is_err());
    assert!(h.scheduler().shutdown_reason().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_started_scheduler_stops_on_version_mismatch() {
    let h = Harness::new();
    h.version.set(Ok(Some("2.0.0".to_string())));

    h.scheduler().start();
    let reason = h.scheduler().wait().await;
    assert_eq!(
        reason,
        ShutdownReason::VersionMismatch {
            local: "1.0.0".to_string(),
            remote: "2.0.0".to_string(),
        }
    );
    assert!(h.dir.path().join("session.json").exists());
}

#[tokio::test(start_paused = true)]
async fn test_stop_reports_requested() {
    let h = Harness::new();
    h.scheduler().start();
    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    assert_eq!(h.scheduler().stop().await, ShutdownReason::Requested);
    assert_eq!(h.scheduler().mode(), Mode::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_signal_shutdown_persists_state() {
    let h = Harness::new();
    h.scheduler().install_signal_handlers();
    h.scheduler().start();
    tokio::time::sleep(std::time::Duration::from_secs(1)).await;

    h.scheduler().shutdown_manager().shutdown(ShutdownReason::Signal);
    assert_eq!(h.scheduler().wait().await, ShutdownReason::Signal);
    assert!(h.dir.path().join("commitments.json").exists());
    assert!(h.dir.path().join("conversations_social.json").exists());
}

#[tokio::test]
async fn test_auth_failure_is_fatal() {
    let h = Harness::new();
    h.social.fail_auth(true);

    let err = h.scheduler().run_once(LoopKind::SessionRefresh).await.unwrap_err();
    assert!(err.is_fatal());
    assert!(matches!(h.scheduler().shutdown_reason(), Some(ShutdownReason::Fatal(_))));
}

#[tokio::test]
async fn test_soft_failure_is_recorded_and_rescheduled() {
    let h = Harness::new();
    h.generator.push_error(PlatformError::Api {
        status: 503,
        message: "overloaded".into(),
    });

    assert!(h.scheduler().run_once(LoopKind::Expression).await.is_err());
    assert!(h.scheduler().shutdown_reason().is_none());
    assert_eq!(h.scheduler().mode(), Mode::Idle);
    let health = h.scheduler().loop_health(LoopKind::Expression).unwrap();
    assert_eq!(health.consecutive_failures, 1);

    h.scheduler().run_once(LoopKind::Expression).await.unwrap();
    let health = h.scheduler().loop_health(LoopKind::Expression).unwrap();
    assert_eq!(health.consecutive_failures, 0);
    assert_eq!(h.social.posts().len(), 1);
}

#[tokio::test]
async fn test_busy_mode_skips_cycle() {
    let h = Harness::new();
    h.social
        .push_reply("alice", "How does the retry backoff work here?", ROOT, ROOT, Utc::now());

    let guard = h.scheduler().modes().try_enter(Mode::Reflecting).unwrap();
    h.scheduler().run_once(LoopKind::SocialAwareness).await.unwrap();
    assert!(h.social.replies().is_empty());
    assert!(h.scheduler().ledger().await.social_cursor.is_none());
    assert_eq!(h.scheduler().mode(), Mode::Reflecting);
    drop(guard);

    h.scheduler().run_once(LoopKind::SocialAwareness).await.unwrap();
    assert_eq!(h.social.replies().len(), 1);
    assert_eq!(h.scheduler().mode(), Mode::Idle);
    let conv = h.scheduler().conversation(Platform::Social, ROOT).await.unwrap();
    assert_eq!(conv.state, ConversationState::AwaitingResponse);
    assert_eq!(conv.our_replies, 1);
}

#[tokio::test]
async fn test_notification_processed_once() {
    let h = Harness::new();
    h.social
        .push_reply("alice", "Is the retry budget per host?", ROOT, ROOT, Utc::now());

    h.scheduler().run_once(LoopKind::SocialAwareness).await.unwrap();
    h.scheduler().run_once(LoopKind::SocialAwareness).await.unwrap();
    assert_eq!(h.social.replies().len(), 1);
    assert_eq!(h.generator.calls().len(), 1);
}

#[tokio::test]
async fn test_direct_action_suppresses_matching_commitment() {
    let h = Harness::new();
    h.social
        .push_reply("alice", "The retry bug bit us again today.", ROOT, ROOT, Utc::now());
    h.generator.push_reply(ChatReply {
        text: "I'll file an issue for the retry bug.".to_string(),
        tool_calls: vec![tool_call(
            "create_issue",
            serde_json::json!({"title": "Retry bug"}),
        )],
    });

    h.scheduler().run_once(LoopKind::SocialAwareness).await.unwrap();
    assert_eq!(h.dispatcher.calls().len(), 1);
    assert!(h.scheduler().commitments_snapshot().await.is_empty());
    let conv = h.scheduler().conversation(Platform::Social, ROOT).await.unwrap();
    assert!(conv.work_linked);
}

#[tokio::test]
async fn test_promise_is_queued_and_fulfilled() {
    let h = Harness::new();
    h.social
        .push_reply("alice", "The retry bug bit us again today.", ROOT, ROOT, Utc::now());
    h.generator.push_text("Ugh, sorry. I'll file an issue for the retry bug.");

    h.scheduler().run_once(LoopKind::SocialAwareness).await.unwrap();
    let queued = h.scheduler().commitments_snapshot().await;
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].kind(), CommitmentKind::CreateIssue);
    assert_eq!(queued[0].status, CommitmentStatus::Pending);
    assert_eq!(queued[0].source_thread_uri, ROOT);

    h.scheduler().run_once(LoopKind::Commitments).await.unwrap();
    let done = h.scheduler().commitments_snapshot().await;
    assert_eq!(done[0].status, CommitmentStatus::Completed);
    assert_eq!(done[0].result.as_deref(), Some("octo/hive#1"));
    let issues = h.forge.issues(&repo());
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].title, "The retry bug");
    assert_eq!(h.scheduler().mode(), Mode::Idle);
}

#[tokio::test]
async fn test_empty_queue_does_not_take_mode() {
    let h = Harness::new();
    let guard = h.scheduler().modes().try_enter(Mode::Expressing).unwrap();
    h.scheduler().run_once(LoopKind::Commitments).await.unwrap();
    assert_eq!(h.scheduler().mode(), Mode::Expressing);
    drop(guard);
}

#[tokio::test]
async fn test_graceful_exit_is_sticky() {
    let h = Harness::new();
    let t0 = Utc::now();
    h.social
        .push_reply("alice", "What made you pick exponential backoff?", ROOT, ROOT, t0);
    h.generator.push_reply(ChatReply {
        text: String::new(),
        tool_calls: vec![tool_call(
            GRACEFUL_EXIT,
            serde_json::json!({
                "reason": "we covered it",
                "closing_message": "Happy to have talked it through, take care!"
            }),
        )],
    });

    h.scheduler().run_once(LoopKind::SocialAwareness).await.unwrap();
    let replies = h.social.replies();
    assert_eq!(replies.len(), 1);
    assert!(replies[0].text.starts_with("Happy to have talked"));
    let conv = h.scheduler().conversation(Platform::Social, ROOT).await.unwrap();
    assert_eq!(conv.conclusion, Some(ConclusionReason::ExplicitClose));

    h.social.push_reply(
        "alice",
        "Actually, how would jitter interact with the retry budget across hosts?",
        ROOT,
        &replies[0].uri,
        t0 + Duration::seconds(30),
    );
    h.scheduler().run_once(LoopKind::SocialAwareness).await.unwrap();
    assert_eq!(h.social.replies().len(), 1);
    let conv = h.scheduler().conversation(Platform::Social, ROOT).await.unwrap();
    assert_eq!(conv.state, ConversationState::Concluded);
}

#[tokio::test]
async fn test_peer_answer_means_stand_down() {
    let h = Harness::with_config(|cfg| cfg.agent.peers = vec!["bee-b".to_string()]);
    let at = Utc::now();
    let question = h
        .social
        .push_reply("alice", "Which of you owns the retry work?", ROOT, ROOT, at);
    h.social.set_thread(
        ROOT,
        vec![
            ThreadPost {
                uri: question.clone(),
                author: "alice".to_string(),
                text: "Which of you owns the retry work?".to_string(),
                parent: Some(ROOT.to_string()),
                indexed_at: at,
            },
            ThreadPost {
                uri: "at://bee-b/post/9".to_string(),
                author: "bee-b".to_string(),
                text: "That one is mine, I'm on it.".to_string(),
                parent: Some(question),
                indexed_at: at + Duration::seconds(2),
            },
        ],
    );

    h.scheduler().run_once(LoopKind::SocialAwareness).await.unwrap();
    assert!(h.social.replies().is_empty());
    assert!(h.generator.calls().is_empty());
    let conv = h.scheduler().conversation(Platform::Social, ROOT).await.unwrap();
    assert!(conv.participants.contains_key("bee-b"));
}

#[tokio::test]
async fn test_forge_mention_gets_comment_and_follow_up() {
    let h = Harness::new();
    h.forge
        .push_notification(forge_mention("f-1", 7, "@bee can you look at the retry flake?"));
    h.generator
        .push_text("Looking into it now. I'll report back on the flaky retry test.");
    h.generator
        .push_text("Root cause: the retry budget was shared across hosts. Fix incoming.");

    h.scheduler().run_once(LoopKind::ForgeAwareness).await.unwrap();
    let comments = h.forge.comments(&repo(), 7);
    assert_eq!(comments.len(), 1);
    assert!(comments[0].starts_with("Looking into it"));
    let conv = h
        .scheduler()
        .conversation(Platform::Forge, "octo/hive#7")
        .await
        .unwrap();
    assert_eq!(conv.our_replies, 1);

    let queued = h.scheduler().commitments_snapshot().await;
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].kind(), CommitmentKind::PostFollowUp);

    h.scheduler().run_once(LoopKind::Commitments).await.unwrap();
    let comments = h.forge.comments(&repo(), 7);
    assert_eq!(comments.len(), 2);
    assert!(comments[1].contains("Root cause"));
    let done = h.scheduler().commitments_snapshot().await;
    assert_eq!(done[0].result.as_deref(), Some("octo/hive#7"));
    assert!(h.social.posts().is_empty());
}

#[tokio::test]
async fn test_review_request_gets_review() {
    let h = Harness::new();
    let mut n = forge_mention("f-2", 12, "Could you review the retry change?");
    n.reason = ForgeReason::ReviewRequested;
    n.is_pull_request = true;
    h.forge.push_notification(n);
    h.generator.push_text("Looks solid, one nit on the backoff cap.");

    h.scheduler().run_once(LoopKind::ForgeAwareness).await.unwrap();
    let reviews = h.forge.reviews();
    assert_eq!(reviews.len(), 1);
    assert_eq!(reviews[0].number, 12);
    assert!(h.forge.comments(&repo(), 12).is_empty());
    let conv = h
        .scheduler()
        .conversation(Platform::Forge, "octo/hive#12")
        .await
        .unwrap();
    assert!(conv.work_linked);
}

#[tokio::test]
async fn test_plan_awareness_recovers_and_delivers() {
    let h = Harness::with_config(|cfg| cfg.recovery.stuck_timeout_mins = 0);
    let plan_ref = seed_plan(&h.forge, vec![Task::new(1, "Add retries")]);
    set_task(&h.forge, &plan_ref, 1, TaskStatus::InProgress, Some("bee-gone"));

    h.scheduler().run_once(LoopKind::PlanAwareness).await.unwrap();

    assert_eq!(comments_containing(&h.forge, &plan_ref, "Resetting it to pending"), 1);
    let task = read_plan(&h.forge, &plan_ref).task(1).cloned().unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.assignee.as_deref(), Some("bee"));
    assert_eq!(h.forge.pull_requests(&repo()).len(), 1);
    assert_eq!(
        h.forge.issue(&repo(), plan_ref.number).unwrap().state,
        IssueState::Closed
    );
    assert_eq!(h.scheduler().mode(), Mode::Idle);
}

#[tokio::test]
async fn test_gate_failure_is_soft() {
    let h = Harness::new();
    let plan_ref = seed_plan(&h.forge, vec![Task::new(1, "Add retries")]);
    h.workspace.script(|s| s.commits_ahead = 0);

    let err = h.scheduler().run_once(LoopKind::PlanAwareness).await.unwrap_err();
    assert!(matches!(err, HiveError::Gate { gate: "changes", .. }));
    assert!(h.scheduler().shutdown_reason().is_none());
    assert_eq!(
        read_plan(&h.forge, &plan_ref).task(1).unwrap().status,
        TaskStatus::Blocked
    );
}

#[tokio::test]
async fn test_engagement_records_metrics() {
    let h = Harness::new();
    h.generator.push_text("Shipping retries with jitter today.");
    h.scheduler().run_once(LoopKind::Expression).await.unwrap();
    let post = h.social.posts().remove(0);

    let metrics = PostMetrics {
        likes: 3,
        replies: 1,
        reposts: 0,
    };
    h.social.set_metrics(&post.uri, metrics);
    h.scheduler().run_once(LoopKind::Engagement).await.unwrap();

    let ledger = h.scheduler().ledger().await;
    assert!(ledger.last_expression.is_some());
    let own = ledger.recent_posts.iter().find(|p| p.uri == post.uri).unwrap();
    assert_eq!(own.metrics, Some(metrics));
}

#[tokio::test]
async fn test_reflection_runs_self_improvement() {
    let h = Harness::with_config(|cfg| {
        cfg.agent.self_workspace = Some(PathBuf::from("/tmp/hive-self"));
    });
    h.generator.push_reply(ChatReply {
        text: "Replies ran long this week.".to_string(),
        tool_calls: vec![tool_call(
            SELF_IMPROVE,
            serde_json::json!({"goal": "Keep replies under 200 characters"}),
        )],
    });

    h.scheduler().run_once(LoopKind::Reflection).await.unwrap();
    let prompts = h.coder.prompts();
    assert_eq!(prompts.len(), 1);
    assert!(prompts[0].contains("Keep replies under 200 characters"));
    assert!(h.scheduler().ledger().await.last_reflection.is_some());
    assert_eq!(h.scheduler().mode(), Mode::Idle);
}

#[tokio::test]
async fn test_reflection_without_workspace_skips_coding() {
    let h = Harness::new();
    h.generator.push_reply(ChatReply {
        text: String::new(),
        tool_calls: vec![tool_call(
            SELF_IMPROVE,
            serde_json::json!({"goal": "Cache thread lookups"}),
        )],
    });
    h.scheduler().run_once(LoopKind::Reflection).await.unwrap();
    assert!(h.coder.prompts().is_empty());
}

#[tokio::test]
async fn test_heartbeat_is_persisted() {
    let h = Harness::new();
    h.scheduler().run_once(LoopKind::Heartbeat).await.unwrap();
    assert!(h.scheduler().ledger().await.last_heartbeat.is_some());

    let raw = std::fs::read_to_string(h.dir.path().join("session.json")).unwrap();
    assert!(raw.contains("last_heartbeat"));
}

#[tokio::test]
async fn test_state_survives_restart() {
    let h = Harness::new();
    h.social
        .push_reply("alice", "Does the retry queue survive restarts?", ROOT, ROOT, Utc::now());
    h.generator.push_text("It should. I'll follow up on the restart behaviour.");
    h.scheduler().run_once(LoopKind::SocialAwareness).await.unwrap();
    h.scheduler().persist().await.unwrap();

    let reopened = h.reopen();
    let conv = reopened.conversation(Platform::Social, ROOT).await.unwrap();
    assert_eq!(conv.our_replies, 1);
    assert_eq!(conv.state, ConversationState::AwaitingResponse);
    assert_eq!(reopened.commitment_stats().await.pending, 1);
    assert!(reopened.ledger().await.social_cursor.is_some());

    // 已处理的通知在重启后不会再次回复
    reopened.run_once(LoopKind::SocialAwareness).await.unwrap();
    assert_eq!(h.social.replies().len(), 1);
}
