//! 端到端：Orchestrator::process 从原始输入到最终回复

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;

use todowa::agent::{build_orchestrator, Collaborators, LlmSource};
use todowa::config::AppConfig;
use todowa::core::{Orchestrator, PipelineStage};
use todowa::llm::{
    CredentialBackend, CredentialPool, LlmClient, LlmError, MockLlmClient, ModelFactory, ModelProfile,
};
use todowa::memory::{InMemoryStore, NewSchedule, ScheduleType, Store, TaskQuery};
use todowa::notify::LogNotifier;
use todowa::tools::{Action, SearchHit, StaticSearch, ToolContext};

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap()
}

fn dentist_hits() -> Vec<SearchHit> {
    vec![SearchHit {
        title: "Smile Dental".into(),
        link: "https://example.com/dentist".into(),
        snippet: "Call us at 555-0100".into(),
    }]
}

fn build(llm: LlmSource, store: Arc<InMemoryStore>) -> Orchestrator {
    build_orchestrator(
        &AppConfig::default(),
        Collaborators {
            llm,
            store,
            search: Arc::new(StaticSearch::new(dentist_hits())),
            notifier: Arc::new(LogNotifier),
        },
    )
    .at(now())
}

fn shared(mock: MockLlmClient) -> (LlmSource, Arc<MockLlmClient>) {
    let mock = Arc::new(mock);
    (LlmSource::Shared(mock.clone()), mock)
}

#[tokio::test]
async fn test_compound_command_runs_schedule_and_search() {
    let (llm, mock) = shared(
        MockLlmClient::new()
            .with_rule("ANSWER SYNTHESIS", "I'll remind you to call mom at 12:10, and Smile Dental is at 555-0100.")
            .with_rule(
                "INTENT ROUTER",
                json!({"routes": [
                    {"route_to": "ScheduleAgent", "clarified_command": "remind me to call mom in 10 minutes", "confidence": 0.95, "rationale": "reminder"},
                    {"route_to": "FindingAgent", "clarified_command": "find dentist's number", "confidence": 0.9, "rationale": "lookup"}
                ]})
                .to_string(),
            )
            .with_rule(
                "SCHEDULE INTENT ANALYSIS",
                json!({"operations": [{"intent": "create", "action_type": "send_notification",
                    "action_payload": {"message": "call mom"}, "schedule_str": "in 10 minutes"}]})
                .to_string(),
            )
            .with_rule(
                "FINDING SEARCH PLAN",
                r#"{"search_term": "dentist's number", "relevant_categories": []}"#,
            ),
    );
    let store = Arc::new(InMemoryStore::new());
    let orch = build(llm, store.clone());

    let report = orch
        .process_detailed("u1", "remind me to call mom in 10 minutes and also find dentist's number")
        .await;

    assert_eq!(report.decisions.len(), 2);
    assert!(report.outcome.actions.len() >= 2);
    assert_eq!(report.results.len(), 2);
    assert_eq!(report.results[0].tool, "create_schedule");
    assert_eq!(report.results[1].tool, "internet_search");
    assert!(report.results.iter().all(|r| r.success));
    assert!(report.stages.contains(&PipelineStage::Executed));
    assert_eq!(report.outcome.source_label(), "MultiAgentExecution");
    assert!(report.reply.contains("555-0100"));

    let schedules = store.list_schedules("u1", None, 10).await.unwrap();
    assert_eq!(schedules.len(), 1);
    assert_eq!(schedules[0].next_run_at.as_deref(), Some("2025-03-10T12:10:00Z"));
    assert_eq!(schedules[0].action_payload["message"], "call mom");

    let synthesis = mock
        .prompts()
        .into_iter()
        .find(|p| p.contains("ANSWER SYNTHESIS"))
        .unwrap();
    assert!(!synthesis.contains(&schedules[0].id));
}

#[tokio::test]
async fn test_hourly_reminder_is_refused_without_actions() {
    let (llm, _) = shared(MockLlmClient::new().with_rule(
        "SCHEDULE INTENT ANALYSIS",
        r#"{"operations": [{"intent": "create", "action_payload": {"message": "drink water"}, "schedule_str": "every hour"}]}"#,
    ));
    let store = Arc::new(InMemoryStore::new());
    let orch = build(llm, store.clone());

    let report = orch.process_detailed("u1", "remind me every hour to drink water").await;
    assert!(report.results.is_empty());
    assert!(report.reply.contains("at most once per day"));
    assert!(store.list_schedules("u1", None, 10).await.unwrap().is_empty());
}

fn reminder_at(schedule_str: &str) -> MockLlmClient {
    MockLlmClient::new()
        .with_rule(
            "INTENT ROUTER",
            r#"{"route_to": "ScheduleAgent", "clarified_command": "remind me to stretch", "confidence": 0.9}"#,
        )
        .with_rule(
            "SCHEDULE INTENT ANALYSIS",
            json!({"operations": [{"intent": "create", "action_payload": {"message": "stretch"}, "schedule_str": schedule_str}]})
                .to_string(),
        )
}

#[tokio::test]
async fn test_absurd_relative_time_gets_a_reply() {
    let (llm, _) = shared(reminder_at("in 99999999 weeks"));
    let store = Arc::new(InMemoryStore::new());
    let orch = Arc::new(build(llm, store.clone()));

    let turn = tokio::spawn({
        let orch = orch.clone();
        async move { orch.process("u1", "remind me to stretch in 99999999 weeks").await }
    });
    let reply = turn.await.unwrap();
    assert!(reply.contains("couldn't figure out the exact time"));
    assert!(store.list_schedules("u1", None, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_past_date_is_not_scheduled() {
    let (llm, _) = shared(reminder_at("on 2020-01-01 09:00"));
    let store = Arc::new(InMemoryStore::new());
    let orch = build(llm, store.clone());

    let report = orch.process_detailed("u1", "remind me to stretch on 2020-01-01 09:00").await;
    assert!(report.results.is_empty());
    assert!(report.reply.contains("already passed"));
    assert!(store.list_schedules("u1", None, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_schedule_ceiling_blocks_further_creates() {
    let store = Arc::new(InMemoryStore::new());
    for i in 0..10 {
        store
            .create_schedule(
                "u1",
                NewSchedule {
                    action_type: "send_notification".into(),
                    action_payload: json!({"message": format!("reminder {i}")}),
                    schedule_type: ScheduleType::OneTime,
                    schedule_value: "2025-03-11T09:00:00Z".into(),
                    timezone: "UTC".into(),
                    next_run_at: Some("2025-03-11T09:00:00Z".into()),
                },
                10,
            )
            .await
            .unwrap();
    }
    let (llm, _) = shared(MockLlmClient::new().with_rule(
        "SCHEDULE INTENT ANALYSIS",
        r#"{"operations": [{"intent": "create", "action_payload": {"message": "stretch"}, "schedule_str": "in 5 minutes"}]}"#,
    ));
    let orch = build(llm, store.clone());

    let report = orch.process_detailed("u1", "remind me to stretch in 5 minutes").await;
    assert!(report.outcome.actions.is_empty());
    assert!(report.results.is_empty());
    assert!(report.reply.contains("maximum of 10 active schedules"));
    assert_eq!(store.list_schedules("u1", None, 50).await.unwrap().len(), 10);
}

#[tokio::test]
async fn test_router_sees_previous_turns() {
    let (llm, mock) = shared(
        MockLlmClient::new()
            .with_rule(
                "TASK INTENT ANALYSIS",
                r#"{"intents": [{"intent": "create_task", "title": "Buy milk", "category": "shopping", "due_date": "tomorrow"}]}"#,
            )
            .with_rule("ANSWER SYNTHESIS", "Added 'Buy milk'."),
    );
    let orch = build(llm, Arc::new(InMemoryStore::new()));

    assert_eq!(orch.process("u1", "add task buy milk tomorrow").await, "Added 'Buy milk'.");
    let second = orch.process("u1", "actually make it urgent").await;
    assert!(second.contains("clarify"));

    let router_prompt = mock
        .prompts()
        .into_iter()
        .find(|p| p.contains("INTENT ROUTER"))
        .unwrap();
    assert!(router_prompt.contains("add task buy milk tomorrow"));
    assert!(router_prompt.contains("Added 'Buy milk'."));
}

#[tokio::test]
async fn test_users_do_not_share_sessions() {
    let (llm, _) = shared(
        MockLlmClient::new()
            .with_rule(
                "TASK INTENT ANALYSIS",
                r#"{"intents": [{"intent": "create_task", "title": "Water plants", "category": "home", "due_date": "tomorrow"}]}"#,
            )
            .with_rule("ANSWER SYNTHESIS", "Done."),
    );
    let store = Arc::new(InMemoryStore::new());
    let orch = Arc::new(build(llm, store.clone()));

    let a = tokio::spawn({
        let orch = orch.clone();
        async move { orch.process("alice", "add task water plants tomorrow").await }
    });
    let b = tokio::spawn({
        let orch = orch.clone();
        async move { orch.process("bob", "add task water plants tomorrow").await }
    });
    assert_eq!(a.await.unwrap(), "Done.");
    assert_eq!(b.await.unwrap(), "Done.");

    for user in ["alice", "bob"] {
        let tasks = store.list_tasks(user, &TaskQuery::default()).await.unwrap();
        assert_eq!(tasks.len(), 1);
        let session = orch.sessions().session(user).await;
        assert_eq!(session.lock().await.history.len(), 1);
    }
}

#[tokio::test]
async fn test_flat_action_reaches_tool_without_type_key() {
    let store = Arc::new(InMemoryStore::new());
    let orch = build(LlmSource::Shared(Arc::new(MockLlmClient::new())), store.clone());
    let action = Action::from_value(json!({"type": "create_task", "title": "Buy milk"})).unwrap();
    let result = orch.executor().execute_action(action, &ToolContext::for_user("u1")).await;
    assert!(result.success);
    let tasks = store.list_tasks("u1", &TaskQuery::default()).await.unwrap();
    assert_eq!(tasks[0].title, "Buy milk");
    assert_eq!(tasks[0].priority, "medium");
}

/// 第一个 Key 配额耗尽，第二个正常
struct TwoKeyBackend;

impl CredentialBackend for TwoKeyBackend {
    fn connect(&self, api_key: &str, _profile: &ModelProfile) -> Arc<dyn LlmClient> {
        if api_key == "sk-dead" {
            Arc::new(MockLlmClient::new().with_failure("", LlmError::QuotaExceeded("429".into())))
        } else {
            Arc::new(
                MockLlmClient::new()
                    .with_rule(
                        "INTENT ROUTER",
                        r#"{"route_to": "GeneralFallbackAgent", "clarified_command": "say hello", "confidence": 0.9}"#,
                    )
                    .with_rule("GENERAL ASSISTANT", "Hello from the live key!"),
            )
        }
    }
}

#[tokio::test]
async fn test_broken_credential_is_rotated_transparently() {
    let pool = Arc::new(CredentialPool::new(["sk-dead", "sk-live"]));
    let factory = ModelFactory::new(pool.clone(), Arc::new(TwoKeyBackend));
    let orch = build(LlmSource::Factory(factory), Arc::new(InMemoryStore::new()));

    let reply = orch.process("u1", "hello there").await;
    assert_eq!(reply, "Hello from the live key!");
    assert_eq!(pool.broken_count(), 1);
    assert_eq!(pool.valid_count(), 1);
}

#[tokio::test]
async fn test_all_credentials_broken_still_replies() {
    let pool = Arc::new(CredentialPool::new(["sk-dead"]));
    let factory = ModelFactory::new(pool, Arc::new(TwoKeyBackend));
    let orch = build(LlmSource::Factory(factory), Arc::new(InMemoryStore::new()));

    let reply = orch.process("u1", "hello there").await;
    assert!(reply.contains("language service"));
}
