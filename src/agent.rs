//! 从配置装配完整的 Orchestrator
//!
//! 有 API Key 时所有 Agent 共享一个凭证池，各自持有带轮换的模型句柄；
//! 没有 Key 时退回 Mock 客户端，方便本地运行与测试。

use std::sync::Arc;
use std::time::Duration;

use crate::answer::AnsweringFormatter;
use crate::config::AppConfig;
use crate::core::{Orchestrator, OrchestratorSettings, SessionManager};
use crate::llm::{CredentialPool, LlmClient, MockLlmClient, ModelFactory, OpenAiBackend};
use crate::memory::{InMemoryStore, Store};
use crate::notify::{LogNotifier, Notifier};
use crate::planners::finding::FindingLimits;
use crate::planners::schedule::ScheduleRules;
use crate::planners::{
    BrainPlanner, Destination, FallbackPlanner, FindingPlanner, JournalPlanner, SchedulePlanner, TaskPlanner,
};
use crate::router::IntentRouter;
use crate::tools::{
    register_builtin_tools, ActionExecutor, CatalogueSettings, DuckDuckGoSearch, StaticSearch, ToolRegistry,
    WebSearch,
};

/// 模型句柄的来源
#[derive(Clone)]
pub enum LlmSource {
    /// 按 Agent 名创建轮换句柄
    Factory(ModelFactory),
    /// 所有 Agent 共用同一个客户端（Mock / 测试）
    Shared(Arc<dyn LlmClient>),
}

impl LlmSource {
    pub fn from_config(cfg: &AppConfig) -> Self {
        let keys = cfg.api_keys();
        if keys.is_empty() {
            tracing::warn!(env = %cfg.llm.api_keys_env, "no API keys configured, using mock LLM");
            return LlmSource::Shared(Arc::new(MockLlmClient::new()));
        }
        let pool = Arc::new(CredentialPool::new(keys));
        tracing::info!(
            provider = %cfg.llm.provider,
            model = %cfg.llm.model,
            credentials = pool.len(),
            "using OpenAI-compatible LLM"
        );
        let backend = Arc::new(OpenAiBackend::new(
            cfg.llm.base_url.clone(),
            cfg.llm.model.clone(),
            cfg.llm.chat_model().to_string(),
            cfg.llm.request_timeout_secs,
        ));
        LlmSource::Factory(ModelFactory::new(pool, backend))
    }

    pub fn structured(&self, agent: &str) -> Arc<dyn LlmClient> {
        match self {
            LlmSource::Factory(f) => f.structured(agent),
            LlmSource::Shared(c) => c.clone(),
        }
    }

    pub fn chat(&self, agent: &str) -> Arc<dyn LlmClient> {
        match self {
            LlmSource::Factory(f) => f.chat(agent),
            LlmSource::Shared(c) => c.clone(),
        }
    }
}

/// 装配所需的外部协作者
pub struct Collaborators {
    pub llm: LlmSource,
    pub store: Arc<dyn Store>,
    pub search: Arc<dyn WebSearch>,
    pub notifier: Arc<dyn Notifier>,
}

impl Collaborators {
    /// 按配置创建：内存存储、DuckDuckGo 搜索（创建失败时为空结果）、日志通知
    pub fn from_config(cfg: &AppConfig) -> Self {
        let search: Arc<dyn WebSearch> =
            match DuckDuckGoSearch::new(cfg.tools.search.endpoint.clone(), cfg.tools.search.timeout_secs) {
                Ok(s) => Arc::new(s),
                Err(e) => {
                    tracing::warn!(error = %e, "web search unavailable");
                    Arc::new(StaticSearch::default())
                }
            };
        Self {
            llm: LlmSource::from_config(cfg),
            store: Arc::new(InMemoryStore::new()),
            search,
            notifier: Arc::new(LogNotifier),
        }
    }
}

/// 由配置与协作者构建 Orchestrator
pub fn build_orchestrator(cfg: &AppConfig, parts: Collaborators) -> Orchestrator {
    let Collaborators {
        llm,
        store,
        search,
        notifier,
    } = parts;

    let mut registry = ToolRegistry::new().with_timeout(Duration::from_secs(cfg.tools.tool_timeout_secs));
    register_builtin_tools(
        &mut registry,
        store.clone(),
        search.clone(),
        &CatalogueSettings {
            search_max_results: cfg.tools.search.max_results,
            max_active_schedules: cfg.schedule.max_active_per_user,
            default_timezone: cfg.app.default_timezone.clone(),
        },
    );
    tracing::info!(tools = registry.tool_names().len(), "tool registry ready");

    let router = IntentRouter::new(llm.structured("IntentRouter"), cfg.router.confidence_threshold)
        .with_fast_match(cfg.router.fast_match);
    let schedule_rules = ScheduleRules {
        max_active: cfg.schedule.max_active_per_user,
        min_recurring_interval: chrono::Duration::hours(cfg.schedule.min_recurring_interval_hours),
    };
    let finding_limits = FindingLimits {
        category_search: cfg.finding.category_search_limit,
        recency_search: cfg.finding.recency_search_limit,
    };

    Orchestrator::new(
        router,
        ActionExecutor::new(Arc::new(registry)),
        AnsweringFormatter::new(llm.chat("AnsweringAgent")),
        store.clone(),
        notifier,
        SessionManager::new(cfg.app.history_turns),
        OrchestratorSettings {
            default_timezone: cfg.app.default_timezone.clone(),
            request_timeout: Duration::from_secs(cfg.app.request_timeout_secs),
        },
    )
    .with_planner(Arc::new(TaskPlanner::new(
        llm.structured(Destination::Task.as_str()),
        store.clone(),
    )))
    .with_planner(Arc::new(JournalPlanner::new(
        llm.structured(Destination::Journal.as_str()),
        store.clone(),
    )))
    .with_planner(Arc::new(BrainPlanner::new(
        llm.structured(Destination::Brain.as_str()),
        store.clone(),
    )))
    .with_planner(Arc::new(SchedulePlanner::new(
        llm.structured(Destination::Schedule.as_str()),
        store.clone(),
        schedule_rules,
    )))
    .with_planner(Arc::new(FindingPlanner::new(
        llm.structured(Destination::Finding.as_str()),
        store.clone(),
        finding_limits,
    )))
    .with_planner(Arc::new(FallbackPlanner::new(
        llm.structured(Destination::Fallback.as_str()),
        llm.chat(Destination::Fallback.as_str()),
        store,
        search,
        cfg.tools.search.max_results,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_build_answers_without_keys() {
        let cfg = AppConfig::default();
        let llm = Arc::new(MockLlmClient::new().with_rule("GENERAL ASSISTANT", "Hi! How can I help?"));
        let orch = build_orchestrator(
            &cfg,
            Collaborators {
                llm: LlmSource::Shared(llm),
                store: Arc::new(InMemoryStore::new()),
                search: Arc::new(StaticSearch::default()),
                notifier: Arc::new(LogNotifier),
            },
        );
        assert!(orch.executor().registry().contains("internet_search"));
        let reply = orch.process("local", "").await;
        assert!(!reply.is_empty());
    }
}
