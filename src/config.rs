//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `TODOWA__*` 覆盖（双下划线表示嵌套，如 `TODOWA__LLM__MODEL=gpt-4o-mini`）。
//! API Key 不写进配置文件，默认从逗号分隔的 `TODOWA_API_KEYS` 读取。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub router: RouterSection,
    pub schedule: ScheduleSection,
    pub tools: ToolsSection,
    pub finding: FindingSection,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    pub name: Option<String>,
    /// 用户没有设置时区时使用
    #[serde(default = "default_timezone")]
    pub default_timezone: String,
    /// 路由与回答时参考的最近交互数
    #[serde(default = "default_history_turns")]
    pub history_turns: usize,
    /// 单条指令的处理上限（秒）
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            default_timezone: default_timezone(),
            history_turns: default_history_turns(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_history_turns() -> usize {
    5
}

fn default_request_timeout_secs() -> u64 {
    90
}

/// [llm] 段：OpenAI 兼容端点与凭证
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    #[serde(default = "default_provider")]
    pub provider: String,
    /// JSON 输出句柄使用的模型
    #[serde(default = "default_model")]
    pub model: String,
    /// 自由文本句柄使用的模型，未设置时同 model
    pub chat_model: Option<String>,
    pub base_url: Option<String>,
    /// 直接写在配置里的 Key（优先于环境变量）
    #[serde(default)]
    pub api_keys: Vec<String>,
    #[serde(default = "default_api_keys_env")]
    pub api_keys_env: String,
    /// 单次模型请求超时（秒）
    #[serde(default = "default_llm_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            chat_model: None,
            base_url: None,
            api_keys: Vec::new(),
            api_keys_env: default_api_keys_env(),
            request_timeout_secs: default_llm_timeout(),
        }
    }
}

impl LlmSection {
    pub fn chat_model(&self) -> &str {
        self.chat_model.as_deref().unwrap_or(&self.model)
    }
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_api_keys_env() -> String {
    "TODOWA_API_KEYS".to_string()
}

fn default_llm_timeout() -> u64 {
    60
}

/// [router] 段
#[derive(Debug, Clone, Deserialize)]
pub struct RouterSection {
    /// 低于该置信度时先向用户澄清
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    /// 关键词快速路由
    #[serde(default = "default_fast_match")]
    pub fast_match: bool,
}

impl Default for RouterSection {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence_threshold(),
            fast_match: default_fast_match(),
        }
    }
}

fn default_confidence_threshold() -> f64 {
    crate::router::DEFAULT_CONFIDENCE_THRESHOLD
}

fn default_fast_match() -> bool {
    true
}

/// [schedule] 段
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleSection {
    #[serde(default = "default_max_active")]
    pub max_active_per_user: usize,
    /// 周期日程两次运行的最小间隔（小时）
    #[serde(default = "default_min_interval_hours")]
    pub min_recurring_interval_hours: i64,
}

impl Default for ScheduleSection {
    fn default() -> Self {
        Self {
            max_active_per_user: default_max_active(),
            min_recurring_interval_hours: default_min_interval_hours(),
        }
    }
}

fn default_max_active() -> usize {
    10
}

fn default_min_interval_hours() -> i64 {
    24
}

/// [tools] 段
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    #[serde(default)]
    pub search: SearchSection,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: default_tool_timeout_secs(),
            search: SearchSection::default(),
        }
    }
}

fn default_tool_timeout_secs() -> u64 {
    30
}

/// [tools.search] 段：网络搜索端点、超时、结果条数
#[derive(Debug, Clone, Deserialize)]
pub struct SearchSection {
    pub endpoint: Option<String>,
    #[serde(default = "default_search_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
}

impl Default for SearchSection {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_secs: default_search_timeout_secs(),
            max_results: default_max_results(),
        }
    }
}

fn default_search_timeout_secs() -> u64 {
    15
}

fn default_max_results() -> usize {
    5
}

/// [finding] 段：两轮候选的数量上限
#[derive(Debug, Clone, Deserialize)]
pub struct FindingSection {
    #[serde(default = "default_category_search_limit")]
    pub category_search_limit: usize,
    #[serde(default = "default_recency_search_limit")]
    pub recency_search_limit: usize,
}

impl Default for FindingSection {
    fn default() -> Self {
        Self {
            category_search_limit: default_category_search_limit(),
            recency_search_limit: default_recency_search_limit(),
        }
    }
}

fn default_category_search_limit() -> usize {
    25
}

fn default_recency_search_limit() -> usize {
    20
}

impl AppConfig {
    /// 配置中的 Key，没有时读环境变量（逗号分隔）
    pub fn api_keys(&self) -> Vec<String> {
        let keys: Vec<String> = self
            .llm
            .api_keys
            .iter()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect();
        if !keys.is_empty() {
            return keys;
        }
        std::env::var(&self.llm.api_keys_env)
            .map(|v| {
                v.split(',')
                    .map(|k| k.trim().to_string())
                    .filter(|k| !k.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// 从 config 目录加载配置，环境变量 TODOWA__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 TODOWA__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default", "default"] {
        if std::path::Path::new(&format!("{name}.toml")).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(path) = config_path.filter(|p| p.exists()) {
        builder = builder.add_source(config::File::from(path).required(false));
    }

    builder = builder.add_source(
        config::Environment::with_prefix("TODOWA")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.router.confidence_threshold, 0.4);
        assert_eq!(cfg.schedule.max_active_per_user, 10);
        assert_eq!(cfg.schedule.min_recurring_interval_hours, 24);
        assert_eq!(cfg.app.history_turns, 5);
        assert_eq!(cfg.finding.category_search_limit, 25);
        assert_eq!(cfg.llm.chat_model(), "gpt-4o-mini");
    }

    #[test]
    fn test_explicit_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[app]\ndefault_timezone = \"Asia/Jakarta\"\n\n[llm]\nmodel = \"gpt-4o\"\nchat_model = \"gpt-4o-mini\"\napi_keys = [\"sk-a\", \" \", \"sk-b\"]\n\n[schedule]\nmax_active_per_user = 3\n\n[tools.search]\nmax_results = 8"
        )
        .unwrap();
        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.app.default_timezone, "Asia/Jakarta");
        assert_eq!(cfg.llm.model, "gpt-4o");
        assert_eq!(cfg.llm.chat_model(), "gpt-4o-mini");
        assert_eq!(cfg.api_keys(), vec!["sk-a".to_string(), "sk-b".to_string()]);
        assert_eq!(cfg.schedule.max_active_per_user, 3);
        assert_eq!(cfg.tools.search.max_results, 8);
        assert_eq!(cfg.router.confidence_threshold, 0.4);
    }
}
