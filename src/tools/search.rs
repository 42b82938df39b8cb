//! 网络搜索：DuckDuckGo HTML 端点
//!
//! GET 请求带超时与 User-Agent；结果页用正则切出标题、链接、摘要，
//! 摘要片段用 html2text 转为纯文本（失败时回退到简易去标签）。

use std::time::Duration;

use async_trait::async_trait;
use html2text::from_read;
use regex::Regex;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};

use crate::tools::ToolError;

/// 单条搜索结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub link: String,
    pub snippet: String,
}

/// 搜索后端
#[async_trait]
pub trait WebSearch: Send + Sync {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchHit>, ToolError>;
}

pub const DEFAULT_ENDPOINT: &str = "https://html.duckduckgo.com/html/";

pub struct DuckDuckGoSearch {
    client: Client,
    endpoint: String,
    result_re: Regex,
    snippet_re: Regex,
}

/// 简易去除 HTML 标签（html2text 失败时的回退）
fn strip_html_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn fragment_to_text(fragment: &str) -> String {
    match from_read(fragment.as_bytes(), 10_000) {
        Ok(text) if !text.trim().is_empty() => {
            text.split_whitespace().collect::<Vec<_>>().join(" ")
        }
        _ => strip_html_tags(fragment),
    }
}

/// DuckDuckGo 的结果链接经 /l/?uddg= 跳转，取出真实地址
fn resolve_link(href: &str) -> String {
    let absolute = if href.starts_with("//") {
        format!("https:{href}")
    } else {
        href.to_string()
    };
    match Url::parse(&absolute) {
        Ok(url) if url.path().starts_with("/l/") => url
            .query_pairs()
            .find(|(k, _)| k == "uddg")
            .map(|(_, v)| v.into_owned())
            .unwrap_or(absolute),
        _ => absolute,
    }
}

impl DuckDuckGoSearch {
    pub fn new(endpoint: Option<String>, timeout_secs: u64) -> Result<Self, ToolError> {
        const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| ToolError::Execution(format!("http client: {e}")))?;
        let result_re = Regex::new(r#"(?s)<a[^>]*class="result__a"[^>]*href="([^"]+)"[^>]*>(.*?)</a>"#)
            .map_err(|e| ToolError::Execution(e.to_string()))?;
        let snippet_re = Regex::new(r#"(?s)class="result__snippet"[^>]*>(.*?)</a>"#)
            .map_err(|e| ToolError::Execution(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            result_re,
            snippet_re,
        })
    }

    /// 从结果页 HTML 中解析结果；没有摘要的结果丢弃
    fn parse_results(&self, html: &str, max_results: usize) -> Vec<SearchHit> {
        let snippets: Vec<String> = self
            .snippet_re
            .captures_iter(html)
            .map(|c| fragment_to_text(&c[1]))
            .collect();
        self.result_re
            .captures_iter(html)
            .enumerate()
            .filter_map(|(i, c)| {
                let snippet = snippets.get(i).cloned().unwrap_or_default();
                if snippet.is_empty() {
                    return None;
                }
                Some(SearchHit {
                    title: fragment_to_text(&c[2]),
                    link: resolve_link(&c[1]),
                    snippet,
                })
            })
            .take(max_results)
            .collect()
    }
}

#[async_trait]
impl WebSearch for DuckDuckGoSearch {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchHit>, ToolError> {
        tracing::info!(query = %query, "internet search");
        let resp = self
            .client
            .get(&self.endpoint)
            .query(&[("q", query)])
            .send()
            .await
            .map_err(|e| ToolError::Execution(format!("Request failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(ToolError::Execution(format!("HTTP {}", resp.status())));
        }
        let body = resp
            .text()
            .await
            .map_err(|e| ToolError::Execution(format!("Read body: {e}")))?;
        Ok(self.parse_results(&body, max_results))
    }
}

/// 固定结果的搜索后端（离线运行与测试）
#[derive(Debug, Clone, Default)]
pub struct StaticSearch {
    hits: Vec<SearchHit>,
    fail: bool,
}

impl StaticSearch {
    pub fn new(hits: Vec<SearchHit>) -> Self {
        Self { hits, fail: false }
    }

    pub fn failing() -> Self {
        Self {
            hits: Vec::new(),
            fail: true,
        }
    }
}

#[async_trait]
impl WebSearch for StaticSearch {
    async fn search(&self, _query: &str, max_results: usize) -> Result<Vec<SearchHit>, ToolError> {
        if self.fail {
            return Err(ToolError::Execution("search backend unavailable".into()));
        }
        Ok(self.hits.iter().take(max_results).cloned().collect())
    }
}
