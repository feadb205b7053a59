//! Web access tools: search and fetch URLs.
//!
//! Web search uses the Tavily API and needs `TAVILY_API_KEY`.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{Tool, ToolError, ToolInput};

const MAX_FETCH_CHARS: usize = 20_000;

/// Search the web using the Tavily API.
pub struct WebSearch;

/// Tavily API request body.
#[derive(Debug, Serialize)]
struct TavilySearchRequest<'a> {
    api_key: &'a str,
    query: &'a str,
    max_results: u32,
    include_answer: bool,
}

/// Tavily API response.
#[derive(Debug, Deserialize)]
struct TavilySearchResponse {
    #[serde(default)]
    answer: Option<String>,
    #[serde(default)]
    results: Vec<TavilyResult>,
}

#[derive(Debug, Deserialize)]
struct TavilyResult {
    title: String,
    url: String,
    content: String,
}

fn http_client(timeout: Duration) -> Result<reqwest::Client, ToolError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent("plangraph/0.1")
        .build()
        .map_err(|e| ToolError::Unavailable(format!("HTTP client: {}", e)))
}

#[async_trait]
impl Tool for WebSearch {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "web_search(query, num_results=5): search the web and return an answer summary with sources. Use for current facts, prices, places."
    }

    async fn invoke(&self, input: ToolInput) -> Result<Value, ToolError> {
        let query = input.text("query", 0)?;
        let num_results = input
            .get("num_results", 1)
            .and_then(Value::as_u64)
            .unwrap_or(5)
            .min(10) as u32;

        let api_key = std::env::var("TAVILY_API_KEY")
            .ok()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| ToolError::Unavailable("TAVILY_API_KEY is not set".to_string()))?;

        let request = TavilySearchRequest {
            api_key: &api_key,
            query: &query,
            max_results: num_results,
            include_answer: true,
        };

        let response = http_client(Duration::from_secs(30))?
            .post("https://api.tavily.com/search")
            .json(&request)
            .send()
            .await
            .map_err(|e| ToolError::Failed(format!("Tavily request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ToolError::Failed(format!("Tavily API error ({}): {}", status, body)));
        }

        let parsed: TavilySearchResponse = response
            .json()
            .await
            .map_err(|e| ToolError::Failed(format!("Invalid Tavily response: {}", e)))?;

        Ok(json!({
            "query": query,
            "answer": parsed.answer,
            "results": parsed
                .results
                .iter()
                .map(|r| json!({ "title": r.title, "url": r.url, "content": r.content }))
                .collect::<Vec<_>>(),
        }))
    }
}

/// Fetch the body of a URL as text.
pub struct FetchUrl;

#[async_trait]
impl Tool for FetchUrl {
    fn name(&self) -> &str {
        "fetch_url"
    }

    fn description(&self) -> &str {
        "fetch_url(url): download a web page or API response and return its text (truncated)."
    }

    async fn invoke(&self, input: ToolInput) -> Result<Value, ToolError> {
        let url = input.text("url", 0)?;
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ToolError::InvalidInput(format!("Not an http(s) URL: {}", url)));
        }

        let response = http_client(Duration::from_secs(30))?
            .get(&url)
            .send()
            .await
            .map_err(|e| ToolError::Failed(format!("Request to {} failed: {}", url, e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ToolError::Failed(format!("Reading {} failed: {}", url, e)))?;

        if !status.is_success() {
            return Err(ToolError::Failed(format!("{} returned HTTP {}", url, status)));
        }

        Ok(Value::String(truncate_chars(&body, MAX_FETCH_CHARS)))
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => format!("{}\n[truncated]", &text[..cut]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 10), "héllo");
        assert_eq!(truncate_chars("héllo", 2), "hé\n[truncated]");
    }

    #[tokio::test]
    async fn test_fetch_rejects_non_http_urls() {
        let mut input = ToolInput::new();
        input.push_positional(Value::String("file:///etc/hosts".into()));
        assert!(matches!(
            FetchUrl.invoke(input).await,
            Err(ToolError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_search_requires_query() {
        assert!(matches!(
            WebSearch.invoke(ToolInput::new()).await,
            Err(ToolError::InvalidInput(_))
        ));
    }
}
