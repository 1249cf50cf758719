use reqwest::Client;
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue};
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::config::FeedConfig;
use crate::error::FetchError;

const GITHUB_JSON_ACCEPT: &str = "application/vnd.github+json";
const USER_AGENT: &str = concat!("tag-upgrade-trigger/", env!("CARGO_PKG_VERSION"));

/// Client for the remote tag listing (`GET /repos/{owner}/{repo}/tags`).
pub struct ReleaseFeed {
    client: Client,
    config: FeedConfig,
}

impl ReleaseFeed {
    pub fn new(config: FeedConfig) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(USER_AGENT)
            .default_headers(feed_headers())
            .build()
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        Ok(Self { client, config })
    }

    pub fn is_configured(&self) -> bool {
        self.config.repo.is_some() || self.config.mock.is_some()
    }

    pub fn tags_url(&self) -> Result<Url, FetchError> {
        let repo = self.config.repo.as_deref().ok_or(FetchError::NotConfigured)?;
        let mut url = Url::parse(&format!("{}/repos/{}/tags", self.config.api_base, repo))
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("per_page", &self.config.per_page.to_string());
        Ok(url)
    }

    /// Tag names in the order the remote returned them.
    pub async fn fetch_tags(&self) -> Result<Vec<String>, FetchError> {
        if let Some(raw) = self.config.mock.as_deref() {
            debug!("release feed served from mock");
            return parse_mock(raw);
        }

        let url = self.tags_url()?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::BadStatus(status.as_u16()));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| FetchError::Malformed(e.to_string()))?;
        extract_tag_names(&body)
    }
}

/// Pull `name` out of every object in the array. Entries without a string
/// `name` are skipped; a non-array payload is malformed.
pub fn extract_tag_names(body: &Value) -> Result<Vec<String>, FetchError> {
    let entries = body
        .as_array()
        .ok_or_else(|| FetchError::Malformed("expected a JSON array".to_string()))?;
    Ok(entries
        .iter()
        .filter_map(|entry| entry.get("name").and_then(Value::as_str))
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect())
}

fn parse_mock(raw: &str) -> Result<Vec<String>, FetchError> {
    let value: Value =
        serde_json::from_str(raw).map_err(|e| FetchError::Malformed(e.to_string()))?;
    if let Some(code) = value.get("error").and_then(Value::as_str) {
        return Err(match code.trim() {
            "timeout" => FetchError::Timeout,
            "transport" => FetchError::Transport("mock transport failure".to_string()),
            "not-configured" => FetchError::NotConfigured,
            other => match other.strip_prefix("status-").and_then(|s| s.parse::<u16>().ok()) {
                Some(status) => FetchError::BadStatus(status),
                None => FetchError::Malformed(format!("mock error {other}")),
            },
        });
    }
    extract_tag_names(&value)
}

fn map_reqwest_error(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        return FetchError::Timeout;
    }
    FetchError::Transport(err.to_string())
}

fn feed_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static(GITHUB_JSON_ACCEPT));
    headers
}
