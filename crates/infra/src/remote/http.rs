//! HTTP adapter for a GitHub-style paginated REST API.
//!
//! `GET {base}/repos/{owner}/{name}/{collection}?per_page=N&page=P`
//!
//! Cursors are page numbers. Every response, successful or not, feeds the
//! `x-ratelimit-*` headers to the [`RateLimitGovernor`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, LINK, RETRY_AFTER, USER_AGENT};
use serde_json::Value;
use tracing::debug;

use super::{Cursor, Page, PageRequest, RemoteItem, RemoteSource};
use crate::resilience::{RateLimitGovernor, RemoteError};

const RATE_LIMIT_LIMIT: &str = "x-ratelimit-limit";
const RATE_LIMIT_REMAINING: &str = "x-ratelimit-remaining";
const RATE_LIMIT_RESET: &str = "x-ratelimit-reset";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRemoteConfig {
    pub base_url: String,
    pub token: Option<String>,
    /// Collection read under each repository (`events`, `issues`, ...).
    pub collection: String,
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for HttpRemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.github.com".to_string(),
            token: None,
            collection: "events".to_string(),
            timeout: Duration::from_secs(30),
            user_agent: "hybridcap-orchestrator".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpRemoteSource {
    client: reqwest::Client,
    config: HttpRemoteConfig,
    governor: Arc<RateLimitGovernor>,
}

impl HttpRemoteSource {
    pub fn new(
        config: HttpRemoteConfig,
        governor: Arc<RateLimitGovernor>,
    ) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| RemoteError::Network(format!("failed to build http client: {e}")))?;
        Ok(Self {
            client,
            config,
            governor,
        })
    }

    fn url(&self, resource_name: &str) -> String {
        format!(
            "{}/repos/{}/{}",
            self.config.base_url.trim_end_matches('/'),
            resource_name.trim_matches('/'),
            self.config.collection
        )
    }

    fn record_rate_limit(&self, headers: &HeaderMap) {
        if let Some((limit, remaining, reset_at)) = parse_rate_limit(headers) {
            self.governor.record_headers(limit, remaining, reset_at);
        }
    }
}

#[async_trait]
impl RemoteSource for HttpRemoteSource {
    async fn fetch_page(&self, request: &PageRequest) -> Result<Page, RemoteError> {
        let page = match &request.cursor {
            Some(cursor) => page_number(cursor)?,
            None => 1,
        };

        let mut builder = self
            .client
            .get(self.url(&request.resource_name))
            .header(ACCEPT, "application/vnd.github+json")
            .header(USER_AGENT, &self.config.user_agent)
            .query(&[("per_page", request.per_page), ("page", page)]);
        if let Some(token) = &self.config.token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
        }

        let response = builder
            .send()
            .await
            .map_err(|e| RemoteError::Network(e.to_string()))?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        self.record_rate_limit(&headers);

        if !response.status().is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(classify_status(
                status,
                header_u64(&headers, RATE_LIMIT_REMAINING),
                header_u64(&headers, RETRY_AFTER.as_str()).map(Duration::from_secs),
                message,
            ));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| RemoteError::Network(e.to_string()))?;
        let value: Value =
            serde_json::from_slice(&body).map_err(|e| RemoteError::Decode(e.to_string()))?;
        let items = parse_items(value)?;

        let next_cursor = match headers.get(LINK).and_then(|v| v.to_str().ok()) {
            Some(link) => next_page_from_link(link),
            None if !items.is_empty() && items.len() >= request.per_page as usize => Some(page + 1),
            None => None,
        }
        .map(|p| Cursor::new(p.to_string()));

        debug!(
            resource_id = %request.resource_id,
            page,
            items = items.len(),
            has_next = next_cursor.is_some(),
            "fetched remote page"
        );
        Ok(Page { items, next_cursor })
    }
}

fn page_number(cursor: &Cursor) -> Result<u32, RemoteError> {
    cursor
        .as_str()
        .parse::<u32>()
        .ok()
        .filter(|p| *p >= 1)
        .ok_or_else(|| RemoteError::Decode(format!("invalid page cursor '{cursor}'")))
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers.get(name)?.to_str().ok()?.trim().parse().ok()
}

/// `(limit, remaining, reset_at)` when all three rate-limit headers are present.
pub fn parse_rate_limit(headers: &HeaderMap) -> Option<(u64, u64, DateTime<Utc>)> {
    let limit = header_u64(headers, RATE_LIMIT_LIMIT)?;
    let remaining = header_u64(headers, RATE_LIMIT_REMAINING)?;
    let reset = header_u64(headers, RATE_LIMIT_RESET)?;
    let reset_at = DateTime::<Utc>::from_timestamp(i64::try_from(reset).ok()?, 0)?;
    Some((limit, remaining, reset_at))
}

/// Map a non-success status to a [`RemoteError`].
///
/// GitHub reports primary quota exhaustion as 403 with
/// `x-ratelimit-remaining: 0`; that is rate limiting, not a client error.
pub fn classify_status(
    status: u16,
    remaining: Option<u64>,
    retry_after: Option<Duration>,
    message: impl Into<String>,
) -> RemoteError {
    match status {
        429 => RemoteError::RateLimited {
            status,
            retry_after,
        },
        403 if remaining == Some(0) || retry_after.is_some() => RemoteError::RateLimited {
            status,
            retry_after,
        },
        _ => RemoteError::from_status(status, message),
    }
}

/// Page number of the `rel="next"` entry of a `Link` header.
pub fn next_page_from_link(link: &str) -> Option<u32> {
    link.split(',').find_map(|part| {
        let mut sections = part.split(';');
        let target = sections.next()?.trim();
        if !sections.any(|s| s.trim() == r#"rel="next""#) {
            return None;
        }
        let url = target.trim_start_matches('<').trim_end_matches('>');
        let query = url.split_once('?')?.1;
        query.split('&').find_map(|pair| match pair.split_once('=') {
            Some(("page", value)) => value.parse().ok(),
            _ => None,
        })
    })
}

/// Items of a JSON array body.
pub fn parse_items(body: Value) -> Result<Vec<RemoteItem>, RemoteError> {
    match body {
        Value::Array(values) => values.into_iter().map(RemoteItem::from_json).collect(),
        other => Err(RemoteError::Decode(format!(
            "expected a JSON array, got {}",
            match other {
                Value::Object(_) => "an object",
                Value::Null => "null",
                _ => "a scalar",
            }
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;
    use serde_json::json;

    #[test]
    fn rate_limit_headers_parse() {
        let mut headers = HeaderMap::new();
        headers.insert(RATE_LIMIT_LIMIT, HeaderValue::from_static("5000"));
        headers.insert(RATE_LIMIT_REMAINING, HeaderValue::from_static("0"));
        headers.insert(RATE_LIMIT_RESET, HeaderValue::from_static("1700000000"));

        let (limit, remaining, reset_at) = parse_rate_limit(&headers).unwrap();
        assert_eq!(limit, 5000);
        assert_eq!(remaining, 0);
        assert_eq!(reset_at.timestamp(), 1_700_000_000);

        headers.remove(RATE_LIMIT_RESET);
        assert!(parse_rate_limit(&headers).is_none());
    }

    #[test]
    fn forbidden_with_exhausted_quota_is_rate_limited() {
        assert!(classify_status(403, Some(0), None, "").is_rate_limited());
        assert!(classify_status(403, None, Some(Duration::from_secs(60)), "").is_rate_limited());
        assert!(matches!(
            classify_status(403, Some(10), None, "forbidden"),
            RemoteError::Client { status: 403, .. }
        ));
        assert_eq!(
            classify_status(429, Some(3), Some(Duration::from_secs(5)), ""),
            RemoteError::RateLimited {
                status: 429,
                retry_after: Some(Duration::from_secs(5))
            }
        );
        assert!(matches!(
            classify_status(410, None, None, "gone"),
            RemoteError::Gone { .. }
        ));
        assert!(classify_status(502, None, None, "").is_retryable());
    }

    #[test]
    fn link_header_next_page() {
        let link = r#"<https://api.github.com/repositories/1/events?per_page=100&page=3>; rel="next", <https://api.github.com/repositories/1/events?per_page=100&page=10>; rel="last""#;
        assert_eq!(next_page_from_link(link), Some(3));

        let last_page = r#"<https://api.github.com/repositories/1/events?page=1>; rel="first", <https://api.github.com/repositories/1/events?page=9>; rel="prev""#;
        assert_eq!(next_page_from_link(last_page), None);
    }

    #[test]
    fn body_must_be_an_array_of_items() {
        let items = parse_items(json!([{"id": "1"}, {"id": 2}])).unwrap();
        assert_eq!(items.len(), 2);
        assert!(matches!(
            parse_items(json!({"message": "Not Found"})),
            Err(RemoteError::Decode(_))
        ));
    }

    #[test]
    fn cursor_is_a_positive_page_number() {
        assert_eq!(page_number(&Cursor::new("4")).unwrap(), 4);
        assert!(page_number(&Cursor::new("0")).is_err());
        assert!(page_number(&Cursor::new("abc")).is_err());
    }

    #[test]
    fn url_joins_base_name_and_collection() {
        let clock = std::sync::Arc::new(hybridcap_core::SystemClock);
        let source = HttpRemoteSource::new(
            HttpRemoteConfig {
                base_url: "https://api.example.com/".into(),
                ..HttpRemoteConfig::default()
            },
            Arc::new(RateLimitGovernor::new(clock)),
        )
        .unwrap();
        assert_eq!(
            source.url("octo/hello"),
            "https://api.example.com/repos/octo/hello/events"
        );
    }
}
