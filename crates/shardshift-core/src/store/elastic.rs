//! Elasticsearch REST client.
//!
//! Wraps reqwest with:
//! - Base URL handling and basic auth
//! - `wait_for_completion=false` dispatch for every mutating call
//! - Retries with backoff for idempotent metadata reads
//!
//! Response parsing lives in free functions so it can be tested without a
//! cluster.

use super::types::{
    ByQueryOptions, ByQueryResponse, ReindexRequest, SearchHit, SearchResponse, TaskHandle,
    TaskStatus,
};
use super::DocumentStore;
use crate::config::{ElasticConfig, StoreDefaults};
use crate::error::{MigrationError, Result};
use crate::retry::{retry_async, BackoffPolicy};
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// HTTP client for a single Elasticsearch cluster.
pub struct ElasticClient {
    client: Client,
    base_url: Url,
    username: Option<String>,
    password: Option<String>,
    timeout: Duration,
    retry: BackoffPolicy,
}

impl ElasticClient {
    pub fn new(config: &ElasticConfig) -> Result<Self> {
        let base_url = Url::parse(&config.url).map_err(|e| MigrationError::Config {
            message: format!("Invalid Elasticsearch URL {}: {}", config.url, e),
        })?;
        if base_url.cannot_be_a_base() {
            return Err(MigrationError::Config {
                message: format!("Elasticsearch URL cannot be a base: {}", config.url),
            });
        }

        let timeout = config.request_timeout();
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(StoreDefaults::USER_AGENT)
            .build()
            .map_err(|e| MigrationError::Network {
                message: format!("Failed to create HTTP client: {}", e),
                source: Some(e),
            })?;

        let retry = BackoffPolicy::new()
            .with_max_attempts(StoreDefaults::METADATA_RETRY_ATTEMPTS)
            .with_base_delay(StoreDefaults::METADATA_RETRY_BASE_DELAY);

        Ok(Self {
            client,
            base_url,
            username: config.username.clone(),
            password: config.password.clone(),
            timeout,
            retry,
        })
    }

    /// Override the retry policy for metadata reads.
    pub fn with_retry_policy(mut self, policy: BackoffPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, segments: &[&str], query: &[(&str, String)]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| MigrationError::Config {
                message: format!("Elasticsearch URL cannot be a base: {}", self.base_url),
            })?
            .pop_if_empty()
            .extend(segments);

        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        body: Option<&Value>,
    ) -> Result<(StatusCode, Value)> {
        debug!("{} {}", method, url.path());

        let mut request = self.client.request(method.clone(), url.clone());
        if let Some(username) = &self.username {
            request = request.basic_auth(username, self.password.as_ref());
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                MigrationError::Timeout(self.timeout)
            } else {
                MigrationError::Network {
                    message: format!("{} {} failed: {}", method, url.path(), e),
                    source: Some(e),
                }
            }
        })?;

        let status = response.status();
        let text = response.text().await?;
        let value = if text.trim().is_empty() {
            Value::Null
        } else {
            match serde_json::from_str(&text) {
                Ok(value) => value,
                Err(_) => Value::String(text),
            }
        };
        Ok((status, value))
    }

    async fn call(&self, method: Method, url: Url, body: Option<&Value>) -> Result<Value> {
        let (status, value) = self.send(method, url, body).await?;
        if status.is_success() {
            Ok(value)
        } else {
            Err(MigrationError::store(status.as_u16(), error_message(&value)))
        }
    }

    /// Idempotent request, retried on transient failures.
    async fn read(&self, method: Method, url: Url, body: Option<&Value>) -> Result<Value> {
        let label = format!("{} {}", method, url.path());
        retry_async(
            &self.retry,
            &label,
            || self.call(method.clone(), url.clone(), body),
            MigrationError::is_retryable,
        )
        .await
    }

    async fn by_query(
        &self,
        endpoint: &str,
        index: &str,
        body: &Value,
        options: &ByQueryOptions,
    ) -> Result<ByQueryResponse> {
        let url = self.endpoint(&[index, endpoint], &by_query_params(options))?;
        let value = self.call(Method::POST, url, Some(body)).await?;
        parse_by_query(&value)
    }
}

#[async_trait]
impl DocumentStore for ElasticClient {
    async fn search(&self, index: &str, body: &Value) -> Result<SearchResponse> {
        let url = self.endpoint(&[index, "_search"], &[])?;
        let value = self.read(Method::POST, url, Some(body)).await?;
        parse_search(&value)
    }

    async fn count(&self, index: &str, body: &Value) -> Result<u64> {
        let url = self.endpoint(&[index, "_count"], &[])?;
        let value = self.read(Method::POST, url, Some(body)).await?;
        parse_count(&value)
    }

    async fn update_by_query(
        &self,
        index: &str,
        body: &Value,
        options: &ByQueryOptions,
    ) -> Result<ByQueryResponse> {
        self.by_query("_update_by_query", index, body, options).await
    }

    async fn delete_by_query(
        &self,
        index: &str,
        body: &Value,
        options: &ByQueryOptions,
    ) -> Result<ByQueryResponse> {
        self.by_query("_delete_by_query", index, body, options).await
    }

    async fn reindex(&self, request: &ReindexRequest) -> Result<TaskHandle> {
        let url = self.endpoint(
            &["_reindex"],
            &[
                ("wait_for_completion", "false".to_string()),
                ("timeout", StoreDefaults::TASK_TIMEOUT.to_string()),
            ],
        )?;
        let value = self.call(Method::POST, url, Some(&request.body())).await?;
        match parse_by_query(&value)? {
            ByQueryResponse {
                task: Some(task), ..
            } => Ok(task),
            ByQueryResponse { failures, .. } => Err(MigrationError::DocumentStore {
                message: format!("Reindex rejected: {}", Value::Array(failures)),
                status: None,
            }),
        }
    }

    async fn task_status(&self, task: &TaskHandle) -> Result<TaskStatus> {
        let url = self.endpoint(&["_tasks", task.as_str()], &[])?;
        let label = format!("GET _tasks/{}", task);
        let (status, value) = retry_async(
            &self.retry,
            &label,
            || self.send(Method::GET, url.clone(), None),
            MigrationError::is_retryable,
        )
        .await?;

        if status == StatusCode::NOT_FOUND {
            return Err(MigrationError::TaskNotFound {
                task_id: task.to_string(),
            });
        }
        // Rejected lookups (e.g. malformed ids) still carry a parseable error body.
        if status.is_success() || value.get("error").is_some() {
            return Ok(serde_json::from_value(value)?);
        }
        Err(MigrationError::store(status.as_u16(), error_message(&value)))
    }

    async fn refresh_index(&self, index: &str) -> Result<()> {
        let url = self.endpoint(&[index, "_refresh"], &[])?;
        self.read(Method::POST, url, None).await?;
        Ok(())
    }

    async fn index_size_bytes(&self, index: &str) -> Result<u64> {
        let url = self.endpoint(&[index, "_stats", "store"], &[])?;
        let value = self.read(Method::GET, url, None).await?;
        parse_index_size(&value)
    }

    async fn cluster_free_size_bytes(&self) -> Result<u64> {
        let url = self.endpoint(&["_cluster", "stats"], &[])?;
        let value = self.read(Method::GET, url, None).await?;
        parse_free_bytes(&value)
    }

    async fn create_index(&self, index: &str, body: &Value) -> Result<()> {
        let url = self.endpoint(&[index], &[])?;
        self.call(Method::PUT, url, Some(body)).await?;
        Ok(())
    }

    async fn index_exists(&self, index: &str) -> Result<bool> {
        let url = self.endpoint(&[index], &[])?;
        let label = format!("HEAD {}", index);
        let (status, value) = retry_async(
            &self.retry,
            &label,
            || self.send(Method::HEAD, url.clone(), None),
            MigrationError::is_retryable,
        )
        .await?;

        match status {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            s => Err(MigrationError::store(s.as_u16(), error_message(&value))),
        }
    }

    async fn number_of_shards(&self, index: &str) -> Result<u32> {
        let url = self.endpoint(&[index, "_settings", "index.number_of_shards"], &[])?;
        let value = self.read(Method::GET, url, None).await?;
        parse_number_of_shards(&value)
    }
}

fn by_query_params(options: &ByQueryOptions) -> Vec<(&'static str, String)> {
    let mut params = vec![
        ("wait_for_completion", "false".to_string()),
        ("conflicts", options.conflicts.as_str().to_string()),
    ];
    if let Some(max_docs) = options.max_docs {
        params.push(("max_docs", max_docs.to_string()));
    }
    if let Some(timeout) = &options.timeout {
        params.push(("timeout", timeout.clone()));
    }
    if let Some(routing) = &options.routing {
        params.push(("routing", routing.clone()));
    }
    if let Some(slices) = options.slices {
        params.push(("slices", slices.to_string()));
    }
    params
}

fn malformed(what: &str, value: &Value) -> MigrationError {
    MigrationError::DocumentStore {
        message: format!("Malformed {} response: {}", what, value),
        status: None,
    }
}

fn error_message(value: &Value) -> String {
    match value.get("error") {
        Some(error) => error
            .get("reason")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string()),
        None => match value {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        },
    }
}

fn parse_search(value: &Value) -> Result<SearchResponse> {
    let hits = value.get("hits").ok_or_else(|| malformed("search", value))?;

    // `hits.total` is an object since 7.x, a bare number before that.
    let total = match hits.get("total") {
        Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
        Some(total) => total.get("value").and_then(Value::as_u64).unwrap_or(0),
        None => 0,
    };

    let hits = hits
        .get("hits")
        .and_then(Value::as_array)
        .map(|hits| {
            hits.iter()
                .map(|hit| SearchHit {
                    id: hit
                        .get("_id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    source: hit.get("_source").cloned().unwrap_or(Value::Null),
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(SearchResponse {
        total,
        hits,
        aggregations: value.get("aggregations").cloned(),
    })
}

fn parse_count(value: &Value) -> Result<u64> {
    value
        .get("count")
        .and_then(Value::as_u64)
        .ok_or_else(|| malformed("count", value))
}

fn parse_by_query(value: &Value) -> Result<ByQueryResponse> {
    if let Some(task) = value.get("task").and_then(Value::as_str) {
        return Ok(ByQueryResponse::started(task));
    }
    match value.get("failures").and_then(Value::as_array) {
        Some(failures) if !failures.is_empty() => Ok(ByQueryResponse::failed(failures.clone())),
        _ => Err(malformed("by-query", value)),
    }
}

fn parse_index_size(value: &Value) -> Result<u64> {
    value
        .pointer("/_all/total/store/size_in_bytes")
        .and_then(Value::as_u64)
        .ok_or_else(|| malformed("index stats", value))
}

fn parse_free_bytes(value: &Value) -> Result<u64> {
    value
        .pointer("/nodes/fs/free_in_bytes")
        .and_then(Value::as_u64)
        .ok_or_else(|| malformed("cluster stats", value))
}

fn parse_number_of_shards(value: &Value) -> Result<u32> {
    // Keyed by concrete index name, which differs from the alias we asked for.
    value
        .as_object()
        .and_then(|indices| indices.values().next())
        .and_then(|index| index.pointer("/settings/index/number_of_shards"))
        .and_then(|shards| match shards {
            Value::String(s) => s.parse().ok(),
            Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
            _ => None,
        })
        .ok_or_else(|| malformed("index settings", value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Conflicts;
    use serde_json::json;

    fn client(url: &str) -> ElasticClient {
        ElasticClient::new(&ElasticConfig {
            url: url.to_string(),
            ..ElasticConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_rejects_invalid_url() {
        let result = ElasticClient::new(&ElasticConfig {
            url: "not a url".into(),
            ..ElasticConfig::default()
        });
        assert!(matches!(result, Err(MigrationError::Config { .. })));
    }

    #[test]
    fn test_endpoint_joins_segments_and_query() {
        let client = client("http://es.internal:9200/");
        let url = client
            .endpoint(
                &["gitlab-production", "_update_by_query"],
                &by_query_params(&ByQueryOptions::new().with_max_docs(500)),
            )
            .unwrap();
        assert_eq!(url.path(), "/gitlab-production/_update_by_query");
        let query = url.query().unwrap();
        assert!(query.contains("wait_for_completion=false"));
        assert!(query.contains("conflicts=proceed"));
        assert!(query.contains("max_docs=500"));
        assert!(query.contains("timeout=5m"));
    }

    #[test]
    fn test_endpoint_keeps_base_path() {
        let client = client("https://proxy.example.com/elastic");
        let url = client.endpoint(&["_tasks", "abc:1"], &[]).unwrap();
        assert_eq!(url.path(), "/elastic/_tasks/abc:1");
    }

    #[test]
    fn test_by_query_params_optional_fields() {
        let mut options = ByQueryOptions::new()
            .with_routing("project_42")
            .with_slices(5);
        options.conflicts = Conflicts::Abort;
        options.timeout = None;

        let params = by_query_params(&options);
        assert!(params.contains(&("routing", "project_42".to_string())));
        assert!(params.contains(&("slices", "5".to_string())));
        assert!(params.contains(&("conflicts", "abort".to_string())));
        assert!(!params.iter().any(|(k, _)| *k == "timeout"));
    }

    #[test]
    fn test_parse_search_total_formats() {
        let modern = json!({
            "hits": {
                "total": { "value": 2, "relation": "eq" },
                "hits": [
                    { "_id": "project_1", "_source": { "id": 1 } },
                    { "_id": "project_2", "_source": { "id": 2 } }
                ]
            },
            "aggregations": { "project_ids": { "buckets": [] } }
        });
        let response = parse_search(&modern).unwrap();
        assert_eq!(response.total, 2);
        assert_eq!(response.hits[1].id, "project_2");
        assert!(response.aggregations.is_some());

        let legacy = json!({ "hits": { "total": 9, "hits": [] } });
        assert_eq!(parse_search(&legacy).unwrap().total, 9);

        assert!(parse_search(&json!({})).is_err());
    }

    #[test]
    fn test_parse_count() {
        assert_eq!(parse_count(&json!({ "count": 12 })).unwrap(), 12);
        assert!(parse_count(&json!({ "error": "x" })).is_err());
    }

    #[test]
    fn test_parse_by_query() {
        let started = parse_by_query(&json!({ "task": "oTUltX4IQMOUUVeiohTt8A:124" })).unwrap();
        assert_eq!(started.task.unwrap().as_str(), "oTUltX4IQMOUUVeiohTt8A:124");

        let failed = parse_by_query(&json!({ "failures": ["failed"] })).unwrap();
        assert!(failed.task.is_none());
        assert_eq!(failed.failures, vec![json!("failed")]);

        assert!(parse_by_query(&json!({ "failures": [] })).is_err());
    }

    #[test]
    fn test_parse_sizes() {
        let stats = json!({ "_all": { "total": { "store": { "size_in_bytes": 1024 } } } });
        assert_eq!(parse_index_size(&stats).unwrap(), 1024);

        let cluster = json!({ "nodes": { "fs": { "free_in_bytes": 4096 } } });
        assert_eq!(parse_free_bytes(&cluster).unwrap(), 4096);
    }

    #[test]
    fn test_parse_number_of_shards() {
        let settings = json!({
            "gitlab-production-20230101": {
                "settings": { "index": { "number_of_shards": "5" } }
            }
        });
        assert_eq!(parse_number_of_shards(&settings).unwrap(), 5);
        assert!(parse_number_of_shards(&json!({})).is_err());
    }

    #[test]
    fn test_error_message_prefers_reason() {
        let body = json!({ "error": { "reason": "index_not_found_exception", "type": "x" } });
        assert_eq!(error_message(&body), "index_not_found_exception");
        assert_eq!(error_message(&json!("plain text")), "plain text");
    }
}
