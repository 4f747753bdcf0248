//! REST client for the hosted finance backend.
//!
//! Tables are served PostgREST style under `/rest/v1/{table}` and filtered by
//! owner; the bulk sync job is an edge function at `/functions/v1/sync`.
//! `RestClient` implements the cache's collaborator traits for [`EntityData`].

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{header, Client, RequestBuilder, Url};
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::ApiError;
use crate::cache::{CacheKey, EntityType, Fetcher, MutationIntent, OwnerId, ReconcileResult, Reconciler, RemoteWriter};
use crate::models::EntityData;

// ============================================================================
// Constants
// ============================================================================

/// HTTP request timeout in seconds.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// Upsert on primary key and echo the stored rows back.
const PREFER_UPSERT: &str = "resolution=merge-duplicates,return=representation";

/// Client for the finance backend.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct RestClient {
    client: Client,
    base: Url,
    api_key: String,
    token: Option<String>,
}

impl RestClient {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self> {
        let base = Url::parse(base_url).with_context(|| format!("Invalid backend URL {}", base_url))?;
        if base.cannot_be_a_base() {
            anyhow::bail!("Backend URL {} cannot be used as a base", base_url);
        }

        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::HeaderName::from_static("apikey"),
            header::HeaderValue::from_str(api_key).context("API key is not a valid header value")?,
        );
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            base,
            api_key: api_key.to_string(),
            token: None,
        })
    }

    /// Same connection pool, authenticated as a signed-in user.
    pub fn with_token(&self, token: String) -> Self {
        Self {
            client: self.client.clone(),
            base: self.base.clone(),
            api_key: self.api_key.clone(),
            token: Some(token),
        }
    }

    fn bearer(&self) -> &str {
        self.token.as_deref().unwrap_or(&self.api_key)
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        // Infallible: cannot-be-a-base URLs are rejected in new()
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    /// Rows of `key`: the owner's collection, or one record for item keys.
    pub fn table_url(&self, key: &CacheKey) -> Url {
        let mut url = self.endpoint(&["rest", "v1", key.entity().as_str()]);
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("user_id", &format!("eq.{}", key.owner()));
            if let Some(id) = key.params() {
                query.append_pair("id", &format!("eq.{}", id));
            }
        }
        url
    }

    pub fn sync_url(&self) -> Url {
        self.endpoint(&["functions", "v1", "sync"])
    }

    /// Returns Ok(Some(response)) for success, Ok(None) for rate limit
    /// (should retry), or Err for other errors.
    async fn check_response_for_retry(response: reqwest::Response) -> Result<Option<reqwest::Response>, ApiError> {
        if response.status().is_success() {
            Ok(Some(response))
        } else if response.status().as_u16() == 429 {
            Ok(None)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    fn transport_error(e: reqwest::Error) -> ApiError {
        if e.is_timeout() {
            ApiError::Timeout(REQUEST_TIMEOUT_SECS)
        } else {
            ApiError::NetworkError(e)
        }
    }

    /// Send the request built by `build`, retrying 429s with exponential backoff.
    async fn send<F>(&self, build: F) -> Result<reqwest::Response, ApiError>
    where
        F: Fn() -> RequestBuilder + Send + Sync,
    {
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let response = build()
                .bearer_auth(self.bearer())
                .send()
                .await
                .map_err(Self::transport_error)?;

            match Self::check_response_for_retry(response).await? {
                Some(response) => return Ok(response),
                None => {
                    retries += 1;
                    if retries > MAX_RATE_LIMIT_RETRIES {
                        return Err(ApiError::RateLimited);
                    }
                    warn!(retry = retries, backoff_ms = backoff_ms, "Rate limited, backing off");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms *= 2; // Exponential backoff
                }
            }
        }
    }

    async fn json(response: reqwest::Response) -> Result<Value, ApiError> {
        response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse JSON: {}", e)))
    }
}

/// Operation names starting with these verbs delete instead of upsert.
fn is_delete(operation: &str) -> bool {
    operation.starts_with("delete") || operation.starts_with("remove")
}

/// Parse the sync job's answer: an object keyed by entity name.
/// Unknown names are skipped.
pub fn parse_sync_response(owner: &OwnerId, body: Value) -> Result<ReconcileResult<EntityData>, ApiError> {
    let Value::Object(collections) = body else {
        return Err(ApiError::InvalidResponse("sync result is not an object".to_string()));
    };
    let mut result = ReconcileResult::new(owner.clone());
    for (name, rows) in collections {
        match EntityType::from_name(&name) {
            Some(entity) => result = result.with(entity, EntityData::from_rows(entity, rows)?),
            None => warn!(entity = %name, "Ignoring unknown entity in sync result"),
        }
    }
    Ok(result)
}

// ===== Collaborator implementations =====

#[async_trait]
impl Fetcher<EntityData> for RestClient {
    async fn fetch(&self, key: &CacheKey) -> Result<EntityData, ApiError> {
        let url = self.table_url(key);
        debug!(key = %key, "Fetching rows");
        let response = self.send(|| self.client.get(url.clone())).await?;
        EntityData::from_rows(key.entity(), Self::json(response).await?)
    }
}

#[async_trait]
impl RemoteWriter<EntityData> for RestClient {
    async fn write(&self, intent: &MutationIntent<EntityData>) -> Result<Option<EntityData>, ApiError> {
        let key = &intent.key;
        if key.entity() == EntityType::Totals {
            return Err(ApiError::Rejected("totals are derived and cannot be written".to_string()));
        }

        if is_delete(&intent.operation) {
            if key.params().is_none() {
                return Err(ApiError::Rejected(format!("refusing to delete every {} row", key.entity())));
            }
            let url = self.table_url(key);
            self.send(|| self.client.delete(url.clone())).await?;
            return Ok(None);
        }

        let rows = intent
            .optimistic
            .to_rows()
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to encode rows: {}", e)))?;
        let url = self.endpoint(&["rest", "v1", key.entity().as_str()]);
        let response = self
            .send(|| {
                self.client
                    .post(url.clone())
                    .header("Prefer", PREFER_UPSERT)
                    .json(&rows)
            })
            .await?;
        EntityData::from_rows(key.entity(), Self::json(response).await?).map(Some)
    }
}

#[async_trait]
impl Reconciler<EntityData> for RestClient {
    async fn run(&self, owner: &OwnerId) -> Result<ReconcileResult<EntityData>, ApiError> {
        let url = self.sync_url();
        let body = json!({ "user_id": owner });
        let response = self.send(|| self.client.post(url.clone()).json(&body)).await?;
        parse_sync_response(owner, Self::json(response).await?)
    }
}
