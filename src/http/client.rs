use governor::{DefaultDirectRateLimiter, Jitter, Quota, RateLimiter};
use reqwest::{Method, RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::api::errors::{error_message, ApiError, ApiResult};
use crate::api::wire::CONTENT_TYPE;
use crate::observability::ApiMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub requests_per_second: u32,
    pub burst_capacity: u32,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            requests_per_second: 10,
            burst_capacity: 30,
        }
    }
}

/// Rate-limited, authenticated HTTP client for the remote service API
#[derive(Debug)]
pub struct RateLimitedHttpClient {
    http: reqwest::Client,
    rate_limiter: Arc<DefaultDirectRateLimiter>,
    base_url: Url,
    token: String,
    metrics: Arc<ApiMetrics>,
}

impl RateLimitedHttpClient {
    /// Create a new client for the API rooted at `base_url`
    pub fn new(
        base_url: Url,
        token: String,
        rate: RateLimit,
        timeout: Duration,
        metrics: Arc<ApiMetrics>,
    ) -> ApiResult<Self> {
        let per_second = NonZeroU32::new(rate.requests_per_second).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(rate.burst_capacity).unwrap_or(per_second);
        let quota = Quota::per_second(per_second).allow_burst(burst);
        let rate_limiter = Arc::new(RateLimiter::direct(quota));

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("remote-runs/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ApiError::transport(e.to_string()))?;

        // Url::join drops the last segment unless the base ends with '/'
        let base_url = if base_url.path().ends_with('/') {
            base_url
        } else {
            let mut with_slash = base_url;
            let path = format!("{}/", with_slash.path());
            with_slash.set_path(&path);
            with_slash
        };

        Ok(Self {
            http,
            rate_limiter,
            base_url,
            token,
            metrics,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn metrics(&self) -> &Arc<ApiMetrics> {
        &self.metrics
    }

    pub fn url(&self, path: &str) -> ApiResult<Url> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| ApiError::Rejected {
                status: 0,
                message: format!("invalid request path {path}: {e}"),
            })
    }

    pub fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.http
            .request(method, url)
            .bearer_auth(&self.token)
            .header(reqwest::header::CONTENT_TYPE, CONTENT_TYPE)
    }

    /// Send a request with rate limiting and map error statuses to [`ApiError`]
    pub async fn send(&self, resource: &str, request: RequestBuilder) -> ApiResult<Response> {
        self.rate_limiter
            .until_ready_with_jitter(Jitter::up_to(Duration::from_millis(50)))
            .await;
        self.metrics.record_request();

        debug!(resource, "Executing remote API request");

        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => {
                self.metrics.record_error();
                return Err(ApiError::from(err));
            }
        };

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        self.metrics.record_error();
        let body = response.text().await.unwrap_or_default();
        Err(ApiError::from_status(
            status.as_u16(),
            resource,
            error_message(&body),
        ))
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        resource: &str,
        path: &str,
        query: &[(&str, String)],
    ) -> ApiResult<T> {
        let url = self.url(path)?;
        let response = self
            .send(resource, self.request(Method::GET, url).query(query))
            .await?;
        decode(response).await
    }

    pub async fn post_json<T: DeserializeOwned>(
        &self,
        resource: &str,
        path: &str,
        body: &Value,
    ) -> ApiResult<T> {
        let url = self.url(path)?;
        let response = self
            .send(resource, self.request(Method::POST, url).json(body))
            .await?;
        decode(response).await
    }

    /// POST an action endpoint whose response body is irrelevant
    pub async fn post_action(&self, resource: &str, path: &str, body: &Value) -> ApiResult<()> {
        let url = self.url(path)?;
        self.send(resource, self.request(Method::POST, url).json(body))
            .await?;
        Ok(())
    }

    /// PUT raw bytes to an absolute URL (archivist-style upload endpoints)
    pub async fn put_bytes(&self, resource: &str, url: &str, body: Vec<u8>) -> ApiResult<()> {
        let url = Url::parse(url).map_err(|e| ApiError::Decode {
            message: format!("invalid upload url {url}: {e}"),
        })?;
        let request = self
            .http
            .put(url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(body);
        self.send(resource, request).await?;
        Ok(())
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> ApiResult<T> {
    let bytes = response.bytes().await.map_err(ApiError::from)?;
    Ok(serde_json::from_slice(&bytes)?)
}
