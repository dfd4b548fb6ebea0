//! Upstream HTTP access and the provider-keyed dataset store for VM Finder.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

mod dataset;
mod postgres;

pub use dataset::{
    DatasetStore, JsonFileDatasetStore, MemoryDatasetStore, ProviderFreshness, StoreError,
};
pub use postgres::PgDatasetStore;

pub const CRATE_NAME: &str = "vmfinder-storage";

/// How an unsuccessful upstream status should be reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Unauthorized,
    Forbidden,
    Throttled,
    UpstreamFailure,
    ClientFailure,
}

pub fn classify_status(status: StatusCode) -> StatusClass {
    match status {
        StatusCode::UNAUTHORIZED => StatusClass::Unauthorized,
        StatusCode::FORBIDDEN => StatusClass::Forbidden,
        StatusCode::TOO_MANY_REQUESTS => StatusClass::Throttled,
        s if s.is_server_error() => StatusClass::UpstreamFailure,
        _ => StatusClass::ClientFailure,
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_provider_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            global_concurrency: 16,
            per_provider_concurrency: 2,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("request limiter closed")]
    LimiterClosed,
}

impl FetchError {
    pub fn status_class(&self) -> Option<StatusClass> {
        match self {
            FetchError::HttpStatus { status, .. } => {
                StatusCode::from_u16(*status).ok().map(classify_status)
            }
            _ => None,
        }
    }
}

/// Shared reqwest client with global and per-provider concurrency limits.
///
/// No retries happen here: the next scheduled refresh is the retry.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_provider_limit: usize,
    per_provider: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_provider_limit: config.per_provider_concurrency.max(1),
            per_provider: Mutex::new(HashMap::new()),
        })
    }

    pub fn get(&self, url: &str) -> RequestBuilder {
        self.client.get(url)
    }

    pub fn post(&self, url: &str) -> RequestBuilder {
        self.client.post(url)
    }

    async fn per_provider_semaphore(&self, provider: &str) -> Arc<Semaphore> {
        let mut map = self.per_provider.lock().await;
        map.entry(provider.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_provider_limit)))
            .clone()
    }

    /// Sends `request` and decodes a successful JSON body.
    pub async fn send_json<T: DeserializeOwned>(
        &self,
        run_id: Uuid,
        provider: &str,
        request: RequestBuilder,
    ) -> Result<T, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::LimiterClosed)?;
        let per_provider = self.per_provider_semaphore(provider).await;
        let _provider = per_provider
            .acquire()
            .await
            .map_err(|_| FetchError::LimiterClosed)?;

        let request = request.build()?;
        let url = request.url().to_string();
        let span = info_span!("http_fetch", %run_id, provider, url = %url);

        async move {
            let resp = self.client.execute(request).await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp.bytes().await?;
            debug!(bytes = body.len(), "upstream response received");
            serde_json::from_slice(&body).map_err(|source| FetchError::Decode {
                url: final_url,
                source,
            })
        }
        .instrument(span)
        .await
    }
}
