//! Provider adapter contract and the per-provider adapters for VM Finder.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, error};
use uuid::Uuid;
use vmfinder_core::{Provider, VmInstance};
use vmfinder_storage::{FetchError, HttpFetcher, StatusClass};

pub mod aws;
pub mod hetzner_cloud;
pub mod hetzner_robot;
pub mod text_spec;

pub use aws::{AwsPriceListAdapter, AwsSettings};
pub use hetzner_cloud::{HetznerCloudAdapter, HetznerCloudSettings};
pub use hetzner_robot::{HetznerRobotAdapter, HetznerRobotSettings};

pub const CRATE_NAME: &str = "vmfinder-adapters";

/// Per-cycle context handed to an adapter by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdapterContext {
    pub run_id: Uuid,
    /// Stamped onto every record as `last_updated`.
    pub fetched_at: DateTime<Utc>,
}

impl AdapterContext {
    pub fn now() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            fetched_at: Utc::now(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("AWS price list request failed: {0}")]
    Aws(String),
}

/// One vendor's fetch-and-normalize step.
///
/// Missing credentials and upstream 401/403 are reported as `Ok(vec![])` after
/// logging. `Err` is reserved for failures the orchestrator should log as errors;
/// neither outcome commits anything.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn provider(&self) -> Provider;

    fn name(&self) -> &'static str {
        self.provider().display_name()
    }

    async fn fetch_data(&self, ctx: &AdapterContext) -> Result<Vec<VmInstance>, AdapterError>;
}

/// Credentials and endpoints for every adapter, read once at construction.
#[derive(Debug, Clone, Default)]
pub struct AdapterSettings {
    pub aws: AwsSettings,
    pub hetzner_cloud: HetznerCloudSettings,
    pub hetzner_robot: HetznerRobotSettings,
}

pub fn adapter_for_provider(
    provider: Provider,
    settings: &AdapterSettings,
    http: Arc<HttpFetcher>,
) -> Option<Box<dyn ProviderAdapter>> {
    match provider {
        Provider::Aws => Some(Box::new(AwsPriceListAdapter::new(settings.aws.clone()))),
        Provider::HetznerCloud => Some(Box::new(HetznerCloudAdapter::new(
            settings.hetzner_cloud.clone(),
            http,
        ))),
        Provider::HetznerBareMetal => Some(Box::new(HetznerRobotAdapter::new(
            settings.hetzner_robot.clone(),
            http,
        ))),
        _ => None,
    }
}

/// Providers with an adapter in this crate.
pub fn supported_providers() -> [Provider; 3] {
    [Provider::Aws, Provider::HetznerCloud, Provider::HetznerBareMetal]
}

/// Treats 401/403 as terminal for this cycle: logs `hint` and yields `None`.
/// Every other failure is passed through.
pub(crate) fn auth_failure_as_empty<T>(
    provider: Provider,
    result: Result<T, FetchError>,
    unauthorized_hint: &str,
    forbidden_hint: &str,
) -> Result<Option<T>, AdapterError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err) => {
            if log_auth_failure(provider, err.status_class(), unauthorized_hint, forbidden_hint) {
                Ok(None)
            } else {
                Err(err.into())
            }
        }
    }
}

/// Logs the matching hint for 401/403 and reports whether `class` was one of them.
pub(crate) fn log_auth_failure(
    provider: Provider,
    class: Option<StatusClass>,
    unauthorized_hint: &str,
    forbidden_hint: &str,
) -> bool {
    match class {
        Some(StatusClass::Unauthorized) => {
            error!(provider = %provider, "{unauthorized_hint}");
            true
        }
        Some(StatusClass::Forbidden) => {
            error!(provider = %provider, "{forbidden_hint}");
            true
        }
        _ => false,
    }
}

/// Keeps records that satisfy the record invariants and logs the rest.
pub(crate) fn retain_valid(provider: Provider, records: Vec<VmInstance>) -> Vec<VmInstance> {
    records
        .into_iter()
        .filter(|rec| match rec.validate() {
            Ok(()) => true,
            Err(err) => {
                debug!(
                    provider = %provider,
                    instance = %rec.instance_name,
                    error = %err,
                    "dropping invalid record"
                );
                false
            }
        })
        .collect()
}

/// Decodes a vendor listing entry by entry; an entry that does not decode is
/// logged and dropped without failing the rest.
pub(crate) fn decode_each<T: DeserializeOwned>(
    provider: Provider,
    items: Vec<JsonValue>,
) -> Vec<T> {
    items
        .into_iter()
        .filter_map(|item| match serde_json::from_value::<T>(item) {
            Ok(decoded) => Some(decoded),
            Err(err) => {
                debug!(provider = %provider, error = %err, "skipping undecodable listing entry");
                None
            }
        })
        .collect()
}

/// Accepts `"0.0060000000"`, `0.006` or `null`. Vendors send decimals as strings.
pub(crate) fn lenient_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(json_number))
}

pub(crate) fn json_number(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().replace(',', "").parse().ok(),
        _ => None,
    }
}

/// Renders an id that may arrive as a number or a string.
pub(crate) fn json_label(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
