//! Hetzner Cloud server types and per-location prices from the Cloud REST API.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{info, warn};
use vmfinder_core::{instance_family_of, Provider, VmInstance};
use vmfinder_storage::HttpFetcher;

use crate::{
    auth_failure_as_empty, decode_each, lenient_f64, retain_valid, AdapterContext, AdapterError,
    ProviderAdapter,
};

const PER_PAGE: u32 = 50;
const DEFAULT_CURRENCY: &str = "EUR";

#[derive(Debug, Clone)]
pub struct HetznerCloudSettings {
    pub api_token: Option<String>,
    pub base_url: String,
}

impl Default for HetznerCloudSettings {
    fn default() -> Self {
        Self {
            api_token: None,
            base_url: "https://api.hetzner.cloud/v1".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ServerTypesPage {
    /// Decoded one by one into [`ServerType`].
    #[serde(default)]
    server_types: Vec<JsonValue>,
    #[serde(default)]
    meta: PageMeta,
}

#[derive(Debug, Default, Deserialize)]
struct PageMeta {
    #[serde(default)]
    pagination: Pagination,
}

#[derive(Debug, Default, Deserialize)]
struct Pagination {
    next_page: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerType {
    pub name: Option<String>,
    #[serde(default)]
    pub cores: Option<u32>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub memory: Option<f64>,
    #[serde(default)]
    pub disk: Option<u64>,
    pub storage_type: Option<String>,
    pub cpu_type: Option<String>,
    pub architecture: Option<String>,
    #[serde(default)]
    pub prices: Vec<LocationPrice>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocationPrice {
    pub location: Option<String>,
    #[serde(default)]
    pub price_hourly: Amount,
    #[serde(default)]
    pub price_monthly: Amount,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Amount {
    #[serde(default, deserialize_with = "lenient_f64")]
    pub net: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct PricingEnvelope {
    #[serde(default)]
    pricing: PricingBody,
}

#[derive(Debug, Default, Deserialize)]
struct PricingBody {
    currency: Option<String>,
}

/// Pages through `/server_types` and emits one record per type per location.
pub struct HetznerCloudAdapter {
    settings: HetznerCloudSettings,
    http: Arc<HttpFetcher>,
}

impl HetznerCloudAdapter {
    pub fn new(settings: HetznerCloudSettings, http: Arc<HttpFetcher>) -> Self {
        Self { settings, http }
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        ctx: &AdapterContext,
        token: &str,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Option<T>, AdapterError> {
        let url = format!("{}{}", self.settings.base_url.trim_end_matches('/'), path);
        let request = self
            .http
            .get(&url)
            .query(query)
            .bearer_auth(token)
            .header("content-type", "application/json");
        let result = self
            .http
            .send_json::<T>(ctx.run_id, Provider::HetznerCloud.slug(), request)
            .await;
        auth_failure_as_empty(
            Provider::HetznerCloud,
            result,
            "Hetzner Cloud authentication failed (401). Check HETZNER_CLOUD_API_TOKEN.",
            "Hetzner Cloud access denied (403). The API token needs read access to the project.",
        )
    }
}

#[async_trait]
impl ProviderAdapter for HetznerCloudAdapter {
    fn provider(&self) -> Provider {
        Provider::HetznerCloud
    }

    async fn fetch_data(&self, ctx: &AdapterContext) -> Result<Vec<VmInstance>, AdapterError> {
        let Some(token) = self.settings.api_token.as_deref().filter(|t| !t.is_empty()) else {
            warn!("Hetzner Cloud API token not configured. Skipping Hetzner Cloud refresh.");
            return Ok(Vec::new());
        };

        let mut server_types = Vec::new();
        let mut page = 1u32;
        loop {
            let query = [("page", page.to_string()), ("per_page", PER_PAGE.to_string())];
            let Some(body) = self
                .get::<ServerTypesPage>(ctx, token, "/server_types", &query)
                .await?
            else {
                return Ok(Vec::new());
            };
            server_types.extend(decode_each::<ServerType>(
                Provider::HetznerCloud,
                body.server_types,
            ));
            match body.meta.pagination.next_page {
                Some(next) if next > page => page = next,
                _ => break,
            }
        }

        let Some(pricing) = self.get::<PricingEnvelope>(ctx, token, "/pricing", &[]).await? else {
            return Ok(Vec::new());
        };
        let currency = pricing
            .pricing
            .currency
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| DEFAULT_CURRENCY.to_string());

        let records = records_from_server_types(&server_types, &currency, ctx.fetched_at);
        info!(
            server_types = server_types.len(),
            records = records.len(),
            %currency,
            "fetched Hetzner Cloud catalog"
        );
        Ok(retain_valid(Provider::HetznerCloud, records))
    }
}

/// One record per server type and location price; the batch shares `currency`.
pub fn records_from_server_types(
    server_types: &[ServerType],
    currency: &str,
    fetched_at: DateTime<Utc>,
) -> Vec<VmInstance> {
    server_types
        .iter()
        .flat_map(|item| {
            let name = item.name.clone().unwrap_or_else(|| "unknown".to_string());
            item.prices.iter().map(move |price| VmInstance {
                instance_name: name.clone(),
                provider: Provider::HetznerCloud.display_name().to_string(),
                region: price
                    .location
                    .clone()
                    .unwrap_or_else(|| "unknown".to_string()),
                vcpus: item.cores.unwrap_or(0),
                memory_gb: item.memory,
                storage_gb: item.disk.unwrap_or(0),
                storage_type: item
                    .storage_type
                    .as_deref()
                    .unwrap_or("unknown")
                    .to_uppercase(),
                hourly_cost: price.price_hourly.net,
                monthly_cost: price.price_monthly.net,
                spot_price: None,
                currency: currency.to_string(),
                instance_family: instance_family_of(&name, "General"),
                network_performance: Some(format!(
                    "{} / {}",
                    item.cpu_type.as_deref().unwrap_or("shared"),
                    item.architecture.as_deref().unwrap_or("unknown")
                )),
                last_updated: fetched_at,
            })
        })
        .collect()
}
