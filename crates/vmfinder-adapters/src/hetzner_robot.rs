//! Hetzner dedicated servers from the Robot ordering webservice.
//!
//! Robot describes hardware as marketing prose, so specs come from
//! [`SpecSheet::from_description`] and may be partially unknown.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::Value as JsonValue;
use tracing::{info, warn};
use vmfinder_core::{instance_family_of, Provider, VmInstance};
use vmfinder_storage::HttpFetcher;

use crate::text_spec::SpecSheet;
use crate::{
    auth_failure_as_empty, decode_each, json_label, lenient_f64, retain_valid, AdapterContext,
    AdapterError, ProviderAdapter,
};

const DEFAULT_CURRENCY: &str = "EUR";
const FALLBACK_NAME: &str = "hetzner-bare-metal";

const UNAUTHORIZED_HINT: &str = "Hetzner Robot authentication failed (401). Use Robot webservice username/password, not Hetzner Cloud API token.";
const FORBIDDEN_HINT: &str = "Hetzner Robot access denied (403). Ensure Webservice 'Server ordering' API access is enabled in Robot settings.";

#[derive(Debug, Clone)]
pub struct HetznerRobotSettings {
    pub username: Option<String>,
    pub password: Option<String>,
    /// Also list auction servers from `/order/server_market/product`.
    pub include_server_market: bool,
    pub base_url: String,
}

impl Default for HetznerRobotSettings {
    fn default() -> Self {
        Self {
            username: None,
            password: None,
            include_server_market: true,
            base_url: "https://robot-ws.your-server.de".to_string(),
        }
    }
}

fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Deserialize)]
struct CurrencyBody {
    currency: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProductItem {
    #[serde(default)]
    product: Option<RobotProduct>,
}

/// A Robot product, either a standard catalog entry or a server market listing.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RobotProduct {
    #[serde(default)]
    pub id: Option<JsonValue>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub description: Vec<String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub prices: Vec<RobotPrice>,
    /// Market listings carry one flat price instead of `prices`.
    #[serde(default, deserialize_with = "lenient_f64")]
    pub price: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub price_hourly: Option<f64>,
    #[serde(default)]
    pub datacenter: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RobotPrice {
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub price: Option<NetPrice>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetPrice {
    #[serde(default, deserialize_with = "lenient_f64")]
    pub net: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub hourly_net: Option<f64>,
}

pub struct HetznerRobotAdapter {
    settings: HetznerRobotSettings,
    http: Arc<HttpFetcher>,
}

impl HetznerRobotAdapter {
    pub fn new(settings: HetznerRobotSettings, http: Arc<HttpFetcher>) -> Self {
        Self { settings, http }
    }

    async fn get<T: DeserializeOwned>(
        &self,
        ctx: &AdapterContext,
        username: &str,
        password: &str,
        path: &str,
    ) -> Result<Option<T>, AdapterError> {
        let url = format!("{}{}", self.settings.base_url.trim_end_matches('/'), path);
        let request = self.http.get(&url).basic_auth(username, Some(password));
        let result = self
            .http
            .send_json::<T>(ctx.run_id, Provider::HetznerBareMetal.slug(), request)
            .await;
        auth_failure_as_empty(
            Provider::HetznerBareMetal,
            result,
            UNAUTHORIZED_HINT,
            FORBIDDEN_HINT,
        )
    }
}

#[async_trait]
impl ProviderAdapter for HetznerRobotAdapter {
    fn provider(&self) -> Provider {
        Provider::HetznerBareMetal
    }

    async fn fetch_data(&self, ctx: &AdapterContext) -> Result<Vec<VmInstance>, AdapterError> {
        let (Some(username), Some(password)) = (
            self.settings.username.as_deref().filter(|s| !s.is_empty()),
            self.settings.password.as_deref().filter(|s| !s.is_empty()),
        ) else {
            warn!("Hetzner Robot credentials not configured. Skipping Hetzner Bare Metal refresh.");
            return Ok(Vec::new());
        };

        let Some(body) = self
            .get::<CurrencyBody>(ctx, username, password, "/order/currency")
            .await?
        else {
            return Ok(Vec::new());
        };
        let currency = body
            .currency
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| DEFAULT_CURRENCY.to_string());

        let mut paths = vec!["/order/server/product"];
        if self.settings.include_server_market {
            paths.push("/order/server_market/product");
        }

        let mut records = Vec::new();
        for path in paths {
            let Some(items) = self
                .get::<Vec<JsonValue>>(ctx, username, password, path)
                .await?
            else {
                return Ok(Vec::new());
            };
            let before = records.len();
            let products = decode_each::<ProductItem>(Provider::HetznerBareMetal, items)
                .into_iter()
                .filter_map(|item| item.product);
            for product in products {
                records.extend(records_from_product(&product, &currency, ctx.fetched_at));
            }
            info!(path, records = records.len() - before, "parsed Robot products");
        }

        Ok(retain_valid(Provider::HetznerBareMetal, records))
    }
}

/// One record per price entry, all sharing the specs parsed from the description.
///
/// A market listing without `prices` yields a single record from its flat
/// `price`/`price_hourly`/`datacenter` fields.
pub fn records_from_product(
    product: &RobotProduct,
    currency: &str,
    fetched_at: DateTime<Utc>,
) -> Vec<VmInstance> {
    let sheet = SpecSheet::from_description(&product.description);
    let id = product.id.as_ref().and_then(json_label);
    let instance_name = id
        .clone()
        .or_else(|| product.name.clone().filter(|n| !n.trim().is_empty()))
        .unwrap_or_else(|| FALLBACK_NAME.to_string());
    let instance_family = instance_family_of(id.as_deref().unwrap_or(""), "Dedicated");

    let record = |region: String, monthly: Option<f64>, hourly: Option<f64>| VmInstance {
        instance_name: instance_name.clone(),
        provider: Provider::HetznerBareMetal.display_name().to_string(),
        region,
        vcpus: sheet.vcpus,
        memory_gb: sheet.memory_gb,
        storage_gb: sheet.storage_gb,
        storage_type: sheet.storage_type.to_string(),
        hourly_cost: hourly,
        monthly_cost: monthly,
        spot_price: None,
        currency: currency.to_string(),
        instance_family: instance_family.clone(),
        network_performance: sheet.network_performance.clone(),
        last_updated: fetched_at,
    };

    if product.prices.is_empty() {
        return match product.price {
            Some(monthly) => vec![record(
                product
                    .datacenter
                    .clone()
                    .unwrap_or_else(|| "Unknown".to_string()),
                Some(monthly),
                product.price_hourly,
            )],
            None => Vec::new(),
        };
    }

    product
        .prices
        .iter()
        .map(|entry| {
            let price = entry.price.clone().unwrap_or_default();
            record(
                entry
                    .location
                    .clone()
                    .filter(|l| !l.is_empty())
                    .unwrap_or_else(|| "Unknown".to_string()),
                price.net,
                price.hourly_net,
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn fetched_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).single().unwrap()
    }

    #[test]
    fn description_and_prices_become_records() {
        let product: RobotProduct = serde_json::from_value(json!({
            "id": "AX41-NVMe",
            "name": "AX41-NVMe",
            "description": [
                "Intel Xeon",
                "4 x Core",
                "32 GB DDR4 RAM",
                "2 x 512 GB NVMe",
                "1 Gbit/s Connection"
            ],
            "prices": [
                {
                    "location": "FSN1",
                    "price": {"net": "39.0000", "gross": "46.4100", "hourly_net": "0.0700"}
                },
                {"location": "HEL1", "price": {"net": 39.0, "hourly_net": 0.07}}
            ]
        }))
        .unwrap();

        let records = records_from_product(&product, "EUR", fetched_at());
        assert_eq!(records.len(), 2);
        let rec = &records[0];
        assert_eq!(rec.instance_name, "AX41-NVMe");
        assert_eq!(rec.provider, "Hetzner Bare Metal");
        assert_eq!(rec.region, "FSN1");
        assert_eq!(rec.vcpus, 4);
        assert_eq!(rec.memory_gb, Some(32.0));
        assert_eq!(rec.storage_gb, 1024);
        assert_eq!(rec.storage_type, "NVMe");
        assert!(rec.network_performance.as_deref().unwrap().contains("Gbit"));
        assert_eq!(rec.monthly_cost, Some(39.0));
        assert_eq!(rec.hourly_cost, Some(0.07));
        assert_eq!(rec.instance_family, "AX");
        assert_eq!(records[1].region, "HEL1");
    }

    #[test]
    fn market_listing_uses_flat_price() {
        let product: RobotProduct = serde_json::from_value(json!({
            "id": 2184345,
            "name": "SB36",
            "description": ["Intel Core i7-6700", "2x RAM 16384 MB DDR4", "2x HDD SATA 3,0 TB"],
            "price": "38.6555",
            "price_hourly": "0.0620",
            "datacenter": "FSN1-DC8"
        }))
        .unwrap();

        let records = records_from_product(&product, "EUR", fetched_at());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].instance_name, "2184345");
        assert_eq!(records[0].instance_family, "Dedicated");
        assert_eq!(records[0].region, "FSN1-DC8");
        assert_eq!(records[0].monthly_cost, Some(38.6555));
        assert_eq!(records[0].hourly_cost, Some(0.062));
        assert_eq!(records[0].storage_type, "HDD");
        assert_eq!(records[0].memory_gb, None);
    }

    #[test]
    fn sparse_product_degrades_gracefully() {
        let product: RobotProduct = serde_json::from_value(json!({
            "description": null,
            "prices": [{"price": {}}]
        }))
        .unwrap();

        let records = records_from_product(&product, "EUR", fetched_at());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].instance_name, "hetzner-bare-metal");
        assert_eq!(records[0].region, "Unknown");
        assert_eq!(records[0].vcpus, 0);
        assert_eq!(records[0].storage_type, "Unknown");
        assert_eq!(records[0].monthly_cost, None);
        assert_eq!(records[0].network_performance, None);
    }

    #[test]
    fn product_without_any_price_yields_nothing() {
        let product = RobotProduct {
            name: Some("EX44".into()),
            ..RobotProduct::default()
        };
        assert!(records_from_product(&product, "EUR", fetched_at()).is_empty());
    }

    #[test]
    fn server_market_is_on_by_default() {
        assert!(HetznerRobotSettings::default().include_server_market);
    }
}
