//! EC2 on-demand pricing from the AWS Price List Query API.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use aws_config::retry::RetryConfig;
use aws_config::timeout::TimeoutConfig;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_pricing::config::Region;
use aws_sdk_pricing::error::DisplayErrorContext;
use aws_sdk_pricing::types::{Filter, FilterType};
use aws_sdk_pricing::Client;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Map as JsonMap, Value as JsonValue};
use tracing::{debug, info, warn};
use vmfinder_core::{instance_family_of, Provider, VmInstance, DEFAULT_CURRENCY, HOURS_PER_MONTH};
use vmfinder_storage::classify_status;

use crate::{log_auth_failure, retain_valid, AdapterContext, AdapterError, ProviderAdapter};

const SERVICE_CODE: &str = "AmazonEC2";
const FORMAT_VERSION: &str = "aws_v1";
const CREDENTIALS_SOURCE: &str = "vmfinder_static";

const UNAUTHORIZED_HINT: &str =
    "AWS price list authentication failed (401). Check AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY.";
const FORBIDDEN_HINT: &str =
    "AWS price list access denied (403). The credentials need the pricing:GetProducts permission.";

#[derive(Debug, Clone)]
pub struct AwsSettings {
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub session_token: Option<String>,
    /// The price list API is served from a handful of regions only.
    pub pricing_region: String,
    /// Overrides the regional endpoint the SDK would resolve.
    pub endpoint: Option<String>,
    pub page_size: i32,
    /// Upper bound for one `GetProducts` call.
    pub timeout: Duration,
}

impl Default for AwsSettings {
    fn default() -> Self {
        Self {
            access_key_id: None,
            secret_access_key: None,
            session_token: None,
            pricing_region: "us-east-1".to_string(),
            endpoint: None,
            page_size: 100,
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PriceListProduct {
    product: ProductBody,
    #[serde(default)]
    terms: ProductTerms,
}

#[derive(Debug, Deserialize)]
struct ProductBody {
    #[serde(default)]
    attributes: HashMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
struct ProductTerms {
    #[serde(rename = "OnDemand", default)]
    on_demand: JsonMap<String, JsonValue>,
}

const FILTERS: [(&str, &str); 4] = [
    ("operatingSystem", "Linux"),
    ("tenancy", "Shared"),
    ("preInstalledSw", "NA"),
    ("capacitystatus", "Used"),
];

/// Walks the paginated EC2 product catalog, one record per priced product.
pub struct AwsPriceListAdapter {
    settings: AwsSettings,
}

impl AwsPriceListAdapter {
    pub fn new(settings: AwsSettings) -> Self {
        Self { settings }
    }

    async fn client(&self, access_key_id: &str, secret_access_key: &str) -> Client {
        let credentials = Credentials::new(
            access_key_id,
            secret_access_key,
            self.settings.session_token.clone(),
            None,
            CREDENTIALS_SOURCE,
        );

        // A failed cycle waits for the next scheduled fire instead of retrying.
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(self.settings.pricing_region.clone()))
            .credentials_provider(credentials)
            .retry_config(RetryConfig::disabled())
            .timeout_config(
                TimeoutConfig::builder()
                    .operation_attempt_timeout(self.settings.timeout)
                    .build(),
            );
        if let Some(endpoint) = self.settings.endpoint.as_deref() {
            loader = loader.endpoint_url(endpoint);
        }

        Client::new(&loader.load().await)
    }
}

fn catalog_filters() -> Result<Vec<Filter>, AdapterError> {
    FILTERS
        .iter()
        .map(|&(field, value)| {
            Filter::builder()
                .r#type(FilterType::TermMatch)
                .field(field)
                .value(value)
                .build()
                .map_err(|err| AdapterError::Aws(format!("building {field} filter: {err}")))
        })
        .collect()
}

#[async_trait]
impl ProviderAdapter for AwsPriceListAdapter {
    fn provider(&self) -> Provider {
        Provider::Aws
    }

    async fn fetch_data(&self, ctx: &AdapterContext) -> Result<Vec<VmInstance>, AdapterError> {
        let (Some(access_key_id), Some(secret_access_key)) = (
            self.settings.access_key_id.as_deref().filter(|s| !s.is_empty()),
            self.settings.secret_access_key.as_deref().filter(|s| !s.is_empty()),
        ) else {
            warn!("AWS credentials not configured. Skipping AWS refresh.");
            return Ok(Vec::new());
        };

        let client = self.client(access_key_id, secret_access_key).await;
        let mut pages = client
            .get_products()
            .service_code(SERVICE_CODE)
            .format_version(FORMAT_VERSION)
            .max_results(self.settings.page_size)
            .set_filters(Some(catalog_filters()?))
            .into_paginator()
            .send();

        let mut instances = Vec::new();
        let mut page_count = 0usize;
        while let Some(page) = pages.next().await {
            let page = match page {
                Ok(page) => page,
                Err(err) => {
                    let class = err
                        .raw_response()
                        .and_then(|raw| StatusCode::from_u16(raw.status().as_u16()).ok())
                        .map(classify_status);
                    if log_auth_failure(Provider::Aws, class, UNAUTHORIZED_HINT, FORBIDDEN_HINT) {
                        return Ok(Vec::new());
                    }
                    return Err(AdapterError::Aws(DisplayErrorContext(&err).to_string()));
                }
            };
            page_count += 1;
            debug!(
                run_id = %ctx.run_id,
                page = page_count,
                entries = page.price_list().len(),
                "received AWS price list page"
            );
            instances.extend(records_from_price_list(page.price_list(), ctx.fetched_at));
        }

        info!(pages = page_count, records = instances.len(), "walked AWS price list");
        Ok(retain_valid(Provider::Aws, instances))
    }
}

/// Normalizes one page of price list entries; malformed entries are skipped.
pub fn records_from_price_list(
    price_list: &[String],
    fetched_at: DateTime<Utc>,
) -> Vec<VmInstance> {
    price_list
        .iter()
        .filter_map(|raw| match serde_json::from_str::<PriceListProduct>(raw) {
            Ok(product) => record_from_product(&product, fetched_at),
            Err(err) => {
                debug!(error = %err, "skipping undecodable price list entry");
                None
            }
        })
        .collect()
}

/// First price dimension of the first on-demand offer, in USD per hour.
///
/// Tiered dimensions beyond the first are ignored.
fn first_usd_unit_price(terms: &ProductTerms) -> Option<f64> {
    let offer = terms.on_demand.values().next()?;
    let dimension = offer.get("priceDimensions")?.as_object()?.values().next()?;
    let usd = dimension.get("pricePerUnit")?.get("USD")?.as_str()?;
    usd.trim().parse::<f64>().ok().filter(|p| *p > 0.0)
}

fn record_from_product(
    product: &PriceListProduct,
    fetched_at: DateTime<Utc>,
) -> Option<VmInstance> {
    let hourly = first_usd_unit_price(&product.terms)?;
    let attrs = &product.product.attributes;

    let instance_name = attrs.get("instanceType")?.trim().to_string();
    let region = attrs.get("location")?.trim().to_string();
    let vcpus = attrs.get("vcpu")?.trim().parse::<u32>().ok()?;
    let memory_gb = parse_memory_attribute(attrs.get("memory")?)?;
    let storage = attrs.get("storage").map(String::as_str).unwrap_or("EBS only");

    Some(VmInstance {
        instance_family: attrs
            .get("instanceFamily")
            .filter(|f| !f.trim().is_empty())
            .cloned()
            .unwrap_or_else(|| instance_family_of(&instance_name, "General")),
        instance_name,
        provider: Provider::Aws.display_name().to_string(),
        region,
        vcpus,
        memory_gb: Some(memory_gb),
        storage_gb: parse_storage_attribute(storage),
        storage_type: storage.to_string(),
        hourly_cost: Some(hourly),
        monthly_cost: Some(hourly * HOURS_PER_MONTH),
        spot_price: None,
        currency: DEFAULT_CURRENCY.to_string(),
        network_performance: attrs.get("networkPerformance").cloned(),
        last_updated: fetched_at,
    })
}

/// `"16 GiB"` -> 16.0; also tolerates thousands separators.
fn parse_memory_attribute(raw: &str) -> Option<f64> {
    raw.trim()
        .trim_end_matches("GiB")
        .trim()
        .replace(',', "")
        .parse()
        .ok()
}

/// `"2 x 1900 NVMe SSD"` -> 3800. EBS-only instances have no local storage.
fn parse_storage_attribute(raw: &str) -> u64 {
    if raw.contains("EBS") {
        return 0;
    }
    let numbers: Vec<f64> = raw
        .split_whitespace()
        .filter_map(|token| token.replace(',', "").parse::<f64>().ok())
        .collect();
    let has_multiplier = raw
        .split_whitespace()
        .any(|token| token.eq_ignore_ascii_case("x"));
    match numbers.as_slice() {
        [count, size, ..] if has_multiplier => (count * size) as u64,
        [size, ..] => *size as u64,
        [] => 0,
    }
}
