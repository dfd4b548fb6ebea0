mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use vmfinder_adapters::{HetznerRobotAdapter, HetznerRobotSettings, ProviderAdapter};

#[derive(Clone, Default)]
struct Hits {
    market: Arc<AtomicUsize>,
    authorized: Arc<AtomicUsize>,
}

fn settings(base_url: String, include_server_market: bool) -> HetznerRobotSettings {
    HetznerRobotSettings {
        username: Some("#ws+robot".into()),
        password: Some("secret".into()),
        include_server_market,
        base_url,
    }
}

fn catalog_router(hits: Hits) -> Router {
    async fn currency(State(hits): State<Hits>, headers: HeaderMap) -> Json<Value> {
        let basic = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("Basic "));
        if basic {
            hits.authorized.fetch_add(1, Ordering::SeqCst);
        }
        Json(json!({"currency": "EUR"}))
    }

    async fn standard() -> Json<Value> {
        Json(json!([{
            "product": {
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
                    {"location": "FSN1", "price": {"net": 39.0, "hourly_net": 0.07}}
                ]
            }
        }]))
    }

    async fn market(State(hits): State<Hits>) -> Json<Value> {
        hits.market.fetch_add(1, Ordering::SeqCst);
        Json(json!([{
            "product": {
                "id": 2184345,
                "name": "SB36",
                "description": ["Intel Core i7-6700", "2x HDD SATA 3,0 TB"],
                "price": "38.6555",
                "price_hourly": "0.0620",
                "datacenter": "FSN1-DC8"
            }
        }]))
    }

    Router::new()
        .route("/order/currency", get(currency))
        .route("/order/server/product", get(standard))
        .route("/order/server_market/product", get(market))
        .with_state(hits)
}

#[tokio::test]
async fn standard_product_is_parsed_end_to_end() {
    let hits = Hits::default();
    let base = common::serve(catalog_router(hits.clone())).await;
    let adapter = HetznerRobotAdapter::new(settings(base, false), common::http());

    let records = adapter
        .fetch_data(&common::ctx())
        .await
        .expect("robot fetch");

    assert_eq!(records.len(), 1);
    let rec = &records[0];
    assert_eq!(rec.instance_name, "AX41-NVMe");
    assert_eq!(rec.vcpus, 4);
    assert_eq!(rec.memory_gb, Some(32.0));
    assert_eq!(rec.storage_gb, 1024);
    assert_eq!(rec.storage_type, "NVMe");
    assert!(rec
        .network_performance
        .as_deref()
        .is_some_and(|n| n.contains("Gbit")));
    assert_eq!(rec.region, "FSN1");
    assert_eq!(rec.monthly_cost, Some(39.0));
    assert_eq!(rec.hourly_cost, Some(0.07));
    assert_eq!(rec.currency, "EUR");
    assert_eq!(hits.authorized.load(Ordering::SeqCst), 1);
    assert_eq!(hits.market.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn server_market_is_included_when_enabled() {
    let hits = Hits::default();
    let base = common::serve(catalog_router(hits.clone())).await;
    let adapter = HetznerRobotAdapter::new(settings(base, true), common::http());

    let records = adapter
        .fetch_data(&common::ctx())
        .await
        .expect("robot fetch");

    assert_eq!(records.len(), 2);
    assert_eq!(hits.market.load(Ordering::SeqCst), 1);
    assert!(records
        .iter()
        .any(|r| r.instance_name == "2184345" && r.region == "FSN1-DC8"));
}

#[tokio::test]
async fn repeated_fetches_agree_apart_from_timestamps() {
    let base = common::serve(catalog_router(Hits::default())).await;
    let adapter = HetznerRobotAdapter::new(settings(base, true), common::http());

    let first = adapter.fetch_data(&common::ctx()).await.expect("first fetch");
    let second = adapter.fetch_data(&common::ctx()).await.expect("second fetch");

    let strip = |records: &[vmfinder_core::VmInstance]| {
        records
            .iter()
            .map(|r| r.without_timestamp())
            .collect::<Vec<_>>()
    };
    assert_eq!(strip(&first), strip(&second));
}

#[tokio::test]
async fn malformed_product_is_dropped_without_failing_the_listing() {
    async fn listing() -> Json<Value> {
        Json(json!([
            {
                "product": {
                    "id": "AX41",
                    "description": ["4 x Core", "64 GB DDR4 RAM", "2 x 512 GB NVMe"],
                    "prices": [{"location": "FSN1", "price": {"net": "39.0000"}}]
                }
            },
            {
                "product": {
                    "id": "AX52",
                    "description": ["8 x Core", 64],
                    "prices": [{"location": "FSN1", "price": {"net": "59.0000"}}]
                }
            }
        ]))
    }

    let router = Router::new()
        .route("/order/currency", get(|| async { Json(json!({"currency": "EUR"})) }))
        .route("/order/server/product", get(listing));
    let base = common::serve(router).await;
    let adapter = HetznerRobotAdapter::new(settings(base, false), common::http());

    let records = adapter
        .fetch_data(&common::ctx())
        .await
        .expect("one bad product does not fail the cycle");

    assert_eq!(records.len(), 1);
    assert_eq!(records[0].instance_name, "AX41");
    assert_eq!(records[0].vcpus, 4);
    assert_eq!(records[0].monthly_cost, Some(39.0));
}

#[tokio::test]
async fn unauthorized_yields_empty_result() {
    let router =
        Router::new().route("/order/currency", get(|| async { StatusCode::UNAUTHORIZED }));
    let base = common::serve(router).await;
    let adapter = HetznerRobotAdapter::new(settings(base, true), common::http());

    let records = adapter
        .fetch_data(&common::ctx())
        .await
        .expect("401 is not an error");
    assert!(records.is_empty());
}

#[tokio::test]
async fn forbidden_product_listing_yields_empty_result() {
    let router = Router::new()
        .route("/order/currency", get(|| async { Json(json!({"currency": "EUR"})) }))
        .route("/order/server/product", get(|| async { StatusCode::FORBIDDEN }));
    let base = common::serve(router).await;
    let adapter = HetznerRobotAdapter::new(settings(base, true), common::http());

    let records = adapter
        .fetch_data(&common::ctx())
        .await
        .expect("403 is not an error");
    assert!(records.is_empty());
}

#[tokio::test]
async fn server_errors_surface_as_adapter_errors() {
    let router = Router::new().route(
        "/order/currency",
        get(|| async { StatusCode::INTERNAL_SERVER_ERROR }),
    );
    let base = common::serve(router).await;
    let adapter = HetznerRobotAdapter::new(settings(base, true), common::http());

    assert!(adapter.fetch_data(&common::ctx()).await.is_err());
}

#[tokio::test]
async fn missing_credentials_skip_the_network() {
    let adapter = HetznerRobotAdapter::new(
        HetznerRobotSettings {
            base_url: "http://127.0.0.1:9".into(),
            ..HetznerRobotSettings::default()
        },
        common::http(),
    );

    let records = adapter
        .fetch_data(&common::ctx())
        .await
        .expect("missing credentials are not an error");
    assert!(records.is_empty());
}
