#![allow(dead_code)]

use std::sync::Arc;

use axum::Router;
use vmfinder_adapters::AdapterContext;
use vmfinder_storage::{HttpClientConfig, HttpFetcher};

/// Serves `router` on an ephemeral local port and returns its base URL.
pub async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind fake upstream");
    let addr = listener.local_addr().expect("fake upstream addr");
    tokio::spawn(async move {
        axum::serve(listener, router)
            .await
            .expect("fake upstream exited");
    });
    format!("http://{addr}")
}

pub fn http() -> Arc<HttpFetcher> {
    Arc::new(HttpFetcher::new(HttpClientConfig::default()).expect("http client"))
}

pub fn ctx() -> AdapterContext {
    AdapterContext::now()
}
