//! Aggregator integration tests - real providers against stub HTTP upstreams

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::{
    Json, Router,
    extract::Path,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};

use fin_hub::Error;
use fin_hub::aggregator::{Aggregator, Operation, providers::build_providers};
use fin_hub::config::{AggregatorConfig, ProviderConfig};
use fin_hub::context::RequestContext;

async fn serve(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn chart_json(symbol: &str, price: f64) -> Value {
    json!({
        "chart": {
            "result": [{
                "meta": {
                    "symbol": symbol,
                    "currency": "USD",
                    "regularMarketPrice": price,
                    "chartPreviousClose": price - 1.0,
                },
                "timestamp": [1_700_000_000],
                "indicators": {"quote": [{"close": [price]}]}
            }],
            "error": null
        }
    })
}

fn aggregator_config(
    yahoo: Option<SocketAddr>,
    stooq: Option<SocketAddr>,
) -> AggregatorConfig {
    let mut config = AggregatorConfig::default();
    config
        .provider_order
        .insert("quote".to_string(), vec!["yahoo".to_string(), "stooq".to_string()]);
    if let Some(addr) = yahoo {
        config.providers.insert(
            "yahoo".to_string(),
            ProviderConfig {
                base_url: Some(format!("http://{addr}")),
                ..ProviderConfig::default()
            },
        );
    }
    if let Some(addr) = stooq {
        config.providers.insert(
            "stooq".to_string(),
            ProviderConfig {
                base_url: Some(format!("http://{addr}")),
                ..ProviderConfig::default()
            },
        );
    }
    config
}

fn ctx() -> RequestContext {
    RequestContext::new(Duration::from_secs(5))
}

#[tokio::test]
async fn quote_served_by_primary_provider() {
    let yahoo = serve(Router::new().route(
        "/v8/finance/chart/{symbol}",
        get(|Path(symbol): Path<String>| async move { Json(chart_json(&symbol, 42.5)) }),
    ))
    .await;

    let config = aggregator_config(Some(yahoo), None);
    let agg = Arc::new(Aggregator::new(&config, build_providers(&config)));

    let out = agg
        .request(Operation::Quote, json!({"symbol": "AAPL"}), &ctx())
        .await
        .unwrap();
    assert_eq!(out["data"]["symbol"], "AAPL");
    assert_eq!(out["data"]["price"], 42.5);
    assert_eq!(out["metadata"]["source"], "yahoo");
    assert_eq!(out["metadata"]["fallbackChain"], json!(["yahoo"]));
}

#[tokio::test]
async fn failing_primary_falls_back_to_stooq_csv() {
    // Yahoo is down hard; stooq answers CSV.
    let yahoo = serve(Router::new().route(
        "/v8/finance/chart/{symbol}",
        get(|| async { StatusCode::BAD_GATEWAY.into_response() }),
    ))
    .await;
    let stooq = serve(Router::new().route(
        "/q/l/",
        get(|| async {
            "Symbol,Date,Time,Open,High,Low,Close,Volume\n\
             AAPL.US,2024-03-01,22:00:07,179.55,180.53,177.38,179.66,73488997\n"
        }),
    ))
    .await;

    let config = aggregator_config(Some(yahoo), Some(stooq));
    let agg = Arc::new(Aggregator::new(&config, build_providers(&config)));

    let out = agg
        .request(Operation::Quote, json!({"symbol": "AAPL"}), &ctx())
        .await
        .unwrap();
    assert_eq!(out["metadata"]["source"], "stooq");
    assert_eq!(out["metadata"]["fallbackChain"], json!(["yahoo", "stooq"]));
    assert_eq!(out["data"]["price"], 179.66);
}

#[tokio::test]
async fn rate_limited_upstream_counts_as_rate_limited() {
    let yahoo = serve(Router::new().route(
        "/v8/finance/chart/{symbol}",
        get(|| async { StatusCode::TOO_MANY_REQUESTS.into_response() }),
    ))
    .await;

    let config = aggregator_config(Some(yahoo), None);
    // Only yahoo in the chain for this operation.
    let mut config = config;
    config
        .provider_order
        .insert("quote".to_string(), vec!["yahoo".to_string()]);
    let agg = Arc::new(Aggregator::new(&config, build_providers(&config)));

    let err = agg
        .request(Operation::Quote, json!({"symbol": "AAPL"}), &ctx())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ProviderRateLimited(_)));
    assert_eq!(err.to_rpc_code(), -32010);
}

#[tokio::test]
async fn slow_upstream_hits_the_deadline_and_nothing_is_cached() {
    let slow_hits = Arc::new(AtomicUsize::new(0));
    let hits = Arc::clone(&slow_hits);
    let yahoo = serve(Router::new().route(
        "/v8/finance/chart/{symbol}",
        get(move |Path(symbol): Path<String>| {
            let hits = Arc::clone(&hits);
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(500)).await;
                Json(chart_json(&symbol, 1.0))
            }
        }),
    ))
    .await;

    let config = aggregator_config(Some(yahoo), None);
    let agg = Arc::new(Aggregator::new(&config, build_providers(&config)));

    let short_ctx = RequestContext::new(Duration::from_millis(150));
    let started = std::time::Instant::now();
    let err = agg
        .request(Operation::Quote, json!({"symbol": "AAPL"}), &short_ctx)
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert_eq!(err.to_rpc_code(), -32004);
    assert!(
        elapsed < Duration::from_millis(450),
        "deadline must cut the wait short, took {elapsed:?}"
    );
    assert_eq!(agg.cached_entries(), 0, "timed-out fetch must not be cached");
}

#[tokio::test]
async fn ecb_fx_rate_end_to_end() {
    const FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<gesmes:Envelope xmlns:gesmes="http://www.gesmes.org/xml/2002-08-01"
    xmlns="http://www.ecb.int/vocabulary/2002-08-01/eurofxref">
  <Cube>
    <Cube time="2024-03-01">
      <Cube currency="USD" rate="1.0834"/>
      <Cube currency="GBP" rate="0.8561"/>
    </Cube>
  </Cube>
</gesmes:Envelope>"#;

    let ecb = serve(Router::new().route(
        "/stats/eurofxref/eurofxref-daily.xml",
        get(|| async { FEED }),
    ))
    .await;

    let mut config = AggregatorConfig::default();
    config.providers.insert(
        "ecb".to_string(),
        ProviderConfig {
            base_url: Some(format!("http://{ecb}")),
            ..ProviderConfig::default()
        },
    );
    let agg = Arc::new(Aggregator::new(&config, build_providers(&config)));

    let out = agg
        .request(
            Operation::FxRate,
            json!({"from": "USD", "to": "GBP"}),
            &ctx(),
        )
        .await
        .unwrap();
    assert_eq!(out["metadata"]["source"], "ecb");
    assert_eq!(out["data"]["from"], "USD");
    let rate = out["data"]["rate"].as_f64().unwrap();
    assert!((rate - 0.8561 / 1.0834).abs() < 1e-9);
}
