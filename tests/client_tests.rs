//! Integration tests driving the client against a WireMock server.

use pretty_assertions::assert_eq;
use resilient_client::{
    BatchConfig, CacheConfig, CircuitBreakerConfig, Client, ClientConfig, ClientConfigBuilder,
    EventChannel, RequestOptions, RetryConfig, SdkError, SdkEvent,
};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wiremock::matchers::{body_json, header, header_exists, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config_for(server: &MockServer) -> ClientConfigBuilder {
    ClientConfig::builder()
        .base_url(server.uri())
        .api_key("test-api-key")
}

fn quick_retries(max_attempts: u32) -> RetryConfig {
    RetryConfig::default()
        .max_attempts(max_attempts)
        .initial_delay(Duration::from_millis(10))
        .max_delay(Duration::from_millis(50))
}

#[tokio::test]
async fn test_get_sends_auth_and_request_id() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/users/42"))
        .and(header("authorization", "Bearer test-api-key"))
        .and(header_exists("x-request-id"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": 42 })))
        .expect(1)
        .mount(&server)
        .await;

    let client = Client::new(config_for(&server).build().unwrap()).unwrap();

    let user: Value = client.get("/users/42").await.unwrap();

    assert_eq!(user, json!({ "id": 42 }));
}

#[tokio::test]
async fn test_cache_serves_repeated_get() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/config"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "flag": true })))
        .expect(1)
        .mount(&server)
        .await;

    let client = Client::new(
        config_for(&server)
            .cache(CacheConfig::with_ttl(Duration::from_secs(60)))
            .build()
            .unwrap(),
    )
    .unwrap();

    let first: Value = client.get("/config").await.unwrap();
    let second: Value = client.get("/config").await.unwrap();

    assert_eq!(first, second);
    let stats = client.cache().unwrap().stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
}

#[tokio::test]
async fn test_server_error_is_retried_until_success() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true })))
        .expect(1)
        .mount(&server)
        .await;

    let client = Client::new(config_for(&server).retry(quick_retries(3)).build().unwrap()).unwrap();

    let value: Value = client.get("/flaky").await.unwrap();

    assert_eq!(value, json!({ "ok": true }));
}

#[tokio::test]
async fn test_error_body_is_normalized() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/orders/9"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "error": {
                "message": "Order not found",
                "code": "NOT_FOUND",
                "details": { "orderId": 9 }
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = Client::new(config_for(&server).retry(quick_retries(3)).build().unwrap()).unwrap();

    let error = client.get::<Value>("/orders/9").await.unwrap_err();
    let record = error.to_record();

    assert_eq!(record.message, "Order not found");
    assert_eq!(record.code.as_deref(), Some("NOT_FOUND"));
    assert_eq!(record.status, Some(404));
    assert_eq!(record.details, Some(json!({ "orderId": 9 })));
    assert!(record.request_id.is_some());
}

#[tokio::test]
async fn test_unrecognized_error_body_lands_in_details() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/legacy"))
        .respond_with(ResponseTemplate::new(400).set_body_string("bad things happened"))
        .mount(&server)
        .await;

    let client = Client::new(config_for(&server).no_retry().build().unwrap()).unwrap();

    let error = client.get::<Value>("/legacy").await.unwrap_err();

    assert_eq!(error.status(), Some(400));
    assert_eq!(error.details(), Some(json!("bad things happened")));
}

#[tokio::test]
async fn test_slow_response_times_out() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({}))
                .set_delay(Duration::from_millis(500)),
        )
        .mount(&server)
        .await;

    let client = Client::new(config_for(&server).no_retry().build().unwrap()).unwrap();

    let error = client
        .request::<Value>(
            "/slow",
            RequestOptions::get().timeout(Duration::from_millis(50)),
        )
        .await
        .unwrap_err();

    assert!(matches!(error, SdkError::Timeout { .. }));
    assert_eq!(error.code(), "TIMEOUT");
}

#[tokio::test]
async fn test_circuit_breaker_stops_traffic() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/down"))
        .respond_with(ResponseTemplate::new(500))
        .expect(2)
        .mount(&server)
        .await;

    let client = Client::new(
        config_for(&server)
            .no_retry()
            .circuit_breaker(
                CircuitBreakerConfig::default()
                    .failure_threshold(2)
                    .reset_timeout(Duration::from_secs(60)),
            )
            .build()
            .unwrap(),
    )
    .unwrap();

    let transitions = Arc::new(Mutex::new(Vec::new()));
    let seen = transitions.clone();
    let _sub = client
        .events()
        .on_async(EventChannel::CircuitBreaker, move |event| {
            let seen = seen.clone();
            async move {
                if let SdkEvent::CircuitBreaker { from, to, .. } = event {
                    seen.lock().unwrap().push(format!("{from}->{to}"));
                }
                Ok(())
            }
        });

    for _ in 0..2 {
        client.get::<Value>("/down").await.unwrap_err();
    }
    let error = client.get::<Value>("/down").await.unwrap_err();

    assert!(matches!(error, SdkError::CircuitOpen { .. }));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(*transitions.lock().unwrap(), vec!["closed->open".to_string()]);
}

#[tokio::test]
async fn test_post_sends_query_and_json_body() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/items"))
        .and(query_param("dry_run", "true"))
        .and(header("content-type", "application/json"))
        .and(body_json(json!({ "name": "widget" })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": "itm_1" })))
        .expect(1)
        .mount(&server)
        .await;

    let client = Client::new(config_for(&server).build().unwrap()).unwrap();

    let response = client
        .request_raw(
            "/items",
            RequestOptions::default()
                .method(resilient_client::Method::Post)
                .query("dry_run", true)
                .body(json!({ "name": "widget" })),
        )
        .await
        .unwrap();

    assert_eq!(response.status, 201);
    assert_eq!(response.data, json!({ "id": "itm_1" }));
}

#[tokio::test]
async fn test_batched_requests_share_one_call() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/batch"))
        .and(body_json(json!({ "requests": [{ "n": 1 }, { "n": 2 }, { "n": 3 }] })))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!([{ "r": 1 }, { "r": 2 }, { "r": 3 }])),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = Client::new(
        config_for(&server)
            .batch(BatchConfig::new(3, Duration::from_millis(20)))
            .build()
            .unwrap(),
    )
    .unwrap();

    let (a, b, c) = tokio::join!(
        client.request_batched(json!({ "n": 1 })),
        client.request_batched(json!({ "n": 2 })),
        client.request_batched(json!({ "n": 3 })),
    );

    assert_eq!(a.unwrap(), json!({ "r": 1 }));
    assert_eq!(b.unwrap(), json!({ "r": 2 }));
    assert_eq!(c.unwrap(), json!({ "r": 3 }));

    client.shutdown().await;
}
