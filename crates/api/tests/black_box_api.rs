use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use reqwest::StatusCode;
use serde_json::json;

use erpbus_events::{BusConfig, EventBus, EventType, HandlerAction, HandlerRegistration, RetryPolicy};

struct TestServer {
    base_url: String,
    bus: EventBus,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        let config = BusConfig::default()
            .with_worker_count(2)
            .with_poll_interval(Duration::from_millis(10))
            .with_retry_policy(RetryPolicy::fixed(Duration::from_millis(1)));
        Self::spawn_with(EventBus::new(config), true).await
    }

    async fn spawn_with(bus: EventBus, start: bool) -> Self {
        if start {
            bus.start().await;
        }

        // Build app (same router as prod), but bind to an ephemeral port.
        let app = erpbus_api::app::build_app(bus.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            bus,
            handle,
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn get_json(client: &reqwest::Client, url: String) -> serde_json::Value {
    let res = client.get(url).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    res.json().await.unwrap()
}

/// Poll `url` until `check` accepts the body.
async fn get_json_eventually(
    client: &reqwest::Client,
    url: String,
    check: impl Fn(&serde_json::Value) -> bool,
) -> serde_json::Value {
    for _ in 0..100 {
        let body = get_json(client, url.clone()).await;
        if check(&body) {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition on {url} not met within timeout");
}

#[tokio::test]
async fn health_is_ok_for_a_running_bus() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client
        .get(format!("{}/health", srv.base_url))
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["running"], true);
}

#[tokio::test]
async fn health_is_unavailable_for_a_stopped_bus() {
    let srv = TestServer::spawn_with(EventBus::default(), false).await;
    let client = reqwest::Client::new();

    let res = client
        .get(format!("{}/health", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);

    let res = client
        .post(format!("{}/events", srv.base_url))
        .json(&json!({ "event_type": "order.created", "source": "sales" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "bus_not_running");
}

#[tokio::test]
async fn published_event_shows_up_in_stats_and_history() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client
        .post(format!("{}/events", srv.base_url))
        .json(&json!({
            "event_type": "order.created",
            "source": "sales",
            "data": { "order_id": 42 },
            "priority": "high",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let created: serde_json::Value = res.json().await.unwrap();
    let id = created["id"].as_str().unwrap().to_string();

    let recent = get_json(&client, format!("{}/events/recent?limit=5", srv.base_url)).await;
    assert!(recent.as_array().unwrap().iter().any(|e| e["id"] == id.as_str()));

    let stats = get_json_eventually(&client, format!("{}/stats", srv.base_url), |s| {
        s["events_processed"].as_u64() >= Some(2)
    })
    .await;
    assert_eq!(stats["running"], true);
    assert!(stats["events_published"].as_u64().unwrap() >= 2);
}

#[tokio::test]
async fn invalid_publish_requests_are_rejected() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client
        .post(format!("{}/events", srv.base_url))
        .json(&json!({ "event_type": "", "source": "sales" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "validation_failed");

    let res = client
        .post(format!("{}/events", srv.base_url))
        .json(&json!({ "event_type": "order.created", "source": "sales", "tenant_id": "nope" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let failed = get_json(&client, format!("{}/events/failed", srv.base_url)).await;
    assert_eq!(failed[0]["reason"], "validation_failed");
}

#[tokio::test]
async fn dead_letters_can_be_listed_and_requeued() {
    let srv = TestServer::spawn().await;
    srv.bus.subscribe(
        HandlerRegistration::new(
            [EventType::InvoiceIssued],
            HandlerAction::blocking(|_| Err(anyhow::anyhow!("pdf renderer down"))),
        )
        .with_name("invoice-pdf"),
    );
    let client = reqwest::Client::new();

    let res = client
        .post(format!("{}/events", srv.base_url))
        .json(&json!({ "event_type": "invoice.issued", "source": "billing", "max_retries": 1 }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let created: serde_json::Value = res.json().await.unwrap();
    let id = created["id"].as_str().unwrap().to_string();

    let dead = get_json_eventually(&client, format!("{}/dead-letters", srv.base_url), |d| {
        d.as_array().is_some_and(|a| !a.is_empty())
    })
    .await;
    assert_eq!(dead[0]["event"]["id"], id.as_str());
    assert_eq!(dead[0]["event"]["status"], "dead_letter");

    let res = client
        .post(format!("{}/dead-letters/{}/requeue", srv.base_url, id))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);

    let res = client
        .post(format!("{}/dead-letters/{}/requeue", srv.base_url, erpbus_events::EventId::new()))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let handlers = get_json(&client, format!("{}/handlers", srv.base_url)).await;
    let handler = &handlers[0];
    assert_eq!(handler["name"], "invoice-pdf");
    assert!(handler["error_count"].as_u64().unwrap() >= 2);

    let by_id = get_json(
        &client,
        format!("{}/handlers/{}", srv.base_url, handler["id"].as_str().unwrap()),
    )
    .await;
    assert_eq!(by_id["name"], "invoice-pdf");

    let res = client
        .get(format!("{}/handlers/{}", srv.base_url, erpbus_events::HandlerId::new()))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn replay_endpoint_republishes_window() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let from = Utc::now() - ChronoDuration::hours(2);
    let to = Utc::now() - ChronoDuration::hours(1);

    for offset in [10, 20, 70] {
        let res = client
            .post(format!("{}/events", srv.base_url))
            .json(&json!({
                "event_type": "order.updated",
                "source": "sales",
                "timestamp": from + ChronoDuration::minutes(offset),
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::ACCEPTED);
    }

    let res = client
        .post(format!("{}/events/replay", srv.base_url))
        .json(&json!({ "from": from, "to": to, "event_types": ["order.updated"] }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["replayed"], 2);

    let res = client
        .post(format!("{}/events/replay", srv.base_url))
        .json(&json!({ "from": to, "to": from }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}
