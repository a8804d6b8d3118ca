//! End-to-end delivery scenarios driven through the HTTP router with the in-process bus.

use async_trait::async_trait;
use axum::{
    Router,
    body::{Body, BodyDataStream},
    http::{Request, StatusCode, header},
};
use bytes::Bytes;
use futures_util::StreamExt;
use server::{
    app_state::AppState,
    bus::{FanoutBus, MemoryBus},
    metrics::StreamMetrics,
    server::create_app_router,
    services::{ForwardError, GenerationOrigin},
};
use shared::{
    config::server::Config,
    models::{TokenEnvelope, destination_topic},
};
use std::{sync::Arc, time::Duration};
use tower::ServiceExt;

struct AcceptingOrigin;

#[async_trait]
impl GenerationOrigin for AcceptingOrigin {
    async fn submit(&self, _conversation_id: &str, _message: &str) -> Result<(), ForwardError> {
        Ok(())
    }
}

struct Harness {
    bus: MemoryBus,
    state: Arc<AppState>,
    app: Router,
}

fn harness(config: Config, origin: Option<Arc<dyn GenerationOrigin>>) -> Harness {
    let bus = MemoryBus::default();
    let state = Arc::new(AppState::new(
        Arc::new(bus.clone()),
        origin,
        Arc::new(config),
        Arc::new(StreamMetrics::default()),
    ));
    let app = create_app_router(Arc::clone(&state), None);
    Harness { bus, state, app }
}

async fn publish(bus: &MemoryBus, conversation_id: &str, sequence: u64, token: &str, done: bool) {
    let envelope = TokenEnvelope::new(conversation_id, token, sequence, done);
    bus.publish(
        &destination_topic(conversation_id),
        Bytes::from(envelope.encode().unwrap()),
    )
    .await
    .unwrap();
}

struct SseReader {
    body: BodyDataStream,
    text: String,
}

impl SseReader {
    fn new(body: Body) -> Self {
        Self {
            body: body.into_data_stream(),
            text: String::new(),
        }
    }

    async fn read_until(&mut self, needle: &str) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !self.text.contains(needle) {
                let chunk = self.body.next().await.expect("stream ended early").unwrap();
                self.text.push_str(std::str::from_utf8(&chunk).unwrap());
            }
        })
        .await
        .expect("timed out waiting for frame");
    }

    async fn read_to_end(mut self) -> String {
        tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(chunk) = self.body.next().await {
                self.text.push_str(std::str::from_utf8(&chunk.unwrap()).unwrap());
            }
        })
        .await
        .expect("stream did not close");
        self.text
    }
}

fn event_ids(text: &str) -> Vec<u64> {
    text.lines()
        .filter_map(|line| line.strip_prefix("id: "))
        .map(|id| id.parse().unwrap())
        .collect()
}

async fn open_stream(app: &Router, conversation_id: &str, last_event_id: Option<&str>) -> axum::response::Response {
    let mut request = Request::builder().uri(format!("/stream/{conversation_id}"));
    if let Some(id) = last_event_id {
        request = request.header("last-event-id", id);
    }
    app.clone()
        .oneshot(request.body(Body::empty()).unwrap())
        .await
        .unwrap()
}

fn chat_request(body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/chat")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn delivers_every_token_then_closes_after_the_terminal_one() {
    let h = harness(Config::default(), None);

    let response = open_stream(&h.app, "c1", None).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "text/event-stream"
    );
    let mut reader = SseReader::new(response.into_body());
    reader.read_until(": connected to c1\n\n").await;

    for (sequence, token) in [(1, "Hello"), (2, " wor"), (3, "ld")] {
        publish(&h.bus, "c1", sequence, token, false).await;
    }
    publish(&h.bus, "c1", 4, "", true).await;

    let text = reader.read_to_end().await;
    assert_eq!(event_ids(&text), vec![1, 2, 3, 4]);
    assert_eq!(text.matches("event: token\n").count(), 4);
    assert!(text.contains(r#""done":true"#));

    assert_eq!(h.bus.subscriber_count(&destination_topic("c1")), 0);
    assert_eq!(h.state.metrics().snapshot().messages_delivered, 4);
}

#[tokio::test]
async fn last_event_id_resumes_after_the_acknowledged_sequence() {
    let h = harness(Config::default(), None);

    let response = open_stream(&h.app, "c2", Some("2")).await;
    let mut reader = SseReader::new(response.into_body());
    reader.read_until(": connected to c2").await;

    for sequence in 1..=3 {
        publish(&h.bus, "c2", sequence, "t", false).await;
    }
    publish(&h.bus, "c2", 4, "", true).await;

    assert_eq!(event_ids(&reader.read_to_end().await), vec![3, 4]);
}

#[tokio::test]
async fn malformed_and_foreign_payloads_are_skipped() {
    let h = harness(Config::default(), None);

    let response = open_stream(&h.app, "c3", None).await;
    let mut reader = SseReader::new(response.into_body());
    reader.read_until(": connected to c3").await;

    let topic = destination_topic("c3");
    h.bus.publish(&topic, Bytes::from_static(b"{not json")).await.unwrap();
    let foreign = TokenEnvelope::new("other", "x", 1, false);
    h.bus
        .publish(&topic, Bytes::from(foreign.encode().unwrap()))
        .await
        .unwrap();
    publish(&h.bus, "c3", 1, "ok", true).await;

    assert_eq!(event_ids(&reader.read_to_end().await), vec![1]);
    assert_eq!(h.state.metrics().snapshot().malformed_envelopes, 1);
}

#[tokio::test]
async fn a_full_queue_drops_the_newest_messages() {
    let mut config = Config::default();
    config.delivery.queue_depth = 2;
    let h = harness(config, None);

    let response = open_stream(&h.app, "c4", None).await;
    let mut reader = SseReader::new(response.into_body());

    // No await point yields to the delivery task, so the queue fills up.
    for sequence in 1..=5 {
        publish(&h.bus, "c4", sequence, "t", false).await;
    }
    reader.read_until("id: 2\n").await;
    publish(&h.bus, "c4", 6, "", true).await;

    assert_eq!(event_ids(&reader.read_to_end().await), vec![1, 2, 6]);
    assert_eq!(h.state.metrics().snapshot().messages_dropped, 3);
}

#[tokio::test]
async fn a_dropped_terminal_envelope_leaves_the_stream_open() {
    let h = harness(Config::default(), None);

    let response = open_stream(&h.app, "c4b", None).await;
    let mut reader = SseReader::new(response.into_body());

    for sequence in 1..250 {
        publish(&h.bus, "c4b", sequence, "t", false).await;
    }
    publish(&h.bus, "c4b", 250, "", true).await;
    reader.read_until("id: 100\n").await;

    assert_eq!(event_ids(&reader.text), (1..=100).collect::<Vec<_>>());
    assert_eq!(h.state.metrics().snapshot().messages_dropped, 150);

    let quiet = tokio::time::timeout(Duration::from_millis(200), reader.body.next()).await;
    assert!(quiet.is_err(), "stream closed without a terminal envelope");

    publish(&h.bus, "c4b", 251, "", true).await;
    let ids = event_ids(&reader.read_to_end().await);
    assert_eq!(ids.len(), 101);
    assert_eq!(ids.last(), Some(&251));
}

#[tokio::test]
async fn subscription_failure_is_a_problem_response() {
    let h = harness(Config::default(), None);
    h.bus.set_connected(false);

    let response = open_stream(&h.app, "c5", None).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "application/problem+json"
    );
}

#[tokio::test]
async fn invalid_conversation_ids_are_rejected() {
    let h = harness(Config::default(), None);
    let long = "x".repeat(200);
    let response = open_stream(&h.app, &long, None).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn chat_streams_the_connected_event_then_tokens() {
    let h = harness(Config::default(), Some(Arc::new(AcceptingOrigin)));

    let response = h
        .app
        .clone()
        .oneshot(chat_request(r#"{"message":"hi","conversation_id":"c6"}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let mut reader = SseReader::new(response.into_body());
    reader.read_until("event: connected\n").await;
    assert!(reader.text.contains(r#""conversation_id":"c6""#));

    publish(&h.bus, "c6", 1, "Hi", false).await;
    publish(&h.bus, "c6", 2, "", true).await;

    let text = reader.read_to_end().await;
    assert_eq!(event_ids(&text), vec![1, 2]);
    assert!(!text.contains("event: error"));
}

#[tokio::test]
async fn chat_without_an_origin_is_unavailable() {
    let h = harness(Config::default(), None);
    let response = h
        .app
        .clone()
        .oneshot(chat_request(r#"{"message":"hi"}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn chat_rejects_empty_and_malformed_requests() {
    let h = harness(Config::default(), Some(Arc::new(AcceptingOrigin)));

    let empty = h
        .app
        .clone()
        .oneshot(chat_request(r#"{"message":"   "}"#))
        .await
        .unwrap();
    assert_eq!(empty.status(), StatusCode::BAD_REQUEST);

    let garbage = h.app.clone().oneshot(chat_request("{oops")).await.unwrap();
    assert_eq!(garbage.status(), StatusCode::BAD_REQUEST);
}
