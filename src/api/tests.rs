use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use httpmock::Method::{DELETE, GET, PATCH, POST, PUT};
use httpmock::MockServer;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::api::{ApiError, Interceptor, RequestOptions, RestApi, API_TRIGGERED_FIELD};
use crate::bus::{BusConfig, Event, EventBus, EventHandler, Hub};
use crate::cache::{Cache, SessionStorage, Tier};
use crate::db::{Database, DatabaseSchema};

fn bus() -> Arc<EventBus> {
    Arc::new(EventBus::new(&Hub::default(), BusConfig::default()))
}

fn cache(bus: Arc<EventBus>) -> Arc<Cache> {
    let db = Database::in_memory(DatabaseSchema::new("api_test", 1), bus).expect("in-memory DB");
    Arc::new(Cache::new("api-test", Arc::new(db), SessionStorage::new()))
}

/// Records `apiTriggered` values seen on the UI channel.
fn activity_log(bus: &EventBus) -> Arc<Mutex<Vec<bool>>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    let handler: Arc<dyn EventHandler> = Arc::new(move |event: &Event| {
        assert!(event.leader_only);
        if let Some(flag) = event.data.get(API_TRIGGERED_FIELD).and_then(Value::as_bool) {
            sink.lock().unwrap().push(flag);
        }
    });
    bus.add_ui_event_handler(handler);
    log
}

#[tokio::test]
async fn get_sends_default_headers_and_parses_json() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/catalog/discover")
                .header("content-type", "application/json")
                .header("x-api-key", "k-123");
            then.status(200).json_body(json!({"courses": [1, 2]}));
        })
        .await;

    let api = RestApi::new(server.base_url(), Some("k-123"), bus(), None).unwrap();
    let body: Value = api
        .get("/catalog/discover", RequestOptions::new())
        .await
        .expect("get should succeed");

    mock.assert_async().await;
    assert_eq!(body, json!({"courses": [1, 2]}));
}

#[tokio::test]
async fn bearer_token_comes_from_persistent_cache() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/me")
                .header("authorization", "Bearer secret");
            then.status(200).json_body(json!({"id": 1}));
        })
        .await;

    let bus = bus();
    let cache = cache(bus.clone());
    cache.insert(Tier::Persistent, "TOKEN", "secret").unwrap();
    let api = RestApi::new(server.base_url(), None, bus, Some(cache)).unwrap();

    let _: Value = api.get("/me", RequestOptions::new()).await.unwrap();
    mock.assert_async().await;
}

#[tokio::test]
async fn body_verbs_send_json_and_extra_headers() {
    let server = MockServer::start_async().await;
    let mut mocks = Vec::new();
    for method in [POST, PUT, PATCH] {
        let mock = server
            .mock_async(|when, then| {
                when.method(method)
                    .path("/items")
                    .header("x-trace", "t1")
                    .json_body(json!({"name": "x"}));
                then.status(201).json_body(json!({"ok": true}));
            })
            .await;
        mocks.push(mock);
    }

    let api = RestApi::new(server.base_url(), None, bus(), None).unwrap();
    let options = || RequestOptions::new().header("x-trace", "t1");
    let body = json!({"name": "x"});

    let posted: Value = api.post("/items", &body, options()).await.unwrap();
    let put: Value = api.put("/items", &body, options()).await.unwrap();
    let patched: Value = api.patch("/items", &body, options()).await.unwrap();

    for mock in &mocks {
        mock.assert_async().await;
    }
    assert_eq!(vec![posted, put, patched], vec![json!({"ok": true}); 3]);
}

#[tokio::test]
async fn non_json_response_falls_back_to_string() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(DELETE).path("/items/1");
            then.status(200).body("deleted");
        })
        .await;

    let api = RestApi::new(server.base_url(), None, bus(), None).unwrap();
    let body: String = api.delete("/items/1", RequestOptions::new()).await.unwrap();
    assert_eq!(body, "deleted");
}

#[tokio::test]
async fn error_status_carries_response_data() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/missing");
            then.status(404).json_body(json!({"error": "not found"}));
        })
        .await;

    let bus = bus();
    let log = activity_log(&bus);
    let api = RestApi::new(server.base_url(), None, bus, None)
        .unwrap()
        .with_activity_events();

    let err = api
        .get::<Value>("/missing", RequestOptions::new())
        .await
        .unwrap_err();
    match err {
        ApiError::Status { status, data } => {
            assert_eq!(status, 404);
            assert_eq!(data, json!({"error": "not found"}));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(*log.lock().unwrap(), vec![true, false]);
}

#[tokio::test]
async fn activity_events_bracket_every_call() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/ping");
            then.status(200).json_body(json!("pong"));
        })
        .await;

    let bus = bus();
    let log = activity_log(&bus);
    let api = RestApi::new(server.base_url(), None, bus, None)
        .unwrap()
        .with_activity_events();

    let _: String = api.get("/ping", RequestOptions::new()).await.unwrap();
    let _: String = api.get("/ping", RequestOptions::new()).await.unwrap();
    assert_eq!(*log.lock().unwrap(), vec![true, false, true, false]);
}

#[tokio::test]
async fn cancellation_aborts_and_still_reports_end() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/slow");
            then.status(200).delay(Duration::from_secs(5)).json_body(json!({}));
        })
        .await;

    let bus = bus();
    let log = activity_log(&bus);
    let api = RestApi::new(server.base_url(), None, bus, None)
        .unwrap()
        .with_activity_events();

    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let err = api
        .get::<Value>("/slow", RequestOptions::new().cancel_on(token))
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::Cancelled), "{err:?}");
    assert_eq!(*log.lock().unwrap(), vec![true, false]);
}

#[tokio::test]
async fn interceptors_are_identity_lists() {
    let api = RestApi::new("http://localhost", None, bus(), None).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let interceptor: Interceptor = Arc::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    api.register_request_interceptor(interceptor.clone());
    api.register_request_interceptor(interceptor.clone());
    api.register_response_interceptor(interceptor.clone());
    super::run(&api.request_interceptors);
    super::run(&api.response_interceptors);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    api.unregister_request_interceptor(&interceptor);
    api.unregister_request_interceptor(&interceptor);
    api.unregister_response_interceptor(&interceptor);
    super::run(&api.request_interceptors);
    super::run(&api.response_interceptors);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(api.base_url(), "http://localhost");
}
