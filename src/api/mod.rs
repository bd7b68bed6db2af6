//! JSON REST client that reports its activity on the UI channel.

#[cfg(test)]
mod tests;

use std::sync::{Arc, PoisonError, RwLock};

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::bus::{Event, EventBus, EventCategory};
use crate::cache::{Cache, Tier};
use crate::db::DbError;

/// Persistent cache key holding the bearer token.
pub const TOKEN_CACHE_KEY: &str = "TOKEN";
/// UI event field set by the activity interceptors.
pub const API_TRIGGERED_FIELD: &str = "apiTriggered";

pub type Interceptor = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("request failed with status {status}")]
    Status { status: u16, data: Value },
    #[error("request cancelled")]
    Cancelled,
    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("invalid header `{0}`")]
    InvalidHeader(String),
    #[error("cache error: {0}")]
    Cache(#[from] DbError),
}

/// Per-call extras: headers layered over the defaults and an optional
/// cancellation token.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub headers: Vec<(String, String)>,
    pub cancel: Option<CancellationToken>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

pub struct RestApi {
    client: reqwest::Client,
    base_url: String,
    default_headers: HeaderMap,
    bus: Arc<EventBus>,
    cache: Option<Arc<Cache>>,
    request_interceptors: RwLock<Vec<Interceptor>>,
    response_interceptors: RwLock<Vec<Interceptor>>,
}

impl RestApi {
    /// `cache` supplies the bearer token; without one requests go out
    /// unauthenticated.
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<&str>,
        bus: Arc<EventBus>,
        cache: Option<Arc<Cache>>,
    ) -> Result<Self, ApiError> {
        let mut default_headers = HeaderMap::new();
        default_headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = api_key.filter(|k| !k.is_empty()) {
            default_headers.insert(
                HeaderName::from_static("x-api-key"),
                HeaderValue::from_str(key).map_err(|_| ApiError::InvalidHeader("x-api-key".into()))?,
            );
        }
        Ok(Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            default_headers,
            bus,
            cache,
            request_interceptors: RwLock::new(Vec::new()),
            response_interceptors: RwLock::new(Vec::new()),
        })
    }

    /// Register interceptors that broadcast a leader-only UI event with
    /// `apiTriggered: true` before every call and `false` after it.
    pub fn with_activity_events(self) -> Self {
        let started = activity_interceptor(self.bus.clone(), true);
        let finished = activity_interceptor(self.bus.clone(), false);
        self.register_request_interceptor(started);
        self.register_response_interceptor(finished);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    // -- interceptors ----------------------------------------------------------

    pub fn register_request_interceptor(&self, interceptor: Interceptor) {
        register(&self.request_interceptors, interceptor);
    }

    pub fn unregister_request_interceptor(&self, interceptor: &Interceptor) {
        unregister(&self.request_interceptors, interceptor);
    }

    pub fn register_response_interceptor(&self, interceptor: Interceptor) {
        register(&self.response_interceptors, interceptor);
    }

    pub fn unregister_response_interceptor(&self, interceptor: &Interceptor) {
        unregister(&self.response_interceptors, interceptor);
    }

    // -- verbs -----------------------------------------------------------------

    pub async fn get<R: DeserializeOwned>(
        &self,
        uri: &str,
        options: RequestOptions,
    ) -> Result<R, ApiError> {
        self.request(Method::GET, uri, None, options).await
    }

    pub async fn delete<R: DeserializeOwned>(
        &self,
        uri: &str,
        options: RequestOptions,
    ) -> Result<R, ApiError> {
        self.request(Method::DELETE, uri, None, options).await
    }

    /// A body serializing to `null` is not sent.
    pub async fn post<R: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        uri: &str,
        body: &B,
        options: RequestOptions,
    ) -> Result<R, ApiError> {
        let body = serde_json::to_value(body)?;
        self.request(Method::POST, uri, Some(body), options).await
    }

    pub async fn put<R: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        uri: &str,
        body: &B,
        options: RequestOptions,
    ) -> Result<R, ApiError> {
        let body = serde_json::to_value(body)?;
        self.request(Method::PUT, uri, Some(body), options).await
    }

    pub async fn patch<R: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        uri: &str,
        body: &B,
        options: RequestOptions,
    ) -> Result<R, ApiError> {
        let body = serde_json::to_value(body)?;
        self.request(Method::PATCH, uri, Some(body), options).await
    }

    async fn request<R: DeserializeOwned>(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        options: RequestOptions,
    ) -> Result<R, ApiError> {
        run(&self.request_interceptors);
        let outcome = self.send(method, uri, body, options).await;
        run(&self.response_interceptors);
        Ok(serde_json::from_value(outcome?)?)
    }

    async fn send(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        options: RequestOptions,
    ) -> Result<Value, ApiError> {
        let headers = self.headers(&options)?;
        let url = format!("{}{}", self.base_url, uri);
        tracing::debug!(%method, %url, "api request");

        let mut request = self.client.request(method, &url).headers(headers);
        if let Some(body) = body.filter(|b| !b.is_null()) {
            request = request.body(body.to_string());
        }
        let exchange = async {
            let response = request.send().await?;
            let status = response.status();
            let text = response.text().await?;
            Ok::<_, ApiError>((status, text))
        };

        let (status, text) = match &options.cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => {
                    tracing::debug!(%url, "api request cancelled");
                    return Err(ApiError::Cancelled);
                }
                result = exchange => result?,
            },
            None => exchange.await?,
        };

        let data = parse_body(&text);
        if !status.is_success() {
            tracing::warn!(%url, status = status.as_u16(), "api request failed");
            return Err(ApiError::Status {
                status: status.as_u16(),
                data,
            });
        }
        Ok(data)
    }

    fn headers(&self, options: &RequestOptions) -> Result<HeaderMap, ApiError> {
        let mut headers = self.default_headers.clone();
        if let Some(token) = self.bearer_token()? {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| ApiError::InvalidHeader(AUTHORIZATION.to_string()))?;
            headers.insert(AUTHORIZATION, value);
        }
        for (name, value) in &options.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| ApiError::InvalidHeader(name.clone()))?;
            let value =
                HeaderValue::from_str(value).map_err(|_| ApiError::InvalidHeader(name.to_string()))?;
            headers.insert(name, value);
        }
        Ok(headers)
    }

    fn bearer_token(&self) -> Result<Option<String>, ApiError> {
        let Some(cache) = &self.cache else {
            return Ok(None);
        };
        let token: Option<Value> = cache.get(Tier::Persistent, TOKEN_CACHE_KEY)?;
        Ok(match token {
            Some(Value::String(s)) if !s.is_empty() => Some(s),
            Some(Value::Null) | None => None,
            Some(Value::String(_)) => None,
            Some(other) => Some(other.to_string()),
        })
    }
}

fn activity_interceptor(bus: Arc<EventBus>, triggered: bool) -> Interceptor {
    Arc::new(move || {
        let event = Event::new(EventCategory::Ui)
            .leader_only()
            .with_field(API_TRIGGERED_FIELD, triggered);
        if let Err(e) = bus.broadcast_ui_event(event) {
            tracing::warn!("api activity event not sent: {e}");
        }
    })
}

fn register(list: &RwLock<Vec<Interceptor>>, interceptor: Interceptor) {
    let mut list = list.write().unwrap_or_else(PoisonError::into_inner);
    if !list.iter().any(|i| same_interceptor(i, &interceptor)) {
        list.push(interceptor);
    }
}

fn unregister(list: &RwLock<Vec<Interceptor>>, interceptor: &Interceptor) {
    let mut list = list.write().unwrap_or_else(PoisonError::into_inner);
    if let Some(idx) = list.iter().position(|i| same_interceptor(i, interceptor)) {
        list.remove(idx);
    }
}

fn same_interceptor(a: &Interceptor, b: &Interceptor) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

fn run(list: &RwLock<Vec<Interceptor>>) {
    let snapshot = list.read().unwrap_or_else(PoisonError::into_inner).clone();
    for interceptor in snapshot {
        interceptor();
    }
}

/// JSON when the body parses as JSON, the raw text otherwise.
fn parse_body(text: &str) -> Value {
    if text.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}
