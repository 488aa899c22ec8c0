//! REST backend client.
//!
//! Authenticated HTTP communication with the kost backend: replaying queued
//! mutations, push token registration, notification preferences, and the
//! lightweight health check the connectivity probe uses.

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::connectivity::HealthProbe;
use crate::error::ApiError;
use crate::models::{NotificationPreference, Operation, PendingAction, PreferenceKey};
use crate::notifications::NotificationBackend;
use crate::sync::ActionReplayer;

/// Timeout used specifically for the lightweight health check.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the backend base URL:
/// - ensure a scheme is present (https, or http for localhost)
/// - strip trailing slashes
/// - strip a trailing `/api` segment
pub fn normalize_base_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }

    if url.ends_with("/api") {
        url.truncate(url.len() - 4);
    }

    while url.ends_with('/') {
        url.pop();
    }

    url
}

fn percent_encode(input: &str) -> String {
    let mut encoded = String::with_capacity(input.len());
    for b in input.bytes() {
        let is_unreserved =
            b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.' || b == b'~';
        if is_unreserved {
            encoded.push(b as char);
        } else {
            encoded.push_str(&format!("%{b:02X}"));
        }
    }
    encoded
}

/// HTTP method and path that replays a queued action.
pub fn route_for(action: &PendingAction) -> Result<(Method, String), ApiError> {
    let collection = action.action_type.resource.collection();
    let entity_path = || {
        action
            .entity_id
            .as_deref()
            .map(|id| format!("/api/{collection}/{}", percent_encode(id)))
            .ok_or_else(|| {
                ApiError::InvalidRequest(format!("{} has no entity id", action.action_type))
            })
    };
    match action.action_type.operation {
        Operation::Create => Ok((Method::POST, format!("/api/{collection}"))),
        Operation::Update => Ok((Method::PUT, entity_path()?)),
        Operation::Delete => Ok((Method::DELETE, entity_path()?)),
    }
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn transport_error(url: &str, err: &reqwest::Error, timeout: Duration) -> ApiError {
    if err.is_timeout() {
        return ApiError::Timeout(timeout);
    }
    if err.is_connect() {
        return ApiError::Network(format!("cannot reach backend at {url}"));
    }
    if err.is_builder() {
        return ApiError::InvalidRequest(format!("invalid backend URL: {url}"));
    }
    ApiError::Network(format!("network error communicating with {url}: {err}"))
}

fn status_message(status: StatusCode) -> String {
    match status.as_u16() {
        400 => "Request was rejected by the backend".to_string(),
        404 => "Backend endpoint not found".to_string(),
        409 => "Conflicting change on the backend".to_string(),
        422 => "Validation failed".to_string(),
        s if s >= 500 => format!("Backend server error (HTTP {s})"),
        s => format!("Unexpected response from backend (HTTP {s})"),
    }
}

/// Build the typed error for a non-success response, keeping validation
/// details from the body so the user can see what to fix.
fn error_from_response(status: StatusCode, retry_after: Option<u64>, body_text: &str) -> ApiError {
    let message = if let Ok(json) = serde_json::from_str::<Value>(body_text) {
        let message = json
            .get("error")
            .or_else(|| json.get("message"))
            .and_then(Value::as_str)
            .map(|s| s.to_string())
            .unwrap_or_else(|| status_message(status));
        match json.get("details").or_else(|| json.get("errors")) {
            Some(details) => format!("{message}: {details}"),
            None => message,
        }
    } else if !body_text.trim().is_empty() {
        format!("{}: {}", status_message(status), body_text.trim())
    } else {
        status_message(status)
    };

    match ApiError::from_status(status.as_u16(), message) {
        ApiError::Backpressure { .. } => ApiError::Backpressure {
            retry_after_secs: retry_after,
        },
        other => other,
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct ApiClient {
    client: Client,
    base_url: String,
    token: Option<Zeroizing<String>>,
    timeout: Duration,
}

impl ApiClient {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::InvalidRequest(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: normalize_base_url(base_url),
            token: token.filter(|t| !t.trim().is_empty()).map(Zeroizing::new),
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Perform an authenticated request. `path` includes the leading slash.
    ///
    /// Returns the JSON body, `Value::Null` for empty (204) responses, or
    /// the raw text when a success body is not JSON.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        idempotency_key: Option<&str>,
    ) -> Result<Value, ApiError> {
        let url = format!("{}{path}", self.base_url);
        let mut req = self
            .client
            .request(method.clone(), &url)
            .header("Accept", "application/json");

        if let Some(token) = &self.token {
            req = req.bearer_auth(token.as_str());
        }
        if let Some(key) = idempotency_key {
            req = req.header("Idempotency-Key", key);
        }
        if let Some(b) = body.filter(|b| !b.is_null()) {
            req = req.json(b);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| transport_error(&self.base_url, &e, self.timeout))?;
        let status = resp.status();
        debug!(%method, path, status = status.as_u16(), "backend response");

        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok());
            let body_text = resp.text().await.unwrap_or_default();
            return Err(error_from_response(status, retry_after, &body_text));
        }

        let body_text = resp
            .text()
            .await
            .map_err(|e| transport_error(&self.base_url, &e, self.timeout))?;
        if body_text.trim().is_empty() {
            return Ok(Value::Null);
        }
        // The status code decides success; a plain-text body ("Created")
        // is handed back as a string.
        match serde_json::from_str(&body_text) {
            Ok(value) => Ok(value),
            Err(e) => {
                debug!(%method, path, error = %e, "non-JSON success body");
                Ok(Value::String(body_text))
            }
        }
    }

    /// Quick reachability check: `HEAD /api/health`.
    pub async fn check_health(&self) -> bool {
        let url = format!("{}/api/health", self.base_url);
        match self
            .client
            .head(&url)
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!(error = %e, "health check failed");
                false
            }
        }
    }
}

#[async_trait]
impl ActionReplayer for ApiClient {
    async fn replay(&self, action: &PendingAction) -> Result<Value, ApiError> {
        let (method, path) = route_for(action)?;
        let body = match action.action_type.operation {
            Operation::Delete => None,
            _ => Some(&action.payload),
        };
        self.request(method, &path, body, Some(&action.id)).await
    }
}

#[async_trait]
impl HealthProbe for ApiClient {
    async fn is_reachable(&self) -> bool {
        self.check_health().await
    }
}

#[async_trait]
impl NotificationBackend for ApiClient {
    async fn register_push_token(&self, device_id: &str, token: &str) -> Result<(), ApiError> {
        let body = serde_json::json!({
            "deviceId": device_id,
            "token": token,
            "platform": "web",
        });
        self.request(
            Method::POST,
            "/api/notifications/push-tokens",
            Some(&body),
            None,
        )
        .await?;
        info!(device_id, "push token registered with backend");
        Ok(())
    }

    async fn unregister_push_token(&self, device_id: &str, token: &str) -> Result<(), ApiError> {
        let path = format!(
            "/api/notifications/push-tokens/{}",
            percent_encode(device_id)
        );
        let body = serde_json::json!({ "token": token });
        match self.request(Method::DELETE, &path, Some(&body), None).await {
            Ok(_) => Ok(()),
            // Already gone on the backend.
            Err(ApiError::Rejected { status: 404, .. }) => {
                warn!(device_id, "push token was not registered on backend");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn fetch_preferences(&self) -> Result<NotificationPreference, ApiError> {
        let value = self
            .request(Method::GET, "/api/notifications/preferences", None, None)
            .await?;
        // Some deployments wrap the record in `{ "data": ... }`.
        let record = value.get("data").cloned().unwrap_or(value);
        serde_json::from_value(record)
            .map_err(|e| ApiError::InvalidResponse(format!("preferences: {e}")))
    }

    async fn update_preference(&self, key: PreferenceKey, value: bool) -> Result<(), ApiError> {
        let mut body = serde_json::Map::new();
        body.insert(key.as_str().to_string(), Value::Bool(value));
        self.request(
            Method::PATCH,
            "/api/notifications/preferences",
            Some(&Value::Object(body)),
            None,
        )
        .await?;
        Ok(())
    }

    async fn unread_count(&self) -> Result<u64, ApiError> {
        let value = self
            .request(Method::GET, "/api/notifications/unread-count", None, None)
            .await?;
        value
            .get("count")
            .or_else(|| value.get("unread"))
            .and_then(Value::as_u64)
            .ok_or_else(|| ApiError::InvalidResponse("missing unread count".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ActionStatus, ActionType, Resource};
    use chrono::Utc;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn action(op: Operation, resource: Resource, entity_id: Option<&str>) -> PendingAction {
        PendingAction {
            id: "6a1f0b4e-action".into(),
            action_type: ActionType::new(op, resource),
            entity_id: entity_id.map(str::to_string),
            payload: json!({ "name": "Kamar A1" }),
            created_at: Utc::now(),
            status: ActionStatus::Syncing,
            retry_count: 0,
            last_error: None,
            failure_kind: None,
        }
    }

    fn client(server: &MockServer) -> ApiClient {
        ApiClient::new(&server.uri(), Some("jwt-token".into()), Duration::from_secs(2)).unwrap()
    }

    #[test]
    fn test_normalize_base_url() {
        assert_eq!(normalize_base_url("kost.example.com/"), "https://kost.example.com");
        assert_eq!(normalize_base_url("localhost:8080/api/"), "http://localhost:8080");
        assert_eq!(
            normalize_base_url(" https://api.kost.id/api "),
            "https://api.kost.id"
        );
    }

    #[test]
    fn test_routes_per_operation() {
        let (m, p) = route_for(&action(Operation::Create, Resource::Room, None)).unwrap();
        assert_eq!((m, p.as_str()), (Method::POST, "/api/rooms"));

        let (m, p) = route_for(&action(Operation::Update, Resource::Utility, Some("u 1"))).unwrap();
        assert_eq!((m, p.as_str()), (Method::PUT, "/api/utilities/u%201"));

        let (m, p) = route_for(&action(Operation::Delete, Resource::Laundry, Some("l/9"))).unwrap();
        assert_eq!((m, p.as_str()), (Method::DELETE, "/api/laundry/l%2F9"));

        assert!(matches!(
            route_for(&action(Operation::Delete, Resource::Room, None)),
            Err(ApiError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_replay_sends_payload_auth_and_idempotency_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/rooms"))
            .and(header("authorization", "Bearer jwt-token"))
            .and(header("idempotency-key", "6a1f0b4e-action"))
            .and(body_json(json!({ "name": "Kamar A1" })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": "room-1" })))
            .expect(1)
            .mount(&server)
            .await;

        let result = client(&server)
            .replay(&action(Operation::Create, Resource::Room, None))
            .await
            .unwrap();
        assert_eq!(result["id"], "room-1");
    }

    #[tokio::test]
    async fn test_validation_error_is_rejected_with_details() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/invoices"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "message": "Validation failed",
                "errors": { "amount": "required" }
            })))
            .mount(&server)
            .await;

        let err = client(&server)
            .replay(&action(Operation::Create, Resource::Invoice, None))
            .await
            .unwrap_err();
        match err {
            ApiError::Rejected { status, message } => {
                assert_eq!(status, 400);
                assert!(message.contains("amount"), "{message}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_server_error_and_backpressure_are_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/api/rooms/r1"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/api/rooms/r2"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "12"))
            .mount(&server)
            .await;

        let api = client(&server);
        let err = api
            .replay(&action(Operation::Update, Resource::Room, Some("r1")))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Server { status: 503, .. }));
        assert!(err.is_retryable());

        let err = api
            .replay(&action(Operation::Delete, Resource::Room, Some("r2")))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ApiError::Backpressure {
                retry_after_secs: Some(12)
            }
        );
    }

    #[tokio::test]
    async fn test_unauthorized_and_empty_body() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/api/rooms/r1"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/api/rooms/r2"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let api = client(&server);
        assert_eq!(
            api.replay(&action(Operation::Delete, Resource::Room, Some("r1")))
                .await
                .unwrap(),
            Value::Null
        );
        assert_eq!(
            api.replay(&action(Operation::Delete, Resource::Room, Some("r2")))
                .await
                .unwrap_err(),
            ApiError::Unauthorized { status: 401 }
        );
    }

    #[tokio::test]
    async fn test_plain_text_success_body_dequeues_action() {
        use crate::connectivity::ConnectivityMonitor;
        use crate::events::EventBus;
        use crate::models::NewAction;
        use crate::queue::PendingActionStore;
        use crate::sync::{FailurePolicy, SyncManager};
        use std::sync::Arc;

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/rooms"))
            .respond_with(ResponseTemplate::new(201).set_body_string("Created"))
            .expect(1)
            .mount(&server)
            .await;

        let api = Arc::new(client(&server));
        let events = EventBus::default();
        let db = Arc::new(crate::db::open_in_memory().unwrap());
        let store = Arc::new(PendingActionStore::new(db, 10, 3, events.clone()));
        let connectivity = Arc::new(ConnectivityMonitor::new(
            true,
            Duration::from_millis(10),
            events.clone(),
        ));
        let manager = SyncManager::new(
            store.clone(),
            api,
            connectivity,
            events,
            FailurePolicy::Halt,
            Duration::from_secs(2),
        );
        let id = store
            .enqueue(NewAction::create(Resource::Room, json!({ "number": "A1" })))
            .unwrap()
            .id;

        let report = manager.drain().await;
        assert_eq!(report.completed(), 1);
        assert!(store.get(&id).unwrap().is_none());

        // Nothing left to resend.
        manager.drain().await;
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_slow_backend_times_out_as_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/complaints"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let api = ApiClient::new(&server.uri(), None, Duration::from_millis(100)).unwrap();
        let err = api
            .replay(&action(Operation::Create, Resource::Complaint, None))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Timeout(_)), "{err:?}");
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_network_error() {
        let api = ApiClient::new("http://127.0.0.1:9", None, Duration::from_secs(1)).unwrap();
        let err = api
            .replay(&action(Operation::Create, Resource::Room, None))
            .await
            .unwrap_err();
        assert!(err.is_retryable(), "{err:?}");
        assert!(!api.check_health().await);
    }

    #[tokio::test]
    async fn test_health_check() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/api/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        assert!(client(&server).check_health().await);
    }

    #[tokio::test]
    async fn test_notification_endpoints() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/notifications/preferences"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": { "whatsapp": false, "push": true, "invoice": true,
                          "payment_reminder": false, "complaint_update": true,
                          "announcement": true }
            })))
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/api/notifications/preferences"))
            .and(body_json(json!({ "payment_reminder": true })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/notifications/unread-count"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "count": 4 })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/notifications/push-tokens"))
            .and(body_json(json!({ "deviceId": "dev-1", "token": "tok-1", "platform": "web" })))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/api/notifications/push-tokens/dev-1"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let api = client(&server);
        let prefs = api.fetch_preferences().await.unwrap();
        assert!(!prefs.whatsapp);
        assert!(!prefs.payment_reminder);

        api.update_preference(PreferenceKey::PaymentReminder, true)
            .await
            .unwrap();
        assert_eq!(api.unread_count().await.unwrap(), 4);
        api.register_push_token("dev-1", "tok-1").await.unwrap();
        api.unregister_push_token("dev-1", "tok-1").await.unwrap();
    }
}
