//! Control HTTP surface (C5): the axum router exposing webhook ingestion,
//! call control commands, session/event queries, and a health check.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::error::CoreError;
use crate::events::{parse_timestamp_boundary, Component, EventEmitter, EventQuery, EventStoreStats};
use crate::session::{Session, SessionRegistry};
use crate::telephony::RoomService;
use crate::webhook::{verify_signature, WebhookIngester};

pub struct AppState {
    pub sessions: SessionRegistry,
    pub emitter: EventEmitter,
    pub webhook_ingester: WebhookIngester,
    pub room_service: Arc<dyn RoomService>,
    pub webhook_secret: String,
    pub event_stats: Box<dyn Fn() -> EventStoreStats + Send + Sync>,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhook", post(webhook))
        .route("/control/call/hangup", post(hangup))
        .route("/control/sessions", get(list_sessions))
        .route("/control/sessions/:session_id", get(get_session))
        .route("/control/sessions/:session_id/events", get(get_session_events))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let (status, detail) = match &self {
            CoreError::SessionNotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            CoreError::InvalidFilter(_) | CoreError::InvalidPayload(_) | CoreError::InvalidTimestamp(_) => {
                (StatusCode::BAD_REQUEST, self.to_string())
            }
            CoreError::Unauthorized | CoreError::Jwt(_) => {
                (StatusCode::UNAUTHORIZED, "unauthorized".to_string())
            }
            // Provider errors reach the caller only through the hangup
            // endpoint (§4.7); 502 matches "delete room" failing upstream.
            CoreError::Provider(_) => (StatusCode::BAD_GATEWAY, "hangup_failed".to_string()),
            // Unexpected internal failures never leak details (§7).
            CoreError::Configuration(_) | CoreError::Http(_) | CoreError::Json(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error".to_string())
            }
        };
        (status, Json(ErrorBody { detail })).into_response()
    }
}

#[derive(Serialize)]
struct ErrorBody {
    detail: String,
}

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
    events: EventStoreStats,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthBody {
        status: "ok",
        events: (state.event_stats)(),
    })
}

#[derive(Serialize)]
struct WebhookResponse {
    status: &'static str,
}

async fn webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> std::result::Result<Json<WebhookResponse>, CoreError> {
    let token = headers
        .get("authorization")
        .or_else(|| headers.get("x-webhook-signature"))
        .and_then(|v| v.to_str().ok())
        .ok_or(CoreError::Unauthorized)?;

    verify_signature(&state.webhook_secret, &body, token).map_err(|_| CoreError::Unauthorized)?;

    state.webhook_ingester.handle(&body)?;
    Ok(Json(WebhookResponse { status: "ok" }))
}

#[derive(Deserialize)]
pub struct HangupRequest {
    pub session_id: String,
    /// Why the call is ending, e.g. `"user_silence_timeout"` or
    /// `"max_duration_reached"`, set by the Observer when it is the one
    /// requesting the hangup. Defaults to `"control.hangup"` for an
    /// operator-initiated command.
    pub reason: Option<String>,
}

#[derive(Serialize)]
pub struct HangupResponse {
    pub status: &'static str,
}

fn new_correlation_id() -> String {
    format!("cmd_{}", chrono::Utc::now().timestamp_millis())
}

async fn hangup(
    State(state): State<Arc<AppState>>,
    Json(req): Json<HangupRequest>,
) -> std::result::Result<Json<HangupResponse>, CoreError> {
    let correlation_id = new_correlation_id();

    state.emitter.emit(
        "control.command_received",
        &req.session_id,
        crate::events::Severity::Info,
        Some(&correlation_id),
        None,
        crate::events::Fields::new().set("command", "call.hangup").build(),
    );

    // No session lookup here: the room name is the session id by convention
    // (§4.7), and delete_room must be attempted even for a session this
    // registry never learned about (e.g. a race with room_finished).
    let reason = req.reason.clone().unwrap_or_else(|| "control.hangup".to_string());

    match state.room_service.delete_room(&req.session_id).await {
        Ok(()) => {
            state.emitter.emit(
                "control.command_applied",
                &req.session_id,
                crate::events::Severity::Info,
                Some(&correlation_id),
                None,
                crate::events::Fields::new()
                    .set("command", "call.hangup")
                    .set("result", "ok")
                    .build(),
            );
            let _ = state.sessions.end(&req.session_id, &reason);
            info!(session_id = %req.session_id, "hangup applied");
            Ok(Json(HangupResponse { status: "ok" }))
        }
        Err(e) => {
            state.emitter.emit(
                "control.command_applied",
                &req.session_id,
                crate::events::Severity::Error,
                Some(&correlation_id),
                None,
                crate::events::Fields::new()
                    .set("command", "call.hangup")
                    .set("result", "error")
                    .set("error_class", "RoomServiceError")
                    .build(),
            );
            error!(session_id = %req.session_id, error = %e, "hangup failed");
            Err(CoreError::Provider("hangup_failed".to_string()))
        }
    }
}

#[derive(Deserialize)]
pub struct ListSessionsParams {
    pub state: Option<String>,
    pub direction: Option<String>,
}

async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListSessionsParams>,
) -> std::result::Result<Json<Vec<Session>>, CoreError> {
    let sessions = state
        .sessions
        .list(params.state.as_deref(), params.direction.as_deref())?;
    Ok(Json(sessions))
}

async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> std::result::Result<Json<Session>, CoreError> {
    Ok(Json(state.sessions.get(&session_id)?))
}

#[derive(Deserialize)]
pub struct EventQueryParams {
    pub event_type: Option<String>,
    pub component: Option<String>,
    pub since: Option<String>,
    pub until: Option<String>,
    pub limit: Option<usize>,
}

async fn get_session_events(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Query(params): Query<EventQueryParams>,
) -> std::result::Result<Json<Vec<serde_json::Value>>, CoreError> {
    // Confirm the session exists before querying its events (404 beats an
    // empty 200 for a typo'd id).
    state.sessions.get(&session_id)?;

    let component = match params.component.as_deref() {
        Some("control_plane") => Some(Component::ControlPlane),
        Some("voice_pipeline") => Some(Component::VoicePipeline),
        Some("adapter") => Some(Component::Adapter),
        Some("action_runner") => Some(Component::ActionRunner),
        Some(other) => return Err(CoreError::InvalidFilter(other.to_string())),
        None => None,
    };

    let since = match params.since.as_deref() {
        Some(s) => Some(
            parse_timestamp_boundary(s)
                .ok_or_else(|| CoreError::InvalidTimestamp(s.to_string()))?,
        ),
        None => None,
    };
    let until = match params.until.as_deref() {
        Some(s) => Some(
            parse_timestamp_boundary(s)
                .ok_or_else(|| CoreError::InvalidTimestamp(s.to_string()))?,
        ),
        None => None,
    };

    let query = EventQuery {
        session_id: Some(session_id),
        event_type: params.event_type,
        component,
        since,
        until,
        limit: params.limit,
    };

    let events = state
        .emitter
        .store_ref()
        .query(&query)
        .into_iter()
        .map(|e| e.to_json())
        .collect();

    Ok(Json(events))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventStore;
    use crate::session::Direction;
    use crate::telephony::mocks::MockRoomService;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    fn test_app(room_service: Arc<MockRoomService>) -> (Arc<EventStore>, Router) {
        let sessions = SessionRegistry::new();
        let store = Arc::new(EventStore::new(10_000));
        let emitter = EventEmitter::new(Component::ControlPlane, store.clone());
        let webhook_ingester = WebhookIngester::new(sessions.clone(), emitter.clone());
        let stats_store = store.clone();

        let state = Arc::new(AppState {
            sessions,
            emitter,
            webhook_ingester,
            room_service,
            webhook_secret: "test-secret".to_string(),
            event_stats: Box::new(move || stats_store.stats()),
        });
        (store, build_router(state))
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn hangup_success_ends_session_with_threaded_reason_and_emits_command_events() {
        let room_service = Arc::new(MockRoomService::default());
        let (store, app) = test_app(room_service.clone());

        let body = serde_json::json!({"session_id": "room-1", "reason": "user_silence_timeout"});
        let request = Request::builder()
            .method("POST")
            .uri("/control/call/hangup")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "ok");

        assert_eq!(room_service.deleted.lock().unwrap().as_slice(), ["room-1"]);

        let events = store.query(&EventQuery {
            session_id: Some("room-1".to_string()),
            ..Default::default()
        });
        let event_types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(
            event_types,
            vec!["control.command_received", "control.command_applied"]
        );
        assert_eq!(
            events[1].fields.get("result").and_then(|v| v.as_str()),
            Some("ok")
        );
    }

    #[tokio::test]
    async fn hangup_failure_returns_502_and_emits_error_result() {
        let room_service = Arc::new(MockRoomService::default());
        room_service
            .fail
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let (store, app) = test_app(room_service);

        let body = serde_json::json!({"session_id": "room-2"});
        let request = Request::builder()
            .method("POST")
            .uri("/control/call/hangup")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let json = body_json(response).await;
        assert_eq!(json["detail"], "hangup_failed");

        let events = store.query(&EventQuery {
            session_id: Some("room-2".to_string()),
            event_type: Some("control.command_applied".to_string()),
            ..Default::default()
        });
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].fields.get("result").and_then(|v| v.as_str()),
            Some("error")
        );
    }

    #[tokio::test]
    async fn hangup_does_not_require_a_registered_session() {
        // §4.7: session_id is the room name by convention; delete_room must
        // be attempted even for a session this registry never learned about.
        let room_service = Arc::new(MockRoomService::default());
        let (_store, app) = test_app(room_service.clone());

        let body = serde_json::json!({"session_id": "unregistered-room"});
        let request = Request::builder()
            .method("POST")
            .uri("/control/call/hangup")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            room_service.deleted.lock().unwrap().as_slice(),
            ["unregistered-room"]
        );
    }

    /// Builds app state around a registry that already has `session_id`
    /// registered, since `get_session_events` 404s on an unknown session.
    fn test_app_with_session(
        room_service: Arc<MockRoomService>,
        session_id: &str,
    ) -> (Arc<EventStore>, Router) {
        let sessions = SessionRegistry::new();
        sessions.create(session_id, Direction::Inbound);
        let store = Arc::new(EventStore::new(10_000));
        let emitter = EventEmitter::new(Component::ControlPlane, store.clone());
        let webhook_ingester = WebhookIngester::new(sessions.clone(), emitter.clone());
        let stats_store = store.clone();
        let state = Arc::new(AppState {
            sessions,
            emitter,
            webhook_ingester,
            room_service,
            webhook_secret: "test-secret".to_string(),
            event_stats: Box::new(move || stats_store.stats()),
        });
        (store, build_router(state))
    }

    #[tokio::test]
    async fn session_events_filter_by_event_type_and_limit() {
        let room_service = Arc::new(MockRoomService::default());
        let (store, app) = test_app_with_session(room_service, "sess-9");
        let emitter = EventEmitter::new(Component::ControlPlane, store.clone());
        emitter.call_started("sess-9", "inbound");
        emitter.call_answered("sess-9");
        emitter.call_ended("sess-9", "participant_left");

        let request = Request::builder()
            .method("GET")
            .uri("/control/sessions/sess-9/events?event_type=call.started")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        let events = json.as_array().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["event_type"], "call.started");

        let limited = Request::builder()
            .method("GET")
            .uri("/control/sessions/sess-9/events?limit=2")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(limited).await.unwrap();
        let json = body_json(response).await;
        assert_eq!(json.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn session_events_rejects_invalid_since_with_400() {
        let room_service = Arc::new(MockRoomService::default());
        let (_store, app) = test_app_with_session(room_service, "sess-11");

        let request = Request::builder()
            .method("GET")
            .uri("/control/sessions/sess-11/events?since=not-a-timestamp")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert!(json["detail"].as_str().unwrap().contains("not-a-timestamp"));
    }

    #[tokio::test]
    async fn session_events_404s_on_unknown_session() {
        let room_service = Arc::new(MockRoomService::default());
        let (_store, app) = test_app(room_service);

        let request = Request::builder()
            .method("GET")
            .uri("/control/sessions/does-not-exist/events")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
