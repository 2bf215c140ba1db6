//! `DocketServer`: the Axum HTTP + WebSocket surface.
//!
//! | Route                                   | Purpose                     |
//! |-----------------------------------------|-----------------------------|
//! | `GET /health`                           | liveness and counters       |
//! | `GET /metrics`                          | Prometheus text             |
//! | `GET /v1/sessions/{session_id}/stream`  | admission, then WebSocket   |
//! | `POST /v1/sessions/{session_id}/events` | producer ingest             |
//! | `DELETE /v1/sessions/{session_id}`      | dispose a session           |

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post};
use dashmap::DashMap;
use docket_core::constants::{
    LAST_ACKED_QUERY_PARAM, MODE_QUERY_PARAM, PROTOCOL_HEADER, PROTOCOL_QUERY_PARAM,
    RESUME_QUERY_PARAM, TOKEN_QUERY_PARAM,
};
use docket_core::{ConnectionId, SessionId};
use docket_events::{EventType, StreamError, StreamHub};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::admission::{AdmissionChain, AdmissionError, Admitted, ConnectionAttempt};
use crate::config::ServerConfig;
use crate::errors::ServerError;
use crate::health::{self, HealthResponse};
use crate::metrics::{ADMISSION_REJECTIONS_TOTAL, INGESTED_EVENTS_TOTAL, render};
use crate::mode::{ModeSelector, StreamMode};
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::{Connection, ConnectionHandler, ParkedConnections, StreamSource, TransitionCause};

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Session streams.
    pub hub: Arc<StreamHub>,
    /// Admission pipeline.
    pub admission: Arc<AdmissionChain>,
    /// Per-session live/mock resolution.
    pub modes: Arc<ModeSelector>,
    /// Connections awaiting resume.
    pub parked: Arc<ParkedConnections>,
    /// Connections currently holding a socket.
    pub connections: Arc<DashMap<ConnectionId, Arc<Connection>>>,
    /// One permit per streaming connection, taken before the upgrade.
    pub slots: Arc<Semaphore>,
    /// Runtime configuration.
    pub config: Arc<ServerConfig>,
    /// Shutdown coordinator.
    pub shutdown: ShutdownCoordinator,
    /// Prometheus handle, when a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
    /// When the server started.
    pub start_time: Instant,
}

/// What one idle-state sweep dropped.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Session streams.
    pub sessions: usize,
    /// Pinned session modes.
    pub modes: usize,
    /// Rate-limit buckets.
    pub buckets: usize,
}

impl AppState {
    /// Drop per-session and per-identity state that nothing needs any more.
    ///
    /// A mode stays pinned while its session has a connection (holding a
    /// socket or parked) or a live stream.
    pub fn sweep(&self) -> SweepStats {
        let sessions = self.hub.sweep_dormant().len();
        let mut in_use: HashSet<SessionId> = self
            .connections
            .iter()
            .map(|c| c.session_id().clone())
            .collect();
        in_use.extend(self.parked.session_ids());
        let modes = self
            .modes
            .retain(|session_id| in_use.contains(session_id) || self.hub.get(session_id).is_some());
        let buckets = self.admission.sweep_idle();
        let stats = SweepStats {
            sessions,
            modes,
            buckets,
        };
        if stats != SweepStats::default() {
            debug!(sessions, modes, buckets, "idle state swept");
        }
        stats
    }
}

/// The docket server.
pub struct DocketServer {
    state: AppState,
}

impl DocketServer {
    /// Assemble a server around `hub`.
    pub fn new(config: ServerConfig, admission: AdmissionChain, hub: Arc<StreamHub>) -> Self {
        let shutdown = ShutdownCoordinator::new();
        let parked = ParkedConnections::new(
            config.keepalive.grace_period,
            shutdown.tracker(),
            shutdown.token(),
        );
        let slots = Arc::new(Semaphore::new(
            config.max_connections.min(Semaphore::MAX_PERMITS),
        ));
        Self {
            state: AppState {
                hub,
                admission: Arc::new(admission),
                modes: Arc::new(ModeSelector::new(config.default_mode)),
                parked,
                connections: Arc::new(DashMap::new()),
                slots,
                config: Arc::new(config),
                shutdown,
                metrics: None,
                start_time: Instant::now(),
            },
        }
    }

    /// Serve `/metrics` from `handle`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.state.metrics = Some(handle);
        self
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/v1/sessions/{session_id}/stream", get(stream_handler))
            .route("/v1/sessions/{session_id}/events", post(ingest_handler))
            .route("/v1/sessions/{session_id}", delete(dispose_handler))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(self.state.clone())
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn listen(&self) -> Result<(SocketAddr, JoinHandle<()>), ServerError> {
        let addr = format!("{}:{}", self.state.config.host, self.state.config.port);
        let listener = TcpListener::bind(&addr).await?;
        let local_addr = listener.local_addr()?;
        let router = self.router();
        let token = self.state.shutdown.token();

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(token.cancelled_owned())
                .await
            {
                error!(error = %e, "server terminated with error");
            }
        });
        self.spawn_sweeper();
        info!(%local_addr, "docket server listening");
        Ok((local_addr, handle))
    }

    fn spawn_sweeper(&self) {
        let state = self.state.clone();
        let token = self.state.shutdown.token();
        let period = self.state.config.sweep_interval;
        let _ = self.state.shutdown.tracker().spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            let _ = ticker.tick().await;
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let _ = state.sweep();
                    }
                }
            }
        });
    }

    /// Signal shutdown and wait up to `timeout` for connections to drain.
    pub async fn shutdown(&self, timeout: Option<Duration>) -> bool {
        self.state.shutdown.graceful_shutdown(timeout).await
    }

    /// The session hub.
    pub fn hub(&self) -> &Arc<StreamHub> {
        &self.state.hub
    }

    /// Shared handler state.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Runtime configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.state.config
    }
}

// ─── Request parsing ────────────────────────────────────────────────────────

/// Assemble a [`ConnectionAttempt`] from path, query, and headers.
///
/// Headers take precedence over their query-parameter fallbacks.
pub fn parse_attempt(
    session_id: &str,
    params: &HashMap<String, String>,
    headers: &HeaderMap,
) -> Result<ConnectionAttempt, AdmissionError> {
    let session_id = SessionId::parse(session_id)
        .map_err(|e| AdmissionError::InvalidRequest(e.to_string()))?;

    let credential = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")))
        .map(|t| t.trim().to_owned())
        .or_else(|| params.get(TOKEN_QUERY_PARAM).cloned());

    let protocol_version = headers
        .get(PROTOCOL_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .or_else(|| params.get(PROTOCOL_QUERY_PARAM).cloned());

    let last_acked = params
        .get(LAST_ACKED_QUERY_PARAM)
        .map(|v| {
            v.parse::<u64>().map_err(|_| {
                AdmissionError::InvalidRequest(format!("{LAST_ACKED_QUERY_PARAM} must be an unsigned integer"))
            })
        })
        .transpose()?;

    let resume = params
        .get(RESUME_QUERY_PARAM)
        .map(|v| ConnectionId::parse(v).map_err(|e| AdmissionError::InvalidRequest(e.to_string())))
        .transpose()?;

    let requested_mode = params
        .get(MODE_QUERY_PARAM)
        .map(|v| {
            StreamMode::parse(v).ok_or_else(|| {
                AdmissionError::InvalidRequest(format!("{MODE_QUERY_PARAM} must be live or mock"))
            })
        })
        .transpose()?;

    Ok(ConnectionAttempt {
        session_id,
        credential,
        protocol_version,
        last_acked,
        resume,
        requested_mode,
    })
}

fn adopt_or_create(
    state: &AppState,
    attempt: &ConnectionAttempt,
    admitted: &Admitted,
    mode: StreamMode,
) -> (Arc<Connection>, bool) {
    if let Some(resume) = &attempt.resume {
        if let Some(connection) =
            state
                .parked
                .take(resume, &admitted.identity, &attempt.session_id)
        {
            let cursor = attempt
                .last_acked
                .unwrap_or_else(|| connection.last_acked());
            connection.reset_cursor(cursor);
            return (connection, true);
        }
        debug!(connection_id = %resume, "resume target not parked, starting fresh");
    }
    let connection = Connection::new(
        ConnectionId::new(),
        attempt.session_id.clone(),
        admitted.identity.clone(),
        admitted.protocol_version,
        mode,
        attempt.last_acked.unwrap_or(0),
    );
    (Arc::new(connection), false)
}

// ─── Handlers ───────────────────────────────────────────────────────────────

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.connections.len(),
        state.hub.session_count(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => render(handle).into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

/// GET /v1/sessions/{session_id}/stream
///
/// Admission runs before the upgrade is accepted, so a rejected attempt
/// gets a plain HTTP error and never sees a WebSocket.
async fn stream_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, ServerError> {
    let attempt = parse_attempt(&session_id, &params, &headers)?;
    // held by the connection task, so concurrent upgrades cannot overshoot
    let Ok(slot) = Arc::clone(&state.slots).try_acquire_owned() else {
        counter!(ADMISSION_REJECTIONS_TOTAL, "stage" => "capacity").increment(1);
        warn!(session_id = %attempt.session_id, "connection refused, server at capacity");
        return Err(AdmissionError::ServerBusy.into());
    };
    let admitted = state.admission.admit(&attempt)?;
    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => return Ok(rejection.into_response()),
    };

    let mode = state
        .modes
        .resolve(&attempt.session_id, attempt.requested_mode);
    let source = match mode {
        StreamMode::Live => StreamSource::Live(state.hub.session(&attempt.session_id)?),
        StreamMode::Mock => StreamSource::Mock(state.modes.mock_script(&attempt.session_id)),
    };
    let (connection, resumed) = adopt_or_create(&state, &attempt, &admitted, mode);
    let handler = ConnectionHandler::new(
        Arc::clone(&connection),
        source,
        resumed,
        state.config.keepalive,
        Arc::clone(&state.parked),
        state.shutdown.token(),
    );

    let registry = Arc::clone(&state.connections);
    let tracker = state.shutdown.tracker();
    let parked = Arc::clone(&state.parked);
    let failed = Arc::clone(&connection);
    Ok(upgrade
        .max_message_size(state.config.max_message_size)
        .on_failed_upgrade(move |e| {
            warn!(connection_id = %failed.id(), error = %e, "websocket upgrade failed");
            if resumed {
                parked.park(failed);
            } else {
                let _ = failed.close(TransitionCause::SocketDropped);
            }
        })
        .on_upgrade(move |socket| {
            tracker.track_future(async move {
                let _slot = slot;
                let id = connection.id().clone();
                let _ = registry.insert(id.clone(), connection);
                handler.run(socket).await;
                let _ = registry.remove(&id);
            })
        }))
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

/// Producer ingest body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct IngestRequest {
    #[serde(rename = "type")]
    event_type: EventType,
    #[serde(default = "empty_object")]
    data: Value,
}

/// Producer ingest result.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct IngestResponse {
    sequence: u64,
    #[serde(rename = "type")]
    event_type: EventType,
    session_id: SessionId,
}

/// POST /v1/sessions/{session_id}/events
async fn ingest_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(request): Json<IngestRequest>,
) -> Result<(StatusCode, Json<IngestResponse>), ServerError> {
    let attempt = parse_attempt(&session_id, &params, &headers)?;
    let identity = state.admission.authenticate(&attempt)?;
    if request.event_type == EventType::ResyncRequired {
        return Err(StreamError::encoding(
            EventType::ResyncRequired.as_str(),
            "resync_required is issued by the stream core, not producers",
        )
        .into());
    }
    let envelope = state
        .hub
        .emit(&attempt.session_id, request.event_type, request.data)?;
    counter!(INGESTED_EVENTS_TOTAL, "type" => request.event_type.as_str()).increment(1);
    debug!(
        session_id = %attempt.session_id,
        subject = %identity.subject,
        sequence = envelope.sequence_number(),
        "event ingested"
    );
    Ok((
        StatusCode::CREATED,
        Json(IngestResponse {
            sequence: envelope.sequence_number(),
            event_type: envelope.event_type(),
            session_id: attempt.session_id,
        }),
    ))
}

/// DELETE /v1/sessions/{session_id}
async fn dispose_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<StatusCode, ServerError> {
    let attempt = parse_attempt(&session_id, &params, &headers)?;
    let identity = state.admission.authenticate(&attempt)?;
    let had_mode = state.modes.get(&attempt.session_id).is_some();
    let disposed = state.hub.dispose(&attempt.session_id);
    state.modes.forget(&attempt.session_id);
    if !(disposed || had_mode) {
        return Err(ServerError::SessionNotFound(attempt.session_id));
    }
    info!(session_id = %attempt.session_id, subject = %identity.subject, "session disposed on request");
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use docket_events::{MemoryWatermarks, StreamConfig};
    use docket_settings::{AdmissionSettings, StaticToken};
    use serde_json::json;
    use tower::ServiceExt;

    fn make_server(config: ServerConfig) -> DocketServer {
        let admission = AdmissionChain::from_settings(&AdmissionSettings {
            tokens: vec![StaticToken {
                token: "good".into(),
                subject: "alice".into(),
            }],
            supported_versions: vec![1, 2],
            ..AdmissionSettings::default()
        });
        let hub = Arc::new(StreamHub::new(
            StreamConfig::default(),
            Arc::new(MemoryWatermarks::new()),
        ));
        DocketServer::new(config, admission, hub)
    }

    async fn body_json(resp: Response) -> Value {
        let bytes = axum::body::to_bytes(resp.into_body(), 64 * 1024).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_event(uri: &str, token: Option<&str>, body: &Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    #[test]
    fn parse_attempt_prefers_headers() {
        let mut headers = HeaderMap::new();
        let _ = headers.insert(header::AUTHORIZATION, "Bearer from-header".parse().unwrap());
        let _ = headers.insert(PROTOCOL_HEADER, "2".parse().unwrap());
        let params: HashMap<String, String> = [
            ("token", "from-query"),
            ("v", "1"),
            ("lastAckedSequence", "85"),
            ("mode", "mock"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .collect();

        let attempt = parse_attempt("job-1", &params, &headers).unwrap();
        assert_eq!(attempt.credential.as_deref(), Some("from-header"));
        assert_eq!(attempt.protocol_version.as_deref(), Some("2"));
        assert_eq!(attempt.last_acked, Some(85));
        assert_eq!(attempt.requested_mode, Some(StreamMode::Mock));
        assert_eq!(attempt.resume, None);
    }

    #[test]
    fn parse_attempt_rejects_bad_values() {
        let headers = HeaderMap::new();
        let params = |k: &str, v: &str| HashMap::from([(k.to_owned(), v.to_owned())]);
        assert!(parse_attempt("bad id!", &HashMap::new(), &headers).is_err());
        assert!(parse_attempt("s", &params("lastAckedSequence", "-3"), &headers).is_err());
        assert!(parse_attempt("s", &params("mode", "replay"), &headers).is_err());
        assert!(parse_attempt("s", &params("resume", "bad id!"), &headers).is_err());
    }

    #[tokio::test]
    async fn health_endpoint_reports_counts() {
        let server = make_server(ServerConfig::default());
        let _ = server.hub().session(&SessionId::parse("a").unwrap()).unwrap();
        let resp = server.router().oneshot(get_req("/health")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["connections"], 0);
        assert_eq!(body["sessions"], 1);
    }

    #[tokio::test]
    async fn metrics_without_recorder_is_404() {
        let server = make_server(ServerConfig::default());
        let resp = server.router().oneshot(get_req("/metrics")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn stream_without_credential_is_401() {
        let server = make_server(ServerConfig::default());
        let resp = server
            .router()
            .oneshot(get_req("/v1/sessions/job-1/stream?v=1"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(resp).await["code"], "AUTH_FAILED");
    }

    #[tokio::test]
    async fn stream_with_old_version_is_426() {
        let server = make_server(ServerConfig::default());
        let resp = server
            .router()
            .oneshot(get_req("/v1/sessions/job-1/stream?token=good&v=0"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UPGRADE_REQUIRED);
        assert_eq!(body_json(resp).await["minimumVersion"], 1);
    }

    #[tokio::test]
    async fn admitted_plain_http_gets_upgrade_rejection() {
        let server = make_server(ServerConfig::default());
        let resp = server
            .router()
            .oneshot(get_req("/v1/sessions/job-1/stream?token=good&v=2"))
            .await
            .unwrap();
        assert!(resp.status().is_client_error());
        assert_ne!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn at_capacity_is_503() {
        let server = make_server(ServerConfig {
            max_connections: 0,
            ..ServerConfig::default()
        });
        let resp = server
            .router()
            .oneshot(get_req("/v1/sessions/job-1/stream?token=good&v=2"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn held_slots_refuse_further_streams() {
        let server = make_server(ServerConfig {
            max_connections: 1,
            ..ServerConfig::default()
        });
        let held = Arc::clone(&server.state().slots).try_acquire_owned().unwrap();
        let resp = server
            .router()
            .oneshot(get_req("/v1/sessions/job-1/stream?token=good&v=2"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        // a refused or failed upgrade hands its slot straight back
        drop(held);
        let resp = server
            .router()
            .oneshot(get_req("/v1/sessions/job-1/stream?token=good&v=2"))
            .await
            .unwrap();
        assert_ne!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(server.state().slots.available_permits(), 1);
    }

    #[tokio::test]
    async fn sweep_forgets_idle_sessions_and_modes() {
        let server = make_server(ServerConfig::default());
        let state = server.state();
        let idle = SessionId::parse("idle").unwrap();
        let busy = SessionId::parse("busy").unwrap();
        let _ = state.modes.resolve(&idle, Some(StreamMode::Live));
        let _ = state.hub.session(&idle).unwrap();
        let _ = state.modes.resolve(&busy, Some(StreamMode::Live));
        let _ = state.hub.emit(&busy, EventType::Heartbeat, json!({})).unwrap();

        let stats = state.sweep();
        assert_eq!(stats.sessions, 1);
        assert_eq!(stats.modes, 1);
        assert!(state.hub.get(&idle).is_none());
        assert_eq!(state.modes.get(&idle), None);
        assert_eq!(state.modes.get(&busy), Some(StreamMode::Live));
    }

    #[tokio::test]
    async fn sweep_keeps_modes_of_connected_mock_sessions() {
        let server = make_server(ServerConfig::default());
        let state = server.state();
        let demo = SessionId::parse("demo").unwrap();
        let _ = state.modes.resolve(&demo, Some(StreamMode::Mock));
        let connection = Arc::new(Connection::new(
            ConnectionId::new(),
            demo.clone(),
            crate::admission::Identity {
                subject: "alice".into(),
                method: crate::admission::AuthMethod::StaticToken,
            },
            2,
            StreamMode::Mock,
            0,
        ));
        let _ = state.connections.insert(connection.id().clone(), connection);

        assert_eq!(state.sweep().modes, 0);
        assert_eq!(state.modes.get(&demo), Some(StreamMode::Mock));
        state.connections.clear();
        assert_eq!(state.sweep().modes, 1);
    }

    #[tokio::test]
    async fn bad_cursor_is_400() {
        let server = make_server(ServerConfig::default());
        let resp = server
            .router()
            .oneshot(get_req("/v1/sessions/job-1/stream?token=good&v=2&lastAckedSequence=x"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn ingest_assigns_sequences() {
        let server = make_server(ServerConfig::default());
        let app = server.router();
        let body = json!({"type": "status", "data": {"stage": "ingest", "state": "running"}});
        for expected in 1..=2 {
            let resp = app
                .clone()
                .oneshot(post_event("/v1/sessions/job-1/events", Some("good"), &body))
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::CREATED);
            let json = body_json(resp).await;
            assert_eq!(json["sequence"], expected);
            assert_eq!(json["type"], "status");
        }
    }

    #[tokio::test]
    async fn ingest_heartbeat_without_data() {
        let server = make_server(ServerConfig::default());
        let resp = server
            .router()
            .oneshot(post_event("/v1/sessions/job-1/events", Some("good"), &json!({"type": "heartbeat"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn ingest_rejects_malformed_payload_and_keeps_numbering() {
        let server = make_server(ServerConfig::default());
        let app = server.router();
        let bad = json!({"type": "progress", "data": {"stage": "x", "percent": 140.0}});
        let resp = app
            .clone()
            .oneshot(post_event("/v1/sessions/job-1/events", Some("good"), &bad))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body_json(resp).await["code"], "ENCODING_ERROR");

        let good = json!({"type": "progress", "data": {"stage": "x", "percent": 40.0}});
        let resp = app
            .oneshot(post_event("/v1/sessions/job-1/events", Some("good"), &good))
            .await
            .unwrap();
        assert_eq!(body_json(resp).await["sequence"], 1);
    }

    #[tokio::test]
    async fn ingest_refuses_resync_and_anonymous() {
        let server = make_server(ServerConfig::default());
        let app = server.router();
        let resync = json!({"type": "resync_required", "data": {"lastAcked": 1, "oldestRetained": 5, "latestSequence": 9}});
        let resp = app
            .clone()
            .oneshot(post_event("/v1/sessions/job-1/events", Some("good"), &resync))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let resp = app
            .oneshot(post_event("/v1/sessions/job-1/events", None, &json!({"type": "heartbeat"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn dispose_then_not_found() {
        let server = make_server(ServerConfig::default());
        let _ = server
            .hub()
            .emit(&SessionId::parse("job-1").unwrap(), EventType::Heartbeat, json!({}))
            .unwrap();
        let app = server.router();
        let delete_req = || {
            Request::builder()
                .method("DELETE")
                .uri("/v1/sessions/job-1")
                .header(header::AUTHORIZATION, "Bearer good")
                .body(Body::empty())
                .unwrap()
        };
        let resp = app.clone().oneshot(delete_req()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert_eq!(server.hub().session_count(), 0);
        let resp = app.oneshot(delete_req()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let server = make_server(ServerConfig::default());
        let resp = server.router().oneshot(get_req("/nope")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
