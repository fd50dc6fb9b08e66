//! HTTP and WebSocket surface.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, SecondsFormat, Utc};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::RemoteError;
use crate::hub::ClientSink;
use crate::model::{ControlReport, PlayerSnapshot, SeekRequest};
use crate::remote::Remote;
use crate::volume::{self, VolumeRequest};

// ------------------------- State -------------------------

/// Fixed facts reported by `/healthz` and used by the token check.
#[derive(Debug)]
pub struct ServerInfo {
    pub version: String,
    pub token: Option<String>,
    started: DateTime<Utc>,
    started_at: Instant,
}

impl ServerInfo {
    #[must_use]
    pub fn new(version: impl Into<String>, token: Option<String>) -> Self {
        Self {
            version: version.into(),
            token: token.filter(|t| !t.is_empty()),
            started: Utc::now(),
            started_at: Instant::now(),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    remote: Arc<Remote>,
    info: Arc<ServerInfo>,
    cancel: CancellationToken,
}

impl AppState {
    #[must_use]
    pub fn new(remote: Arc<Remote>, info: ServerInfo, cancel: CancellationToken) -> Self {
        Self {
            remote,
            info: Arc::new(info),
            cancel,
        }
    }
}

pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/players", get(players))
        .route("/player/status", get(status))
        .route("/nowplaying", get(status))
        .route("/player/playpause", get(play_pause).post(play_pause))
        .route("/player/next", get(next).post(next))
        .route("/player/prev", get(previous).post(previous))
        .route("/player/seek", post(seek))
        .route("/volume", get(volume_get).post(volume_set))
        .route("/art/:key", get(art))
        .route("/ws", get(ws))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_token));

    Router::new()
        .route("/healthz", get(health))
        .merge(protected)
        .layer(middleware::from_fn(log_request))
        .with_state(state)
}

// ------------------------- Middleware -------------------------

async fn log_request(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let start = Instant::now();
    let resp = next.run(req).await;
    info!(%method, %path, status = resp.status().as_u16(), elapsed = ?start.elapsed(), "request");
    resp
}

async fn require_token(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let Some(expected) = state.info.token.as_deref() else {
        return next.run(req).await;
    };
    if presented_token(req.headers(), req.uri().query()).as_deref() == Some(expected) {
        return next.run(req).await;
    }
    (StatusCode::UNAUTHORIZED, "unauthorized").into_response()
}

/// `Authorization: Bearer`, then `X-Remote-Token`, then `?token=`.
fn presented_token(headers: &HeaderMap, query: Option<&str>) -> Option<String> {
    let header_value = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
    };
    if let Some(token) = header_value(header::AUTHORIZATION.as_str())
        .and_then(|auth| auth.strip_prefix("Bearer "))
        .filter(|t| !t.is_empty())
    {
        return Some(token.to_string());
    }
    if let Some(token) = header_value("x-remote-token") {
        return Some(token.to_string());
    }
    url::form_urlencoded::parse(query?.as_bytes())
        .find(|(key, value)| key == "token" && !value.is_empty())
        .map(|(_, value)| value.into_owned())
}

// ------------------------- Errors -------------------------

struct ApiError {
    status: StatusCode,
    message: String,
}

impl From<RemoteError> for ApiError {
    fn from(err: RemoteError) -> Self {
        if err.is_selection() {
            Self {
                status: StatusCode::BAD_REQUEST,
                message: format!("select player: {err}"),
            }
        } else {
            Self {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                message: err.to_string(),
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, self.message).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

// ------------------------- Handlers -------------------------

#[derive(Debug, Default, Deserialize)]
struct PlayerQuery {
    #[serde(default)]
    player: Option<String>,
}

impl PlayerQuery {
    fn reference(&self) -> Option<&str> {
        self.player.as_deref().filter(|p| !p.is_empty())
    }
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    version: String,
    host: String,
    uptime: String,
    started: String,
    now: String,
    requires_token: bool,
}

async fn health(State(state): State<AppState>) -> Json<Health> {
    let info = &state.info;
    let host = nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_default();
    Json(Health {
        status: "ok",
        version: info.version.clone(),
        host,
        uptime: format_uptime(info.started_at.elapsed()),
        started: info.started.to_rfc3339_opts(SecondsFormat::Secs, true),
        now: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        requires_token: info.token.is_some(),
    })
}

fn format_uptime(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let (h, m, s) = (secs / 3600, (secs / 60) % 60, secs % 60);
    let millis = elapsed.subsec_millis();
    if h > 0 {
        format!("{h}h{m}m{s}.{millis:03}s")
    } else if m > 0 {
        format!("{m}m{s}.{millis:03}s")
    } else {
        format!("{s}.{millis:03}s")
    }
}

async fn players(State(state): State<AppState>) -> Response {
    match state.remote.list_players().await {
        Ok(players) => Json(players).into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("list players: {err}"),
        )
            .into_response(),
    }
}

async fn status(
    State(state): State<AppState>,
    Query(query): Query<PlayerQuery>,
) -> ApiResult<PlayerSnapshot> {
    let player = state.remote.resolve(query.reference()).await?;
    Ok(Json(player))
}

async fn play_pause(
    State(state): State<AppState>,
    Query(query): Query<PlayerQuery>,
) -> ApiResult<ControlReport> {
    Ok(Json(state.remote.play_pause(query.reference()).await?))
}

async fn next(
    State(state): State<AppState>,
    Query(query): Query<PlayerQuery>,
) -> ApiResult<ControlReport> {
    Ok(Json(state.remote.next(query.reference()).await?))
}

async fn previous(
    State(state): State<AppState>,
    Query(query): Query<PlayerQuery>,
) -> ApiResult<ControlReport> {
    Ok(Json(state.remote.previous(query.reference()).await?))
}

async fn seek(
    State(state): State<AppState>,
    Query(query): Query<PlayerQuery>,
    Json(request): Json<SeekRequest>,
) -> ApiResult<ControlReport> {
    Ok(Json(state.remote.seek(query.reference(), request).await?))
}

async fn volume_get() -> Response {
    match volume::get().await {
        Ok(state) => Json(state).into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}")).into_response(),
    }
}

async fn volume_set(Json(request): Json<VolumeRequest>) -> Response {
    if request.is_empty() {
        return (StatusCode::BAD_REQUEST, "provide absolute, delta, or mute").into_response();
    }
    match volume::set(request).await {
        Ok(state) => Json(state).into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}")).into_response(),
    }
}

async fn art(State(state): State<AppState>, Path(key): Path<String>) -> Response {
    match state.remote.art().serve(&key).await {
        Ok(cached) => (
            [
                (header::CONTENT_TYPE, cached.content_type),
                (header::CACHE_CONTROL, "public, max-age=86400"),
            ],
            cached.bytes,
        )
            .into_response(),
        Err(err) => {
            debug!(%key, %err, "art lookup failed");
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

// ------------------------- WebSocket -------------------------

async fn ws(
    State(state): State<AppState>,
    Query(query): Query<PlayerQuery>,
    upgrade: WebSocketUpgrade,
) -> Response {
    let filter = query.reference().map(str::to_string);
    upgrade.on_upgrade(move |socket| client_session(state, socket, filter))
}

struct WsSink {
    sender: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl ClientSink for WsSink {
    async fn send(&mut self, payload: String) -> anyhow::Result<()> {
        self.sender.send(Message::Text(payload)).await?;
        Ok(())
    }

    async fn close(&mut self) {
        let _ = self.sender.close().await;
    }
}

/// The hub owns the write half; this task only watches for the peer leaving.
async fn client_session(state: AppState, socket: WebSocket, filter: Option<String>) {
    let (sender, mut receiver) = socket.split();
    let hub = state.remote.hub();
    let client = match hub
        .register(state.remote.as_ref(), filter, Box::new(WsSink { sender }))
        .await
    {
        Ok(client) => client,
        Err(err) => {
            warn!(%err, "ws initial send failed");
            return;
        }
    };

    loop {
        tokio::select! {
            () = state.cancel.cancelled() => break,
            msg = receiver.next() => match msg {
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    hub.unregister(client.id()).await;
}
