use std::{net::SocketAddr, sync::Arc};

use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        DefaultBodyLimit, Path, Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tokio::{
    net::TcpListener,
    sync::oneshot,
    task::{JoinError, JoinHandle},
};
use uuid::Uuid;

use crate::{
    controller::{LaunchRequest, TestStart},
    reaper,
    testrun::{Callback, OutputEvent, Subscription, TestOptions, TestOutcome},
    tunnel::{self, Channel},
    Controller, ControllerConfig, ControllerError, StartupError,
};

/// Upper bound on an uploaded test archive.
pub const MAX_ARCHIVE_BYTES: usize = 64 * 1024 * 1024;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) controller: Arc<Controller>,
}

pub struct ServerHandle {
    addr: SocketAddr,
    controller: Arc<Controller>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
    reaper: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn controller(&self) -> &Arc<Controller> {
        &self.controller
    }

    /// Resolves only if the idle reaper task ends, which it never does while healthy.
    pub async fn reaper_stopped(&mut self) -> Result<(), JoinError> {
        match self.reaper.as_mut() {
            Some(reaper) => {
                let result = reaper.await;
                self.reaper = None;
                result
            }
            None => std::future::pending().await,
        }
    }

    /// Stops accepting requests, kills every instance and waits for the server to finish.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(reaper) = self.reaper.take() {
            reaper.abort();
        }
        self.controller.shutdown().await;
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if let Some(reaper) = self.reaper.take() {
            reaper.abort();
        }
    }
}

pub async fn start_server(config: ControllerConfig) -> Result<ServerHandle, StartupError> {
    let bind_addr = config.listen_addr;
    let controller = Arc::new(Controller::new(config)?);

    let listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|source| StartupError::Bind {
            addr: bind_addr,
            source,
        })?;
    let addr = listener
        .local_addr()
        .map_err(|source| StartupError::Bind {
            addr: bind_addr,
            source,
        })?;

    let reaper = reaper::spawn(Arc::clone(&controller));
    let app = build_app(AppState {
        controller: Arc::clone(&controller),
    });

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
        {
            tracing::error!("http server failed: {err}");
        }
    });

    Ok(ServerHandle {
        addr,
        controller,
        shutdown_tx: Some(shutdown_tx),
        task: Some(task),
        reaper: Some(reaper),
    })
}

fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/launch", post(launch))
        .route("/:id/ping", post(ping))
        .route("/:id/kill", post(kill))
        .route("/:id/ws/phone", get(phone_ws))
        .route("/:id/ws/vnc", get(vnc_ws))
        .route(
            "/:id/test",
            post(start_test).layer(DefaultBodyLimit::max(MAX_ARCHIVE_BYTES)),
        )
        .route("/:id/test/output", get(test_output))
        .route("/:id/test/kill", post(kill_test))
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = state.controller.render_metrics().await;
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}

async fn launch(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<LaunchRequest>,
) -> Result<Response, ControllerError> {
    let launched = state
        .controller
        .launch(credential(&headers), request)
        .await
        .inspect_err(|err| tracing::warn!("launch rejected: {err}"))?;
    Ok(Json(launched).into_response())
}

async fn ping(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ControllerError> {
    let id = parse_id(&id)?;
    let alive = state.controller.ping(id).await;
    Ok(Json(json!({ "alive": alive })).into_response())
}

async fn kill(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ControllerError> {
    let id = parse_id(&id)?;
    state.controller.kill(id).await;
    Ok(ok())
}

async fn phone_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ControllerError> {
    let id = parse_id(&id)?;
    Ok(tunnel::upgrade(state.controller, id, Channel::Phone, ws).await)
}

async fn vnc_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ControllerError> {
    let id = parse_id(&id)?;
    Ok(tunnel::upgrade(state.controller, id, Channel::Vnc, ws).await)
}

#[derive(Debug, Default, Deserialize)]
struct TestQuery {
    callback_url: Option<String>,
    token: Option<String>,
    #[serde(default)]
    debug: bool,
    #[serde(default)]
    update: bool,
}

async fn start_test(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<TestQuery>,
    headers: HeaderMap,
    archive: Bytes,
) -> Result<Response, ControllerError> {
    let id = parse_id(&id)?;
    let callback = match (query.callback_url, query.token) {
        (Some(url), Some(token)) if !url.is_empty() && !token.is_empty() => {
            Some(Callback { url, token })
        }
        _ => None,
    };
    let options = TestOptions {
        debug: query.debug,
        update: query.update,
    };

    let started = state
        .controller
        .start_test(id, credential(&headers), archive, callback, options)
        .await?;
    let status = match started {
        TestStart::Started => "started",
        TestStart::Running => "running",
    };
    Ok(Json(json!({ "status": status })).into_response())
}

async fn test_output(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ControllerError> {
    let id = parse_id(&id)?;
    let subscription = state.controller.test_output(id).await?;
    Ok(ws.on_upgrade(move |socket| stream_output(socket, subscription)))
}

async fn kill_test(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ControllerError> {
    let id = parse_id(&id)?;
    state.controller.kill_test(id).await;
    Ok(ok())
}

async fn stream_output(mut socket: WebSocket, subscription: Option<Subscription>) {
    match subscription {
        Some(mut subscription) => {
            while let Some(event) = subscription.next().await {
                let text = match event {
                    OutputEvent::Line(line) => line,
                    OutputEvent::End(outcome) => end_marker(Some(outcome)),
                };
                if socket.send(Message::Text(text)).await.is_err() {
                    return;
                }
            }
        }
        None => {
            if socket.send(Message::Text(end_marker(None))).await.is_err() {
                return;
            }
        }
    }
    let _ = socket.close().await;
}

fn end_marker(outcome: Option<TestOutcome>) -> String {
    let mut marker = json!({ "end": true });
    if let Some(outcome) = outcome {
        marker["result"] = outcome.status().into();
        if let Some(code) = outcome.code() {
            marker["code"] = code.into();
        }
    }
    marker.to_string()
}

fn credential(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
}

/// Ids that are not UUIDs cannot name an instance.
fn parse_id(raw: &str) -> Result<Uuid, ControllerError> {
    raw.parse().map_err(|_| ControllerError::UnknownInstance)
}

fn ok() -> Response {
    Json(json!({ "status": "ok" })).into_response()
}
