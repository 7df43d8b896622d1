//! The platform HTTP surface.
//!
//! | Path | Purpose |
//! |------|---------|
//! | `/` | liveness text |
//! | `/api/plugins` | enabled remote frontend plugin manifest |
//! | `/.well-known/jwks.json` | service-token public keys |
//! | `/api/openapi.json` | aggregated OpenAPI (gated by `applications.manage`) |
//! | `/api/signals/ws` | realtime signal WebSocket |
//! | `/api/{plugin_id}/*` | dispatch to the plugin's registered router |

use std::sync::Arc;

use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, Request, StatusCode, Uri};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{any, get};
use axum::Router;
use tower::ServiceExt;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::auth::{Authenticator, Caller, JwksSource};
use crate::error::AppError;
use crate::lifecycle::PluginHost;
use crate::openapi;

/// Shared state of the platform routes.
#[derive(Clone)]
pub struct PlatformState {
    pub host: Arc<PluginHost>,
    pub authenticator: Arc<dyn Authenticator>,
    pub jwks: Arc<dyn JwksSource>,
}

/// Assemble the platform router.
pub fn platform_router(state: PlatformState) -> Router {
    let cors = match state.host.config().base_url.parse::<axum::http::HeaderValue>() {
        Ok(origin) => CorsLayer::new()
            .allow_origin(origin)
            .allow_methods(tower_http::cors::Any)
            .allow_headers(tower_http::cors::Any),
        Err(_) => CorsLayer::permissive(),
    };

    Router::new()
        .route("/", get(liveness))
        .route("/api/plugins", get(frontend_manifest))
        .route("/.well-known/jwks.json", get(jwks))
        .route("/api/openapi.json", get(openapi_spec))
        .route("/api/signals/ws", get(signals_ws))
        .route("/api/{plugin_id}", any(dispatch_plugin_root))
        .route("/api/{plugin_id}/{*rest}", any(dispatch_plugin))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn liveness() -> &'static str {
    "OK"
}

async fn frontend_manifest(
    State(state): State<PlatformState>,
) -> Result<Json<Vec<serde_json::Value>>, AppError> {
    Ok(Json(state.host.frontend_manifest().await?))
}

async fn jwks(State(state): State<PlatformState>) -> Json<serde_json::Value> {
    Json(state.jwks.jwks())
}

async fn openapi_spec(
    State(state): State<PlatformState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    let caller = state.authenticator.authenticate(&headers).await?;
    match &caller {
        Caller::Service { .. } => {}
        Caller::Application(p) | Caller::User(p) => {
            if !p.has_rules(&["applications.manage"]) {
                return Err(AppError::Forbidden(
                    "applications.manage is required to read the API document".into(),
                ));
            }
        }
        Caller::Anonymous { .. } => {
            return Err(AppError::Unauthorized("authentication required".into()));
        }
    }

    let contracts = state.host.contracts_snapshot();
    let brand = state.host.config().brand.clone();
    Ok(Json(openapi::build_spec(
        &format!("{brand} API"),
        env!("CARGO_PKG_VERSION"),
        &contracts,
    )))
}

// ── Plugin dispatch ─────────────────────────────────────────────────────────

async fn dispatch_plugin_root(
    State(state): State<PlatformState>,
    Path(plugin_id): Path<String>,
    request: Request<Body>,
) -> Response {
    dispatch(state, plugin_id, String::new(), request).await
}

async fn dispatch_plugin(
    State(state): State<PlatformState>,
    Path((plugin_id, rest)): Path<(String, String)>,
    request: Request<Body>,
) -> Response {
    dispatch(state, plugin_id, rest, request).await
}

/// Route a request to the target plugin's registered router, with a fully
/// assembled request context attached as an extension.
async fn dispatch(
    state: PlatformState,
    plugin_id: String,
    rest: String,
    mut request: Request<Body>,
) -> Response {
    let caller = match state.authenticator.authenticate(request.headers()).await {
        Ok(caller) => caller,
        Err(e) => return e.into_response(),
    };

    let Some(router) = state.host.router_for(&plugin_id) else {
        return AppError::NotFound(format!("no plugin '{plugin_id}'")).into_response();
    };

    let context = match state.host.request_context(&plugin_id, caller) {
        Ok(context) => context,
        Err(e) => return e.into_response(),
    };

    // The plugin router is mounted at /api/<plugin_id>; hand it the inner
    // path with the original query string.
    let inner_path = format!("/{rest}");
    let new_uri = match request.uri().query() {
        Some(query) => format!("{inner_path}?{query}"),
        None => inner_path,
    };
    match new_uri.parse::<Uri>() {
        Ok(uri) => *request.uri_mut() = uri,
        Err(_) => return AppError::BadRequest("malformed request path".into()).into_response(),
    }
    request.extensions_mut().insert(context);

    match router.oneshot(request).await {
        Ok(response) => response,
        Err(infallible) => match infallible {},
    }
}

// ── Signals WebSocket ───────────────────────────────────────────────────────

async fn signals_ws(
    State(state): State<PlatformState>,
    headers: HeaderMap,
    upgrade: WebSocketUpgrade,
) -> Response {
    // Anonymous upgrades are allowed for broadcast-only channels; a user id
    // is recorded only for session users.
    let user_id = match state.authenticator.authenticate(&headers).await {
        Ok(Caller::User(principal)) => Some(principal.id),
        Ok(_) => None,
        Err(_) => None,
    };

    let hub = state.host.signals().clone();
    upgrade.on_upgrade(move |socket| signal_loop(socket, hub, user_id))
}

async fn signal_loop(
    mut socket: WebSocket,
    hub: crate::signals::SignalHub,
    user_id: Option<String>,
) {
    debug!(user = ?user_id, "signal channel connected");
    let mut signals = hub.subscribe();

    loop {
        tokio::select! {
            signal = signals.recv() => {
                match signal {
                    Ok(signal) => {
                        let Ok(text) = serde_json::to_string(&signal) else { continue };
                        if socket.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "signal client lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    // Inbound frames are ignored; the channel is fan-out only.
                    Some(Ok(_)) => {}
                }
            }
        }
    }
    debug!(user = ?user_id, "signal channel closed");
}

/// Serve the platform on `addr` until the process is stopped.
pub async fn serve(router: Router, addr: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "platform listening");
    axum::serve(listener, router).await
}

/// Return a 404 in the plugin router's own error shape. Plugins use this
/// as their fallback so unmatched paths inside a mount are still JSON.
pub async fn plugin_not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": "not found" })),
    )
        .into_response()
}
