use crate::{
    api::handlers::{auth, health},
    error::ApiError,
};
use anyhow::Result;
use axum::{
    BoxError, Extension, Router,
    body::Body,
    extract::{ConnectInfo, MatchedPath},
    error_handling::HandleErrorLayer,
    http::{
        HeaderName, HeaderValue, Method, Request,
        header::{AUTHORIZATION, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
    routing::get,
};
use std::{
    any::Any,
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};
use tokio::{net::TcpListener, signal};
use tower::{ServiceBuilder, limit::GlobalConcurrencyLimitLayer, timeout::TimeoutLayer};
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::{AllowOrigin, CorsLayer},
    request_id::PropagateRequestIdLayer,
    set_header::SetRequestHeaderLayer,
    trace::TraceLayer,
};
use tracing::{Span, error, info, info_span};
use ulid::Ulid;

pub mod handlers;

const REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");
const REAL_IP: HeaderName = HeaderName::from_static("x-real-ip");

/// Limits applied to every request.
#[derive(Debug, Clone, Copy)]
pub struct ServerLimits {
    pub request_timeout: Duration,
    pub max_workers: usize,
}

/// Full application router with all layers applied.
#[must_use]
pub fn router(auth_state: Arc<auth::AuthState>, limits: ServerLimits) -> Router {
    let cors = CorsLayer::new()
        .allow_headers([
            CONTENT_TYPE,
            AUTHORIZATION,
            auth::AUTH_HEADER,
            HeaderName::from_static("x-assume-token"),
        ])
        .expose_headers([auth::AUTH_HEADER])
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_origin(AllowOrigin::mirror_request())
        .allow_credentials(true);

    Router::new()
        .route("/health", get(health::health).options(health::health))
        .nest("/api/v1/auth", auth::router())
        .nest("/api/v1/rpc", auth::rpc_router())
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestHeaderLayer::if_not_present(
                    REQUEST_ID,
                    |_req: &Request<Body>| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
                ))
                .layer(SetRequestHeaderLayer::if_not_present(REAL_IP, peer_ip))
                .layer(PropagateRequestIdLayer::new(REQUEST_ID))
                .layer(TraceLayer::new_for_http().make_span_with(make_span))
                .layer(cors)
                .layer(CatchPanicLayer::custom(handle_panic))
                .layer(HandleErrorLayer::new(handle_error))
                .layer(TimeoutLayer::new(limits.request_timeout))
                .layer(GlobalConcurrencyLimitLayer::new(limits.max_workers))
                .layer(Extension(auth_state)),
        )
}

/// Start the server
/// # Errors
/// Return error if failed to start the server
pub async fn new(port: u16, auth_state: Arc<auth::AuthState>, limits: ServerLimits) -> Result<()> {
    let app = router(auth_state, limits);

    let listener = TcpListener::bind(format!("::0:{port}")).await?;

    info!("Listening on [::]:{}", port);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {err}");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => error!("Failed to install SIGTERM handler: {err}"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Gracefully shutdown");
}

/// Peer address of the connection, IPv4-mapped addresses unwrapped.
fn peer_ip(request: &Request<Body>) -> Option<HeaderValue> {
    let ConnectInfo(addr) = request.extensions().get::<ConnectInfo<SocketAddr>>()?;
    let ip = match addr.ip() {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(IpAddr::V6(v6), IpAddr::V4),
        v4 => v4,
    };
    HeaderValue::from_str(&ip.to_string()).ok()
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get(REQUEST_ID)
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}

async fn handle_error(err: BoxError) -> ApiError {
    if err.is::<tower::timeout::error::Elapsed>() {
        ApiError::Timeout("request timed out".to_string())
    } else {
        error!("unhandled service error: {err}");
        ApiError::InternalServer("Internal server error".to_string())
    }
}

fn handle_panic(panic: Box<dyn Any + Send + 'static>) -> Response {
    let details = panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    error!("handler panicked: {details}");
    ApiError::InternalServer("Internal server error".to_string()).into_response()
}
