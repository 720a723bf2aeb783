//! HTTP front end. Parses and validates JSON, forwards to the auth service
//! through an [`AuthClient`](crate::rpc::AuthClient), and renders the result
//! in the JSON envelope. It holds no state of its own.

pub mod envelope;
pub mod handlers;
mod openapi;

pub use handlers::SharedAuthClient;
pub use openapi::openapi;

use anyhow::{anyhow, Context, Result};
use axum::{
    body::Body,
    extract::MatchedPath,
    http::{
        header::{AUTHORIZATION, CONTENT_TYPE},
        HeaderName, HeaderValue, Method, Request,
    },
    routing::{get, options},
    Extension, Json, Router,
};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    request_id::PropagateRequestIdLayer,
    set_header::SetRequestHeaderLayer,
    trace::TraceLayer,
};
use tracing::{info, info_span, warn, Span};
use ulid::Ulid;
use url::Url;

const REQUEST_ID: &str = "x-request-id";

/// Build the gateway application.
///
/// `allowed_origin` enables CORS for one browser origin; without it no CORS
/// headers are sent.
///
/// # Errors
/// Returns an error if `allowed_origin` is not a valid origin URL.
pub fn app(client: SharedAuthClient, allowed_origin: Option<&str>) -> Result<Router> {
    let (router, spec) = openapi::api_router().split_for_parts();
    let mut app = router
        .route("/health", options(handlers::health::health))
        .route(
            "/openapi.json",
            get(move || {
                let spec = spec.clone();
                async move { Json(spec) }
            }),
        )
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestHeaderLayer::if_not_present(
                    HeaderName::from_static(REQUEST_ID),
                    |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
                ))
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(REQUEST_ID)))
                .layer(TraceLayer::new_for_http().make_span_with(make_span))
                .layer(Extension(client)),
        );

    if let Some(origin) = allowed_origin {
        let cors = CorsLayer::new()
            .allow_headers([CONTENT_TYPE, AUTHORIZATION])
            .allow_methods([Method::GET, Method::POST])
            .allow_origin(AllowOrigin::exact(cors_origin(origin)?));
        app = app.layer(cors);
    }

    Ok(app)
}

/// Serve until `shutdown` fires, then give in-flight requests `grace`.
///
/// # Errors
/// Returns an error if the listener fails.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    shutdown: CancellationToken,
    grace: Duration,
) -> Result<()> {
    info!("Listening on {}", listener.local_addr()?);

    let signal = shutdown.clone();
    let server = axum::serve(listener, app.into_make_service()).with_graceful_shutdown(async move {
        signal.cancelled().await;
        info!("Gracefully shutdown");
    });
    let server = async move { server.await };
    tokio::pin!(server);

    let deadline = async {
        shutdown.cancelled().await;
        tokio::time::sleep(grace).await;
    };

    tokio::select! {
        result = &mut server => result?,
        () = deadline => warn!("shutdown grace of {grace:?} elapsed, dropping in-flight requests"),
    }
    Ok(())
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

fn cors_origin(origin: &str) -> Result<HeaderValue> {
    let parsed = Url::parse(origin).with_context(|| format!("Invalid allowed origin: {origin}"))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| anyhow!("Allowed origin must include a valid host: {origin}"))?;
    let port = parsed
        .port()
        .map_or_else(String::new, |port| format!(":{port}"));
    HeaderValue::from_str(&format!("{}://{}{}", parsed.scheme(), host, port))
        .context("Failed to build origin header")
}
