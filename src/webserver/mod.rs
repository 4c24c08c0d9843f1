//! HTTP endpoint serving the Prometheus metrics of this process.

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use prometheus::{Encoder, TextEncoder};
use std::net::SocketAddr;
use tokio::runtime::Runtime;

use crate::errors::{BspError, BspResult, Reraise};

/// Env var selecting the metrics port. No port, no server.
pub const METRICS_PORT_ENV_VAR: &str = "BULKSYNC_METRICS_PORT";

pub async fn run_webserver(port: u16) -> BspResult<()> {
    let app = Router::new().route("/metrics", get(get_metrics));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Starting metrics server on {addr:?}");

    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await
        .map_err(|err| err.to_string())
        .reraise(&format!("unable to create local webserver at port {port}"))
}

/// Start the metrics server on its own runtime if
/// `BULKSYNC_METRICS_PORT` is set.
///
/// Keep the returned runtime around for as long as the server should
/// keep running.
pub fn start_server_runtime_from_env() -> BspResult<Option<Runtime>> {
    let port = match std::env::var(METRICS_PORT_ENV_VAR) {
        Ok(port) => port.parse::<u16>().map_err(|err| {
            BspError::Config(format!("bad {METRICS_PORT_ENV_VAR}={port:?}: {err}"))
        })?,
        Err(_) => return Ok(None),
    };
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("webserver-threads")
        .enable_all()
        .build()
        .reraise("error initializing tokio runtime for webserver")?;
    rt.spawn(async move {
        if let Err(err) = run_webserver(port).await {
            tracing::error!("{err}");
        }
    });
    Ok(Some(rt))
}

/// Everything in the default Prometheus registry, in text format.
pub fn encode_metrics() -> BspResult<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&prometheus::gather(), &mut buffer)
        .map_err(|err| BspError::Telemetry(err.to_string()))?;
    String::from_utf8(buffer).map_err(|err| BspError::Telemetry(err.to_string()))
}

async fn get_metrics() -> Response {
    match encode_metrics() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, TextEncoder::new().format_type().to_string())],
            body,
        )
            .into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}
