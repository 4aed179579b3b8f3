//! Actix Web HTTP server.
//!
//! - `POST /v1/chat/completions`, `POST /chat/completions`: repair and forward
//! - `GET /health`: readiness, answered locally
//! - anything else: forwarded to the same path; JSON POST bodies lose cache
//!   annotations and blocked parameters, everything else goes verbatim

use crate::{
    config::ProxyConfig,
    error::{GatewayError, ProxyError},
    gateway::{self, Gateway},
    pipeline::{self, RequestTrace},
};
use actix_cors::Cors;
use actix_web::{dev::Server, http::Method, web, App, HttpRequest, HttpResponse, HttpServer};
use anyhow::{Context, Result};
use bytes::Bytes;
use serde_json::json;
use std::net::TcpListener;
use tracing::{debug, info};

pub const SERVICE_NAME: &str = "mender";

/// Shared, read-only state. One per server, cloned into every worker.
pub struct AppState {
    pub config: ProxyConfig,
    pub gateway: Gateway,
}

impl AppState {
    pub fn new(config: ProxyConfig) -> Result<Self, GatewayError> {
        let gateway = Gateway::new(&config)?;
        Ok(Self { config, gateway })
    }
}

/// Register every route. Used by [`bind`] and by tests against
/// `actix_web::test`.
pub fn configure(state: web::Data<AppState>) -> impl FnOnce(&mut web::ServiceConfig) {
    move |cfg| {
        let limit = state.config.max_body_bytes;
        cfg.app_data(state)
            .app_data(web::PayloadConfig::new(limit))
            .route("/health", web::get().to(health_check))
            .route("/v1/chat/completions", web::post().to(chat_completions))
            .route("/chat/completions", web::post().to(chat_completions))
            .default_service(web::to(passthrough));
    }
}

/// Start serving on an already-bound listener. The returned server must be
/// awaited (or spawned) to run.
pub fn bind(config: ProxyConfig, listener: TcpListener) -> Result<Server> {
    let state = web::Data::new(AppState::new(config).context("failed to build backend client")?);

    let server = HttpServer::new(move || {
        App::new()
            .wrap(Cors::permissive())
            .configure(configure(state.clone()))
    })
    .listen(listener)
    .context("failed to listen")?
    .run();

    Ok(server)
}

pub async fn serve(config: ProxyConfig) -> Result<()> {
    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr).with_context(|| format!("failed to bind {}", addr))?;
    info!(
        addr = %addr,
        backend = %config.backend_url_trimmed(),
        "mender listening"
    );

    bind(config, listener)?.await.context("server error")?;
    Ok(())
}

async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

fn path_and_query(req: &HttpRequest) -> &str {
    req.uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| req.path())
}

fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

async fn chat_completions(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: Bytes,
) -> Result<HttpResponse, ProxyError> {
    let mut trace = RequestTrace::new(new_request_id());
    let policy = &state.config.policy;

    let prepared = match pipeline::prepare(&body, policy, &mut trace) {
        Ok(prepared) => prepared,
        Err(e) => {
            trace.fail(&e);
            return Err(e.into());
        }
    };

    info!(
        request_id = %trace.request_id(),
        path = %req.path(),
        model = %prepared.model,
        stream = prepared.stream,
        fields_stripped = prepared.report.fields_stripped,
        blocks_dropped = prepared.report.blocks_dropped,
        orphans_dropped = prepared.report.filter.orphans_dropped.len(),
        params_removed = prepared.report.filter.params_removed.len(),
        "forwarding chat completion"
    );

    let headers = state.gateway.outbound_headers(req.headers(), policy, true);
    let upstream = match state
        .gateway
        .send(
            reqwest::Method::POST,
            path_and_query(&req),
            headers,
            prepared.body,
        )
        .await
    {
        Ok(upstream) => upstream,
        Err(e) => {
            let err = ProxyError::from(e);
            trace.fail(&err);
            return Err(err);
        }
    };

    state.gateway.relay(upstream, prepared.stream, trace).await
}

async fn passthrough(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: Bytes,
) -> Result<HttpResponse, ProxyError> {
    let mut trace = RequestTrace::new(new_request_id());
    debug!(
        request_id = %trace.request_id(),
        method = %req.method(),
        path = %req.path(),
        "passthrough"
    );

    let policy = &state.config.policy;
    let repaired = if *req.method() == Method::POST {
        match pipeline::prepare_other(&body, policy, &mut trace) {
            Ok(repaired) => repaired,
            Err(e) => {
                trace.fail(&e);
                return Err(e.into());
            }
        }
    } else {
        None
    };

    let json_body = repaired.is_some();
    let body = repaired.unwrap_or(body);
    let headers = state.gateway.outbound_headers(req.headers(), policy, json_body);
    let method = gateway::outbound_method(req.method());
    let upstream = match state
        .gateway
        .send(method, path_and_query(&req), headers, body)
        .await
    {
        Ok(upstream) => upstream,
        Err(e) => {
            let err = ProxyError::from(e);
            trace.fail(&err);
            return Err(err);
        }
    };

    state.gateway.relay(upstream, false, trace).await
}
