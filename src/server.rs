//! HTTP endpoints for health checks, relay info, and queries.

use anyhow::Result;
use axum::{
    body::Body,
    extract::{Query as AxumQuery, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::{future::Future, net::SocketAddr, sync::Arc};
use tracing::{debug, info};

use crate::filter::Filter;
use crate::relay::Relay;

/// Start an HTTP server exposing `/healthz`, `/query`, and relay info.
pub async fn serve_http(
    addr: SocketAddr,
    relay: Arc<Relay>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "http listening");
    axum::serve(listener, router(relay).into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

fn router(relay: Arc<Relay>) -> Router {
    Router::new()
        .route("/", get(relay_info))
        .route("/healthz", get(healthz))
        .route("/query", get(query))
        .with_state(relay)
}

/// Response body for the `/healthz` endpoint.
#[derive(Serialize, Deserialize)]
struct Health {
    /// Always "ok" when the server is running.
    status: String,
    connections: usize,
    subscriptions: usize,
}

async fn healthz(State(relay): State<Arc<Relay>>) -> Json<Health> {
    debug!("GET /healthz");
    Json(Health {
        status: "ok".to_string(),
        connections: relay.hub().connection_count(),
        subscriptions: relay.hub().subscription_count(),
    })
}

#[derive(Serialize, Deserialize)]
struct Limitation {
    max_filters: usize,
    max_limit: usize,
    max_content_length: usize,
    max_event_tags: usize,
    restricted_writes: bool,
}

/// NIP-11 relay information document.
#[derive(Serialize, Deserialize)]
struct RelayInfo {
    name: String,
    description: String,
    /// Hex key that signs group snapshots.
    pubkey: String,
    supported_nips: Vec<u32>,
    software: String,
    version: String,
    limitation: Limitation,
    /// Accepted kinds as ranges, e.g. `"9000-9021"`.
    accepted_kinds: Vec<String>,
}

async fn relay_info(State(relay): State<Arc<Relay>>) -> impl IntoResponse {
    debug!("GET /");
    let cfg = relay.config();
    let info = RelayInfo {
        name: cfg.name.clone(),
        description: cfg.description.clone(),
        pubkey: relay.pubkey().to_string(),
        supported_nips: vec![1, 11, 29, 45],
        software: env!("CARGO_PKG_NAME").into(),
        version: env!("CARGO_PKG_VERSION").into(),
        limitation: Limitation {
            max_filters: cfg.max_filters,
            max_limit: cfg.max_limit,
            max_content_length: cfg.policy.max_content_length,
            max_event_tags: cfg.policy.max_tags,
            restricted_writes: true,
        },
        accepted_kinds: cfg
            .policy
            .allowed_kinds
            .ranges()
            .iter()
            .map(|r| format!("{}-{}", r.start(), r.end()))
            .collect(),
    };
    (
        [
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
            (header::CONTENT_TYPE, "application/nostr+json"),
        ],
        serde_json::to_string(&info).unwrap_or_default(),
    )
}

/// URL query parameters accepted by the `/query` endpoint.
#[derive(Deserialize)]
struct QueryParams {
    /// Comma-separated event ids.
    ids: Option<String>,
    /// Comma-separated hex public keys.
    authors: Option<String>,
    /// Comma-separated kind numbers (e.g. `9,9000`).
    kinds: Option<String>,
    /// Group id (`#h`).
    h: Option<String>,
    /// Group id of a relay snapshot (`#d`).
    d: Option<String>,
    since: Option<String>,
    until: Option<String>,
    limit: Option<String>,
}

/// Convert query string parameters into a [`Filter`].
///
/// Supported URL parameters mirror Nostr filter fields:
/// - `ids`, `authors` – comma-separated hex strings
/// - `kinds` – comma-separated list of kind numbers
/// - `h` / `d` – single `#h` or `#d` tag value
/// - `since` / `until` – Unix timestamps bounding `created_at` (inclusive)
/// - `limit` – maximum number of events to return
///
/// Example: `/query?kinds=9&h=lounge&since=1700000000`
fn params_to_filter(params: QueryParams) -> crate::error::Result<Filter> {
    use serde_json::Value;
    let list = |s: String| -> Value {
        Value::Array(
            crate::config::csv_strings(s)
                .into_iter()
                .map(Value::String)
                .collect(),
        )
    };
    let mut obj = serde_json::Map::new();
    if let Some(ids) = params.ids {
        obj.insert("ids".into(), list(ids));
    }
    if let Some(a) = params.authors {
        obj.insert("authors".into(), list(a));
    }
    if let Some(k) = params.kinds {
        let arr = crate::config::csv_u32(k)
            .into_iter()
            .map(|v| Value::Number(v.into()))
            .collect();
        obj.insert("kinds".into(), Value::Array(arr));
    }
    if let Some(h) = params.h {
        obj.insert("#h".into(), Value::Array(vec![Value::String(h)]));
    }
    if let Some(d) = params.d {
        obj.insert("#d".into(), Value::Array(vec![Value::String(d)]));
    }
    if let Some(s) = params.since.and_then(|v| v.parse::<u64>().ok()) {
        obj.insert("since".into(), Value::Number(s.into()));
    }
    if let Some(u) = params.until.and_then(|v| v.parse::<u64>().ok()) {
        obj.insert("until".into(), Value::Number(u.into()));
    }
    if let Some(l) = params.limit.and_then(|v| v.parse::<u64>().ok()) {
        obj.insert("limit".into(), Value::Number(l.into()));
    }
    Filter::from_value(&Value::Object(obj))
}

/// Matching events as NDJSON, newest first.
async fn query(
    State(relay): State<Arc<Relay>>,
    AxumQuery(params): AxumQuery<QueryParams>,
) -> Response {
    let events = params_to_filter(params).and_then(|f| {
        let filters = [f];
        relay.check_filters(&filters)?;
        relay.backfill(&filters)
    });
    let events = match events {
        Ok(events) => events,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };
    debug!(events = events.len(), "GET /query");
    // Newline-delimited so clients can stream and parse incrementally.
    let body = events
        .iter()
        .filter_map(|e| serde_json::to_string(e).ok())
        .collect::<Vec<_>>()
        .join("\n");
    ([(header::CONTENT_TYPE, "application/x-ndjson")], Body::from(body)).into_response()
}
