#![allow(clippy::collapsible_if)]

mod cache;
mod config;
mod db;
mod http;
mod orientation;
mod path_guard;
mod queries;
mod resolver;
mod routes;
mod state;
mod tags;

use crate::cache::RenditionCache;
use crate::config::Config;
use crate::db::Database;
use crate::state::AppState;
use anyhow::Context;
use axum::Router;
use axum::body::HttpBody;
use axum::http::{Response, header};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::compression::{
    CompressionLayer,
    predicate::{DefaultPredicate, Predicate},
};
use tower_http::sensitive_headers::SetSensitiveHeadersLayer;
use tower_http::trace::{DefaultMakeSpan, TraceLayer};
use tracing::info;

#[derive(Clone)]
struct NoImageCompression {
    inner: DefaultPredicate,
}

impl NoImageCompression {
    fn new() -> Self {
        Self {
            inner: DefaultPredicate::new(),
        }
    }
}

impl Predicate for NoImageCompression {
    fn should_compress<B>(&self, response: &Response<B>) -> bool
    where
        B: HttpBody,
    {
        if let Some(content_type) = response.headers().get(header::CONTENT_TYPE) {
            if let Ok(content_type) = content_type.to_str() {
                if content_type.starts_with("image/") {
                    return false;
                }
            }
        }
        self.inner.should_compress(response)
    }
}

fn build_app(state: Arc<AppState>) -> Router {
    let max_in_flight = if state.config.max_in_flight_requests == 0 {
        usize::MAX
    } else {
        state.config.max_in_flight_requests
    };
    http::router(state)
        .layer(CompressionLayer::new().compress_when(NoImageCompression::new()))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(false)),
        )
        .layer(SetSensitiveHeadersLayer::new([
            header::AUTHORIZATION,
            header::COOKIE,
            header::SET_COOKIE,
        ]))
        .layer(ConcurrencyLimitLayer::new(max_in_flight))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::from_env()?;
    queries::verify_catalog().context("embedded query catalog")?;
    info!(
        db_path = %config.db_path.display(),
        db_max_connections = config.db_max_connections,
        max_in_flight_requests = config.max_in_flight_requests,
        max_concurrent_renditions = config.max_concurrent_renditions,
        inline = ?config.renditions.inline,
        thumb = ?config.renditions.thumb,
        route_overrides = config.route_overrides.len(),
        "startup config summary"
    );
    let db = Database::new(&config).await?;
    let cache = RenditionCache::new(&config).context("prepare rendition cache")?;
    info!(cache_dir = %cache.dir().display(), "rendition cache ready");
    let state = Arc::new(AppState::new(config, db, cache)?);
    for (endpoint, pattern) in state.routes.ordered() {
        info!(endpoint = endpoint.name(), pattern, "route registered");
    }

    let app = build_app(state.clone());

    let addr = format!("{}:{}", state.config.host, state.config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(address = %addr, "photo library listening");
    axum::serve(listener, app).await?;
    Ok(())
}
