//! tagrank-api library - HTTP surface over the tag engine
//!
//! Exposes the router and state so integration tests can drive handlers
//! without binding a socket.

pub mod api;
pub mod error;
pub mod pagination;

pub use crate::error::{ApiError, ApiResult};

use axum::Router;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tagrank_common::events::EventBus;
use tagrank_engine::TagEngine;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub engine: TagEngine,
    /// Same bus the engine emits on
    pub event_bus: EventBus,
    /// Cancelled on shutdown; running migration batches stop between works
    pub shutdown: CancellationToken,
    /// Held while a migration batch runs
    pub migration_lock: Arc<Mutex<()>>,
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(engine: TagEngine) -> Self {
        Self {
            event_bus: engine.events().clone(),
            engine,
            shutdown: CancellationToken::new(),
            migration_lock: Arc::new(Mutex::new(())),
            startup_time: Utc::now(),
        }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(api::health_routes())
        .merge(api::work_routes())
        .merge(api::prominence_routes())
        .merge(api::search_routes())
        .merge(api::crossover_routes())
        .merge(api::batch_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
