//! opost-hub library - campus letter delivery coordination service
//!
//! Wires the four components (hierarchy registry, code lifecycle, task
//! dispatcher, scan processor) over one SQLite pool and exposes them over
//! HTTP. Mutating routes are authenticated; reads and /health are open.

use axum::Router;
use opost_common::config::HubSettings;
use opost_common::events::EventBus;
use opost_common::opcode::OpCodeAuthority;
use opost_common::signing::CodeSigner;
use sqlx::SqlitePool;

pub mod api;
pub mod dispatch;
pub mod hierarchy;
pub mod lifecycle;
pub mod scan;
pub mod sweep;
pub mod util;

use dispatch::TaskDispatcher;
use hierarchy::HierarchyRegistry;
use lifecycle::CodeLifecycle;
use scan::ScanProcessor;

/// Application state shared across HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub events: EventBus,
    pub registry: HierarchyRegistry,
    pub lifecycle: CodeLifecycle,
    pub dispatcher: TaskDispatcher,
    pub scanner: ScanProcessor,
    /// Shared secret for API authentication; 0 disables auth
    pub shared_secret: i64,
    pub settings: HubSettings,
}

impl AppState {
    pub fn new(
        db: SqlitePool,
        events: EventBus,
        signer: CodeSigner,
        authority: OpCodeAuthority,
        shared_secret: i64,
        settings: HubSettings,
    ) -> Self {
        let registry = HierarchyRegistry::new(db.clone(), events.clone());
        let lifecycle = CodeLifecycle::new(
            db.clone(),
            signer,
            authority,
            events.clone(),
            settings.code_ttl_hours,
        );
        let dispatcher = TaskDispatcher::new(
            db.clone(),
            registry.clone(),
            events.clone(),
            settings.escalation_deadline_secs,
        );
        let scanner =
            ScanProcessor::new(db.clone(), lifecycle.clone(), registry.clone(), events.clone());

        Self { db, events, registry, lifecycle, dispatcher, scanner, shared_secret, settings }
    }
}

/// Build the application router: authenticated mutating routes, open reads.
pub fn build_router(state: AppState) -> Router {
    use axum::middleware;
    use axum::routing::{get, post};

    let protected = Router::new()
        .route("/api/codes", post(api::issue_code))
        .route("/api/codes/batch", post(api::issue_batch))
        .route("/api/codes/bind", post(api::bind_code))
        .route("/api/tasks/claim", post(api::claim_task))
        .route("/api/scan", post(api::process_scan))
        .route("/api/couriers", post(api::appoint_courier))
        .route("/api/couriers/freeze", post(api::freeze_courier))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            api::auth_middleware,
        ));

    let public = Router::new()
        .route("/api/codes/:code", get(api::get_code))
        .route("/api/codes/:code/history", get(api::code_history))
        .route("/api/tasks", get(api::list_tasks))
        .route("/api/tasks/:id", get(api::get_task))
        .route("/api/couriers/responsible", get(api::find_responsible))
        .route("/api/couriers/:id", get(api::get_courier))
        .route("/api/couriers/:id/subordinates", get(api::list_subordinates))
        .merge(api::health_routes());

    Router::new()
        .merge(protected)
        .merge(public)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}
