//! API Router configuration

use super::handlers;
use super::state::AppState;
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

/// Create the main API router
pub fn create_router(state: AppState) -> Router {
    let api_routes = Router::new()
        // Health and status
        .route("/health", get(handlers::health_check))
        .route("/status", get(handlers::daemon_status))
        // Decision ledger
        .route(
            "/decisions",
            get(handlers::list_decisions).post(handlers::record_decision),
        )
        .route("/decisions/:id", get(handlers::get_decision))
        // Incidents
        .route("/incidents", get(handlers::list_incidents))
        .route("/incidents/metrics", get(handlers::incident_metrics))
        .route("/incidents/by-run/:run_id", get(handlers::incidents_by_run))
        .route("/incidents/:id", get(handlers::get_incident))
        .route("/incidents/:id/acknowledge", post(handlers::acknowledge_incident))
        .route("/incidents/:id/resolve", post(handlers::resolve_incident))
        // Kill-switch
        .route("/killswitch/status", get(handlers::freeze_status))
        .route("/killswitch/admit", get(handlers::admit))
        .route(
            "/killswitch/tenant",
            post(handlers::freeze_tenant).delete(handlers::unfreeze_tenant),
        )
        .route(
            "/killswitch/key",
            post(handlers::freeze_key).delete(handlers::unfreeze_key),
        )
        // Replay
        .route("/replay/:id/slice", get(handlers::replay_slice))
        .route("/replay/:id/timeline", get(handlers::replay_timeline))
        .route("/replay/:id/explain/:item_id", get(handlers::replay_explain))
        .route("/replay/:id/summary", get(handlers::replay_summary))
        // Integration loop
        .route("/loop/:id", get(handlers::get_loop))
        .route("/loop/:id/stages", get(handlers::get_loop_stages))
        .route("/loop/:id/narrative", get(handlers::get_loop_narrative))
        .route("/loop/:id/retry", post(handlers::retry_loop))
        .route("/loop/:id/revert", post(handlers::revert_loop))
        .route("/loop/:id/regret", post(handlers::report_regret))
        .route("/loop/:id/stream", get(handlers::stream_loop))
        .route(
            "/checkpoints",
            get(handlers::list_checkpoints).post(handlers::create_checkpoint),
        )
        .route("/checkpoints/:id", get(handlers::get_checkpoint))
        .route("/checkpoints/:id/resolve", post(handlers::resolve_checkpoint))
        .route("/stats", get(handlers::loop_stats))
        // Graduation
        .route("/graduation", get(handlers::graduation_status))
        .route(
            "/graduation/simulate/:kind",
            post(handlers::simulate_graduation),
        );

    let server = state.server.clone();

    // Build router with middleware
    let mut router = Router::new()
        .nest("/api/v1", api_routes)
        .layer(DefaultBodyLimit::max(server.max_body_size))
        .layer(TimeoutLayer::new(Duration::from_secs(
            server.request_timeout_secs,
        )))
        .layer(TraceLayer::new_for_http());

    if server.enable_cors {
        router = router.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );
    }

    router.with_state(state)
}
