//! The HTTP + WebSocket surface.
//!
//! Routes split into **public** (health probe, signed webhooks) and
//! **protected** (everything else, behind the bearer-token middleware).

pub mod admin;
pub mod auth;
pub mod error;
pub mod integrations;
pub mod sessions;
pub mod tasks;
pub mod webhooks;
pub mod ws;

use axum::middleware;
use axum::routing::{delete, get, post};
use axum::Router;

use crate::devices;
use crate::state::AppState;

/// Build the full `/api/v1` router.
pub fn router(state: AppState) -> Router<AppState> {
    let public = Router::new()
        .route("/api/v1/health", get(admin::health))
        // Webhook senders authenticate with HMAC signatures, not bearer
        // tokens.
        .route("/api/v1/webhooks/:integration_id", post(webhooks::inbound));

    let protected = Router::new()
        // Sessions
        .route(
            "/api/v1/sessions",
            get(sessions::list_sessions).post(sessions::create_session),
        )
        .route("/api/v1/sessions/import", post(sessions::import_session))
        .route(
            "/api/v1/sessions/:id",
            get(sessions::get_session).delete(sessions::delete_session),
        )
        .route("/api/v1/sessions/:id/reopen", post(sessions::reopen_session))
        .route("/api/v1/sessions/:id/archive", post(sessions::archive_session))
        .route(
            "/api/v1/sessions/:id/messages",
            get(sessions::list_messages).post(sessions::post_message),
        )
        .route("/api/v1/sessions/:id/cancel", post(sessions::cancel_session))
        .route("/api/v1/sessions/:id/export", get(sessions::export_session))
        .route(
            "/api/v1/sessions/:id/approvals/:tool_call_id",
            post(sessions::resolve_approval),
        )
        .route("/api/v1/approvals", get(sessions::list_pending_approvals))
        // Integrations
        .route(
            "/api/v1/integrations",
            get(integrations::list_integrations).post(integrations::create_integration),
        )
        .route(
            "/api/v1/integrations/:id",
            delete(integrations::delete_integration),
        )
        .route(
            "/api/v1/integrations/:id/test",
            post(integrations::test_integration),
        )
        // Tasks
        .route("/api/v1/tasks", get(tasks::list_tasks).post(tasks::create_task))
        .route(
            "/api/v1/tasks/:id",
            get(tasks::get_task)
                .patch(tasks::patch_task)
                .delete(tasks::delete_task),
        )
        .route("/api/v1/tasks/:id/runs", get(tasks::list_runs))
        .route("/api/v1/tasks/:id/run", post(tasks::run_now))
        // Audit, policies, introspection
        .route("/api/v1/audit", get(admin::query_audit))
        .route(
            "/api/v1/policies",
            get(admin::list_policies).post(admin::create_policy),
        )
        .route("/api/v1/policies/:id", delete(admin::delete_policy))
        .route("/api/v1/tools", get(admin::list_tools))
        .route("/api/v1/models", get(admin::list_models))
        .route("/api/v1/cost", get(admin::cost_summary))
        .route("/api/v1/admin/config", get(admin::get_config))
        // Event feed + paired devices
        .route("/api/v1/ws", get(ws::event_ws))
        .route("/api/v1/devices/ws", get(devices::device_ws))
        .route_layer(middleware::from_fn_with_state(
            state,
            auth::require_api_token,
        ));

    public
        .merge(protected)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
