use axum::Router;
use axum::middleware::from_fn;
use axum::routing::{get, post};
use tower_http::trace::TraceLayer;

use crate::state::AppState;
use crate::{handlers, middleware};

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/ping", get(handlers::health::ping_handler))
        .route(
            "/vms",
            get(handlers::vms::list_vms_handler).post(handlers::vms::create_vm_handler),
        )
        .route(
            "/vms/{uuid}",
            get(handlers::vms::get_vm_handler)
                .post(handlers::vms::vm_action_handler)
                .delete(handlers::vms::delete_vm_handler),
        )
        .route("/vms/{uuid}/jobs", get(handlers::vms::list_vm_jobs_handler))
        .route(
            "/vms/{uuid}/migration",
            get(handlers::vms::get_vm_migration_handler),
        )
        .route(
            "/vms/{uuid}/tags",
            get(handlers::tags::list_tags_handler)
                .post(handlers::tags::add_tags_handler)
                .put(handlers::tags::set_tags_handler)
                .delete(handlers::tags::delete_all_tags_handler),
        )
        .route(
            "/vms/{uuid}/tags/{key}",
            get(handlers::tags::get_tag_handler).delete(handlers::tags::delete_tag_handler),
        )
        .route("/jobs", get(handlers::jobs::list_jobs_handler))
        .route("/jobs/{uuid}", get(handlers::jobs::get_job_handler))
        .route("/jobs/{uuid}/cancel", post(handlers::jobs::cancel_job_handler))
        .layer(from_fn(middleware::request_identity))
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}
