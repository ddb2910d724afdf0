use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use taskq_scheduler::TaskRepository;

/// Central shared state — passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    /// Has its own store connection, separate from the engine and workers.
    pub tasks: TaskRepository,
}

impl AppState {
    pub fn new(tasks: TaskRepository) -> Self {
        Self { tasks }
    }
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .route("/tasks", post(crate::http::tasks::create_task))
        .route("/tasks/{id}", get(crate::http::tasks::get_task))
        .route(
            "/tasks/{id}/dead-letters",
            get(crate::http::tasks::get_dead_letters),
        )
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
