//! API v1 routes.

mod nodes;
mod tasks;
mod workspaces;

use axum::Router;

use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .nest("/tasks", tasks::routes())
        // Called by the workspace with its callback token.
        .nest("/workspaces", workspaces::routes())
        .nest("/nodes", nodes::routes())
}
