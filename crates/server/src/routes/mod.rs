use axum::Router;

use crate::state::AppState;

pub mod analytics;
pub mod events;
pub mod surveys;

pub fn router() -> Router<AppState> {
    Router::new().nest(
        "/api",
        Router::new()
            .merge(events::router())
            .merge(analytics::router())
            .merge(surveys::router()),
    )
}
