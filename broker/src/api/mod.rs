pub mod claims;
pub mod health;
pub mod messages;
pub mod pools;
pub mod queues;

use axum::Router;

use crate::state::AppState;

pub fn make_router<S>(state: AppState) -> Router<S> {
    Router::new()
        .nest("/v1.1", health::make_router(state.clone()))
        .nest("/v1.1/queues", queues::make_router(state.clone()))
        .nest("/v1.1/queues", messages::make_router(state.clone()))
        .nest("/v1.1/queues", claims::make_router(state.clone()))
        .nest("/v1.1/pools", pools::make_router(state))
}
