use axum::{
    routing::{get, post, put},
    Router,
};

use crate::billing::api;

pub fn api_routes() -> Router {
    Router::new()
        .route(
            "/api/users/:user_id/consumables",
            get(api::get_user_balance),
        )
        .route(
            "/api/users/:user_id/services/:service_slug/sessions",
            post(api::open_consumption_session),
        )
        .route("/api/sessions/:id/consume", put(api::consume_session))
        .route("/api/sessions/:id/cancel", put(api::cancel_session))
        .route(
            "/api/subscriptions/:id/stock",
            post(api::trigger_stock_build),
        )
        .route("/api/subscriptions/:id/renew", post(api::trigger_renewal))
}
