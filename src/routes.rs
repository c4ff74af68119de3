use axum::{
    routing::{get, post, put},
    Extension, Router,
};

use crate::billing::api as billing;
use crate::moderation::api as moderation;
use crate::platform::Platform;

pub fn api_routes() -> Router {
    Router::new()
        .route("/api/billing/balance", get(billing::get_balance))
        .route("/api/billing/estimate", get(billing::estimate_cost))
        .route("/api/billing/credits", post(billing::add_credits))
        .route("/api/billing/refunds", post(billing::refund_credits))
        .route("/api/billing/adjustments", post(billing::adjust_credits))
        .route("/api/billing/transactions", get(billing::list_transactions))
        .route("/api/billing/ledger/verify", get(billing::verify_ledger))
        .route(
            "/api/billing/auto-topup",
            put(billing::configure_auto_topup).post(billing::run_auto_topup),
        )
        .route("/api/billing/valves", get(billing::list_valves))
        .route("/api/billing/valves/:feature", put(billing::update_valve))
        .route("/api/billing/rate-cards", get(billing::list_rate_cards))
        .route("/api/billing/health", get(billing::wallet_health))
        .route("/api/billing/usage", get(billing::usage_report))
        .route("/api/moderation/items", post(moderation::enqueue))
        .route("/api/moderation/queue", get(moderation::my_queue))
        .route("/api/moderation/queue/next", post(moderation::next_item))
        .route(
            "/api/moderation/items/:id/assign",
            post(moderation::assign_item),
        )
        .route(
            "/api/moderation/items/:id/reassign",
            post(moderation::reassign_item),
        )
        .route(
            "/api/moderation/items/:id/decision",
            post(moderation::decide),
        )
        .route("/api/moderation/stats", get(moderation::queue_stats))
        .route("/api/moderation/stats/me", get(moderation::my_stats))
        .route(
            "/api/moderation/escalations",
            post(moderation::run_escalations),
        )
        .route("/api/moderation/team", get(moderation::list_team))
        .route(
            "/api/moderation/team/:user_id",
            put(moderation::update_team_member),
        )
        .route(
            "/api/moderation/workflows",
            get(moderation::list_workflows).post(moderation::save_workflow),
        )
        .route(
            "/api/moderation/sla",
            get(moderation::get_sla_policy).put(moderation::update_sla_policy),
        )
}

async fn root() -> &'static str {
    "Wellness Platform API"
}

/// API routes with the service graph attached. Metrics are layered on in `main`.
pub fn app(platform: Platform) -> Router {
    Router::new()
        .route("/", get(root))
        .merge(api_routes())
        .layer(Extension(platform))
}
