mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::{routing::get, Router};
use axum_prometheus::PrometheusMetricLayer;
use tower::ServiceExt;

use wellness_backend::app;

#[tokio::test]
async fn metrics_render_alongside_the_api() {
    let (layer, handle) = PrometheusMetricLayer::pair();
    let router = Router::new()
        .route("/metrics", get(move || async move { handle.render() }))
        .merge(app(common::platform().platform))
        .layer(layer);

    let response = router
        .clone()
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = router
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
