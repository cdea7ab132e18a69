use axum::{Router, extract::DefaultBodyLimit, routing::get};
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::features::{classifier, health};
use crate::openapi::ApiDoc;
use crate::state::AppState;

/// 组装完整路由：/predict、/health、/docs。
///
/// `max_upload_bytes` 限制请求体大小（multipart 整体）。
pub fn build_router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::<AppState>::new()
        .route("/health", get(health::health_check))
        .merge(classifier::create_classifier_router())
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(
            crate::request_id::request_id_middleware,
        ))
        .with_state(state)
}
