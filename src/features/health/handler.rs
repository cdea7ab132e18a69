use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::Json};
use futures_util::FutureExt;
use serde::Serialize;

use crate::features::classifier::loader::{ModelHandle, panic_message, summarize_failures};
use crate::state::AppState;

/// 健康检查响应
#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct HealthResponse {
    /// 服务状态：healthy | degraded | unhealthy
    #[schema(example = "healthy")]
    pub status: String,
    /// 状态说明
    #[schema(example = "ML service is running")]
    pub message: String,
    /// 模型状态：loaded | not loaded | error
    #[schema(example = "loaded")]
    pub model: String,
    /// 成功加载模型所用的策略
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(example = "serialized")]
    pub strategy: Option<String>,
}

impl HealthResponse {
    fn new(status: &str, message: String, model: &str, strategy: Option<&str>) -> Self {
        Self {
            status: status.to_string(),
            message,
            model: model.to_string(),
            strategy: strategy.map(str::to_string),
        }
    }
}

#[utoipa::path(
    get,
    path = "/health",
    summary = "健康检查",
    description = "返回服务与模型状态。首次调用会触发模型加载；模型加载失败时服务仍可访问，状态为 degraded。",
    responses(
        (status = 200, description = "healthy 或 degraded", body = HealthResponse),
        (status = 503, description = "无法获取模型状态", body = HealthResponse)
    ),
    tag = "Health"
)]
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let loader = state.model_loader.clone();
    let checked = AssertUnwindSafe(async move { loader.get_model().await })
        .catch_unwind()
        .await;
    health_response(checked)
}

/// 将模型句柄（或解析句柄时捕获的 panic）映射为健康检查响应。
fn health_response(
    checked: std::thread::Result<Arc<ModelHandle>>,
) -> (StatusCode, Json<HealthResponse>) {
    match checked {
        Ok(handle) if handle.is_loaded() => (
            StatusCode::OK,
            Json(HealthResponse::new(
                "healthy",
                "ML service is running".to_string(),
                "loaded",
                handle.strategy(),
            )),
        ),
        Ok(handle) => (
            StatusCode::OK,
            Json(HealthResponse::new(
                "degraded",
                format!(
                    "ML service is running but model not loaded: {}",
                    summarize_failures(handle.failures())
                ),
                "not loaded",
                None,
            )),
        ),
        Err(panic) => {
            let reason = panic_message(panic.as_ref());
            tracing::error!("健康检查失败: {}", reason);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse::new(
                    "unhealthy",
                    format!("ML service error: {reason}"),
                    "error",
                    None,
                )),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_while_resolving_model_is_unhealthy() {
        let (status, Json(body)) = health_response(Err(Box::new("loader state poisoned")));
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body.status, "unhealthy");
        assert_eq!(body.model, "error");
        assert_eq!(body.message, "ML service error: loader state poisoned");
        assert!(body.strategy.is_none());
    }

    #[test]
    fn unhealthy_body_serializes_without_strategy() {
        let (_, Json(body)) = health_response(Err(Box::new(String::from("boom"))));
        let json = serde_json::to_value(&body).expect("serialize");
        assert_eq!(
            json,
            serde_json::json!({
                "status": "unhealthy",
                "message": "ML service error: boom",
                "model": "error",
            })
        );
    }
}
