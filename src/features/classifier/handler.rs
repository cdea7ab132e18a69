use axum::{
    Json, Router,
    body::Bytes,
    extract::{
        Multipart, State,
        multipart::{MultipartError, MultipartRejection},
    },
    http::StatusCode,
    routing::post,
};
use std::time::Instant;

use super::inference::classify;
use super::models::PredictionResult;
use super::preprocess::preprocess;
use crate::error::{AppError, InferenceError};
use crate::state::AppState;

/// multipart 中承载图片的字段名
pub const IMAGE_FIELD: &str = "image";

pub fn create_classifier_router() -> Router<AppState> {
    Router::new().route("/predict", post(predict))
}

#[utoipa::path(
    post,
    path = "/predict",
    summary = "识别照片中的市政问题类别",
    description = "上传单张照片（multipart 字段 `image`），返回预测类别、展示标签、置信度与类别索引。首次调用时会触发模型加载。",
    request_body(
        content = super::models::PredictUpload,
        content_type = "multipart/form-data",
        description = "待分类的照片"
    ),
    responses(
        (status = 200, description = "预测成功", body = PredictionResult),
        (status = 400, description = "缺少 image 字段或请求体不是 multipart", body = crate::error::ErrorBody),
        (status = 413, description = "上传内容超过大小限制", body = crate::error::ErrorBody),
        (status = 500, description = "图片无法解码、模型未加载或推理失败", body = crate::error::ErrorBody)
    ),
    tag = "Classifier"
)]
pub async fn predict(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<PredictionResult>, AppError> {
    let mut multipart = multipart.map_err(|e| AppError::BadRequest(e.body_text()))?;
    let image = read_image_field(&mut multipart).await?;
    tracing::info!("Received image: {} bytes", image.len());

    let handle = state.model_loader.get_model().await;
    if !handle.is_loaded() {
        return Err(InferenceError::ModelUnavailable.into());
    }

    let permit_wait = Instant::now();
    let _permit = state
        .inference_semaphore
        .clone()
        .acquire_owned()
        .await
        .map_err(|e| AppError::Internal(format!("获取推理信号量失败: {e}")))?;
    tracing::debug!("推理许可获取耗时 {}ms", permit_wait.elapsed().as_millis());

    // 解码、缩放与前向推理都是 CPU 密集任务，必须移出 tokio worker。
    let started = Instant::now();
    let result = tokio::task::spawn_blocking(move || {
        let tensor = preprocess(&image)?;
        tracing::debug!("Processed image shape: {:?}", tensor.shape());
        classify(&handle, &tensor)
    })
    .await
    .map_err(|e| AppError::Internal(format!("推理任务执行失败: {e}")))??;

    tracing::info!(
        "预测完成: category={}, className={}, confidence={:.4}, 耗时 {}ms",
        result.category,
        result.class_name,
        result.confidence,
        started.elapsed().as_millis()
    );
    Ok(Json(result))
}

/// 读取第一个名为 `image` 的字段；其余字段忽略。
async fn read_image_field(multipart: &mut Multipart) -> Result<Bytes, AppError> {
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() == Some(IMAGE_FIELD) {
            return field.bytes().await.map_err(multipart_error);
        }
    }
    Err(AppError::MissingImage)
}

/// 超过请求体上限时返回 413，其余解析错误为 400。
fn multipart_error(e: MultipartError) -> AppError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        AppError::PayloadTooLarge(e.body_text())
    } else {
        AppError::BadRequest(e.body_text())
    }
}
