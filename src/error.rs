use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

/// 模型服务管线错误类型（下载、加载、解码、推理）
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InferenceError {
    /// 缺少必需配置（例如本地无模型且未配置下载地址）
    #[error("配置错误: {0}")]
    Configuration(String),

    /// 远程下载失败或未完整完成
    #[error("模型下载失败: {0}")]
    Download(String),

    /// 所有加载策略均失败
    #[error("模型加载失败: {0}")]
    ModelLoad(String),

    /// 上传内容不是可识别的图片
    #[error("图片解码失败: {0}")]
    Decode(String),

    /// 模型未加载时请求推理
    #[error("Model not loaded - service may be misconfigured")]
    ModelUnavailable,

    /// 前向推理失败或输出形状异常
    #[error("推理失败: {0}")]
    Inference(String),
}

impl InferenceError {
    fn stable_code(&self) -> &'static str {
        match self {
            InferenceError::Configuration(_) => "CONFIG_ERROR",
            InferenceError::Download(_) => "DOWNLOAD_FAILED",
            InferenceError::ModelLoad(_) => "MODEL_LOAD_FAILED",
            InferenceError::Decode(_) => "IMAGE_DECODE_FAILED",
            InferenceError::ModelUnavailable => "MODEL_UNAVAILABLE",
            InferenceError::Inference(_) => "INFERENCE_FAILED",
        }
    }
}

/// 应用统一错误类型（HTTP 边界）
#[derive(Error, Debug)]
pub enum AppError {
    /// 请求中缺少 `image` 字段
    #[error("No image file provided")]
    MissingImage,

    /// 请求体无法解析（非 multipart 或格式损坏）
    #[error("请求格式错误: {0}")]
    BadRequest(String),

    /// 上传内容超过 `inference.max_upload_bytes`
    #[error("上传内容过大: {0}")]
    PayloadTooLarge(String),

    /// 模型管线错误
    #[error(transparent)]
    Inference(#[from] InferenceError),

    /// 内部服务器错误
    #[error("内部错误: {0}")]
    Internal(String),
}

/// 结构化错误响应体。
///
/// `error` 为人类可读信息，`code` 为稳定错误码，便于调用方程序化处理。
#[derive(Debug, Serialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    /// 错误信息
    #[schema(example = "No image file provided")]
    pub error: String,

    /// 稳定的错误码
    #[schema(example = "IMAGE_REQUIRED")]
    pub code: String,

    /// 请求追踪 ID（由 request-id 中间件注入）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::MissingImage | AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::Inference(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn stable_code(&self) -> &'static str {
        match self {
            AppError::MissingImage => "IMAGE_REQUIRED",
            AppError::BadRequest(_) => "BAD_REQUEST",
            AppError::PayloadTooLarge(_) => "PAYLOAD_TOO_LARGE",
            AppError::Inference(e) => e.stable_code(),
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("请求处理失败: {}", self);
        } else {
            tracing::debug!("请求被拒绝: {}", self);
        }

        let body = ErrorBody {
            error: self.to_string(),
            code: self.stable_code().to_string(),
            request_id: crate::request_id::current_request_id(),
        };

        let mut res = Json(body).into_response();
        *res.status_mut() = status;
        res
    }
}

// =============== Error conversions for common external errors ===============

impl From<reqwest::Error> for InferenceError {
    fn from(err: reqwest::Error) -> Self {
        InferenceError::Download(err.to_string())
    }
}

impl From<image::ImageError> for InferenceError {
    fn from(err: image::ImageError) -> Self {
        InferenceError::Decode(err.to_string())
    }
}
