use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::features::health::handler::health_check,
        crate::features::classifier::handler::predict,
    ),
    components(
        schemas(
            crate::error::ErrorBody,
            crate::features::classifier::models::PredictionResult,
            crate::features::classifier::models::PredictUpload,
            crate::features::health::handler::HealthResponse,
        )
    ),
    tags(
        (name = "Classifier", description = "图片分类：上传照片，返回市政问题类别与置信度。"),
        (name = "Health", description = "健康检查：服务与模型状态。"),
    ),
    info(
        title = "CivicLens ML API",
        version = env!("CARGO_PKG_VERSION"),
        description = "市政问题照片分类服务（Axum + candle）。"
    )
)]
pub struct ApiDoc;
