use serde::{Deserialize, Serialize};

/// 单次预测结果（即 `/predict` 成功响应体）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
#[schema(example = json!({
  "category": "potholes",
  "className": "Potholes",
  "confidence": 0.89,
  "classIndex": 3
}))]
pub struct PredictionResult {
    /// 下游系统使用的类别码
    pub category: String,
    /// 展示标签
    pub class_name: String,
    /// 置信度 [0, 1]
    pub confidence: f32,
    /// 类别索引 [0, 4]
    pub class_index: usize,
}

/// `/predict` 的 multipart 表单（仅用于 OpenAPI 文档）
#[derive(Debug, utoipa::ToSchema)]
#[allow(dead_code)]
pub struct PredictUpload {
    /// 待分类的照片（jpeg/png/webp 等）
    #[schema(value_type = String, format = Binary)]
    pub image: Vec<u8>,
}
