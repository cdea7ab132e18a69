/// 图片分类（模型加载、预处理、推理、/predict）
pub mod classifier;
/// 健康检查
pub mod health;
