/// 分类网络定义与序列化架构描述
pub mod architecture;
pub mod handler;
/// 前向推理与结果映射
pub mod inference;
/// 类别标签与下游类别码
pub mod labels;
/// 模型单例与加载策略接口
pub mod loader;
pub mod models;
pub mod preprocess;
pub mod store;
pub mod strategies;
/// safetensors 权重读取
pub mod weights;

pub use handler::create_classifier_router;
pub use inference::classify;
pub use loader::{Classifier, LoadFailure, LoadState, LoadStrategy, ModelHandle, ModelLoader};
pub use models::PredictionResult;
pub use preprocess::{PreprocessedTensor, preprocess};
pub use store::ModelStore;
