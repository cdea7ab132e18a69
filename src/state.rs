use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::features::classifier::ModelLoader;

/// 聚合的应用共享状态
#[derive(Clone)]
pub struct AppState {
    /// 模型单例的唯一持有者
    pub model_loader: Arc<ModelLoader>,
    /// 控制并发推理的信号量（限制 CPU 密集型任务数量）
    pub inference_semaphore: Arc<Semaphore>,
}

impl AppState {
    pub fn new(model_loader: Arc<ModelLoader>, max_parallel: usize) -> Self {
        Self {
            model_loader,
            inference_semaphore: Arc::new(Semaphore::new(max_parallel.max(1))),
        }
    }
}
