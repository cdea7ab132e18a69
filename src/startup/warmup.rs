use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinHandle;

use crate::features::classifier::{LoadState, ModelLoader};

/// 启动期预加载模型（含首次下载）。
///
/// 在后台任务中执行，不阻塞端口绑定；失败只记录日志，服务以 degraded 状态继续运行。
pub fn spawn_model_warmup(loader: Arc<ModelLoader>) -> JoinHandle<LoadState> {
    tokio::spawn(async move {
        tracing::info!("🔍 开始预加载模型...");
        let started = Instant::now();
        let handle = loader.get_model().await;
        let state = handle.state();
        match state {
            LoadState::Loaded => tracing::info!(
                "✅ 模型预加载完成: input={:?}, classes={}, {}ms",
                handle.input_shape(),
                handle.num_classes(),
                started.elapsed().as_millis()
            ),
            _ => tracing::warn!("⚠️ 模型预加载失败，/predict 将返回 500 直至进程重启"),
        }
        state
    })
}
