//! 进程级模型单例：首次访问时解析模型文件，并按顺序尝试各加载策略。

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use serde::Serialize;

use super::labels::NUM_CLASSES;
use super::preprocess::{INPUT_CHANNELS, INPUT_HEIGHT, INPUT_WIDTH, PreprocessedTensor};
use super::store::ModelStore;
use super::strategies::{ReconstructedModelStrategy, SerializedModelStrategy};
use crate::config::ModelConfig;
use crate::error::InferenceError;

/// 已加载的分类器：一次前向推理，返回长度为类别数的概率分布。
///
/// 实现必须允许多线程并发调用。
pub trait Classifier: Send + Sync {
    fn predict(&self, input: &PreprocessedTensor) -> Result<Vec<f32>, InferenceError>;
}

/// 一种从模型文件构造分类器的方式。
pub trait LoadStrategy: Send + Sync {
    /// 用于日志与健康检查的策略名
    fn name(&self) -> &'static str;

    fn load(&self, path: &Path) -> Result<Arc<dyn Classifier>, InferenceError>;
}

/// 模型加载状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadState {
    Unloaded,
    Loaded,
    Failed,
}

/// 一次失败的加载尝试
#[derive(Debug, Clone, PartialEq)]
pub struct LoadFailure {
    /// 失败阶段（`store` 或策略名）
    pub stage: String,
    pub error: InferenceError,
}

impl fmt::Display for LoadFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.stage, self.error)
    }
}

/// 模型句柄：要么持有可用分类器，要么记录了全部失败原因（终态）。
pub struct ModelHandle {
    classifier: Option<Arc<dyn Classifier>>,
    strategy: Option<&'static str>,
    failures: Vec<LoadFailure>,
}

impl ModelHandle {
    fn loaded(
        classifier: Arc<dyn Classifier>,
        strategy: &'static str,
        failures: Vec<LoadFailure>,
    ) -> Self {
        Self {
            classifier: Some(classifier),
            strategy: Some(strategy),
            failures,
        }
    }

    fn failed(failures: Vec<LoadFailure>) -> Self {
        Self {
            classifier: None,
            strategy: None,
            failures,
        }
    }

    pub fn state(&self) -> LoadState {
        if self.classifier.is_some() {
            LoadState::Loaded
        } else {
            LoadState::Failed
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.classifier.is_some()
    }

    /// 取得分类器；未加载时返回 `ModelUnavailable`。
    pub fn classifier(&self) -> Result<&dyn Classifier, InferenceError> {
        self.classifier
            .as_deref()
            .ok_or(InferenceError::ModelUnavailable)
    }

    /// 成功加载所用的策略名
    pub fn strategy(&self) -> Option<&'static str> {
        self.strategy
    }

    /// 加载过程中记录的失败（成功加载时也可能包含前序策略的失败）
    pub fn failures(&self) -> &[LoadFailure] {
        &self.failures
    }

    pub fn input_shape(&self) -> [usize; 3] {
        [INPUT_HEIGHT, INPUT_WIDTH, INPUT_CHANNELS]
    }

    pub fn num_classes(&self) -> usize {
        NUM_CLASSES
    }
}

impl fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelHandle")
            .field("state", &self.state())
            .field("strategy", &self.strategy)
            .field("failures", &self.failures)
            .finish()
    }
}

struct LoaderInner {
    store: ModelStore,
    strategies: Vec<Arc<dyn LoadStrategy>>,
}

type SharedInit = Shared<BoxFuture<'static, Arc<ModelHandle>>>;

/// 模型加载器：持有唯一的 [`ModelHandle`]，由 `AppState` 注入各处理函数。
///
/// 初始化在独立任务中进行，并发的首次调用共享同一个初始化结果；
/// 调用方被取消不会中断或重复初始化。
pub struct ModelLoader {
    inner: Arc<LoaderInner>,
    init: OnceLock<SharedInit>,
}

impl ModelLoader {
    pub fn new(store: ModelStore, strategies: Vec<Arc<dyn LoadStrategy>>) -> Self {
        Self {
            inner: Arc::new(LoaderInner { store, strategies }),
            init: OnceLock::new(),
        }
    }

    /// 默认策略顺序：按序列化架构直接加载 → 重建架构并仅加载权重。
    pub fn with_default_strategies(store: ModelStore, backbone_weights: Option<PathBuf>) -> Self {
        Self::new(
            store,
            vec![
                Arc::new(SerializedModelStrategy),
                Arc::new(ReconstructedModelStrategy::new(backbone_weights)),
            ],
        )
    }

    pub fn from_config(cfg: &ModelConfig) -> Self {
        Self::with_default_strategies(
            ModelStore::from_config(cfg),
            cfg.backbone_weights_path.as_ref().map(PathBuf::from),
        )
    }

    /// 当前状态；不会触发加载。
    pub fn state(&self) -> LoadState {
        match self.init.get().and_then(|init| init.peek()) {
            Some(handle) => handle.state(),
            None => LoadState::Unloaded,
        }
    }

    /// 获取模型句柄，首次调用时触发加载。
    ///
    /// 从不返回错误：加载失败时返回状态为 `Failed` 的句柄，且之后不再重试。
    pub async fn get_model(&self) -> Arc<ModelHandle> {
        let init = self
            .init
            .get_or_init(|| {
                let inner = self.inner.clone();
                tokio::spawn(async move { inner.initialize().await })
                    .map(|joined| {
                        joined.unwrap_or_else(|e| {
                            tracing::error!("模型初始化任务异常终止: {}", e);
                            Arc::new(ModelHandle::failed(vec![LoadFailure {
                                stage: "loader".to_string(),
                                error: InferenceError::ModelLoad(format!(
                                    "initialization task aborted: {e}"
                                )),
                            }]))
                        })
                    })
                    .boxed()
                    .shared()
            })
            .clone();
        init.await
    }
}

impl LoaderInner {
    async fn initialize(self: Arc<Self>) -> Arc<ModelHandle> {
        tracing::info!("Loading model...");
        let started = Instant::now();

        let path = match self.store.ensure_model_present().await {
            Ok(path) => path,
            Err(e) => {
                tracing::warn!("模型文件不可用: {}", e);
                return Arc::new(ModelHandle::failed(vec![LoadFailure {
                    stage: "store".to_string(),
                    error: e,
                }]));
            }
        };

        // 反序列化与权重拷贝都是 CPU 密集操作，移出 tokio worker。
        let inner = self.clone();
        let handle = tokio::task::spawn_blocking(move || inner.run_strategies(&path))
            .await
            .unwrap_or_else(|e| {
                ModelHandle::failed(vec![LoadFailure {
                    stage: "loader".to_string(),
                    error: InferenceError::ModelLoad(format!("blocking load task failed: {e}")),
                }])
            });

        match handle.strategy() {
            Some(strategy) => tracing::info!(
                "模型加载完成: strategy={}, 耗时 {}ms",
                strategy,
                started.elapsed().as_millis()
            ),
            None => tracing::error!(
                "模型加载失败，服务将以 degraded 状态运行: {}",
                summarize_failures(handle.failures())
            ),
        }
        Arc::new(handle)
    }

    fn run_strategies(&self, path: &Path) -> ModelHandle {
        let mut failures = Vec::new();
        for strategy in &self.strategies {
            let name = strategy.name();
            tracing::info!("尝试加载策略 {}: {:?}", name, path);
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| strategy.load(path)))
                .unwrap_or_else(|panic| {
                    Err(InferenceError::ModelLoad(format!(
                        "strategy panicked: {}",
                        panic_message(panic.as_ref())
                    )))
                });
            match outcome {
                Ok(classifier) => return ModelHandle::loaded(classifier, name, failures),
                Err(error) => {
                    tracing::warn!("加载策略 {} 失败: {}", name, error);
                    failures.push(LoadFailure {
                        stage: name.to_string(),
                        error,
                    });
                }
            }
        }
        if self.strategies.is_empty() {
            failures.push(LoadFailure {
                stage: "loader".to_string(),
                error: InferenceError::ModelLoad("no load strategy configured".to_string()),
            });
        }
        ModelHandle::failed(failures)
    }
}

/// 将失败列表拼成单行描述
pub fn summarize_failures(failures: &[LoadFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed;

    impl Classifier for Fixed {
        fn predict(&self, _input: &PreprocessedTensor) -> Result<Vec<f32>, InferenceError> {
            Ok(vec![0.2; NUM_CLASSES])
        }
    }

    struct Panicking;

    impl LoadStrategy for Panicking {
        fn name(&self) -> &'static str {
            "panicking"
        }

        fn load(&self, _path: &Path) -> Result<Arc<dyn Classifier>, InferenceError> {
            panic!("boom");
        }
    }

    struct Works;

    impl LoadStrategy for Works {
        fn name(&self) -> &'static str {
            "works"
        }

        fn load(&self, _path: &Path) -> Result<Arc<dyn Classifier>, InferenceError> {
            Ok(Arc::new(Fixed))
        }
    }

    fn inner(strategies: Vec<Arc<dyn LoadStrategy>>) -> LoaderInner {
        LoaderInner {
            store: ModelStore::new("unused.safetensors"),
            strategies,
        }
    }

    #[test]
    fn panicking_strategy_falls_through_to_next() {
        let handle = inner(vec![Arc::new(Panicking), Arc::new(Works)])
            .run_strategies(Path::new("unused.safetensors"));
        assert_eq!(handle.state(), LoadState::Loaded);
        assert_eq!(handle.strategy(), Some("works"));
        assert_eq!(handle.failures().len(), 1);
        assert_eq!(handle.failures()[0].stage, "panicking");
        assert!(handle.failures()[0].to_string().contains("boom"));
    }

    #[test]
    fn empty_strategy_list_is_a_failure() {
        let handle = inner(Vec::new()).run_strategies(Path::new("unused.safetensors"));
        assert_eq!(handle.state(), LoadState::Failed);
        assert!(matches!(
            handle.classifier(),
            Err(InferenceError::ModelUnavailable)
        ));
        assert_eq!(handle.failures().len(), 1);
    }

    #[test]
    fn handle_reports_fixed_shapes() {
        let handle = ModelHandle::failed(Vec::new());
        assert_eq!(handle.input_shape(), [224, 224, 3]);
        assert_eq!(handle.num_classes(), 5);
    }
}
