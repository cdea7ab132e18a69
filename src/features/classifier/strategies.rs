//! 两级加载策略。
//!
//! 1. `serialized`：按模型文件 `__metadata__` 中的架构描述构建网络，权重必须逐一对应；
//! 2. `reconstructed`：在代码中重建训练时的标准架构，只按名称与形状拷贝可用的权重。
//!
//! 第二级用于应对模型文件由不同版本工具链导出、架构描述缺失或不兼容的情况。

use std::path::{Path, PathBuf};
use std::sync::Arc;

use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};

use super::architecture::{ARCHITECTURE_METADATA_KEY, ArchitectureSpec, ResNetClassifier};
use super::loader::{Classifier, LoadStrategy};
use super::weights::{OverlayReport, load_tensors, overlay_weights, read_metadata};
use crate::error::InferenceError;

fn build_error(e: candle_core::Error) -> InferenceError {
    InferenceError::ModelLoad(format!("构建网络失败: {e}"))
}

/// 直接反序列化：架构 + 权重完整匹配。
#[derive(Debug, Default, Clone, Copy)]
pub struct SerializedModelStrategy;

impl LoadStrategy for SerializedModelStrategy {
    fn name(&self) -> &'static str {
        "serialized"
    }

    fn load(&self, path: &Path) -> Result<Arc<dyn Classifier>, InferenceError> {
        let metadata = read_metadata(path)?;
        let raw = metadata.get(ARCHITECTURE_METADATA_KEY).ok_or_else(|| {
            InferenceError::ModelLoad("模型文件未包含序列化的架构描述".to_string())
        })?;
        let spec = ArchitectureSpec::from_json(raw)?;

        let tensors = load_tensors(path)?;
        let vb = VarBuilder::from_tensors(tensors, DType::F32, &Device::Cpu);
        let model = ResNetClassifier::build(&spec, vb).map_err(build_error)?;
        Ok(Arc::new(model))
    }
}

/// 重建标准架构后仅加载权重；名称不存在或形状不符的参数保留初始值。
#[derive(Debug, Default, Clone)]
pub struct ReconstructedModelStrategy {
    /// 预训练骨干权重（torchvision 命名，不含 `backbone.` 前缀）
    backbone_weights: Option<PathBuf>,
}

impl ReconstructedModelStrategy {
    pub fn new(backbone_weights: Option<PathBuf>) -> Self {
        Self { backbone_weights }
    }
}

impl ReconstructedModelStrategy {
    /// 重建网络并覆盖权重，返回网络与模型文件权重的覆盖统计。
    fn reconstruct(&self, path: &Path) -> Result<(ResNetClassifier, OverlayReport), InferenceError> {
        // 先读权重：文件不可读时无需构建网络。
        let tensors = load_tensors(path)?;

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model =
            ResNetClassifier::build(&ArchitectureSpec::standard(), vb).map_err(build_error)?;

        if let Some(backbone_path) = &self.backbone_weights {
            let pretrained = load_tensors(backbone_path)?;
            let report = overlay_weights(&varmap, &pretrained, "backbone.")?;
            tracing::info!(
                "预训练骨干权重: applied={}, skipped={}, missing={}",
                report.applied,
                report.shape_mismatch.len(),
                report.missing
            );
        }

        let report = overlay_weights(&varmap, &tensors, "")?;
        tracing::info!(
            "模型权重: applied={}, skipped={}, missing={}",
            report.applied,
            report.shape_mismatch.len(),
            report.missing
        );
        if !report.shape_mismatch.is_empty() {
            tracing::warn!("形状不符而跳过的参数: {:?}", report.shape_mismatch);
        }
        if report.applied == 0 {
            return Err(InferenceError::ModelLoad(
                "模型文件中没有与重建架构匹配的权重".to_string(),
            ));
        }

        Ok((model, report))
    }
}

impl LoadStrategy for ReconstructedModelStrategy {
    fn name(&self) -> &'static str {
        "reconstructed"
    }

    fn load(&self, path: &Path) -> Result<Arc<dyn Classifier>, InferenceError> {
        let (model, _report) = self.reconstruct(path)?;
        Ok(Arc::new(model))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::features::classifier::architecture::{BACKBONE_FEATURES, HIDDEN_UNITS};
    use crate::features::classifier::preprocess::{INPUT_SHAPE, PreprocessedTensor};
    use crate::features::classifier::weights::test_support::{write_safetensors, write_tensor_map};
    use candle_core::Tensor;

    fn blank_input() -> PreprocessedTensor {
        PreprocessedTensor::from_vec(vec![0.0; INPUT_SHAPE.iter().product()]).expect("input")
    }

    fn assert_distribution(probs: &[f32]) {
        assert_eq!(probs.len(), 5);
        assert!(probs.iter().all(|p| p.is_finite() && *p >= 0.0), "{probs:?}");
        let sum: f32 = probs.iter().sum();
        assert!((sum - 1.0).abs() < 1e-4, "sum = {sum}");
    }

    /// 按标准架构初始化一份完整参数表。
    fn standard_parameters() -> HashMap<String, Tensor> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let _model = ResNetClassifier::build(&ArchitectureSpec::standard(), vb).expect("build");
        let vars = varmap.data().lock().expect("lock");
        vars.iter()
            .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
            .collect()
    }

    #[test]
    fn serialized_requires_architecture_metadata() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("model.safetensors");
        write_safetensors(&path, &[("head.dense.bias", vec![1], vec![0.0])], &HashMap::new());

        let err = SerializedModelStrategy.load(&path).err().expect("must fail");
        assert!(matches!(err, InferenceError::ModelLoad(_)), "got {err:?}");
    }

    #[test]
    fn serialized_rejects_incompatible_architecture_before_building() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("model.safetensors");
        let mut spec = ArchitectureSpec::standard();
        spec.backbone = "vgg16".to_string();
        let meta = HashMap::from([(ARCHITECTURE_METADATA_KEY.to_string(), spec.to_json())]);
        write_safetensors(&path, &[("head.dense.bias", vec![1], vec![0.0])], &meta);

        let err = SerializedModelStrategy.load(&path).err().expect("must fail");
        assert!(err.to_string().contains("vgg16"), "got {err}");
    }

    #[test]
    fn both_strategies_reject_non_safetensors_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("model.h5");
        std::fs::write(&path, b"\x89HDF\r\n\x1a\n not really").expect("write");

        assert!(SerializedModelStrategy.load(&path).is_err());
        assert!(ReconstructedModelStrategy::default().load(&path).is_err());
    }

    #[test]
    fn reconstructed_loads_head_only_artifact_and_skips_mismatched_shapes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("model.safetensors");
        // 隐藏层全零：输出只取决于 predictions.bias，结果可预期。
        let mut bias = vec![0.0f32; 5];
        bias[3] = 2.0;
        write_safetensors(
            &path,
            &[
                (
                    "head.dense.weight",
                    vec![HIDDEN_UNITS, BACKBONE_FEATURES],
                    vec![0.0; HIDDEN_UNITS * BACKBONE_FEATURES],
                ),
                ("head.dense.bias", vec![HIDDEN_UNITS], vec![0.0; HIDDEN_UNITS]),
                // 旧版 7 分类输出层
                ("head.predictions.weight", vec![7, HIDDEN_UNITS], vec![0.1; 7 * HIDDEN_UNITS]),
                ("head.predictions.bias", vec![5], bias),
            ],
            &HashMap::new(),
        );

        let (model, report) = ReconstructedModelStrategy::default()
            .reconstruct(&path)
            .expect("reconstruct");
        assert_eq!(report.applied, 3);
        assert_eq!(report.shape_mismatch, vec!["head.predictions.weight".to_string()]);
        assert!(report.missing > 0);

        let probs = model.predict(&blank_input()).expect("predict");
        assert_distribution(&probs);
        assert!(probs[3] > probs[0], "{probs:?}");
    }

    #[test]
    fn reconstructed_rejects_artifact_without_matching_weights() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("model.safetensors");
        write_safetensors(&path, &[("classifier.w", vec![2], vec![1.0, 2.0])], &HashMap::new());

        let err = ReconstructedModelStrategy::default()
            .load(&path)
            .err()
            .expect("must fail");
        assert!(matches!(err, InferenceError::ModelLoad(_)), "got {err:?}");
    }

    #[test]
    fn serialized_loads_complete_artifact_and_requires_every_parameter() {
        let dir = tempfile::tempdir().expect("tempdir");
        let meta = HashMap::from([(
            ARCHITECTURE_METADATA_KEY.to_string(),
            ArchitectureSpec::standard().to_json(),
        )]);
        let mut params = standard_parameters();

        let complete = dir.path().join("complete.safetensors");
        write_tensor_map(&complete, &params, &meta);
        let model = SerializedModelStrategy.load(&complete).expect("load");
        assert_distribution(&model.predict(&blank_input()).expect("predict"));

        params.remove("head.predictions.bias");
        let partial = dir.path().join("partial.safetensors");
        write_tensor_map(&partial, &params, &meta);
        assert!(SerializedModelStrategy.load(&partial).is_err());
    }
}
