//! safetensors 权重容器的读取，以及按名称/形状的宽松权重覆盖。

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

use candle_core::{Device, Tensor};
use candle_nn::VarMap;

use crate::error::InferenceError;

/// 头部长度上限，防止损坏文件导致巨额分配
const MAX_HEADER_BYTES: u64 = 100 * 1024 * 1024;

/// 读取 safetensors 头部中的 `__metadata__`（不加载张量数据）。
pub fn read_metadata(path: &Path) -> Result<HashMap<String, String>, InferenceError> {
    let mut file = std::fs::File::open(path)
        .map_err(|e| InferenceError::ModelLoad(format!("打开模型文件失败: {e}")))?;

    let mut len_buf = [0u8; 8];
    file.read_exact(&mut len_buf)
        .map_err(|e| InferenceError::ModelLoad(format!("读取 safetensors 头部长度失败: {e}")))?;
    let header_len = u64::from_le_bytes(len_buf);
    if header_len == 0 || header_len > MAX_HEADER_BYTES {
        return Err(InferenceError::ModelLoad(format!(
            "safetensors 头部长度异常: {header_len}"
        )));
    }

    let mut header = vec![0u8; header_len as usize];
    file.read_exact(&mut header)
        .map_err(|e| InferenceError::ModelLoad(format!("读取 safetensors 头部失败: {e}")))?;
    let header: serde_json::Value = serde_json::from_slice(&header)
        .map_err(|e| InferenceError::ModelLoad(format!("safetensors 头部不是合法 JSON: {e}")))?;

    let metadata = header
        .get("__metadata__")
        .and_then(|m| m.as_object())
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default();
    Ok(metadata)
}

/// 加载容器内全部张量到 CPU。
pub fn load_tensors(path: &Path) -> Result<HashMap<String, Tensor>, InferenceError> {
    candle_core::safetensors::load(path, &Device::Cpu).map_err(|e| {
        InferenceError::ModelLoad(format!("读取权重失败 {}: {e}", path.display()))
    })
}

/// 一次权重覆盖的统计
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OverlayReport {
    /// 成功写入的参数数
    pub applied: usize,
    /// 名称匹配但形状不符而跳过的参数
    pub shape_mismatch: Vec<String>,
    /// 网络中存在但容器中缺失的参数数
    pub missing: usize,
}

/// 将 `tensors` 中名称与形状都匹配的张量写入 `varmap`。
///
/// 仅处理名称以 `prefix` 开头的参数，查找容器时去掉该前缀；
/// 形状不符的参数保持原值并记录，不视为错误。
pub fn overlay_weights(
    varmap: &VarMap,
    tensors: &HashMap<String, Tensor>,
    prefix: &str,
) -> Result<OverlayReport, InferenceError> {
    let vars = varmap
        .data()
        .lock()
        .map_err(|_| InferenceError::ModelLoad("参数表锁已中毒".to_string()))?;

    let mut report = OverlayReport::default();
    for (name, var) in vars.iter() {
        let Some(key) = name.strip_prefix(prefix) else {
            continue;
        };
        let Some(src) = tensors.get(key) else {
            report.missing += 1;
            continue;
        };
        if src.dims() != var.dims() {
            tracing::debug!(
                "跳过形状不符的参数 {}: 期望 {:?}，实际 {:?}",
                name,
                var.dims(),
                src.dims()
            );
            report.shape_mismatch.push(name.clone());
            continue;
        }
        src.to_dtype(var.dtype())
            .and_then(|t| var.set(&t))
            .map_err(|e| InferenceError::ModelLoad(format!("写入参数 {name} 失败: {e}")))?;
        report.applied += 1;
    }
    report.shape_mismatch.sort();
    Ok(report)
}


#[cfg(test)]
mod tests {
    use super::test_support::write_safetensors;
    use super::*;
    use candle_core::DType;
    use candle_nn::VarBuilder;

    #[test]
    fn reads_metadata_and_tensors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("w.safetensors");
        let meta = HashMap::from([("architecture".to_string(), "{}".to_string())]);
        write_safetensors(&path, &[("a.weight", vec![2, 2], vec![1.0, 2.0, 3.0, 4.0])], &meta);

        let got = read_metadata(&path).expect("metadata");
        assert_eq!(got.get("architecture").map(String::as_str), Some("{}"));

        let tensors = load_tensors(&path).expect("tensors");
        assert_eq!(tensors["a.weight"].dims(), &[2, 2]);
    }

    #[test]
    fn missing_metadata_yields_empty_map() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("w.safetensors");
        write_safetensors(&path, &[("a", vec![1], vec![0.5])], &HashMap::new());
        assert!(read_metadata(&path).expect("metadata").is_empty());
    }

    #[test]
    fn garbage_is_not_a_weight_container() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("w.safetensors");
        std::fs::write(&path, b"this is not a model file at all").expect("write");
        assert!(matches!(read_metadata(&path), Err(InferenceError::ModelLoad(_))));
        assert!(matches!(load_tensors(&path), Err(InferenceError::ModelLoad(_))));
    }

    #[test]
    fn overlay_applies_matching_and_skips_mismatched_shapes() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let hidden = candle_nn::linear(3, 2, vb.pp("head").pp("dense")).expect("dense");
        let _out = candle_nn::linear(2, 5, vb.pp("head").pp("predictions")).expect("out");

        let tensors = HashMap::from([
            (
                "head.dense.weight".to_string(),
                Tensor::new(&[[1f32, 2., 3.], [4., 5., 6.]], &Device::Cpu).expect("t"),
            ),
            (
                "head.dense.bias".to_string(),
                Tensor::new(&[0.5f32, -0.5], &Device::Cpu).expect("t"),
            ),
            // 类别数不同的旧输出层：形状不符，应跳过
            (
                "head.predictions.weight".to_string(),
                Tensor::zeros((7, 2), DType::F32, &Device::Cpu).expect("t"),
            ),
            (
                "unrelated.tensor".to_string(),
                Tensor::zeros(1, DType::F32, &Device::Cpu).expect("t"),
            ),
        ]);

        let report = overlay_weights(&varmap, &tensors, "").expect("overlay");
        assert_eq!(report.applied, 2);
        assert_eq!(report.shape_mismatch, vec!["head.predictions.weight".to_string()]);
        assert_eq!(report.missing, 1);

        let w: Vec<Vec<f32>> = hidden.weight().to_vec2().expect("weight");
        assert_eq!(w, vec![vec![1., 2., 3.], vec![4., 5., 6.]]);
    }

    #[test]
    fn overlay_strips_prefix_for_backbone_weights() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let fc = candle_nn::linear(1, 1, vb.pp("backbone").pp("fc")).expect("fc");
        let _head = candle_nn::linear(1, 1, vb.pp("head").pp("dense")).expect("head");

        let tensors = HashMap::from([
            (
                "fc.weight".to_string(),
                Tensor::new(&[[3f32]], &Device::Cpu).expect("t"),
            ),
            (
                "fc.bias".to_string(),
                Tensor::new(&[1f32], &Device::Cpu).expect("t"),
            ),
        ]);
        let report = overlay_weights(&varmap, &tensors, "backbone.").expect("overlay");
        assert_eq!(report.applied, 2);
        assert_eq!(report.missing, 0);
        let w: Vec<Vec<f32>> = fc.weight().to_vec2().expect("weight");
        assert_eq!(w, vec![vec![3.]]);
    }
}
