//! 分类网络：ResNet50 骨干（全局平均池化输出 2048 维）+ 全连接分类头。
//!
//! 同一套构建代码服务两条加载路径：
//! - 按模型文件中序列化的架构描述构建（严格绑定权重）；
//! - 按代码内置的标准架构重建（宽松覆盖权重）。

use candle_core::{D, DType, Device, Module, Tensor};
use candle_nn::{Dropout, Func, Linear, VarBuilder};
use serde::{Deserialize, Serialize};

use super::labels::NUM_CLASSES;
use super::loader::Classifier;
use super::preprocess::{INPUT_CHANNELS, INPUT_HEIGHT, INPUT_SHAPE, INPUT_WIDTH, PreprocessedTensor};
use crate::error::InferenceError;

/// safetensors `__metadata__` 中保存架构描述的键
pub const ARCHITECTURE_METADATA_KEY: &str = "architecture";

/// 当前支持的架构描述版本
pub const ARCHITECTURE_FORMAT_VERSION: u32 = 1;

pub const BACKBONE_NAME: &str = "resnet50";
pub const BACKBONE_FEATURES: usize = 2048;
pub const HIDDEN_UNITS: usize = 256;
pub const DROPOUT_RATE: f32 = 0.4;

/// 权重命名前缀
pub const BACKBONE_PREFIX: &str = "backbone";
pub const HEAD_PREFIX: &str = "head";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    Linear,
    Relu,
    Softmax,
}

impl Activation {
    fn apply(self, xs: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Activation::Linear => Ok(xs.clone()),
            Activation::Relu => xs.relu(),
            Activation::Softmax => candle_nn::ops::softmax(xs, D::Minus1),
        }
    }
}

/// 分类头中的一层
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LayerSpec {
    GlobalAveragePooling,
    Dense {
        name: String,
        units: usize,
        activation: Activation,
    },
    Dropout {
        rate: f32,
    },
}

/// 模型文件内序列化的架构描述
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchitectureSpec {
    pub format_version: u32,
    pub backbone: String,
    pub input_shape: [usize; 3],
    pub layers: Vec<LayerSpec>,
}

impl ArchitectureSpec {
    /// 训练时使用的架构：GAP → Dense(256, relu) → Dropout(0.4) → Dense(5, softmax)
    pub fn standard() -> Self {
        Self {
            format_version: ARCHITECTURE_FORMAT_VERSION,
            backbone: BACKBONE_NAME.to_string(),
            input_shape: [INPUT_HEIGHT, INPUT_WIDTH, INPUT_CHANNELS],
            layers: vec![
                LayerSpec::GlobalAveragePooling,
                LayerSpec::Dense {
                    name: "dense".to_string(),
                    units: HIDDEN_UNITS,
                    activation: Activation::Relu,
                },
                LayerSpec::Dropout { rate: DROPOUT_RATE },
                LayerSpec::Dense {
                    name: "predictions".to_string(),
                    units: NUM_CLASSES,
                    activation: Activation::Softmax,
                },
            ],
        }
    }

    pub fn from_json(raw: &str) -> Result<Self, InferenceError> {
        let spec: Self = serde_json::from_str(raw)
            .map_err(|e| InferenceError::ModelLoad(format!("架构描述解析失败: {e}")))?;
        spec.validate()?;
        Ok(spec)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// 校验描述是否能由本服务构建，且输入/输出与预处理和类别表一致。
    pub fn validate(&self) -> Result<(), InferenceError> {
        let fail = |msg: String| Err(InferenceError::ModelLoad(msg));

        if self.format_version != ARCHITECTURE_FORMAT_VERSION {
            return fail(format!(
                "不支持的架构描述版本 {}（支持 {}）",
                self.format_version, ARCHITECTURE_FORMAT_VERSION
            ));
        }
        if self.backbone != BACKBONE_NAME {
            return fail(format!("不支持的骨干网络: {}", self.backbone));
        }
        if self.input_shape != [INPUT_HEIGHT, INPUT_WIDTH, INPUT_CHANNELS] {
            return fail(format!("输入形状不匹配: {:?}", self.input_shape));
        }
        // 骨干输出已做全局平均池化，描述中必须紧随其后声明。
        if self.layers.first() != Some(&LayerSpec::GlobalAveragePooling) {
            return fail("骨干之后的第一层必须是 global_average_pooling".to_string());
        }

        let mut names = std::collections::HashSet::new();
        for layer in &self.layers[1..] {
            match layer {
                LayerSpec::GlobalAveragePooling => {
                    return fail("global_average_pooling 只能出现一次".to_string());
                }
                LayerSpec::Dense { name, units, .. } => {
                    if name.is_empty() || name.contains('.') {
                        return fail(format!("非法的层名: {name:?}"));
                    }
                    if !names.insert(name.as_str()) {
                        return fail(format!("层名重复: {name}"));
                    }
                    if *units == 0 {
                        return fail(format!("层 {name} 的 units 为 0"));
                    }
                }
                LayerSpec::Dropout { rate } => {
                    if !(0.0..1.0).contains(rate) {
                        return fail(format!("dropout rate 越界: {rate}"));
                    }
                }
            }
        }

        match self.layers.iter().rev().find(|l| !matches!(l, LayerSpec::Dropout { .. })) {
            Some(LayerSpec::Dense {
                units, activation, ..
            }) if *units == NUM_CLASSES && *activation == Activation::Softmax => Ok(()),
            _ => fail(format!(
                "输出层必须是 {NUM_CLASSES} 单元的 softmax 全连接层"
            )),
        }
    }
}

enum HeadLayer {
    Dense {
        linear: Linear,
        activation: Activation,
    },
    Dropout(Dropout),
}

/// 构建完成的分类网络（CPU，f32）。
///
/// 前向计算只读取不可变张量，可在多个线程上并发执行。
pub struct ResNetClassifier {
    backbone: Func<'static>,
    head: Vec<HeadLayer>,
    device: Device,
}

impl ResNetClassifier {
    /// 按架构描述创建网络并从 `vb` 绑定全部参数。
    pub fn build(spec: &ArchitectureSpec, vb: VarBuilder<'static>) -> candle_core::Result<Self> {
        let device = vb.device().clone();
        let backbone =
            candle_transformers::models::resnet::resnet50_no_final_layer(vb.pp(BACKBONE_PREFIX))?;

        let head_vb = vb.pp(HEAD_PREFIX);
        let mut in_dim = BACKBONE_FEATURES;
        let mut head = Vec::with_capacity(spec.layers.len());
        for layer in &spec.layers {
            match layer {
                LayerSpec::GlobalAveragePooling => {}
                LayerSpec::Dense {
                    name,
                    units,
                    activation,
                } => {
                    let linear = candle_nn::linear(in_dim, *units, head_vb.pp(name))?;
                    in_dim = *units;
                    head.push(HeadLayer::Dense {
                        linear,
                        activation: *activation,
                    });
                }
                LayerSpec::Dropout { rate } => head.push(HeadLayer::Dropout(Dropout::new(*rate))),
            }
        }

        Ok(Self {
            backbone,
            head,
            device,
        })
    }

    /// NCHW 输入 → 概率分布 (batch, classes)
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let mut xs = self.backbone.forward(xs)?;
        for layer in &self.head {
            xs = match layer {
                HeadLayer::Dense { linear, activation } => activation.apply(&linear.forward(&xs)?)?,
                // 推理阶段 dropout 为恒等变换
                HeadLayer::Dropout(dropout) => dropout.forward(&xs, false)?,
            };
        }
        Ok(xs)
    }
}

impl Classifier for ResNetClassifier {
    fn predict(&self, input: &PreprocessedTensor) -> Result<Vec<f32>, InferenceError> {
        let [n, h, w, c] = INPUT_SHAPE;
        let run = || -> candle_core::Result<Vec<f32>> {
            let xs = Tensor::from_slice(input.as_slice(), (n, h, w, c), &self.device)?
                .permute((0, 3, 1, 2))?
                .contiguous()?;
            self.forward(&xs)?
                .squeeze(0)?
                .to_dtype(DType::F32)?
                .to_vec1::<f32>()
        };
        run().map_err(|e| InferenceError::Inference(e.to_string()))
    }
}
