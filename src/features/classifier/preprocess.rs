//! 上传图片 → 模型输入张量。
//!
//! 步骤顺序必须与训练期保持一致：解码 → 转 RGB → 224×224 直接缩放 → NHWC + batch 维 → ImageNet 归一化。
//!
//! 骨干网络为 torchvision 布局的 ResNet50，归一化与其预训练权重配套：
//! RGB 通道顺序，像素缩放到 [0, 1] 后按通道减均值、除标准差。
//! 解码全程在内存中完成，不落盘；中间缓冲随函数返回释放。

use std::io::Cursor;

use image::{ImageReader, imageops::FilterType};

use crate::error::InferenceError;

pub const INPUT_HEIGHT: usize = 224;
pub const INPUT_WIDTH: usize = 224;
pub const INPUT_CHANNELS: usize = 3;

/// 模型输入形状 (batch, height, width, channels)
pub const INPUT_SHAPE: [usize; 4] = [1, INPUT_HEIGHT, INPUT_WIDTH, INPUT_CHANNELS];

/// ImageNet 通道均值（RGB）
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];

/// ImageNet 通道标准差（RGB）
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// 预处理后的输入张量，NHWC 布局，通道顺序为 RGB。
#[derive(Debug, Clone, PartialEq)]
pub struct PreprocessedTensor {
    data: Vec<f32>,
}

impl PreprocessedTensor {
    /// 由已归一化的 NHWC 数据构造；长度必须与 [`INPUT_SHAPE`] 一致。
    pub fn from_vec(data: Vec<f32>) -> Result<Self, InferenceError> {
        let expected = INPUT_SHAPE.iter().product::<usize>();
        if data.len() != expected {
            return Err(InferenceError::Inference(format!(
                "输入长度 {} 与期望形状 {:?} 不符",
                data.len(),
                INPUT_SHAPE
            )));
        }
        Ok(Self { data })
    }

    pub fn shape(&self) -> [usize; 4] {
        INPUT_SHAPE
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// 读取 (y, x) 处的三个通道值（RGB）。
    #[cfg(test)]
    pub fn pixel(&self, y: usize, x: usize) -> Option<[f32; 3]> {
        if y >= INPUT_HEIGHT || x >= INPUT_WIDTH {
            return None;
        }
        let base = (y * INPUT_WIDTH + x) * INPUT_CHANNELS;
        Some([self.data[base], self.data[base + 1], self.data[base + 2]])
    }
}

/// 将上传的原始字节转换为模型输入。
pub fn preprocess(raw: &[u8]) -> Result<PreprocessedTensor, InferenceError> {
    let decoded = ImageReader::new(Cursor::new(raw))
        .with_guessed_format()
        .map_err(|e| InferenceError::Decode(format!("无法识别图片格式: {e}")))?
        .decode()?;

    // 灰度/调色板/带 alpha 统一转为三通道 RGB；alpha 直接丢弃。
    let rgb = decoded.to_rgb8();
    drop(decoded);

    // 不保持宽高比、不裁剪，与训练期的 resize 行为一致。
    let resized = image::imageops::resize(
        &rgb,
        INPUT_WIDTH as u32,
        INPUT_HEIGHT as u32,
        FilterType::CatmullRom,
    );

    let mut data = Vec::with_capacity(INPUT_SHAPE.iter().product());
    for px in resized.pixels() {
        for (c, &v) in px.0.iter().enumerate() {
            data.push((f32::from(v) / 255.0 - IMAGENET_MEAN[c]) / IMAGENET_STD[c]);
        }
    }

    PreprocessedTensor::from_vec(data)
}
