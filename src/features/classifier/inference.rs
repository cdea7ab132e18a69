use super::labels::{NUM_CLASSES, category_for_label, label_for_index};
use super::loader::ModelHandle;
use super::models::PredictionResult;
use super::preprocess::PreprocessedTensor;
use crate::error::InferenceError;

/// 最大概率的下标；并列时取最小下标，NaN 不参与比较。
pub fn argmax(probs: &[f32]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (idx, &p) in probs.iter().enumerate() {
        if p.is_nan() {
            continue;
        }
        match best {
            Some((_, current)) if p <= current => {}
            _ => best = Some((idx, p)),
        }
    }
    best.map(|(idx, _)| idx)
}

/// 将概率分布映射为预测结果。
pub fn map_probabilities(probs: &[f32]) -> Result<PredictionResult, InferenceError> {
    if probs.len() != NUM_CLASSES {
        return Err(InferenceError::Inference(format!(
            "模型输出长度为 {}，期望 {}",
            probs.len(),
            NUM_CLASSES
        )));
    }
    let class_index = argmax(probs)
        .ok_or_else(|| InferenceError::Inference("模型输出全部为 NaN".to_string()))?;
    let class_name = label_for_index(class_index);

    Ok(PredictionResult {
        category: category_for_label(class_name).to_string(),
        class_name: class_name.to_string(),
        confidence: probs[class_index],
        class_index,
    })
}

/// 对单张预处理后的图片做一次前向推理并映射结果。
pub fn classify(
    handle: &ModelHandle,
    tensor: &PreprocessedTensor,
) -> Result<PredictionResult, InferenceError> {
    let classifier = handle.classifier()?;
    let probs = classifier.predict(tensor)?;
    tracing::debug!("Predictions: {:?}", probs);
    map_probabilities(&probs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argmax_picks_maximum() {
        assert_eq!(argmax(&[0.02, 0.01, 0.05, 0.89, 0.03]), Some(3));
        assert_eq!(argmax(&[0.9, 0.05, 0.05]), Some(0));
        assert_eq!(argmax(&[0.1, 0.2, 0.3, 0.15, 0.25]), Some(2));
    }

    #[test]
    fn argmax_ties_resolve_to_lowest_index() {
        assert_eq!(argmax(&[0.2, 0.2, 0.2, 0.2, 0.2]), Some(0));
        assert_eq!(argmax(&[0.1, 0.4, 0.1, 0.4, 0.0]), Some(1));
    }

    #[test]
    fn argmax_ignores_nan() {
        assert_eq!(argmax(&[f32::NAN, 0.1, 0.7, f32::NAN, 0.2]), Some(2));
        assert_eq!(argmax(&[f32::NAN; 3]), None);
        assert_eq!(argmax(&[]), None);
    }

    #[test]
    fn maps_every_class_index() {
        let expected = [
            "streetlight",
            "garbages",
            "others",
            "potholes",
            "waterlogging",
        ];
        for (idx, category) in expected.iter().enumerate() {
            let mut probs = [0.1f32; NUM_CLASSES];
            probs[idx] = 0.6;
            let r = map_probabilities(&probs).expect("map");
            assert_eq!(r.class_index, idx);
            assert_eq!(r.category, *category);
            assert_eq!(r.confidence, probs[r.class_index]);
        }
    }

    #[test]
    fn pothole_example() {
        let r = map_probabilities(&[0.02, 0.01, 0.05, 0.89, 0.03]).expect("map");
        assert_eq!(r.category, "potholes");
        assert_eq!(r.class_name, "Potholes");
        assert_eq!(r.confidence, 0.89);
        assert_eq!(r.class_index, 3);
    }

    #[test]
    fn rejects_wrong_output_length() {
        assert!(matches!(
            map_probabilities(&[0.5, 0.5]),
            Err(InferenceError::Inference(_))
        ));
    }
}
