//! 类别索引 → 展示标签 → 下游类别码 的静态映射。

/// 模型输出的类别数
pub const NUM_CLASSES: usize = 5;

/// 未知标签映射到的默认类别码
pub const DEFAULT_CATEGORY: &str = "others";

/// 索引越界时使用的展示标签
pub const UNKNOWN_LABEL: &str = "Unknown";

/// 按类别索引排列的展示标签（与训练时的类别顺序一致）
pub const CLASS_LABELS: [&str; NUM_CLASSES] = [
    "Broken Missing Streetlight",
    "Garbages",
    "Others",
    "Potholes",
    "Waterlogging",
];

/// 展示标签 → 下游系统使用的小写类别码
const CATEGORY_CODES: [(&str, &str); NUM_CLASSES] = [
    ("Broken Missing Streetlight", "streetlight"),
    ("Garbages", "garbages"),
    ("Others", "others"),
    ("Potholes", "potholes"),
    ("Waterlogging", "waterlogging"),
];

/// 类别索引对应的展示标签；越界返回 `Unknown`。
pub fn label_for_index(index: usize) -> &'static str {
    CLASS_LABELS.get(index).copied().unwrap_or(UNKNOWN_LABEL)
}

/// 展示标签对应的类别码；未登记的标签返回 `others`。
pub fn category_for_label(label: &str) -> &'static str {
    CATEGORY_CODES
        .iter()
        .find(|(l, _)| *l == label)
        .map(|(_, code)| *code)
        .unwrap_or(DEFAULT_CATEGORY)
}
