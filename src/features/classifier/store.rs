//! 模型文件的本地解析与首次下载。

use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;

use crate::config::ModelConfig;
use crate::error::InferenceError;

/// 下载时单次写盘的块大小
pub const DOWNLOAD_CHUNK_SIZE: usize = 8 * 1024;

/// 本地模型文件状态
#[derive(Debug)]
enum LocalState {
    Valid,
    Missing,
    Invalid(String),
}

/// 模型仓库：负责给出一个完整可用的本地模型路径。
#[derive(Debug, Clone)]
pub struct ModelStore {
    local_path: PathBuf,
    download_url: Option<String>,
    expected_sha256: Option<String>,
}

impl ModelStore {
    pub fn new(local_path: impl Into<PathBuf>) -> Self {
        Self {
            local_path: local_path.into(),
            download_url: None,
            expected_sha256: None,
        }
    }

    pub fn from_config(cfg: &ModelConfig) -> Self {
        let mut store = Self::new(&cfg.path);
        if let Some(url) = cfg.download_url.as_deref() {
            store = store.with_download_url(url);
        }
        if let Some(sha) = cfg.sha256.as_deref() {
            store = store.with_sha256(sha);
        }
        store
    }

    pub fn with_download_url(mut self, url: impl Into<String>) -> Self {
        self.download_url = Some(url.into());
        self
    }

    pub fn with_sha256(mut self, hex_digest: impl Into<String>) -> Self {
        self.expected_sha256 = Some(hex_digest.into().trim().to_ascii_lowercase());
        self
    }

    /// 确保本地存在完整的模型文件并返回其路径。
    ///
    /// 本地文件有效时不访问网络；否则从 `download_url` 流式下载，
    /// 仅在下载完整且校验通过后才原子替换到目标路径。
    pub async fn ensure_model_present(&self) -> Result<PathBuf, InferenceError> {
        match self.inspect_local().await {
            LocalState::Valid => {
                tracing::info!("模型文件已存在: {:?}", self.local_path);
                return Ok(self.local_path.clone());
            }
            LocalState::Missing => {
                tracing::info!("本地未找到模型文件: {:?}", self.local_path);
            }
            LocalState::Invalid(reason) => {
                tracing::warn!("本地模型文件无效（{}）: {:?}", reason, self.local_path);
            }
        }

        let Some(url) = self.download_url.as_deref() else {
            return Err(InferenceError::Configuration(format!(
                "no local model and no download source (path: {})",
                self.local_path.display()
            )));
        };

        tracing::info!("开始下载模型: {}", url);
        let bytes = self.download(url).await?;
        tracing::info!("模型下载完成: {} bytes -> {:?}", bytes, self.local_path);
        Ok(self.local_path.clone())
    }

    async fn inspect_local(&self) -> LocalState {
        let meta = match tokio::fs::metadata(&self.local_path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return LocalState::Missing,
            Err(e) => return LocalState::Invalid(format!("读取元数据失败: {e}")),
        };
        if !meta.is_file() {
            return LocalState::Invalid("不是普通文件".to_string());
        }
        if meta.len() == 0 {
            return LocalState::Invalid("文件为空".to_string());
        }

        let Some(expected) = self.expected_sha256.clone() else {
            return LocalState::Valid;
        };
        let path = self.local_path.clone();
        match tokio::task::spawn_blocking(move || sha256_file(&path)).await {
            Ok(Ok(actual)) if actual == expected => LocalState::Valid,
            Ok(Ok(actual)) => LocalState::Invalid(format!(
                "SHA-256 不匹配: expected {expected}, actual {actual}"
            )),
            Ok(Err(e)) => LocalState::Invalid(format!("计算校验和失败: {e}")),
            Err(e) => LocalState::Invalid(format!("校验任务执行失败: {e}")),
        }
    }

    /// 下载到同目录下的临时文件，校验后 rename 到目标路径；返回写入字节数。
    ///
    /// 任一失败路径上临时文件都会随 `TempPath` 析构被删除。
    async fn download(&self, url: &str) -> Result<u64, InferenceError> {
        let client = crate::http::client_download()?;
        let resp = client.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(InferenceError::Download(format!(
                "unexpected HTTP status {status} from {url}"
            )));
        }
        let expected_len = resp.content_length();

        let parent = self
            .local_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| InferenceError::Download(format!("创建模型目录失败: {e}")))?;

        let tmp = tempfile::Builder::new()
            .prefix(".model-")
            .suffix(".part")
            .tempfile_in(parent)
            .map_err(|e| InferenceError::Download(format!("创建临时文件失败: {e}")))?;
        let (std_file, tmp_path) = tmp.into_parts();
        let mut file = tokio::fs::File::from_std(std_file);

        let mut hasher = Sha256::new();
        let mut written: u64 = 0;
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| InferenceError::Download(format!("下载中断: {e}")))?;
            for piece in chunk.chunks(DOWNLOAD_CHUNK_SIZE) {
                file.write_all(piece)
                    .await
                    .map_err(|e| InferenceError::Download(format!("写入临时文件失败: {e}")))?;
            }
            hasher.update(&chunk);
            written += chunk.len() as u64;
        }
        file.flush()
            .await
            .map_err(|e| InferenceError::Download(format!("刷新临时文件失败: {e}")))?;
        file.sync_all()
            .await
            .map_err(|e| InferenceError::Download(format!("同步临时文件失败: {e}")))?;
        drop(file);

        if written == 0 {
            return Err(InferenceError::Download("下载内容为空".to_string()));
        }
        if let Some(expected) = expected_len {
            if expected != written {
                return Err(InferenceError::Download(format!(
                    "下载不完整: expected {expected} bytes, got {written}"
                )));
            }
        }
        if let Some(expected) = self.expected_sha256.as_deref() {
            let actual = hex::encode(hasher.finalize());
            if actual != expected {
                return Err(InferenceError::Download(format!(
                    "SHA-256 不匹配: expected {expected}, actual {actual}"
                )));
            }
        }

        tmp_path
            .persist(&self.local_path)
            .map_err(|e| InferenceError::Download(format!("移动模型文件失败: {}", e.error)))?;
        Ok(written)
    }
}

fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_file_matches_known_digest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("abc.bin");
        std::fs::write(&path, b"abc").expect("write");
        assert_eq!(
            sha256_file(&path).expect("hash"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn checksum_is_normalized() {
        let store = ModelStore::new("m.safetensors").with_sha256("  ABCDEF ");
        assert_eq!(store.expected_sha256.as_deref(), Some("abcdef"));
    }

    #[tokio::test]
    async fn empty_local_file_is_invalid() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("model.safetensors");
        std::fs::write(&path, b"").expect("write");
        let state = ModelStore::new(&path).inspect_local().await;
        assert!(matches!(state, LocalState::Invalid(_)), "got {state:?}");
    }
}
