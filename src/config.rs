use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// 全局配置单例
static CONFIG: OnceCell<AppConfig> = OnceCell::new();

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// 监听地址
    pub host: String,
    /// 监听端口
    pub port: u16,
}

/// 模型文件配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// 本地模型文件路径（safetensors 容器）
    pub path: String,
    /// 本地缺失时的下载地址
    #[serde(default)]
    pub download_url: Option<String>,
    /// 期望的 SHA-256（十六进制）；配置后用于校验本地文件与下载结果
    #[serde(default)]
    pub sha256: Option<String>,
    /// 预训练骨干网络权重（重建架构时先行加载，可选）
    #[serde(default)]
    pub backbone_weights_path: Option<String>,
    /// 启动时是否立即加载模型（失败不阻断启动）
    #[serde(default = "ModelConfig::default_eager_load")]
    pub eager_load: bool,
}

impl ModelConfig {
    fn default_eager_load() -> bool {
        true
    }
}

/// 推理配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    /// 并发推理许可数（0=自动，取 CPU 核心数）
    #[serde(default)]
    pub max_parallel: u32,
    /// 上传图片大小上限（字节）
    #[serde(default = "InferenceConfig::default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

impl InferenceConfig {
    fn default_max_upload_bytes() -> usize {
        16 * 1024 * 1024
    }

    /// 实际生效的并发许可数
    pub fn effective_parallelism(&self) -> usize {
        match self.max_parallel {
            0 => num_cpus::get(),
            n => n as usize,
        }
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            max_parallel: 0,
            max_upload_bytes: Self::default_max_upload_bytes(),
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// 日志级别（RUST_LOG 未设置时生效）
    pub level: String,
    /// 日志格式：full | compact
    pub format: String,
}

/// 优雅退出配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// 优雅退出超时（秒）
    #[serde(default = "ShutdownConfig::default_timeout")]
    pub timeout_secs: u64,
}

impl ShutdownConfig {
    fn default_timeout() -> u64 {
        30
    }

    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            timeout_secs: Self::default_timeout(),
        }
    }
}

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub model: ModelConfig,
    #[serde(default)]
    pub inference: InferenceConfig,
    pub logging: LoggingConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

impl AppConfig {
    /// 加载配置：内置默认值 < config.toml（可选）< APP__* 环境变量 < 部署变量
    ///
    /// 部署变量沿用既有约定：`MODEL_PATH`、`MODEL_DOWNLOAD_URL`、`PORT`。
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::get_config_path();

        let builder = ConfigBuilder::builder()
            .add_source(ConfigBuilder::try_from(&AppConfig::default())?)
            .add_source(File::from(config_path).required(false))
            // 例如：APP__SERVER__PORT=8080、APP__MODEL__SHA256=...
            .add_source(
                Environment::with_prefix("APP")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .set_override_option("model.path", non_empty_env("MODEL_PATH"))?
            .set_override_option("model.download_url", non_empty_env("MODEL_DOWNLOAD_URL"))?
            .set_override_option(
                "server.port",
                non_empty_env("PORT")
                    .map(|p| p.parse::<u16>().map(i64::from))
                    .transpose()
                    .map_err(|e| ConfigError::Message(format!("PORT 无效: {e}")))?,
            )?
            .build()?;

        builder.try_deserialize()
    }

    /// 获取全局配置单例
    pub fn global() -> &'static AppConfig {
        CONFIG.get().expect("配置未初始化，请先调用 init_global()")
    }

    /// 初始化全局配置
    pub fn init_global() -> Result<&'static AppConfig, ConfigError> {
        let config = Self::load()?;
        CONFIG
            .set(config)
            .map_err(|_| ConfigError::Message("配置已经被初始化".to_string()))?;
        Ok(Self::global())
    }

    /// 获取配置文件路径
    fn get_config_path() -> PathBuf {
        PathBuf::from("config.toml")
    }

    /// 获取服务器监听地址
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 5001,
            },
            model: ModelConfig {
                path: "./models/model.safetensors".to_string(),
                download_url: None,
                sha256: None,
                backbone_weights_path: None,
                eager_load: ModelConfig::default_eager_load(),
            },
            inference: InferenceConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "full".to_string(),
            },
            shutdown: ShutdownConfig::default(),
        }
    }
}
