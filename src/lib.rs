/// 统一错误处理模块
pub mod error;

/// 配置模块
pub mod config;

/// 启动期任务模块
pub mod startup;

/// 功能聚合模块
pub mod features;

/// 应用状态聚合模块
pub mod state;

/// 优雅退出管理模块
pub mod shutdown;

/// HTTP Client 复用工具
pub mod http;

/// 请求追踪 ID 中间件
pub mod request_id;

/// OpenAPI 文档
pub mod openapi;

/// 路由组装
pub mod app;

// 导出常用类型供外部使用
pub use app::build_router;
pub use config::AppConfig;
pub use error::{AppError, InferenceError};
pub use shutdown::{ShutdownManager, ShutdownReason};
pub use state::AppState;
