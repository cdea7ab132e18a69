/// 启动期模型预加载
pub mod warmup;

pub use warmup::spawn_model_warmup;
