use std::sync::Arc;

use civiclens_ml::features::classifier::ModelLoader;
use civiclens_ml::startup::spawn_model_warmup;
use civiclens_ml::{AppConfig, AppState, ShutdownManager, build_router};

fn init_tracing(config: &AppConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("civiclens_ml={},tower_http=info", config.logging.level).into()
    });
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.logging.format.eq_ignore_ascii_case("compact") {
        builder.compact().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() {
    // Load config（日志级别来自配置，因此先于 tracing 初始化）
    let config = match AppConfig::init_global() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config init failed: {e}");
            std::process::exit(1);
        }
    };
    init_tracing(config);
    tracing::info!(
        "配置已加载: model.path={}, download_url={}",
        config.model.path,
        config.model.download_url.as_deref().unwrap_or("<none>")
    );

    let shutdown_manager = ShutdownManager::new();
    if let Err(e) = shutdown_manager.start_signal_handler() {
        tracing::error!("信号处理器启动失败: {}", e);
        std::process::exit(1);
    }

    let model_loader = Arc::new(ModelLoader::from_config(&config.model));
    if config.model.eager_load {
        // 失败只会让服务进入 degraded，不阻断启动。
        let _warmup = spawn_model_warmup(model_loader.clone());
    }

    let parallelism = config.inference.effective_parallelism();
    tracing::info!("并发推理许可数: {}", parallelism);
    let app_state = AppState::new(model_loader, parallelism);
    let app = build_router(app_state, config.inference.max_upload_bytes);

    let addr = config.server_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .unwrap_or_else(|e| {
            tracing::error!("Bind address failed {}: {}", addr, e);
            std::process::exit(1);
        });

    tracing::info!("Server: http://{}", addr);
    tracing::info!("Docs: http://{}/docs", addr);
    tracing::info!("Health: http://{}/health", addr);
    tracing::info!("Predict: POST http://{}/predict", addr);

    let shutdown_timeout = config.shutdown.timeout_duration();
    let signal_manager = shutdown_manager.clone();
    let graceful = axum::serve(listener, app).with_graceful_shutdown(async move {
        let reason = signal_manager.wait_for_shutdown().await;
        tracing::info!("接收到退出信号: {:?}，开始优雅关闭HTTP服务器...", reason);
    });

    // 收到信号后给在途请求留出超时窗口，超时则直接退出。
    let mut server = tokio::spawn(async move { graceful.await });
    let reason = tokio::select! {
        joined = &mut server => {
            match joined {
                Ok(Ok(())) => tracing::info!("服务器已关闭"),
                Ok(Err(e)) => tracing::error!("服务器运行错误: {}", e),
                Err(e) => tracing::error!("服务器任务异常终止: {}", e),
            }
            std::process::exit(1);
        }
        reason = shutdown_manager.wait_for_shutdown() => reason,
    };

    match tokio::time::timeout(shutdown_timeout, server).await {
        Ok(Ok(Ok(()))) => tracing::info!("服务器已优雅关闭 ({:?})", reason),
        Ok(Ok(Err(e))) => {
            tracing::error!("服务器运行错误: {}", e);
            std::process::exit(1);
        }
        Ok(Err(e)) => {
            tracing::error!("服务器任务异常终止: {}", e);
            std::process::exit(1);
        }
        Err(_) => {
            tracing::warn!(
                "优雅退出超时（{}秒），强制退出",
                config.shutdown.timeout_secs
            );
            std::process::exit(1);
        }
    }
}
