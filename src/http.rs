use once_cell::sync::OnceCell;
use reqwest::Client;
use std::time::Duration;

/// 模型下载专用的 HTTP Client（进程内复用连接池）。
///
/// 只限制建连耗时；模型文件体积较大，不设置整体请求超时。
static CLIENT_DOWNLOAD: OnceCell<Client> = OnceCell::new();

pub fn client_download() -> Result<&'static Client, reqwest::Error> {
    CLIENT_DOWNLOAD.get_or_try_init(|| {
        Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .user_agent(concat!("civiclens-ml/", env!("CARGO_PKG_VERSION")))
            .build()
    })
}
