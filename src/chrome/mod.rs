//! chromiumoxide によるブラウザドライバー
//!
//! サイトごとに独立したブラウザを起動し、専用のユーザーデータディレクトリを使う。

mod driver;

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::config::BrowserSettings;
use crate::error::DriverError;
use crate::traits::DriverFactory;

pub use driver::ChromeDriver;

/// 条件待機のポーリング間隔
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// サイトごとにブラウザを起動するファクトリ
#[derive(Debug, Clone, Default)]
pub struct ChromeLauncher {
    settings: BrowserSettings,
}

impl ChromeLauncher {
    pub fn new(settings: BrowserSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &BrowserSettings {
        &self.settings
    }

    /// 起動ごとにユニークなユーザーデータディレクトリ
    fn user_data_dir() -> PathBuf {
        let unique_id = format!(
            "{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos()
        );
        std::env::temp_dir().join(format!("product-scraper-{}", unique_id))
    }

    fn browser_config(&self, user_data_dir: &Path) -> Result<BrowserConfig, DriverError> {
        let (width, height) = self.settings.window_size;
        let mut builder = BrowserConfig::builder()
            .user_data_dir(user_data_dir)
            .window_size(width, height);

        if let Some(path) = &self.settings.chrome_executable {
            builder = builder.chrome_executable(path);
        }

        if !self.settings.headless {
            builder = builder.with_head();
        }

        builder = builder
            .no_sandbox()
            .request_timeout(self.settings.request_timeout)
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-gpu");

        // このブラウザにだけ適用する
        if self.settings.accept_invalid_certs {
            builder = builder.arg("--ignore-certificate-errors");
        }

        builder.build().map_err(DriverError::BrowserInit)
    }
}

#[async_trait]
impl DriverFactory for ChromeLauncher {
    type Driver = ChromeDriver;

    async fn launch(&self) -> Result<ChromeDriver, DriverError> {
        info!("Launching browser (headless={})", self.settings.headless);

        let user_data_dir = Self::user_data_dir();
        let config = self.browser_config(&user_data_dir)?;
        let (browser, mut handler) = match Browser::launch(config).await {
            Ok(launched) => launched,
            Err(e) => {
                remove_user_data_dir(&user_data_dir).await;
                return Err(DriverError::BrowserInit(e.to_string()));
            }
        };

        // ハンドラータスクを起動
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("Browser handler error: {}", e);
                }
            }
        });

        let page = match browser.new_page("about:blank").await {
            Ok(page) => page,
            Err(e) => {
                drop(browser);
                handler_task.abort();
                remove_user_data_dir(&user_data_dir).await;
                return Err(DriverError::BrowserInit(e.to_string()));
            }
        };

        debug!("Browser launched ({:?})", user_data_dir);
        Ok(ChromeDriver::new(
            browser,
            page,
            handler_task,
            user_data_dir,
            self.settings.scroll_step_px,
        ))
    }
}

/// ブラウザ終了後にユーザーデータディレクトリを消す。失敗はログのみ
async fn remove_user_data_dir(path: &Path) {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => debug!("Removed user data dir {:?}", path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove user data dir {:?}: {}", path, e),
    }
}
