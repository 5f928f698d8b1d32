use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::Browser;
use chromiumoxide::element::Element;
use chromiumoxide::Page;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::debug;

use crate::error::DriverError;
use crate::traits::{Attribute, BrowserDriver, Condition};

use super::{remove_user_data_dir, POLL_INTERVAL};

/// 1サイト分のブラウザとページ
pub struct ChromeDriver {
    browser: Mutex<Option<Browser>>,
    page: Page,
    handler_task: JoinHandle<()>,
    user_data_dir: PathBuf,
    scroll_step_px: u32,
}

impl ChromeDriver {
    pub(super) fn new(
        browser: Browser,
        page: Page,
        handler_task: JoinHandle<()>,
        user_data_dir: PathBuf,
        scroll_step_px: u32,
    ) -> Self {
        Self {
            browser: Mutex::new(Some(browser)),
            page,
            handler_task,
            user_data_dir,
            scroll_step_px,
        }
    }

    pub fn page(&self) -> &Page {
        &self.page
    }

    /// このブラウザ専用のユーザーデータディレクトリ（`close` で削除される）
    pub fn user_data_dir(&self) -> &Path {
        &self.user_data_dir
    }

    async fn eval_bool(&self, script: &str) -> Result<bool, DriverError> {
        self.page
            .evaluate(script)
            .await
            .map_err(|e| DriverError::JavaScript(e.to_string()))?
            .into_value::<bool>()
            .map_err(|e| DriverError::JavaScript(e.to_string()))
    }

    async fn selector_count(&self, selector: &str) -> Result<usize, DriverError> {
        let literal = js_string(selector)?;
        let script = format!(
            "(() => {{ try {{ return document.querySelectorAll({}).length; }} catch (e) {{ return 0; }} }})()",
            literal
        );
        self.page
            .evaluate(script.as_str())
            .await
            .map_err(|e| DriverError::JavaScript(e.to_string()))?
            .into_value::<usize>()
            .map_err(|e| DriverError::JavaScript(e.to_string()))
    }

    /// 条件を1回だけ評価する
    async fn check(&self, condition: &Condition) -> Result<bool, DriverError> {
        match condition {
            Condition::DocumentReady => {
                self.eval_bool("document.readyState === 'complete'").await
            }
            Condition::SelectorPresent(selector) => Ok(self.selector_count(selector).await? > 0),
            Condition::SelectorCountAtLeast { selector, count } => {
                Ok(self.selector_count(selector).await? >= *count)
            }
            Condition::ChallengeCleared { markers } => {
                let content = self
                    .page
                    .content()
                    .await
                    .map_err(|e| DriverError::JavaScript(e.to_string()))?
                    .to_lowercase();
                // 全てのマーカーが含まれている間はチャレンジ中
                Ok(!markers.iter().all(|m| content.contains(m.as_str())))
            }
        }
    }
}

/// JavaScript の文字列リテラルにする
fn js_string(value: &str) -> Result<String, DriverError> {
    serde_json::to_string(value).map_err(|e| DriverError::JavaScript(e.to_string()))
}

#[async_trait]
impl BrowserDriver for ChromeDriver {
    type Node = Element;

    async fn navigate(&self, url: &str) -> Result<(), DriverError> {
        self.page
            .goto(url)
            .await
            .map_err(|e| DriverError::Navigation(e.to_string()))?;
        self.page
            .wait_for_navigation()
            .await
            .map_err(|e| DriverError::Navigation(e.to_string()))?;
        debug!("Navigated to {}", url);
        Ok(())
    }

    async fn find(&self, selector: &str) -> Result<Vec<Element>, DriverError> {
        self.page
            .find_elements(selector)
            .await
            .map_err(|e| DriverError::Element(format!("{}: {}", selector, e)))
    }

    async fn find_within(&self, node: &Element, selector: &str) -> Result<Vec<Element>, DriverError> {
        node.find_elements(selector)
            .await
            .map_err(|e| DriverError::Element(format!("{}: {}", selector, e)))
    }

    async fn read(&self, node: &Element, attribute: &Attribute) -> Result<Option<String>, DriverError> {
        let value = match attribute {
            Attribute::Text => node.inner_text().await,
            Attribute::Named(name) => node.attribute(name.as_str()).await,
        };
        value.map_err(|e| DriverError::Element(format!("{}: {}", attribute, e)))
    }

    async fn scroll(&self) -> Result<(), DriverError> {
        let script = format!("window.scrollBy(0, {})", self.scroll_step_px);
        self.page
            .evaluate(script.as_str())
            .await
            .map_err(|e| DriverError::JavaScript(e.to_string()))?;
        Ok(())
    }

    async fn wait(&self, condition: &Condition, timeout: Duration) -> Result<bool, DriverError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.check(condition).await? {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                debug!("Condition not met within {:?}: {:?}", timeout, condition);
                return Ok(false);
            }
            sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn fill(&self, node: &Element, value: &str) -> Result<(), DriverError> {
        node.click()
            .await
            .map_err(|e| DriverError::Element(format!("入力欄クリック: {}", e)))?;
        node.type_str(value)
            .await
            .map_err(|e| DriverError::Element(format!("入力: {}", e)))?;
        Ok(())
    }

    async fn click(&self, node: &Element) -> Result<(), DriverError> {
        node.click()
            .await
            .map_err(|e| DriverError::Element(format!("クリック: {}", e)))?;
        Ok(())
    }

    async fn submit(&self, node: &Element) -> Result<(), DriverError> {
        node.press_key("Enter")
            .await
            .map_err(|e| DriverError::Element(format!("Enter: {}", e)))?;
        Ok(())
    }

    async fn close(&self) -> Result<(), DriverError> {
        let Some(mut browser) = self.browser.lock().await.take() else {
            return Ok(());
        };

        let result = browser
            .close()
            .await
            .map(|_| ())
            .map_err(|e| DriverError::Closed(e.to_string()));
        if let Err(e) = browser.wait().await {
            debug!("Browser process wait failed: {}", e);
        }
        self.handler_task.abort();
        // プロセス終了後に消す
        remove_user_data_dir(&self.user_data_dir).await;
        debug!("Browser closed");
        result
    }
}
