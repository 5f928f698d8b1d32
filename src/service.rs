use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use chrono::Utc;
use tower::Service;
use tracing::{error, info, warn};

use crate::aggregate::{aggregate, BatchReport, ProductRecord, SiteReport};
use crate::config::EngineConfig;
use crate::error::{ConfigError, ScraperError};
use crate::profile::{ProfileStore, SiteProfile};
use crate::session::{CancelFlag, ScrollLoop};
use crate::sink::ProductSink;
use crate::traits::{BrowserDriver, DriverFactory};

/// サイト単位・バッチ単位の実行を束ねるエンジン
pub struct ScrapeEngine<F, S, K> {
    factory: F,
    store: S,
    sink: K,
    config: EngineConfig,
    scroll_loop: ScrollLoop,
}

impl<F, S, K> ScrapeEngine<F, S, K>
where
    F: DriverFactory,
    S: ProfileStore,
    K: ProductSink,
{
    pub fn new(factory: F, store: S, sink: K, config: EngineConfig) -> Self {
        let scroll_loop = ScrollLoop::new(&config);
        Self {
            factory,
            store,
            sink,
            config,
            scroll_loop,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// 1サイトを実行する。失敗もレポートとして返す
    pub async fn scrape_site(&self, site_key: &str, cancel: &CancelFlag) -> SiteReport {
        match self.store.get(site_key) {
            Ok(profile) => self.run_profile(profile, cancel).await,
            Err(e) => {
                warn!(site_key, "Profile lookup failed: {}", e);
                SiteReport::failed(site_key, site_key, e, Vec::new(), 0, None)
            }
        }
    }

    /// URLのホストからプロファイルを選び、そのURLを入口にして実行する
    pub async fn scrape_url(&self, url: &str, cancel: &CancelFlag) -> SiteReport {
        match self.profile_for_url(url) {
            Ok(profile) => self.run_profile(profile, cancel).await,
            Err(e) => {
                warn!(url, "Profile lookup failed: {}", e);
                SiteReport::failed(url, url, e, Vec::new(), 0, None)
            }
        }
    }

    fn profile_for_url(&self, url: &str) -> Result<SiteProfile, ConfigError> {
        let profile = self
            .store
            .find_by_url(url)
            .ok_or_else(|| ConfigError::NoProfileForUrl(url.to_string()))?;
        info!(url, "Detected site: {}", profile.key);
        profile.with_entry_url(url)
    }

    async fn run_profile(&self, profile: SiteProfile, cancel: &CancelFlag) -> SiteReport {
        let site_key = profile.key.as_str();
        info!(site_key, "Scraping {} ({})", profile.name, profile.url);

        let driver = match self.factory.launch().await {
            Ok(driver) => driver,
            Err(source) => {
                let e = ScraperError::BrowserInit {
                    site_key: profile.key.clone(),
                    source,
                };
                error!("{}", e);
                return SiteReport::failed(&profile.key, &profile.name, e, Vec::new(), 0, None);
            }
        };

        let result = self.scroll_loop.run(&driver, &profile, cancel).await;

        // 成否に関わらず次のサイトの前に閉じる
        if let Err(e) = driver.close().await {
            warn!(site_key, "Failed to close browser: {}", e);
        }

        match result {
            Ok(outcome) => {
                let products = aggregate(&profile, outcome.records);
                match self.sink.write(&profile.key, &products).await {
                    Ok(output) => {
                        info!(
                            site_key,
                            "Scraped {} products ({:?}, {} passes)",
                            products.len(),
                            outcome.state,
                            outcome.passes
                        );
                        SiteReport::succeeded(&profile, products, outcome.state, outcome.passes, output)
                    }
                    Err(e) => {
                        error!(site_key, "Failed to save products: {}", e);
                        SiteReport::failed(&profile.key, &profile.name, e, products, outcome.passes, None)
                    }
                }
            }
            Err(fault) => {
                error!("{}", fault.error);
                let products = aggregate(&profile, fault.records);
                let output = self.persist_partial(&profile, &products).await;
                SiteReport::failed(
                    &profile.key,
                    &profile.name,
                    fault.error,
                    products,
                    fault.passes,
                    output,
                )
            }
        }
    }

    /// 障害前に集めた分も保存する。保存の失敗はログのみ
    ///
    /// 何も集まらなかった場合は前回のファイルをそのまま残す。
    async fn persist_partial(
        &self,
        profile: &SiteProfile,
        products: &[ProductRecord],
    ) -> Option<std::path::PathBuf> {
        if products.is_empty() {
            return None;
        }
        match self.sink.write(&profile.key, products).await {
            Ok(output) => {
                info!(site_key = %profile.key, "Kept {} products gathered before the failure", products.len());
                output
            }
            Err(e) => {
                warn!(site_key = %profile.key, "Failed to save partial products: {}", e);
                None
            }
        }
    }

    /// 指定サイトを順番に実行する
    pub async fn scrape_batch(&self, site_keys: &[String], cancel: &CancelFlag) -> BatchReport {
        let targets: Vec<ScrapeTarget> = site_keys.iter().cloned().map(ScrapeTarget::Site).collect();
        self.scrape_targets(&targets, cancel).await
    }

    /// 対象を順番に実行する。サイト間で `inter_site_delay` だけ待つ（最初の前は待たない）
    pub async fn scrape_targets(&self, targets: &[ScrapeTarget], cancel: &CancelFlag) -> BatchReport {
        let started_at = Utc::now();
        let mut reports = Vec::with_capacity(targets.len());

        info!("Batch started: {} sites", targets.len());

        for (i, target) in targets.iter().enumerate() {
            if cancel.is_cancelled() {
                let (site_key, site_name) = self.describe(target);
                reports.push(SiteReport::failed(
                    site_key,
                    site_name,
                    "キャンセルされたため未実行",
                    Vec::new(),
                    0,
                    None,
                ));
                continue;
            }

            if i > 0 && !self.config.inter_site_delay.is_zero() {
                info!("Waiting {:?} before next site", self.config.inter_site_delay);
                tokio::time::sleep(self.config.inter_site_delay).await;
            }

            let report = match target {
                ScrapeTarget::Site(site_key) => self.scrape_site(site_key, cancel).await,
                ScrapeTarget::Url(url) => self.scrape_url(url, cancel).await,
            };
            reports.push(report);
        }

        let report = BatchReport::new(started_at, reports);
        info!(
            "Batch finished: {}/{} sites succeeded, {} products",
            report.succeeded, report.total_sites, report.total_products
        );
        report
    }

    /// 未実行の対象をレポートするためのキーと表示名
    fn describe(&self, target: &ScrapeTarget) -> (String, String) {
        let profile = match target {
            ScrapeTarget::Site(site_key) => self.store.get(site_key).ok(),
            ScrapeTarget::Url(url) => self.store.find_by_url(url),
        };
        match profile {
            Some(profile) => (profile.key, profile.name),
            None => (target.label().to_string(), target.label().to_string()),
        }
    }

    /// 登録済みの全サイトを実行する
    pub async fn scrape_all(&self, cancel: &CancelFlag) -> BatchReport {
        let keys: Vec<String> = self.store.list().into_keys().collect();
        self.scrape_batch(&keys, cancel).await
    }
}

/// バッチの1件分の実行対象
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScrapeTarget {
    /// 登録済みのサイトキー
    Site(String),
    /// ホストでプロファイルを選び、このURLを入口にする
    Url(String),
}

impl ScrapeTarget {
    /// `http(s)://` で始まればURL、それ以外はサイトキー
    pub fn parse(value: &str) -> Self {
        let lower = value.trim().to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            Self::Url(value.trim().to_string())
        } else {
            Self::Site(value.trim().to_string())
        }
    }

    pub fn label(&self) -> &str {
        match self {
            Self::Site(value) | Self::Url(value) => value,
        }
    }
}

/// スクレイピングリクエスト
#[derive(Debug, Clone, Default)]
pub struct ScrapeRequest {
    /// 空なら登録済みの全サイト
    pub targets: Vec<ScrapeTarget>,
    pub cancel: CancelFlag,
}

impl ScrapeRequest {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn sites<I, T>(site_keys: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self {
            targets: site_keys.into_iter().map(|k| ScrapeTarget::Site(k.into())).collect(),
            cancel: CancelFlag::new(),
        }
    }

    pub fn urls<I, T>(urls: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self {
            targets: urls.into_iter().map(|u| ScrapeTarget::Url(u.into())).collect(),
            cancel: CancelFlag::new(),
        }
    }

    /// URLを対象に追加する
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.targets.push(ScrapeTarget::Url(url.into()));
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }
}

/// tower::Serviceを実装したスクレイパーサービス
pub struct ScraperService<F, S, K> {
    engine: Arc<ScrapeEngine<F, S, K>>,
}

impl<F, S, K> Clone for ScraperService<F, S, K> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
        }
    }
}

impl<F, S, K> ScraperService<F, S, K>
where
    F: DriverFactory,
    S: ProfileStore,
    K: ProductSink,
{
    pub fn new(engine: ScrapeEngine<F, S, K>) -> Self {
        Self {
            engine: Arc::new(engine),
        }
    }

    pub fn engine(&self) -> &ScrapeEngine<F, S, K> {
        &self.engine
    }
}

impl<F, S, K> Service<ScrapeRequest> for ScraperService<F, S, K>
where
    F: DriverFactory + 'static,
    S: ProfileStore + 'static,
    K: ProductSink + 'static,
{
    type Response = BatchReport;
    type Error = ScraperError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: ScrapeRequest) -> Self::Future {
        info!("スクレイピングリクエスト受信: targets={:?}", req.targets);
        let engine = Arc::clone(&self.engine);

        Box::pin(async move {
            let report = if req.targets.is_empty() {
                engine.scrape_all(&req.cancel).await
            } else {
                engine.scrape_targets(&req.targets, &req.cancel).await
            };
            Ok(report)
        })
    }
}
