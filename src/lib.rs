//! 商品一覧スクレイパーライブラリ
//!
//! サイトごとの宣言的なプロファイル（JSON）に従って商品一覧ページを開き、
//! スクロールしながら商品カードを抽出・重複除去してCSVに保存する。
//!
//! - [`profile`]: サイトプロファイル・抽出ルール・フィルター
//! - [`navigation`]: 入口ページの準備（チャレンジ待機・郵便番号入力）
//! - [`session`]: スクロール抽出ループ
//! - [`service`]: サイト単位／バッチ実行と tower::Service
//!
//! # 使用例
//!
//! ```rust,ignore
//! use product_scraper::{
//!     ChromeLauncher, CsvSink, EngineConfig, JsonFileStore, ScrapeEngine, ScrapeRequest,
//!     ScraperService,
//! };
//! use tower::Service;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = EngineConfig::from_env().unwrap();
//!     let store = JsonFileStore::open(&config.profiles_path).unwrap();
//!     let engine = ScrapeEngine::new(
//!         ChromeLauncher::new(config.browser.clone()),
//!         store,
//!         CsvSink::new(&config.output_dir),
//!         config,
//!     );
//!
//!     let mut service = ScraperService::new(engine);
//!     let report = service.call(ScrapeRequest::sites(["deliveroo"])).await.unwrap();
//!     println!("Products: {}", report.total_products);
//! }
//! ```

pub mod aggregate;
pub mod chrome;
pub mod config;
pub mod error;
pub mod extract;
pub mod navigation;
pub mod profile;
pub mod service;
pub mod session;
pub mod sink;
pub mod traits;

#[cfg(test)]
mod testing;

// 主要な型をリエクスポート
pub use aggregate::{BatchReport, ProductRecord, SiteReport};
pub use chrome::{ChromeDriver, ChromeLauncher};
pub use config::{BrowserSettings, EngineConfig};
pub use error::{ConfigError, DriverError, ScraperError};
pub use extract::{ExtractedRecord, IdentityKey};
pub use navigation::{LocationOutcome, NavigationController, Readiness};
pub use profile::{
    FieldRule, Filter, JsonFileStore, MemoryProfileStore, ProfileStore, SiteProfile,
};
pub use service::{ScrapeEngine, ScrapeRequest, ScrapeTarget, ScraperService};
pub use session::{CancelFlag, LoopState, ScrollLoop};
pub use sink::{CsvSink, ProductSink};
pub use traits::{Attribute, BrowserDriver, Condition, DriverFactory};
