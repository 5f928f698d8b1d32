//! サイトプロファイルに従って商品一覧をスクレイピングする
//!
//! 実行方法:
//! ```
//! SCRAPER_PROFILES_PATH=config/site_config.json cargo run --example scrape_sites -- deliveroo justeat
//! ```
//!
//! サイトキーの代わりにURLを渡すと、ホストが一致するプロファイルでそのページを開く。
//! 省略すると登録済みの全サイトを順番に実行する。Ctrl+C で中断。

use product_scraper::{
    CancelFlag, ChromeLauncher, CsvSink, EngineConfig, JsonFileStore, ProfileStore, ScrapeEngine,
    ScrapeRequest, ScrapeTarget, ScraperService,
};
use tower::Service;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // ログ設定
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = EngineConfig::from_env()?;
    let store = JsonFileStore::open(&config.profiles_path)?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|k| k == "--list") {
        for (key, profile) in store.list() {
            println!("{:<16} {} ({})", key, profile.name, profile.url);
        }
        return Ok(());
    }

    println!("=== Product Scraper ===");
    println!("Profiles: {:?}", config.profiles_path);
    println!("Output: {:?}", config.output_dir);
    println!("Headless: {}", config.browser.headless);
    println!();

    let cancel = CancelFlag::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("Cancelling after the current pass...");
            on_ctrl_c.cancel();
        }
    });

    let engine = ScrapeEngine::new(
        ChromeLauncher::new(config.browser.clone()),
        store,
        CsvSink::new(&config.output_dir),
        config,
    );
    let mut service = ScraperService::new(engine);

    let request = ScrapeRequest {
        targets: args.iter().map(|a| ScrapeTarget::parse(a)).collect(),
        cancel,
    };

    let report = service.call(request).await?;

    println!();
    println!("=== Results ===");
    for site in &report.sites {
        let status = if site.success { "OK" } else { "FAILED" };
        println!(
            "[{}] {} ({}) - {} products",
            status, site.site_name, site.site_key, site.product_count
        );
        if let Some(error) = &site.error {
            println!("    error: {}", error);
        }
        if let Some(path) = &site.output {
            println!("    saved: {:?}", path);
        }
        for (i, product) in site.records.iter().take(5).enumerate() {
            println!(
                "    {}. {} {}",
                i + 1,
                product.name,
                product.price.as_deref().unwrap_or("-")
            );
        }
    }
    println!();
    println!(
        "Sites: {}/{} succeeded, {} products in {}s",
        report.succeeded,
        report.total_sites,
        report.total_products,
        (report.finished_at - report.started_at).num_seconds()
    );

    Ok(())
}
