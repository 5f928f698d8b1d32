use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// ブラウザコンテキストの起動設定
#[derive(Debug, Clone, PartialEq)]
pub struct BrowserSettings {
    pub headless: bool,
    /// 未指定なら chromiumoxide の自動検出に任せる
    pub chrome_executable: Option<PathBuf>,
    pub window_size: (u32, u32),
    /// 証明書エラーを無視する（起動するブラウザにのみ適用）
    pub accept_invalid_certs: bool,
    /// 1回のスクロール量（px）
    pub scroll_step_px: u32,
    /// CDPリクエストのタイムアウト
    pub request_timeout: Duration,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            headless: true,
            chrome_executable: None,
            window_size: (1920, 1080),
            accept_invalid_certs: false,
            scroll_step_px: 800,
            request_timeout: Duration::from_secs(60),
        }
    }
}

impl BrowserSettings {
    pub fn with_headless(mut self, headless: bool) -> Self {
        self.headless = headless;
        self
    }

    pub fn with_chrome_executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.chrome_executable = Some(path.into());
        self
    }

    pub fn with_accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    pub fn with_scroll_step(mut self, px: u32) -> Self {
        self.scroll_step_px = px;
        self
    }
}

/// エンジン全体の設定
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// スクロール後に新しいカードの描画を待つ上限
    pub settle_interval: Duration,
    /// 新規0件のパスがこの回数連続したら収束とみなす
    pub stagnation_threshold: u32,
    pub document_ready_timeout: Duration,
    pub challenge_timeout: Duration,
    /// ページ本文にこれらが全て含まれている間はチャレンジ中とみなす
    pub challenge_markers: Vec<String>,
    pub location_timeout: Duration,
    /// 商品カードが現れるまでの待機上限
    pub content_timeout: Duration,
    /// バッチ実行時のサイト間の待機
    pub inter_site_delay: Duration,
    pub output_dir: PathBuf,
    pub profiles_path: PathBuf,
    pub browser: BrowserSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            settle_interval: Duration::from_millis(3000),
            stagnation_threshold: 2,
            document_ready_timeout: Duration::from_secs(10),
            challenge_timeout: Duration::from_secs(20),
            challenge_markers: vec!["cloudflare".to_string(), "challenge".to_string()],
            location_timeout: Duration::from_secs(10),
            content_timeout: Duration::from_secs(15),
            inter_site_delay: Duration::from_secs(5),
            output_dir: PathBuf::from("./output"),
            profiles_path: PathBuf::from("./site_config.json"),
            browser: BrowserSettings::default(),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_settle_interval(mut self, interval: Duration) -> Self {
        self.settle_interval = interval;
        self
    }

    pub fn with_stagnation_threshold(mut self, passes: u32) -> Self {
        self.stagnation_threshold = passes;
        self
    }

    pub fn with_inter_site_delay(mut self, delay: Duration) -> Self {
        self.inter_site_delay = delay;
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    pub fn with_profiles_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.profiles_path = path.into();
        self
    }

    pub fn with_browser(mut self, browser: BrowserSettings) -> Self {
        self.browser = browser;
        self
    }

    /// テストやモック用に全ての待機を0にする
    pub fn without_waits(mut self) -> Self {
        self.settle_interval = Duration::ZERO;
        self.document_ready_timeout = Duration::ZERO;
        self.challenge_timeout = Duration::ZERO;
        self.location_timeout = Duration::ZERO;
        self.content_timeout = Duration::ZERO;
        self.inter_site_delay = Duration::ZERO;
        self
    }

    /// `.env` と環境変数から読み込む
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key))
    }

    /// 環境変数の参照関数を受け取って構築する（未設定の項目はデフォルト値）
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let defaults = Self::default();

        let invalid = |var: &str, reason: String| ConfigError::InvalidEnvVar {
            var: var.to_string(),
            reason,
        };
        let parse_u64 = |var: &str| -> Result<Option<u64>, ConfigError> {
            match lookup(var) {
                Ok(raw) => raw
                    .trim()
                    .parse::<u64>()
                    .map(Some)
                    .map_err(|e| invalid(var, e.to_string())),
                Err(_) => Ok(None),
            }
        };
        let parse_bool = |var: &str| -> Result<Option<bool>, ConfigError> {
            match lookup(var) {
                Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
                    "1" | "true" | "yes" | "on" => Ok(Some(true)),
                    "0" | "false" | "no" | "off" => Ok(Some(false)),
                    other => Err(invalid(var, format!("expected a boolean, got {:?}", other))),
                },
                Err(_) => Ok(None),
            }
        };
        let millis = |var: &str, default: Duration| -> Result<Duration, ConfigError> {
            Ok(parse_u64(var)?.map_or(default, Duration::from_millis))
        };
        let secs = |var: &str, default: Duration| -> Result<Duration, ConfigError> {
            Ok(parse_u64(var)?.map_or(default, Duration::from_secs))
        };

        let stagnation_threshold = match parse_u64("SCRAPER_STAGNATION_THRESHOLD")? {
            None => defaults.stagnation_threshold,
            Some(0) => {
                return Err(invalid(
                    "SCRAPER_STAGNATION_THRESHOLD",
                    "must be at least 1".into(),
                ))
            }
            Some(n) => u32::try_from(n)
                .map_err(|e| invalid("SCRAPER_STAGNATION_THRESHOLD", e.to_string()))?,
        };

        let scroll_step_px = match parse_u64("SCRAPER_SCROLL_STEP_PX")? {
            None => defaults.browser.scroll_step_px,
            Some(n) => {
                u32::try_from(n).map_err(|e| invalid("SCRAPER_SCROLL_STEP_PX", e.to_string()))?
            }
        };

        let challenge_markers = match lookup("SCRAPER_CHALLENGE_MARKERS") {
            Ok(raw) => raw
                .split(',')
                .map(|m| m.trim().to_lowercase())
                .filter(|m| !m.is_empty())
                .collect(),
            Err(_) => defaults.challenge_markers,
        };

        // Chrome パス（CHROME_PATH → CHROMIUM_PATH の順）
        let chrome_executable = lookup("CHROME_PATH")
            .or_else(|_| lookup("CHROMIUM_PATH"))
            .ok()
            .map(PathBuf::from);

        let browser = BrowserSettings {
            headless: parse_bool("SCRAPER_HEADLESS")?.unwrap_or(defaults.browser.headless),
            chrome_executable,
            window_size: defaults.browser.window_size,
            accept_invalid_certs: parse_bool("SCRAPER_ACCEPT_INVALID_CERTS")?
                .unwrap_or(defaults.browser.accept_invalid_certs),
            scroll_step_px,
            request_timeout: secs(
                "SCRAPER_REQUEST_TIMEOUT_SECS",
                defaults.browser.request_timeout,
            )?,
        };

        Ok(Self {
            settle_interval: millis("SCRAPER_SETTLE_MS", defaults.settle_interval)?,
            stagnation_threshold,
            document_ready_timeout: secs(
                "SCRAPER_DOCUMENT_READY_TIMEOUT_SECS",
                defaults.document_ready_timeout,
            )?,
            challenge_timeout: secs("SCRAPER_CHALLENGE_TIMEOUT_SECS", defaults.challenge_timeout)?,
            challenge_markers,
            location_timeout: secs("SCRAPER_LOCATION_TIMEOUT_SECS", defaults.location_timeout)?,
            content_timeout: secs("SCRAPER_CONTENT_TIMEOUT_SECS", defaults.content_timeout)?,
            inter_site_delay: secs("SCRAPER_INTER_SITE_DELAY_SECS", defaults.inter_site_delay)?,
            output_dir: lookup("SCRAPER_OUTPUT_DIR").map_or(defaults.output_dir, PathBuf::from),
            profiles_path: lookup("SCRAPER_PROFILES_PATH")
                .map_or(defaults.profiles_path, PathBuf::from),
            browser,
        })
    }
}
