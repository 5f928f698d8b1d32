use std::path::PathBuf;

use thiserror::Error;

/// 設定エラー
///
/// サイトプロファイルの読み込み・更新時にのみ発生する。スクレイピング中には発生しない。
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("必須フィールドがありません: {site_key}.{field}")]
    MissingField { site_key: String, field: String },

    #[error("フィールドの値が不正です: {site_key}.{field}: {reason}")]
    InvalidField {
        site_key: String,
        field: String,
        reason: String,
    },

    #[error("フィルター指定が不正です: {site_key}.{field}: {source}")]
    Filter {
        site_key: String,
        field: String,
        #[source]
        source: FilterParseError,
    },

    #[error("サイトキーが一致しません: expected={expected}, actual={actual}")]
    KeyMismatch { expected: String, actual: String },

    #[error("サイトが見つかりません: {0}")]
    UnknownSite(String),

    #[error("URLに対応するサイトプロファイルがありません: {0}")]
    NoProfileForUrl(String),

    #[error("設定ファイルを読み込めません: {path}: {source}")]
    FileIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("設定ファイルを解析できません: {path}: {source}")]
    FileParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("環境変数 {var} が不正です: {reason}")]
    InvalidEnvVar { var: String, reason: String },
}

/// フィルター参照文字列の解析エラー
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FilterParseError {
    #[error("未知のフィルター: {0}")]
    Unknown(String),

    #[error("フィルター {name} にはパラメータが必要です")]
    MissingParam { name: String },

    #[error("フィルター {name} はパラメータを取りません")]
    UnexpectedParam { name: String },

    #[error("フィルター {name} のパラメータが不正です: {param}")]
    InvalidParam { name: String, param: String },
}

/// ブラウザドライバーが返すエラー
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("ブラウザ初期化エラー: {0}")]
    BrowserInit(String),

    #[error("ナビゲーションエラー: {0}")]
    Navigation(String),

    #[error("JavaScript実行エラー: {0}")]
    JavaScript(String),

    #[error("要素操作エラー: {0}")]
    Element(String),

    #[error("ブラウザが終了しています: {0}")]
    Closed(String),
}

#[derive(Error, Debug)]
pub enum ScraperError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("ブラウザ初期化エラー [{site_key}]: {source}")]
    BrowserInit {
        site_key: String,
        #[source]
        source: DriverError,
    },

    #[error("ナビゲーション失敗 [{site_key}]: {source}")]
    Navigation {
        site_key: String,
        #[source]
        source: DriverError,
    },

    #[error("スクレイピング失敗 [{site_key}]: {source}")]
    Scrape {
        site_key: String,
        #[source]
        source: DriverError,
    },

    #[error("CSV出力エラー: {0}")]
    Csv(#[from] csv::Error),

    #[error("ファイル操作エラー: {0}")]
    FileIO(#[from] std::io::Error),
}

impl ScraperError {
    /// 失敗したサイトのキー（サイトに紐付くエラーのみ）
    pub fn site_key(&self) -> Option<&str> {
        match self {
            ScraperError::BrowserInit { site_key, .. }
            | ScraperError::Navigation { site_key, .. }
            | ScraperError::Scrape { site_key, .. } => Some(site_key),
            _ => None,
        }
    }
}
