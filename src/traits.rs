use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::DriverError;

/// 要素から読み取る値（テキストまたは属性）
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Attribute {
    Text,
    Named(String),
}

impl Attribute {
    pub fn named(name: impl Into<String>) -> Self {
        Attribute::Named(name.into())
    }

    pub fn is_named(&self, name: &str) -> bool {
        matches!(self, Attribute::Named(n) if n.eq_ignore_ascii_case(name))
    }
}

impl From<String> for Attribute {
    fn from(s: String) -> Self {
        if s.eq_ignore_ascii_case("text") {
            Attribute::Text
        } else {
            Attribute::Named(s)
        }
    }
}

impl From<Attribute> for String {
    fn from(attr: Attribute) -> Self {
        attr.to_string()
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Attribute::Text => f.write_str("text"),
            Attribute::Named(name) => f.write_str(name),
        }
    }
}

/// ドライバー側で評価される待機条件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    /// `document.readyState === "complete"`
    DocumentReady,
    /// セレクタに一致する要素が1つ以上ある
    SelectorPresent(String),
    /// セレクタに一致する要素が `count` 個以上ある
    SelectorCountAtLeast { selector: String, count: usize },
    /// ページ本文（小文字化）がマーカーの全てを含む状態ではなくなった
    ChallengeCleared { markers: Vec<String> },
}

/// エンジンが依存するブラウザ操作の最小セット
///
/// 要素ハンドルの型は実装ごとに異なるため関連型にしている。
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    type Node: Send + Sync;

    /// URLへ遷移
    async fn navigate(&self, url: &str) -> Result<(), DriverError>;

    /// ページ全体から要素を検索
    async fn find(&self, selector: &str) -> Result<Vec<Self::Node>, DriverError>;

    /// 要素配下から要素を検索
    async fn find_within(
        &self,
        node: &Self::Node,
        selector: &str,
    ) -> Result<Vec<Self::Node>, DriverError>;

    /// テキストまたは属性を読む（存在しない場合は `None`）
    async fn read(&self, node: &Self::Node, attribute: &Attribute)
        -> Result<Option<String>, DriverError>;

    /// 1回分のスクロール
    async fn scroll(&self) -> Result<(), DriverError>;

    /// 条件が満たされるまで待機。タイムアウトした場合は `Ok(false)`
    async fn wait(&self, condition: &Condition, timeout: Duration) -> Result<bool, DriverError>;

    /// 入力欄に値を入力
    async fn fill(&self, node: &Self::Node, value: &str) -> Result<(), DriverError>;

    async fn click(&self, node: &Self::Node) -> Result<(), DriverError>;

    /// 入力欄でEnterキーを送信
    async fn submit(&self, node: &Self::Node) -> Result<(), DriverError>;

    /// リソース解放
    async fn close(&self) -> Result<(), DriverError>;
}

/// サイトごとにブラウザコンテキストを起動する
#[async_trait]
pub trait DriverFactory: Send + Sync {
    type Driver: BrowserDriver;

    async fn launch(&self) -> Result<Self::Driver, DriverError>;
}
