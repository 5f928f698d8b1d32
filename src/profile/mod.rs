//! サイトプロファイル
//!
//! 1サイト分の入口URL・位置情報入力・スクロール回数・フィールド抽出ルールをまとめた宣言的設定。
//! 設定ファイル上の形（[`RawSiteProfile`]）を検証してから型付きの [`SiteProfile`] にする。

pub mod filter;
pub mod store;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ConfigError;
use crate::traits::Attribute;

pub use filter::Filter;
pub use store::{JsonFileStore, MemoryProfileStore, ProfileStore};

pub const NAME_FIELD: &str = "name";
pub const PRICE_FIELD: &str = "price";
pub const IMAGE_FIELD: &str = "image";

/// scroll_budget 未指定時のスクロール回数
pub const DEFAULT_SCROLL_BUDGET: u32 = 20;

/// フィールドの種類（値の後処理とフィルター可否が変わる）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Name,
    Price,
    Image,
    Other,
}

impl FieldKind {
    pub fn of(field: &str) -> Self {
        match field {
            NAME_FIELD => FieldKind::Name,
            PRICE_FIELD => FieldKind::Price,
            IMAGE_FIELD => FieldKind::Image,
            _ => FieldKind::Other,
        }
    }

    pub fn is_url(self) -> bool {
        self == FieldKind::Image
    }
}

/// 位置情報入力UIのセレクタ（未指定なら組み込みの候補を使う）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationSelectors {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submit_selector: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dismiss_selectors: Vec<String>,
}

/// フィールド抽出ルール
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldRule {
    /// カード内の候補要素を指すセレクタ
    pub selector: String,
    pub primary_attribute: Attribute,
    /// 主属性が空の場合に読む属性
    pub fallback_attribute: Option<Attribute>,
    /// 最初に現れたマーカーの直後で値を切り詰める
    pub trim_markers: Vec<String>,
    pub filters: Vec<Filter>,
    /// 相対URLの結合先
    pub base_url: Option<String>,
    /// srcset 候補の位置（負数は末尾から）
    pub srcset_index: Option<i64>,
}

impl FieldRule {
    pub fn new(selector: impl Into<String>, primary_attribute: Attribute) -> Self {
        Self {
            selector: selector.into(),
            primary_attribute,
            fallback_attribute: None,
            trim_markers: Vec::new(),
            filters: Vec::new(),
            base_url: None,
            srcset_index: None,
        }
    }

    pub fn with_fallback(mut self, attribute: Attribute) -> Self {
        self.fallback_attribute = Some(attribute);
        self
    }

    pub fn with_trim_markers<I, S>(mut self, markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.trim_markers = markers.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_filters(mut self, filters: impl IntoIterator<Item = Filter>) -> Self {
        self.filters = filters.into_iter().collect();
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteProfile {
    pub key: String,
    pub name: String,
    pub url: String,
    pub requires_location: bool,
    pub location_value: Option<String>,
    pub location: LocationSelectors,
    pub scroll_budget: u32,
    /// 商品カードのセレクタ。フィールドのセレクタはカード内で評価される
    pub card_selector: String,
    pub fields: BTreeMap<String, FieldRule>,
}

impl SiteProfile {
    pub fn field(&self, name: &str) -> Option<&FieldRule> {
        self.fields.get(name)
    }

    /// 入口URLだけを差し替えた複製（同じサイトの別店舗・別メニューを対象にする）
    pub fn with_entry_url(&self, url: &str) -> Result<Self, ConfigError> {
        let mut profile = self.clone();
        profile.url = url.trim().to_string();
        profile.validate()?;
        Ok(profile)
    }

    /// 入口URLのホスト（小文字、先頭の `www.` を除く）
    pub fn host(&self) -> Option<String> {
        normalized_host(&self.url)
    }

    /// 設定ファイル上の形から検証付きで構築
    pub fn from_raw(key: impl Into<String>, raw: RawSiteProfile) -> Result<Self, ConfigError> {
        let key = key.into();
        let missing = |field: &str| ConfigError::MissingField {
            site_key: key.clone(),
            field: field.to_string(),
        };

        let scroll_budget = match raw.scroll_budget {
            None => DEFAULT_SCROLL_BUDGET,
            Some(n) => u32::try_from(n).map_err(|_| ConfigError::InvalidField {
                site_key: key.clone(),
                field: "scroll_budget".into(),
                reason: format!("must be a positive integer, got {}", n),
            })?,
        };

        let mut fields = BTreeMap::new();
        for (field, rule) in raw.fields {
            let rule = rule.into_rule(&key, &field)?;
            fields.insert(field, rule);
        }

        let name = raw.name.ok_or_else(|| missing("name"))?;
        let url = raw.url.ok_or_else(|| missing("url"))?;
        let card_selector = raw.card_selector.ok_or_else(|| missing("card_selector"))?;

        let profile = SiteProfile {
            key,
            name,
            url,
            requires_location: raw.requires_location,
            location_value: raw.location_value,
            location: raw.location,
            scroll_budget,
            card_selector,
            fields,
        };
        profile.validate()?;
        Ok(profile)
    }

    /// 設定ファイル上の形に戻す
    pub fn to_raw(&self) -> RawSiteProfile {
        RawSiteProfile {
            name: Some(self.name.clone()),
            url: Some(self.url.clone()),
            requires_location: self.requires_location,
            location_value: self.location_value.clone(),
            location: self.location.clone(),
            scroll_budget: Some(i64::from(self.scroll_budget)),
            card_selector: Some(self.card_selector.clone()),
            fields: self
                .fields
                .iter()
                .map(|(name, rule)| (name.clone(), RawFieldRule::from(rule)))
                .collect(),
        }
    }

    /// 不変条件の検証
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &str, reason: &str| ConfigError::InvalidField {
            site_key: self.key.clone(),
            field: field.to_string(),
            reason: reason.to_string(),
        };
        let missing = |field: &str| ConfigError::MissingField {
            site_key: self.key.clone(),
            field: field.to_string(),
        };

        if self.key.trim().is_empty() {
            return Err(invalid("key", "must not be empty"));
        }
        if self.name.trim().is_empty() {
            return Err(invalid("name", "must not be empty"));
        }
        if let Err(reason) = check_http_url(&self.url) {
            return Err(invalid("url", &reason));
        }

        let has_location = self
            .location_value
            .as_deref()
            .is_some_and(|v| !v.trim().is_empty());
        if self.requires_location && !has_location {
            return Err(missing("location_value"));
        }
        if !self.requires_location && self.location_value.is_some() {
            return Err(invalid("location_value", "set while requires_location is false"));
        }

        if self.scroll_budget == 0 {
            return Err(invalid("scroll_budget", "must be a positive integer"));
        }
        if self.card_selector.trim().is_empty() {
            return Err(invalid("card_selector", "must not be empty"));
        }

        for required in [NAME_FIELD, IMAGE_FIELD] {
            if !self.fields.contains_key(required) {
                return Err(missing(&format!("fields.{}", required)));
            }
        }

        for (field, rule) in &self.fields {
            let path = format!("fields.{}", field);
            if rule.selector.trim().is_empty() {
                return Err(invalid(&format!("{}.selector", path), "must not be empty"));
            }
            if let Some(base_url) = &rule.base_url {
                if let Err(reason) = check_http_url(base_url) {
                    return Err(invalid(&format!("{}.base_url", path), &reason));
                }
            }
            if rule.trim_markers.iter().any(|m| m.is_empty()) {
                return Err(invalid(&format!("{}.trim_after", path), "empty marker"));
            }
            if FieldKind::of(field).is_url() && !rule.filters.is_empty() {
                return Err(invalid(
                    &format!("{}.filters", path),
                    "text filters cannot be attached to URL fields",
                ));
            }
        }

        Ok(())
    }
}

/// ホストを持つ http(s) の絶対URLか
fn check_http_url(raw: &str) -> Result<Url, String> {
    let url = Url::parse(raw.trim()).map_err(|e| format!("not a valid URL: {}", e))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(format!("unsupported scheme {:?}", url.scheme()));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err("URL has no host".to_string());
    }
    Ok(url)
}

/// URLのホストを比較用に正規化する
pub fn normalized_host(url: &str) -> Option<String> {
    let url = Url::parse(url.trim()).ok()?;
    let host = url.host_str()?.to_ascii_lowercase();
    let host = host.strip_prefix("www.").map(str::to_string).unwrap_or(host);
    (!host.is_empty()).then_some(host)
}

/// 同じホストか、一方がもう一方のサブドメイン
pub fn hosts_match(a: &str, b: &str) -> bool {
    a == b || a.ends_with(&format!(".{}", b)) || b.ends_with(&format!(".{}", a))
}

/// 設定ファイル上のプロファイル（未検証）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawSiteProfile {
    pub name: Option<String>,
    pub url: Option<String>,
    #[serde(default, alias = "requires_postcode")]
    pub requires_location: bool,
    #[serde(default, alias = "postcode", skip_serializing_if = "Option::is_none")]
    pub location_value: Option<String>,
    #[serde(default, alias = "postcode_selectors")]
    pub location: LocationSelectors,
    #[serde(default, alias = "scroll_passes")]
    pub scroll_budget: Option<i64>,
    pub card_selector: Option<String>,
    #[serde(default, alias = "extraction")]
    pub fields: BTreeMap<String, RawFieldRule>,
}

/// `trim_after` は単一文字列でもリストでも書ける
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TrimAfter {
    One(String),
    Many(Vec<String>),
}

impl Default for TrimAfter {
    fn default() -> Self {
        TrimAfter::Many(Vec::new())
    }
}

impl TrimAfter {
    fn into_vec(self) -> Vec<String> {
        match self {
            TrimAfter::One(s) if s.is_empty() => Vec::new(),
            TrimAfter::One(s) => vec![s],
            TrimAfter::Many(v) => v,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawFieldRule {
    pub selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute: Option<Attribute>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_attribute: Option<Attribute>,
    #[serde(default)]
    pub trim_after: TrimAfter,
    #[serde(default)]
    pub filters: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub srcset_index: Option<i64>,
}

impl RawFieldRule {
    fn into_rule(self, site_key: &str, field: &str) -> Result<FieldRule, ConfigError> {
        let selector = self.selector.ok_or_else(|| ConfigError::MissingField {
            site_key: site_key.to_string(),
            field: format!("fields.{}.selector", field),
        })?;

        let filters = self
            .filters
            .iter()
            .map(|f| f.parse::<Filter>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| ConfigError::Filter {
                site_key: site_key.to_string(),
                field: field.to_string(),
                source,
            })?;

        let primary_attribute = self.attribute.unwrap_or_else(|| {
            if FieldKind::of(field).is_url() {
                Attribute::named("src")
            } else {
                Attribute::Text
            }
        });

        Ok(FieldRule {
            selector,
            primary_attribute,
            fallback_attribute: self.fallback_attribute,
            trim_markers: self.trim_after.into_vec(),
            filters,
            base_url: self.base_url,
            srcset_index: self.srcset_index,
        })
    }
}

impl From<&FieldRule> for RawFieldRule {
    fn from(rule: &FieldRule) -> Self {
        RawFieldRule {
            selector: Some(rule.selector.clone()),
            attribute: Some(rule.primary_attribute.clone()),
            fallback_attribute: rule.fallback_attribute.clone(),
            trim_after: TrimAfter::Many(rule.trim_markers.clone()),
            filters: rule.filters.iter().map(ToString::to_string).collect(),
            base_url: rule.base_url.clone(),
            srcset_index: rule.srcset_index,
        }
    }
}
