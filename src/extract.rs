//! 商品カード1件からのフィールド抽出
//!
//! フィールドごとに抽出ルールを適用し、スクロール1回分の [`ExtractedRecord`] を作る。

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::{Regex, RegexBuilder};
use serde::Serialize;
use url::Url;

use crate::error::DriverError;
use crate::profile::filter::accepts_all;
use crate::profile::{FieldKind, FieldRule, SiteProfile, IMAGE_FIELD, NAME_FIELD, PRICE_FIELD};
use crate::traits::{Attribute, BrowserDriver};

static PRICE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[£$€¥₹]\s?\d+(?:[.,]\d{1,2})?").expect("valid regex"));
static CSS_URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"url\(\s*["']?([^"'()]+)["']?\s*\)"#).expect("valid regex")
});

/// スクロール1回分の抽出結果（生成後は変更しない）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtractedRecord {
    pub name: Option<String>,
    pub price: Option<String>,
    pub image_url: Option<String>,
    /// name/price/image 以外の拡張フィールド
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl ExtractedRecord {
    /// 重複判定用キー。名前が無いレコードは識別できないので `None`
    pub fn identity_key(&self) -> Option<IdentityKey> {
        IdentityKey::derive(self.name.as_deref()?, self.price.as_deref())
    }
}

/// 正規化した名前（＋価格）から作る重複判定キー
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityKey(String);

impl IdentityKey {
    pub fn derive(name: &str, price: Option<&str>) -> Option<Self> {
        let name = normalize_name(name);
        if name.is_empty() {
            return None;
        }
        let key = match price.map(normalize_price).filter(|p| !p.is_empty()) {
            Some(price) => format!("{}|{}", name, price),
            None => name,
        };
        Some(IdentityKey(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn normalize_price(price: &str) -> String {
    price
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_lowercase()
}

/// カード1件を抽出。ドライバーの障害のみエラーになり、値が取れないフィールドは `None`
pub async fn extract_card<D: BrowserDriver>(
    driver: &D,
    profile: &SiteProfile,
    card: &D::Node,
) -> Result<ExtractedRecord, DriverError> {
    let mut record = ExtractedRecord {
        name: None,
        price: None,
        image_url: None,
        extra: BTreeMap::new(),
    };

    for (field, rule) in &profile.fields {
        let value = extract_field(driver, card, rule, FieldKind::of(field)).await?;
        match field.as_str() {
            NAME_FIELD => record.name = value,
            PRICE_FIELD => record.price = value,
            IMAGE_FIELD => record.image_url = value,
            _ => {
                if let Some(value) = value {
                    record.extra.insert(field.clone(), value);
                }
            }
        }
    }

    Ok(record)
}

/// カード内の候補要素を順に試し、フィルターを通過した最初の値を返す
pub async fn extract_field<D: BrowserDriver>(
    driver: &D,
    card: &D::Node,
    rule: &FieldRule,
    kind: FieldKind,
) -> Result<Option<String>, DriverError> {
    let candidates = driver.find_within(card, &rule.selector).await?;

    for node in &candidates {
        let Some((raw, attribute)) = read_with_fallback(driver, node, rule).await? else {
            continue;
        };
        let Some(value) = post_process(&raw, attribute, rule, kind) else {
            continue;
        };
        if accepts_all(&rule.filters, &value) {
            return Ok(Some(value));
        }
    }

    Ok(None)
}

/// 主属性が空なら代替属性を読む。どちらも空なら `None`
async fn read_with_fallback<'r, D: BrowserDriver>(
    driver: &D,
    node: &D::Node,
    rule: &'r FieldRule,
) -> Result<Option<(String, &'r Attribute)>, DriverError> {
    let primary = non_empty(driver.read(node, &rule.primary_attribute).await?);
    if let Some(value) = primary {
        return Ok(Some((value, &rule.primary_attribute)));
    }

    if let Some(fallback) = &rule.fallback_attribute {
        if let Some(value) = non_empty(driver.read(node, fallback).await?) {
            return Ok(Some((value, fallback)));
        }
    }

    Ok(None)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// 種類ごとの後処理と切り詰め。結果が空なら `None`
fn post_process(
    raw: &str,
    attribute: &Attribute,
    rule: &FieldRule,
    kind: FieldKind,
) -> Option<String> {
    let value = if kind.is_url() {
        url_value(raw, attribute, rule)?
    } else {
        let line = first_line(raw);
        if kind == FieldKind::Price {
            price_value(&line)
        } else {
            line
        }
    };

    let value = trim_at_marker(&value, &rule.trim_markers);
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

fn first_line(text: &str) -> String {
    text.trim().lines().next().unwrap_or_default().trim().to_string()
}

/// 最初の通貨金額だけを残す（金額が無ければそのまま）
fn price_value(text: &str) -> String {
    PRICE_RE
        .find(text)
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| text.to_string())
}

fn url_value(raw: &str, attribute: &Attribute, rule: &FieldRule) -> Option<String> {
    let raw = raw.trim();
    let url = if attribute.is_named("srcset") {
        pick_srcset(raw, rule.srcset_index.unwrap_or(-1))?
    } else if attribute.is_named("style") {
        CSS_URL_RE.captures(raw)?.get(1)?.as_str().trim().to_string()
    } else {
        raw.to_string()
    };
    Some(absolutize(&url, rule.base_url.as_deref()))
}

/// srcset の候補を位置で選ぶ（負数は末尾から）
fn pick_srcset(srcset: &str, index: i64) -> Option<String> {
    let urls: Vec<&str> = srcset
        .split(',')
        .filter_map(|candidate| candidate.split_whitespace().next())
        .collect();

    let len = i64::try_from(urls.len()).ok()?;
    let idx = if index < 0 { len + index } else { index };
    let idx = usize::try_from(idx).ok()?;
    urls.get(idx).map(|s| s.to_string())
}

/// 絶対URLはそのまま、`//` 始まりは https、相対URLは `base_url` を基準に解決する
fn absolutize(url: &str, base_url: Option<&str>) -> String {
    if Url::parse(url).is_ok() {
        return url.to_string();
    }

    if url.starts_with("//") {
        return Url::parse(&format!("https:{}", url))
            .map(String::from)
            .unwrap_or_else(|_| url.to_string());
    }

    base_url
        .and_then(|base| Url::parse(base).ok())
        .and_then(|base| base.join(url).ok())
        .map(String::from)
        .unwrap_or_else(|| url.to_string())
}

/// 最初に現れたマーカーの直後で切る（大文字小文字は区別しない）
///
/// 同じ位置から始まるマーカーが複数あれば短い方を優先する。
pub fn trim_at_marker(value: &str, markers: &[String]) -> String {
    let mut markers: Vec<&str> = markers
        .iter()
        .map(String::as_str)
        .filter(|m| !m.is_empty())
        .collect();
    if markers.is_empty() {
        return value.to_string();
    }
    markers.sort_by_key(|m| m.len());

    let pattern = markers
        .iter()
        .map(|m| regex::escape(m))
        .collect::<Vec<_>>()
        .join("|");
    let Ok(re) = RegexBuilder::new(&pattern).case_insensitive(true).build() else {
        return value.to_string();
    };

    match re.find(value) {
        Some(m) => value[..m.end()].to_string(),
        None => value.to_string(),
    }
}
