//! 抽出テキストに適用するフィルター
//!
//! フィルターは名前で参照される閉じた列挙型で、全て副作用のない `&str -> bool` 判定。
//! チェーンは論理積なので評価順は結果に影響しない。

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::FilterParseError;

/// 認識する通貨記号
pub(crate) const CURRENCY_SYMBOLS: [char; 5] = ['£', '$', '€', '¥', '₹'];

static DECIMAL_NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+[.,]\d+").expect("valid regex"));
/// 数字の後ろ（"550 Cals"）と前（"Calories: 450"）の両方
static CALORIES_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\d+(?:[.,]\d+)?\s*k?cal(?:orie)?s?\b|\bk?cal(?:orie)?s?\s*:?\s*\d")
        .expect("valid regex")
});
static PRICE_RANGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[£$€¥₹]\s?\d+(?:[.,]\d+)?\s*-\s*[£$€¥₹]\s?\d+(?:[.,]\d+)?").expect("valid regex")
});
static MULTIBUY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\d+\s+for\s+[£$€¥₹]").expect("valid regex"));

/// UI上のノイズ文言
const COMMON_WORDS: &[&str] = &[
    "add",
    "view",
    "more",
    "view all",
    "from",
    "order",
    "current",
    "popular",
    "your current order",
    "add to basket",
    "add to cart",
    "see all",
    "show more",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Filter {
    NoPrice,
    NoCalories,
    NoDigitOnly,
    MinLength(usize),
    NoCommonWords,
    NoFromPrefix,
    NoYourCurrentPrefix,
    NoPromo,
}

impl Filter {
    /// 候補文字列を受け入れるなら `true`
    pub fn accepts(&self, text: &str) -> bool {
        let trimmed = text.trim();
        match self {
            Filter::NoPrice => {
                !trimmed.contains(CURRENCY_SYMBOLS) && !DECIMAL_NUMBER_RE.is_match(trimmed)
            }
            Filter::NoCalories => !CALORIES_RE.is_match(trimmed),
            Filter::NoDigitOnly => trimmed.chars().any(char::is_alphabetic),
            Filter::MinLength(min) => trimmed.chars().count() >= *min,
            Filter::NoCommonWords => {
                let normalized = trimmed.to_lowercase();
                !COMMON_WORDS.contains(&normalized.as_str())
            }
            Filter::NoFromPrefix => {
                let lower = trimmed.to_lowercase();
                lower != "from" && !lower.starts_with("from ")
            }
            Filter::NoYourCurrentPrefix => !trimmed.to_lowercase().starts_with("your current"),
            Filter::NoPromo => {
                let lower = trimmed.to_lowercase();
                !(PRICE_RANGE_RE.is_match(trimmed)
                    || MULTIBUY_RE.is_match(trimmed)
                    || lower.starts_with("was ")
                    || lower.starts_with("from ")
                    || lower.starts_with("save ")
                    || lower.contains(" off"))
            }
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Filter::NoPrice => "no_price",
            Filter::NoCalories => "no_calories",
            Filter::NoDigitOnly => "no_digit_only",
            Filter::MinLength(_) => "min_length",
            Filter::NoCommonWords => "no_common_words",
            Filter::NoFromPrefix => "no_from_prefix",
            Filter::NoYourCurrentPrefix => "no_your_current_prefix",
            Filter::NoPromo => "no_promo",
        }
    }
}

/// チェーン全体で受け入れるか（全フィルターの論理積）
pub fn accepts_all(filters: &[Filter], text: &str) -> bool {
    filters.iter().all(|f| f.accepts(text))
}

impl FromStr for Filter {
    type Err = FilterParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (name, param) = match s.split_once(':') {
            Some((name, param)) => (name.trim(), Some(param.trim())),
            None => (s, None),
        };

        let simple = match name {
            "no_price" => Some(Filter::NoPrice),
            "no_calories" => Some(Filter::NoCalories),
            "no_digit_only" => Some(Filter::NoDigitOnly),
            "no_common_words" => Some(Filter::NoCommonWords),
            "no_from_prefix" => Some(Filter::NoFromPrefix),
            "no_your_current_prefix" => Some(Filter::NoYourCurrentPrefix),
            "no_promo" => Some(Filter::NoPromo),
            "min_length" => None,
            other => return Err(FilterParseError::Unknown(other.to_string())),
        };

        match (simple, param) {
            (Some(filter), None) => Ok(filter),
            (Some(_), Some(_)) => Err(FilterParseError::UnexpectedParam {
                name: name.to_string(),
            }),
            (None, None) | (None, Some("")) => Err(FilterParseError::MissingParam {
                name: name.to_string(),
            }),
            (None, Some(param)) => param
                .parse::<usize>()
                .map(Filter::MinLength)
                .map_err(|_| FilterParseError::InvalidParam {
                    name: name.to_string(),
                    param: param.to_string(),
                }),
        }
    }
}

impl TryFrom<String> for Filter {
    type Error = FilterParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Filter> for String {
    fn from(filter: Filter) -> Self {
        filter.to_string()
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::MinLength(min) => write!(f, "min_length:{}", min),
            other => f.write_str(other.name()),
        }
    }
}
