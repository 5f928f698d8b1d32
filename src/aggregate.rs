//! 結果の集約
//!
//! ループが返したレコードにサイト名・キーを付けるだけの射影。ここでの追加フィルタリングはしない。

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::extract::ExtractedRecord;
use crate::profile::SiteProfile;
use crate::session::LoopState;

/// 出力用の商品レコード
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProductRecord {
    pub site_key: String,
    /// 出力CSVの `source` 列
    pub site_name: String,
    pub name: String,
    pub price: Option<String>,
    pub image_url: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

/// 発見順を保ったままソース情報を付ける。名前の無いレコードは識別できないので落とす
pub fn aggregate(profile: &SiteProfile, records: Vec<ExtractedRecord>) -> Vec<ProductRecord> {
    records
        .into_iter()
        .filter_map(|record| {
            Some(ProductRecord {
                site_key: profile.key.clone(),
                site_name: profile.name.clone(),
                name: record.name?,
                price: record.price,
                image_url: record.image_url,
                extra: record.extra,
            })
        })
        .collect()
}

/// サイト1件分の実行結果
#[derive(Debug, Clone, Serialize)]
pub struct SiteReport {
    pub site_key: String,
    pub site_name: String,
    pub success: bool,
    pub product_count: usize,
    pub records: Vec<ProductRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// ループの終了状態（ループまで到達しなかった場合は `None`）
    pub outcome: Option<LoopState>,
    pub passes: u32,
    /// 書き出したファイル
    pub output: Option<PathBuf>,
}

impl SiteReport {
    pub fn succeeded(
        profile: &SiteProfile,
        records: Vec<ProductRecord>,
        outcome: LoopState,
        passes: u32,
        output: Option<PathBuf>,
    ) -> Self {
        Self {
            site_key: profile.key.clone(),
            site_name: profile.name.clone(),
            success: true,
            product_count: records.len(),
            records,
            error: None,
            outcome: Some(outcome),
            passes,
            output,
        }
    }

    /// 失敗しても部分的なレコードは保持する
    pub fn failed(
        site_key: impl Into<String>,
        site_name: impl Into<String>,
        error: impl ToString,
        records: Vec<ProductRecord>,
        passes: u32,
        output: Option<PathBuf>,
    ) -> Self {
        Self {
            site_key: site_key.into(),
            site_name: site_name.into(),
            success: false,
            product_count: records.len(),
            records,
            error: Some(error.to_string()),
            outcome: None,
            passes,
            output,
        }
    }
}

/// バッチ実行結果
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sites: Vec<SiteReport>,
    pub total_sites: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub total_products: usize,
}

impl BatchReport {
    pub fn new(started_at: DateTime<Utc>, sites: Vec<SiteReport>) -> Self {
        let succeeded = sites.iter().filter(|s| s.success).count();
        Self {
            started_at,
            finished_at: Utc::now(),
            total_sites: sites.len(),
            succeeded,
            failed: sites.len() - succeeded,
            total_products: sites.iter().map(|s| s.product_count).sum(),
            sites,
        }
    }

    pub fn site(&self, site_key: &str) -> Option<&SiteReport> {
        self.sites.iter().find(|s| s.site_key == site_key)
    }
}
