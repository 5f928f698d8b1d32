//! 結果の永続化
//!
//! サイトキー単位で置き換える。空のレコード集合は書き出さず、
//! 前回の結果ファイルが残っていれば削除する。

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::info;

use crate::aggregate::ProductRecord;
use crate::error::ScraperError;

const CSV_HEADER: [&str; 4] = ["name", "price", "image_url", "source"];

#[async_trait]
pub trait ProductSink: Send + Sync {
    /// 書き出したファイルを返す。何も書かなかった場合は `None`
    ///
    /// 空の `records` はそのサイトの前回の結果を取り消す。
    async fn write(
        &self,
        site_key: &str,
        records: &[ProductRecord],
    ) -> Result<Option<PathBuf>, ScraperError>;
}

/// `<output_dir>/<site_key>_products.csv` に書き出す
#[derive(Debug, Clone)]
pub struct CsvSink {
    output_dir: PathBuf,
}

impl CsvSink {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn path_for(&self, site_key: &str) -> PathBuf {
        self.output_dir.join(format!("{}_products.csv", site_key))
    }
}

fn write_csv(path: &Path, records: &[ProductRecord]) -> Result<(), ScraperError> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(CSV_HEADER)?;
    for record in records {
        writer.write_record([
            record.name.as_str(),
            record.price.as_deref().unwrap_or_default(),
            record.image_url.as_deref().unwrap_or_default(),
            record.site_name.as_str(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

#[async_trait]
impl ProductSink for CsvSink {
    async fn write(
        &self,
        site_key: &str,
        records: &[ProductRecord],
    ) -> Result<Option<PathBuf>, ScraperError> {
        if records.is_empty() {
            let stale = self.path_for(site_key);
            match std::fs::remove_file(&stale) {
                Ok(()) => info!(site_key, "No products to save, removed previous {:?}", stale),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    info!(site_key, "No products to save")
                }
                Err(e) => return Err(e.into()),
            }
            return Ok(None);
        }

        std::fs::create_dir_all(&self.output_dir)?;
        let path = self.path_for(site_key);
        write_csv(&path, records)?;

        info!(site_key, "Saved {} products to {:?}", records.len(), path);
        Ok(Some(path))
    }
}
