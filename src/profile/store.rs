//! サイトプロファイルの保存先
//!
//! `put` は検証してから丸ごと置き換える（フィールド単位のマージはしない）。

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, info};

use crate::error::ConfigError;

use super::{hosts_match, normalized_host, RawSiteProfile, SiteProfile};

pub trait ProfileStore: Send + Sync {
    fn get(&self, site_key: &str) -> Result<SiteProfile, ConfigError>;

    fn list(&self) -> BTreeMap<String, SiteProfile>;

    fn put(&self, site_key: &str, profile: SiteProfile) -> Result<(), ConfigError>;

    /// URLのホストに一致するプロファイル（複数あればキー順で最初）
    fn find_by_url(&self, url: &str) -> Option<SiteProfile> {
        let host = normalized_host(url)?;
        self.list()
            .into_values()
            .find(|profile| profile.host().is_some_and(|h| hosts_match(&h, &host)))
    }
}

/// `put` 前の共通チェック
fn check_put(site_key: &str, profile: &SiteProfile) -> Result<(), ConfigError> {
    if profile.key != site_key {
        return Err(ConfigError::KeyMismatch {
            expected: site_key.to_string(),
            actual: profile.key.clone(),
        });
    }
    profile.validate()
}

fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// メモリ上のストア
#[derive(Debug, Default)]
pub struct MemoryProfileStore {
    profiles: RwLock<BTreeMap<String, SiteProfile>>,
}

impl MemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_profiles(
        profiles: impl IntoIterator<Item = SiteProfile>,
    ) -> Result<Self, ConfigError> {
        let store = Self::new();
        for profile in profiles {
            let key = profile.key.clone();
            store.put(&key, profile)?;
        }
        Ok(store)
    }
}

impl ProfileStore for MemoryProfileStore {
    fn get(&self, site_key: &str) -> Result<SiteProfile, ConfigError> {
        read_lock(&self.profiles)
            .get(site_key)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownSite(site_key.to_string()))
    }

    fn list(&self) -> BTreeMap<String, SiteProfile> {
        read_lock(&self.profiles).clone()
    }

    fn put(&self, site_key: &str, profile: SiteProfile) -> Result<(), ConfigError> {
        check_put(site_key, &profile)?;
        write_lock(&self.profiles).insert(site_key.to_string(), profile);
        Ok(())
    }
}

/// JSONファイルに永続化するストア
///
/// ファイル形式は `{ "<site_key>": { ...プロファイル... } }`。
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    profiles: RwLock<BTreeMap<String, SiteProfile>>,
}

impl JsonFileStore {
    /// ファイルを読み込んで全プロファイルを検証する。ファイルが無ければ空のストアになる
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let profiles = if path.exists() {
            load_profiles(&path)?
        } else {
            info!("Profile file {:?} not found, starting with no site profiles", path);
            BTreeMap::new()
        };

        info!("Loaded {} site profiles from {:?}", profiles.len(), path);
        Ok(Self {
            path,
            profiles: RwLock::new(profiles),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 一時ファイルに書いてからリネームする
    fn persist(&self, profiles: &BTreeMap<String, SiteProfile>) -> Result<(), ConfigError> {
        let raw: BTreeMap<&str, RawSiteProfile> = profiles
            .iter()
            .map(|(key, profile)| (key.as_str(), profile.to_raw()))
            .collect();

        let io_err = |source| ConfigError::FileIo {
            path: self.path.clone(),
            source,
        };

        let body = serde_json::to_string_pretty(&raw).map_err(|source| ConfigError::FileParse {
            path: self.path.clone(),
            source,
        })?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, body).map_err(io_err)?;
        std::fs::rename(&tmp, &self.path).map_err(io_err)?;

        debug!("Saved {} site profiles to {:?}", profiles.len(), self.path);
        Ok(())
    }
}

fn load_profiles(path: &Path) -> Result<BTreeMap<String, SiteProfile>, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::FileIo {
        path: path.to_path_buf(),
        source,
    })?;

    let raw: BTreeMap<String, RawSiteProfile> =
        serde_json::from_str(&content).map_err(|source| ConfigError::FileParse {
            path: path.to_path_buf(),
            source,
        })?;

    raw.into_iter()
        .map(|(key, body)| SiteProfile::from_raw(key.clone(), body).map(|p| (key, p)))
        .collect()
}

impl ProfileStore for JsonFileStore {
    fn get(&self, site_key: &str) -> Result<SiteProfile, ConfigError> {
        read_lock(&self.profiles)
            .get(site_key)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownSite(site_key.to_string()))
    }

    fn list(&self) -> BTreeMap<String, SiteProfile> {
        read_lock(&self.profiles).clone()
    }

    fn put(&self, site_key: &str, profile: SiteProfile) -> Result<(), ConfigError> {
        check_put(site_key, &profile)?;

        let mut profiles = write_lock(&self.profiles);
        let mut updated = profiles.clone();
        updated.insert(site_key.to_string(), profile);
        self.persist(&updated)?;
        *profiles = updated;

        info!("Site profile updated: {}", site_key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{Filter, RawSiteProfile};
    use serde_json::json;

    fn profile(key: &str, name: &str) -> SiteProfile {
        let raw: RawSiteProfile = serde_json::from_value(json!({
            "name": name,
            "url": "https://example.com/menu",
            "card_selector": "li.item",
            "fields": {
                "name": { "selector": "h3", "filters": ["no_price", "min_length:3"] },
                "image": { "selector": "img", "trim_after": ".jpg" }
            }
        }))
        .unwrap();
        SiteProfile::from_raw(key, raw).unwrap()
    }

    #[test]
    fn test_memory_put_get_round_trip() {
        let store = MemoryProfileStore::new();
        let p = profile("shop", "Shop");
        store.put("shop", p.clone()).unwrap();
        assert_eq!(store.get("shop").unwrap(), p);
        assert_eq!(store.list().len(), 1);
    }

    #[test]
    fn test_put_replaces_whole_profile() {
        let store = MemoryProfileStore::with_profiles([profile("shop", "Shop")]).unwrap();

        let mut replacement = profile("shop", "Shop v2");
        replacement.fields.remove("price");
        replacement
            .fields
            .get_mut("name")
            .unwrap()
            .filters
            .retain(|f| *f != Filter::NoPrice);
        store.put("shop", replacement.clone()).unwrap();

        assert_eq!(store.get("shop").unwrap(), replacement);
    }

    #[test]
    fn test_put_rejects_invalid_profile() {
        let store = MemoryProfileStore::with_profiles([profile("shop", "Shop")]).unwrap();
        let mut broken = profile("shop", "Shop");
        broken.fields.remove("image");

        assert!(matches!(
            store.put("shop", broken),
            Err(ConfigError::MissingField { .. })
        ));
        // 既存のプロファイルは残る
        assert!(store.get("shop").unwrap().fields.contains_key("image"));
    }

    #[test]
    fn test_put_rejects_key_mismatch() {
        let store = MemoryProfileStore::new();
        assert!(matches!(
            store.put("other", profile("shop", "Shop")),
            Err(ConfigError::KeyMismatch { .. })
        ));
    }

    #[test]
    fn test_get_unknown_site() {
        let store = MemoryProfileStore::new();
        assert!(matches!(
            store.get("nope"),
            Err(ConfigError::UnknownSite(key)) if key == "nope"
        ));
    }

    #[test]
    fn test_json_store_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path().join("site_config.json")).unwrap();
        assert!(store.list().is_empty());
    }

    #[test]
    fn test_json_store_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("site_config.json");

        let store = JsonFileStore::open(&path).unwrap();
        let p = profile("shop", "Shop");
        store.put("shop", p.clone()).unwrap();
        assert_eq!(store.get("shop").unwrap(), p);

        let reopened = JsonFileStore::open(&path).unwrap();
        assert_eq!(reopened.get("shop").unwrap(), p);
    }

    #[test]
    fn test_json_store_rejects_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("site_config.json");
        std::fs::write(
            &path,
            r#"{ "shop": { "name": "Shop", "url": "https://example.com", "card_selector": "li",
                 "fields": { "name": { "selector": "h3", "filters": ["bogus"] },
                             "image": { "selector": "img" } } } }"#,
        )
        .unwrap();

        assert!(matches!(
            JsonFileStore::open(&path),
            Err(ConfigError::Filter { .. })
        ));
    }

    #[test]
    fn test_bundled_site_config_loads() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/site_config.json");
        let store = JsonFileStore::open(path).unwrap();

        let keys: Vec<String> = store.list().into_keys().collect();
        assert_eq!(keys, vec!["deliveroo", "justeat", "snappyshopper"]);

        let snappy = store.get("snappyshopper").unwrap();
        assert!(snappy.requires_location);
        assert_eq!(snappy.location_value.as_deref(), Some("GL52 3DT"));
        assert_eq!(snappy.scroll_budget, 25);
        assert!(store.get("justeat").unwrap().field("description").is_some());
    }

    fn profile_at(key: &str, url: &str) -> SiteProfile {
        let mut p = profile(key, key);
        p.url = url.to_string();
        p
    }

    #[test]
    fn test_find_by_url_matches_host() {
        let store = MemoryProfileStore::with_profiles([
            profile_at("deliveroo", "https://deliveroo.co.uk/restaurants/cheltenham"),
            profile_at("justeat", "https://www.just-eat.co.uk/area/gl52"),
        ])
        .unwrap();

        let found = store
            .find_by_url("https://DELIVEROO.co.uk/menu/cheltenham/mcdonalds")
            .unwrap();
        assert_eq!(found.key, "deliveroo");
        // www. の有無とサブドメインは同一視
        assert_eq!(
            store.find_by_url("https://just-eat.co.uk/restaurants-kfc/menu").unwrap().key,
            "justeat"
        );
        assert_eq!(
            store.find_by_url("https://m.deliveroo.co.uk/menu/x").unwrap().key,
            "deliveroo"
        );

        assert!(store.find_by_url("https://notdeliveroo.co.uk/menu").is_none());
        assert!(store.find_by_url("not a url").is_none());
    }

    #[test]
    fn test_with_entry_url_keeps_rules() {
        let p = profile("shop", "Shop");
        let menu = p.with_entry_url("https://example.com/menu/branch-2").unwrap();
        assert_eq!(menu.url, "https://example.com/menu/branch-2");
        assert_eq!(menu.fields, p.fields);
        assert!(p.with_entry_url("https://").is_err());
    }
}
