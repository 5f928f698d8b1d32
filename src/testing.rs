//! テスト用のスクリプト化されたブラウザドライバー

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::DriverError;
use crate::profile::{FieldRule, Filter, LocationSelectors, SiteProfile};
use crate::session::CancelFlag;
use crate::traits::{Attribute, BrowserDriver, Condition, DriverFactory};

pub const CARD_SELECTOR: &str = "li.product";

/// `MockElement::card` の構造に合わせたプロファイル
pub fn sample_profile(key: &str, scroll_budget: u32) -> SiteProfile {
    let mut fields = BTreeMap::new();
    fields.insert(
        "name".to_string(),
        FieldRule::new("h3", Attribute::Text).with_filters([Filter::NoPrice, Filter::MinLength(3)]),
    );
    fields.insert("price".to_string(), FieldRule::new("span.price", Attribute::Text));
    fields.insert(
        "image".to_string(),
        FieldRule::new("img", Attribute::named("src")).with_trim_markers([".jpg", ".jpeg"]),
    );

    SiteProfile {
        key: key.to_string(),
        name: format!("Shop {}", key),
        url: format!("https://{}.example/menu", key),
        requires_location: false,
        location_value: None,
        location: LocationSelectors::default(),
        scroll_budget,
        card_selector: CARD_SELECTOR.to_string(),
        fields,
    }
}

/// DOM要素の代わり
#[derive(Debug, Clone, Default)]
pub struct MockElement {
    text: Option<String>,
    attrs: HashMap<String, String>,
    children: Vec<(String, MockElement)>,
}

impl MockElement {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(text: &str) -> Self {
        Self {
            text: Some(text.to_string()),
            ..Self::default()
        }
    }

    pub fn attr(mut self, name: &str, value: &str) -> Self {
        self.attrs.insert(name.to_string(), value.to_string());
        self
    }

    pub fn child(mut self, selector: &str, element: MockElement) -> Self {
        self.children.push((selector.to_string(), element));
        self
    }

    /// `h3` に名前、`span.price` に価格、`img` に画像を持つ商品カード
    pub fn card(name: &str, price: Option<&str>, image: Option<&str>) -> Self {
        let mut card = MockElement::new().child("h3", MockElement::text(name));
        if let Some(price) = price {
            card = card.child("span.price", MockElement::text(price));
        }
        if let Some(image) = image {
            card = card.child("img", MockElement::new().attr("src", image));
        }
        card
    }
}

#[derive(Debug, Default)]
pub struct MockDriver {
    /// n回スクロールした後に見えるカード（最後の状態で止まる）
    passes: Vec<Vec<MockElement>>,
    elements: HashMap<String, Vec<MockElement>>,
    challenge_active: bool,
    fail_navigate: bool,
    fail_on_scroll: Option<usize>,
    cancel_after_scroll: Option<(usize, CancelFlag)>,
    scrolls: AtomicUsize,
    log: Arc<Mutex<Vec<String>>>,
    waits: Arc<Mutex<Vec<Condition>>>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_passes(passes: Vec<Vec<MockElement>>) -> Self {
        Self {
            passes,
            ..Self::default()
        }
    }

    /// 毎回同じカードが見える静的なページ
    pub fn with_static_cards(cards: Vec<MockElement>) -> Self {
        Self::with_passes(vec![cards])
    }

    pub fn element(mut self, selector: &str, element: MockElement) -> Self {
        self.elements
            .entry(selector.to_string())
            .or_default()
            .push(element);
        self
    }

    pub fn challenge_never_clears(mut self) -> Self {
        self.challenge_active = true;
        self
    }

    pub fn fail_navigate(mut self) -> Self {
        self.fail_navigate = true;
        self
    }

    /// n回目のスクロールでドライバー障害を起こす（1始まり）
    pub fn fail_on_scroll(mut self, n: usize) -> Self {
        self.fail_on_scroll = Some(n);
        self
    }

    pub fn cancel_after_scroll(mut self, n: usize, flag: CancelFlag) -> Self {
        self.cancel_after_scroll = Some((n, flag));
        self
    }

    pub fn log_handle(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.log)
    }

    pub fn calls(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    /// 待機した条件（呼ばれた順）
    pub fn waits_handle(&self) -> Arc<Mutex<Vec<Condition>>> {
        Arc::clone(&self.waits)
    }

    /// `selector` について `SelectorCountAtLeast` で待った件数（呼ばれた順）
    pub fn count_waits(&self, selector: &str) -> Vec<usize> {
        self.waits
            .lock()
            .unwrap()
            .iter()
            .filter_map(|c| match c {
                Condition::SelectorCountAtLeast { selector: s, count } if s == selector => Some(*count),
                _ => None,
            })
            .collect()
    }

    pub fn scroll_count(&self) -> usize {
        self.scrolls.load(Ordering::SeqCst)
    }

    fn record(&self, call: String) {
        self.log.lock().unwrap().push(call);
    }

    fn visible_cards(&self) -> Vec<MockElement> {
        if self.passes.is_empty() {
            return Vec::new();
        }
        let scrolls = self.scrolls.load(Ordering::SeqCst);
        let idx = scrolls.saturating_sub(1).min(self.passes.len() - 1);
        self.passes[idx].clone()
    }
}

#[async_trait]
impl BrowserDriver for MockDriver {
    type Node = MockElement;

    async fn navigate(&self, url: &str) -> Result<(), DriverError> {
        self.record(format!("navigate:{}", url));
        if self.fail_navigate {
            return Err(DriverError::Navigation(format!("net::ERR_NAME_NOT_RESOLVED {}", url)));
        }
        Ok(())
    }

    async fn find(&self, selector: &str) -> Result<Vec<MockElement>, DriverError> {
        // "a, b" のようなセレクタリストは和集合
        let mut found = Vec::new();
        for part in selector.split(',').map(str::trim) {
            if part == CARD_SELECTOR {
                found.extend(self.visible_cards());
            } else if let Some(elements) = self.elements.get(part) {
                found.extend(elements.iter().cloned());
            }
        }
        Ok(found)
    }

    async fn find_within(
        &self,
        node: &MockElement,
        selector: &str,
    ) -> Result<Vec<MockElement>, DriverError> {
        Ok(node
            .children
            .iter()
            .filter(|(s, _)| s == selector)
            .map(|(_, e)| e.clone())
            .collect())
    }

    async fn read(
        &self,
        node: &MockElement,
        attribute: &Attribute,
    ) -> Result<Option<String>, DriverError> {
        Ok(match attribute {
            Attribute::Text => node.text.clone(),
            Attribute::Named(name) => node.attrs.get(name).cloned(),
        })
    }

    async fn scroll(&self) -> Result<(), DriverError> {
        let n = self.scrolls.fetch_add(1, Ordering::SeqCst) + 1;
        self.record("scroll".to_string());
        if self.fail_on_scroll == Some(n) {
            return Err(DriverError::Closed("browser process exited".into()));
        }
        if let Some((after, flag)) = &self.cancel_after_scroll {
            if n >= *after {
                flag.cancel();
            }
        }
        Ok(())
    }

    async fn wait(&self, condition: &Condition, _timeout: Duration) -> Result<bool, DriverError> {
        self.waits.lock().unwrap().push(condition.clone());
        Ok(match condition {
            Condition::DocumentReady => true,
            Condition::SelectorPresent(selector) => !self.find(selector).await?.is_empty(),
            Condition::SelectorCountAtLeast { selector, count } => {
                self.find(selector).await?.len() >= *count
            }
            Condition::ChallengeCleared { .. } => !self.challenge_active,
        })
    }

    async fn fill(&self, _node: &MockElement, value: &str) -> Result<(), DriverError> {
        self.record(format!("fill:{}", value));
        Ok(())
    }

    async fn click(&self, node: &MockElement) -> Result<(), DriverError> {
        let label = node.text.clone().unwrap_or_default();
        self.record(format!("click:{}", label));
        Ok(())
    }

    async fn submit(&self, _node: &MockElement) -> Result<(), DriverError> {
        self.record("submit".to_string());
        Ok(())
    }

    async fn close(&self) -> Result<(), DriverError> {
        self.record("close".to_string());
        Ok(())
    }
}

/// 起動のたびに用意したドライバーを順に返す
#[derive(Debug, Default)]
pub struct MockFactory {
    drivers: Mutex<VecDeque<MockDriver>>,
    launches: AtomicUsize,
}

impl MockFactory {
    pub fn new(drivers: Vec<MockDriver>) -> Self {
        Self {
            drivers: Mutex::new(drivers.into()),
            launches: AtomicUsize::new(0),
        }
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DriverFactory for MockFactory {
    type Driver = MockDriver;

    async fn launch(&self) -> Result<MockDriver, DriverError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        self.drivers
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| DriverError::BrowserInit("chromium not found".into()))
    }
}
