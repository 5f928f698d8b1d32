//! スクロール抽出ループ
//!
//! サイト1件分の状態機械:
//!
//! ```text
//! Starting → Scrolling ⇄ Extracting → (Converged | BudgetExhausted | Cancelled)
//! ```
//!
//! 各パスで「スクロール → 描画待ち → 表示中カードの抽出 → 重複除去」を行い、
//! 新規0件のパスが閾値回数続くか `scroll_budget` に達したら終了する。
//! 終了状態はいずれも成功扱いで、0件でもエラーにはならない。
//! ドライバー障害だけが [`SessionFault`] になり、それまでのレコードを保持して返す。

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::error::{DriverError, ScraperError};
use crate::extract::{extract_card, ExtractedRecord, IdentityKey};
use crate::navigation::{LocationOutcome, NavigationController, Readiness};
use crate::profile::SiteProfile;
use crate::traits::{BrowserDriver, Condition};

/// 外部からの中断要求（パスの合間にのみ確認される）
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Starting,
    Scrolling,
    Extracting,
    Converged,
    BudgetExhausted,
    Cancelled,
}

impl LoopState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            LoopState::Converged | LoopState::BudgetExhausted | LoopState::Cancelled
        )
    }
}

/// 1サイト分の抽出状態。ループだけが所有・更新する
#[derive(Debug, Default)]
pub struct SessionState {
    records: Vec<ExtractedRecord>,
    seen: HashSet<IdentityKey>,
    stagnant_passes: u32,
    pass_index: u32,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// 新しい識別キーなら追加して `true`。既知のキーや名前なしは無視（先着優先）
    pub fn merge(&mut self, record: ExtractedRecord) -> bool {
        let Some(key) = record.identity_key() else {
            return false;
        };
        if !self.seen.insert(key) {
            return false;
        }
        self.records.push(record);
        true
    }

    /// パス終了時の集計
    pub fn finish_pass(&mut self, new_records: usize) {
        self.pass_index += 1;
        if new_records == 0 {
            self.stagnant_passes += 1;
        } else {
            self.stagnant_passes = 0;
        }
    }

    pub fn records(&self) -> &[ExtractedRecord] {
        &self.records
    }

    pub fn pass_index(&self) -> u32 {
        self.pass_index
    }

    pub fn stagnant_passes(&self) -> u32 {
        self.stagnant_passes
    }

    fn into_records(self) -> Vec<ExtractedRecord> {
        self.records
    }
}

/// 収束判定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvergencePolicy {
    pub stagnation_threshold: u32,
    pub scroll_budget: u32,
}

impl ConvergencePolicy {
    /// Extracting の後の遷移先。停滞と予算切れが同時なら Converged
    pub fn next_state(&self, session: &SessionState) -> LoopState {
        if session.stagnant_passes() >= self.stagnation_threshold {
            LoopState::Converged
        } else if session.pass_index() >= self.scroll_budget {
            LoopState::BudgetExhausted
        } else {
            LoopState::Scrolling
        }
    }
}

/// ループの正常終了結果
#[derive(Debug)]
pub struct SessionOutcome {
    pub state: LoopState,
    pub records: Vec<ExtractedRecord>,
    pub passes: u32,
    pub readiness: Readiness,
}

/// 回復不能なドライバー障害。障害前に集めたレコードを保持する
#[derive(Debug)]
pub struct SessionFault {
    pub error: ScraperError,
    pub records: Vec<ExtractedRecord>,
    pub passes: u32,
}

#[derive(Debug, Clone)]
pub struct ScrollLoop {
    navigation: NavigationController,
    settle_interval: Duration,
    stagnation_threshold: u32,
}

impl ScrollLoop {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            navigation: NavigationController::new(config),
            settle_interval: config.settle_interval,
            stagnation_threshold: config.stagnation_threshold.max(1),
        }
    }

    pub async fn run<D: BrowserDriver>(
        &self,
        driver: &D,
        profile: &SiteProfile,
        cancel: &CancelFlag,
    ) -> Result<SessionOutcome, SessionFault> {
        let policy = ConvergencePolicy {
            stagnation_threshold: self.stagnation_threshold,
            scroll_budget: profile.scroll_budget,
        };
        let mut session = SessionState::new();
        let mut readiness = Readiness {
            challenge_cleared: false,
            location: LocationOutcome::NotRequired,
            cards_present: false,
        };
        let mut visible_cards = 0usize;
        let mut state = LoopState::Starting;

        while !state.is_terminal() {
            debug!(site_key = %profile.key, ?state, pass = session.pass_index(), "loop step");
            state = match state {
                LoopState::Starting => match self.navigation.prepare(driver, profile).await {
                    Ok(ready) => {
                        readiness = ready;
                        LoopState::Scrolling
                    }
                    Err(source) => {
                        return Err(SessionFault {
                            error: ScraperError::Navigation {
                                site_key: profile.key.clone(),
                                source,
                            },
                            records: Vec::new(),
                            passes: 0,
                        })
                    }
                },
                LoopState::Scrolling => {
                    if cancel.is_cancelled() {
                        info!(site_key = %profile.key, "Extraction cancelled");
                        LoopState::Cancelled
                    } else if let Err(source) =
                        self.scroll_and_settle(driver, profile, visible_cards).await
                    {
                        return Err(fault(profile, session, source));
                    } else {
                        LoopState::Extracting
                    }
                }
                LoopState::Extracting => {
                    match self.extract_pass(driver, profile, &mut session).await {
                        Ok(cards) => {
                            visible_cards = cards;
                            policy.next_state(&session)
                        }
                        Err(source) => return Err(fault(profile, session, source)),
                    }
                }
                terminal => terminal,
            };
        }

        info!(
            site_key = %profile.key,
            ?state,
            passes = session.pass_index(),
            products = session.records().len(),
            "Extraction finished"
        );

        Ok(SessionOutcome {
            state,
            passes: session.pass_index(),
            records: session.into_records(),
            readiness,
        })
    }

    /// スクロールして、カードが増えるか待機上限に達するまで待つ
    async fn scroll_and_settle<D: BrowserDriver>(
        &self,
        driver: &D,
        profile: &SiteProfile,
        visible_cards: usize,
    ) -> Result<(), DriverError> {
        driver.scroll().await?;

        let condition = Condition::SelectorCountAtLeast {
            selector: profile.card_selector.clone(),
            count: visible_cards + 1,
        };
        if !driver.wait(&condition, self.settle_interval).await? {
            debug!(site_key = %profile.key, "No new cards rendered within {:?}", self.settle_interval);
        }
        Ok(())
    }

    /// 表示中のカードを全て抽出してセッションに統合する。戻り値は表示中のカード数
    async fn extract_pass<D: BrowserDriver>(
        &self,
        driver: &D,
        profile: &SiteProfile,
        session: &mut SessionState,
    ) -> Result<usize, DriverError> {
        let cards = driver.find(&profile.card_selector).await?;

        let mut new_records = 0usize;
        let mut unnamed = 0usize;
        for card in &cards {
            let record = extract_card(driver, profile, card).await?;
            if record.name.is_none() {
                unnamed += 1;
                continue;
            }
            if session.merge(record) {
                new_records += 1;
            }
        }
        session.finish_pass(new_records);

        info!(
            site_key = %profile.key,
            pass = session.pass_index(),
            cards = cards.len(),
            new_records,
            unnamed,
            total = session.records().len(),
            "Scroll pass extracted"
        );
        Ok(cards.len())
    }
}

fn fault(profile: &SiteProfile, session: SessionState, source: DriverError) -> SessionFault {
    SessionFault {
        error: ScraperError::Scrape {
            site_key: profile.key.clone(),
            source,
        },
        passes: session.pass_index(),
        records: session.into_records(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{sample_profile, MockDriver, MockElement};
    use std::collections::BTreeMap;

    fn card(name: &str) -> MockElement {
        MockElement::card(name, Some("£1.00"), Some("https://cdn.example/a.jpg?w=200"))
    }

    fn engine() -> ScrollLoop {
        ScrollLoop::new(&EngineConfig::default().without_waits())
    }

    fn names(records: &[ExtractedRecord]) -> Vec<&str> {
        records.iter().filter_map(|r| r.name.as_deref()).collect()
    }

    fn record(name: Option<&str>) -> ExtractedRecord {
        ExtractedRecord {
            name: name.map(String::from),
            price: None,
            image_url: None,
            extra: BTreeMap::new(),
        }
    }

    #[test]
    fn test_policy_transitions() {
        let policy = ConvergencePolicy {
            stagnation_threshold: 2,
            scroll_budget: 3,
        };
        let mut session = SessionState::new();

        session.finish_pass(4);
        assert_eq!(policy.next_state(&session), LoopState::Scrolling);
        session.finish_pass(0);
        assert_eq!(policy.next_state(&session), LoopState::Scrolling);
        // 新規があれば停滞カウンタはリセット
        session.finish_pass(1);
        assert_eq!(session.stagnant_passes(), 0);
        assert_eq!(policy.next_state(&session), LoopState::BudgetExhausted);
    }

    #[test]
    fn test_policy_prefers_converged_at_budget() {
        let policy = ConvergencePolicy {
            stagnation_threshold: 2,
            scroll_budget: 2,
        };
        let mut session = SessionState::new();
        session.finish_pass(0);
        session.finish_pass(0);
        assert_eq!(policy.next_state(&session), LoopState::Converged);
    }

    #[test]
    fn test_merge_dedupes_first_wins() {
        let mut session = SessionState::new();
        let mut first = record(Some("coca cola"));
        first.image_url = Some("https://x/first.jpg".into());
        let mut second = record(Some("Coca  Cola"));
        second.image_url = Some("https://x/second.jpg".into());

        assert!(session.merge(first));
        assert!(!session.merge(second));
        assert_eq!(session.records().len(), 1);
        assert_eq!(
            session.records()[0].image_url.as_deref(),
            Some("https://x/first.jpg")
        );
    }

    #[test]
    fn test_merge_drops_unnamed() {
        let mut session = SessionState::new();
        assert!(!session.merge(record(None)));
        assert!(session.records().is_empty());
    }

    #[tokio::test]
    async fn test_converges_after_two_stagnant_passes() {
        let driver = MockDriver::with_passes(vec![
            vec![card("Apple Juice")],
            vec![card("Apple Juice"), card("Banana Bread")],
            vec![card("Apple Juice"), card("Banana Bread"), card("Cherry Cola")],
        ]);
        let profile = sample_profile("shop", 20);

        let outcome = engine().run(&driver, &profile, &CancelFlag::new()).await.unwrap();

        assert_eq!(outcome.state, LoopState::Converged);
        assert_eq!(outcome.passes, 5);
        assert_eq!(driver.scroll_count(), 5);
        assert_eq!(
            names(&outcome.records),
            vec!["Apple Juice", "Banana Bread", "Cherry Cola"]
        );
    }

    #[tokio::test]
    async fn test_settle_waits_for_more_cards_than_last_pass() {
        let driver = MockDriver::with_passes(vec![
            vec![card("Apple Juice")],
            vec![card("Apple Juice"), card("Banana Bread")],
            vec![card("Apple Juice"), card("Banana Bread"), card("Cherry Cola")],
        ]);
        let profile = sample_profile("shop", 20);

        engine().run(&driver, &profile, &CancelFlag::new()).await.unwrap();

        // 直前のパスで見えた件数 + 1 を待つ（最初は 0 + 1）
        assert_eq!(driver.count_waits(&profile.card_selector), vec![1, 2, 3, 4, 4]);
    }

    #[tokio::test]
    async fn test_never_exceeds_scroll_budget() {
        let driver = MockDriver::with_passes(vec![
            vec![card("Apple Juice")],
            vec![card("Apple Juice"), card("Banana Bread")],
            vec![card("Apple Juice"), card("Banana Bread"), card("Cherry Cola")],
        ]);
        let profile = sample_profile("shop", 4);

        let outcome = engine().run(&driver, &profile, &CancelFlag::new()).await.unwrap();

        assert_eq!(outcome.state, LoopState::BudgetExhausted);
        assert_eq!(outcome.passes, 4);
        assert_eq!(driver.scroll_count(), 4);
        assert_eq!(outcome.records.len(), 3);
    }

    #[tokio::test]
    async fn test_filtered_names_after_first_pass() {
        let driver = MockDriver::with_static_cards(vec![
            MockElement::card("£5.00", None, None),
            MockElement::card("Ok", None, None),
            MockElement::card("Veggie Burger", None, None),
        ]);
        let profile = sample_profile("shop", 3);
        let mut session = SessionState::new();

        driver.scroll().await.unwrap();
        engine()
            .extract_pass(&driver, &profile, &mut session)
            .await
            .unwrap();
        assert_eq!(names(session.records()), vec!["Veggie Burger"]);

        let outcome = engine().run(&driver, &profile, &CancelFlag::new()).await.unwrap();
        assert_eq!(names(&outcome.records), vec!["Veggie Burger"]);
        assert!(outcome.passes <= 3);
    }

    #[tokio::test]
    async fn test_same_product_across_passes_merges() {
        let driver = MockDriver::with_passes(vec![
            vec![MockElement::card("coca cola", Some("£1.50"), Some("https://x/first.jpg"))],
            vec![MockElement::card("Coca Cola", Some("£1.50"), Some("https://x/second.jpg"))],
        ]);
        let profile = sample_profile("shop", 10);

        let outcome = engine().run(&driver, &profile, &CancelFlag::new()).await.unwrap();
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.records[0].name.as_deref(), Some("coca cola"));
        assert_eq!(
            outcome.records[0].image_url.as_deref(),
            Some("https://x/first.jpg")
        );
    }

    #[tokio::test]
    async fn test_static_snapshot_is_idempotent() {
        let cards = vec![
            card("Margherita Pizza"),
            MockElement::card("Garlic Bread", Some("£3.49"), None),
            card("Tiramisu"),
        ];
        let profile = sample_profile("shop", 6);

        let first = engine()
            .run(&MockDriver::with_static_cards(cards.clone()), &profile, &CancelFlag::new())
            .await
            .unwrap();
        let second = engine()
            .run(&MockDriver::with_static_cards(cards), &profile, &CancelFlag::new())
            .await
            .unwrap();

        assert_eq!(first.records, second.records);
        assert_eq!(first.records.len(), 3);
        assert_eq!(first.records[0].image_url.as_deref(), Some("https://cdn.example/a.jpg"));
        assert_eq!(first.records[1].image_url, None);
    }

    #[tokio::test]
    async fn test_zero_products_is_not_an_error() {
        let driver = MockDriver::new();
        let outcome = engine()
            .run(&driver, &sample_profile("shop", 5), &CancelFlag::new())
            .await
            .unwrap();
        assert_eq!(outcome.state, LoopState::Converged);
        assert!(outcome.records.is_empty());
        assert!(!outcome.readiness.cards_present);
    }

    #[tokio::test]
    async fn test_driver_fault_keeps_partial_records() {
        let driver = MockDriver::with_passes(vec![
            vec![card("Apple Juice")],
            vec![card("Apple Juice"), card("Banana Bread")],
            vec![card("Apple Juice"), card("Banana Bread"), card("Cherry Cola")],
        ])
        .fail_on_scroll(3);
        let profile = sample_profile("shop", 10);

        let fault = engine().run(&driver, &profile, &CancelFlag::new()).await.unwrap_err();

        assert!(matches!(
            fault.error,
            ScraperError::Scrape { ref site_key, .. } if site_key == "shop"
        ));
        assert_eq!(fault.passes, 2);
        assert_eq!(names(&fault.records), vec!["Apple Juice", "Banana Bread"]);
    }

    #[tokio::test]
    async fn test_navigation_fault() {
        let driver = MockDriver::new().fail_navigate();
        let fault = engine()
            .run(&driver, &sample_profile("shop", 5), &CancelFlag::new())
            .await
            .unwrap_err();
        assert!(matches!(fault.error, ScraperError::Navigation { .. }));
        assert!(fault.records.is_empty());
        assert_eq!(driver.scroll_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_between_passes() {
        let cancel = CancelFlag::new();
        let driver = MockDriver::with_passes(vec![
            vec![card("Apple Juice")],
            vec![card("Apple Juice"), card("Banana Bread")],
            vec![card("Apple Juice"), card("Banana Bread"), card("Cherry Cola")],
        ])
        .cancel_after_scroll(2, cancel.clone());
        let profile = sample_profile("shop", 10);

        let outcome = engine().run(&driver, &profile, &cancel).await.unwrap();

        assert_eq!(outcome.state, LoopState::Cancelled);
        // 2回目のパスは最後まで実行される
        assert_eq!(outcome.passes, 2);
        assert_eq!(names(&outcome.records), vec!["Apple Juice", "Banana Bread"]);
    }
}
