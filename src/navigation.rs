//! ナビゲーション制御
//!
//! 入口URLへ遷移し、ボット対策チャレンジの解除待ちと位置情報（郵便番号）入力を行って、
//! 商品カードが描画された「概ね抽出可能」な状態にする。
//! 遷移そのものの失敗以外は全てソフトな結果として [`Readiness`] に載せる。

use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::DriverError;
use crate::profile::SiteProfile;
use crate::traits::{BrowserDriver, Condition};

/// 位置情報入力欄の候補（優先順）
const DEFAULT_INPUT_SELECTORS: &[&str] = &[
    r#"input[placeholder*="postcode" i]"#,
    r#"input[placeholder*="address" i]"#,
    r#"input[id*="location"]"#,
    r#"input[id*="search"]"#,
    r#"input[type="text"]"#,
];

const DEFAULT_SUBMIT_SELECTORS: &[&str] = &[
    r#"button[type="submit"]"#,
    r#"button[aria-label*="find" i]"#,
    r#"button[aria-label*="search" i]"#,
];

const DEFAULT_DISMISS_SELECTORS: &[&str] = &[
    r#"button[aria-label*="close" i]"#,
    r#"button[aria-label*="dismiss" i]"#,
    "button.close",
];

/// 位置情報入力の結果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "detail")]
pub enum LocationOutcome {
    NotRequired,
    Applied,
    InputNotFound,
    Failed(String),
}

/// ページが抽出可能かどうかの目安（保証ではない）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Readiness {
    pub challenge_cleared: bool,
    pub location: LocationOutcome,
    pub cards_present: bool,
}

#[derive(Debug, Clone)]
pub struct NavigationController {
    document_ready_timeout: Duration,
    challenge_timeout: Duration,
    challenge_markers: Vec<String>,
    location_timeout: Duration,
    content_timeout: Duration,
    location_settle: Duration,
}

impl NavigationController {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            document_ready_timeout: config.document_ready_timeout,
            challenge_timeout: config.challenge_timeout,
            challenge_markers: config.challenge_markers.clone(),
            location_timeout: config.location_timeout,
            content_timeout: config.content_timeout,
            location_settle: config.settle_interval,
        }
    }

    /// ページを準備する。遷移の失敗とドライバー障害のみエラー
    pub async fn prepare<D: BrowserDriver>(
        &self,
        driver: &D,
        profile: &SiteProfile,
    ) -> Result<Readiness, DriverError> {
        info!(site_key = %profile.key, "Loading {}", profile.url);
        driver.navigate(&profile.url).await?;

        if !driver
            .wait(&Condition::DocumentReady, self.document_ready_timeout)
            .await?
        {
            debug!(site_key = %profile.key, "Document not complete yet, continuing");
        }

        let challenge_cleared = self.wait_for_challenge(driver, profile).await?;

        let location = if profile.requires_location {
            let before = driver.find(&profile.card_selector).await?.len();
            let outcome = self.enter_location(driver, profile).await?;
            if outcome == LocationOutcome::Applied && before > 0 {
                self.wait_for_location_content(driver, profile, before).await?;
            }
            outcome
        } else {
            LocationOutcome::NotRequired
        };

        let cards_present = driver
            .wait(
                &Condition::SelectorPresent(profile.card_selector.clone()),
                self.content_timeout,
            )
            .await?;
        if !cards_present {
            warn!(
                site_key = %profile.key,
                "No product cards matched {:?} after {:?}",
                profile.card_selector,
                self.content_timeout
            );
        }

        Ok(Readiness {
            challenge_cleared,
            location,
            cards_present,
        })
    }

    /// 入力前から一覧が出ていた場合、入力後の一覧に入れ替わるのを待つ
    ///
    /// 件数が増えなければ `location_settle` だけ待って先へ進む。
    async fn wait_for_location_content<D: BrowserDriver>(
        &self,
        driver: &D,
        profile: &SiteProfile,
        cards_before: usize,
    ) -> Result<(), DriverError> {
        let condition = Condition::SelectorCountAtLeast {
            selector: profile.card_selector.clone(),
            count: cards_before + 1,
        };
        if !driver.wait(&condition, self.location_settle).await? {
            debug!(
                site_key = %profile.key,
                "Card count unchanged after location entry ({} cards)",
                cards_before
            );
        }
        Ok(())
    }

    async fn wait_for_challenge<D: BrowserDriver>(
        &self,
        driver: &D,
        profile: &SiteProfile,
    ) -> Result<bool, DriverError> {
        if self.challenge_markers.is_empty() {
            return Ok(true);
        }

        let condition = Condition::ChallengeCleared {
            markers: self.challenge_markers.clone(),
        };
        let cleared = driver.wait(&condition, self.challenge_timeout).await?;
        if cleared {
            debug!(site_key = %profile.key, "No challenge page detected");
        } else {
            warn!(
                site_key = %profile.key,
                "Challenge page still showing after {:?}, scraping anyway",
                self.challenge_timeout
            );
        }
        Ok(cleared)
    }

    async fn enter_location<D: BrowserDriver>(
        &self,
        driver: &D,
        profile: &SiteProfile,
    ) -> Result<LocationOutcome, DriverError> {
        let Some(value) = profile.location_value.as_deref() else {
            return Ok(LocationOutcome::NotRequired);
        };
        info!(site_key = %profile.key, "Entering location: {}", value);

        let inputs = candidates(
            profile.location.input_selector.as_deref(),
            DEFAULT_INPUT_SELECTORS,
        );
        let appeared = driver
            .wait(
                &Condition::SelectorPresent(inputs.join(", ")),
                self.location_timeout,
            )
            .await?;
        if !appeared {
            warn!(site_key = %profile.key, "Location input not found, continuing without it");
            return Ok(LocationOutcome::InputNotFound);
        }

        let Some(input) = first_match(driver, &inputs).await? else {
            warn!(site_key = %profile.key, "Location input disappeared, continuing without it");
            return Ok(LocationOutcome::InputNotFound);
        };

        if let Err(e) = driver.fill(&input, value).await {
            warn!(site_key = %profile.key, "Failed to type location: {}", e);
            return Ok(LocationOutcome::Failed(e.to_string()));
        }

        let submits = candidates(
            profile.location.submit_selector.as_deref(),
            DEFAULT_SUBMIT_SELECTORS,
        );
        let clicked = match first_match(driver, &submits).await? {
            Some(button) => match driver.click(&button).await {
                Ok(()) => true,
                Err(e) => {
                    debug!("Submit button click failed: {}", e);
                    false
                }
            },
            None => false,
        };
        if !clicked {
            debug!(site_key = %profile.key, "No submit button clicked, pressing Enter");
            if let Err(e) = driver.submit(&input).await {
                warn!(site_key = %profile.key, "Failed to submit location: {}", e);
                return Ok(LocationOutcome::Failed(e.to_string()));
            }
        }

        self.dismiss_popup(driver, profile).await?;

        info!(site_key = %profile.key, "Location submitted");
        Ok(LocationOutcome::Applied)
    }

    /// 入力後に出るモーダルを閉じる（見つからなければ何もしない）
    async fn dismiss_popup<D: BrowserDriver>(
        &self,
        driver: &D,
        profile: &SiteProfile,
    ) -> Result<(), DriverError> {
        let mut selectors: Vec<&str> = profile
            .location
            .dismiss_selectors
            .iter()
            .map(String::as_str)
            .collect();
        selectors.extend_from_slice(DEFAULT_DISMISS_SELECTORS);

        if let Some(button) = first_match(driver, &selectors).await? {
            match driver.click(&button).await {
                Ok(()) => debug!(site_key = %profile.key, "Closed popup"),
                Err(e) => debug!("Popup close failed: {}", e),
            }
        }
        Ok(())
    }
}

fn candidates<'a>(configured: Option<&'a str>, defaults: &[&'a str]) -> Vec<&'a str> {
    configured
        .into_iter()
        .chain(defaults.iter().copied())
        .collect()
}

/// 候補セレクタを順に試し、最初に見つかった要素を返す
async fn first_match<D: BrowserDriver>(
    driver: &D,
    selectors: &[&str],
) -> Result<Option<D::Node>, DriverError> {
    for selector in selectors {
        if let Some(node) = driver.find(selector).await?.into_iter().next() {
            debug!("Matched {}", selector);
            return Ok(Some(node));
        }
    }
    Ok(None)
}
