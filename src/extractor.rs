use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use reqwest::{Client, Url};
use scraper::{ElementRef, Html, Selector};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::errors::{AppResult, ExtractionFailure};
use crate::locales::LocaleParams;
use crate::view::SortOrder;

const PANEL_SELECTOR: &str = "div.m6QErb.XiKgde.kA9KIf.dS8AEf.XiKgde";
const CARD_SELECTOR: &str = "div[data-review-id]";
const CONSENT_SELECTOR: &str = r#"button[jsname="b3VHJd"]"#;
const RATING_SELECTOR: &str = ".kvMYJc";
const NAME_SELECTOR: &str = ".d4r55";
const DATE_SELECTOR: &str = ".rsqaWe";
const TEXT_SELECTOR: &str = ".wiI7pd";
const AVATAR_SELECTOR: &str = ".NBa7we";
const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                          (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
const MIN_SCROLLS: u32 = 60;
const STALL_LIMIT: u32 = 5;
const SCROLL_PAUSE_MS: u64 = 600;
const CONSENT_TIMEOUT_MS: u64 = 5_000;

/// Runs inside the rendering service: scrolls the reviews panel until its height
/// stops growing and hands back the rendered document.
const SCROLL_SCRIPT: &str = r#"
export default async function ({ page, context }) {
  await page.setUserAgent(context.userAgent);
  await page.setExtraHTTPHeaders({ "Accept-Language": context.acceptLanguage });
  await page.setViewport({ width: 1920, height: 1080 });
  await page.goto(context.url, { timeout: context.navigationTimeout, waitUntil: "domcontentloaded" });
  try {
    const consent = await page.waitForSelector(context.consentSelector, { timeout: context.consentTimeout });
    if (consent) await consent.click();
  } catch (_) {}
  await page.waitForSelector(context.panelSelector, { timeout: context.selectorTimeout });
  let lastHeight = -1;
  let stalls = 0;
  for (let i = 0; i < context.maxScrolls && stalls < context.stallLimit; i++) {
    await page.$eval(context.panelSelector, (el) => el.scrollTo(0, el.scrollHeight));
    await new Promise((resolve) => setTimeout(resolve, context.scrollPause));
    const height = await page.$eval(context.panelSelector, (el) => el.scrollHeight);
    stalls = height === lastHeight ? stalls + 1 : 0;
    lastHeight = height;
  }
  return { data: await page.content(), type: "text/html" };
}
"#;

/// One review as extracted from a place page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawReview {
    pub review_id: String,
    pub name: String,
    pub date: String,
    pub stars: f64,
    pub text: String,
    pub avatar: String,
    pub profile_link: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionRequest {
    pub place_url: String,
    pub locale: String,
    pub locale_params: LocaleParams,
    pub min_rating: f64,
    /// 0 collects everything the page yields.
    pub max_count: u32,
    pub sort: SortOrder,
}

/// Source of raw reviews for a place. Implementations return reviews deduplicated
/// by id, filtered by `min_rating`, capped at `max_count` and ordered by `sort`.
#[async_trait]
pub trait ReviewExtractor: Send + Sync {
    async fn extract(&self, request: &ExtractionRequest)
        -> Result<Vec<RawReview>, ExtractionFailure>;
}

/// A card as it appears on the page, before filtering.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedCard {
    pub review_id: String,
    pub rating: Option<f64>,
    pub name: String,
    pub date: String,
    pub text: String,
    pub avatar: String,
    pub profile_link: String,
}

struct CardSelectors {
    panel: Selector,
    card: Selector,
    rating: Selector,
    name: Selector,
    date: Selector,
    text: Selector,
    avatar: Selector,
}

impl CardSelectors {
    fn compile() -> Result<Self, ExtractionFailure> {
        Ok(Self {
            panel: compile_selector(PANEL_SELECTOR)?,
            card: compile_selector(CARD_SELECTOR)?,
            rating: compile_selector(RATING_SELECTOR)?,
            name: compile_selector(NAME_SELECTOR)?,
            date: compile_selector(DATE_SELECTOR)?,
            text: compile_selector(TEXT_SELECTOR)?,
            avatar: compile_selector(AVATAR_SELECTOR)?,
        })
    }
}

fn compile_selector(raw: &str) -> Result<Selector, ExtractionFailure> {
    Selector::parse(raw)
        .map_err(|err| ExtractionFailure::new(format!("invalid selector {raw}: {err}")))
}

/// Reads review cards from a rendered place page in document order. Fails when
/// the page carries neither the reviews panel nor any card.
pub fn parse_review_cards(html: &str) -> Result<Vec<ParsedCard>, ExtractionFailure> {
    let selectors = CardSelectors::compile()?;
    let document = Html::parse_document(html);
    let has_panel = document.select(&selectors.panel).next().is_some();

    let cards: Vec<ParsedCard> = document
        .select(&selectors.card)
        .filter_map(|card| {
            let review_id = card.value().attr("data-review-id")?.trim().to_string();
            if review_id.is_empty() {
                return None;
            }
            Some(ParsedCard {
                review_id,
                rating: card
                    .select(&selectors.rating)
                    .next()
                    .and_then(|el| el.value().attr("aria-label"))
                    .and_then(parse_rating),
                name: inner_text(&card, &selectors.name),
                date: inner_text(&card, &selectors.date),
                text: inner_text(&card, &selectors.text),
                avatar: card
                    .select(&selectors.avatar)
                    .next()
                    .and_then(|el| el.value().attr("src"))
                    .unwrap_or_default()
                    .to_string(),
                profile_link: card
                    .value()
                    .attr("data-href")
                    .unwrap_or_default()
                    .to_string(),
            })
        })
        .collect();

    if !has_panel && cards.is_empty() {
        return Err(ExtractionFailure::new(
            "reviews panel not found on the place page",
        ));
    }
    Ok(cards)
}

fn inner_text(card: &ElementRef<'_>, selector: &Selector) -> String {
    card.select(selector)
        .next()
        .map(|el| el.text().collect::<String>().trim().to_string())
        .unwrap_or_default()
}

/// Leading number of an aria label such as "4 stars" or "4,5 hvězdičky".
fn parse_rating(label: &str) -> Option<f64> {
    let token = label.split_whitespace().next()?;
    let value: f64 = token.replace(',', ".").parse().ok()?;
    (0.0..=5.0).contains(&value).then_some(value)
}

/// Deduplicates cards by id, drops unrated or under-threshold ones, stops at
/// `max_count` (0 = no cap) and orders the result.
pub fn finalize(
    cards: Vec<ParsedCard>,
    min_rating: f64,
    max_count: u32,
    sort: SortOrder,
) -> Vec<RawReview> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut reviews: Vec<RawReview> = Vec::new();
    for card in cards {
        if seen.contains(&card.review_id) {
            continue;
        }
        let Some(stars) = card.rating else {
            continue;
        };
        if stars < min_rating {
            continue;
        }
        seen.insert(card.review_id.clone());
        reviews.push(RawReview {
            review_id: card.review_id,
            name: card.name,
            date: card.date,
            stars,
            text: card.text,
            avatar: card.avatar,
            profile_link: card.profile_link,
        });
        if max_count > 0 && reviews.len() >= max_count as usize {
            break;
        }
    }

    match sort {
        SortOrder::Newest => {}
        SortOrder::Oldest => reviews.reverse(),
        SortOrder::Best => reviews.sort_by(|a, b| b.stars.total_cmp(&a.stars)),
        SortOrder::Worst => reviews.sort_by(|a, b| a.stars.total_cmp(&b.stars)),
    }
    reviews
}

/// Drives a headless browser hosted by a Browserless-compatible service.
pub struct BrowserlessExtractor {
    http: Client,
    base_url: String,
    token: Option<SecretString>,
    navigation_timeout_ms: u64,
    selector_timeout_ms: u64,
    screenshot_dir: PathBuf,
}

impl BrowserlessExtractor {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        let budget = config.navigation_timeout_ms + config.selector_timeout_ms + 180_000;
        let http = Client::builder()
            .timeout(Duration::from_millis(budget))
            .build()?;
        Ok(Self {
            http,
            base_url: config.browserless_url.trim_end_matches('/').to_string(),
            token: config.browserless_token.clone(),
            navigation_timeout_ms: config.navigation_timeout_ms,
            selector_timeout_ms: config.selector_timeout_ms,
            screenshot_dir: config.screenshot_dir.clone(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, ExtractionFailure> {
        let mut url = Url::parse(&format!("{}/{path}", self.base_url)).map_err(|err| {
            ExtractionFailure::new(format!("invalid rendering service url: {err}"))
        })?;
        if let Some(token) = &self.token {
            url.query_pairs_mut()
                .append_pair("token", token.expose_secret());
        }
        Ok(url)
    }

    async fn render(&self, page_url: &Url, request: &ExtractionRequest) -> Result<String, ExtractionFailure> {
        let max_scrolls = MIN_SCROLLS.max(request.max_count.saturating_mul(2));
        let body = json!({
            "code": SCROLL_SCRIPT,
            "context": {
                "url": page_url.as_str(),
                "userAgent": USER_AGENT,
                "acceptLanguage": request.locale_params.accept_language,
                "navigationTimeout": self.navigation_timeout_ms,
                "selectorTimeout": self.selector_timeout_ms,
                "consentSelector": CONSENT_SELECTOR,
                "consentTimeout": CONSENT_TIMEOUT_MS,
                "panelSelector": PANEL_SELECTOR,
                "maxScrolls": max_scrolls,
                "stallLimit": STALL_LIMIT,
                "scrollPause": SCROLL_PAUSE_MS,
            },
        });

        let response = self
            .http
            .post(self.endpoint("function")?)
            .json(&body)
            .send()
            .await
            .map_err(|err| describe_transport_error("render request", &err))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ExtractionFailure::new(format!(
                "rendering service returned {}: {}",
                status.as_u16(),
                message.trim()
            )));
        }
        response
            .text()
            .await
            .map_err(|err| describe_transport_error("render response", &err))
    }

    /// Best effort: a failed capture only loses the evidence.
    async fn capture_screenshot(&self, page_url: &Url, request: &ExtractionRequest) -> Option<PathBuf> {
        let body = json!({
            "url": page_url.as_str(),
            "setExtraHTTPHeaders": { "Accept-Language": request.locale_params.accept_language },
            "gotoOptions": { "timeout": self.navigation_timeout_ms, "waitUntil": "domcontentloaded" },
            "options": { "type": "png", "fullPage": false },
        });
        let url = self.endpoint("screenshot").ok()?;
        let bytes = match self.http.post(url).json(&body).send().await {
            Ok(response) if response.status().is_success() => match response.bytes().await {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(target: "extractor", ?err, "failed to read screenshot body");
                    return None;
                }
            },
            Ok(response) => {
                warn!(
                    target: "extractor",
                    status = response.status().as_u16(),
                    "screenshot capture rejected"
                );
                return None;
            }
            Err(err) => {
                warn!(target: "extractor", ?err, "screenshot capture failed");
                return None;
            }
        };

        let suffix: String = thread_rng()
            .sample_iter(&Alphanumeric)
            .take(6)
            .map(char::from)
            .collect();
        let file_name = format!(
            "{}-{}-{}.png",
            Utc::now().format("%Y%m%dT%H%M%S"),
            request.locale,
            suffix
        );
        let path = self.screenshot_dir.join(file_name);
        let written = match tokio::fs::create_dir_all(&self.screenshot_dir).await {
            Ok(()) => tokio::fs::write(&path, &bytes).await,
            Err(err) => Err(err),
        };
        match written {
            Ok(()) => Some(path),
            Err(err) => {
                warn!(target: "extractor", ?err, path = %path.display(), "failed to store screenshot");
                None
            }
        }
    }
}

#[async_trait]
impl ReviewExtractor for BrowserlessExtractor {
    async fn extract(
        &self,
        request: &ExtractionRequest,
    ) -> Result<Vec<RawReview>, ExtractionFailure> {
        let mut page_url = Url::parse(&request.place_url)
            .map_err(|err| ExtractionFailure::new(format!("invalid place url: {err}")))?;
        page_url
            .query_pairs_mut()
            .append_pair("hl", request.locale_params.hl)
            .append_pair("gl", request.locale_params.gl);

        info!(target: "extractor", place = %request.place_url, locale = %request.locale, "extraction started");
        let outcome = match self.render(&page_url, request).await {
            Ok(html) => parse_review_cards(&html),
            Err(err) => Err(err),
        };
        match outcome {
            Ok(cards) => {
                debug!(target: "extractor", cards = cards.len(), "review cards parsed");
                let reviews = finalize(cards, request.min_rating, request.max_count, request.sort);
                info!(
                    target: "extractor",
                    place = %request.place_url,
                    locale = %request.locale,
                    reviews = reviews.len(),
                    "extraction finished"
                );
                Ok(reviews)
            }
            Err(failure) => {
                let screenshot = self.capture_screenshot(&page_url, request).await;
                Err(failure.with_screenshot(screenshot))
            }
        }
    }
}

fn describe_transport_error(stage: &str, err: &reqwest::Error) -> ExtractionFailure {
    if err.is_timeout() {
        ExtractionFailure::new(format!("{stage} timed out"))
    } else {
        ExtractionFailure::new(format!("{stage} failed: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use httptest::matchers::request;
    use httptest::responders::status_code;
    use httptest::{Expectation, Server};
    use tempfile::tempdir;

    use super::*;
    use crate::locales;

    const PAGE: &str = r#"
    <html><body>
      <div class="m6QErb XiKgde kA9KIf dS8AEf XiKgde">
        <div data-review-id="r1" data-href="https://maps.example/contrib/1">
          <img class="NBa7we" src="https://img.example/1.png">
          <div class="d4r55"> Alice </div>
          <span class="kvMYJc" aria-label="5 stars"></span>
          <span class="rsqaWe">a week ago</span>
          <span class="wiI7pd">Great coffee</span>
          <div class="GBkF3d" data-review-id="r1">Like</div>
        </div>
        <div data-review-id="r2">
          <div class="d4r55">Bob</div>
          <span class="kvMYJc" aria-label="2,0 hvězdičky"></span>
          <span class="rsqaWe">2 weeks ago</span>
        </div>
        <div data-review-id="r3">
          <div class="d4r55">No rating</div>
        </div>
        <div data-review-id="r4">
          <div class="d4r55">Carol</div>
          <span class="kvMYJc" aria-label="4 stars"></span>
        </div>
      </div>
    </body></html>
    "#;

    fn request(max_count: u32, sort: SortOrder) -> ExtractionRequest {
        ExtractionRequest {
            place_url: "https://maps.example/place?cid=42".into(),
            locale: "en-US".into(),
            locale_params: locales::lookup("en-US").unwrap(),
            min_rating: 1.0,
            max_count,
            sort,
        }
    }

    fn extractor_for(server: &Server, screenshots: &std::path::Path) -> BrowserlessExtractor {
        let mut config = AppConfig::with_data_dir(screenshots);
        config.browserless_url = server.url_str("/");
        config.screenshot_dir = screenshots.join("shots");
        BrowserlessExtractor::new(&config).unwrap()
    }

    #[test]
    fn parses_cards_in_document_order() {
        let cards = parse_review_cards(PAGE).unwrap();
        let ids: Vec<&str> = cards.iter().map(|c| c.review_id.as_str()).collect();
        assert_eq!(ids, vec!["r1", "r1", "r2", "r3", "r4"]);
        assert_eq!(cards[0].name, "Alice");
        assert_eq!(cards[0].rating, Some(5.0));
        assert_eq!(cards[0].avatar, "https://img.example/1.png");
        assert_eq!(cards[0].profile_link, "https://maps.example/contrib/1");
        assert_eq!(cards[2].rating, Some(2.0));
        assert_eq!(cards[3].rating, None);
    }

    #[test]
    fn missing_panel_is_a_failure() {
        let err = parse_review_cards("<html><body><p>consent wall</p></body></html>").unwrap_err();
        assert!(err.message.contains("panel not found"));
    }

    #[test]
    fn finalize_dedupes_filters_and_caps() {
        let cards = parse_review_cards(PAGE).unwrap();
        let all = finalize(cards.clone(), 1.0, 0, SortOrder::Newest);
        let ids: Vec<&str> = all.iter().map(|r| r.review_id.as_str()).collect();
        assert_eq!(ids, vec!["r1", "r2", "r4"]);
        assert_eq!(all[0].text, "Great coffee");

        let capped = finalize(cards.clone(), 3.0, 1, SortOrder::Newest);
        assert_eq!(capped.len(), 1);
        assert_eq!(capped[0].review_id, "r1");

        let worst = finalize(cards, 1.0, 0, SortOrder::Worst);
        assert_eq!(worst[0].review_id, "r2");
    }

    #[tokio::test]
    async fn extracts_through_rendering_service() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", "/function"))
                .respond_with(status_code(200).body(PAGE.to_string())),
        );
        let dir = tempdir().unwrap();
        let extractor = extractor_for(&server, dir.path());

        let reviews = extractor
            .extract(&request(0, SortOrder::Best))
            .await
            .unwrap();
        assert_eq!(reviews.len(), 3);
        assert_eq!(reviews[0].stars, 5.0);
        assert_eq!(reviews[2].stars, 2.0);
    }

    #[tokio::test]
    async fn failure_carries_screenshot() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", "/function"))
                .respond_with(status_code(408).body("waiting for selector failed")),
        );
        server.expect(
            Expectation::matching(request::method_path("POST", "/screenshot"))
                .respond_with(status_code(200).body(vec![0x89_u8, b'P', b'N', b'G'])),
        );
        let dir = tempdir().unwrap();
        let extractor = extractor_for(&server, dir.path());

        let failure = extractor
            .extract(&request(0, SortOrder::Newest))
            .await
            .unwrap_err();
        assert!(failure.message.contains("408"));
        let shot = failure.screenshot.expect("screenshot path");
        assert!(shot.exists());
        assert!(shot.starts_with(dir.path().join("shots")));
    }
}
