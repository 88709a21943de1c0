use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use httptest::matchers::request;
use httptest::responders::status_code;
use httptest::{Expectation, Server};
use tempfile::tempdir;

use place_reviews::commands::{self, FetchReviewsRequest, StatsRequest, TargetRequest};
use place_reviews::config::AppConfig;
use place_reviews::db;
use place_reviews::errors::ExtractionFailure;
use place_reviews::extractor::{ExtractionRequest, RawReview, ReviewExtractor};
use place_reviews::{AppState, SortOrder};

const PLACE: &str = "https://maps.example/place?cid=2718";

const PLACE_PAGE: &str = r#"
<html><body>
  <div class="m6QErb XiKgde kA9KIf dS8AEf XiKgde">
    <div data-review-id="rv-1">
      <div class="d4r55">Dana</div>
      <span class="kvMYJc" aria-label="5 stars"></span>
      <span class="rsqaWe">3 days ago</span>
      <span class="wiI7pd">Friendly staff</span>
    </div>
    <div data-review-id="rv-2">
      <div class="d4r55">Eli</div>
      <span class="kvMYJc" aria-label="3 stars"></span>
      <span class="rsqaWe">a month ago</span>
    </div>
    <div data-review-id="rv-1">
      <div class="d4r55">Dana</div>
      <span class="kvMYJc" aria-label="5 stars"></span>
    </div>
  </div>
</body></html>
"#;

struct SlowExtractor {
    calls: AtomicUsize,
}

#[async_trait]
impl ReviewExtractor for SlowExtractor {
    async fn extract(
        &self,
        _request: &ExtractionRequest,
    ) -> Result<Vec<RawReview>, ExtractionFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(40)).await;
        Ok(vec![RawReview {
            review_id: "only".into(),
            name: "Frankie".into(),
            date: "today".into(),
            stars: 4.0,
            text: "ok".into(),
            avatar: String::new(),
            profile_link: String::new(),
        }])
    }
}

#[tokio::test]
async fn cached_reviews_are_served_without_second_render() {
    let server = Server::run();
    server.expect(
        Expectation::matching(request::method_path("POST", "/function"))
            .respond_with(status_code(200).body(PLACE_PAGE.to_string())),
    );
    let dir = tempdir().unwrap();
    let mut config = AppConfig::with_data_dir(dir.path());
    config.browserless_url = server.url_str("/");
    config.default_locales = vec!["en-US".into()];
    let state = AppState::initialize(config).unwrap();

    let first = commands::fetch_reviews(&state, FetchReviewsRequest::new(PLACE))
        .await
        .unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].count, 2);
    assert_eq!(first[0].average_rating, 4.0);

    let mut best_only = FetchReviewsRequest::new(PLACE);
    best_only.min_rating = 4.5;
    best_only.sort = SortOrder::Best;
    let narrowed = commands::fetch_reviews(&state, best_only).await.unwrap();
    assert_eq!(narrowed[0].count, 1);
    assert_eq!(narrowed[0].reviews[0].review_id, "rv-1");

    let summary = commands::stats(
        &state,
        StatsRequest {
            place_url: PLACE.into(),
            locale: Some("en-US".into()),
            exclude_below: Some(4.0),
            max_reviews: 2000,
            force_refresh: false,
        },
    )
    .await
    .unwrap();
    assert_eq!(summary.total_count, 2);
    assert_eq!(summary.filtered_count, Some(1));
    assert_eq!(commands::health(&state).status, "ok");
}

#[tokio::test]
async fn concurrent_forced_fetches_extract_once() {
    let dir = tempdir().unwrap();
    let extractor = Arc::new(SlowExtractor {
        calls: AtomicUsize::new(0),
    });
    let state = AppState::with_extractor(AppConfig::with_data_dir(dir.path()), extractor.clone())
        .unwrap();

    let mut forced = FetchReviewsRequest::new(PLACE);
    forced.locales = Some(vec!["sk-SK".into()]);
    forced.force_refresh = true;

    let (left, right) = tokio::join!(
        commands::fetch_reviews(&state, forced.clone()),
        commands::fetch_reviews(&state, forced.clone()),
    );
    let left = left.unwrap();
    let right = right.unwrap();
    assert_eq!(extractor.calls.load(Ordering::SeqCst), 1);
    assert_eq!(left, right);
    assert_eq!(left[0].reviews[0].review_id, "only");
}

#[tokio::test]
async fn monitor_scan_refreshes_registered_places() {
    let dir = tempdir().unwrap();
    let extractor = Arc::new(SlowExtractor {
        calls: AtomicUsize::new(0),
    });
    let state = AppState::with_extractor(AppConfig::with_data_dir(dir.path()), extractor.clone())
        .unwrap();

    let mut monitor = TargetRequest::new(PLACE);
    monitor.locales = Some(vec!["en-GB".into(), "pl-PL".into()]);
    let created = commands::create_monitor(&state, monitor).await.unwrap();
    assert!(created.last_run.is_none());

    let report = state.monitor().scan_once(db::now()).await.unwrap();
    assert_eq!(report.due, 1);
    assert_eq!(report.refreshed, 1);
    assert_eq!(extractor.calls.load(Ordering::SeqCst), 2);

    let monitors = commands::list_monitors(&state).await.unwrap();
    assert!(monitors[0].last_run.is_some());
}
