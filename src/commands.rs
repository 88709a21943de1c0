use std::future::Future;

use chrono::{DateTime, Duration, Utc};
use futures_util::future::try_join_all;
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cache::{self, CacheMarker};
use crate::db;
use crate::errors::{AppError, AppResult, ErrorEnvelope};
use crate::locales;
use crate::monitor::schedule_retry;
use crate::reviews::{self, PurgeFilter};
use crate::targets::{self, InstancePatch, MonitoredPlace, NewTarget, ReviewInstance};
use crate::view::{self, ReviewQuery, ReviewsView, SortOrder, StatsSummary};
use crate::{AppState, ServiceHealth};

pub type CommandResult<T> = Result<T, ErrorEnvelope>;

const REQUEST_ID_LEN: usize = 12;
const DEFAULT_MIN_RATING: f64 = 1.0;
const DEFAULT_MAX_REVIEWS: u32 = 200;
const DEFAULT_STATS_MAX_REVIEWS: u32 = 2000;
const DEFAULT_INTERVAL_MINUTES: u32 = 60;
const FALLBACK_LOCALE: &str = "en-US";

fn default_min_rating() -> f64 {
    DEFAULT_MIN_RATING
}

fn default_max_reviews() -> u32 {
    DEFAULT_MAX_REVIEWS
}

fn default_stats_max_reviews() -> u32 {
    DEFAULT_STATS_MAX_REVIEWS
}

fn default_interval_minutes() -> u32 {
    DEFAULT_INTERVAL_MINUTES
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct FetchReviewsRequest {
    pub place_url: String,
    #[serde(default)]
    pub locales: Option<Vec<String>>,
    #[serde(default)]
    pub force_refresh: bool,
    #[serde(default = "default_min_rating")]
    pub min_rating: f64,
    #[serde(default = "default_max_reviews")]
    pub max_reviews: u32,
    #[serde(default)]
    pub sort: SortOrder,
}

impl FetchReviewsRequest {
    pub fn new(place_url: impl Into<String>) -> Self {
        Self {
            place_url: place_url.into(),
            locales: None,
            force_refresh: false,
            min_rating: DEFAULT_MIN_RATING,
            max_reviews: DEFAULT_MAX_REVIEWS,
            sort: SortOrder::Newest,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatsRequest {
    pub place_url: String,
    #[serde(default)]
    pub locale: Option<String>,
    #[serde(default)]
    pub exclude_below: Option<f64>,
    #[serde(default = "default_stats_max_reviews")]
    pub max_reviews: u32,
    #[serde(default)]
    pub force_refresh: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InstanceStatsRequest {
    #[serde(default)]
    pub locale: Option<String>,
    #[serde(default)]
    pub exclude_below: Option<f64>,
    #[serde(default)]
    pub force_refresh: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RefreshRequest {
    pub place_url: String,
    #[serde(default)]
    pub locales: Option<Vec<String>>,
    #[serde(default = "default_true")]
    pub background: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheQuery {
    #[serde(default)]
    pub place_url: Option<String>,
    #[serde(default)]
    pub locales: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheEntry {
    pub place_url: String,
    pub locale: String,
    pub avg_rating: f64,
    pub updated_at: Option<DateTime<Utc>>,
    pub count: usize,
}

impl From<CacheMarker> for CacheEntry {
    fn from(marker: CacheMarker) -> Self {
        Self {
            place_url: marker.place_url,
            locale: marker.locale,
            avg_rating: marker.avg_rating,
            updated_at: marker.refreshed_at,
            count: marker.review_count,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheDeleteRequest {
    pub place_url: String,
    #[serde(default)]
    pub locales: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModerationRequest {
    pub place_url: String,
    pub locale: String,
    pub review_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CleanupRequest {
    #[serde(default = "default_true")]
    pub delete_reviews: bool,
    #[serde(default = "default_true")]
    pub delete_cache: bool,
    #[serde(default)]
    pub place_url: Option<String>,
    #[serde(default)]
    pub locales: Option<Vec<String>>,
    /// Only reviews ingested more than this many days ago; markers ignore it.
    #[serde(default)]
    pub older_than_days: Option<u32>,
}

impl Default for CleanupRequest {
    fn default() -> Self {
        Self {
            delete_reviews: true,
            delete_cache: true,
            place_url: None,
            locales: None,
            older_than_days: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeletedCounts {
    pub reviews: usize,
    pub cache: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TargetRequest {
    pub place_url: String,
    #[serde(default)]
    pub locales: Option<Vec<String>>,
    #[serde(default = "default_interval_minutes")]
    pub interval_minutes: u32,
    #[serde(default = "default_min_rating")]
    pub min_rating: f64,
    #[serde(default = "default_max_reviews")]
    pub max_reviews: u32,
    #[serde(default)]
    pub sort: SortOrder,
}

impl TargetRequest {
    pub fn new(place_url: impl Into<String>) -> Self {
        Self {
            place_url: place_url.into(),
            locales: None,
            interval_minutes: DEFAULT_INTERVAL_MINUTES,
            min_rating: DEFAULT_MIN_RATING,
            max_reviews: DEFAULT_MAX_REVIEWS,
            sort: SortOrder::Newest,
        }
    }

    fn validated(&self) -> AppResult<NewTarget> {
        if self.interval_minutes == 0 {
            return Err(AppError::Validation(
                "interval_minutes must be at least 1".into(),
            ));
        }
        Ok(NewTarget {
            place_url: validate_place_url(&self.place_url)?,
            locales: self.locales.clone().unwrap_or_default(),
            interval_minutes: self.interval_minutes,
            defaults: ReviewQuery::new(
                validate_rating("min_rating", self.min_rating)?,
                self.max_reviews,
                self.sort,
            ),
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InstanceUpdateRequest {
    #[serde(default)]
    pub locales: Option<Vec<String>>,
    #[serde(default)]
    pub interval_minutes: Option<u32>,
    #[serde(default)]
    pub min_rating: Option<f64>,
    #[serde(default)]
    pub max_reviews: Option<u32>,
    #[serde(default)]
    pub sort: Option<SortOrder>,
    #[serde(default)]
    pub active: Option<bool>,
}

impl InstanceUpdateRequest {
    fn validated(&self) -> AppResult<InstancePatch> {
        if self.interval_minutes == Some(0) {
            return Err(AppError::Validation(
                "interval_minutes must be at least 1".into(),
            ));
        }
        let min_rating = match self.min_rating {
            Some(value) => Some(validate_rating("min_rating", value)?),
            None => None,
        };
        Ok(InstancePatch {
            place_url: None,
            locales: self.locales.clone(),
            interval_minutes: self.interval_minutes,
            min_rating,
            max_count: self.max_reviews,
            sort: self.sort,
            active: self.active,
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct Acknowledged {
    pub success: bool,
}

const ACK: Acknowledged = Acknowledged { success: true };

fn new_request_id() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(REQUEST_ID_LEN)
        .map(char::from)
        .collect()
}

/// Runs a handler under a fresh request id and turns its error into an envelope.
async fn respond<T, F>(operation: &'static str, handler: F) -> CommandResult<T>
where
    F: Future<Output = AppResult<T>>,
{
    let request_id = new_request_id();
    debug!(request_id = %request_id, operation, "handling request");
    handler.await.map_err(|err| {
        if !err.is_internal() {
            debug!(request_id = %request_id, operation, error = %err, "request rejected");
        }
        err.envelope(&request_id)
    })
}

/// Trimmed absolute http(s) URL with a host. The trimmed input, not the parsed
/// form, is the storage key.
pub fn validate_place_url(raw: &str) -> AppResult<String> {
    let trimmed = raw.trim();
    let parsed = Url::parse(trimmed)
        .map_err(|err| AppError::Validation(format!("invalid place_url: {err}")))?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(AppError::Validation(
            "place_url must be an http(s) URL".into(),
        ));
    }
    Ok(trimmed.to_string())
}

fn validate_rating(field: &str, value: f64) -> AppResult<f64> {
    if !value.is_finite() || !(0.0..=5.0).contains(&value) {
        return Err(AppError::Validation(format!(
            "{field} must be between 0 and 5"
        )));
    }
    Ok(value)
}

fn validate_owner(owner_id: &str) -> AppResult<&str> {
    let owner_id = owner_id.trim();
    if owner_id.is_empty() {
        return Err(AppError::Validation("owner id is required".into()));
    }
    Ok(owner_id)
}

/// Requested locales when any are given, else the configured defaults, else all;
/// unsupported codes are dropped.
fn requested_locales(state: &AppState, requested: Option<&[String]>) -> Vec<String> {
    let candidates = match requested {
        Some(list) if !list.is_empty() => list,
        _ => state.config().default_locales.as_slice(),
    };
    let supported = locales::retain_supported(candidates);
    if supported.is_empty() && requested.map_or(true, |list| list.is_empty()) {
        return locales::all();
    }
    supported
}

fn stats_locale(explicit: Option<&str>, fallback: Option<&str>) -> String {
    let wanted = explicit.or(fallback).unwrap_or(FALLBACK_LOCALE);
    if locales::is_supported(wanted) {
        return wanted.to_string();
    }
    locales::all()
        .into_iter()
        .next()
        .unwrap_or_else(|| FALLBACK_LOCALE.to_string())
}

async fn resolve_concurrently(
    state: &AppState,
    place_url: &str,
    locales: &[String],
    force: bool,
    query: &ReviewQuery,
) -> AppResult<Vec<ReviewsView>> {
    let coordinator = state.coordinator();
    try_join_all(
        locales
            .iter()
            .map(|locale| coordinator.resolve(place_url, locale, force, query)),
    )
    .await
}

fn active_instance(instance: ReviewInstance) -> AppResult<ReviewInstance> {
    if !instance.active {
        return Err(AppError::NotFound(format!(
            "review instance {} not found",
            instance.id
        )));
    }
    Ok(instance)
}

async fn serve_instance(state: &AppState, instance: &ReviewInstance) -> AppResult<Vec<ReviewsView>> {
    let locales = locales::retain_supported(&instance.locales);
    resolve_concurrently(state, &instance.place_url, &locales, false, &instance.defaults).await
}

pub fn health(state: &AppState) -> ServiceHealth {
    state.health()
}

pub fn supported_locales() -> Vec<String> {
    let mut codes = locales::all();
    codes.sort();
    codes
}

/// Reviews for one place across locales, resolved concurrently.
pub async fn fetch_reviews(
    state: &AppState,
    request: FetchReviewsRequest,
) -> CommandResult<Vec<ReviewsView>> {
    respond("fetch_reviews", async {
        let place_url = validate_place_url(&request.place_url)?;
        let min_rating = validate_rating("min_rating", request.min_rating)?;
        let query = ReviewQuery::new(min_rating, request.max_reviews, request.sort);
        let locales = requested_locales(state, request.locales.as_deref());
        resolve_concurrently(state, &place_url, &locales, request.force_refresh, &query).await
    })
    .await
}

/// Reviews behind an active instance's public key.
pub async fn public_reviews(state: &AppState, public_key: &str) -> CommandResult<Vec<ReviewsView>> {
    respond("public_reviews", async {
        let instance = {
            let conn = state.connection();
            let conn = conn.lock();
            targets::instance_by_public_key(&conn, public_key.trim())?
        };
        let instance = instance
            .ok_or_else(|| AppError::NotFound("review instance not found".into()))
            .and_then(active_instance)?;
        serve_instance(state, &instance).await
    })
    .await
}

pub async fn instance_reviews(
    state: &AppState,
    owner_id: &str,
    instance_id: i64,
) -> CommandResult<Vec<ReviewsView>> {
    respond("instance_reviews", async {
        let owner_id = validate_owner(owner_id)?;
        let instance = {
            let conn = state.connection();
            let conn = conn.lock();
            targets::owned_instance(&conn, owner_id, instance_id)?
        };
        let instance = active_instance(instance)?;
        serve_instance(state, &instance).await
    })
    .await
}

/// Totals for one locale of a place over every stored rating.
pub async fn stats(state: &AppState, request: StatsRequest) -> CommandResult<StatsSummary> {
    respond("stats", async {
        let place_url = validate_place_url(&request.place_url)?;
        let exclude_below = match request.exclude_below {
            Some(value) => Some(validate_rating("exclude_below", value)?),
            None => None,
        };
        let locale = stats_locale(request.locale.as_deref(), None);
        let query = ReviewQuery::new(DEFAULT_MIN_RATING, request.max_reviews, SortOrder::Newest);
        let view = state
            .coordinator()
            .resolve(&place_url, &locale, request.force_refresh, &query)
            .await?;
        Ok(view::summarize(&place_url, &view, exclude_below))
    })
    .await
}

pub async fn instance_stats(
    state: &AppState,
    owner_id: &str,
    instance_id: i64,
    request: InstanceStatsRequest,
) -> CommandResult<StatsSummary> {
    respond("instance_stats", async {
        let owner_id = validate_owner(owner_id)?;
        let exclude_below = match request.exclude_below {
            Some(value) => Some(validate_rating("exclude_below", value)?),
            None => None,
        };
        let instance = {
            let conn = state.connection();
            let conn = conn.lock();
            targets::owned_instance(&conn, owner_id, instance_id)?
        };
        let instance = active_instance(instance)?;
        let locale = stats_locale(
            request.locale.as_deref(),
            instance.locales.first().map(String::as_str),
        );
        let query = ReviewQuery::new(DEFAULT_MIN_RATING, 0, instance.defaults.sort);
        let view = state
            .coordinator()
            .resolve(&instance.place_url, &locale, request.force_refresh, &query)
            .await?;
        Ok(view::summarize(&instance.place_url, &view, exclude_below))
    })
    .await
}

/// Forced refresh of a place. In background mode the refresh runs detached,
/// failures are retried after the configured delay, and the currently stored
/// views are returned right away.
pub async fn refresh(state: &AppState, request: RefreshRequest) -> CommandResult<Vec<ReviewsView>> {
    respond("refresh", async {
        let place_url = validate_place_url(&request.place_url)?;
        let locales = match request.locales.as_deref() {
            Some(list) if !list.is_empty() => locales::retain_supported(list),
            _ => locales::all(),
        };
        let query = ReviewQuery::new(DEFAULT_MIN_RATING, DEFAULT_MAX_REVIEWS, SortOrder::Newest);

        if !request.background {
            return state
                .coordinator()
                .resolve_locales(&place_url, &locales, true, &query)
                .await;
        }

        let coordinator = state.coordinator();
        let retry_delay = state.config().retry_delay();
        {
            let place_url = place_url.clone();
            let locales = locales.clone();
            tokio::spawn(async move {
                let outcome = coordinator
                    .resolve_locales(&place_url, &locales, true, &ReviewQuery::BROADEST)
                    .await;
                if let Err(err) = outcome {
                    warn!(target: "refresh", place = %place_url, ?err, "background refresh failed; scheduling retry");
                    let _ = schedule_retry(coordinator, place_url, locales, retry_delay);
                }
            });
        }
        info!(target: "refresh", place = %place_url, locales = locales.len(), "background refresh queued");

        let markers = {
            let conn = state.connection();
            let conn = conn.lock();
            cache::list_markers(&conn, Some(&place_url), &locales)?
        };
        let coordinator = state.coordinator();
        markers
            .iter()
            .map(|marker| coordinator.view(&place_url, &marker.locale, &query))
            .collect()
    })
    .await
}

pub async fn list_cache(state: &AppState, query: CacheQuery) -> CommandResult<Vec<CacheEntry>> {
    respond("list_cache", async {
        let conn = state.connection();
        let conn = conn.lock();
        let markers = cache::list_markers(
            &conn,
            query.place_url.as_deref().map(str::trim),
            query.locales.as_deref().unwrap_or_default(),
        )?;
        Ok(markers.into_iter().map(CacheEntry::from).collect())
    })
    .await
}

/// Drops freshness markers so the next request re-extracts. Stored reviews stay.
pub async fn delete_cache(state: &AppState, request: CacheDeleteRequest) -> CommandResult<Acknowledged> {
    respond("delete_cache", async {
        let place_url = validate_place_url(&request.place_url)?;
        let conn = state.connection();
        let conn = conn.lock();
        let removed = cache::purge_markers(
            &conn,
            Some(&place_url),
            request.locales.as_deref().unwrap_or_default(),
        )?;
        info!(target: "refresh", place = %place_url, removed, "cache markers deleted");
        Ok(ACK)
    })
    .await
}

fn moderate(state: &AppState, request: &ModerationRequest, hidden: Option<bool>) -> AppResult<()> {
    let place_url = validate_place_url(&request.place_url)?;
    let db = state.connection();
    let mut conn = db.lock();
    let tx = conn.transaction()?;
    match hidden {
        Some(hidden) => {
            reviews::set_hidden(&tx, &place_url, &request.locale, &request.review_id, hidden)?
        }
        None => reviews::delete_review(&tx, &place_url, &request.locale, &request.review_id)?,
    }
    let totals = reviews::visible_totals(&tx, &place_url, &request.locale)?;
    cache::update_totals(&tx, &place_url, &request.locale, totals)?;
    tx.commit()?;
    Ok(())
}

pub async fn hide_review(state: &AppState, request: ModerationRequest) -> CommandResult<Acknowledged> {
    respond("hide_review", async { moderate(state, &request, Some(true)).map(|_| ACK) }).await
}

pub async fn unhide_review(state: &AppState, request: ModerationRequest) -> CommandResult<Acknowledged> {
    respond("unhide_review", async { moderate(state, &request, Some(false)).map(|_| ACK) }).await
}

pub async fn delete_review(state: &AppState, request: ModerationRequest) -> CommandResult<Acknowledged> {
    respond("delete_review", async { moderate(state, &request, None).map(|_| ACK) }).await
}

pub async fn cleanup(state: &AppState, request: CleanupRequest) -> CommandResult<DeletedCounts> {
    respond("cleanup", async {
        let place_url = request.place_url.as_deref().map(str::trim).map(str::to_string);
        let locales = request.locales.clone().unwrap_or_default();
        let conn = state.connection();
        let conn = conn.lock();

        let mut deleted = DeletedCounts { reviews: 0, cache: 0 };
        if request.delete_reviews {
            let filter = PurgeFilter {
                place_url: place_url.clone(),
                locales: locales.clone(),
                older_than: request
                    .older_than_days
                    .map(|days| db::now() - Duration::days(i64::from(days))),
            };
            deleted.reviews = reviews::purge(&conn, &filter)?;
        }
        if request.delete_cache {
            deleted.cache = cache::purge_markers(&conn, place_url.as_deref(), &locales)?;
        }
        info!(
            target: "refresh",
            reviews = deleted.reviews,
            cache = deleted.cache,
            "cleanup finished"
        );
        Ok(deleted)
    })
    .await
}

pub async fn create_monitor(state: &AppState, request: TargetRequest) -> CommandResult<MonitoredPlace> {
    respond("create_monitor", async {
        let target = request.validated()?;
        let conn = state.connection();
        let conn = conn.lock();
        targets::create_monitored_place(&conn, &target)
    })
    .await
}

pub async fn list_monitors(state: &AppState) -> CommandResult<Vec<MonitoredPlace>> {
    respond("list_monitors", async {
        let conn = state.connection();
        let conn = conn.lock();
        targets::list_monitored_places(&conn)
    })
    .await
}

pub async fn delete_monitor(state: &AppState, monitor_id: i64) -> CommandResult<Acknowledged> {
    respond("delete_monitor", async {
        let conn = state.connection();
        let conn = conn.lock();
        targets::delete_monitored_place(&conn, monitor_id).map(|_| ACK)
    })
    .await
}

pub async fn list_instances(state: &AppState, owner_id: &str) -> CommandResult<Vec<ReviewInstance>> {
    respond("list_instances", async {
        let owner_id = validate_owner(owner_id)?;
        let conn = state.connection();
        let conn = conn.lock();
        targets::list_instances_for_owner(&conn, owner_id)
    })
    .await
}

/// Creates an instance and queues a warmup so its public key serves data soon.
pub async fn create_instance(
    state: &AppState,
    owner_id: &str,
    request: TargetRequest,
) -> CommandResult<ReviewInstance> {
    respond("create_instance", async {
        let owner_id = validate_owner(owner_id)?;
        let target = request.validated()?;
        let instance = {
            let conn = state.connection();
            let conn = conn.lock();
            targets::create_instance(&conn, owner_id, &target, db::now())?
        };
        state.warmup().submit(instance.id);
        Ok(instance)
    })
    .await
}

pub async fn update_instance(
    state: &AppState,
    owner_id: &str,
    instance_id: i64,
    request: InstanceUpdateRequest,
) -> CommandResult<ReviewInstance> {
    respond("update_instance", async {
        let owner_id = validate_owner(owner_id)?;
        let patch = request.validated()?;
        let instance = {
            let conn = state.connection();
            let conn = conn.lock();
            targets::update_instance(&conn, owner_id, instance_id, &patch)?
        };
        state.warmup().submit(instance.id);
        Ok(instance)
    })
    .await
}

pub async fn delete_instance(
    state: &AppState,
    owner_id: &str,
    instance_id: i64,
) -> CommandResult<Acknowledged> {
    respond("delete_instance", async {
        let owner_id = validate_owner(owner_id)?;
        let conn = state.connection();
        let conn = conn.lock();
        targets::delete_instance(&conn, owner_id, instance_id).map(|_| ACK)
    })
    .await
}
