use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rusqlite::Connection;
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tracing::{debug, info, warn};

use crate::cache;
use crate::config::AppConfig;
use crate::db;
use crate::errors::{AppError, AppResult};
use crate::extractor::{ExtractionRequest, ReviewExtractor};
use crate::locales::{self, LocaleParams};
use crate::reviews;
use crate::view::{self, ReviewQuery, ReviewsView};

/// What happened to a key after a refresh was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// The extractor ran and this many new rows were stored.
    Refreshed { inserted: usize },
    /// Another caller refreshed the key while this one waited for the lock.
    AlreadyFresh,
}

/// Serves review views from the store and decides when a key has to be
/// re-extracted.
///
/// Refreshes of one `(place, locale)` are serialized through a per-key async
/// lock; extractor calls across all keys share a bounded pool of sessions.
pub struct RefreshCoordinator {
    db: Arc<Mutex<Connection>>,
    extractor: Arc<dyn ReviewExtractor>,
    ttl: Duration,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    sessions: Semaphore,
}

impl RefreshCoordinator {
    pub fn new(
        db: Arc<Mutex<Connection>>,
        extractor: Arc<dyn ReviewExtractor>,
        config: &AppConfig,
    ) -> Self {
        Self::with_limits(db, extractor, config.cache_ttl(), config.max_extractor_sessions)
    }

    pub fn with_limits(
        db: Arc<Mutex<Connection>>,
        extractor: Arc<dyn ReviewExtractor>,
        ttl: Duration,
        max_sessions: usize,
    ) -> Self {
        Self {
            db,
            extractor,
            ttl,
            locks: Mutex::new(HashMap::new()),
            sessions: Semaphore::new(max_sessions.max(1)),
        }
    }

    pub fn refresh_key(place_url: &str, locale: &str) -> String {
        format!("{place_url}::{locale}")
    }

    /// Answers `query` for one key, refreshing first when the stored data is
    /// missing, stale, too narrow or `force` is set.
    pub async fn resolve(
        &self,
        place_url: &str,
        locale: &str,
        force: bool,
        query: &ReviewQuery,
    ) -> AppResult<ReviewsView> {
        let locale_params = supported_locale(locale)?;
        let requested_at = db::now();

        if force || !self.can_answer(place_url, locale, query, requested_at)? {
            self.refresh(place_url, locale, locale_params, force, query, requested_at)
                .await?;
        }
        self.view(place_url, locale, query)
    }

    /// Resolves each supported locale in turn. Unsupported locales are skipped
    /// and the first failure ends the run.
    pub async fn resolve_locales(
        &self,
        place_url: &str,
        locales: &[String],
        force: bool,
        query: &ReviewQuery,
    ) -> AppResult<Vec<ReviewsView>> {
        let mut views = Vec::with_capacity(locales.len());
        for locale in locales {
            if !locales::is_supported(locale) {
                debug!(target: "refresh", place = place_url, locale = %locale, "skipping unsupported locale");
                continue;
            }
            views.push(self.resolve(place_url, locale, force, query).await?);
        }
        Ok(views)
    }

    /// Projects stored rows without consulting freshness.
    pub fn view(&self, place_url: &str, locale: &str, query: &ReviewQuery) -> AppResult<ReviewsView> {
        let rows = {
            let conn = self.db.lock();
            reviews::list_for_key(&conn, place_url, locale, false)?
        };
        Ok(view::project(&rows, locale, query))
    }

    fn can_answer(
        &self,
        place_url: &str,
        locale: &str,
        query: &ReviewQuery,
        now: DateTime<Utc>,
    ) -> AppResult<bool> {
        let conn = self.db.lock();
        let marker = cache::load_marker(&conn, place_url, locale)?;
        Ok(marker.is_some_and(|marker| marker.satisfies(query, now, self.ttl)))
    }

    /// Whether a refresh is still needed once the key lock is held.
    fn still_needed(
        &self,
        place_url: &str,
        locale: &str,
        force: bool,
        query: &ReviewQuery,
        requested_at: DateTime<Utc>,
    ) -> AppResult<bool> {
        let conn = self.db.lock();
        let needed = match cache::load_marker(&conn, place_url, locale)? {
            None => true,
            Some(marker) if force => !marker.refreshed_since(requested_at),
            Some(marker) => !marker.satisfies(query, db::now(), self.ttl),
        };
        Ok(needed)
    }

    fn lock_for(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock();
        Arc::clone(
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        )
    }

    async fn refresh(
        &self,
        place_url: &str,
        locale: &str,
        locale_params: LocaleParams,
        force: bool,
        query: &ReviewQuery,
        requested_at: DateTime<Utc>,
    ) -> AppResult<RefreshOutcome> {
        let key = Self::refresh_key(place_url, locale);
        let lock = self.lock_for(&key);
        let _guard = match lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                debug!(target: "refresh", key = %key, "waiting for in-flight refresh");
                lock.lock().await
            }
        };

        if !self.still_needed(place_url, locale, force, query, requested_at)? {
            debug!(target: "refresh", key = %key, force, "refreshed while waiting; skipping extraction");
            return Ok(RefreshOutcome::AlreadyFresh);
        }

        let sweep = ReviewQuery::BROADEST;
        let request = ExtractionRequest {
            place_url: place_url.to_string(),
            locale: locale.to_string(),
            locale_params,
            min_rating: sweep.min_rating,
            max_count: sweep.max_count,
            sort: sweep.sort,
        };

        info!(target: "refresh", key = %key, force, "refresh started");
        let extracted = {
            let _permit = self
                .sessions
                .acquire()
                .await
                .map_err(|_| AppError::Config("extractor session pool closed".into()))?;
            match self.extractor.extract(&request).await {
                Ok(extracted) => extracted,
                Err(failure) => {
                    warn!(target: "refresh", key = %key, error = %failure, "extraction failed");
                    return Err(failure.into());
                }
            }
        };

        let refreshed_at = db::now();
        let (inserted, stored, totals) = {
            let mut conn = self.db.lock();
            let tx = conn.transaction()?;
            let inserted = reviews::merge(&tx, place_url, locale, &extracted, refreshed_at)?;
            let stored = reviews::count_for_key(&tx, place_url, locale)?;
            let totals = reviews::visible_totals(&tx, place_url, locale)?;
            cache::upsert_marker(&tx, place_url, locale, refreshed_at, &sweep, totals)?;
            tx.commit()?;
            (inserted, stored, totals)
        };

        info!(
            target: "refresh",
            key = %key,
            extracted = extracted.len(),
            inserted,
            stored,
            visible = totals.count,
            "refresh finished"
        );
        Ok(RefreshOutcome::Refreshed { inserted })
    }
}

fn supported_locale(locale: &str) -> AppResult<LocaleParams> {
    locales::lookup(locale)
        .ok_or_else(|| AppError::Validation(format!("unsupported locale: {locale}")))
}

#[cfg(test)]
mod tests {
    use std::time::Duration as StdDuration;

    use tempfile::{tempdir, TempDir};

    use super::*;
    use crate::extractor::scripted::{review, ScriptedExtractor};
    use crate::view::SortOrder;

    const PLACE: &str = "https://maps.example/place?cid=314";

    fn setup(
        extractor: ScriptedExtractor,
        ttl: Duration,
        sessions: usize,
    ) -> (TempDir, Arc<Mutex<Connection>>, Arc<ScriptedExtractor>, RefreshCoordinator) {
        let dir = tempdir().unwrap();
        let conn = db::bootstrap(dir.path(), "coordinator.db").unwrap().connection;
        let db = Arc::new(Mutex::new(conn));
        let extractor = Arc::new(extractor);
        let coordinator =
            RefreshCoordinator::with_limits(db.clone(), extractor.clone(), ttl, sessions);
        (dir, db, extractor, coordinator)
    }

    fn catalog() -> Vec<crate::extractor::RawReview> {
        vec![
            review("a", 5.0),
            review("b", 3.0),
            review("c", 4.0),
            review("a", 5.0),
            review("d", 1.0),
        ]
    }

    #[tokio::test]
    async fn concurrent_forced_requests_share_one_extraction() {
        let extractor = ScriptedExtractor::new(catalog()).with_delay(StdDuration::from_millis(50));
        let (_dir, _db, extractor, coordinator) = setup(extractor, Duration::minutes(60), 2);
        let query = ReviewQuery::BROADEST;

        let (first, second) = tokio::join!(
            coordinator.resolve(PLACE, "en-US", true, &query),
            coordinator.resolve(PLACE, "en-US", true, &query),
        );
        let first = first.unwrap();
        let second = second.unwrap();

        assert_eq!(extractor.calls(), 1);
        assert_eq!(first, second);
        assert_eq!(first.count, 4);
    }

    #[tokio::test]
    async fn fresh_broad_data_answers_narrower_queries() {
        let (_dir, _db, extractor, coordinator) =
            setup(ScriptedExtractor::new(catalog()), Duration::minutes(60), 2);

        coordinator
            .resolve(PLACE, "en-US", false, &ReviewQuery::BROADEST)
            .await
            .unwrap();
        let best = coordinator
            .resolve(PLACE, "en-US", false, &ReviewQuery::new(3.0, 2, SortOrder::Best))
            .await
            .unwrap();
        let worst = coordinator
            .resolve(PLACE, "en-US", false, &ReviewQuery::new(1.0, 0, SortOrder::Worst))
            .await
            .unwrap();

        assert_eq!(extractor.calls(), 1);
        let best_ids: Vec<&str> = best.reviews.iter().map(|r| r.review_id.as_str()).collect();
        assert_eq!(best_ids, vec!["a", "c"]);
        assert_eq!(best.average_rating, 4.5);
        assert_eq!(worst.reviews[0].review_id, "d");
    }

    #[tokio::test]
    async fn stale_marker_triggers_refresh() {
        let (_dir, db, extractor, coordinator) =
            setup(ScriptedExtractor::new(catalog()), Duration::minutes(60), 2);
        coordinator
            .resolve(PLACE, "en-US", false, &ReviewQuery::BROADEST)
            .await
            .unwrap();

        let old = db::format_timestamp(db::now() - Duration::minutes(120));
        db.lock()
            .execute("UPDATE review_cache SET refreshed_at = ?1", [old])
            .unwrap();
        extractor.set_reviews(vec![review("e", 4.0)]);

        let view = coordinator
            .resolve(PLACE, "en-US", false, &ReviewQuery::BROADEST)
            .await
            .unwrap();
        assert_eq!(extractor.calls(), 2);
        assert_eq!(view.count, 5);
        assert_eq!(view.reviews.last().unwrap().review_id, "e");
    }

    #[tokio::test]
    async fn failed_extraction_propagates_and_leaves_marker_alone() {
        let extractor = ScriptedExtractor::new(catalog());
        extractor.fail_for(PLACE);
        let (_dir, db, _extractor, coordinator) = setup(extractor, Duration::minutes(60), 2);

        let err = coordinator
            .resolve(PLACE, "en-US", true, &ReviewQuery::BROADEST)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Extraction(_)));
        assert_eq!(err.code(), "upstream_fetch_failed");
        assert!(cache::load_marker(&db.lock(), PLACE, "en-US").unwrap().is_none());
    }

    #[tokio::test]
    async fn marker_records_sweep_even_without_new_rows() {
        let (_dir, db, _extractor, coordinator) =
            setup(ScriptedExtractor::new(Vec::new()), Duration::minutes(60), 2);
        let view = coordinator
            .resolve(PLACE, "de-DE", false, &ReviewQuery::new(4.0, 10, SortOrder::Best))
            .await
            .unwrap();
        assert_eq!(view.count, 0);
        assert_eq!(view.average_rating, 0.0);

        let marker = cache::load_marker(&db.lock(), PLACE, "de-DE").unwrap().unwrap();
        assert_eq!(marker.sweep, ReviewQuery::BROADEST);
        assert_eq!(marker.review_count, 0);
    }

    #[tokio::test]
    async fn session_pool_bounds_parallel_extractions() {
        let extractor = ScriptedExtractor::new(catalog()).with_delay(StdDuration::from_millis(30));
        let (_dir, _db, extractor, coordinator) = setup(extractor, Duration::minutes(60), 1);
        let query = ReviewQuery::BROADEST;

        let (us, cz) = tokio::join!(
            coordinator.resolve(PLACE, "en-US", false, &query),
            coordinator.resolve(PLACE, "cs-CZ", false, &query),
        );
        us.unwrap();
        cz.unwrap();
        assert_eq!(extractor.calls(), 2);
        assert_eq!(extractor.peak_concurrency(), 1);
    }

    #[tokio::test]
    async fn resolve_locales_skips_unsupported_and_rejects_direct_use() {
        let (_dir, _db, extractor, coordinator) =
            setup(ScriptedExtractor::new(catalog()), Duration::minutes(60), 2);
        let locales = vec!["en-US".to_string(), "xx-YY".to_string(), "pl-PL".to_string()];

        let views = coordinator
            .resolve_locales(PLACE, &locales, true, &ReviewQuery::BROADEST)
            .await
            .unwrap();
        assert_eq!(views.len(), 2);
        assert_eq!(views[1].locale, "pl-PL");
        assert_eq!(extractor.calls(), 2);

        let err = coordinator
            .resolve(PLACE, "xx-YY", false, &ReviewQuery::BROADEST)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }
}
