use serde::{Deserialize, Serialize};

use crate::errors::{AppError, AppResult};
use crate::reviews::ReviewRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Newest,
    Oldest,
    Best,
    Worst,
}

impl SortOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortOrder::Newest => "newest",
            SortOrder::Oldest => "oldest",
            SortOrder::Best => "best",
            SortOrder::Worst => "worst",
        }
    }

    pub fn parse(value: &str) -> AppResult<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "newest" => Ok(SortOrder::Newest),
            "oldest" => Ok(SortOrder::Oldest),
            "best" => Ok(SortOrder::Best),
            "worst" => Ok(SortOrder::Worst),
            _ => Err(AppError::Validation(format!("invalid sort order: {value}"))),
        }
    }
}

const LOWEST_STARS: f64 = 1.0;

/// Filter, cap and ordering applied when projecting stored reviews.
/// `max_count == 0` means unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ReviewQuery {
    pub min_rating: f64,
    #[serde(rename = "max_reviews")]
    pub max_count: u32,
    pub sort: SortOrder,
}

impl ReviewQuery {
    /// The sweep every refresh extracts, wide enough to answer any narrower query.
    pub const BROADEST: ReviewQuery = ReviewQuery {
        min_rating: 1.0,
        max_count: 0,
        sort: SortOrder::Newest,
    };

    pub fn new(min_rating: f64, max_count: u32, sort: SortOrder) -> Self {
        Self {
            min_rating,
            max_count,
            sort,
        }
    }

    /// Whether data collected with `self` is a superset of what `requested` needs.
    /// Sort is not compared: any order can be derived from stored rows.
    pub fn covers(&self, requested: &ReviewQuery) -> bool {
        // No review rates below one star, so lower floors ask for the same rows.
        let rating_ok = self.min_rating <= requested.min_rating.max(LOWEST_STARS);
        let count_ok = match (self.max_count, requested.max_count) {
            (0, _) => true,
            (_, 0) => false,
            (recorded, wanted) => recorded >= wanted,
        };
        rating_ok && count_ok
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Review {
    pub review_id: String,
    pub name: String,
    pub date: String,
    pub stars: f64,
    pub text: String,
    pub avatar: String,
    pub profile_link: String,
}

impl From<&ReviewRecord> for Review {
    fn from(record: &ReviewRecord) -> Self {
        Self {
            review_id: record.review_id.clone(),
            name: record.name.clone(),
            date: record.date.clone(),
            stars: record.stars,
            text: record.text.clone(),
            avatar: record.avatar.clone(),
            profile_link: record.profile_link.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewsView {
    pub success: bool,
    pub locale: String,
    pub count: usize,
    pub average_rating: f64,
    pub reviews: Vec<Review>,
    pub params: ReviewQuery,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSummary {
    pub success: bool,
    pub place_url: String,
    pub locales: Vec<String>,
    pub total_count: usize,
    pub average_rating: f64,
    pub threshold: Option<f64>,
    pub filtered_count: Option<usize>,
    pub filtered_average: Option<f64>,
}

/// Projects rows given in ingestion order into a response.
///
/// Hidden rows and rows under `min_rating` are dropped. `newest` keeps ingestion
/// order, `oldest` reverses it, `best`/`worst` sort by rating with ties left in
/// ingestion order. The cap applies after ordering and the average covers only
/// the returned reviews.
pub fn project(rows: &[ReviewRecord], locale: &str, query: &ReviewQuery) -> ReviewsView {
    let mut selected: Vec<&ReviewRecord> = rows
        .iter()
        .filter(|row| !row.hidden && row.stars >= query.min_rating)
        .collect();

    match query.sort {
        SortOrder::Newest => {}
        SortOrder::Oldest => selected.reverse(),
        SortOrder::Best => selected.sort_by(|a, b| b.stars.total_cmp(&a.stars)),
        SortOrder::Worst => selected.sort_by(|a, b| a.stars.total_cmp(&b.stars)),
    }

    if query.max_count > 0 {
        selected.truncate(query.max_count as usize);
    }

    let reviews: Vec<Review> = selected.into_iter().map(Review::from).collect();
    let stars: Vec<f64> = reviews.iter().map(|review| review.stars).collect();
    ReviewsView {
        success: true,
        locale: locale.to_string(),
        count: reviews.len(),
        average_rating: average(&stars),
        reviews,
        params: *query,
    }
}

/// Totals over a view plus, when `exclude_below` is set, the subset at or above it.
pub fn summarize(place_url: &str, view: &ReviewsView, exclude_below: Option<f64>) -> StatsSummary {
    let stars: Vec<f64> = view.reviews.iter().map(|review| review.stars).collect();
    let filtered: Option<Vec<f64>> = exclude_below.map(|threshold| {
        stars
            .iter()
            .copied()
            .filter(|value| *value >= threshold)
            .collect()
    });
    StatsSummary {
        success: true,
        place_url: place_url.to_string(),
        locales: vec![view.locale.clone()],
        total_count: stars.len(),
        average_rating: average(&stars),
        threshold: exclude_below,
        filtered_count: filtered.as_ref().map(Vec::len),
        filtered_average: filtered.as_deref().map(average),
    }
}

pub fn average(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    (mean * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: i64, review_id: &str, stars: f64) -> ReviewRecord {
        ReviewRecord {
            id,
            place_url: "https://maps.example/place".into(),
            locale: "en-US".into(),
            review_id: review_id.into(),
            name: format!("author {id}"),
            date: "a week ago".into(),
            stars,
            text: String::new(),
            avatar: String::new(),
            profile_link: String::new(),
            ingested_at: crate::db::now(),
            hidden: false,
        }
    }

    fn ids(view: &ReviewsView) -> Vec<&str> {
        view.reviews
            .iter()
            .map(|review| review.review_id.as_str())
            .collect()
    }

    #[test]
    fn averages_returned_reviews() {
        let rows = vec![row(1, "a", 5.0), row(2, "b", 4.0), row(3, "c", 3.0)];
        let view = project(&rows, "en-US", &ReviewQuery::BROADEST);
        assert_eq!(view.count, 3);
        assert_eq!(view.average_rating, 4.0);
        assert!(view.success);
    }

    #[test]
    fn empty_result_has_zero_average() {
        let rows = vec![row(1, "a", 3.0), row(2, "b", 4.0)];
        let view = project(&rows, "en-US", &ReviewQuery::new(5.0, 0, SortOrder::Newest));
        assert_eq!(view.count, 0);
        assert_eq!(view.average_rating, 0.0);
        assert!(view.reviews.is_empty());
    }

    #[test]
    fn best_truncation_keeps_highest_rated() {
        let ratings = [3.0, 5.0, 1.0, 4.0, 2.0, 5.0, 3.0, 4.0, 1.0, 2.0];
        let rows: Vec<ReviewRecord> = ratings
            .iter()
            .enumerate()
            .map(|(idx, stars)| row(idx as i64 + 1, &format!("r{idx}"), *stars))
            .collect();
        let view = project(&rows, "en-US", &ReviewQuery::new(1.0, 3, SortOrder::Best));
        assert_eq!(view.count, 3);
        assert_eq!(ids(&view), vec!["r1", "r5", "r3"]);
        assert_eq!(view.average_rating, 4.67);
    }

    #[test]
    fn ordering_policies_follow_ingestion_order() {
        let rows = vec![row(1, "a", 4.0), row(2, "b", 2.0), row(3, "c", 4.0)];
        let newest = project(&rows, "en-US", &ReviewQuery::new(1.0, 0, SortOrder::Newest));
        let oldest = project(&rows, "en-US", &ReviewQuery::new(1.0, 0, SortOrder::Oldest));
        let worst = project(&rows, "en-US", &ReviewQuery::new(1.0, 0, SortOrder::Worst));
        assert_eq!(ids(&newest), vec!["a", "b", "c"]);
        assert_eq!(ids(&oldest), vec!["c", "b", "a"]);
        assert_eq!(ids(&worst), vec!["b", "a", "c"]);
    }

    #[test]
    fn hidden_and_low_rated_rows_are_dropped() {
        let mut hidden = row(2, "hidden", 5.0);
        hidden.hidden = true;
        let rows = vec![row(1, "low", 2.0), hidden, row(3, "kept", 4.5)];
        let view = project(&rows, "cs-CZ", &ReviewQuery::new(3.0, 0, SortOrder::Newest));
        assert_eq!(ids(&view), vec!["kept"]);
        assert_eq!(view.locale, "cs-CZ");
    }

    #[test]
    fn broad_sweep_covers_narrower_queries() {
        let broad = ReviewQuery::BROADEST;
        for min_rating in [0.0, 0.5, 1.0, 2.5, 4.0, 5.0] {
            for max_count in [0, 1, 50, 10_000] {
                let wanted = ReviewQuery::new(min_rating, max_count, SortOrder::Worst);
                assert!(broad.covers(&wanted));
            }
        }
        let capped = ReviewQuery::new(3.0, 100, SortOrder::Newest);
        assert!(!capped.covers(&ReviewQuery::new(1.0, 10, SortOrder::Newest)));
        assert!(!capped.covers(&ReviewQuery::new(4.0, 0, SortOrder::Newest)));
        assert!(!capped.covers(&ReviewQuery::new(4.0, 200, SortOrder::Newest)));
        assert!(capped.covers(&ReviewQuery::new(4.0, 100, SortOrder::Best)));
        assert!(!capped.covers(&ReviewQuery::new(0.0, 100, SortOrder::Best)));
    }

    #[test]
    fn summarizes_with_threshold() {
        let rows = vec![row(1, "a", 5.0), row(2, "b", 2.0), row(3, "c", 4.0)];
        let view = project(&rows, "en-US", &ReviewQuery::BROADEST);
        let stats = summarize("https://maps.example/place", &view, Some(4.0));
        assert_eq!(stats.total_count, 3);
        assert_eq!(stats.average_rating, 3.67);
        assert_eq!(stats.filtered_count, Some(2));
        assert_eq!(stats.filtered_average, Some(4.5));

        let bare = summarize("https://maps.example/place", &view, None);
        assert!(bare.filtered_count.is_none());
    }

    #[test]
    fn serializes_wire_shape() {
        let rows = vec![row(1, "a", 5.0)];
        let view = project(&rows, "en-US", &ReviewQuery::new(1.0, 10, SortOrder::Best));
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["averageRating"], 5.0);
        assert_eq!(json["reviews"][0]["reviewId"], "a");
        assert_eq!(json["params"]["max_reviews"], 10);
        assert_eq!(json["params"]["sort"], "best");
    }
}
