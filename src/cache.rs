use chrono::{DateTime, Duration, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::Serialize;

use crate::db::{format_timestamp, parse_timestamp};
use crate::errors::AppResult;
use crate::reviews::KeyTotals;
use crate::view::{ReviewQuery, SortOrder};

/// Freshness record for one (place, locale): when it was last refreshed and the
/// sweep that produced the stored rows.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheMarker {
    pub place_url: String,
    pub locale: String,
    pub refreshed_at: Option<DateTime<Utc>>,
    pub sweep: ReviewQuery,
    pub review_count: usize,
    pub avg_rating: f64,
}

impl CacheMarker {
    pub fn is_fresh(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        match self.refreshed_at {
            Some(refreshed_at) => now - refreshed_at <= ttl,
            None => false,
        }
    }

    /// Fresh and collected with parameters broad enough for `query`.
    pub fn satisfies(&self, query: &ReviewQuery, now: DateTime<Utc>, ttl: Duration) -> bool {
        self.is_fresh(now, ttl) && self.sweep.covers(query)
    }

    pub fn refreshed_since(&self, instant: DateTime<Utc>) -> bool {
        self.refreshed_at
            .map(|refreshed_at| refreshed_at >= instant)
            .unwrap_or(false)
    }
}

pub fn load_marker(
    connection: &Connection,
    place_url: &str,
    locale: &str,
) -> AppResult<Option<CacheMarker>> {
    let marker = connection
        .query_row(
            "SELECT place_url, locale, refreshed_at, min_rating, max_count, sort, review_count, avg_rating
            FROM review_cache
            WHERE place_url = ?1 AND locale = ?2",
            (place_url, locale),
            parse_marker,
        )
        .optional()?;
    Ok(marker)
}

/// Records a refresh. A timestamp older than the stored one leaves the row as is,
/// so `refreshed_at` never moves backwards.
pub fn upsert_marker(
    connection: &Connection,
    place_url: &str,
    locale: &str,
    refreshed_at: DateTime<Utc>,
    sweep: &ReviewQuery,
    totals: KeyTotals,
) -> AppResult<()> {
    connection.execute(
        "INSERT INTO review_cache
            (place_url, locale, refreshed_at, min_rating, max_count, sort, review_count, avg_rating)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        ON CONFLICT(place_url, locale) DO UPDATE SET
            refreshed_at = excluded.refreshed_at,
            min_rating = excluded.min_rating,
            max_count = excluded.max_count,
            sort = excluded.sort,
            review_count = excluded.review_count,
            avg_rating = excluded.avg_rating
        WHERE review_cache.refreshed_at IS NULL
            OR excluded.refreshed_at >= review_cache.refreshed_at",
        params![
            place_url,
            locale,
            format_timestamp(refreshed_at),
            sweep.min_rating,
            sweep.max_count,
            sweep.sort.as_str(),
            totals.count as i64,
            totals.average_rating,
        ],
    )?;
    Ok(())
}

/// Rewrites the stored totals after moderation without touching freshness.
pub fn update_totals(
    connection: &Connection,
    place_url: &str,
    locale: &str,
    totals: KeyTotals,
) -> AppResult<bool> {
    let changed = connection.execute(
        "UPDATE review_cache SET review_count = ?3, avg_rating = ?4
        WHERE place_url = ?1 AND locale = ?2",
        params![place_url, locale, totals.count as i64, totals.average_rating],
    )?;
    Ok(changed == 1)
}

/// Markers filtered by place and locales; `None`/empty matches everything.
pub fn list_markers(
    connection: &Connection,
    place_url: Option<&str>,
    locales: &[String],
) -> AppResult<Vec<CacheMarker>> {
    let (clause, values) = key_filter(place_url, locales);
    let sql = format!(
        "SELECT place_url, locale, refreshed_at, min_rating, max_count, sort, review_count, avg_rating
        FROM review_cache{clause}
        ORDER BY place_url ASC, locale ASC"
    );
    let mut stmt = connection.prepare(&sql)?;
    let markers = stmt
        .query_map(params_from_iter(values.iter()), parse_marker)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(markers)
}

pub fn purge_markers(
    connection: &Connection,
    place_url: Option<&str>,
    locales: &[String],
) -> AppResult<usize> {
    let (clause, values) = key_filter(place_url, locales);
    let sql = format!("DELETE FROM review_cache{clause}");
    Ok(connection.execute(&sql, params_from_iter(values.iter()))?)
}

/// Stamps markers that carry no timestamp so they count as fresh instead of
/// triggering a refresh on first use.
pub fn backfill_missing_timestamps(connection: &Connection, now: DateTime<Utc>) -> AppResult<usize> {
    let updated = connection.execute(
        "UPDATE review_cache SET refreshed_at = ?1 WHERE refreshed_at IS NULL",
        [format_timestamp(now)],
    )?;
    Ok(updated)
}

fn key_filter(place_url: Option<&str>, locales: &[String]) -> (String, Vec<Value>) {
    let mut clauses: Vec<String> = Vec::new();
    let mut values: Vec<Value> = Vec::new();
    if let Some(place_url) = place_url {
        values.push(Value::Text(place_url.to_string()));
        clauses.push(format!("place_url = ?{}", values.len()));
    }
    if !locales.is_empty() {
        let mut placeholders = Vec::with_capacity(locales.len());
        for locale in locales {
            values.push(Value::Text(locale.clone()));
            placeholders.push(format!("?{}", values.len()));
        }
        clauses.push(format!("locale IN ({})", placeholders.join(", ")));
    }
    if clauses.is_empty() {
        (String::new(), values)
    } else {
        (format!(" WHERE {}", clauses.join(" AND ")), values)
    }
}

fn parse_marker(row: &Row<'_>) -> rusqlite::Result<CacheMarker> {
    let refreshed_at: Option<String> = row.get(2)?;
    let max_count: i64 = row.get(4)?;
    let sort: String = row.get(5)?;
    let review_count: i64 = row.get(6)?;
    Ok(CacheMarker {
        place_url: row.get(0)?,
        locale: row.get(1)?,
        refreshed_at: refreshed_at.as_deref().and_then(parse_timestamp),
        sweep: ReviewQuery::new(
            row.get(3)?,
            max_count.clamp(0, u32::MAX as i64) as u32,
            SortOrder::parse(&sort).unwrap_or_default(),
        ),
        review_count: review_count.max(0) as usize,
        avg_rating: row.get(7)?,
    })
}
