use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, Row};
use serde::Serialize;
use tracing::trace;

use crate::db::{format_timestamp, parse_timestamp};
use crate::errors::{AppError, AppResult};
use crate::extractor::RawReview;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReviewRecord {
    pub id: i64,
    pub place_url: String,
    pub locale: String,
    pub review_id: String,
    pub name: String,
    pub date: String,
    pub stars: f64,
    pub text: String,
    pub avatar: String,
    pub profile_link: String,
    pub ingested_at: DateTime<Utc>,
    pub hidden: bool,
}

/// Administrative delete filter. Empty `locales` matches every locale.
#[derive(Debug, Clone, Default)]
pub struct PurgeFilter {
    pub place_url: Option<String>,
    pub locales: Vec<String>,
    pub older_than: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct KeyTotals {
    pub count: usize,
    pub average_rating: f64,
}

/// Rows for one (place, locale) in ingestion order.
pub fn list_for_key(
    connection: &Connection,
    place_url: &str,
    locale: &str,
    include_hidden: bool,
) -> AppResult<Vec<ReviewRecord>> {
    let mut stmt = connection.prepare(
        "SELECT id, place_url, locale, review_id, name, date, stars, text, avatar, profile_link,
                ingested_at, hidden
        FROM reviews
        WHERE place_url = ?1 AND locale = ?2 AND (?3 OR hidden = 0)
        ORDER BY ingested_at ASC, id ASC",
    )?;
    let rows = stmt
        .query_map(params![place_url, locale, include_hidden], parse_review)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn existing_ids(
    connection: &Connection,
    place_url: &str,
    locale: &str,
) -> AppResult<HashSet<String>> {
    let mut stmt =
        connection.prepare("SELECT review_id FROM reviews WHERE place_url = ?1 AND locale = ?2")?;
    let ids = stmt
        .query_map((place_url, locale), |row| row.get::<_, String>(0))?
        .collect::<Result<HashSet<_>, _>>()?;
    Ok(ids)
}

/// Inserts a review unless its id is already stored for the key. Returns whether
/// a row was created.
pub fn insert_if_absent(
    connection: &Connection,
    place_url: &str,
    locale: &str,
    review: &RawReview,
    ingested_at: DateTime<Utc>,
) -> AppResult<bool> {
    let changed = connection.execute(
        "INSERT INTO reviews
            (place_url, locale, review_id, name, date, stars, text, avatar, profile_link, ingested_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        ON CONFLICT DO NOTHING",
        params![
            place_url,
            locale,
            review.review_id,
            review.name,
            review.date,
            review.stars,
            review.text,
            review.avatar,
            review.profile_link,
            format_timestamp(ingested_at),
        ],
    )?;
    Ok(changed == 1)
}

/// Adds every review whose id is new for the key, in the given order. Stored rows
/// are never touched. Returns the number inserted. Run it inside a transaction
/// when the merge has to land atomically.
pub fn merge(
    connection: &Connection,
    place_url: &str,
    locale: &str,
    extracted: &[RawReview],
    ingested_at: DateTime<Utc>,
) -> AppResult<usize> {
    let mut seen = existing_ids(connection, place_url, locale)?;
    let mut inserted = 0;
    for review in extracted {
        let review_id = review.review_id.trim();
        if review_id.is_empty() || !seen.insert(review_id.to_string()) {
            continue;
        }
        if insert_if_absent(connection, place_url, locale, review, ingested_at)? {
            inserted += 1;
        }
    }
    trace!(place = place_url, locale, inserted, "merged extracted reviews");
    Ok(inserted)
}

pub fn count_for_key(connection: &Connection, place_url: &str, locale: &str) -> AppResult<usize> {
    let count: i64 = connection.query_row(
        "SELECT COUNT(*) FROM reviews WHERE place_url = ?1 AND locale = ?2",
        (place_url, locale),
        |row| row.get(0),
    )?;
    Ok(count.max(0) as usize)
}

pub fn visible_totals(connection: &Connection, place_url: &str, locale: &str) -> AppResult<KeyTotals> {
    let (count, average): (i64, f64) = connection.query_row(
        "SELECT COUNT(*), COALESCE(AVG(stars), 0)
        FROM reviews
        WHERE place_url = ?1 AND locale = ?2 AND hidden = 0",
        (place_url, locale),
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    Ok(KeyTotals {
        count: count.max(0) as usize,
        average_rating: (average * 100.0).round() / 100.0,
    })
}

pub fn set_hidden(
    connection: &Connection,
    place_url: &str,
    locale: &str,
    review_id: &str,
    hidden: bool,
) -> AppResult<()> {
    let changed = connection.execute(
        "UPDATE reviews SET hidden = ?4 WHERE place_url = ?1 AND locale = ?2 AND review_id = ?3",
        params![place_url, locale, review_id, hidden],
    )?;
    if changed == 0 {
        return Err(review_not_found(review_id));
    }
    Ok(())
}

pub fn delete_review(
    connection: &Connection,
    place_url: &str,
    locale: &str,
    review_id: &str,
) -> AppResult<()> {
    let changed = connection.execute(
        "DELETE FROM reviews WHERE place_url = ?1 AND locale = ?2 AND review_id = ?3",
        (place_url, locale, review_id),
    )?;
    if changed == 0 {
        return Err(review_not_found(review_id));
    }
    Ok(())
}

pub fn purge(connection: &Connection, filter: &PurgeFilter) -> AppResult<usize> {
    let mut clauses: Vec<String> = Vec::new();
    let mut values: Vec<Value> = Vec::new();
    if let Some(place_url) = &filter.place_url {
        values.push(Value::Text(place_url.clone()));
        clauses.push(format!("place_url = ?{}", values.len()));
    }
    if !filter.locales.is_empty() {
        let mut placeholders = Vec::with_capacity(filter.locales.len());
        for locale in &filter.locales {
            values.push(Value::Text(locale.clone()));
            placeholders.push(format!("?{}", values.len()));
        }
        clauses.push(format!("locale IN ({})", placeholders.join(", ")));
    }
    if let Some(cutoff) = filter.older_than {
        values.push(Value::Text(format_timestamp(cutoff)));
        clauses.push(format!("ingested_at < ?{}", values.len()));
    }

    let mut sql = "DELETE FROM reviews".to_string();
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    let deleted = connection.execute(&sql, params_from_iter(values.iter()))?;
    Ok(deleted)
}

fn review_not_found(review_id: &str) -> AppError {
    AppError::NotFound(format!("review {review_id} not found"))
}

fn parse_review(row: &Row<'_>) -> rusqlite::Result<ReviewRecord> {
    let ingested_at: String = row.get(10)?;
    let ingested_at = parse_timestamp(&ingested_at).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            10,
            rusqlite::types::Type::Text,
            format!("invalid ingestion timestamp: {ingested_at}").into(),
        )
    })?;
    Ok(ReviewRecord {
        id: row.get(0)?,
        place_url: row.get(1)?,
        locale: row.get(2)?,
        review_id: row.get(3)?,
        name: row.get(4)?,
        date: row.get(5)?,
        stars: row.get(6)?,
        text: row.get(7)?,
        avatar: row.get(8)?,
        profile_link: row.get(9)?,
        ingested_at,
        hidden: row.get(11)?,
    })
}
