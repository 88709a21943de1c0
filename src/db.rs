use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::{Connection, OpenFlags};
use tracing::info;

use crate::errors::{AppError, AppResult};

pub struct DatabaseContext {
    pub connection: Connection,
    pub path: PathBuf,
}

pub fn bootstrap<P: AsRef<Path>>(data_dir: P, database_file: &str) -> AppResult<DatabaseContext> {
    let data_dir = data_dir.as_ref();
    std::fs::create_dir_all(data_dir)?;
    let db_path = data_dir.join(database_file);

    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
    let connection = Connection::open_with_flags(&db_path, flags)?;
    configure(&connection)?;
    run_migrations(&connection)?;

    info!(
        target: "database_bootstrap",
        path = %db_path.display(),
        "review store ready"
    );
    Ok(DatabaseContext {
        connection,
        path: db_path,
    })
}

fn configure(connection: &Connection) -> AppResult<()> {
    connection.busy_timeout(Duration::from_secs(5))?;
    connection.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA foreign_keys = ON;
        "#,
    )?;
    Ok(())
}

fn run_migrations(connection: &Connection) -> AppResult<()> {
    connection.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS reviews (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            place_url TEXT NOT NULL,
            locale TEXT NOT NULL,
            review_id TEXT NOT NULL,
            name TEXT NOT NULL DEFAULT '',
            date TEXT NOT NULL DEFAULT '',
            stars REAL NOT NULL DEFAULT 0,
            text TEXT NOT NULL DEFAULT '',
            avatar TEXT NOT NULL DEFAULT '',
            profile_link TEXT NOT NULL DEFAULT '',
            ingested_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS review_cache (
            place_url TEXT NOT NULL,
            locale TEXT NOT NULL,
            refreshed_at TEXT,
            min_rating REAL NOT NULL DEFAULT 1.0,
            max_count INTEGER NOT NULL DEFAULT 0,
            sort TEXT NOT NULL DEFAULT 'newest',
            PRIMARY KEY (place_url, locale)
        );

        CREATE TABLE IF NOT EXISTS monitored_places (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            place_url TEXT NOT NULL,
            locales TEXT NOT NULL DEFAULT '[]',
            interval_minutes INTEGER NOT NULL DEFAULT 60,
            min_rating REAL NOT NULL DEFAULT 1.0,
            max_count INTEGER NOT NULL DEFAULT 200,
            sort TEXT NOT NULL DEFAULT 'newest',
            last_run TEXT
        );

        CREATE TABLE IF NOT EXISTS review_instances (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            owner_id TEXT NOT NULL,
            public_key TEXT NOT NULL UNIQUE,
            place_url TEXT NOT NULL,
            locales TEXT NOT NULL DEFAULT '[]',
            interval_minutes INTEGER NOT NULL DEFAULT 60,
            min_rating REAL NOT NULL DEFAULT 1.0,
            max_count INTEGER NOT NULL DEFAULT 200,
            sort TEXT NOT NULL DEFAULT 'newest',
            active INTEGER NOT NULL DEFAULT 1 CHECK (active IN (0, 1)),
            last_run TEXT,
            created_at TEXT NOT NULL DEFAULT (STRFTIME('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );

        CREATE UNIQUE INDEX IF NOT EXISTS uq_review_place_locale_id
            ON reviews(place_url, locale, review_id);
        CREATE INDEX IF NOT EXISTS ix_reviews_place_locale ON reviews(place_url, locale);
        CREATE INDEX IF NOT EXISTS ix_monitored_places_place ON monitored_places(place_url);
        CREATE INDEX IF NOT EXISTS ix_review_instances_owner ON review_instances(owner_id);
        "#,
    )?;

    // Columns introduced after the first schema revision.
    ensure_column(
        connection,
        "reviews",
        "hidden INTEGER NOT NULL DEFAULT 0 CHECK (hidden IN (0, 1))",
    )?;
    ensure_column(
        connection,
        "review_cache",
        "review_count INTEGER NOT NULL DEFAULT 0",
    )?;
    ensure_column(connection, "review_cache", "avg_rating REAL NOT NULL DEFAULT 0")?;
    connection.execute(
        "CREATE INDEX IF NOT EXISTS ix_reviews_hidden ON reviews(hidden)",
        [],
    )?;
    Ok(())
}

fn ensure_column(connection: &Connection, table: &str, definition: &str) -> AppResult<()> {
    let column_name = definition
        .split_whitespace()
        .next()
        .ok_or_else(|| AppError::Config(format!("invalid column definition: {definition}")))?;
    if column_exists(connection, table, column_name)? {
        return Ok(());
    }
    let sql = format!("ALTER TABLE {table} ADD COLUMN {definition}");
    connection.execute(&sql, [])?;
    Ok(())
}

fn column_exists(connection: &Connection, table: &str, column: &str) -> AppResult<bool> {
    let pragma = format!("PRAGMA table_info({table})");
    let mut stmt = connection.prepare(&pragma)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Current time at the precision timestamps are stored with.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Fixed-width RFC 3339 text; lexical order equals chronological order.
pub fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|parsed| parsed.with_timezone(&Utc))
}
