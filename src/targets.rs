use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use crate::db::{format_timestamp, parse_timestamp};
use crate::errors::{AppError, AppResult};
use crate::locales;
use crate::view::{ReviewQuery, SortOrder};

const PUBLIC_KEY_BYTES: usize = 18;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    MonitoredPlace,
    ReviewInstance,
}

impl TargetKind {
    fn table(&self) -> &'static str {
        match self {
            TargetKind::MonitoredPlace => "monitored_places",
            TargetKind::ReviewInstance => "review_instances",
        }
    }
}

/// Administrator-configured place refreshed on a schedule.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoredPlace {
    pub id: i64,
    pub place_url: String,
    pub locales: Vec<String>,
    pub interval_minutes: u32,
    pub defaults: ReviewQuery,
    pub last_run: Option<DateTime<Utc>>,
}

/// Tenant-owned place with a public key for embedding.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewInstance {
    pub id: i64,
    pub owner_id: String,
    pub public_key: String,
    pub place_url: String,
    pub locales: Vec<String>,
    pub interval_minutes: u32,
    pub defaults: ReviewQuery,
    pub active: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewTarget {
    pub place_url: String,
    pub locales: Vec<String>,
    pub interval_minutes: u32,
    pub defaults: ReviewQuery,
}

/// Partial update for an instance; `None` keeps the stored value.
#[derive(Debug, Clone, Default)]
pub struct InstancePatch {
    pub place_url: Option<String>,
    pub locales: Option<Vec<String>>,
    pub interval_minutes: Option<u32>,
    pub min_rating: Option<f64>,
    pub max_count: Option<u32>,
    pub sort: Option<SortOrder>,
    pub active: Option<bool>,
}

/// Either kind of target as the monitor loop sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledTarget {
    pub kind: TargetKind,
    pub id: i64,
    pub place_url: String,
    pub locales: Vec<String>,
    pub interval_minutes: u32,
    pub last_run: Option<DateTime<Utc>>,
}

impl ScheduledTarget {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        is_due(self.last_run, self.interval_minutes, now)
    }
}

/// A target that never ran is due; otherwise it is due once more than one
/// interval has passed since its last run.
pub fn is_due(last_run: Option<DateTime<Utc>>, interval_minutes: u32, now: DateTime<Utc>) -> bool {
    match last_run {
        None => true,
        Some(last_run) => now - last_run > Duration::minutes(i64::from(interval_minutes)),
    }
}

/// Supported locales in the given order; every supported locale when none remain.
pub fn normalize_locales(requested: &[String]) -> Vec<String> {
    let supported = locales::retain_supported(requested);
    if supported.is_empty() {
        locales::all()
    } else {
        supported
    }
}

pub fn generate_public_key() -> String {
    let mut bytes = [0u8; PUBLIC_KEY_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn create_monitored_place(
    connection: &Connection,
    target: &NewTarget,
) -> AppResult<MonitoredPlace> {
    let locales = normalize_locales(&target.locales);
    connection.execute(
        "INSERT INTO monitored_places
            (place_url, locales, interval_minutes, min_rating, max_count, sort)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            target.place_url,
            serde_json::to_string(&locales)?,
            target.interval_minutes,
            target.defaults.min_rating,
            target.defaults.max_count,
            target.defaults.sort.as_str(),
        ],
    )?;
    monitored_place_by_id(connection, connection.last_insert_rowid())
}

pub fn monitored_place_by_id(connection: &Connection, id: i64) -> AppResult<MonitoredPlace> {
    connection
        .query_row(
            "SELECT id, place_url, locales, interval_minutes, min_rating, max_count, sort, last_run
            FROM monitored_places WHERE id = ?1",
            [id],
            monitored_place_from_row,
        )
        .optional()?
        .ok_or_else(|| AppError::NotFound(format!("monitored place {id} not found")))
}

pub fn list_monitored_places(connection: &Connection) -> AppResult<Vec<MonitoredPlace>> {
    let mut stmt = connection.prepare(
        "SELECT id, place_url, locales, interval_minutes, min_rating, max_count, sort, last_run
        FROM monitored_places ORDER BY id ASC",
    )?;
    let places = stmt
        .query_map([], monitored_place_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(places)
}

pub fn delete_monitored_place(connection: &Connection, id: i64) -> AppResult<()> {
    let changed = connection.execute("DELETE FROM monitored_places WHERE id = ?1", [id])?;
    if changed == 0 {
        return Err(AppError::NotFound(format!("monitored place {id} not found")));
    }
    Ok(())
}

pub fn create_instance(
    connection: &Connection,
    owner_id: &str,
    target: &NewTarget,
    created_at: DateTime<Utc>,
) -> AppResult<ReviewInstance> {
    let locales = normalize_locales(&target.locales);
    connection.execute(
        "INSERT INTO review_instances
            (owner_id, public_key, place_url, locales, interval_minutes, min_rating, max_count,
             sort, active, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1, ?9)",
        params![
            owner_id,
            generate_public_key(),
            target.place_url,
            serde_json::to_string(&locales)?,
            target.interval_minutes,
            target.defaults.min_rating,
            target.defaults.max_count,
            target.defaults.sort.as_str(),
            format_timestamp(created_at),
        ],
    )?;
    instance_by_id(connection, connection.last_insert_rowid())
}

const INSTANCE_COLUMNS: &str = "id, owner_id, public_key, place_url, locales, interval_minutes,
    min_rating, max_count, sort, active, last_run, created_at";

pub fn instance_by_id(connection: &Connection, id: i64) -> AppResult<ReviewInstance> {
    let sql = format!("SELECT {INSTANCE_COLUMNS} FROM review_instances WHERE id = ?1");
    connection
        .query_row(&sql, [id], instance_from_row)
        .optional()?
        .ok_or_else(|| instance_not_found(id))
}

/// Instance owned by `owner_id`; someone else's instance reads as missing.
pub fn owned_instance(connection: &Connection, owner_id: &str, id: i64) -> AppResult<ReviewInstance> {
    let instance = instance_by_id(connection, id)?;
    if instance.owner_id != owner_id {
        return Err(instance_not_found(id));
    }
    Ok(instance)
}

pub fn instance_by_public_key(
    connection: &Connection,
    public_key: &str,
) -> AppResult<Option<ReviewInstance>> {
    let sql = format!("SELECT {INSTANCE_COLUMNS} FROM review_instances WHERE public_key = ?1");
    let instance = connection
        .query_row(&sql, [public_key], instance_from_row)
        .optional()?;
    Ok(instance)
}

pub fn list_instances_for_owner(
    connection: &Connection,
    owner_id: &str,
) -> AppResult<Vec<ReviewInstance>> {
    let sql = format!(
        "SELECT {INSTANCE_COLUMNS} FROM review_instances WHERE owner_id = ?1 ORDER BY id ASC"
    );
    let mut stmt = connection.prepare(&sql)?;
    let instances = stmt
        .query_map([owner_id], instance_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(instances)
}

pub fn update_instance(
    connection: &Connection,
    owner_id: &str,
    id: i64,
    patch: &InstancePatch,
) -> AppResult<ReviewInstance> {
    let current = owned_instance(connection, owner_id, id)?;
    let locales = match &patch.locales {
        Some(requested) => normalize_locales(requested),
        None => current.locales.clone(),
    };
    let defaults = ReviewQuery::new(
        patch.min_rating.unwrap_or(current.defaults.min_rating),
        patch.max_count.unwrap_or(current.defaults.max_count),
        patch.sort.unwrap_or(current.defaults.sort),
    );
    connection.execute(
        "UPDATE review_instances
        SET place_url = ?2, locales = ?3, interval_minutes = ?4, min_rating = ?5,
            max_count = ?6, sort = ?7, active = ?8
        WHERE id = ?1",
        params![
            id,
            patch.place_url.as_deref().unwrap_or(&current.place_url),
            serde_json::to_string(&locales)?,
            patch.interval_minutes.unwrap_or(current.interval_minutes),
            defaults.min_rating,
            defaults.max_count,
            defaults.sort.as_str(),
            patch.active.unwrap_or(current.active),
        ],
    )?;
    instance_by_id(connection, id)
}

pub fn delete_instance(connection: &Connection, owner_id: &str, id: i64) -> AppResult<()> {
    let changed = connection.execute(
        "DELETE FROM review_instances WHERE id = ?1 AND owner_id = ?2",
        params![id, owner_id],
    )?;
    if changed == 0 {
        return Err(instance_not_found(id));
    }
    Ok(())
}

/// Monitored places plus active instances, in that order.
pub fn scheduled_targets(connection: &Connection) -> AppResult<Vec<ScheduledTarget>> {
    let mut targets: Vec<ScheduledTarget> = list_monitored_places(connection)?
        .into_iter()
        .map(|place| ScheduledTarget {
            kind: TargetKind::MonitoredPlace,
            id: place.id,
            place_url: place.place_url,
            locales: place.locales,
            interval_minutes: place.interval_minutes,
            last_run: place.last_run,
        })
        .collect();

    let sql = format!("SELECT {INSTANCE_COLUMNS} FROM review_instances WHERE active = 1 ORDER BY id ASC");
    let mut stmt = connection.prepare(&sql)?;
    let instances = stmt
        .query_map([], instance_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    targets.extend(instances.into_iter().map(|instance| ScheduledTarget {
        kind: TargetKind::ReviewInstance,
        id: instance.id,
        place_url: instance.place_url,
        locales: instance.locales,
        interval_minutes: instance.interval_minutes,
        last_run: instance.last_run,
    }));
    Ok(targets)
}

pub fn record_run(
    connection: &Connection,
    kind: TargetKind,
    id: i64,
    ran_at: DateTime<Utc>,
) -> AppResult<()> {
    let sql = format!("UPDATE {} SET last_run = ?1 WHERE id = ?2", kind.table());
    connection.execute(&sql, params![format_timestamp(ran_at), id])?;
    Ok(())
}

fn instance_not_found(id: i64) -> AppError {
    AppError::NotFound(format!("review instance {id} not found"))
}

fn stored_locales(raw: &str) -> Vec<String> {
    let parsed: Vec<String> = serde_json::from_str(raw).unwrap_or_default();
    normalize_locales(&parsed)
}

fn stored_query(row: &Row<'_>, offset: usize) -> rusqlite::Result<ReviewQuery> {
    let max_count: i64 = row.get(offset + 1)?;
    let sort: String = row.get(offset + 2)?;
    Ok(ReviewQuery::new(
        row.get(offset)?,
        max_count.clamp(0, u32::MAX as i64) as u32,
        SortOrder::parse(&sort).unwrap_or_default(),
    ))
}

fn optional_timestamp(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.as_deref().and_then(parse_timestamp)
}

fn monitored_place_from_row(row: &Row<'_>) -> rusqlite::Result<MonitoredPlace> {
    let locales: String = row.get(2)?;
    Ok(MonitoredPlace {
        id: row.get(0)?,
        place_url: row.get(1)?,
        locales: stored_locales(&locales),
        interval_minutes: row.get(3)?,
        defaults: stored_query(row, 4)?,
        last_run: optional_timestamp(row.get(7)?),
    })
}

fn instance_from_row(row: &Row<'_>) -> rusqlite::Result<ReviewInstance> {
    let locales: String = row.get(4)?;
    let created_at: String = row.get(11)?;
    Ok(ReviewInstance {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        public_key: row.get(2)?,
        place_url: row.get(3)?,
        locales: stored_locales(&locales),
        interval_minutes: row.get(5)?,
        defaults: stored_query(row, 6)?,
        active: row.get(9)?,
        last_run: optional_timestamp(row.get(10)?),
        created_at: parse_timestamp(&created_at).unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::db::{bootstrap, now};

    fn new_target(locales: &[&str]) -> NewTarget {
        NewTarget {
            place_url: "https://maps.example/place?cid=9".into(),
            locales: locales.iter().map(|locale| locale.to_string()).collect(),
            interval_minutes: 60,
            defaults: ReviewQuery::new(3.0, 20, SortOrder::Best),
        }
    }

    #[test]
    fn due_policy() {
        let now = now();
        assert!(is_due(None, 60, now));
        assert!(is_due(Some(now - Duration::minutes(120)), 60, now));
        assert!(!is_due(Some(now - Duration::minutes(30)), 60, now));
        assert!(!is_due(Some(now - Duration::minutes(60)), 60, now));
    }

    #[test]
    fn monitored_places_filter_locales() {
        let dir = tempdir().unwrap();
        let conn = bootstrap(dir.path(), "targets.db").unwrap().connection;

        let place = create_monitored_place(&conn, &new_target(&["cs-CZ", "zz-ZZ"])).unwrap();
        assert_eq!(place.locales, vec!["cs-CZ".to_string()]);
        let fallback = create_monitored_place(&conn, &new_target(&["zz-ZZ"])).unwrap();
        assert_eq!(fallback.locales, locales::all());
        assert_eq!(fallback.defaults, ReviewQuery::new(3.0, 20, SortOrder::Best));

        assert_eq!(list_monitored_places(&conn).unwrap().len(), 2);
        delete_monitored_place(&conn, place.id).unwrap();
        assert!(matches!(
            delete_monitored_place(&conn, place.id),
            Err(AppError::NotFound(_))
        ));
    }

    #[test]
    fn instances_are_scoped_to_owner() {
        let dir = tempdir().unwrap();
        let conn = bootstrap(dir.path(), "instances.db").unwrap().connection;

        let created = create_instance(&conn, "owner-1", &new_target(&["en-US"]), now()).unwrap();
        assert!(created.active);
        assert_eq!(created.public_key.len(), 24);
        let found = instance_by_public_key(&conn, &created.public_key).unwrap().unwrap();
        assert_eq!(found.id, created.id);

        assert!(matches!(
            owned_instance(&conn, "owner-2", created.id),
            Err(AppError::NotFound(_))
        ));
        let patched = update_instance(
            &conn,
            "owner-1",
            created.id,
            &InstancePatch {
                active: Some(false),
                max_count: Some(5),
                ..InstancePatch::default()
            },
        )
        .unwrap();
        assert!(!patched.active);
        assert_eq!(patched.defaults.max_count, 5);
        assert_eq!(patched.defaults.sort, SortOrder::Best);
        assert_eq!(patched.public_key, created.public_key);

        assert!(list_instances_for_owner(&conn, "owner-2").unwrap().is_empty());
        assert!(delete_instance(&conn, "owner-2", created.id).is_err());
        delete_instance(&conn, "owner-1", created.id).unwrap();
    }

    #[test]
    fn schedule_skips_inactive_instances_and_records_runs() {
        let dir = tempdir().unwrap();
        let conn = bootstrap(dir.path(), "schedule.db").unwrap().connection;
        let place = create_monitored_place(&conn, &new_target(&["en-US"])).unwrap();
        let live = create_instance(&conn, "owner", &new_target(&["de-DE"]), now()).unwrap();
        let paused = create_instance(&conn, "owner", &new_target(&["de-DE"]), now()).unwrap();
        update_instance(
            &conn,
            "owner",
            paused.id,
            &InstancePatch {
                active: Some(false),
                ..InstancePatch::default()
            },
        )
        .unwrap();

        let ran_at = now();
        record_run(&conn, TargetKind::MonitoredPlace, place.id, ran_at).unwrap();
        let targets = scheduled_targets(&conn).unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].kind, TargetKind::MonitoredPlace);
        assert_eq!(targets[0].last_run, Some(ran_at));
        assert!(!targets[0].is_due(ran_at));
        assert_eq!(targets[1].id, live.id);
        assert!(targets[1].is_due(ran_at));
    }
}
