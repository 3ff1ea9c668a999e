//! Local activity cache (SQLite) + portal HTTP fetch utilities.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use thiserror::Error;
use tracing::debug;
use vols_core::{ActivityRecord, RecruitStatus, SearchPage};

pub mod http;

pub use http::{HttpClientConfig, HttpFetcher, TransportError, BROWSER_USER_AGENT};

pub const CRATE_NAME: &str = "vols-storage";

/// Rows written per transaction in [`ActivityStore::upsert_many`].
pub const UPSERT_BATCH_SIZE: usize = 100;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const ACTIVITY_COLUMNS: &str = "program_id, title, location, organization, category, \
     activity_type, recruit_status, recognized_hours, period_start, period_end, \
     volunteer_time, recruit_start, recruit_end, group_key, fetched_at, description, \
     recruit_count, apply_count, target, active_days, volunteer_type, register_org, \
     detail_fetched";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("activity {0} does not exist")]
    NotFound(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Filters for a cache-backed search. Empty fields do not constrain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheQuery {
    pub category: String,
    pub activity_type: String,
    /// Canonical status code: `0` recruiting, `1` closed; anything else means all.
    pub status: String,
    pub location: String,
    pub group_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncRunStatus {
    Running,
    Succeeded,
    Failed,
}

impl SyncRunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    fn parse(raw: &str) -> StoreResult<Self> {
        match raw {
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            other => Err(StoreError::Corrupt(format!("unknown sync run status {other}"))),
        }
    }
}

/// Counters for one sync run as kept in the `sync_runs` side table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncRunRow {
    pub run_id: String,
    pub filters_json: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: SyncRunStatus,
    pub current_page: u32,
    pub total_pages: u32,
    pub fetched: u64,
    pub error: Option<String>,
}

/// Cache of activity records keyed by `program_id`.
///
/// Cloning shares the underlying pool. Open a separate store for a writer that
/// should not contend with readers for connections.
#[derive(Debug, Clone)]
pub struct ActivityStore {
    pool: SqlitePool,
}

impl ActivityStore {
    /// Connect and run migrations.
    pub async fn open(database_url: &str) -> StoreResult<Self> {
        let store = Self::connect(database_url).await?;
        store.migrate().await?;
        Ok(store)
    }

    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        ensure_parent_dir(options.get_filename()).await?;

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    /// Insert-or-update listing fields for every record.
    ///
    /// Each batch of [`UPSERT_BATCH_SIZE`] rows commits on its own, so a failure can
    /// leave earlier batches applied. Detail columns and `detail_fetched` are never
    /// touched here.
    pub async fn upsert_many(&self, records: &[ActivityRecord]) -> StoreResult<usize> {
        let mut written = 0usize;
        for batch in records.chunks(UPSERT_BATCH_SIZE) {
            let mut tx = self.pool.begin().await?;
            for record in batch {
                sqlx::query(
                    r#"
                    INSERT INTO activities
                        (program_id, title, location, organization, category,
                         activity_type, recruit_status, recruit_status_code, recognized_hours,
                         period_start, period_end, volunteer_time,
                         recruit_start, recruit_end, group_key, fetched_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    ON CONFLICT(program_id) DO UPDATE SET
                        title = excluded.title,
                        location = excluded.location,
                        organization = excluded.organization,
                        category = excluded.category,
                        activity_type = excluded.activity_type,
                        recruit_status = excluded.recruit_status,
                        recruit_status_code = excluded.recruit_status_code,
                        recognized_hours = excluded.recognized_hours,
                        period_start = excluded.period_start,
                        period_end = excluded.period_end,
                        volunteer_time = excluded.volunteer_time,
                        recruit_start = excluded.recruit_start,
                        recruit_end = excluded.recruit_end,
                        group_key = excluded.group_key,
                        fetched_at = excluded.fetched_at
                    "#,
                )
                .bind(&record.program_id)
                .bind(&record.title)
                .bind(&record.location)
                .bind(&record.organization)
                .bind(&record.category)
                .bind(&record.activity_type)
                .bind(&record.recruit_status)
                .bind(record.canonical_status().code())
                .bind(&record.recognized_hours)
                .bind(&record.period_start)
                .bind(&record.period_end)
                .bind(&record.volunteer_time)
                .bind(&record.recruit_start)
                .bind(&record.recruit_end)
                .bind(&record.group_key)
                .bind(format_ts(record.fetched_at))
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await?;
            written += batch.len();
            debug!(written, "upserted activity batch");
        }
        Ok(written)
    }

    /// Insert an empty row for a deep-linked id. Returns false if the id already exists.
    pub async fn ensure_placeholder(
        &self,
        program_id: &str,
        fetched_at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO activities (program_id, fetched_at)
            VALUES (?, ?)
            ON CONFLICT(program_id) DO NOTHING
            "#,
        )
        .bind(program_id)
        .bind(format_ts(fetched_at))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Write the detail field set plus the listing fields a detail page also exposes,
    /// and mark the row as enriched. The row must already exist.
    ///
    /// A listing field the detail page left empty keeps its stored value. `group_key`
    /// only changes together with a non-empty title. Detail-only fields are always
    /// overwritten.
    pub async fn apply_detail(&self, record: &ActivityRecord) -> StoreResult<()> {
        let has_title = !record.title.trim().is_empty();
        let status_code = (!record.recruit_status.trim().is_empty())
            .then(|| record.canonical_status().code());
        let result = sqlx::query(
            r#"
            UPDATE activities SET
                title = COALESCE(NULLIF(?, ''), title),
                location = COALESCE(NULLIF(?, ''), location),
                organization = COALESCE(NULLIF(?, ''), organization),
                category = COALESCE(NULLIF(?, ''), category),
                activity_type = COALESCE(NULLIF(?, ''), activity_type),
                recruit_status = COALESCE(NULLIF(?, ''), recruit_status),
                recruit_status_code = COALESCE(?, recruit_status_code),
                recognized_hours = COALESCE(NULLIF(?, ''), recognized_hours),
                period_start = COALESCE(NULLIF(?, ''), period_start),
                period_end = COALESCE(NULLIF(?, ''), period_end),
                volunteer_time = COALESCE(NULLIF(?, ''), volunteer_time),
                recruit_start = COALESCE(NULLIF(?, ''), recruit_start),
                recruit_end = COALESCE(NULLIF(?, ''), recruit_end),
                group_key = COALESCE(NULLIF(?, ''), group_key),
                description = ?,
                recruit_count = ?,
                apply_count = ?,
                target = ?,
                active_days = ?,
                volunteer_type = ?,
                register_org = ?,
                detail_fetched = 1
             WHERE program_id = ?
            "#,
        )
        .bind(record.title.trim())
        .bind(&record.location)
        .bind(&record.organization)
        .bind(&record.category)
        .bind(&record.activity_type)
        .bind(&record.recruit_status)
        .bind(status_code)
        .bind(&record.recognized_hours)
        .bind(&record.period_start)
        .bind(&record.period_end)
        .bind(&record.volunteer_time)
        .bind(&record.recruit_start)
        .bind(&record.recruit_end)
        .bind(if has_title { record.group_key.as_str() } else { "" })
        .bind(&record.description)
        .bind(&record.recruit_count)
        .bind(&record.apply_count)
        .bind(&record.target)
        .bind(&record.active_days)
        .bind(&record.volunteer_type)
        .bind(&record.register_org)
        .bind(&record.program_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(record.program_id.clone()));
        }
        Ok(())
    }

    pub async fn get(&self, program_id: &str) -> StoreResult<Option<ActivityRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {ACTIVITY_COLUMNS} FROM activities WHERE program_id = ?"
        ))
        .bind(program_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(activity_from_row).transpose()
    }

    /// All records sharing `group_key`, earliest period first with undated rows leading.
    pub async fn get_by_group(&self, group_key: &str) -> StoreResult<Vec<ActivityRecord>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {ACTIVITY_COLUMNS}
              FROM activities
             WHERE group_key = ?
             ORDER BY CASE WHEN period_start IS NULL OR period_start = '' THEN 0 ELSE 1 END,
                      period_start ASC,
                      program_id ASC
            "#
        ))
        .bind(group_key)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(activity_from_row).collect()
    }

    /// Row count and the newest `fetched_at` in the cache.
    pub async fn count_and_last_sync_time(&self) -> StoreResult<(u64, Option<DateTime<Utc>>)> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt, MAX(fetched_at) AS last FROM activities")
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.try_get("cnt")?;
        let last: Option<String> = row.try_get("last")?;
        let last = last.as_deref().map(parse_ts).transpose()?;
        Ok((count.max(0) as u64, last))
    }

    /// Cache-backed search, newest period first. Untitled placeholder rows are left out.
    pub async fn search(
        &self,
        query: &CacheQuery,
        page: u32,
        per_page: usize,
    ) -> StoreResult<SearchPage> {
        let page = page.max(1);
        let per_page = per_page.clamp(1, 100);

        let mut count_qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM activities WHERE 1 = 1");
        push_cache_filters(&mut count_qb, query);
        let total: i64 = count_qb.build_query_scalar().fetch_one(&self.pool).await?;

        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {ACTIVITY_COLUMNS} FROM activities WHERE 1 = 1"
        ));
        push_cache_filters(&mut qb, query);
        qb.push(" ORDER BY period_start DESC, program_id ASC LIMIT ")
            .push_bind(per_page as i64)
            .push(" OFFSET ")
            .push_bind(((page - 1) as usize * per_page) as i64);
        let rows = qb.build().fetch_all(&self.pool).await?;

        Ok(SearchPage {
            items: rows.iter().map(activity_from_row).collect::<StoreResult<_>>()?,
            total: total.max(0) as usize,
            page,
            per_page,
        })
    }

    pub async fn record_run_started(&self, run: &SyncRunRow) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_runs
                (run_id, filters_json, started_at, status, current_page, total_pages, fetched)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&run.run_id)
        .bind(&run.filters_json)
        .bind(format_ts(run.started_at))
        .bind(run.status.as_str())
        .bind(run.current_page)
        .bind(run.total_pages)
        .bind(run.fetched as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn record_run_progress(
        &self,
        run_id: &str,
        current_page: u32,
        total_pages: u32,
        fetched: u64,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE sync_runs
               SET current_page = ?, total_pages = ?, fetched = ?
             WHERE run_id = ?
            "#,
        )
        .bind(current_page)
        .bind(total_pages)
        .bind(fetched as i64)
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn record_run_finished(
        &self,
        run_id: &str,
        status: SyncRunStatus,
        error: Option<&str>,
        finished_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE sync_runs
               SET status = ?, error = ?, finished_at = ?
             WHERE run_id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(error)
        .bind(format_ts(finished_at))
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn recent_runs(&self, limit: u32) -> StoreResult<Vec<SyncRunRow>> {
        let rows = sqlx::query(
            r#"
            SELECT run_id, filters_json, started_at, finished_at, status,
                   current_page, total_pages, fetched, error
              FROM sync_runs
             ORDER BY started_at DESC
             LIMIT ?
            "#,
        )
        .bind(limit.max(1))
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let started_at: String = row.try_get("started_at")?;
            let finished_at: Option<String> = row.try_get("finished_at")?;
            let status: String = row.try_get("status")?;
            let fetched: i64 = row.try_get("fetched")?;
            out.push(SyncRunRow {
                run_id: row.try_get("run_id")?,
                filters_json: row.try_get("filters_json")?,
                started_at: parse_ts(&started_at)?,
                finished_at: finished_at.as_deref().map(parse_ts).transpose()?,
                status: SyncRunStatus::parse(&status)?,
                current_page: row.try_get("current_page")?,
                total_pages: row.try_get("total_pages")?,
                fetched: fetched.max(0) as u64,
                error: row.try_get("error")?,
            });
        }
        Ok(out)
    }
}

async fn ensure_parent_dir(path: &Path) -> StoreResult<()> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() || path.as_os_str() == ":memory:" {
        return Ok(());
    }
    tokio::fs::create_dir_all(parent)
        .await
        .map_err(|err| StoreError::Database(sqlx::Error::Io(err)))
}

fn push_cache_filters(qb: &mut QueryBuilder<'_, Sqlite>, query: &CacheQuery) {
    qb.push(" AND title <> ''");
    if !query.category.is_empty() {
        qb.push(" AND category = ").push_bind(query.category.clone());
    }
    if !query.activity_type.is_empty() {
        qb.push(" AND activity_type = ").push_bind(query.activity_type.clone());
    }
    if let Some(status) = RecruitStatus::from_code(&query.status) {
        qb.push(" AND recruit_status_code = ").push_bind(status.code());
    }
    if !query.location.is_empty() {
        qb.push(" AND location LIKE ").push_bind(format!("%{}%", query.location));
    }
    if !query.group_key.is_empty() {
        qb.push(" AND group_key = ").push_bind(query.group_key.clone());
    }
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| StoreError::Corrupt(format!("bad timestamp {raw}: {err}")))
}

fn activity_from_row(row: &SqliteRow) -> StoreResult<ActivityRecord> {
    let fetched_at: String = row.try_get("fetched_at")?;
    Ok(ActivityRecord {
        program_id: row.try_get("program_id")?,
        title: row.try_get("title")?,
        location: row.try_get("location")?,
        organization: row.try_get("organization")?,
        category: row.try_get("category")?,
        activity_type: row.try_get("activity_type")?,
        recruit_status: row.try_get("recruit_status")?,
        recognized_hours: row.try_get("recognized_hours")?,
        period_start: row.try_get("period_start")?,
        period_end: row.try_get("period_end")?,
        volunteer_time: row.try_get("volunteer_time")?,
        recruit_start: row.try_get("recruit_start")?,
        recruit_end: row.try_get("recruit_end")?,
        group_key: row.try_get("group_key")?,
        fetched_at: parse_ts(&fetched_at)?,
        description: row.try_get("description")?,
        recruit_count: row.try_get("recruit_count")?,
        apply_count: row.try_get("apply_count")?,
        target: row.try_get("target")?,
        active_days: row.try_get("active_days")?,
        volunteer_type: row.try_get("volunteer_type")?,
        register_org: row.try_get("register_org")?,
        detail_fetched: row.try_get("detail_fetched")?,
    })
}
