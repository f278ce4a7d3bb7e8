//! Postgres-backed [`Store`] implementation.
//!
//! Raw `sqlx::query` with explicit binds throughout; the uniqueness race on
//! `report_versions` is resolved with `ON CONFLICT ... DO NOTHING RETURNING`
//! so exactly one of two concurrent writers observes an insert.
//!
//! Advisory locks are Postgres session-scoped, so each acquired lock pins
//! its `PoolConnection`; the unlock runs on that same connection. A
//! connection whose unlock fails is detached and closed instead of being
//! returned to the pool still holding the lock.

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::Value;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Connection, PgPool, Row};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    merge_parsed_fields, AlertStateRow, ErrorKind, PublishOutcome, RunState, Store, StoredReport,
    VersionRow,
};

pub const ENV_DB_URL: &str = "AGMON_DATABASE_URL";

/// Connect to Postgres using `AGMON_DATABASE_URL`.
pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .context("failed to connect to Postgres")?;

    Ok(pool)
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_reports_table: bool,
}

/// Simple status query (connectivity + schema presence).
pub async fn status(pool: &PgPool) -> Result<DbStatus> {
    let (one,): (i32,) = sqlx::query_as::<_, (i32,)>("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;

    let (exists,): (bool,) = sqlx::query_as::<_, (bool,)>(
        r#"
        select exists (
            select 1
            from information_schema.tables
            where table_schema='public' and table_name='reports'
        )
        "#,
    )
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?;

    Ok(DbStatus {
        ok: one == 1,
        has_reports_table: exists,
    })
}

pub struct PgStore {
    pool: PgPool,
    /// Connections currently holding an advisory lock, keyed by report id.
    lock_conns: Mutex<HashMap<String, sqlx::pool::PoolConnection<sqlx::Postgres>>>,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        PgStore {
            pool,
            lock_conns: Mutex::new(HashMap::new()),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn version_from_row(row: &PgRow) -> Result<VersionRow> {
        Ok(VersionRow {
            id: row.try_get("id")?,
            report_id: row.try_get("report_id")?,
            report_date: row.try_get("report_date")?,
            payload_hash: row.try_get("payload_hash")?,
            parsed_fields: row.try_get("parsed_fields")?,
            raw_payload: row.try_get("raw_payload")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[async_trait]
impl Store for PgStore {
    async fn stored_reports(&self) -> Result<Vec<StoredReport>> {
        let rows = sqlx::query(
            r#"
            select id, name, config
            from reports
            order by created_at asc, id asc
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("stored_reports failed")?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(StoredReport {
                report_id: row.try_get("id")?,
                name: row.try_get("name")?,
                config: row.try_get("config")?,
            });
        }
        Ok(out)
    }

    async fn get_report(&self, report_id: &str) -> Result<Option<StoredReport>> {
        let row = sqlx::query(
            r#"
            select id, name, config
            from reports
            where id = $1
            "#,
        )
        .bind(report_id)
        .fetch_optional(&self.pool)
        .await
        .context("get_report failed")?;

        let Some(row) = row else { return Ok(None) };
        Ok(Some(StoredReport {
            report_id: row.try_get("id")?,
            name: row.try_get("name")?,
            config: row.try_get("config")?,
        }))
    }

    async fn upsert_report_config(
        &self,
        report_id: &str,
        name: &str,
        config: &Value,
    ) -> Result<()> {
        sqlx::query(
            r#"
            insert into reports (id, name, config)
            values ($1, $2, $3)
            on conflict (id) do update
                set name = excluded.name,
                    config = excluded.config
            "#,
        )
        .bind(report_id)
        .bind(name)
        .bind(config)
        .execute(&self.pool)
        .await
        .context("upsert_report_config failed")?;
        Ok(())
    }

    async fn create_run(&self, report_id: &str) -> Result<Uuid> {
        let run_id = Uuid::new_v4();
        sqlx::query(
            r#"
            insert into report_runs (id, report_id, state, attempt)
            values ($1, $2, $3, 1)
            "#,
        )
        .bind(run_id)
        .bind(report_id)
        .bind(RunState::WaitingForPublication.as_str())
        .execute(&self.pool)
        .await
        .context("create_run failed")?;
        Ok(run_id)
    }

    async fn finalize_run(
        &self,
        run_id: Uuid,
        report_date: Option<NaiveDate>,
        state: RunState,
        payload_hash: Option<&str>,
        error: Option<(ErrorKind, &str)>,
    ) -> Result<()> {
        let (error_type, error_message) = match error {
            Some((kind, msg)) => (Some(kind.as_str()), Some(msg)),
            None => (None, None),
        };

        let mut tx = self.pool.begin().await.context("finalize_run begin failed")?;
        sqlx::query(
            r#"
            update report_runs
               set report_date = $2,
                   state = $3,
                   payload_hash = $4,
                   error_type = $5,
                   error_message = $6,
                   run_finished_at = now()
             where id = $1
            "#,
        )
        .bind(run_id)
        .bind(report_date)
        .bind(state.as_str())
        .bind(payload_hash)
        .bind(error_type)
        .bind(error_message)
        .execute(&mut *tx)
        .await
        .context("finalize_run update failed")?;

        let (event_type, message) = match error {
            Some((_, msg)) => ("error", msg),
            None => (state.as_str(), state.as_str()),
        };
        sqlx::query(
            r#"
            insert into report_run_events (id, report_run_id, event_type, message)
            values ($1, $2, $3, $4)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(run_id)
        .bind(event_type)
        .bind(message)
        .execute(&mut *tx)
        .await
        .context("finalize_run event insert failed")?;

        tx.commit().await.context("finalize_run commit failed")?;
        Ok(())
    }

    async fn append_run_event(
        &self,
        run_id: Uuid,
        event_type: &str,
        message: Option<&str>,
        data: Option<Value>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            insert into report_run_events (id, report_run_id, event_type, message, data)
            values ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(run_id)
        .bind(event_type)
        .bind(message)
        .bind(data)
        .execute(&self.pool)
        .await
        .context("append_run_event failed")?;
        Ok(())
    }

    async fn version_hashes(
        &self,
        report_id: &str,
        report_date: NaiveDate,
    ) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            select payload_hash
            from report_versions
            where report_id = $1 and report_date = $2
            "#,
        )
        .bind(report_id)
        .bind(report_date)
        .fetch_all(&self.pool)
        .await
        .context("version_hashes failed")?;
        Ok(rows.into_iter().map(|(h,)| h).collect())
    }

    async fn find_version(
        &self,
        report_id: &str,
        report_date: NaiveDate,
        payload_hash: &str,
    ) -> Result<Option<VersionRow>> {
        let row = sqlx::query(
            r#"
            select id, report_id, report_date, payload_hash, parsed_fields, raw_payload, created_at
            from report_versions
            where report_id = $1 and report_date = $2 and payload_hash = $3
            "#,
        )
        .bind(report_id)
        .bind(report_date)
        .bind(payload_hash)
        .fetch_optional(&self.pool)
        .await
        .context("find_version failed")?;

        row.as_ref().map(Self::version_from_row).transpose()
    }

    async fn publish_version(
        &self,
        run_id: Uuid,
        report_id: &str,
        report_date: NaiveDate,
        payload_hash: &str,
        parsed_fields: &Value,
        raw_payload: &Value,
    ) -> Result<PublishOutcome> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("publish_version begin failed")?;

        let inserted: Option<(Uuid,)> = sqlx::query_as(
            r#"
            insert into report_versions
                (id, report_id, report_date, payload_hash, parsed_fields, raw_payload)
            values ($1, $2, $3, $4, $5, $6)
            on conflict on constraint uq_report_version_hash do nothing
            returning id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(report_id)
        .bind(report_date)
        .bind(payload_hash)
        .bind(parsed_fields)
        .bind(raw_payload)
        .fetch_optional(&mut *tx)
        .await
        .context("publish_version insert failed")?;

        let state = match inserted {
            Some(_) => RunState::PublishedNew,
            None => RunState::PublishedNoChange,
        };

        sqlx::query(
            r#"
            update report_runs
               set report_date = $2,
                   state = $3,
                   payload_hash = $4,
                   run_finished_at = now()
             where id = $1
            "#,
        )
        .bind(run_id)
        .bind(report_date)
        .bind(state.as_str())
        .bind(payload_hash)
        .execute(&mut *tx)
        .await
        .context("publish_version run update failed")?;

        sqlx::query(
            r#"
            insert into report_run_events (id, report_run_id, event_type, message)
            values ($1, $2, $3, $3)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(run_id)
        .bind(state.as_str())
        .execute(&mut *tx)
        .await
        .context("publish_version event insert failed")?;

        tx.commit().await.context("publish_version commit failed")?;

        Ok(match inserted {
            Some((version_id,)) => PublishOutcome::Inserted { version_id },
            None => PublishOutcome::DuplicateHash,
        })
    }

    async fn insert_version(
        &self,
        report_id: &str,
        report_date: NaiveDate,
        payload_hash: &str,
        parsed_fields: &Value,
        raw_payload: &Value,
    ) -> Result<bool> {
        let row: Option<(Uuid,)> = sqlx::query_as(
            r#"
            insert into report_versions
                (id, report_id, report_date, payload_hash, parsed_fields, raw_payload)
            values ($1, $2, $3, $4, $5, $6)
            on conflict on constraint uq_report_version_hash do nothing
            returning id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(report_id)
        .bind(report_date)
        .bind(payload_hash)
        .bind(parsed_fields)
        .bind(raw_payload)
        .fetch_optional(&self.pool)
        .await
        .context("insert_version failed")?;
        Ok(row.is_some())
    }

    async fn merge_version_fields(&self, version_id: Uuid, fields: &Value) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("merge_version_fields begin failed")?;

        let (existing,): (Value,) = sqlx::query_as(
            r#"
            select parsed_fields
            from report_versions
            where id = $1
            for update
            "#,
        )
        .bind(version_id)
        .fetch_one(&mut *tx)
        .await
        .context("merge_version_fields select failed")?;

        let merged = merge_parsed_fields(&existing, fields);
        sqlx::query(
            r#"
            update report_versions
               set parsed_fields = $2
             where id = $1
            "#,
        )
        .bind(version_id)
        .bind(merged)
        .execute(&mut *tx)
        .await
        .context("merge_version_fields update failed")?;

        tx.commit()
            .await
            .context("merge_version_fields commit failed")?;
        Ok(())
    }

    async fn alert_record_failure(&self, report_id: &str) -> Result<i64> {
        let (count,): (i32,) = sqlx::query_as(
            r#"
            insert into alert_state (report_id, consecutive_failures, last_failure_at, updated_at)
            values ($1, 1, now(), now())
            on conflict (report_id) do update
                set consecutive_failures = alert_state.consecutive_failures + 1,
                    last_failure_at = now(),
                    updated_at = now()
            returning consecutive_failures
            "#,
        )
        .bind(report_id)
        .fetch_one(&self.pool)
        .await
        .context("alert_record_failure failed")?;
        Ok(count as i64)
    }

    async fn alert_clear(&self, report_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            update alert_state
               set consecutive_failures = 0,
                   updated_at = now()
             where report_id = $1
            "#,
        )
        .bind(report_id)
        .execute(&self.pool)
        .await
        .context("alert_clear failed")?;
        Ok(())
    }

    async fn alert_state(&self, report_id: &str) -> Result<Option<AlertStateRow>> {
        let row = sqlx::query(
            r#"
            select report_id, consecutive_failures, last_failure_at, updated_at
            from alert_state
            where report_id = $1
            "#,
        )
        .bind(report_id)
        .fetch_optional(&self.pool)
        .await
        .context("alert_state failed")?;

        let Some(row) = row else { return Ok(None) };
        Ok(Some(AlertStateRow {
            report_id: row.try_get("report_id")?,
            consecutive_failures: row.try_get::<i32, _>("consecutive_failures")? as i64,
            last_failure_at: row.try_get("last_failure_at")?,
            updated_at: row.try_get("updated_at")?,
        }))
    }

    async fn active_recipients(&self, report_id: &str) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            select r.email
            from recipients r
            join recipient_reports rr on rr.recipient_id = r.id
            where rr.report_id = $1 and r.is_active = true
            order by r.email asc
            "#,
        )
        .bind(report_id)
        .fetch_all(&self.pool)
        .await
        .context("active_recipients failed")?;
        Ok(rows.into_iter().map(|(e,)| e).collect())
    }

    async fn ensure_recipient(&self, email: &str, name: Option<&str>) -> Result<()> {
        sqlx::query(
            r#"
            insert into recipients (id, email, name)
            values ($1, $2, $3)
            on conflict (email) do nothing
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(email)
        .bind(name)
        .execute(&self.pool)
        .await
        .context("ensure_recipient failed")?;
        Ok(())
    }

    async fn link_recipient_report(&self, email: &str, report_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            insert into recipient_reports (id, recipient_id, report_id)
            select $1, r.id, $2
            from recipients r
            where r.email = $3
            on conflict on constraint uq_recipient_report do nothing
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(report_id)
        .bind(email)
        .execute(&self.pool)
        .await
        .context("link_recipient_report failed")?;
        Ok(())
    }

    async fn try_acquire_report_lock(&self, report_id: &str) -> Result<bool> {
        let mut held = self.lock_conns.lock().await;
        if held.contains_key(report_id) {
            // Already held by this process; treat as contended.
            return Ok(false);
        }

        let mut conn = self
            .pool
            .acquire()
            .await
            .context("advisory lock connection acquire failed")?;
        let (locked,): (bool,) =
            sqlx::query_as("select pg_try_advisory_lock(hashtext($1))")
                .bind(report_id)
                .fetch_one(&mut *conn)
                .await
                .context("pg_try_advisory_lock failed")?;

        if locked {
            held.insert(report_id.to_string(), conn);
        }
        Ok(locked)
    }

    async fn release_report_lock(&self, report_id: &str) {
        let conn = self.lock_conns.lock().await.remove(report_id);
        let Some(mut conn) = conn else { return };

        let unlocked = sqlx::query("select pg_advisory_unlock(hashtext($1))")
            .bind(report_id)
            .execute(&mut *conn)
            .await;
        if unlocked.is_err() {
            // Do not return a lock-holding connection to the pool; the lock
            // dies with the session.
            let _ = conn.detach().close().await;
        }
    }
}
