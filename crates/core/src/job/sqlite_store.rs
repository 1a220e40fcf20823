//! SQLite-backed job store implementation.

use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::de::DeserializeOwned;

use super::{
    Artifact, AuditEntry, AuditEvent, Job, JobFilter, JobStatus, JobStore, JobTransition, Lease,
    NewAuditEntry, NewJob, Stage, StageAttempts, StoreError,
};

const JOB_COLUMNS: &str = "id, study_reference, stage, status, attempts, options, error_info, \
     cancel_requested, retry_at, input_artifact_id, delivery, resubmitted_from, version, \
     created_at, updated_at";

const ARTIFACT_COLUMNS: &str =
    "id, job_id, stage, artifact_type, location, checksum, produced_at, metadata";

/// SQLite-backed job store.
pub struct SqliteJobStore {
    conn: Mutex<Connection>,
}

impl SqliteJobStore {
    /// Create a new SQLite job store, creating the database file and tables if needed.
    pub fn new(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory SQLite job store (useful for testing).
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn initialize_schema(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                study_reference TEXT NOT NULL,
                stage TEXT NOT NULL,
                status TEXT NOT NULL,
                attempts TEXT NOT NULL,
                options TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                error_info TEXT,
                cancel_requested INTEGER NOT NULL DEFAULT 0,
                retry_at TEXT,
                input_artifact_id TEXT,
                delivery TEXT,
                resubmitted_from TEXT,
                version INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
            CREATE INDEX IF NOT EXISTS idx_jobs_queue ON jobs(priority DESC, created_at ASC);
            CREATE INDEX IF NOT EXISTS idx_jobs_updated_at ON jobs(updated_at);

            CREATE TABLE IF NOT EXISTS artifacts (
                id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL REFERENCES jobs(id),
                stage TEXT NOT NULL,
                artifact_type TEXT NOT NULL,
                location TEXT NOT NULL,
                checksum TEXT NOT NULL,
                produced_at TEXT NOT NULL,
                metadata TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_artifacts_job ON artifacts(job_id, produced_at);

            CREATE TABLE IF NOT EXISTS job_audit (
                job_id TEXT NOT NULL REFERENCES jobs(id),
                seq INTEGER NOT NULL,
                timestamp TEXT NOT NULL,
                stage TEXT NOT NULL,
                status TEXT NOT NULL,
                event TEXT NOT NULL,
                detail TEXT,
                PRIMARY KEY (job_id, seq)
            );

            CREATE TABLE IF NOT EXISTS job_leases (
                job_id TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                acquired_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                renewals INTEGER NOT NULL DEFAULT 0
            );

            CREATE TRIGGER IF NOT EXISTS job_audit_no_update
            BEFORE UPDATE ON job_audit
            BEGIN
                SELECT RAISE(ABORT, 'job_audit is append-only');
            END;

            CREATE TRIGGER IF NOT EXISTS job_audit_no_delete
            BEFORE DELETE ON job_audit
            BEGIN
                SELECT RAISE(ABORT, 'job_audit is append-only');
            END;

            CREATE TRIGGER IF NOT EXISTS artifacts_no_update
            BEFORE UPDATE ON artifacts
            BEGIN
                SELECT RAISE(ABORT, 'artifacts are immutable');
            END;
            "#,
        )?;

        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Database("connection mutex poisoned".to_string()))
    }

    fn build_where_clause(filter: &JobFilter) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
        let mut conditions = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(status) = filter.status {
            conditions.push("status = ?");
            params.push(Box::new(status.as_str()));
        }

        if let Some(since) = filter.since {
            conditions.push("updated_at >= ?");
            params.push(Box::new(ts(since)));
        }

        if let Some(until) = filter.until {
            conditions.push("updated_at < ?");
            params.push(Box::new(ts(until)));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        (where_clause, params)
    }

    fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<Job> {
        let stage: String = row.get(2)?;
        let status: String = row.get(3)?;
        let attempts: String = row.get(4)?;
        let options: String = row.get(5)?;
        let error_info: Option<String> = row.get(6)?;
        let retry_at: Option<String> = row.get(8)?;
        let delivery: Option<String> = row.get(10)?;
        let version: i64 = row.get(12)?;
        let created_at: String = row.get(13)?;
        let updated_at: String = row.get(14)?;

        Ok(Job {
            id: row.get(0)?,
            study_reference: row.get(1)?,
            stage: parse_enum(2, &stage)?,
            status: parse_enum(3, &status)?,
            attempts: parse_json::<StageAttempts>(4, &attempts)?,
            options: parse_json(5, &options)?,
            error_info: error_info.map(|s| parse_json(6, &s)).transpose()?,
            cancel_requested: row.get(7)?,
            retry_at: retry_at.map(|s| parse_time(8, &s)).transpose()?,
            input_artifact_id: row.get(9)?,
            delivery: delivery.map(|s| parse_json(10, &s)).transpose()?,
            resubmitted_from: row.get(11)?,
            version: version as u64,
            created_at: parse_time(13, &created_at)?,
            updated_at: parse_time(14, &updated_at)?,
            audit_log: Vec::new(),
        })
    }

    fn row_to_artifact(row: &rusqlite::Row) -> rusqlite::Result<Artifact> {
        let stage: String = row.get(2)?;
        let artifact_type: String = row.get(3)?;
        let produced_at: String = row.get(6)?;
        let metadata: String = row.get(7)?;

        Ok(Artifact {
            id: row.get(0)?,
            job_id: row.get(1)?,
            stage: parse_enum(2, &stage)?,
            artifact_type: parse_enum(3, &artifact_type)?,
            location: row.get(4)?,
            checksum: row.get(5)?,
            produced_at: parse_time(6, &produced_at)?,
            metadata: parse_json(7, &metadata)?,
        })
    }

    fn row_to_audit(row: &rusqlite::Row) -> rusqlite::Result<AuditEntry> {
        let seq: i64 = row.get(0)?;
        let timestamp: String = row.get(1)?;
        let stage: String = row.get(2)?;
        let status: String = row.get(3)?;
        let event: String = row.get(4)?;

        Ok(AuditEntry {
            seq: seq as u64,
            timestamp: parse_time(1, &timestamp)?,
            stage: parse_enum(2, &stage)?,
            status: parse_enum(3, &status)?,
            event: parse_enum(4, &event)?,
            detail: row.get(5)?,
        })
    }

    fn load_job(conn: &Connection, id: &str) -> Result<Option<Job>, StoreError> {
        let job = conn
            .query_row(
                &format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS),
                params![id],
                Self::row_to_job,
            )
            .optional()?;

        let Some(mut job) = job else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT seq, timestamp, stage, status, event, detail FROM job_audit WHERE job_id = ? ORDER BY seq ASC",
        )?;
        job.audit_log = stmt
            .query_map(params![id], Self::row_to_audit)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(job))
    }

    fn append_audit(
        tx: &Transaction,
        job_id: &str,
        status: JobStatus,
        entry: &NewAuditEntry,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let last: i64 = tx.query_row(
            "SELECT COALESCE(MAX(seq), 0) FROM job_audit WHERE job_id = ?",
            params![job_id],
            |row| row.get(0),
        )?;

        tx.execute(
            "INSERT INTO job_audit (job_id, seq, timestamp, stage, status, event, detail) VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                job_id,
                last + 1,
                ts(at),
                entry.stage.as_str(),
                status.as_str(),
                entry.event.as_str(),
                entry.detail,
            ],
        )?;

        Ok(())
    }

    fn insert_artifact(tx: &Transaction, artifact: &Artifact) -> Result<(), StoreError> {
        tx.execute(
            &format!(
                "INSERT INTO artifacts ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                ARTIFACT_COLUMNS
            ),
            params![
                artifact.id,
                artifact.job_id,
                artifact.stage.as_str(),
                artifact.artifact_type.as_str(),
                artifact.location,
                artifact.checksum,
                ts(artifact.produced_at),
                serde_json::to_string(&artifact.metadata)?,
            ],
        )?;
        Ok(())
    }

    /// Bumps the version of a job row that is known to exist.
    fn touch(tx: &Transaction, id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        tx.execute(
            "UPDATE jobs SET version = version + 1, updated_at = ? WHERE id = ?",
            params![ts(at), id],
        )?;
        Ok(())
    }
}

impl JobStore for SqliteJobStore {
    fn create(&self, request: NewJob) -> Result<Job, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let stage = Stage::Preprocess;
        let status = JobStatus::Received;

        tx.execute(
            "INSERT INTO jobs (id, study_reference, stage, status, attempts, options, priority, cancel_requested, resubmitted_from, version, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, 1, ?, ?)",
            params![
                id,
                request.study_reference,
                stage.as_str(),
                status.as_str(),
                serde_json::to_string(&StageAttempts::default())?,
                serde_json::to_string(&request.options)?,
                request.options.priority,
                request.resubmitted_from,
                ts(now),
                ts(now),
            ],
        )?;

        let mut entry = NewAuditEntry::new(stage, AuditEvent::Received);
        if let Some(ref original) = request.resubmitted_from {
            entry = entry.with_detail(format!("resubmission of {}", original));
        }
        Self::append_audit(&tx, &id, status, &entry, now)?;
        tx.commit()?;

        Self::load_job(&conn, &id)?.ok_or(StoreError::NotFound(id))
    }

    fn get(&self, id: &str) -> Result<Option<Job>, StoreError> {
        let conn = self.conn()?;
        Self::load_job(&conn, id)
    }

    fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let conn = self.conn()?;
        let (where_clause, mut params) = Self::build_where_clause(filter);

        let query = format!(
            "SELECT {} FROM jobs {} ORDER BY priority DESC, created_at ASC LIMIT ? OFFSET ?",
            JOB_COLUMNS, where_clause
        );
        params.push(Box::new(filter.limit));
        params.push(Box::new(filter.offset));

        let mut stmt = conn.prepare(&query)?;
        let params_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let jobs = stmt
            .query_map(params_refs.as_slice(), Self::row_to_job)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(jobs)
    }

    fn count(&self, filter: &JobFilter) -> Result<i64, StoreError> {
        let conn = self.conn()?;
        let (where_clause, params) = Self::build_where_clause(filter);

        let query = format!("SELECT COUNT(*) FROM jobs {}", where_clause);
        let params_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let count = conn.query_row(&query, params_refs.as_slice(), |row| row.get(0))?;

        Ok(count)
    }

    fn commit(&self, transition: JobTransition) -> Result<Job, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let job = &transition.job;
        let now = Utc::now();

        let updated = tx.execute(
            "UPDATE jobs SET stage = ?, status = ?, attempts = ?, error_info = ?, cancel_requested = ?, retry_at = ?, input_artifact_id = ?, delivery = ?, version = version + 1, updated_at = ? WHERE id = ? AND version = ?",
            params![
                job.stage.as_str(),
                job.status.as_str(),
                serde_json::to_string(&job.attempts)?,
                job.error_info.as_ref().map(serde_json::to_string).transpose()?,
                job.cancel_requested,
                job.retry_at.map(ts),
                job.input_artifact_id,
                job.delivery.as_ref().map(serde_json::to_string).transpose()?,
                ts(now),
                job.id,
                job.version as i64,
            ],
        )?;

        if updated == 0 {
            let actual: Option<i64> = tx
                .query_row(
                    "SELECT version FROM jobs WHERE id = ?",
                    params![job.id],
                    |row| row.get(0),
                )
                .optional()?;
            return Err(match actual {
                None => StoreError::NotFound(job.id.clone()),
                Some(actual) => StoreError::Conflict {
                    job_id: job.id.clone(),
                    expected: job.version,
                    actual: actual as u64,
                },
            });
        }

        if let Some(ref artifact) = transition.artifact {
            Self::insert_artifact(&tx, artifact)?;
        }

        for entry in &transition.audit {
            Self::append_audit(&tx, &job.id, job.status, entry, now)?;
        }

        tx.commit()?;

        Self::load_job(&conn, &job.id)?.ok_or_else(|| StoreError::NotFound(job.id.clone()))
    }

    fn request_cancel(&self, id: &str) -> Result<Job, StoreError> {
        let mut conn = self.conn()?;
        let job = Self::load_job(&conn, id)?.ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        if !job.status.can_cancel() {
            return Err(StoreError::InvalidState {
                job_id: id.to_string(),
                status: job.status,
                operation: "cancel".to_string(),
            });
        }

        if job.cancel_requested {
            return Ok(job);
        }

        let now = Utc::now();
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE jobs SET cancel_requested = 1 WHERE id = ?",
            params![id],
        )?;
        Self::touch(&tx, id, now)?;
        Self::append_audit(
            &tx,
            id,
            job.status,
            &NewAuditEntry::new(job.stage, AuditEvent::CancelRequested),
            now,
        )?;
        tx.commit()?;

        Self::load_job(&conn, id)?.ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn annotate(&self, id: &str, note: &str) -> Result<Job, StoreError> {
        let mut conn = self.conn()?;
        let job = Self::load_job(&conn, id)?.ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        let now = Utc::now();
        let tx = conn.transaction()?;
        Self::touch(&tx, id, now)?;
        Self::append_audit(
            &tx,
            id,
            job.status,
            &NewAuditEntry::new(job.stage, AuditEvent::Annotation).with_detail(note),
            now,
        )?;
        tx.commit()?;

        Self::load_job(&conn, id)?.ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn artifacts(&self, job_id: &str) -> Result<Vec<Artifact>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM artifacts WHERE job_id = ? ORDER BY produced_at ASC, rowid ASC",
            ARTIFACT_COLUMNS
        ))?;
        let artifacts = stmt
            .query_map(params![job_id], Self::row_to_artifact)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(artifacts)
    }

    fn get_artifact(&self, id: &str) -> Result<Option<Artifact>, StoreError> {
        let conn = self.conn()?;
        let artifact = conn
            .query_row(
                &format!("SELECT {} FROM artifacts WHERE id = ?", ARTIFACT_COLUMNS),
                params![id],
                Self::row_to_artifact,
            )
            .optional()?;
        Ok(artifact)
    }

    fn runnable(&self, limit: i64) -> Result<Vec<Job>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM jobs WHERE status NOT IN ('complete', 'failed', 'cancelled') ORDER BY priority DESC, created_at ASC LIMIT ?",
            JOB_COLUMNS
        ))?;
        let jobs = stmt
            .query_map(params![limit], Self::row_to_job)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    fn acquire_lease(
        &self,
        job_id: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<Option<Lease>, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now = Utc::now();

        let exists: Option<i64> = tx
            .query_row("SELECT 1 FROM jobs WHERE id = ?", params![job_id], |row| {
                row.get(0)
            })
            .optional()?;
        if exists.is_none() {
            return Err(StoreError::NotFound(job_id.to_string()));
        }

        let holder: Option<(String, String)> = tx
            .query_row(
                "SELECT owner, expires_at FROM job_leases WHERE job_id = ?",
                params![job_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        if let Some((holder, expires_at)) = holder {
            if holder != owner && expires_at > ts(now) {
                return Ok(None);
            }
        }

        let lease = Lease {
            job_id: job_id.to_string(),
            owner: owner.to_string(),
            acquired_at: now,
            expires_at: now + lease_ttl(ttl)?,
            renewals: 0,
        };

        tx.execute(
            "INSERT OR REPLACE INTO job_leases (job_id, owner, acquired_at, expires_at, renewals) VALUES (?, ?, ?, ?, 0)",
            params![
                lease.job_id,
                lease.owner,
                ts(lease.acquired_at),
                ts(lease.expires_at)
            ],
        )?;
        tx.commit()?;

        Ok(Some(lease))
    }

    fn renew_lease(&self, lease: &Lease, ttl: Duration) -> Result<Lease, StoreError> {
        let conn = self.conn()?;
        let expires_at = Utc::now() + lease_ttl(ttl)?;

        let updated = conn.execute(
            "UPDATE job_leases SET expires_at = ?, renewals = renewals + 1 WHERE job_id = ? AND owner = ?",
            params![ts(expires_at), lease.job_id, lease.owner],
        )?;

        if updated == 0 {
            return Err(StoreError::LeaseLost {
                job_id: lease.job_id.clone(),
                owner: lease.owner.clone(),
            });
        }

        Ok(Lease {
            expires_at,
            renewals: lease.renewals + 1,
            ..lease.clone()
        })
    }

    fn release_lease(&self, lease: &Lease) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM job_leases WHERE job_id = ? AND owner = ?",
            params![lease.job_id, lease.owner],
        )?;
        Ok(())
    }
}

/// Fixed-width UTC timestamp so that text comparison orders correctly.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn lease_ttl(ttl: Duration) -> Result<chrono::Duration, StoreError> {
    chrono::Duration::from_std(ttl)
        .map_err(|e| StoreError::Database(format!("invalid lease ttl: {}", e)))
}

fn conversion_error(
    idx: usize,
    err: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err.into())
}

fn parse_time(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn parse_json<T: DeserializeOwned>(idx: usize, s: &str) -> rusqlite::Result<T> {
    serde_json::from_str(s).map_err(|e| conversion_error(idx, e))
}

fn parse_enum<T: FromStr<Err = String>>(idx: usize, s: &str) -> rusqlite::Result<T> {
    s.parse().map_err(|e: String| conversion_error(idx, e))
}
