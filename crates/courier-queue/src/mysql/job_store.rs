//! MySQL job store over the `worker_queue` table.

use crate::error::PersistenceError;
use crate::job::{Job, JobId, NewJob};
use crate::priority::Priority;
use crate::store::{ConnectionLoad, JobStore, QueueCounts, StoreResult};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::mysql::MySqlPool;
use sqlx::FromRow;
use std::time::Duration;
use tracing::debug;

const JOB_COLUMNS: &str = "id, command, parameter, priority, created, executed, next_try, \
                           retrial, done, pid, force_priority";

/// Job store backed by MySQL.
///
/// Claims take row locks with `FOR UPDATE SKIP LOCKED`, so concurrent
/// supervisors never claim the same row and never wait on each other.
#[derive(Clone)]
pub struct MySqlJobStore {
    pool: MySqlPool,
}

impl MySqlJobStore {
    #[must_use]
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, FromRow)]
struct JobRow {
    id: i64,
    command: String,
    parameter: String,
    priority: u8,
    created: DateTime<Utc>,
    executed: Option<DateTime<Utc>>,
    next_try: Option<DateTime<Utc>>,
    retrial: u32,
    done: bool,
    pid: u32,
    force_priority: bool,
}

impl TryFrom<JobRow> for Job {
    type Error = PersistenceError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let parameters: Vec<String> = serde_json::from_str(&row.parameter)?;
        Ok(Job {
            id: JobId(row.id),
            command: row.command,
            parameters,
            priority: Priority::from(row.priority),
            created_at: row.created,
            executed_at: row.executed,
            next_try: row.next_try,
            retrial: row.retrial,
            done: row.done,
            pid: row.pid,
            force_priority: row.force_priority,
        })
    }
}

#[derive(Debug, FromRow)]
struct TierCount {
    priority: u8,
    jobs: i64,
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

#[async_trait]
impl JobStore for MySqlJobStore {
    async fn enqueue(&self, job: NewJob) -> StoreResult<JobId> {
        let parameter = serde_json::to_string(&job.parameters)?;
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let existing: Option<(i64, u32, Option<DateTime<Utc>>)> = sqlx::query_as(
            r#"
            SELECT id, pid, executed FROM worker_queue
            WHERE command = ? AND parameter = ? AND NOT done
            ORDER BY id
            LIMIT 1
            FOR UPDATE
            "#,
        )
        .bind(&job.command)
        .bind(&parameter)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some((id, pid, executed)) = existing {
            if job.force_priority && pid == 0 && executed.is_none() {
                sqlx::query("UPDATE worker_queue SET priority = ? WHERE id = ?")
                    .bind(job.priority.as_u8())
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
            }
            tx.commit().await?;
            debug!(job_id = id, command = %job.command, "Job already queued");
            return Ok(JobId(id));
        }

        let result = sqlx::query(
            r#"
            INSERT INTO worker_queue
                (command, parameter, priority, created, next_try, retrial, done, pid, force_priority)
            VALUES (?, ?, ?, ?, ?, 0, 0, 0, ?)
            "#,
        )
        .bind(&job.command)
        .bind(&parameter)
        .bind(job.priority.as_u8())
        .bind(now)
        .bind(job.next_try_from(now))
        .bind(job.force_priority)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        let id = i64::try_from(result.last_insert_id())
            .map_err(|_| PersistenceError::Corrupt("job id out of range".to_string()))?;
        Ok(JobId(id))
    }

    async fn claim_next(
        &self,
        eligible: &[Priority],
        limit: u32,
        claimer_pid: u32,
    ) -> StoreResult<Vec<Job>> {
        if eligible.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let select = format!(
            r#"
            SELECT {} FROM worker_queue
            WHERE NOT done AND pid = 0 AND executed IS NULL
              AND (next_try IS NULL OR next_try <= ?)
              AND priority IN ({})
            ORDER BY priority, retrial, created, id
            LIMIT ?
            FOR UPDATE SKIP LOCKED
            "#,
            JOB_COLUMNS,
            placeholders(eligible.len())
        );
        let mut query = sqlx::query_as::<_, JobRow>(&select).bind(now);
        for priority in eligible {
            query = query.bind(priority.as_u8());
        }
        let rows = query.bind(limit).fetch_all(&mut *tx).await?;

        if rows.is_empty() {
            tx.commit().await?;
            return Ok(Vec::new());
        }

        let update = format!(
            "UPDATE worker_queue SET executed = ?, pid = ? WHERE id IN ({})",
            placeholders(rows.len())
        );
        let mut query = sqlx::query(&update).bind(now).bind(claimer_pid);
        for row in &rows {
            query = query.bind(row.id);
        }
        query.execute(&mut *tx).await?;
        tx.commit().await?;

        rows.into_iter()
            .map(|row| {
                let mut job = Job::try_from(row)?;
                job.executed_at = Some(now);
                job.pid = claimer_pid;
                Ok::<_, PersistenceError>(job)
            })
            .collect()
    }

    async fn assign_worker(&self, id: JobId, pid: u32) -> StoreResult<()> {
        sqlx::query("UPDATE worker_queue SET pid = ? WHERE id = ? AND NOT done")
            .bind(pid)
            .bind(id.as_i64())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get(&self, id: JobId) -> StoreResult<Option<Job>> {
        let sql = format!("SELECT {} FROM worker_queue WHERE id = ?", JOB_COLUMNS);
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(id.as_i64())
            .fetch_optional(&self.pool)
            .await?;

        row.map(Job::try_from).transpose()
    }

    async fn mark_done(&self, id: JobId) -> StoreResult<()> {
        sqlx::query("UPDATE worker_queue SET done = 1, executed = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(id.as_i64())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn release(&self, id: JobId) -> StoreResult<()> {
        sqlx::query("UPDATE worker_queue SET executed = NULL, pid = 0 WHERE id = ? AND NOT done")
            .bind(id.as_i64())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn requeue(&self, id: JobId, priority: Priority) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE worker_queue
            SET executed = NULL, pid = 0, priority = ?, retrial = retrial + 1, created = ?
            WHERE id = ? AND NOT done
            "#,
        )
        .bind(priority.as_u8())
        .bind(Utc::now())
        .bind(id.as_i64())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn defer(
        &self,
        id: JobId,
        retrial: u32,
        next_try: DateTime<Utc>,
        priority: Priority,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE worker_queue
            SET retrial = ?, next_try = ?, priority = ?, executed = NULL, pid = 0
            WHERE id = ? AND NOT done
            "#,
        )
        .bind(retrial)
        .bind(next_try)
        .bind(priority.as_u8())
        .bind(id.as_i64())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn running(&self) -> StoreResult<Vec<Job>> {
        let sql = format!(
            "SELECT {} FROM worker_queue WHERE NOT done AND (executed IS NOT NULL OR pid <> 0) ORDER BY id",
            JOB_COLUMNS
        );
        sqlx::query_as::<_, JobRow>(&sql)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Job::try_from)
            .collect()
    }

    async fn delete_done_older_than(&self, age: Duration) -> StoreResult<u64> {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(age).unwrap_or_else(|_| ChronoDuration::days(36500));
        let result = sqlx::query(
            "DELETE FROM worker_queue WHERE done AND (executed IS NULL OR executed < ?)",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn queue_counts(&self) -> StoreResult<QueueCounts> {
        let queued = sqlx::query_as::<_, TierCount>(
            r#"
            SELECT priority, COUNT(*) AS jobs FROM worker_queue
            WHERE NOT done AND pid = 0 AND executed IS NULL
              AND (next_try IS NULL OR next_try <= ?)
            GROUP BY priority
            "#,
        )
        .bind(Utc::now())
        .fetch_all(&self.pool)
        .await?;

        let running = sqlx::query_as::<_, TierCount>(
            r#"
            SELECT priority, COUNT(*) AS jobs FROM worker_queue
            WHERE NOT done AND (executed IS NOT NULL OR pid <> 0)
            GROUP BY priority
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts = QueueCounts::default();
        for row in queued {
            *counts.queued.entry(Priority::from(row.priority)).or_insert(0) += row.jobs.max(0) as u64;
        }
        for row in running {
            *counts.running.entry(Priority::from(row.priority)).or_insert(0) += row.jobs.max(0) as u64;
        }
        Ok(counts)
    }

    async fn connection_load(&self) -> StoreResult<ConnectionLoad> {
        let current: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM information_schema.PROCESSLIST")
            .fetch_one(&self.pool)
            .await?;
        let server_max: u64 = sqlx::query_scalar("SELECT @@GLOBAL.max_connections")
            .fetch_one(&self.pool)
            .await?;

        Ok(ConnectionLoad {
            current: u32::try_from(current.max(0)).unwrap_or(u32::MAX),
            server_max: u32::try_from(server_max).ok().filter(|m| *m > 0),
        })
    }

    async fn optimize(&self) -> StoreResult<()> {
        sqlx::raw_sql("OPTIMIZE TABLE worker_queue")
            .execute(&self.pool)
            .await?;
        debug!("Optimized worker_queue");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholders() {
        assert_eq!(placeholders(1), "?");
        assert_eq!(placeholders(3), "?, ?, ?");
    }

    #[test]
    fn test_row_conversion() {
        let now = Utc::now();
        let row = JobRow {
            id: 7,
            command: "APDelivery".to_string(),
            parameter: r#"["https://a.example/inbox"]"#.to_string(),
            priority: 20,
            created: now,
            executed: None,
            next_try: None,
            retrial: 2,
            done: false,
            pid: 0,
            force_priority: true,
        };

        let job = Job::try_from(row).unwrap();
        assert_eq!(job.id, JobId(7));
        assert_eq!(job.parameters, vec!["https://a.example/inbox".to_string()]);
        assert_eq!(job.priority, Priority::High);
        assert!(job.force_priority);
    }

    #[test]
    fn test_corrupt_parameters_rejected() {
        let row = JobRow {
            id: 1,
            command: "Cron".to_string(),
            parameter: "not json".to_string(),
            priority: 30,
            created: Utc::now(),
            executed: None,
            next_try: None,
            retrial: 0,
            done: false,
            pid: 0,
            force_priority: false,
        };
        assert!(matches!(Job::try_from(row), Err(PersistenceError::Serialization(_))));
    }
}
