use crate::models::schema::ingestion_jobs;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_derive_enum::DbEnum;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const STALE_LEASE_ERROR: &str = "worker lease expired";

#[derive(Error, Debug)]
pub enum IngestionJobError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] diesel::result::Error),
    #[error("Ingestion job not found")]
    NotFound,
}

// Ingestion status enum matching the database enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, DbEnum)]
#[ExistingTypePath = "crate::models::schema::sql_types::IngestionStatus"]
#[serde(rename_all = "snake_case")]
pub enum IngestionStatus {
    Queued,
    InProgress,
    Completed,
    Failed,
}

#[derive(Queryable, Selectable, Identifiable, Debug, Clone, Serialize, Deserialize)]
#[diesel(table_name = ingestion_jobs)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct IngestionJob {
    pub id: i64,
    pub uuid: Uuid,
    pub document_id: i64,
    pub chatbot_id: i64,
    pub requested_by: Uuid,
    pub status: IngestionStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub last_error: Option<String>,
    pub chunk_count: Option<i32>,
    pub worker_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl IngestionJob {
    pub fn attempts_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    pub fn get_by_uuid(
        conn: &mut PgConnection,
        uuid: Uuid,
    ) -> Result<Option<IngestionJob>, IngestionJobError> {
        ingestion_jobs::table
            .filter(ingestion_jobs::uuid.eq(uuid))
            .first::<IngestionJob>(conn)
            .optional()
            .map_err(IngestionJobError::DatabaseError)
    }

    /// Claims the oldest queued job for `worker`, skipping rows locked by other workers.
    pub fn claim_next(
        conn: &mut PgConnection,
        worker: &str,
    ) -> Result<Option<IngestionJob>, IngestionJobError> {
        conn.transaction::<Option<IngestionJob>, IngestionJobError, _>(|conn| {
            let next = ingestion_jobs::table
                .filter(ingestion_jobs::status.eq(IngestionStatus::Queued))
                .order((ingestion_jobs::created_at.asc(), ingestion_jobs::id.asc()))
                .for_update()
                .skip_locked()
                .first::<IngestionJob>(conn)
                .optional()?;

            let Some(job) = next else {
                return Ok(None);
            };

            let claimed =
                diesel::update(ingestion_jobs::table.filter(ingestion_jobs::id.eq(job.id)))
                    .set((
                        ingestion_jobs::status.eq(IngestionStatus::InProgress),
                        ingestion_jobs::attempts.eq(ingestion_jobs::attempts + 1),
                        ingestion_jobs::worker_id.eq(Some(worker.to_string())),
                        ingestion_jobs::started_at.eq(diesel::dsl::now),
                        ingestion_jobs::updated_at.eq(diesel::dsl::now),
                    ))
                    .get_result::<IngestionJob>(conn)?;

            Ok(Some(claimed))
        })
    }

    /// Refreshes the lease on a job `worker` is still running.
    ///
    /// Returns false once the job has been recovered or handed to another worker.
    pub fn touch(
        conn: &mut PgConnection,
        id: i64,
        worker: &str,
    ) -> Result<bool, IngestionJobError> {
        let updated = diesel::update(
            ingestion_jobs::table
                .filter(ingestion_jobs::id.eq(id))
                .filter(ingestion_jobs::status.eq(IngestionStatus::InProgress))
                .filter(ingestion_jobs::worker_id.eq(worker)),
        )
        .set(ingestion_jobs::updated_at.eq(diesel::dsl::now))
        .execute(conn)?;
        Ok(updated == 1)
    }

    // The finishers below only match a job `worker` still holds. A worker whose lease
    // was recovered gets NotFound instead of overwriting the current state.

    pub fn mark_completed(
        conn: &mut PgConnection,
        id: i64,
        worker: &str,
        chunk_count: i32,
    ) -> Result<IngestionJob, IngestionJobError> {
        diesel::update(
            ingestion_jobs::table
                .filter(ingestion_jobs::id.eq(id))
                .filter(ingestion_jobs::status.eq(IngestionStatus::InProgress))
                .filter(ingestion_jobs::worker_id.eq(worker)),
        )
        .set((
            ingestion_jobs::status.eq(IngestionStatus::Completed),
            ingestion_jobs::chunk_count.eq(Some(chunk_count)),
            ingestion_jobs::last_error.eq(None::<String>),
            ingestion_jobs::completed_at.eq(diesel::dsl::now),
            ingestion_jobs::updated_at.eq(diesel::dsl::now),
        ))
        .get_result::<IngestionJob>(conn)
        .map_err(not_found_or_db)
    }

    pub fn mark_failed(
        conn: &mut PgConnection,
        id: i64,
        worker: &str,
        error: &str,
    ) -> Result<IngestionJob, IngestionJobError> {
        diesel::update(
            ingestion_jobs::table
                .filter(ingestion_jobs::id.eq(id))
                .filter(ingestion_jobs::status.eq(IngestionStatus::InProgress))
                .filter(ingestion_jobs::worker_id.eq(worker)),
        )
        .set((
            ingestion_jobs::status.eq(IngestionStatus::Failed),
            ingestion_jobs::last_error.eq(Some(error.to_string())),
            ingestion_jobs::completed_at.eq(diesel::dsl::now),
            ingestion_jobs::updated_at.eq(diesel::dsl::now),
        ))
        .get_result::<IngestionJob>(conn)
        .map_err(not_found_or_db)
    }

    /// Puts a failed attempt back in the queue; the whole document is retried.
    pub fn requeue(
        conn: &mut PgConnection,
        id: i64,
        worker: &str,
        error: &str,
    ) -> Result<IngestionJob, IngestionJobError> {
        diesel::update(
            ingestion_jobs::table
                .filter(ingestion_jobs::id.eq(id))
                .filter(ingestion_jobs::status.eq(IngestionStatus::InProgress))
                .filter(ingestion_jobs::worker_id.eq(worker)),
        )
        .set((
            ingestion_jobs::status.eq(IngestionStatus::Queued),
            ingestion_jobs::last_error.eq(Some(error.to_string())),
            ingestion_jobs::worker_id.eq(None::<String>),
            ingestion_jobs::updated_at.eq(diesel::dsl::now),
        ))
        .get_result::<IngestionJob>(conn)
        .map_err(not_found_or_db)
    }

    /// Recovers jobs whose worker stopped reporting before `cutoff`.
    ///
    /// Jobs with attempts left return to the queue; the rest are failed.
    /// Returns (requeued, failed).
    pub fn recover_stale(
        conn: &mut PgConnection,
        cutoff: DateTime<Utc>,
    ) -> Result<(usize, usize), IngestionJobError> {
        conn.transaction::<(usize, usize), IngestionJobError, _>(|conn| {
            let failed = diesel::update(
                ingestion_jobs::table
                    .filter(ingestion_jobs::status.eq(IngestionStatus::InProgress))
                    .filter(ingestion_jobs::updated_at.lt(cutoff))
                    .filter(ingestion_jobs::attempts.ge(ingestion_jobs::max_attempts)),
            )
            .set((
                ingestion_jobs::status.eq(IngestionStatus::Failed),
                ingestion_jobs::last_error.eq(Some(STALE_LEASE_ERROR.to_string())),
                ingestion_jobs::completed_at.eq(diesel::dsl::now),
                ingestion_jobs::updated_at.eq(diesel::dsl::now),
            ))
            .execute(conn)?;

            let requeued = diesel::update(
                ingestion_jobs::table
                    .filter(ingestion_jobs::status.eq(IngestionStatus::InProgress))
                    .filter(ingestion_jobs::updated_at.lt(cutoff))
                    .filter(ingestion_jobs::attempts.lt(ingestion_jobs::max_attempts)),
            )
            .set((
                ingestion_jobs::status.eq(IngestionStatus::Queued),
                ingestion_jobs::last_error.eq(Some(STALE_LEASE_ERROR.to_string())),
                ingestion_jobs::worker_id.eq(None::<String>),
                ingestion_jobs::updated_at.eq(diesel::dsl::now),
            ))
            .execute(conn)?;

            Ok((requeued, failed))
        })
    }
}

fn not_found_or_db(e: diesel::result::Error) -> IngestionJobError {
    match e {
        diesel::result::Error::NotFound => IngestionJobError::NotFound,
        _ => IngestionJobError::DatabaseError(e),
    }
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = ingestion_jobs)]
pub struct NewIngestionJob {
    pub uuid: Uuid,
    pub document_id: i64,
    pub chatbot_id: i64,
    pub requested_by: Uuid,
    pub status: IngestionStatus,
    pub max_attempts: i32,
}

impl NewIngestionJob {
    pub fn new(document_id: i64, chatbot_id: i64, requested_by: Uuid, max_attempts: i32) -> Self {
        NewIngestionJob {
            uuid: Uuid::new_v4(),
            document_id,
            chatbot_id,
            requested_by,
            status: IngestionStatus::Queued,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn insert(&self, conn: &mut PgConnection) -> Result<IngestionJob, IngestionJobError> {
        diesel::insert_into(ingestion_jobs::table)
            .values(self)
            .get_result::<IngestionJob>(conn)
            .map_err(IngestionJobError::DatabaseError)
    }
}
