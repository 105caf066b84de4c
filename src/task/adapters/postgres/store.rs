//! `PostgreSQL` task store.
//!
//! Claims use `SELECT … FOR UPDATE SKIP LOCKED` inside a transaction, so
//! concurrent claimers skip rows another transaction is already claiming.

use super::{
    models::{
        DeliveryRow, TaskRow, row_to_delivery, row_to_task, to_delivery_changeset,
        to_delivery_row, to_task_changeset, to_task_row,
    },
    schema::{deliveries, tasks},
};
use crate::task::{
    domain::{
        ClaimedTask, Delivery, DeliveryId, DeliveryStatus, DeliveryTarget, RESUMABLE_STATUSES,
        StageTransition, Task, TaskId, TaskStatus,
    },
    ports::{TaskStore, TaskStoreError, TaskStoreResult},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::connection::SimpleConnection;
use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool};
use diesel::result::{DatabaseErrorKind, Error as DieselError};

/// `PostgreSQL` connection pool type used by the task store.
pub type TaskPgPool = Pool<ConnectionManager<PgConnection>>;

const SCHEMA_SQL: &str = include_str!("../../../../migrations/2026-10-01-000000_create_tasks/up.sql");

/// Builds a connection pool for `database_url`.
///
/// # Errors
///
/// Returns [`TaskStoreError::Persistence`] when the pool cannot open its
/// initial connections.
pub fn connect_pool(database_url: &str, max_size: u32) -> TaskStoreResult<TaskPgPool> {
    Pool::builder()
        .max_size(max_size)
        .build(ConnectionManager::<PgConnection>::new(database_url))
        .map_err(TaskStoreError::persistence)
}

/// `PostgreSQL`-backed task store.
#[derive(Debug, Clone)]
pub struct PostgresTaskStore {
    pool: TaskPgPool,
}

impl PostgresTaskStore {
    /// Creates a store from a `PostgreSQL` connection pool.
    #[must_use]
    pub const fn new(pool: TaskPgPool) -> Self {
        Self { pool }
    }

    /// Creates the task and delivery tables if they do not exist.
    ///
    /// # Errors
    ///
    /// Returns [`TaskStoreError::Persistence`] when the schema cannot be
    /// applied.
    pub async fn migrate(&self) -> TaskStoreResult<()> {
        self.run_blocking(|connection| Ok(connection.batch_execute(SCHEMA_SQL)?))
            .await
    }

    async fn run_blocking<F, T>(&self, f: F) -> TaskStoreResult<T>
    where
        F: FnOnce(&mut PgConnection) -> TaskStoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut connection = pool.get().map_err(TaskStoreError::persistence)?;
            f(&mut connection)
        })
        .await
        .map_err(TaskStoreError::persistence)?
    }
}

impl From<DieselError> for TaskStoreError {
    fn from(err: DieselError) -> Self {
        Self::persistence(err)
    }
}

#[async_trait]
impl TaskStore for PostgresTaskStore {
    async fn insert_if_absent(&self, task: &Task) -> TaskStoreResult<Option<TaskId>> {
        let task_id = task.id();
        let row = to_task_row(task)?;
        self.run_blocking(move |connection| {
            let inserted = diesel::insert_into(tasks::table)
                .values(&row)
                .on_conflict(tasks::correlation_key)
                .do_nothing()
                .execute(connection)?;
            Ok((inserted == 1).then_some(task_id))
        })
        .await
    }

    async fn claim_next(
        &self,
        now: DateTime<Utc>,
        max_attempts: u32,
    ) -> TaskStoreResult<Option<ClaimedTask>> {
        let max = attempts_column(max_attempts)?;
        self.run_blocking(move |connection| {
            connection.transaction::<_, TaskStoreError, _>(|tx| {
                let row = tasks::table
                    .filter(tasks::status.eq_any(claimable_statuses()))
                    .filter(tasks::attempts.lt(max))
                    .filter(
                        tasks::next_attempt_at
                            .is_null()
                            .or(tasks::next_attempt_at.le(now)),
                    )
                    .order((tasks::created_at.asc(), tasks::id.asc()))
                    .select(TaskRow::as_select())
                    .for_update()
                    .skip_locked()
                    .first::<TaskRow>(tx)
                    .optional()?;
                row.map(|found| claim_row(tx, found, now)).transpose()
            })
        })
        .await
    }

    async fn claim(
        &self,
        task_id: TaskId,
        now: DateTime<Utc>,
        max_attempts: u32,
    ) -> TaskStoreResult<Option<ClaimedTask>> {
        let max = attempts_column(max_attempts)?;
        self.run_blocking(move |connection| {
            connection.transaction::<_, TaskStoreError, _>(|tx| {
                let row = tasks::table
                    .filter(tasks::id.eq(task_id.into_inner()))
                    .filter(tasks::status.eq_any(claimable_statuses()))
                    .filter(tasks::attempts.lt(max))
                    .filter(
                        tasks::next_attempt_at
                            .is_null()
                            .or(tasks::next_attempt_at.le(now)),
                    )
                    .select(TaskRow::as_select())
                    .for_update()
                    .skip_locked()
                    .first::<TaskRow>(tx)
                    .optional()?;
                row.map(|found| claim_row(tx, found, now)).transpose()
            })
        })
        .await
    }

    async fn apply_transition(&self, transition: &StageTransition) -> TaskStoreResult<Task> {
        let owned = transition.clone();
        self.run_blocking(move |connection| {
            connection.transaction::<_, TaskStoreError, _>(|tx| {
                let task_id = owned.task_id();
                let row = tasks::table
                    .find(task_id.into_inner())
                    .select(TaskRow::as_select())
                    .for_update()
                    .first::<TaskRow>(tx)
                    .optional()?
                    .ok_or(TaskStoreError::NotFound(task_id))?;
                let mut task = row_to_task(row)?;
                task.apply(&owned)?;
                write_task(tx, &task)?;
                Ok(task)
            })
        })
        .await
    }

    async fn get(&self, task_id: TaskId) -> TaskStoreResult<Option<Task>> {
        self.run_blocking(move |connection| {
            let row = tasks::table
                .find(task_id.into_inner())
                .select(TaskRow::as_select())
                .first::<TaskRow>(connection)
                .optional()?;
            row.map(row_to_task).transpose()
        })
        .await
    }

    async fn list_resumable(&self) -> TaskStoreResult<Vec<Task>> {
        self.run_blocking(|connection| {
            let statuses: Vec<&str> = RESUMABLE_STATUSES.map(TaskStatus::as_str).to_vec();
            tasks::table
                .filter(tasks::status.eq_any(statuses))
                .order((tasks::created_at.asc(), tasks::id.asc()))
                .select(TaskRow::as_select())
                .load::<TaskRow>(connection)?
                .into_iter()
                .map(row_to_task)
                .collect()
        })
        .await
    }

    async fn list_by_status(
        &self,
        status: TaskStatus,
        limit: usize,
    ) -> TaskStoreResult<Vec<Task>> {
        let row_limit = limit_value(limit)?;
        self.run_blocking(move |connection| {
            tasks::table
                .filter(tasks::status.eq(status.as_str()))
                .order((tasks::updated_at.desc(), tasks::id.desc()))
                .limit(row_limit)
                .select(TaskRow::as_select())
                .load::<TaskRow>(connection)?
                .into_iter()
                .map(row_to_task)
                .collect()
        })
        .await
    }

    async fn ensure_delivery(
        &self,
        task_id: TaskId,
        target: &DeliveryTarget,
        now: DateTime<Utc>,
    ) -> TaskStoreResult<Delivery> {
        let row = to_delivery_row(&Delivery::new(task_id, target.clone(), now))?;
        let target_name = target.as_str().to_owned();
        self.run_blocking(move |connection| {
            diesel::insert_into(deliveries::table)
                .values(&row)
                .on_conflict((deliveries::target, deliveries::task_id))
                .do_nothing()
                .execute(connection)
                .map_err(|err| match err {
                    DieselError::DatabaseError(DatabaseErrorKind::ForeignKeyViolation, _) => {
                        TaskStoreError::NotFound(task_id)
                    }
                    other => TaskStoreError::persistence(other),
                })?;
            let stored = deliveries::table
                .filter(deliveries::target.eq(&target_name))
                .filter(deliveries::task_id.eq(task_id.into_inner()))
                .select(DeliveryRow::as_select())
                .first::<DeliveryRow>(connection)?;
            row_to_delivery(stored)
        })
        .await
    }

    async fn claim_delivery(
        &self,
        delivery_id: DeliveryId,
        now: DateTime<Utc>,
        max_attempts: u32,
    ) -> TaskStoreResult<Option<Delivery>> {
        self.run_blocking(move |connection| {
            connection.transaction::<_, TaskStoreError, _>(|tx| {
                let row = deliveries::table
                    .find(delivery_id.into_inner())
                    .select(DeliveryRow::as_select())
                    .for_update()
                    .first::<DeliveryRow>(tx)
                    .optional()?
                    .ok_or(TaskStoreError::DeliveryNotFound(delivery_id))?;
                let mut delivery = row_to_delivery(row)?;
                if !delivery.is_due(now, max_attempts) {
                    return Ok(None);
                }
                delivery.start_attempt(now);
                write_delivery(tx, &delivery)?;
                Ok(Some(delivery))
            })
        })
        .await
    }

    async fn claim_due_deliveries(
        &self,
        targets: &[DeliveryTarget],
        now: DateTime<Utc>,
        max_attempts: u32,
        limit: usize,
    ) -> TaskStoreResult<Vec<Delivery>> {
        let max = attempts_column(max_attempts)?;
        let row_limit = limit_value(limit)?;
        let names: Vec<String> = targets.iter().map(|t| t.as_str().to_owned()).collect();
        self.run_blocking(move |connection| {
            connection.transaction::<_, TaskStoreError, _>(|tx| {
                let rows = deliveries::table
                    .filter(deliveries::target.eq_any(names))
                    .filter(deliveries::status.eq_any(vec![
                        DeliveryStatus::Pending.as_str(),
                        DeliveryStatus::Failed.as_str(),
                    ]))
                    .filter(deliveries::attempts.lt(max))
                    .filter(
                        deliveries::next_attempt_at
                            .is_null()
                            .or(deliveries::next_attempt_at.le(now)),
                    )
                    .filter(
                        deliveries::task_id.eq_any(
                            tasks::table
                                .filter(tasks::status.eq(TaskStatus::Posted.as_str()))
                                .select(tasks::id),
                        ),
                    )
                    .order((deliveries::created_at.asc(), deliveries::id.asc()))
                    .limit(row_limit)
                    .select(DeliveryRow::as_select())
                    .for_update()
                    .skip_locked()
                    .load::<DeliveryRow>(tx)?;
                let mut claimed = Vec::with_capacity(rows.len());
                for row in rows {
                    let mut delivery = row_to_delivery(row)?;
                    delivery.start_attempt(now);
                    write_delivery(tx, &delivery)?;
                    claimed.push(delivery);
                }
                Ok(claimed)
            })
        })
        .await
    }

    async fn update_delivery(&self, delivery: &Delivery) -> TaskStoreResult<()> {
        let delivery_id = delivery.id();
        let changes = to_delivery_changeset(delivery)?;
        self.run_blocking(move |connection| {
            let updated = diesel::update(deliveries::table.find(delivery_id.into_inner()))
                .set(&changes)
                .execute(connection)?;
            if updated == 0 {
                return Err(TaskStoreError::DeliveryNotFound(delivery_id));
            }
            Ok(())
        })
        .await
    }

    async fn list_deliveries(&self, task_id: TaskId) -> TaskStoreResult<Vec<Delivery>> {
        self.run_blocking(move |connection| {
            deliveries::table
                .filter(deliveries::task_id.eq(task_id.into_inner()))
                .order(deliveries::target.asc())
                .select(DeliveryRow::as_select())
                .load::<DeliveryRow>(connection)?
                .into_iter()
                .map(row_to_delivery)
                .collect()
        })
        .await
    }

    async fn list_deliveries_by_status(
        &self,
        status: DeliveryStatus,
        limit: usize,
    ) -> TaskStoreResult<Vec<Delivery>> {
        let row_limit = limit_value(limit)?;
        self.run_blocking(move |connection| {
            deliveries::table
                .filter(deliveries::status.eq(status.as_str()))
                .order((deliveries::created_at.asc(), deliveries::id.asc()))
                .limit(row_limit)
                .select(DeliveryRow::as_select())
                .load::<DeliveryRow>(connection)?
                .into_iter()
                .map(row_to_delivery)
                .collect()
        })
        .await
    }
}

fn claimable_statuses() -> Vec<&'static str> {
    vec![TaskStatus::Queued.as_str(), TaskStatus::Failed.as_str()]
}

fn attempts_column(max_attempts: u32) -> TaskStoreResult<i32> {
    i32::try_from(max_attempts).map_err(TaskStoreError::persistence)
}

fn limit_value(limit: usize) -> TaskStoreResult<i64> {
    i64::try_from(limit).map_err(TaskStoreError::persistence)
}

fn claim_row(
    connection: &mut PgConnection,
    row: TaskRow,
    now: DateTime<Utc>,
) -> TaskStoreResult<ClaimedTask> {
    let claimed = row_to_task(row)?.claim(now);
    write_task(connection, claimed.task())?;
    Ok(claimed)
}

fn write_task(connection: &mut PgConnection, task: &Task) -> TaskStoreResult<()> {
    let changes = to_task_changeset(task)?;
    diesel::update(tasks::table.find(task.id().into_inner()))
        .set(&changes)
        .execute(connection)?;
    Ok(())
}

fn write_delivery(connection: &mut PgConnection, delivery: &Delivery) -> TaskStoreResult<()> {
    let changes = to_delivery_changeset(delivery)?;
    diesel::update(deliveries::table.find(delivery.id().into_inner()))
        .set(&changes)
        .execute(connection)?;
    Ok(())
}
