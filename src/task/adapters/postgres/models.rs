//! Diesel row models and conversions for task persistence.

use super::schema::{deliveries, tasks};
use crate::task::{
    domain::{
        CorrelationKey, Delivery, DeliveryId, DeliveryStatus, DeliveryTarget, PayloadRef,
        PersistedDeliveryData, PersistedTaskData, Task, TaskId, TaskKind, TaskStatus,
    },
    ports::{TaskStoreError, TaskStoreResult},
};
use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde_json::Value;

/// Task table row.
#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = tasks)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct TaskRow {
    pub id: uuid::Uuid,
    pub correlation_key: String,
    pub kind: String,
    pub payload: Value,
    pub caption: Option<String>,
    pub status: String,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub src_path: Option<String>,
    pub prepared_path: Option<String>,
    pub external_post_id: Option<String>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Mutable task columns. `None` writes `NULL`.
#[derive(Debug, Clone, AsChangeset)]
#[diesel(table_name = tasks)]
#[diesel(treat_none_as_null = true)]
pub struct TaskChangeset {
    pub status: String,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub src_path: Option<String>,
    pub prepared_path: Option<String>,
    pub external_post_id: Option<String>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Delivery table row.
#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = deliveries)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct DeliveryRow {
    pub id: uuid::Uuid,
    pub task_id: uuid::Uuid,
    pub target: String,
    pub status: String,
    pub attempts: i32,
    pub external_id: Option<String>,
    pub error: Option<String>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Mutable delivery columns. `None` writes `NULL`.
#[derive(Debug, Clone, AsChangeset)]
#[diesel(table_name = deliveries)]
#[diesel(treat_none_as_null = true)]
pub struct DeliveryChangeset {
    pub status: String,
    pub attempts: i32,
    pub external_id: Option<String>,
    pub error: Option<String>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

pub fn to_task_row(task: &Task) -> TaskStoreResult<TaskRow> {
    let payload = serde_json::to_value(task.payload()).map_err(TaskStoreError::persistence)?;
    let changes = to_task_changeset(task)?;
    Ok(TaskRow {
        id: task.id().into_inner(),
        correlation_key: task.correlation_key().as_str().to_owned(),
        kind: task.kind().as_str().to_owned(),
        payload,
        caption: task.caption().map(str::to_owned),
        status: changes.status,
        attempts: changes.attempts,
        last_error: changes.last_error,
        src_path: changes.src_path,
        prepared_path: changes.prepared_path,
        external_post_id: changes.external_post_id,
        next_attempt_at: changes.next_attempt_at,
        created_at: task.created_at(),
        updated_at: changes.updated_at,
    })
}

pub fn to_task_changeset(task: &Task) -> TaskStoreResult<TaskChangeset> {
    Ok(TaskChangeset {
        status: task.status().as_str().to_owned(),
        attempts: i32::try_from(task.attempts()).map_err(TaskStoreError::persistence)?,
        last_error: task.last_error().map(str::to_owned),
        src_path: task.src_path().map(ToString::to_string),
        prepared_path: task.prepared_path().map(ToString::to_string),
        external_post_id: task.external_post_id().map(str::to_owned),
        next_attempt_at: task.next_attempt_at(),
        updated_at: task.updated_at(),
    })
}

pub fn row_to_task(row: TaskRow) -> TaskStoreResult<Task> {
    let TaskRow {
        id,
        correlation_key,
        kind,
        payload,
        caption,
        status,
        attempts,
        last_error,
        src_path,
        prepared_path,
        external_post_id,
        next_attempt_at,
        created_at,
        updated_at,
    } = row;

    let data = PersistedTaskData {
        id: TaskId::from_uuid(id),
        correlation_key: CorrelationKey::new(correlation_key)?,
        kind: TaskKind::try_from(kind.as_str()).map_err(TaskStoreError::persistence)?,
        payload: serde_json::from_value::<PayloadRef>(payload)
            .map_err(TaskStoreError::persistence)?,
        caption,
        status: TaskStatus::try_from(status.as_str()).map_err(TaskStoreError::persistence)?,
        attempts: u32::try_from(attempts).map_err(TaskStoreError::persistence)?,
        last_error,
        src_path: src_path.map(Utf8PathBuf::from),
        prepared_path: prepared_path.map(Utf8PathBuf::from),
        external_post_id,
        next_attempt_at,
        created_at,
        updated_at,
    };
    Ok(Task::from_persisted(data))
}

pub fn to_delivery_row(delivery: &Delivery) -> TaskStoreResult<DeliveryRow> {
    let changes = to_delivery_changeset(delivery)?;
    Ok(DeliveryRow {
        id: delivery.id().into_inner(),
        task_id: delivery.task_id().into_inner(),
        target: delivery.target().as_str().to_owned(),
        status: changes.status,
        attempts: changes.attempts,
        external_id: changes.external_id,
        error: changes.error,
        next_attempt_at: changes.next_attempt_at,
        created_at: delivery.created_at(),
        updated_at: changes.updated_at,
    })
}

pub fn to_delivery_changeset(delivery: &Delivery) -> TaskStoreResult<DeliveryChangeset> {
    Ok(DeliveryChangeset {
        status: delivery.status().as_str().to_owned(),
        attempts: i32::try_from(delivery.attempts()).map_err(TaskStoreError::persistence)?,
        external_id: delivery.external_id().map(str::to_owned),
        error: delivery.error().map(str::to_owned),
        next_attempt_at: delivery.next_attempt_at(),
        updated_at: delivery.updated_at(),
    })
}

pub fn row_to_delivery(row: DeliveryRow) -> TaskStoreResult<Delivery> {
    let data = PersistedDeliveryData {
        id: DeliveryId::from_uuid(row.id),
        task_id: TaskId::from_uuid(row.task_id),
        target: DeliveryTarget::new(row.target)?,
        status: DeliveryStatus::try_from(row.status.as_str())
            .map_err(TaskStoreError::persistence)?,
        attempts: u32::try_from(row.attempts).map_err(TaskStoreError::persistence)?,
        external_id: row.external_id,
        error: row.error,
        next_attempt_at: row.next_attempt_at,
        created_at: row.created_at,
        updated_at: row.updated_at,
    };
    Ok(Delivery::from_persisted(data))
}
