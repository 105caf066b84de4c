//! Diesel schema for task and delivery persistence.

diesel::table! {
    /// Relay tasks and their stage artifacts.
    tasks (id) {
        /// Task identifier.
        id -> Uuid,
        /// Deduplication key, unique.
        #[max_length = 512]
        correlation_key -> Varchar,
        /// Content kind.
        #[max_length = 16]
        kind -> Varchar,
        /// Payload reference JSON.
        payload -> Jsonb,
        /// Caption passed to the publisher.
        caption -> Nullable<Text>,
        /// Processing status.
        #[max_length = 32]
        status -> Varchar,
        /// Claim count.
        attempts -> Int4,
        /// Most recent failure message.
        last_error -> Nullable<Text>,
        /// Stored source artifact.
        src_path -> Nullable<Text>,
        /// Stored prepared artifact.
        prepared_path -> Nullable<Text>,
        /// Publisher-assigned identifier.
        external_post_id -> Nullable<Text>,
        /// Earliest time the task may be claimed again.
        next_attempt_at -> Nullable<Timestamptz>,
        /// Creation timestamp.
        created_at -> Timestamptz,
        /// Last update timestamp.
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    /// Publish and side-effect deliveries, one per target and task.
    deliveries (id) {
        /// Delivery identifier.
        id -> Uuid,
        /// Owning task.
        task_id -> Uuid,
        /// Destination name.
        #[max_length = 128]
        target -> Varchar,
        /// Delivery status.
        #[max_length = 16]
        status -> Varchar,
        /// Attempt count.
        attempts -> Int4,
        /// Identifier assigned by the destination.
        external_id -> Nullable<Text>,
        /// Last failure message.
        error -> Nullable<Text>,
        /// Earliest retry time.
        next_attempt_at -> Nullable<Timestamptz>,
        /// Creation timestamp.
        created_at -> Timestamptz,
        /// Last update timestamp.
        updated_at -> Timestamptz,
    }
}

diesel::joinable!(deliveries -> tasks (task_id));
diesel::allow_tables_to_appear_in_same_query!(tasks, deliveries);
