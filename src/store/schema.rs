//! SQLite schema for the schedule store database.

use crate::sqlite_column;
use crate::sqlite_persistence::{Column, SqlType, Table, VersionedSchema};

// =============================================================================
// Version 1 - Job states and tick ledger
// =============================================================================

/// Job states table - one row per schedule / sensor definition.
const JOB_STATES_TABLE_V1: Table = Table {
    name: "job_states",
    columns: &[
        sqlite_column!("origin_id", &SqlType::Text, is_primary_key = true),
        sqlite_column!("repository_origin_id", &SqlType::Text, non_null = true),
        sqlite_column!("job_name", &SqlType::Text, non_null = true),
        sqlite_column!("job_type", &SqlType::Text, non_null = true),
        sqlite_column!("status", &SqlType::Text, non_null = true),
        sqlite_column!("data", &SqlType::Text, non_null = true), // JSON payload
    ],
    indices: &[("idx_job_states_repository", "repository_origin_id")],
};

/// Job ticks table - append-mostly ledger of evaluation attempts.
///
/// No foreign key to job_states: ticks outlive their job state and are only
/// removed by purge.
const JOB_TICKS_TABLE_V1: Table = Table {
    name: "job_ticks",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true), // rowid, store-assigned
        sqlite_column!("job_origin_id", &SqlType::Text, non_null = true),
        sqlite_column!("job_type", &SqlType::Text, non_null = true),
        sqlite_column!("status", &SqlType::Text, non_null = true),
        sqlite_column!("timestamp_micros", &SqlType::Integer, non_null = true),
        sqlite_column!("run_ids", &SqlType::Text, non_null = true), // JSON array
        sqlite_column!("error", &SqlType::Text),                    // JSON, failure only
    ],
    indices: &[
        (
            "idx_job_ticks_origin_timestamp",
            "job_origin_id, timestamp_micros DESC",
        ),
        ("idx_job_ticks_status", "status"),
    ],
};

/// All versioned schemas for the schedule store database.
///
/// Version 1: job_states and job_ticks tables
pub const SCHEDULE_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 1,
    tables: &[JOB_STATES_TABLE_V1, JOB_TICKS_TABLE_V1],
    migration: None, // Initial version has no migration
}];
