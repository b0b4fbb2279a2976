//! Database schema constants.
//!
//! This module contains the SQL schema definitions for the PostgreSQL
//! result store.

/// Current state of every task.
pub const CREATE_TASK_RESULTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS task_results (
    task_id UUID PRIMARY KEY,
    task_name VARCHAR(255) NOT NULL,
    queue VARCHAR(255) NOT NULL,
    status VARCHAR(16) NOT NULL,
    value JSONB,
    error TEXT,
    retries INTEGER NOT NULL DEFAULT 0,
    worker_id VARCHAR(255),
    task JSONB NOT NULL,
    enqueued BOOLEAN NOT NULL DEFAULT FALSE,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    started_at TIMESTAMPTZ,
    finished_at TIMESTAMPTZ,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// Append-only status history; `seq` doubles as the monitor feed cursor.
pub const CREATE_TASK_TRANSITIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS task_transitions (
    seq BIGSERIAL PRIMARY KEY,
    task_id UUID NOT NULL REFERENCES task_results(task_id) ON DELETE CASCADE,
    task_name VARCHAR(255) NOT NULL,
    from_status VARCHAR(16),
    to_status VARCHAR(16) NOT NULL,
    worker_id VARCHAR(255),
    detail TEXT,
    at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// SHA-256 digests of producer idempotency keys.
pub const CREATE_IDEMPOTENCY_KEYS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS idempotency_keys (
    key_hash CHAR(64) PRIMARY KEY,
    task_id UUID NOT NULL REFERENCES task_results(task_id) ON DELETE CASCADE,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// Beat entry bookkeeping.
pub const CREATE_SCHEDULE_STATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS schedule_state (
    entry VARCHAR(255) PRIMARY KEY,
    last_run_at TIMESTAMPTZ,
    next_run_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// Outcome of each period synchronisation.
pub const CREATE_SYNC_LOG_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS sync_log (
    id BIGSERIAL PRIMARY KEY,
    period_type VARCHAR(16) NOT NULL,
    last_sync_at TIMESTAMPTZ NOT NULL,
    period_start TIMESTAMPTZ NOT NULL,
    period_end TIMESTAMPTZ NOT NULL,
    success BOOLEAN NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// Snapshot event days pushed to the data source.
pub const CREATE_EVENT_LOG_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS event_log (
    id BIGSERIAL PRIMARY KEY,
    event_date DATE NOT NULL,
    success BOOLEAN NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

pub const CREATE_INDEX_RESULTS_STATUS: &str =
    "CREATE INDEX IF NOT EXISTS idx_task_results_status ON task_results(status)";

pub const CREATE_INDEX_RESULTS_UNENQUEUED: &str = "CREATE INDEX IF NOT EXISTS idx_task_results_unenqueued ON task_results(created_at) WHERE NOT enqueued";

pub const CREATE_INDEX_TRANSITIONS_TASK: &str =
    "CREATE INDEX IF NOT EXISTS idx_task_transitions_task_id ON task_transitions(task_id, seq)";

pub const CREATE_INDEX_SYNC_LOG_PERIOD: &str = "CREATE INDEX IF NOT EXISTS idx_sync_log_period ON sync_log(period_type, success, last_sync_at)";

pub const CREATE_INDEX_EVENT_LOG_DATE: &str =
    "CREATE INDEX IF NOT EXISTS idx_event_log_date ON event_log(success, event_date)";

/// Trigger text of the persisted slots. Rows written before the column
/// existed keep an empty trigger.
pub const ADD_SCHEDULE_STATE_TRIGGER: &str =
    "ALTER TABLE schedule_state ADD COLUMN IF NOT EXISTS trigger_spec TEXT NOT NULL DEFAULT ''";

/// Returns all schema creation statements in the correct order.
///
/// Migrations are named by position, so new statements go at the end.
pub fn all_schema_statements() -> Vec<&'static str> {
    vec![
        CREATE_TASK_RESULTS_TABLE,
        CREATE_TASK_TRANSITIONS_TABLE,
        CREATE_IDEMPOTENCY_KEYS_TABLE,
        CREATE_SCHEDULE_STATE_TABLE,
        CREATE_SYNC_LOG_TABLE,
        CREATE_INDEX_RESULTS_STATUS,
        CREATE_INDEX_RESULTS_UNENQUEUED,
        CREATE_INDEX_TRANSITIONS_TASK,
        CREATE_INDEX_SYNC_LOG_PERIOD,
        CREATE_EVENT_LOG_TABLE,
        CREATE_INDEX_EVENT_LOG_DATE,
        ADD_SCHEDULE_STATE_TRIGGER,
    ]
}

/// Table names in the schema, in creation order.
pub mod tables {
    pub const TASK_RESULTS: &str = "task_results";
    pub const TASK_TRANSITIONS: &str = "task_transitions";
    pub const IDEMPOTENCY_KEYS: &str = "idempotency_keys";
    pub const SCHEDULE_STATE: &str = "schedule_state";
    pub const SYNC_LOG: &str = "sync_log";
    pub const EVENT_LOG: &str = "event_log";

    /// All engine tables, parents first.
    pub const ALL: [&str; 6] = [
        TASK_RESULTS,
        TASK_TRANSITIONS,
        IDEMPOTENCY_KEYS,
        SCHEDULE_STATE,
        SYNC_LOG,
        EVENT_LOG,
    ];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_schema_statements_order() {
        let statements = all_schema_statements();
        assert_eq!(statements.len(), 12);
        // task_results must come first (other tables reference it)
        assert!(statements[0].contains("task_results"));
        // Each index comes after the table it covers
        for (idx, statement) in statements.iter().enumerate() {
            if !statement.starts_with("CREATE INDEX") {
                continue;
            }
            if let Some(on) = statement.split(" ON ").nth(1) {
                let table = on.split('(').next().unwrap_or_default();
                let ddl = format!("CREATE TABLE IF NOT EXISTS {} ", table);
                assert!(
                    statements[..idx].iter().any(|s| s.contains(&ddl)),
                    "index before table {}",
                    table
                );
            }
        }
    }

    #[test]
    fn test_every_table_is_created() {
        let statements = all_schema_statements();
        for table in tables::ALL {
            let ddl = format!("CREATE TABLE IF NOT EXISTS {} ", table);
            assert!(
                statements.iter().any(|s| s.contains(&ddl)),
                "missing DDL for {}",
                table
            );
        }
    }
}
