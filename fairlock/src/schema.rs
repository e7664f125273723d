//! Spanner DDL for the two tables the lock uses.
//!
//! The statements are meant to be applied once per database, e.g. with
//! `gcloud spanner databases ddl update`, before any client connects.

/// Returns the `CREATE` statements for the lock table, the wait queue, and
/// the queue's ordering index.
pub fn ddl(locks_table: &str, queue_table: &str) -> Vec<String> {
    vec![
        format!(
            "CREATE TABLE {locks_table} (
    name STRING(MAX) NOT NULL,
    owner STRING(MAX) NOT NULL,
    priority INT64 NOT NULL,
    expires_at TIMESTAMP NOT NULL,
    token TIMESTAMP OPTIONS (allow_commit_timestamp=true),
) PRIMARY KEY (name)"
        ),
        format!(
            "CREATE TABLE {queue_table} (
    lock_name STRING(MAX) NOT NULL,
    owner STRING(MAX) NOT NULL,
    priority INT64 NOT NULL,
    requested_at TIMESTAMP NOT NULL,
    heartbeat_at TIMESTAMP NOT NULL,
) PRIMARY KEY (lock_name, owner)"
        ),
        format!(
            "CREATE INDEX {queue_table}_by_priority ON {queue_table} (lock_name, priority DESC, requested_at)"
        ),
    ]
}
