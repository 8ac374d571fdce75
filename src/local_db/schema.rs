//! SQLite layout of the local store
//!
//! Migrations are numbered statement lists applied in order inside one
//! transaction each. `schema_migrations` records which ones have run.

/// Bookkeeping table, created before anything else
pub const CREATE_MIGRATIONS_TABLE: &str = "CREATE TABLE IF NOT EXISTS schema_migrations (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL
)";

const ENTRIES_V1: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS local_entries (
        key TEXT PRIMARY KEY NOT NULL,
        value_kind TEXT NOT NULL,
        value BLOB NOT NULL,
        stored_at TEXT NOT NULL,
        expires_at TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_local_entries_expires_at ON local_entries (expires_at)",
];

/// Every migration, ascending by version
pub const MIGRATIONS: &[(i32, &[&str])] = &[(1, ENTRIES_V1)];

/// Highest version this build knows about
pub fn latest_version() -> i32 {
    MIGRATIONS.last().map_or(0, |(version, _)| *version)
}

/// Migrations newer than `applied`, in the order they must run
pub fn pending_migrations(applied: i32) -> impl Iterator<Item = (i32, &'static [&'static str])> {
    MIGRATIONS
        .iter()
        .copied()
        .filter(move |(version, _)| *version > applied)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_database_runs_everything() {
        let versions: Vec<i32> = pending_migrations(0).map(|(v, _)| v).collect();
        assert_eq!(versions, vec![1]);
        assert_eq!(latest_version(), 1);
    }

    #[test]
    fn test_current_database_runs_nothing() {
        assert_eq!(pending_migrations(latest_version()).count(), 0);
    }

    #[test]
    fn test_versions_ascend_and_have_statements() {
        for pair in MIGRATIONS.windows(2) {
            assert!(pair[0].0 < pair[1].0);
        }
        assert!(MIGRATIONS.iter().all(|(_, statements)| !statements.is_empty()));
    }
}
