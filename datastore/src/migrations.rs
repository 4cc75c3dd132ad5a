//! Ordered, idempotent schema migrations.
//!
//! There is no migration-tracking table; idempotence comes from precondition
//! checks instead. Every step probes for the object it is about to create
//! and short-circuits to `Skipped` when it already exists, so `run_all` can
//! run on every startup. Steps are named with a sortable timestamp prefix
//! and applied in lexicographic order; the first error stops the run.

use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::sql_query;
use diesel::sql_types::{BigInt, Text};
use diesel::sqlite::SqliteConnection;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Executed,
    Skipped,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepStatus::Executed => f.write_str("executed"),
            StepStatus::Skipped => f.write_str("skipped"),
        }
    }
}

pub type MigrationFn = fn(&mut SqliteConnection) -> QueryResult<StepStatus>;

pub struct Migration {
    pub name: &'static str,
    pub up: MigrationFn,
    pub down: MigrationFn,
}

/// All migrations in apply order.
pub fn all() -> Vec<Migration> {
    let mut migrations = vec![
        Migration {
            name: "20240312093000_create_accounts",
            up: create_accounts_up,
            down: create_accounts_down,
        },
        Migration {
            name: "20240312094500_create_api_keys",
            up: create_api_keys_up,
            down: create_api_keys_down,
        },
        Migration {
            name: "20240405110000_create_sessions",
            up: create_sessions_up,
            down: create_sessions_down,
        },
        Migration {
            name: "20240508121500_create_usage_metrics",
            up: create_usage_metrics_up,
            down: create_usage_metrics_down,
        },
        Migration {
            name: "20240611083000_api_keys_last_used_at",
            up: api_keys_last_used_at_up,
            down: api_keys_last_used_at_down,
        },
        Migration {
            name: "20240702154500_sessions_account_cascade",
            up: sessions_account_cascade_up,
            down: sessions_account_cascade_down,
        },
    ];
    // Files are discovered in directory order upstream; keep the invariant
    // here even though the literal list is already sorted.
    migrations.sort_by_key(|m| m.name);
    migrations
}

/// Runs every `up` step in order, stopping at the first error.
pub fn run_all(
    conn: &mut SqliteConnection,
) -> QueryResult<Vec<(&'static str, StepStatus)>> {
    let mut results = Vec::new();
    for migration in all() {
        let status = (migration.up)(conn)?;
        results.push((migration.name, status));
    }
    Ok(results)
}

// ---------------------------------------------------------------------------
// Precondition helpers
// ---------------------------------------------------------------------------

#[derive(QueryableByName)]
struct CountRow {
    #[diesel(sql_type = BigInt)]
    n: i64,
}

pub fn table_exists(conn: &mut SqliteConnection, name: &str) -> QueryResult<bool> {
    sql_query("SELECT COUNT(*) AS n FROM sqlite_master WHERE type = 'table' AND name = ?")
        .bind::<Text, _>(name)
        .get_result::<CountRow>(conn)
        .map(|row| row.n > 0)
}

pub fn column_exists(
    conn: &mut SqliteConnection,
    table: &str,
    column: &str,
) -> QueryResult<bool> {
    sql_query("SELECT COUNT(*) AS n FROM pragma_table_info(?) WHERE name = ?")
        .bind::<Text, _>(table)
        .bind::<Text, _>(column)
        .get_result::<CountRow>(conn)
        .map(|row| row.n > 0)
}

pub fn index_exists(conn: &mut SqliteConnection, name: &str) -> QueryResult<bool> {
    sql_query("SELECT COUNT(*) AS n FROM sqlite_master WHERE type = 'index' AND name = ?")
        .bind::<Text, _>(name)
        .get_result::<CountRow>(conn)
        .map(|row| row.n > 0)
}

pub fn trigger_exists(conn: &mut SqliteConnection, name: &str) -> QueryResult<bool> {
    sql_query("SELECT COUNT(*) AS n FROM sqlite_master WHERE type = 'trigger' AND name = ?")
        .bind::<Text, _>(name)
        .get_result::<CountRow>(conn)
        .map(|row| row.n > 0)
}

/// `table` and `predicate` come from migration code, never from input.
pub fn row_exists(
    conn: &mut SqliteConnection,
    table: &str,
    predicate: &str,
) -> QueryResult<bool> {
    sql_query(format!(
        "SELECT COUNT(*) AS n FROM (SELECT 1 FROM {table} WHERE {predicate} LIMIT 1)"
    ))
    .get_result::<CountRow>(conn)
    .map(|row| row.n > 0)
}

pub fn table_is_empty(conn: &mut SqliteConnection, table: &str) -> QueryResult<bool> {
    row_exists(conn, table, "1 = 1").map(|any| !any)
}

// ---------------------------------------------------------------------------
// 20240312093000_create_accounts
// ---------------------------------------------------------------------------

fn create_accounts_up(conn: &mut SqliteConnection) -> QueryResult<StepStatus> {
    if table_exists(conn, "accounts")? {
        return Ok(StepStatus::Skipped);
    }
    conn.batch_execute(
        "CREATE TABLE accounts (
            id TEXT PRIMARY KEY NOT NULL,
            email TEXT NOT NULL UNIQUE,
            plan_name TEXT NOT NULL DEFAULT 'Free',
            token_remaining BIGINT NOT NULL DEFAULT 0,
            topup_remaining BIGINT NOT NULL DEFAULT 0,
            status INTEGER NOT NULL DEFAULT 1,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        );
        CREATE INDEX idx_accounts_email ON accounts(email);
        CREATE INDEX idx_accounts_status ON accounts(status);",
    )?;
    Ok(StepStatus::Executed)
}

fn create_accounts_down(conn: &mut SqliteConnection) -> QueryResult<StepStatus> {
    if !table_exists(conn, "accounts")? {
        return Ok(StepStatus::Skipped);
    }
    conn.batch_execute("DROP TABLE accounts;")?;
    Ok(StepStatus::Executed)
}

// ---------------------------------------------------------------------------
// 20240312094500_create_api_keys
// ---------------------------------------------------------------------------

fn create_api_keys_up(conn: &mut SqliteConnection) -> QueryResult<StepStatus> {
    if table_exists(conn, "api_keys")? {
        return Ok(StepStatus::Skipped);
    }
    conn.batch_execute(
        "CREATE TABLE api_keys (
            key_hash TEXT PRIMARY KEY NOT NULL,
            account_id TEXT NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
            key_indicator TEXT NOT NULL,
            label TEXT NOT NULL,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            expires_at TIMESTAMP
        );
        CREATE INDEX idx_api_keys_account_id ON api_keys(account_id);",
    )?;
    Ok(StepStatus::Executed)
}

fn create_api_keys_down(conn: &mut SqliteConnection) -> QueryResult<StepStatus> {
    if !table_exists(conn, "api_keys")? {
        return Ok(StepStatus::Skipped);
    }
    conn.batch_execute("DROP TABLE api_keys;")?;
    Ok(StepStatus::Executed)
}

// ---------------------------------------------------------------------------
// 20240405110000_create_sessions
// ---------------------------------------------------------------------------

fn create_sessions_up(conn: &mut SqliteConnection) -> QueryResult<StepStatus> {
    if table_exists(conn, "sessions")? {
        return Ok(StepStatus::Skipped);
    }
    conn.batch_execute(
        "CREATE TABLE sessions (
            account_id TEXT NOT NULL,
            session_id TEXT NOT NULL,
            kind TEXT NOT NULL CHECK (kind IN ('SESSION', 'CONV')),
            data TEXT NOT NULL,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            PRIMARY KEY (account_id, session_id, kind)
        );
        CREATE INDEX idx_sessions_created_at ON sessions(created_at);",
    )?;
    Ok(StepStatus::Executed)
}

fn create_sessions_down(conn: &mut SqliteConnection) -> QueryResult<StepStatus> {
    if !table_exists(conn, "sessions")? {
        return Ok(StepStatus::Skipped);
    }
    conn.batch_execute("DROP TABLE sessions;")?;
    Ok(StepStatus::Executed)
}

// ---------------------------------------------------------------------------
// 20240508121500_create_usage_metrics
// ---------------------------------------------------------------------------

fn create_usage_metrics_up(conn: &mut SqliteConnection) -> QueryResult<StepStatus> {
    if table_exists(conn, "usage_metrics")? {
        // The composite index shipped later than the table; backfill it.
        if !index_exists(conn, "idx_usage_metrics_account_created")? {
            conn.batch_execute(
                "CREATE INDEX idx_usage_metrics_account_created
                 ON usage_metrics(account_id, created_at);",
            )?;
            return Ok(StepStatus::Executed);
        }
        return Ok(StepStatus::Skipped);
    }
    conn.batch_execute(
        "CREATE TABLE usage_metrics (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            account_id TEXT NOT NULL,
            session_id TEXT NOT NULL,
            provider TEXT NOT NULL,
            input_tokens BIGINT NOT NULL,
            output_tokens BIGINT NOT NULL,
            total_tokens BIGINT NOT NULL,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        );
        CREATE INDEX idx_usage_metrics_account_id ON usage_metrics(account_id);
        CREATE INDEX idx_usage_metrics_provider ON usage_metrics(provider);
        CREATE INDEX idx_usage_metrics_created_at ON usage_metrics(created_at);
        CREATE INDEX idx_usage_metrics_account_created
            ON usage_metrics(account_id, created_at);",
    )?;
    Ok(StepStatus::Executed)
}

fn create_usage_metrics_down(conn: &mut SqliteConnection) -> QueryResult<StepStatus> {
    if !table_exists(conn, "usage_metrics")? {
        return Ok(StepStatus::Skipped);
    }
    if !table_is_empty(conn, "usage_metrics")? {
        // The usage log is an audit trail; refuse to roll it away silently.
        warn!("usage_metrics is not empty, leaving table in place");
        return Ok(StepStatus::Skipped);
    }
    conn.batch_execute("DROP TABLE usage_metrics;")?;
    Ok(StepStatus::Executed)
}

// ---------------------------------------------------------------------------
// 20240611083000_api_keys_last_used_at
// ---------------------------------------------------------------------------

fn api_keys_last_used_at_up(conn: &mut SqliteConnection) -> QueryResult<StepStatus> {
    if column_exists(conn, "api_keys", "last_used_at")? {
        return Ok(StepStatus::Skipped);
    }
    conn.batch_execute("ALTER TABLE api_keys ADD COLUMN last_used_at TIMESTAMP;")?;
    Ok(StepStatus::Executed)
}

fn api_keys_last_used_at_down(conn: &mut SqliteConnection) -> QueryResult<StepStatus> {
    if !column_exists(conn, "api_keys", "last_used_at")? {
        return Ok(StepStatus::Skipped);
    }
    conn.batch_execute("ALTER TABLE api_keys DROP COLUMN last_used_at;")?;
    Ok(StepStatus::Executed)
}

// ---------------------------------------------------------------------------
// 20240702154500_sessions_account_cascade
// ---------------------------------------------------------------------------

// sessions carries no foreign key (the composite primary key predates the
// accounts table in the original schema), so account deletion is tidied up
// by trigger instead.

fn sessions_account_cascade_up(conn: &mut SqliteConnection) -> QueryResult<StepStatus> {
    if trigger_exists(conn, "trg_sessions_account_cascade")? {
        return Ok(StepStatus::Skipped);
    }
    conn.batch_execute(
        "CREATE TRIGGER trg_sessions_account_cascade
         AFTER DELETE ON accounts
         BEGIN
             DELETE FROM sessions WHERE account_id = OLD.id;
         END;",
    )?;
    Ok(StepStatus::Executed)
}

fn sessions_account_cascade_down(conn: &mut SqliteConnection) -> QueryResult<StepStatus> {
    if !trigger_exists(conn, "trg_sessions_account_cascade")? {
        return Ok(StepStatus::Skipped);
    }
    conn.batch_execute("DROP TRIGGER trg_sessions_account_cascade;")?;
    Ok(StepStatus::Executed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_conn() -> SqliteConnection {
        SqliteConnection::establish(":memory:").expect("in-memory connection")
    }

    #[test]
    fn test_run_all_executes_then_skips() {
        let mut conn = fresh_conn();

        let first = run_all(&mut conn).unwrap();
        assert!(first.iter().all(|(_, s)| *s == StepStatus::Executed));

        let second = run_all(&mut conn).unwrap();
        assert_eq!(first.len(), second.len());
        assert!(
            second.iter().all(|(_, s)| *s == StepStatus::Skipped),
            "second run must be a no-op: {second:?}"
        );
    }

    #[test]
    fn test_migrations_are_lexicographically_ordered() {
        let names: Vec<_> = all().iter().map(|m| m.name).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }

    #[test]
    fn test_precondition_helpers() {
        let mut conn = fresh_conn();
        run_all(&mut conn).unwrap();

        assert!(table_exists(&mut conn, "accounts").unwrap());
        assert!(!table_exists(&mut conn, "nope").unwrap());

        assert!(column_exists(&mut conn, "api_keys", "last_used_at").unwrap());
        assert!(!column_exists(&mut conn, "api_keys", "plaintext").unwrap());

        assert!(index_exists(&mut conn, "idx_usage_metrics_account_created").unwrap());
        assert!(!index_exists(&mut conn, "idx_missing").unwrap());

        assert!(trigger_exists(&mut conn, "trg_sessions_account_cascade").unwrap());
        assert!(!trigger_exists(&mut conn, "trg_missing").unwrap());

        assert!(table_is_empty(&mut conn, "accounts").unwrap());
        assert!(!row_exists(&mut conn, "accounts", "status = 1").unwrap());
    }

    #[test]
    fn test_down_steps_skip_when_absent() {
        let mut conn = fresh_conn();
        // Nothing created yet: every down is a skip.
        for migration in all().iter().rev() {
            assert_eq!((migration.down)(&mut conn).unwrap(), StepStatus::Skipped);
        }
    }

    #[test]
    fn test_down_then_up_round_trip() {
        let mut conn = fresh_conn();
        run_all(&mut conn).unwrap();

        for migration in all().iter().rev() {
            (migration.down)(&mut conn).unwrap();
        }
        assert!(!table_exists(&mut conn, "accounts").unwrap());

        let again = run_all(&mut conn).unwrap();
        assert!(again.iter().all(|(_, s)| *s == StepStatus::Executed));
    }

    #[test]
    fn test_usage_metrics_down_preserves_data() {
        let mut conn = fresh_conn();
        run_all(&mut conn).unwrap();

        conn.batch_execute(
            "INSERT INTO usage_metrics
                 (account_id, session_id, provider, input_tokens, output_tokens, total_tokens)
             VALUES ('a', 's', 'OPENAI', 1, 2, 3);",
        )
        .unwrap();

        assert_eq!(
            create_usage_metrics_down(&mut conn).unwrap(),
            StepStatus::Skipped
        );
        assert!(table_exists(&mut conn, "usage_metrics").unwrap());
    }

    #[test]
    fn test_index_backfill_when_table_predates_it() {
        let mut conn = fresh_conn();
        conn.batch_execute(
            "CREATE TABLE usage_metrics (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id TEXT NOT NULL,
                session_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                input_tokens BIGINT NOT NULL,
                output_tokens BIGINT NOT NULL,
                total_tokens BIGINT NOT NULL,
                created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
            );",
        )
        .unwrap();

        assert_eq!(
            create_usage_metrics_up(&mut conn).unwrap(),
            StepStatus::Executed
        );
        assert!(index_exists(&mut conn, "idx_usage_metrics_account_created").unwrap());
        assert_eq!(
            create_usage_metrics_up(&mut conn).unwrap(),
            StepStatus::Skipped
        );
    }
}
