//! Version-tracked schema migrations for the libSQL store.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS pipeline_instances (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                priority INTEGER NOT NULL,
                state TEXT NOT NULL DEFAULT 'INITIALIZED',
                start_processing_time TEXT,
                end_processing_time TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS pipeline_stages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                instance_id INTEGER NOT NULL REFERENCES pipeline_instances(id),
                position INTEGER NOT NULL,
                module_name TEXT NOT NULL,
                min_memory_mb INTEGER NOT NULL DEFAULT 0,
                start_new_uow INTEGER NOT NULL DEFAULT 0,
                remote_execution INTEGER NOT NULL DEFAULT 0,
                units_of_work TEXT NOT NULL DEFAULT '[]',
                num_tasks INTEGER NOT NULL DEFAULT 0,
                num_submitted INTEGER NOT NULL DEFAULT 0,
                num_completed INTEGER NOT NULL DEFAULT 0,
                num_failed INTEGER NOT NULL DEFAULT 0,
                UNIQUE (instance_id, position)
            );
            CREATE INDEX IF NOT EXISTS idx_stages_instance ON pipeline_stages(instance_id);

            CREATE TABLE IF NOT EXISTS pipeline_tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                instance_id INTEGER NOT NULL REFERENCES pipeline_instances(id),
                stage_id INTEGER NOT NULL REFERENCES pipeline_stages(id),
                state TEXT NOT NULL DEFAULT 'INITIALIZED',
                worker_host TEXT,
                worker_thread INTEGER,
                software_revision TEXT,
                start_processing_time TEXT,
                end_processing_time TEXT,
                failure_count INTEGER NOT NULL DEFAULT 0,
                transition_complete INTEGER NOT NULL DEFAULT 0,
                restart_mode TEXT,
                retry INTEGER NOT NULL DEFAULT 0,
                uow TEXT NOT NULL DEFAULT 'null',
                exec_log TEXT NOT NULL DEFAULT '[]'
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_stage ON pipeline_tasks(stage_id);
            CREATE INDEX IF NOT EXISTS idx_tasks_host_state ON pipeline_tasks(worker_host, state);
        "#,
    },
    Migration {
        version: 2,
        name: "processing_attributes",
        sql: r#"
            ALTER TABLE pipeline_tasks ADD COLUMN processing_state TEXT NOT NULL DEFAULT 'INITIALIZING';
            ALTER TABLE pipeline_tasks ADD COLUMN total_subtasks INTEGER NOT NULL DEFAULT 0;
            ALTER TABLE pipeline_tasks ADD COLUMN completed_subtasks INTEGER NOT NULL DEFAULT 0;
            ALTER TABLE pipeline_tasks ADD COLUMN failed_subtasks INTEGER NOT NULL DEFAULT 0;
            ALTER TABLE pipeline_tasks ADD COLUMN summary_metrics TEXT NOT NULL DEFAULT '{}';
        "#,
    },
];

/// Apply any migrations newer than the recorded schema version.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    tracing::debug!(
        version = get_current_version(conn).await?,
        "Database migrations complete"
    );
    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => {
            let version: i64 = row.get(0).map_err(|e| {
                DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
            })?;
            Ok(version)
        }
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap();
        db.connect().unwrap()
    }

    #[tokio::test]
    async fn migrations_create_all_tables() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        for table in &[
            "pipeline_instances",
            "pipeline_stages",
            "pipeline_tasks",
            "_migrations",
        ] {
            let mut rows = conn
                .query(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    libsql::params![*table],
                )
                .await
                .unwrap();
            let row = rows.next().await.unwrap().unwrap();
            let count: i64 = row.get(0).unwrap();
            assert_eq!(count, 1, "table {table} should exist");
        }
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();

        let version = get_current_version(&conn).await.unwrap();
        assert_eq!(version, 2);
    }

    #[tokio::test]
    async fn processing_columns_added() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        conn.execute(
            "INSERT INTO pipeline_tasks (instance_id, stage_id, processing_state, summary_metrics) VALUES (1, 1, 'EXECUTING', '{\"processing_ms\":1.0}')",
            (),
        )
        .await
        .unwrap();

        let mut rows = conn
            .query("SELECT state, processing_state FROM pipeline_tasks", ())
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        let state: String = row.get(0).unwrap();
        let processing: String = row.get(1).unwrap();
        assert_eq!(state, "INITIALIZED");
        assert_eq!(processing, "EXECUTING");
    }
}
