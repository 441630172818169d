//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS scheduled_tasks (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            test_type TEXT NOT NULL,
            config_json TEXT NOT NULL,
            schedule_json TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'active',
            last_run_at TEXT,
            next_run_at TEXT,
            run_count INTEGER NOT NULL DEFAULT 0,
            max_runs INTEGER,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS task_history (
            id INTEGER PRIMARY KEY,
            task_id TEXT NOT NULL,
            execution_id TEXT,
            status TEXT NOT NULL,
            summary TEXT,
            manual INTEGER NOT NULL DEFAULT 0,
            fired_at TEXT NOT NULL,
            FOREIGN KEY (task_id) REFERENCES scheduled_tasks(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_tasks_status_next_run
            ON scheduled_tasks(status, next_run_at);
        CREATE INDEX IF NOT EXISTS idx_task_history_task
            ON task_history(task_id, fired_at);",
    )?;

    Ok(())
}
