//! SQLite persistence for task definitions and their run history.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use uuid::Uuid;

use super::{ScheduledTask, TaskStatus};
use crate::model::TestType;
use crate::storage::Pool;

#[derive(Clone)]
pub struct TaskStore {
    pool: Pool,
}

/// One row per fire (scheduled or manual).
#[derive(Debug, Clone, serde::Serialize)]
pub struct TaskRun {
    pub task_id: Uuid,
    pub execution_id: Option<Uuid>,
    pub status: String,
    pub summary: Option<String>,
    pub manual: bool,
    pub fired_at: DateTime<Utc>,
}

impl TaskStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn insert(&self, task: &ScheduledTask) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO scheduled_tasks
                (id, name, test_type, config_json, schedule_json, status,
                 last_run_at, next_run_at, run_count, max_runs, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                task.id.to_string(),
                task.name,
                task.test_type.to_string(),
                serde_json::to_string(&task.config)?,
                serde_json::to_string(&task.schedule)?,
                task.status.to_string(),
                task.last_run.map(|t| t.to_rfc3339()),
                task.next_run.map(|t| t.to_rfc3339()),
                task.run_count,
                task.max_runs,
                task.created_at.to_rfc3339(),
                task.updated_at.to_rfc3339(),
            ],
        )
        .with_context(|| format!("failed to insert task '{}'", task.name))?;
        Ok(())
    }

    pub fn update(&self, task: &ScheduledTask) -> Result<()> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE scheduled_tasks SET
                name = ?2, test_type = ?3, config_json = ?4, schedule_json = ?5,
                status = ?6, last_run_at = ?7, next_run_at = ?8, run_count = ?9,
                max_runs = ?10, updated_at = ?11
             WHERE id = ?1",
            params![
                task.id.to_string(),
                task.name,
                task.test_type.to_string(),
                serde_json::to_string(&task.config)?,
                serde_json::to_string(&task.schedule)?,
                task.status.to_string(),
                task.last_run.map(|t| t.to_rfc3339()),
                task.next_run.map(|t| t.to_rfc3339()),
                task.run_count,
                task.max_runs,
                task.updated_at.to_rfc3339(),
            ],
        )?;
        anyhow::ensure!(changed == 1, "task {} not found", task.id);
        Ok(())
    }

    pub fn delete(&self, id: Uuid) -> Result<bool> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "DELETE FROM scheduled_tasks WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(changed > 0)
    }

    pub fn get(&self, id: Uuid) -> Result<Option<ScheduledTask>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!("{} WHERE id = ?1", SELECT_TASK))?;
        let mut rows = stmt.query_map(params![id.to_string()], row_to_task)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    pub fn list(&self) -> Result<Vec<ScheduledTask>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!("{} ORDER BY created_at", SELECT_TASK))?;
        let rows = stmt.query_map([], row_to_task)?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row?);
        }
        Ok(tasks)
    }

    /// Active tasks whose `next_run` is at or before `now`.
    pub fn due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledTask>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE status = 'active' AND next_run_at IS NOT NULL AND next_run_at <= ?1
             ORDER BY next_run_at",
            SELECT_TASK
        ))?;
        let rows = stmt.query_map(params![now.to_rfc3339()], row_to_task)?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row?);
        }
        Ok(tasks)
    }

    pub fn record_run(
        &self,
        task_id: Uuid,
        execution_id: Option<Uuid>,
        status: &str,
        summary: Option<&str>,
        manual: bool,
    ) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO task_history (task_id, execution_id, status, summary, manual, fired_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                task_id.to_string(),
                execution_id.map(|id| id.to_string()),
                status,
                summary,
                manual,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn history(&self, task_id: Uuid, limit: usize) -> Result<Vec<TaskRun>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT task_id, execution_id, status, summary, manual, fired_at
             FROM task_history WHERE task_id = ?1 ORDER BY fired_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![task_id.to_string(), limit], |row| {
            let task_id: String = row.get(0)?;
            let execution_id: Option<String> = row.get(1)?;
            let fired_at: String = row.get(5)?;
            Ok(TaskRun {
                task_id: Uuid::parse_str(&task_id).unwrap_or_default(),
                execution_id: execution_id.and_then(|id| Uuid::parse_str(&id).ok()),
                status: row.get(2)?,
                summary: row.get(3)?,
                manual: row.get(4)?,
                fired_at: parse_timestamp(&fired_at),
            })
        })?;
        let mut runs = Vec::new();
        for row in rows {
            runs.push(row?);
        }
        Ok(runs)
    }
}

const SELECT_TASK: &str = "SELECT id, name, test_type, config_json, schedule_json, status,
       last_run_at, next_run_at, run_count, max_runs, created_at, updated_at
  FROM scheduled_tasks";

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<ScheduledTask> {
    let id: String = row.get(0)?;
    let test_type: String = row.get(2)?;
    let config_json: String = row.get(3)?;
    let schedule_json: String = row.get(4)?;
    let status: String = row.get(5)?;
    let last_run: Option<String> = row.get(6)?;
    let next_run: Option<String> = row.get(7)?;
    let created_at: String = row.get(10)?;
    let updated_at: String = row.get(11)?;

    Ok(ScheduledTask {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        name: row.get(1)?,
        test_type: test_type.parse().unwrap_or(TestType::Performance),
        config: serde_json::from_str(&config_json).unwrap_or_default(),
        schedule: serde_json::from_str(&schedule_json).unwrap_or(super::TaskSchedule::Once {
            at: Utc::now(),
        }),
        status: match status.as_str() {
            "paused" => TaskStatus::Paused,
            "completed" => TaskStatus::Completed,
            "failed" => TaskStatus::Failed,
            _ => TaskStatus::Active,
        },
        last_run: last_run.as_deref().map(parse_timestamp),
        next_run: next_run.as_deref().map(parse_timestamp),
        run_count: row.get(8)?,
        max_runs: row.get(9)?,
        created_at: parse_timestamp(&created_at),
        updated_at: parse_timestamp(&updated_at),
    })
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::TaskSchedule;
    use serde_json::json;

    fn scratch_store() -> (TaskStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.db");
        let pool = crate::storage::open_pool(path.to_str().unwrap()).unwrap();
        (TaskStore::new(pool), dir)
    }

    fn sample_task(name: &str, next_run: Option<DateTime<Utc>>) -> ScheduledTask {
        let now = Utc::now();
        ScheduledTask {
            id: Uuid::new_v4(),
            name: name.to_string(),
            test_type: TestType::Seo,
            config: json!({ "target_url": "https://example.com" }),
            schedule: TaskSchedule::Interval { every_secs: 3600, end_time: None },
            status: TaskStatus::Active,
            last_run: None,
            next_run,
            run_count: 0,
            max_runs: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_round_trip() {
        let (store, _dir) = scratch_store();
        let task = sample_task("roundtrip", Some(Utc::now()));
        store.insert(&task).unwrap();

        let loaded = store.get(task.id).unwrap().unwrap();
        assert_eq!(loaded.name, "roundtrip");
        assert_eq!(loaded.test_type, TestType::Seo);
        assert_eq!(loaded.status, TaskStatus::Active);
        assert!(matches!(loaded.schedule, TaskSchedule::Interval { every_secs: 3600, .. }));
    }

    #[test]
    fn test_due_filters_by_status_and_time() {
        let (store, _dir) = scratch_store();
        let now = Utc::now();

        let due = sample_task("due", Some(now - chrono::Duration::minutes(1)));
        let future = sample_task("future", Some(now + chrono::Duration::hours(1)));
        let mut paused = sample_task("paused", Some(now - chrono::Duration::minutes(1)));
        paused.status = TaskStatus::Paused;

        store.insert(&due).unwrap();
        store.insert(&future).unwrap();
        store.insert(&paused).unwrap();

        let found = store.due(now).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "due");
    }

    #[test]
    fn test_update_and_delete() {
        let (store, _dir) = scratch_store();
        let mut task = sample_task("mutable", Some(Utc::now()));
        store.insert(&task).unwrap();

        task.status = TaskStatus::Completed;
        task.run_count = 3;
        store.update(&task).unwrap();
        let loaded = store.get(task.id).unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Completed);
        assert_eq!(loaded.run_count, 3);

        assert!(store.delete(task.id).unwrap());
        assert!(!store.delete(task.id).unwrap());
        assert!(store.get(task.id).unwrap().is_none());
    }

    #[test]
    fn test_history_records() {
        let (store, _dir) = scratch_store();
        let task = sample_task("with-history", Some(Utc::now()));
        store.insert(&task).unwrap();

        let execution = Uuid::new_v4();
        store.record_run(task.id, Some(execution), "submitted", None, false).unwrap();
        store.record_run(task.id, None, "rejected", Some("bad config"), true).unwrap();

        let history = store.history(task.id, 10).unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().any(|run| run.execution_id == Some(execution)));
        assert!(history.iter().any(|run| run.manual));
    }
}
