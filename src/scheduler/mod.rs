//! Recurring-schedule subsystem.
//!
//! A `ScheduledTask` is a durable definition that produces new, independent
//! executions over time; tasks and executions are one-to-many and never
//! merged. The scheduler exclusively owns task definitions (persisted in
//! SQLite) and calls the engine's submit operation when a task is due.

pub mod cron;
pub mod engine;
pub mod profiles;
pub mod store;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::{Orchestrator, SubmitOptions};
use crate::model::TestType;
use crate::storage::Pool;
use crate::validate::validate_config;

use self::store::TaskStore;

pub use self::engine::run_scheduler_loop;

/// When a task fires: a single shot, a fixed interval, or a cron
/// expression (seconds-resolution fields, UTC).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskSchedule {
    Once {
        at: DateTime<Utc>,
    },
    Interval {
        every_secs: u64,
        #[serde(default)]
        end_time: Option<DateTime<Utc>>,
    },
    Cron {
        expr: String,
        #[serde(default)]
        end_time: Option<DateTime<Utc>>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Active,
    Paused,
    Completed,
    Failed,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Active => write!(f, "active"),
            TaskStatus::Paused => write!(f, "paused"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A durable task definition.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduledTask {
    pub id: Uuid,
    pub name: String,
    pub test_type: TestType,
    pub config: Value,
    pub schedule: TaskSchedule,
    pub status: TaskStatus,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub run_count: u32,
    pub max_runs: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Definition of a task to create.
#[derive(Debug, Clone, Deserialize)]
pub struct NewTask {
    pub name: String,
    pub test_type: TestType,
    pub config: Value,
    pub schedule: TaskSchedule,
    #[serde(default)]
    pub max_runs: Option<u32>,
}

/// Partial update; absent fields keep their current value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskUpdate {
    pub name: Option<String>,
    pub config: Option<Value>,
    pub schedule: Option<TaskSchedule>,
    #[serde(default, with = "double_option")]
    pub max_runs: Option<Option<u32>>,
}

// Distinguishes "leave max_runs alone" (absent) from "clear it" (null).
mod double_option {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Option<u32>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<u32>::deserialize(deserializer).map(Some)
    }
}

#[derive(Clone)]
pub struct Scheduler {
    store: TaskStore,
    engine: Orchestrator,
}

impl Scheduler {
    pub fn new(pool: Pool, engine: Orchestrator) -> Self {
        Self {
            store: TaskStore::new(pool),
            engine,
        }
    }

    /// Create a task. The schedule and the test config are both validated
    /// here; the first `next_run` is computed from now.
    pub async fn create_task(&self, new: NewTask) -> Result<ScheduledTask> {
        cron::validate_schedule(&new.schedule)?;
        validate_config(new.test_type, &new.config)
            .with_context(|| format!("task '{}' has an invalid config", new.name))?;

        let now = Utc::now();
        let task = ScheduledTask {
            id: Uuid::new_v4(),
            name: new.name,
            test_type: new.test_type,
            config: new.config,
            schedule: new.schedule.clone(),
            status: TaskStatus::Active,
            last_run: None,
            next_run: cron::initial_next_run(&new.schedule, now),
            run_count: 0,
            max_runs: new.max_runs,
            created_at: now,
            updated_at: now,
        };
        self.store.insert(&task)?;
        info!(task = %task.name, next_run = ?task.next_run, "task created");
        Ok(task)
    }

    pub async fn update_task(&self, id: Uuid, update: TaskUpdate) -> Result<ScheduledTask> {
        let mut task = self.require(id)?;

        if let Some(name) = update.name {
            task.name = name;
        }
        if let Some(config) = update.config {
            validate_config(task.test_type, &config)
                .with_context(|| format!("task '{}' has an invalid config", task.name))?;
            task.config = config;
        }
        if let Some(schedule) = update.schedule {
            cron::validate_schedule(&schedule)?;
            task.schedule = schedule;
            task.next_run = cron::initial_next_run(&task.schedule, Utc::now());
        }
        if let Some(max_runs) = update.max_runs {
            task.max_runs = max_runs;
        }
        task.updated_at = Utc::now();
        self.store.update(&task)?;
        Ok(task)
    }

    pub async fn delete_task(&self, id: Uuid) -> Result<()> {
        if !self.store.delete(id)? {
            bail!("task {} not found", id);
        }
        Ok(())
    }

    /// Stop future firing without deleting the definition.
    pub async fn pause_task(&self, id: Uuid) -> Result<ScheduledTask> {
        let mut task = self.require(id)?;
        if task.status != TaskStatus::Active {
            bail!("task '{}' is {} and cannot be paused", task.name, task.status);
        }
        task.status = TaskStatus::Paused;
        task.updated_at = Utc::now();
        self.store.update(&task)?;
        Ok(task)
    }

    /// Reactivate a paused task; the next run is recomputed from now.
    pub async fn resume_task(&self, id: Uuid) -> Result<ScheduledTask> {
        let mut task = self.require(id)?;
        if task.status != TaskStatus::Paused {
            bail!("task '{}' is {} and cannot be resumed", task.name, task.status);
        }
        task.status = TaskStatus::Active;
        task.next_run = cron::initial_next_run(&task.schedule, Utc::now());
        task.updated_at = Utc::now();
        self.store.update(&task)?;
        Ok(task)
    }

    /// Manual trigger, independent of the schedule: submits an execution
    /// right now without touching `next_run` or `run_count`.
    pub async fn execute_now(&self, id: Uuid) -> Result<Uuid> {
        let task = self.require(id)?;
        let execution_id = self
            .engine
            .submit(task.test_type, task.config.clone(), SubmitOptions::default())?;
        self.store
            .record_run(task.id, Some(execution_id), "submitted", None, true)?;
        info!(task = %task.name, execution = %execution_id, "manual run submitted");
        Ok(execution_id)
    }

    pub async fn get_task(&self, id: Uuid) -> Result<Option<ScheduledTask>> {
        self.store.get(id)
    }

    pub async fn list_tasks(&self) -> Result<Vec<ScheduledTask>> {
        self.store.list()
    }

    /// Fire everything due at `now`. A task that slept past its `next_run`
    /// (suspended process, long tick) fires exactly once; the following
    /// `next_run` is computed from now, not from the missed slot.
    pub async fn fire_due(&self, now: DateTime<Utc>) -> Result<usize> {
        let due = self.store.due(now)?;
        let mut fired = 0;

        for mut task in due {
            // Advance the schedule before submitting so a crash or slow
            // submission cannot double-fire the same slot.
            task.last_run = Some(now);
            task.run_count += 1;
            task.next_run = cron::next_run_after(&task.schedule, now);

            let exhausted = matches!(task.schedule, TaskSchedule::Once { .. })
                || task.max_runs.is_some_and(|max| task.run_count >= max)
                || task.next_run.is_none();
            if exhausted {
                task.status = TaskStatus::Completed;
                task.next_run = None;
            }
            task.updated_at = now;
            self.store.update(&task)?;

            match self
                .engine
                .submit(task.test_type, task.config.clone(), SubmitOptions::default())
            {
                Ok(execution_id) => {
                    info!(task = %task.name, execution = %execution_id, "scheduled run submitted");
                    self.store
                        .record_run(task.id, Some(execution_id), "submitted", None, false)?;
                    fired += 1;
                }
                Err(e) => {
                    // A config the engine rejects now will never pass; park
                    // the task instead of rejecting it every tick.
                    warn!(task = %task.name, error = %e, "scheduled submission rejected");
                    task.status = TaskStatus::Failed;
                    self.store.update(&task)?;
                    self.store
                        .record_run(task.id, None, "rejected", Some(&e.to_string()), false)?;
                }
            }
        }
        Ok(fired)
    }

    /// Upcoming fire times over the next `hours`, across all active
    /// tasks, sorted by time.
    pub async fn preview_next_runs(
        &self,
        hours: u64,
    ) -> Result<Vec<(DateTime<Utc>, String, TestType)>> {
        let now = Utc::now();
        let end = now + chrono::Duration::hours(hours as i64);
        let mut preview = Vec::new();

        for task in self.store.list()? {
            if task.status != TaskStatus::Active {
                continue;
            }
            for at in cron::fires_between(&task.schedule, task.next_run, now, end) {
                preview.push((at, task.name.clone(), task.test_type));
            }
        }
        preview.sort_by_key(|entry| entry.0);
        Ok(preview)
    }

    /// Install the out-of-box task profiles when the store is empty.
    pub async fn seed_defaults(&self) -> Result<()> {
        if !self.store.list()?.is_empty() {
            return Ok(());
        }
        for new in profiles::defaults() {
            let name = new.name.clone();
            if let Err(e) = self.create_task(new).await {
                warn!(task = %name, error = %e, "failed to seed default task");
            }
        }
        Ok(())
    }

    fn require(&self, id: Uuid) -> Result<ScheduledTask> {
        self.store
            .get(id)?
            .with_context(|| format!("task {} not found", id))
    }
}
