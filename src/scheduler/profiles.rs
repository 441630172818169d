//! Default task profiles installed on an empty store.

use serde_json::json;

use super::{NewTask, TaskSchedule};
use crate::model::TestType;

/// Out-of-box recurring tasks for a freshly provisioned instance. The
/// target URL is a placeholder the operator is expected to edit.
pub fn defaults() -> Vec<NewTask> {
    let target = "https://example.com";
    vec![
        NewTask {
            name: "daily-performance-baseline".to_string(),
            test_type: TestType::Performance,
            config: json!({ "target_url": target }),
            schedule: TaskSchedule::Cron {
                expr: "0 0 3 * * * *".to_string(), // 3am daily
                end_time: None,
            },
            max_runs: None,
        },
        NewTask {
            name: "weekly-seo-audit".to_string(),
            test_type: TestType::Seo,
            config: json!({ "target_url": target }),
            schedule: TaskSchedule::Cron {
                expr: "0 0 4 * * Sun *".to_string(), // 4am Sunday
                end_time: None,
            },
            max_runs: None,
        },
        NewTask {
            name: "api-health-check".to_string(),
            test_type: TestType::Api,
            config: json!({ "endpoints": ["/health"], "base_url": target }),
            schedule: TaskSchedule::Interval {
                every_secs: 15 * 60,
                end_time: None,
            },
            max_runs: None,
        },
        NewTask {
            name: "weekly-security-scan".to_string(),
            test_type: TestType::Security,
            config: json!({ "target_url": target }),
            schedule: TaskSchedule::Cron {
                expr: "0 30 4 * * Sun *".to_string(),
                end_time: None,
            },
            max_runs: None,
        },
    ]
}
