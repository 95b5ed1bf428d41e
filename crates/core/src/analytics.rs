use crate::types::{DefinitionId, ExecutionStatus, StepId, StepStatus, WorkflowExecution};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Window of executions an analytics report covers, by start time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalyticsPeriod {
    Day,
    Week,
    Month,
    #[default]
    All,
}

impl AnalyticsPeriod {
    /// Earliest start time included, or `None` for everything
    pub fn since(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            AnalyticsPeriod::Day => Some(now - Duration::days(1)),
            AnalyticsPeriod::Week => Some(now - Duration::weeks(1)),
            AnalyticsPeriod::Month => Some(now - Duration::days(30)),
            AnalyticsPeriod::All => None,
        }
    }
}

impl std::str::FromStr for AnalyticsPeriod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "day" => Ok(AnalyticsPeriod::Day),
            "week" => Ok(AnalyticsPeriod::Week),
            "month" => Ok(AnalyticsPeriod::Month),
            "all" => Ok(AnalyticsPeriod::All),
            other => Err(format!("unknown analytics period: {}", other)),
        }
    }
}

/// The step that took the largest share of execution time on average
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BottleneckStep {
    pub step_id: StepId,
    pub avg_duration_ms: f64,
    pub percentage_of_workflow: f64,
}

/// Aggregated statistics for one definition's executions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowAnalytics {
    pub definition_id: DefinitionId,
    pub tenant_id: String,
    pub period: AnalyticsPeriod,
    pub total_executions: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub timed_out: u64,
    /// Pending, running or paused
    pub active: u64,
    /// Completed executions as a percentage of finished ones
    pub success_rate: f64,
    pub average_duration_ms: Option<f64>,
    pub min_duration_ms: Option<i64>,
    pub max_duration_ms: Option<i64>,
    pub p95_duration_ms: Option<i64>,
    /// Retries per execution
    pub average_retries: f64,
    /// Failed step count keyed by step id
    pub step_failures: BTreeMap<String, u64>,
    pub bottleneck: Option<BottleneckStep>,
}

/// Build a report from a definition's executions
pub fn aggregate(
    definition_id: DefinitionId,
    tenant_id: &str,
    executions: &[WorkflowExecution],
    period: AnalyticsPeriod,
    now: DateTime<Utc>,
) -> WorkflowAnalytics {
    let since = period.since(now);
    let in_period: Vec<&WorkflowExecution> = executions
        .iter()
        .filter(|e| e.definition_id == definition_id)
        .filter(|e| since.map_or(true, |s| e.started_at >= s))
        .collect();

    let mut report = WorkflowAnalytics {
        definition_id,
        tenant_id: tenant_id.to_string(),
        period,
        total_executions: in_period.len() as u64,
        completed: 0,
        failed: 0,
        cancelled: 0,
        timed_out: 0,
        active: 0,
        success_rate: 0.0,
        average_duration_ms: None,
        min_duration_ms: None,
        max_duration_ms: None,
        p95_duration_ms: None,
        average_retries: 0.0,
        step_failures: BTreeMap::new(),
        bottleneck: None,
    };

    let mut durations = Vec::new();
    let mut retries = 0u64;
    let mut step_durations: HashMap<&StepId, (i64, u64)> = HashMap::new();

    for execution in &in_period {
        match execution.status {
            ExecutionStatus::Completed => report.completed += 1,
            ExecutionStatus::Failed => report.failed += 1,
            ExecutionStatus::Cancelled => report.cancelled += 1,
            ExecutionStatus::TimedOut => report.timed_out += 1,
            ExecutionStatus::Pending | ExecutionStatus::Running | ExecutionStatus::Paused => {
                report.active += 1
            }
        }

        if let Some(d) = execution.duration_ms() {
            durations.push(d);
        }

        for step in &execution.steps {
            retries += u64::from(step.retry_count);
            if step.status == StepStatus::Failed {
                *report
                    .step_failures
                    .entry(step.step_id.to_string())
                    .or_default() += 1;
            }
            if step.status == StepStatus::Completed {
                if let Some(d) = step.duration_ms() {
                    let entry = step_durations.entry(&step.step_id).or_default();
                    entry.0 += d;
                    entry.1 += 1;
                }
            }
        }
    }

    let finished = report.total_executions - report.active;
    if finished > 0 {
        report.success_rate = report.completed as f64 / finished as f64 * 100.0;
    }
    if !in_period.is_empty() {
        report.average_retries = retries as f64 / in_period.len() as f64;
    }

    durations.sort_unstable();
    if !durations.is_empty() {
        let total: i64 = durations.iter().sum();
        report.average_duration_ms = Some(total as f64 / durations.len() as f64);
        report.min_duration_ms = durations.first().copied();
        report.max_duration_ms = durations.last().copied();
        report.p95_duration_ms = percentile(&durations, 0.95);
    }

    report.bottleneck = step_durations
        .into_iter()
        .map(|(step_id, (total, count))| (step_id, total as f64 / count as f64))
        .max_by(|a, b| a.1.total_cmp(&b.1).then_with(|| b.0.cmp(a.0)))
        .map(|(step_id, avg)| BottleneckStep {
            step_id: step_id.clone(),
            avg_duration_ms: avg,
            percentage_of_workflow: match report.average_duration_ms {
                Some(workflow_avg) if workflow_avg > 0.0 => avg / workflow_avg * 100.0,
                _ => 0.0,
            },
        });

    report
}

/// Nearest-rank percentile over sorted values
fn percentile(sorted: &[i64], p: f64) -> Option<i64> {
    if sorted.is_empty() {
        return None;
    }
    let rank = ((sorted.len() as f64) * p).ceil() as usize;
    Some(sorted[rank.saturating_sub(1).min(sorted.len() - 1)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        DefinitionSnapshot, ExecutionContext, ExecutionId, ExecutionSettings, StepType,
        VariableMap, WorkflowStepExecution,
    };

    fn step(id: &str, status: StepStatus, retries: u32, ms: i64, start: DateTime<Utc>) -> WorkflowStepExecution {
        WorkflowStepExecution {
            step_id: StepId::new(id),
            step_name: id.to_string(),
            step_type: StepType::Task,
            status,
            input: VariableMap::new(),
            output: VariableMap::new(),
            retry_count: retries,
            max_retries: 3,
            started_at: Some(start),
            completed_at: Some(start + Duration::milliseconds(ms)),
            error: None,
            approval: None,
        }
    }

    fn execution(
        def: DefinitionId,
        status: ExecutionStatus,
        started_at: DateTime<Utc>,
        duration_ms: Option<i64>,
        steps: Vec<WorkflowStepExecution>,
    ) -> WorkflowExecution {
        WorkflowExecution {
            id: ExecutionId::new(),
            definition_id: def,
            tenant_id: "acme".to_string(),
            status,
            progress: 0,
            input: VariableMap::new(),
            output: VariableMap::new(),
            variables: VariableMap::new(),
            steps,
            logs: vec![],
            context: ExecutionContext::for_user("bob"),
            snapshot: DefinitionSnapshot {
                name: "t".to_string(),
                version: 1,
                steps: vec![],
                settings: ExecutionSettings::default(),
            },
            started_at,
            run_started_at: Some(started_at),
            completed_at: duration_ms.map(|d| started_at + Duration::milliseconds(d)),
            error: None,
        }
    }

    #[test]
    fn test_counts_rates_and_durations() {
        let def = DefinitionId::new();
        let now = Utc::now();
        let t = now - Duration::hours(1);

        let executions = vec![
            execution(
                def,
                ExecutionStatus::Completed,
                t,
                Some(100),
                vec![step("fetch", StepStatus::Completed, 0, 20, t), step("load", StepStatus::Completed, 1, 70, t)],
            ),
            execution(
                def,
                ExecutionStatus::Completed,
                t,
                Some(300),
                vec![step("fetch", StepStatus::Completed, 0, 40, t), step("load", StepStatus::Completed, 0, 250, t)],
            ),
            execution(
                def,
                ExecutionStatus::Failed,
                t,
                Some(200),
                vec![step("fetch", StepStatus::Completed, 0, 30, t), step("load", StepStatus::Failed, 2, 150, t)],
            ),
            execution(def, ExecutionStatus::Running, t, None, vec![]),
            execution(DefinitionId::new(), ExecutionStatus::Completed, t, Some(5), vec![]),
        ];

        let report = aggregate(def, "acme", &executions, AnalyticsPeriod::All, now);

        assert_eq!(report.total_executions, 4);
        assert_eq!(report.completed, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.active, 1);
        assert!((report.success_rate - 200.0 / 3.0).abs() < 1e-9);
        assert_eq!(report.average_duration_ms, Some(200.0));
        assert_eq!(report.min_duration_ms, Some(100));
        assert_eq!(report.max_duration_ms, Some(300));
        assert_eq!(report.p95_duration_ms, Some(300));
        assert_eq!(report.average_retries, 0.75);
        assert_eq!(report.step_failures.get("load"), Some(&1));

        let bottleneck = report.bottleneck.unwrap();
        assert_eq!(bottleneck.step_id.as_str(), "load");
        assert_eq!(bottleneck.avg_duration_ms, 160.0);
    }

    #[test]
    fn test_period_filters_old_executions() {
        let def = DefinitionId::new();
        let now = Utc::now();
        let executions = vec![
            execution(def, ExecutionStatus::Completed, now - Duration::days(3), Some(10), vec![]),
            execution(def, ExecutionStatus::Failed, now - Duration::hours(2), Some(10), vec![]),
        ];

        let day = aggregate(def, "acme", &executions, AnalyticsPeriod::Day, now);
        assert_eq!(day.total_executions, 1);
        assert_eq!(day.success_rate, 0.0);

        let week = aggregate(def, "acme", &executions, AnalyticsPeriod::Week, now);
        assert_eq!(week.total_executions, 2);
        assert_eq!(week.success_rate, 50.0);
    }

    #[test]
    fn test_empty_report() {
        let report = aggregate(DefinitionId::new(), "acme", &[], AnalyticsPeriod::Month, Utc::now());
        assert_eq!(report.total_executions, 0);
        assert!(report.average_duration_ms.is_none());
        assert!(report.bottleneck.is_none());
        assert_eq!("WEEK".parse::<AnalyticsPeriod>().unwrap(), AnalyticsPeriod::Week);
        assert!("year".parse::<AnalyticsPeriod>().is_err());
    }
}
