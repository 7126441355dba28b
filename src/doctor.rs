//! Store health checks and the expired-schedule cleanup pass.
//!
//! Used by the `automation-store-doctor` binary; everything here goes through
//! the public [`AutomationStore`] API.

use chrono::{DateTime, Utc};
use tracing::info;

use crate::error::Result;
use crate::schedule::StateKind;
use crate::store::AutomationStore;

/// Share of capacity at which the store is reported as nearly full.
const CAPACITY_WARNING_RATIO: f64 = 0.9;

/// Maximum identifiers listed as evidence on a single finding.
const MAX_EVIDENCE: usize = 10;

/// Severity level for a doctor finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoctorSeverity {
    Info,
    Warning,
    Error,
}

/// A single doctor finding.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DoctorFinding {
    pub id: String,
    pub severity: DoctorSeverity,
    pub summary: String,
    pub evidence: Vec<String>,
}

impl DoctorFinding {
    fn new(id: impl Into<String>, severity: DoctorSeverity, summary: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            severity,
            summary: summary.into(),
            evidence: Vec::new(),
        }
    }

    fn with_evidence<'a>(mut self, lines: impl IntoIterator<Item = &'a str>) -> Self {
        self.evidence
            .extend(lines.into_iter().take(MAX_EVIDENCE).map(str::to_owned));
        self
    }
}

/// Per-state counts for one store at one instant.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct StoreSummary {
    pub store_name: String,
    pub schedule_limit: usize,
    pub checked_at: DateTime<Utc>,
    pub count: usize,
    pub pending: usize,
    pub delayed: usize,
    pub paused: usize,
    pub executing: usize,
    pub finished: usize,
    pub active_expired: usize,
    pub past_grace: usize,
    pub findings: Vec<DoctorFinding>,
}

/// Inspect `store` as of `now`.
pub async fn summarize(store: &AutomationStore, now: DateTime<Utc>) -> Result<StoreSummary> {
    let schedules = store.get_all_schedules().await?;
    let limit = store.schedule_limit();

    let in_state = |kind: StateKind| {
        schedules
            .iter()
            .filter(|s| s.execution_state.kind() == kind)
            .count()
    };

    let mut summary = StoreSummary {
        store_name: store.name().to_owned(),
        schedule_limit: limit,
        checked_at: now,
        count: schedules.len(),
        pending: in_state(StateKind::Pending),
        delayed: in_state(StateKind::Delayed),
        paused: in_state(StateKind::Paused),
        executing: in_state(StateKind::Executing),
        finished: in_state(StateKind::Finished),
        active_expired: schedules.iter().filter(|s| s.is_active_expired(now)).count(),
        past_grace: schedules.iter().filter(|s| s.is_past_grace(now)).count(),
        findings: Vec::new(),
    };

    if summary.count >= limit {
        summary.findings.push(DoctorFinding::new(
            "capacity_full",
            DoctorSeverity::Error,
            format!("store holds {} of {limit} schedules; new saves will be rejected", summary.count),
        ));
    } else if limit > 0 && summary.count as f64 >= limit as f64 * CAPACITY_WARNING_RATIO {
        summary.findings.push(DoctorFinding::new(
            "capacity_near_limit",
            DoctorSeverity::Warning,
            format!("store holds {} of {limit} schedules", summary.count),
        ));
    }

    let elapsed: Vec<&str> = schedules
        .iter()
        .filter(|s| s.execution_state.kind() == StateKind::Delayed)
        .filter(|s| !s.execution_state.is_still_delayed(now))
        .map(|s| s.identifier.as_str())
        .collect();
    if !elapsed.is_empty() {
        summary.findings.push(
            DoctorFinding::new(
                "elapsed_delays",
                DoctorSeverity::Warning,
                format!("{} delayed schedule(s) are past their execution date", elapsed.len()),
            )
            .with_evidence(elapsed),
        );
    }

    if summary.past_grace > 0 {
        let expired = schedules
            .iter()
            .filter(|s| s.is_past_grace(now))
            .map(|s| s.identifier.as_str());
        summary.findings.push(
            DoctorFinding::new(
                "expired_past_grace",
                DoctorSeverity::Info,
                format!(
                    "{} expired schedule(s) can be removed with purge-expired",
                    summary.past_grace
                ),
            )
            .with_evidence(expired),
        );
    }

    Ok(summary)
}

/// Delete every schedule that expired before `now` and is past its grace period.
///
/// The check and the delete run as one store operation, so a schedule whose
/// end date is extended concurrently is kept. Returns the number removed.
pub async fn purge_expired(store: &AutomationStore, now: DateTime<Utc>) -> Result<usize> {
    let removed = store.delete_expired_schedules(now).await?;
    info!(store = store.name(), removed, "purged expired schedules");
    Ok(removed)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::schedule::ExecutionState;
    use crate::test_utils::{at, simple_schedule};
    use std::time::Duration;

    #[tokio::test]
    async fn summary_counts_states_and_expiry() {
        let store = AutomationStore::in_memory("doctor", 100).expect("store");
        store
            .save_schedules(vec![
                simple_schedule("pending"),
                simple_schedule("paused"),
                simple_schedule("grace")
                    .with_end_date(at(1_000))
                    .with_edit_grace_period(Duration::from_secs(60)),
                simple_schedule("expired").with_end_date(at(1_000)),
            ])
            .await
            .expect("save");
        store
            .set_execution_state("paused", ExecutionState::Paused)
            .await
            .expect("pause");

        let summary = summarize(&store, at(5_000)).await.expect("summary");
        assert_eq!(summary.count, 4);
        assert_eq!(summary.pending, 3);
        assert_eq!(summary.paused, 1);
        assert_eq!(summary.active_expired, 1);
        assert_eq!(summary.past_grace, 1);

        let finding = summary
            .findings
            .iter()
            .find(|f| f.id == "expired_past_grace")
            .expect("expired finding");
        assert_eq!(finding.evidence, vec!["expired".to_owned()]);
    }

    #[tokio::test]
    async fn summary_flags_capacity() {
        let store = AutomationStore::in_memory("tight", 10).expect("store");
        let batch = (0..9).map(|i| simple_schedule(&format!("s{i}"))).collect();
        store.save_schedules(batch).await.expect("save");

        let summary = summarize(&store, at(0)).await.expect("summary");
        assert!(summary.findings.iter().any(|f| f.id == "capacity_near_limit"));

        store.save_schedule(simple_schedule("last")).await.expect("save");
        let summary = summarize(&store, at(0)).await.expect("summary");
        let full = summary
            .findings
            .iter()
            .find(|f| f.id == "capacity_full")
            .expect("full finding");
        assert_eq!(full.severity, DoctorSeverity::Error);
    }

    #[tokio::test]
    async fn summary_flags_elapsed_delays() {
        let store = AutomationStore::in_memory("delays", 10).expect("store");
        store.save_schedule(simple_schedule("late")).await.expect("save");
        store
            .set_execution_state("late", ExecutionState::Delayed { until: at(1_000) })
            .await
            .expect("delay");

        let summary = summarize(&store, at(2_000)).await.expect("summary");
        assert_eq!(summary.delayed, 1);
        assert!(summary.findings.iter().any(|f| f.id == "elapsed_delays"));
    }

    #[tokio::test]
    async fn purge_removes_only_past_grace() {
        let store = AutomationStore::in_memory("purge", 10).expect("store");
        store
            .save_schedules(vec![
                simple_schedule("keep"),
                simple_schedule("grace")
                    .with_end_date(at(1_000))
                    .with_edit_grace_period(Duration::from_secs(60)),
                simple_schedule("drop").with_end_date(at(1_000)),
            ])
            .await
            .expect("save");

        assert_eq!(purge_expired(&store, at(5_000)).await.expect("purge"), 1);
        let left: Vec<String> = store
            .get_all_schedules()
            .await
            .expect("all")
            .into_iter()
            .map(|s| s.identifier)
            .collect();
        assert_eq!(left, vec!["keep".to_owned(), "grace".to_owned()]);
    }

    #[tokio::test]
    async fn purge_keeps_schedule_extended_by_an_earlier_update() {
        let store = AutomationStore::in_memory("extend", 10).expect("store");
        let schedule = simple_schedule("renewed").with_end_date(at(1_000));
        store.save_schedule(schedule.clone()).await.expect("save");

        let extended = store.update_schedule(schedule.with_end_date(at(60_000)));
        let removed = purge_expired(&store, at(5_000)).await.expect("purge");
        assert!(extended.await.expect("update"));
        assert_eq!(removed, 0);
        assert!(store.get_schedule("renewed").await.expect("get").is_some());
    }
}
