//! Activation history
//!
//! Keeps the most recent activations and running totals for diagnostics.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::display::{DisplayStatus, OutcomeStatus};
use crate::orchestrator::{ActivationReport, ActivationResult};
use crate::profile::ProfileId;

/// Maximum number of activations to retain when no limit is configured
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Record of one finished activation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivationRecord {
    pub activation_id: Uuid,
    pub started_at: DateTime<Utc>,
    /// Human-readable trigger, e.g. `hotkey Ctrl+Alt+1 (slot #1)`
    pub trigger: String,
    pub profile_id: Option<ProfileId>,
    pub profile_name: Option<String>,
    /// Overall applier status; `None` if the activation never reached the applier
    pub outcome: Option<OutcomeStatus>,
    pub duration_ms: u64,
    /// Failure reason for aborted activations, or the per-display failures
    pub error_message: Option<String>,
}

impl ActivationRecord {
    pub fn succeeded(&self) -> bool {
        self.outcome == Some(OutcomeStatus::Applied)
    }
}

impl From<&ActivationReport> for ActivationRecord {
    fn from(report: &ActivationReport) -> Self {
        let (outcome, error_message) = match &report.result {
            ActivationResult::Done(outcome) => {
                let failures: Vec<String> = outcome
                    .displays
                    .iter()
                    .filter_map(|d| match &d.status {
                        DisplayStatus::Failed(reason) => {
                            Some(format!("{}: {}", d.display_id, reason))
                        }
                        _ => None,
                    })
                    .collect();
                let message = (!failures.is_empty()).then(|| failures.join("; "));
                (Some(outcome.status), message)
            }
            ActivationResult::Failed(failure) => (None, Some(failure.to_string())),
        };

        Self {
            activation_id: report.activation_id,
            started_at: report.started_at,
            trigger: report.trigger.to_string(),
            profile_id: report.profile_id,
            profile_name: report.profile_name.clone(),
            outcome,
            duration_ms: report.duration_ms,
            error_message,
        }
    }
}

/// Summary statistics across all recorded activations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistorySummary {
    pub total: u64,
    pub applied: u64,
    pub partially_applied: u64,
    /// Activations whose displays all failed or that aborted before applying
    pub failed: u64,
    /// Average duration (ms) of fully applied activations
    pub avg_applied_ms: u64,
    pub last_failure: Option<ActivationRecord>,
}

pub struct ActivationHistory {
    /// Newest first
    records: VecDeque<ActivationRecord>,
    limit: usize,
    total: u64,
    applied: u64,
    partially_applied: u64,
    last_failure: Option<ActivationRecord>,
}

impl ActivationHistory {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            records: VecDeque::with_capacity(limit),
            limit,
            total: 0,
            applied: 0,
            partially_applied: 0,
            last_failure: None,
        }
    }

    pub fn record(&mut self, report: &ActivationReport) {
        let record = ActivationRecord::from(report);

        self.total += 1;
        match record.outcome {
            Some(OutcomeStatus::Applied) => self.applied += 1,
            Some(OutcomeStatus::PartiallyApplied) => self.partially_applied += 1,
            Some(OutcomeStatus::Failed) | None => {}
        }
        if record.error_message.is_some() {
            self.last_failure = Some(record.clone());
        }

        log::debug!(
            "History: recorded activation {} ({:?}, {}ms)",
            record.activation_id,
            record.outcome,
            record.duration_ms
        );

        self.records.push_front(record);
        while self.records.len() > self.limit {
            self.records.pop_back();
        }
    }

    pub fn summary(&self) -> HistorySummary {
        let applied: Vec<_> = self.records.iter().filter(|r| r.succeeded()).collect();
        let avg_applied_ms = if applied.is_empty() {
            0
        } else {
            applied.iter().map(|r| r.duration_ms).sum::<u64>() / applied.len() as u64
        };

        HistorySummary {
            total: self.total,
            applied: self.applied,
            partially_applied: self.partially_applied,
            failed: self.total - self.applied - self.partially_applied,
            avg_applied_ms,
            last_failure: self.last_failure.clone(),
        }
    }

    /// Retained records, newest first
    pub fn recent(&self) -> Vec<ActivationRecord> {
        self.records.iter().cloned().collect()
    }
}

impl Default for ActivationHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}
