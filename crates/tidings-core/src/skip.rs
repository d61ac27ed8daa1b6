//! Skip records: what was given up on, and why.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{AppError, ErrorKind};

/// A unit of work abandoned after its retries ran out.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkipRecord {
    pub source_id: String,
    pub operation_name: String,
    pub reason: String,
    pub attempts_made: u32,
    pub error_kind: ErrorKind,
    pub timestamp: DateTime<Utc>,
}

impl SkipRecord {
    pub fn new(
        source_id: impl Into<String>,
        operation_name: impl Into<String>,
        error: &AppError,
        attempts_made: u32,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            operation_name: operation_name.into(),
            reason: error.to_string(),
            attempts_made,
            error_kind: error.kind(),
            timestamp: Utc::now(),
        }
    }

    /// Work that never started because the run was cancelled.
    pub fn cancelled(source_id: impl Into<String>, operation_name: impl Into<String>) -> Self {
        Self::new(source_id, operation_name, &AppError::Cancelled, 0)
    }
}

/// Result of a unit of work that may have been skipped.
///
/// A skip is not an empty success: callers have to look at which one
/// they got.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum Outcome<T> {
    Completed(T),
    Skipped(SkipRecord),
}

impl<T> Outcome<T> {
    pub fn is_completed(&self) -> bool {
        matches!(self, Outcome::Completed(_))
    }

    pub fn completed(self) -> Option<T> {
        match self {
            Outcome::Completed(value) => Some(value),
            Outcome::Skipped(_) => None,
        }
    }

    pub fn as_completed(&self) -> Option<&T> {
        match self {
            Outcome::Completed(value) => Some(value),
            Outcome::Skipped(_) => None,
        }
    }

    pub fn skipped(&self) -> Option<&SkipRecord> {
        match self {
            Outcome::Completed(_) => None,
            Outcome::Skipped(record) => Some(record),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Completed(value) => Outcome::Completed(f(value)),
            Outcome::Skipped(record) => Outcome::Skipped(record),
        }
    }
}

/// Skip records in arrival order.
///
/// A run uses an unbounded tracker of its own. The process-wide history
/// is created [`bounded`](Self::bounded) and drops its oldest records
/// once full.
#[derive(Debug, Default)]
pub struct SkipTracker {
    records: Mutex<VecDeque<SkipRecord>>,
    capacity: Option<usize>,
}

impl SkipTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bounded(capacity: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::new()),
            capacity: Some(capacity.max(1)),
        }
    }

    fn lock_records(&self) -> MutexGuard<'_, VecDeque<SkipRecord>> {
        self.records.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned skip tracker");
            poisoned.into_inner()
        })
    }

    fn push(&self, records: impl IntoIterator<Item = SkipRecord>) {
        let mut stored = self.lock_records();
        stored.extend(records);
        if let Some(capacity) = self.capacity {
            while stored.len() > capacity {
                stored.pop_front();
            }
        }
    }

    /// Copy another tracker's records in without logging them again.
    pub fn absorb(&self, other: &SkipTracker) {
        let records = other.records();
        self.push(records);
    }

    pub fn record(&self, record: SkipRecord) {
        tracing::warn!(
            source_id = %record.source_id,
            operation = %record.operation_name,
            attempts = record.attempts_made,
            kind = %record.error_kind,
            reason = %record.reason,
            "Skipped"
        );
        self.push([record]);
    }

    pub fn records(&self) -> Vec<SkipRecord> {
        self.lock_records().iter().cloned().collect()
    }

    pub fn for_source(&self, source_id: &str) -> Vec<SkipRecord> {
        self.lock_records()
            .iter()
            .filter(|r| r.source_id == source_id)
            .cloned()
            .collect()
    }

    /// Skips grouped by source id, oldest first within each source.
    pub fn by_source(&self) -> BTreeMap<String, Vec<SkipRecord>> {
        let mut grouped: BTreeMap<String, Vec<SkipRecord>> = BTreeMap::new();
        for record in self.lock_records().iter() {
            grouped
                .entry(record.source_id.clone())
                .or_default()
                .push(record.clone());
        }
        grouped
    }

    pub fn len(&self) -> usize {
        self.lock_records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_records().is_empty()
    }

    pub fn summary(&self) -> SkipSummary {
        SkipSummary::from_records(self.lock_records().iter())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SkipSummary {
    pub total: usize,
    pub by_kind: BTreeMap<ErrorKind, usize>,
    pub by_source: BTreeMap<String, usize>,
}

impl SkipSummary {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a SkipRecord>) -> Self {
        let mut summary = SkipSummary::default();
        for record in records {
            summary.total += 1;
            *summary.by_kind.entry(record.error_kind).or_default() += 1;
            *summary
                .by_source
                .entry(record.source_id.clone())
                .or_default() += 1;
        }
        summary
    }
}

impl fmt::Display for SkipSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.total == 0 {
            return f.write_str("No skips");
        }
        writeln!(
            f,
            "{} skipped across {} source(s)",
            self.total,
            self.by_source.len()
        )?;
        for (kind, count) in &self.by_kind {
            writeln!(f, "  {:<20} {count}", kind.as_str())?;
        }
        Ok(())
    }
}
