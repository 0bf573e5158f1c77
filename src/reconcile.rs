//! Bulk results entry: diff an edited grid against the snapshot it was
//! rendered from and push the minimal set of upserts and deletes to the store.
//!
//! One save runs `Validating -> Diffing -> Executing -> Reporting` under a
//! [`SaveGate`]. Row-level problems (bad scores, store failures) are reported
//! in the [`SaveSummary`]; only an unusable scoring config or a concurrent
//! save rejects the whole call, and both happen before any store call.

use crate::config::ScoringConfigProvider;
use crate::grading::{
    self, ComponentScores, EnteredScore, GradingError, ScoringConfig, SCORE_EPSILON,
};
use crate::store::{ResultKey, ResultRecord, ResultScope, ResultsStore, StoreOutcome};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct GridRow {
    pub student_id: String,
    /// Components absent from the map were not rendered and keep their stored value.
    pub entered_scores: BTreeMap<String, EnteredScore>,
    pub marked_for_deletion: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RowErrorKind {
    InvalidScore,
    StoreFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RowError {
    pub student_id: String,
    pub kind: RowErrorKind,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveSummary {
    pub saved_count: usize,
    pub removed_count: usize,
    pub skipped_count: usize,
    pub errors: Vec<RowError>,
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("a save is already in progress")]
    SaveInProgress,
    #[error("scoring configuration is invalid: {0}")]
    Configuration(#[from] GradingError),
    #[error("scoring configuration could not be loaded: {0}")]
    ConfigUnavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcilePhase {
    Idle = 0,
    Validating = 1,
    Diffing = 2,
    Executing = 3,
    Reporting = 4,
}

impl ReconcilePhase {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Validating,
            2 => Self::Diffing,
            3 => Self::Executing,
            4 => Self::Reporting,
            _ => Self::Idle,
        }
    }
}

/// Shared busy flag: at most one save runs per gate. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct SaveGate {
    phase: Arc<AtomicU8>,
}

impl SaveGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> ReconcilePhase {
        ReconcilePhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub fn is_busy(&self) -> bool {
        self.phase() != ReconcilePhase::Idle
    }

    pub fn try_acquire(&self) -> Option<SaveGuard<'_>> {
        self.phase
            .compare_exchange(
                ReconcilePhase::Idle as u8,
                ReconcilePhase::Validating as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .ok()
            .map(|_| SaveGuard { gate: self })
    }
}

/// Holds the gate for one save; returns it to `Idle` when dropped.
pub struct SaveGuard<'a> {
    gate: &'a SaveGate,
}

impl SaveGuard<'_> {
    fn advance(&self, phase: ReconcilePhase, save_id: &Uuid, scope: &ResultScope) {
        self.gate.phase.store(phase as u8, Ordering::Release);
        debug!(
            %save_id,
            phase = ?phase,
            class_id = %scope.class_id,
            subject_code = %scope.subject_code,
            session = %scope.session,
            term = %scope.term,
            "save phase"
        );
    }
}

impl Drop for SaveGuard<'_> {
    fn drop(&mut self) {
        self.gate
            .phase
            .store(ReconcilePhase::Idle as u8, Ordering::Release);
    }
}

enum PlannedOp {
    Upsert(ResultRecord),
    Delete(ResultKey),
}

struct ValidRow {
    row: GridRow,
    entered_numbers: ComponentScores,
}

pub struct BulkReconciler<S, P> {
    store: S,
    configs: P,
    gate: SaveGate,
}

impl<S: ResultsStore, P: ScoringConfigProvider> BulkReconciler<S, P> {
    pub fn new(store: S, configs: P, gate: SaveGate) -> Self {
        Self {
            store,
            configs,
            gate,
        }
    }

    /// Saves `rows` for `scope`. `snapshot` is what the store returned when
    /// the grid was rendered; it is not re-read here.
    pub fn reconcile(
        &self,
        rows: Vec<GridRow>,
        scope: &ResultScope,
        snapshot: &[ResultRecord],
    ) -> Result<SaveSummary, ReconcileError> {
        let guard = self
            .gate
            .try_acquire()
            .ok_or(ReconcileError::SaveInProgress)?;
        let save_id = Uuid::new_v4();
        debug!(
            %save_id,
            class_id = %scope.class_id,
            subject_code = %scope.subject_code,
            session = %scope.session,
            term = %scope.term,
            rows = rows.len(),
            "save started"
        );

        let config = self
            .configs
            .scoring_config(&scope.session, &scope.term)
            .map_err(|e| ReconcileError::ConfigUnavailable(format!("{e:#}")))?;
        config.validate()?;

        let mut summary = SaveSummary::default();

        guard.advance(ReconcilePhase::Validating, &save_id, scope);
        let rows = dedupe_last_wins(rows);
        let mut valid: Vec<ValidRow> = Vec::with_capacity(rows.len());
        for row in rows {
            match validate_row(&row, &config) {
                Ok(entered_numbers) => valid.push(ValidRow {
                    row,
                    entered_numbers,
                }),
                Err(reason) => {
                    debug!(%save_id, student_id = %row.student_id, %reason, "row rejected");
                    summary.errors.push(RowError {
                        student_id: row.student_id,
                        kind: RowErrorKind::InvalidScore,
                        reason,
                    });
                }
            }
        }

        guard.advance(ReconcilePhase::Diffing, &save_id, scope);
        let existing: HashMap<&str, &ResultRecord> = snapshot
            .iter()
            .filter(|r| r.scope == *scope)
            .map(|r| (r.student_id.as_str(), r))
            .collect();
        let mut ops: Vec<(String, PlannedOp)> = Vec::new();
        for v in valid {
            let stored = existing.get(v.row.student_id.as_str()).copied();
            match plan_row(&v, stored, scope, &config) {
                Ok(Some(op)) => ops.push((v.row.student_id, op)),
                Ok(None) => summary.skipped_count += 1,
                Err(e) if e.is_score_error() => summary.errors.push(RowError {
                    student_id: v.row.student_id,
                    kind: RowErrorKind::InvalidScore,
                    reason: e.to_string(),
                }),
                Err(e) => return Err(ReconcileError::Configuration(e)),
            }
        }

        guard.advance(ReconcilePhase::Executing, &save_id, scope);
        for (student_id, op) in ops {
            let (outcome, removed) = match &op {
                PlannedOp::Upsert(record) => (self.store.upsert_result(record), false),
                PlannedOp::Delete(key) => (self.store.delete_result(key), true),
            };
            match outcome {
                StoreOutcome::Done if removed => summary.removed_count += 1,
                StoreOutcome::Done => summary.saved_count += 1,
                StoreOutcome::Failed { reason } => {
                    warn!(%save_id, %student_id, %reason, "store operation failed");
                    summary.errors.push(RowError {
                        student_id,
                        kind: RowErrorKind::StoreFailed,
                        reason,
                    });
                }
            }
        }

        guard.advance(ReconcilePhase::Reporting, &save_id, scope);
        info!(
            %save_id,
            class_id = %scope.class_id,
            subject_code = %scope.subject_code,
            saved = summary.saved_count,
            removed = summary.removed_count,
            skipped = summary.skipped_count,
            errors = summary.errors.len(),
            "save finished"
        );
        Ok(summary)
    }
}

/// Keeps one row per student: the last one submitted, at the position of the first.
fn dedupe_last_wins(rows: Vec<GridRow>) -> Vec<GridRow> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut out: Vec<GridRow> = Vec::with_capacity(rows.len());
    for row in rows {
        match index.get(&row.student_id) {
            Some(&i) => out[i] = row,
            None => {
                index.insert(row.student_id.clone(), out.len());
                out.push(row);
            }
        }
    }
    out
}

/// Numeric entries of a row, range-checked. Rows marked for deletion skip checks.
fn validate_row(row: &GridRow, config: &ScoringConfig) -> Result<ComponentScores, String> {
    let mut numbers = ComponentScores::new();
    if row.marked_for_deletion {
        return Ok(numbers);
    }
    for (key, entry) in &row.entered_scores {
        match entry {
            EnteredScore::Empty => {}
            EnteredScore::Number(v) => {
                numbers.insert(key.clone(), *v);
            }
            EnteredScore::Text(t) => {
                return Err(format!("score '{}' for component '{}' is not a number", t, key));
            }
        }
    }
    grading::compute_total(&numbers, &config.component_weights).map_err(|e| e.to_string())?;
    Ok(numbers)
}

fn same_score(a: f64, b: f64) -> bool {
    (a - b).abs() <= SCORE_EPSILON
}

/// Stored scores overlaid with the row's entries. Blank over a stored 0 keeps
/// the 0; blank over any other stored value removes the component.
fn merged_scores(entered: &BTreeMap<String, EnteredScore>, stored: &ComponentScores) -> ComponentScores {
    let mut merged = stored.clone();
    for (key, entry) in entered {
        match entry {
            EnteredScore::Number(v) => {
                merged.insert(key.clone(), *v);
            }
            EnteredScore::Empty => {
                if merged.get(key).is_some_and(|v| !same_score(*v, 0.0)) {
                    merged.remove(key);
                }
            }
            EnteredScore::Text(_) => {}
        }
    }
    merged
}

fn scores_equal(a: &ComponentScores, b: &ComponentScores) -> bool {
    a.len() == b.len()
        && a.iter()
            .all(|(k, v)| b.get(k).is_some_and(|w| same_score(*v, *w)))
}

fn plan_row(
    v: &ValidRow,
    stored: Option<&ResultRecord>,
    scope: &ResultScope,
    config: &ScoringConfig,
) -> Result<Option<PlannedOp>, GradingError> {
    let row = &v.row;
    if row.marked_for_deletion {
        return Ok(stored.map(|r| PlannedOp::Delete(r.key())));
    }
    // Clearing every score never deletes; that takes the explicit flag.
    if v.entered_numbers.is_empty() {
        return Ok(None);
    }

    let component_scores = match stored {
        Some(r) => {
            let merged = merged_scores(&row.entered_scores, &r.component_scores);
            if scores_equal(&merged, &r.component_scores) {
                return Ok(None);
            }
            merged
        }
        None => v.entered_numbers.clone(),
    };

    let graded = grading::grade_for(&component_scores, config)?;
    Ok(Some(PlannedOp::Upsert(ResultRecord {
        student_id: row.student_id.clone(),
        scope: scope.clone(),
        component_scores,
        total_score: graded.total,
        grade: graded.grade,
        updated_at: None,
    })))
}
