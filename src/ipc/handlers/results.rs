use crate::cache::TtlCache;
use crate::config::SqliteScoringConfigs;
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::helpers::{parse_entered_scores, parse_scope, required_str};
use crate::ipc::types::{AppState, Request};
use crate::reconcile::{BulkReconciler, GridRow, ReconcileError};
use crate::store::{ResultRecord, ResultScope, ResultsStore, SqliteResultsStore};
use crate::summary;
use serde_json::json;
use tracing::{debug, warn};

const RECONCILE_MAX_ROWS: usize = 5000;

fn keep_snapshot(
    snapshots: &TtlCache<ResultScope, Vec<ResultRecord>>,
    scope: ResultScope,
    records: Vec<ResultRecord>,
) {
    let purged = snapshots.purge_expired();
    if purged > 0 {
        debug!(purged, "expired grid snapshots dropped");
    }
    snapshots.insert(scope, records);
}

fn parse_rows(params: &serde_json::Value) -> Result<Vec<GridRow>, HandlerErr> {
    let Some(arr) = params.get("rows").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("missing rows[]"));
    };
    if arr.len() > RECONCILE_MAX_ROWS {
        return Err(HandlerErr::bad_params(format!(
            "save payload exceeds max rows: {} > {}",
            arr.len(),
            RECONCILE_MAX_ROWS
        ))
        .with_details(json!({ "rows": arr.len(), "maxRows": RECONCILE_MAX_ROWS })));
    }

    let mut rows = Vec::with_capacity(arr.len());
    for (i, item) in arr.iter().enumerate() {
        if !item.is_object() {
            return Err(HandlerErr::bad_params(format!("row at index {} must be an object", i))
                .with_details(json!({ "index": i })));
        }
        let student_id = required_str(item, "studentId")
            .map_err(|e| e.with_details(json!({ "index": i })))?
            .to_string();
        let entered_scores = parse_entered_scores(item.get("scores"), "scores")
            .map_err(|e| e.with_details(json!({ "index": i, "studentId": student_id })))?;
        let marked_for_deletion = match item.get("markedForDeletion") {
            None | Some(serde_json::Value::Null) => false,
            Some(v) => match v.as_bool() {
                Some(b) => b,
                None => {
                    return Err(HandlerErr::bad_params(format!(
                        "row at index {} markedForDeletion must be boolean",
                        i
                    ))
                    .with_details(json!({ "index": i })))
                }
            },
        };
        rows.push(GridRow {
            student_id,
            entered_scores,
            marked_for_deletion,
        });
    }
    Ok(rows)
}

fn handle_results_fetch(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let scope = match parse_scope(&req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let records = match SqliteResultsStore::new(conn).fetch_results(&scope) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", format!("{e:#}"), None),
    };
    let result = json!({ "records": records });
    keep_snapshot(&state.snapshots, scope, records);
    ok(&req.id, result)
}

fn handle_results_reconcile(state: &mut AppState, req: &Request) -> serde_json::Value {
    let AppState {
        db,
        config_cache,
        save_gate,
        snapshots,
        ..
    } = state;
    let Some(conn) = db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let scope = match parse_scope(&req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let rows = match parse_rows(&req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let store = SqliteResultsStore::new(conn);
    let snapshot = match snapshots.remove(&scope) {
        Some(v) => v,
        None => {
            warn!(
                class_id = %scope.class_id,
                subject_code = %scope.subject_code,
                "no rendered snapshot for scope; fetching baseline before save"
            );
            match store.fetch_results(&scope) {
                Ok(v) => v,
                Err(e) => return err(&req.id, "db_query_failed", format!("{e:#}"), None),
            }
        }
    };

    let reconciler = BulkReconciler::new(
        SqliteResultsStore::new(conn),
        SqliteScoringConfigs::new(conn, config_cache),
        save_gate.clone(),
    );
    let summary = match reconciler.reconcile(rows, &scope, &snapshot) {
        Ok(v) => v,
        Err(e) => {
            // Nothing was written; the old baseline still describes the grid.
            keep_snapshot(snapshots, scope, snapshot);
            let code = match &e {
                ReconcileError::SaveInProgress => "save_in_progress",
                ReconcileError::Configuration(_) => "config_invalid",
                ReconcileError::ConfigUnavailable(_) => "db_query_failed",
            };
            return err(&req.id, code, e.to_string(), None);
        }
    };

    // The saved grid is the new rendered state.
    let mut result = json!(summary);
    match store.fetch_results(&scope) {
        Ok(records) => {
            result["records"] = json!(records);
            keep_snapshot(snapshots, scope, records);
        }
        Err(e) => {
            warn!(error = %format!("{e:#}"), "could not refresh snapshot after save");
        }
    }
    ok(&req.id, result)
}

fn handle_results_summary(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let scope = match parse_scope(&req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let records = match SqliteResultsStore::new(conn).fetch_results(&scope) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", format!("{e:#}"), None),
    };
    let configs = SqliteScoringConfigs::new(conn, &state.config_cache);
    let config = match configs.resolve(&scope.session, &scope.term) {
        Ok(r) => r.config,
        Err(e) => return err(&req.id, "db_query_failed", format!("{e:#}"), None),
    };
    ok(
        &req.id,
        json!({
            "scope": scope,
            "summary": summary::summarize(&records, &config.boundaries)
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "results.fetch" => Some(handle_results_fetch(state, req)),
        "results.reconcile" => Some(handle_results_reconcile(state, req)),
        "results.summary" => Some(handle_results_summary(state, req)),
        _ => None,
    }
}
