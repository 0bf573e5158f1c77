use crate::config::{merge_config_patch, SqliteScoringConfigs};
use crate::grading::{self, ScoringConfig};
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::helpers::{parse_entered_scores, parse_period};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use tracing::info;

fn load_config(configs: &SqliteScoringConfigs<'_>, session: &str, term: &str) -> Result<ScoringConfig, HandlerErr> {
    let resolved = configs
        .resolve(session, term)
        .map_err(|e| HandlerErr::new("db_query_failed", format!("{e:#}")))?;
    resolved
        .config
        .validate()
        .map_err(|e| HandlerErr::new("config_invalid", e.to_string()))?;
    Ok(resolved.config)
}

fn handle_scoring_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let (session, term) = match parse_period(&req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let configs = SqliteScoringConfigs::new(conn, &state.config_cache);
    match configs.resolve(&session, &term) {
        Ok(r) => ok(
            &req.id,
            json!({
                "config": r.config,
                "source": r.source,
                "totalMaxPossible": r.config.total_max_possible()
            }),
        ),
        Err(e) => err(&req.id, "db_query_failed", format!("{e:#}"), None),
    }
}

fn handle_scoring_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    // Both or neither: no session/term writes the workspace-wide override.
    let session = req.params.get("session").and_then(|v| v.as_str()).map(str::trim);
    let term = req.params.get("term").and_then(|v| v.as_str()).map(str::trim);
    let (session, term) = match (session, term) {
        (Some(s), Some(t)) if !s.is_empty() && !t.is_empty() => (s.to_string(), t.to_string()),
        (None, None) => (String::new(), String::new()),
        _ => {
            return err(
                &req.id,
                "bad_params",
                "session and term must be given together",
                None,
            )
        }
    };
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let configs = SqliteScoringConfigs::new(conn, &state.config_cache);
    let mut current = match configs.resolve(&session, &term) {
        Ok(r) => r.config,
        Err(e) => return err(&req.id, "db_query_failed", format!("{e:#}"), None),
    };
    if let Err(msg) = merge_config_patch(&mut current, patch) {
        return err(&req.id, "bad_params", msg, None);
    }
    if let Err(e) = current.validate() {
        return err(&req.id, "config_invalid", e.to_string(), None);
    }
    if let Err(e) = configs.save(&session, &term, &current) {
        return err(&req.id, "db_update_failed", format!("{e:#}"), None);
    }
    info!(session = %session, term = %term, "scoring config updated");
    ok(&req.id, json!({ "config": current }))
}

fn handle_scoring_compute(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let (session, term) = match parse_period(&req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let entered = match parse_entered_scores(req.params.get("scores"), "scores") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let configs = SqliteScoringConfigs::new(conn, &state.config_cache);
    let config = match load_config(&configs, &session, &term) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let display = grading::display_total(&entered, &config.component_weights);
    // A grade is only shown once every entry is in range.
    let boundary = if display.out_of_range.is_empty() {
        match grading::resolve_grade(display.total, &config.boundaries) {
            Ok(b) => Some(b),
            Err(e) => return err(&req.id, "config_invalid", e.to_string(), None),
        }
    } else {
        None
    };
    ok(
        &req.id,
        json!({
            "total": grading::round_display(display.total),
            "outOfRange": display.out_of_range,
            "grade": boundary.map(|b| b.letter.clone()),
            "remark": boundary.and_then(|b| b.remark.clone())
        }),
    )
}

fn handle_scoring_resolve_grade(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let (session, term) = match parse_period(&req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let Some(total) = req.params.get("total").and_then(|v| v.as_f64()) else {
        return err(&req.id, "bad_params", "missing/invalid total", None);
    };
    let configs = SqliteScoringConfigs::new(conn, &state.config_cache);
    let config = match load_config(&configs, &session, &term) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    if total < 0.0 || total > config.total_max_possible() {
        return err(
            &req.id,
            "invalid_score",
            "total must be between 0 and the maximum possible score",
            Some(json!({ "total": total, "max": config.total_max_possible() })),
        );
    }
    match grading::resolve_grade(total, &config.boundaries) {
        Ok(b) => ok(&req.id, json!({ "grade": b.letter, "remark": b.remark })),
        Err(e) => err(&req.id, "config_invalid", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "scoring.get" => Some(handle_scoring_get(state, req)),
        "scoring.update" => Some(handle_scoring_update(state, req)),
        "scoring.compute" => Some(handle_scoring_compute(state, req)),
        "scoring.resolveGrade" => Some(handle_scoring_resolve_grade(state, req)),
        _ => None,
    }
}
