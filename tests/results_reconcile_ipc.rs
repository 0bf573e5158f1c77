use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_resultsd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn resultsd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn error_code(value: &serde_json::Value) -> Option<&str> {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|c| c.as_str())
}

fn scope_params(extra: serde_json::Value) -> serde_json::Value {
    let mut p = json!({
        "classId": "JSS2B",
        "subjectCode": "eng",
        "session": "2025/2026",
        "term": "2"
    });
    if let Some(obj) = extra.as_object() {
        for (k, v) in obj {
            p[k] = v.clone();
        }
    }
    p
}

fn count(result: &serde_json::Value, key: &str) -> i64 {
    result.get(key).and_then(|v| v.as_i64()).expect(key)
}

fn record_for<'a>(result: &'a serde_json::Value, student: &str) -> Option<&'a serde_json::Value> {
    result
        .get("records")
        .and_then(|v| v.as_array())
        .and_then(|arr| {
            arr.iter()
                .find(|r| r.get("studentId").and_then(|s| s.as_str()) == Some(student))
        })
}

#[test]
fn reconcile_creates_updates_deletes_and_is_idempotent() {
    let workspace = temp_dir("resultsd-reconcile");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let fetched = request_ok(&mut stdin, &mut reader, "2", "results.fetch", scope_params(json!({})));
    assert_eq!(
        fetched.get("records").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(0)
    );

    let grid = json!([
        { "studentId": "STU001", "scores": { "ca": 8, "test": 15, "exam": 60 } },
        { "studentId": "STU010", "scores": { "ca": "7", "test": "", "exam": "" } },
        { "studentId": "STU020", "scores": { "ca": "", "test": "", "exam": "" } }
    ]);
    let first = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "results.reconcile",
        scope_params(json!({ "rows": grid.clone() })),
    );
    assert_eq!(count(&first, "savedCount"), 2);
    assert_eq!(count(&first, "removedCount"), 0);
    assert_eq!(count(&first, "skippedCount"), 1);
    assert_eq!(first.get("errors").and_then(|v| v.as_array()).map(|a| a.len()), Some(0));

    let stu001 = record_for(&first, "STU001").expect("STU001 saved");
    assert_eq!(stu001.get("totalScore").and_then(|v| v.as_f64()), Some(83.0));
    assert_eq!(stu001.get("grade").and_then(|v| v.as_str()), Some("A"));
    assert_eq!(stu001.get("subjectCode").and_then(|v| v.as_str()), Some("ENG"));
    assert!(record_for(&first, "STU020").is_none(), "blank row never saved");

    // Same grid again: nothing to do.
    let second = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "results.reconcile",
        scope_params(json!({ "rows": grid })),
    );
    assert_eq!(count(&second, "savedCount"), 0);
    assert_eq!(count(&second, "removedCount"), 0);
    assert_eq!(count(&second, "skippedCount"), 3);

    // Edit one, delete one, delete one that never existed.
    let third = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "results.reconcile",
        scope_params(json!({ "rows": [
            { "studentId": "STU001", "scores": { "exam": 70 } },
            { "studentId": "STU010", "markedForDeletion": true },
            { "studentId": "STU099", "markedForDeletion": true }
        ]})),
    );
    assert_eq!(count(&third, "savedCount"), 1);
    assert_eq!(count(&third, "removedCount"), 1);
    assert_eq!(count(&third, "skippedCount"), 1);
    let stu001 = record_for(&third, "STU001").expect("STU001 kept");
    assert_eq!(stu001.get("totalScore").and_then(|v| v.as_f64()), Some(93.0));
    assert_eq!(stu001.get("grade").and_then(|v| v.as_str()), Some("A+"));
    assert!(record_for(&third, "STU010").is_none());

    // Persisted, not just echoed.
    let conn = rusqlite::Connection::open(workspace.join("results.sqlite3")).expect("open db");
    let n: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM results WHERE class_id = 'JSS2B' AND subject_code = 'ENG'",
            [],
            |r| r.get(0),
        )
        .expect("count");
    assert_eq!(n, 1);
}

#[test]
fn reconcile_reports_row_errors_and_saves_the_rest() {
    let workspace = temp_dir("resultsd-reconcile-errors");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    // No results.fetch first: the handler takes its own baseline.
    let result = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "results.reconcile",
        scope_params(json!({ "rows": [
            { "studentId": "STU001", "scores": { "exam": 75 } },
            { "studentId": "STU002", "scores": { "ca": "absent" } },
            { "studentId": "STU003", "scores": { "project": 5 } },
            { "studentId": "STU004", "scores": { "ca": 9, "test": 18, "exam": 52 } }
        ]})),
    );
    assert_eq!(count(&result, "savedCount"), 1);
    let errors = result.get("errors").and_then(|v| v.as_array()).expect("errors");
    let failed: Vec<&str> = errors
        .iter()
        .filter_map(|e| e.get("studentId").and_then(|v| v.as_str()))
        .collect();
    assert_eq!(failed, vec!["STU001", "STU002", "STU003"]);
    assert!(errors
        .iter()
        .all(|e| e.get("kind").and_then(|v| v.as_str()) == Some("invalid_score")));
    assert!(errors[0]
        .get("reason")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .contains("exam"));
    let stu004 = record_for(&result, "STU004").expect("STU004 saved");
    assert_eq!(stu004.get("grade").and_then(|v| v.as_str()), Some("B+"));
}

#[test]
fn reconcile_rejects_malformed_payloads() {
    let workspace = temp_dir("resultsd-reconcile-params");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let no_rows = request(&mut stdin, &mut reader, "2", "results.reconcile", scope_params(json!({})));
    assert_eq!(error_code(&no_rows), Some("bad_params"));

    let no_student = request(
        &mut stdin,
        &mut reader,
        "3",
        "results.reconcile",
        scope_params(json!({ "rows": [{ "scores": { "ca": 1 } }] })),
    );
    assert_eq!(error_code(&no_student), Some("bad_params"));

    let bad_flag = request(
        &mut stdin,
        &mut reader,
        "4",
        "results.reconcile",
        scope_params(json!({ "rows": [{ "studentId": "STU001", "markedForDeletion": "yes" }] })),
    );
    assert_eq!(error_code(&bad_flag), Some("bad_params"));

    let too_many: Vec<serde_json::Value> = (0..5001)
        .map(|i| json!({ "studentId": format!("STU{:05}", i), "scores": { "ca": 1 } }))
        .collect();
    let limit = request(
        &mut stdin,
        &mut reader,
        "5",
        "results.reconcile",
        scope_params(json!({ "rows": too_many })),
    );
    assert_eq!(error_code(&limit), Some("bad_params"));

    let missing_scope = request(
        &mut stdin,
        &mut reader,
        "6",
        "results.reconcile",
        json!({ "classId": "JSS2B", "rows": [] }),
    );
    assert_eq!(error_code(&missing_scope), Some("bad_params"));
}
