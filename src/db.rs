use anyhow::Context;
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::time::Duration;

pub const DB_FILE_NAME: &str = "results.sqlite3";

pub fn open_db(workspace: &Path, busy_timeout: Duration) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)
        .with_context(|| format!("failed to create workspace {}", workspace.to_string_lossy()))?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(&db_path)
        .with_context(|| format!("failed to open {}", db_path.to_string_lossy()))?;
    conn.busy_timeout(busy_timeout)?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS results(
            student_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            subject_code TEXT NOT NULL,
            session TEXT NOT NULL,
            term TEXT NOT NULL,
            component_scores TEXT NOT NULL,
            total_score REAL NOT NULL,
            grade TEXT NOT NULL,
            updated_at TEXT,
            PRIMARY KEY(student_id, class_id, subject_code, session, term)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_results_scope
         ON results(class_id, subject_code, session, term)",
        [],
    )?;
    ensure_results_updated_at(conn)?;

    // Empty session/term is the workspace-wide override.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS scoring_configs(
            session TEXT NOT NULL,
            term TEXT NOT NULL,
            config_json TEXT NOT NULL,
            updated_at TEXT,
            PRIMARY KEY(session, term)
        )",
        [],
    )?;
    Ok(())
}

// Workspaces created before timestamps were tracked lack the column.
fn ensure_results_updated_at(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "results", "updated_at")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE results ADD COLUMN updated_at TEXT", [])?;
    Ok(())
}

pub fn scoring_config_get_json(
    conn: &Connection,
    session: &str,
    term: &str,
) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT config_json FROM scoring_configs WHERE session = ? AND term = ?",
            (session, term),
            |r| r.get(0),
        )
        .optional()?;
    let Some(raw) = raw else {
        return Ok(None);
    };
    let value = serde_json::from_str(&raw).with_context(|| {
        format!(
            "stored scoring config for session '{}' term '{}' is not valid JSON",
            session, term
        )
    })?;
    Ok(Some(value))
}

pub fn scoring_config_set_json(
    conn: &Connection,
    session: &str,
    term: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO scoring_configs(session, term, config_json, updated_at)
         VALUES(?, ?, ?, ?)
         ON CONFLICT(session, term) DO UPDATE SET
           config_json = excluded.config_json,
           updated_at = excluded.updated_at",
        (session, term, serde_json::to_string(value)?, now),
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
