use crate::grading::ComponentScores;
use anyhow::Context;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// (class, subject, session, term): one rendered results grid.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultScope {
    pub class_id: String,
    pub subject_code: String,
    pub session: String,
    pub term: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultKey {
    pub student_id: String,
    #[serde(flatten)]
    pub scope: ResultScope,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultRecord {
    pub student_id: String,
    #[serde(flatten)]
    pub scope: ResultScope,
    pub component_scores: ComponentScores,
    pub total_score: f64,
    pub grade: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl ResultRecord {
    pub fn key(&self) -> ResultKey {
        ResultKey {
            student_id: self.student_id.clone(),
            scope: self.scope.clone(),
        }
    }
}

/// Result of one store call. Failure reasons are opaque to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOutcome {
    Done,
    Failed { reason: String },
}

impl StoreOutcome {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }
}

pub trait ResultsStore {
    fn fetch_results(&self, scope: &ResultScope) -> anyhow::Result<Vec<ResultRecord>>;
    fn upsert_result(&self, record: &ResultRecord) -> StoreOutcome;
    fn delete_result(&self, key: &ResultKey) -> StoreOutcome;
}

pub struct SqliteResultsStore<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteResultsStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn try_upsert(&self, record: &ResultRecord) -> anyhow::Result<()> {
        let scores_json = serde_json::to_string(&record.component_scores)?;
        let now = chrono::Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO results(
               student_id, class_id, subject_code, session, term,
               component_scores, total_score, grade, updated_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(student_id, class_id, subject_code, session, term) DO UPDATE SET
               component_scores = excluded.component_scores,
               total_score = excluded.total_score,
               grade = excluded.grade,
               updated_at = excluded.updated_at",
            (
                &record.student_id,
                &record.scope.class_id,
                &record.scope.subject_code,
                &record.scope.session,
                &record.scope.term,
                scores_json,
                record.total_score,
                &record.grade,
                now,
            ),
        )?;
        Ok(())
    }

    fn try_delete(&self, key: &ResultKey) -> anyhow::Result<usize> {
        let n = self.conn.execute(
            "DELETE FROM results
             WHERE student_id = ? AND class_id = ? AND subject_code = ? AND session = ? AND term = ?",
            (
                &key.student_id,
                &key.scope.class_id,
                &key.scope.subject_code,
                &key.scope.session,
                &key.scope.term,
            ),
        )?;
        Ok(n)
    }
}

impl ResultsStore for SqliteResultsStore<'_> {
    fn fetch_results(&self, scope: &ResultScope) -> anyhow::Result<Vec<ResultRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT student_id, component_scores, total_score, grade, updated_at
             FROM results
             WHERE class_id = ? AND subject_code = ? AND session = ? AND term = ?
             ORDER BY student_id",
        )?;
        let rows = stmt
            .query_map(
                (
                    &scope.class_id,
                    &scope.subject_code,
                    &scope.session,
                    &scope.term,
                ),
                |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, f64>(2)?,
                        r.get::<_, String>(3)?,
                        r.get::<_, Option<String>>(4)?,
                    ))
                },
            )?
            .collect::<Result<Vec<_>, _>>()?;

        let mut out = Vec::with_capacity(rows.len());
        for (student_id, scores_json, total_score, grade, updated_at) in rows {
            let component_scores: ComponentScores = serde_json::from_str(&scores_json)
                .with_context(|| format!("component_scores for student {} is malformed", student_id))?;
            out.push(ResultRecord {
                student_id,
                scope: scope.clone(),
                component_scores,
                total_score,
                grade,
                updated_at,
            });
        }
        Ok(out)
    }

    fn upsert_result(&self, record: &ResultRecord) -> StoreOutcome {
        match self.try_upsert(record) {
            Ok(()) => StoreOutcome::Done,
            Err(e) => StoreOutcome::failed(format!("{e:#}")),
        }
    }

    fn delete_result(&self, key: &ResultKey) -> StoreOutcome {
        match self.try_delete(key) {
            Ok(0) => {
                // Already gone: the requested end state holds.
                debug!(student_id = %key.student_id, "delete matched no row");
                StoreOutcome::Done
            }
            Ok(_) => StoreOutcome::Done,
            Err(e) => StoreOutcome::failed(format!("{e:#}")),
        }
    }
}
