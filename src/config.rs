use crate::cache::TtlCache;
use crate::db;
use crate::grading::{ComponentWeight, GradeBoundary, ScoringConfig};
use anyhow::{anyhow, Context};
use rusqlite::Connection;
use serde::Serialize;
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::debug;

/// Source of scoring configuration for a (session, term).
pub trait ScoringConfigProvider {
    fn scoring_config(&self, session: &str, term: &str) -> anyhow::Result<ScoringConfig>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigSource {
    Period,
    Global,
    Default,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedConfig {
    pub config: ScoringConfig,
    pub source: ConfigSource,
}

/// Resolved configs keyed by (session, term).
pub struct ConfigCache {
    inner: TtlCache<(String, String), ResolvedConfig>,
}

impl ConfigCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: TtlCache::new(ttl),
        }
    }

    fn get(&self, key: &(String, String)) -> Option<ResolvedConfig> {
        self.inner.get(key)
    }

    fn insert(&self, key: (String, String), value: ResolvedConfig) {
        let purged = self.inner.purge_expired();
        self.inner.insert(key, value);
        debug!(purged, size = self.inner.len(), "scoring config cached");
    }

    /// A global override changes the effective config of every period, so
    /// any write drops the whole cache.
    pub fn invalidate_all(&self) {
        self.inner.clear();
    }
}

/// Period row, then the workspace-wide row (empty session/term), then the
/// built-in default.
pub struct SqliteScoringConfigs<'a> {
    conn: &'a Connection,
    cache: &'a ConfigCache,
}

impl<'a> SqliteScoringConfigs<'a> {
    pub fn new(conn: &'a Connection, cache: &'a ConfigCache) -> Self {
        Self { conn, cache }
    }

    pub fn resolve(&self, session: &str, term: &str) -> anyhow::Result<ResolvedConfig> {
        let key = (session.to_string(), term.to_string());
        if let Some(hit) = self.cache.get(&key) {
            return Ok(hit);
        }

        let resolved = if let Some(cfg) = self.load(session, term)? {
            ResolvedConfig {
                config: cfg,
                source: ConfigSource::Period,
            }
        } else if let Some(cfg) = self.load("", "")? {
            ResolvedConfig {
                config: cfg,
                source: ConfigSource::Global,
            }
        } else {
            debug!(session, term, "no scoring config stored; using system default");
            ResolvedConfig {
                config: ScoringConfig::system_default(),
                source: ConfigSource::Default,
            }
        };

        self.cache.insert(key, resolved.clone());
        Ok(resolved)
    }

    fn load(&self, session: &str, term: &str) -> anyhow::Result<Option<ScoringConfig>> {
        let Some(raw) = db::scoring_config_get_json(self.conn, session, term)? else {
            return Ok(None);
        };
        let cfg: ScoringConfig = serde_json::from_value(raw).with_context(|| {
            format!(
                "stored scoring config for session '{}' term '{}' is malformed",
                session, term
            )
        })?;
        Ok(Some(cfg))
    }

    /// Validates and stores `config`; empty session and term write the
    /// workspace-wide override.
    pub fn save(&self, session: &str, term: &str, config: &ScoringConfig) -> anyhow::Result<()> {
        config
            .validate()
            .map_err(|e| anyhow!("refusing to store invalid scoring config: {}", e))?;
        db::scoring_config_set_json(self.conn, session, term, &serde_json::to_value(config)?)?;
        self.cache.invalidate_all();
        Ok(())
    }
}

impl ScoringConfigProvider for SqliteScoringConfigs<'_> {
    fn scoring_config(&self, session: &str, term: &str) -> anyhow::Result<ScoringConfig> {
        self.resolve(session, term).map(|r| r.config)
    }
}

/// Applies a `{componentWeights?, boundaries?}` patch on top of `current`.
/// Missing fields keep their current value; unknown fields are rejected.
pub fn merge_config_patch(current: &mut ScoringConfig, patch: &Map<String, Value>) -> Result<(), String> {
    for (k, v) in patch {
        match k.as_str() {
            "componentWeights" => {
                current.component_weights = parse_component_weights(v)?;
            }
            "boundaries" => {
                current.boundaries = parse_boundaries(v)?;
            }
            _ => return Err(format!("unknown scoring config field: {}", k)),
        }
    }
    Ok(())
}

fn parse_component_weights(v: &Value) -> Result<Vec<ComponentWeight>, String> {
    let Some(arr) = v.as_array() else {
        return Err("componentWeights must be an array of {key, max}".into());
    };
    let mut out = Vec::with_capacity(arr.len());
    for (i, item) in arr.iter().enumerate() {
        let Some(key) = item.get("key").and_then(|k| k.as_str()) else {
            return Err(format!("componentWeights[{}].key must be a string", i));
        };
        let max = match item.get("max").and_then(|m| m.as_i64()) {
            Some(m) if m >= 0 && m <= i64::from(u32::MAX) => m as u32,
            _ => {
                return Err(format!(
                    "componentWeights[{}].max must be a non-negative integer",
                    i
                ))
            }
        };
        out.push(ComponentWeight {
            key: key.trim().to_ascii_lowercase(),
            max,
        });
    }
    Ok(out)
}

fn parse_boundaries(v: &Value) -> Result<Vec<GradeBoundary>, String> {
    let Some(arr) = v.as_array() else {
        return Err("boundaries must be an array of {letter, minScore}".into());
    };
    let mut out = Vec::with_capacity(arr.len());
    for (i, item) in arr.iter().enumerate() {
        let Some(letter) = item.get("letter").and_then(|l| l.as_str()) else {
            return Err(format!("boundaries[{}].letter must be a string", i));
        };
        let Some(min_score) = item.get("minScore").and_then(|m| m.as_f64()) else {
            return Err(format!("boundaries[{}].minScore must be a number", i));
        };
        let remark = match item.get("remark") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) if s.trim().is_empty() => None,
            Some(Value::String(s)) => Some(s.trim().to_string()),
            Some(_) => return Err(format!("boundaries[{}].remark must be a string", i)),
        };
        out.push(GradeBoundary {
            letter: letter.trim().to_string(),
            min_score,
            remark,
        });
    }
    // Accept any order on input; the table is stored highest minimum first.
    out.sort_by(|a, b| b.min_score.total_cmp(&a.min_score));
    Ok(out)
}
