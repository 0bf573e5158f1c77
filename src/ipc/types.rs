use crate::cache::TtlCache;
use crate::config::ConfigCache;
use crate::reconcile::SaveGate;
use crate::store::{ResultRecord, ResultScope};
use rusqlite::Connection;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    pub busy_timeout: Duration,
    pub config_cache: ConfigCache,
    pub save_gate: SaveGate,
    /// Records as last returned by `results.fetch`, the baseline for the next save.
    /// A grid left open past the TTL is re-read at save time.
    pub snapshots: TtlCache<ResultScope, Vec<ResultRecord>>,
}

impl AppState {
    pub fn new(config_ttl: Duration, snapshot_ttl: Duration, busy_timeout: Duration) -> Self {
        Self {
            workspace: None,
            db: None,
            busy_timeout,
            config_cache: ConfigCache::new(config_ttl),
            save_gate: SaveGate::new(),
            snapshots: TtlCache::new(snapshot_ttl),
        }
    }
}
