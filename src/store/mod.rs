// Detection Summary - Result Store
//
// episode_key -> records (newest first, capped), guarded by one mutex with a
// condvar for waiters. Every mutation persists the whole document with an
// atomic temp-fsync-rename. Serialization happens under the data lock; the
// file write happens outside it, ordered by a generation counter so an
// older snapshot never replaces a newer one.


use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bundle::ResultRecord;
use crate::config::StoreConfig;
use crate::constants::STORE_VERSION;
use crate::error::{Result, SummaryError};
use crate::paths::temp_path_for;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreDocument {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    records: BTreeMap<String, Vec<ResultRecord>>,
}

struct StoreState {
    doc: StoreDocument,
    generation: u64,
}

/// Eligibility filter for window lookups.
#[derive(Debug, Clone)]
pub struct WindowQuery {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub include_consumed: bool,
    pub max_age_secs: Option<f64>,
}

impl WindowQuery {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start,
            end,
            include_consumed: false,
            max_age_secs: None,
        }
    }

    pub fn include_consumed(mut self, include: bool) -> Self {
        self.include_consumed = include;
        self
    }

    pub fn max_age_secs(mut self, secs: Option<f64>) -> Self {
        self.max_age_secs = secs;
        self
    }

    fn admits(&self, record: &ResultRecord, now: DateTime<Utc>) -> bool {
        if record.created_at < self.start || record.created_at > self.end {
            return false;
        }
        if !self.include_consumed && record.consumed {
            return false;
        }
        if let Some(max_age) = self.max_age_secs {
            let age = (now - record.created_at).num_milliseconds() as f64 / 1000.0;
            if age > max_age {
                return false;
            }
        }
        true
    }
}

pub struct ResultStore {
    config: StoreConfig,
    state: Mutex<StoreState>,
    changed: Condvar,
    /// Last generation written to disk
    writer: Mutex<u64>,
}

impl ResultStore {
    /// Load the document at the configured path. Missing starts empty; a
    /// malformed document is logged and also starts empty.
    pub fn open(config: StoreConfig) -> Result<Self> {
        if config.max_records_per_key == 0 {
            return Err(SummaryError::Config(
                "max_records_per_key must be at least 1".to_string(),
            ));
        }

        let doc = load_document(&config.state_path);
        let count: usize = doc.records.values().map(|v| v.len()).sum();
        log::info!(
            "Result store at {} loaded {} records across {} keys",
            config.state_path.display(),
            count,
            doc.records.len()
        );

        Ok(Self {
            config,
            state: Mutex::new(StoreState { doc, generation: 0 }),
            changed: Condvar::new(),
            writer: Mutex::new(0),
        })
    }

    pub fn state_path(&self) -> &Path {
        &self.config.state_path
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert a record at the head of its key, keep newest-first order and
    /// the per-key cap, persist, wake waiters.
    pub fn publish(&self, episode_key: &str, record: &ResultRecord) -> Result<()> {
        let mut record = record.clone();
        if record.episode_key.is_empty() {
            record.episode_key = episode_key.to_string();
        }
        if !record.consumed {
            record.consumed_at = None;
        }

        let snapshot = {
            let mut state = self.lock();
            let list = state.doc.records.entry(episode_key.to_string()).or_default();
            list.insert(0, record);
            list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            list.truncate(self.config.max_records_per_key);
            self.snapshot(&mut state)?
        };
        self.changed.notify_all();
        self.persist(snapshot)
    }

    /// Highest-scoring eligible record; ties go to the newest.
    pub fn get_best_in_window(&self, episode_key: &str, query: &WindowQuery) -> Option<ResultRecord> {
        let state = self.lock();
        best_in(&state.doc, episode_key, query, Utc::now())
    }

    /// Block until an eligible record exists or `timeout` passes.
    pub fn wait_for_window(&self, episode_key: &str, query: &WindowQuery, timeout: Duration) -> Option<ResultRecord> {
        self.wait_until(timeout, |doc| best_in(doc, episode_key, query, Utc::now()))
    }

    /// Exact lookup. A consumed record reads as absent unless requested.
    pub fn get_by_id(&self, episode_key: &str, session_id: &str, include_consumed: bool) -> Option<ResultRecord> {
        let state = self.lock();
        by_id(&state.doc, episode_key, session_id, include_consumed)
    }

    pub fn wait_for_id(
        &self,
        episode_key: &str,
        session_id: &str,
        include_consumed: bool,
        timeout: Duration,
    ) -> Option<ResultRecord> {
        self.wait_until(timeout, |doc| by_id(doc, episode_key, session_id, include_consumed))
    }

    fn wait_until<F>(&self, timeout: Duration, mut probe: F) -> Option<ResultRecord>
    where
        F: FnMut(&StoreDocument) -> Option<ResultRecord>,
    {
        // None: the deadline is past Instant's range, so wait without one
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.lock();
        loop {
            if let Some(found) = probe(&state.doc) {
                return Some(found);
            }
            state = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    self.changed
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(|e| e.into_inner())
                        .0
                }
                None => self.changed.wait(state).unwrap_or_else(|e| e.into_inner()),
            };
        }
    }

    /// Mark a session consumed. Returns whether the id exists at all; a
    /// second call keeps the first `consumed_at`.
    pub fn mark_consumed(&self, episode_key: &str, session_id: &str) -> Result<bool> {
        let snapshot = {
            let mut state = self.lock();
            let Some(record) = state
                .doc
                .records
                .get_mut(episode_key)
                .and_then(|list| list.iter_mut().find(|r| r.session_id == session_id))
            else {
                return Ok(false);
            };
            if record.consumed {
                return Ok(true);
            }
            record.consumed = true;
            record.consumed_at = Some(Utc::now());
            self.snapshot(&mut state)?
        };
        self.changed.notify_all();
        self.persist(snapshot)?;
        Ok(true)
    }

    /// Drop records older than `retention_hours` across all keys. Returns
    /// how many were removed.
    pub fn cleanup(&self, retention_hours: f64) -> Result<usize> {
        self.cleanup_at(retention_hours, Utc::now())
    }

    pub fn cleanup_at(&self, retention_hours: f64, now: DateTime<Utc>) -> Result<usize> {
        let retention_ms = (retention_hours.max(0.0) * 3600.0 * 1000.0) as i64;
        // A retention reaching past the representable range keeps everything.
        let Some(cutoff) = chrono::Duration::try_milliseconds(retention_ms).and_then(|d| now.checked_sub_signed(d))
        else {
            return Ok(0);
        };

        let snapshot = {
            let mut state = self.lock();
            let mut removed = 0;
            for list in state.doc.records.values_mut() {
                let before = list.len();
                list.retain(|r| r.created_at >= cutoff);
                removed += before - list.len();
            }
            state.doc.records.retain(|_, list| !list.is_empty());
            if removed == 0 {
                return Ok(0);
            }
            (removed, self.snapshot(&mut state)?)
        };
        self.changed.notify_all();
        log::info!("Result store cleanup removed {} records older than {}h", snapshot.0, retention_hours);
        self.persist(snapshot.1)?;
        Ok(snapshot.0)
    }

    /// Records for a key, newest first (consumed included).
    pub fn list(&self, episode_key: &str, limit: Option<usize>) -> Vec<ResultRecord> {
        let state = self.lock();
        let list = state.doc.records.get(episode_key).cloned().unwrap_or_default();
        match limit {
            Some(n) => list.into_iter().take(n).collect(),
            None => list,
        }
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock().doc.records.keys().cloned().collect()
    }

    fn snapshot(&self, state: &mut StoreState) -> Result<(u64, String)> {
        state.generation += 1;
        state.doc.version = STORE_VERSION;
        let json = serde_json::to_string_pretty(&state.doc)?;
        Ok((state.generation, json))
    }

    fn persist(&self, (generation, json): (u64, String)) -> Result<()> {
        let mut written = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        if generation <= *written {
            return Ok(());
        }
        write_atomic(&self.config.state_path, &json)?;
        *written = generation;
        Ok(())
    }
}

fn best_in(doc: &StoreDocument, episode_key: &str, query: &WindowQuery, now: DateTime<Utc>) -> Option<ResultRecord> {
    doc.records
        .get(episode_key)?
        .iter()
        .filter(|r| query.admits(r, now))
        .max_by(|a, b| {
            a.score()
                .total_cmp(&b.score())
                .then_with(|| a.created_at.cmp(&b.created_at))
        })
        .cloned()
}

fn by_id(doc: &StoreDocument, episode_key: &str, session_id: &str, include_consumed: bool) -> Option<ResultRecord> {
    let record = doc
        .records
        .get(episode_key)?
        .iter()
        .find(|r| r.session_id == session_id)?;
    if record.consumed && !include_consumed {
        return None;
    }
    Some(record.clone())
}

fn load_document(path: &Path) -> StoreDocument {
    if !path.exists() {
        return StoreDocument::default();
    }
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) => {
            log::warn!("Failed to read result store {}: {}; starting empty", path.display(), e);
            return StoreDocument::default();
        }
    };
    match serde_json::from_str::<StoreDocument>(&raw) {
        Ok(doc) => doc,
        Err(e) => {
            log::warn!("Malformed result store {}: {}; starting empty", path.display(), e);
            StoreDocument::default()
        }
    }
}

/// temp file, fsync, rename over the target.
fn write_atomic(path: &Path, json: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let tmp_path = temp_path_for(path);
    {
        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)?;

    if let Some(parent) = path.parent() {
        if let Ok(dir) = std::fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}
