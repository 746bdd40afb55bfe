// =============================================================================
// Persistence — append-only stream files, snapshots, replay
// =============================================================================
//
// One JSONL file per stream (alerts, orders, fills, mode_transitions,
// risk_violations) under the data directory. Every record is wrapped in an
// envelope carrying a per-stream monotonically increasing sequence number.
// Files rotate by size; rotated files shift .1 -> .2 -> ... and the oldest
// beyond the retention window is deleted.
//
// Snapshots (one JSON file per strategy and paper account) use the atomic
// tmp + rename pattern.
//
// Degraded mode: when an append fails, records buffer in memory and every
// subsequent append first tries to flush the backlog in order. Past a 30 s
// window the store reports degraded-beyond-window and ingress answers 503.
// =============================================================================

use std::collections::VecDeque;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::PersistenceConfig;

/// How long writes may buffer in memory before the engine degrades.
const DEGRADED_WINDOW_SECS: u64 = 30;

/// The persisted streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stream {
    Alerts,
    Orders,
    Fills,
    ModeTransitions,
    RiskViolations,
}

impl Stream {
    pub const ALL: [Stream; 5] = [
        Stream::Alerts,
        Stream::Orders,
        Stream::Fills,
        Stream::ModeTransitions,
        Stream::RiskViolations,
    ];

    fn file_name(&self) -> &'static str {
        match self {
            Stream::Alerts => "alerts.jsonl",
            Stream::Orders => "orders.jsonl",
            Stream::Fills => "fills.jsonl",
            Stream::ModeTransitions => "mode_transitions.jsonl",
            Stream::RiskViolations => "risk_violations.jsonl",
        }
    }

    fn index(&self) -> usize {
        match self {
            Stream::Alerts => 0,
            Stream::Orders => 1,
            Stream::Fills => 2,
            Stream::ModeTransitions => 3,
            Stream::RiskViolations => 4,
        }
    }
}

/// Wire envelope around every persisted record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub seq: u64,
    pub ts: DateTime<Utc>,
    pub data: serde_json::Value,
}

struct StreamState {
    seq: u64,
    file_size: u64,
}

struct Inner {
    streams: [StreamState; 5],
    /// Backlog of (stream, serialized line) awaiting a successful flush.
    backlog: VecDeque<(Stream, String)>,
    first_failure: Option<Instant>,
}

/// Write-ahead-ordered store for the engine's durable state.
pub struct PersistentStore {
    data_dir: PathBuf,
    config: PersistenceConfig,
    inner: Mutex<Inner>,
}

impl PersistentStore {
    /// Open (or create) the store under `data_dir`, recovering each stream's
    /// next sequence number from the existing files.
    pub fn open(data_dir: impl Into<PathBuf>, config: PersistenceConfig) -> Result<Self> {
        let data_dir = data_dir.into();
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create data dir {}", data_dir.display()))?;
        std::fs::create_dir_all(data_dir.join("snapshots"))
            .context("failed to create snapshots dir")?;

        let mut streams: Vec<StreamState> = Vec::with_capacity(5);
        for stream in Stream::ALL {
            let path = data_dir.join(stream.file_name());
            let file_size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            let seq = last_seq_in(&path).unwrap_or(0);
            streams.push(StreamState { seq, file_size });
        }
        let streams: [StreamState; 5] = streams
            .try_into()
            .map_err(|_| anyhow::anyhow!("stream state initialisation failed"))?;

        info!(data_dir = %data_dir.display(), "persistent store opened");
        Ok(Self {
            data_dir,
            config,
            inner: Mutex::new(Inner {
                streams,
                backlog: VecDeque::new(),
                first_failure: None,
            }),
        })
    }

    // -------------------------------------------------------------------------
    // Appends
    // -------------------------------------------------------------------------

    /// Append a record to `stream`. Returns its sequence number. Failures
    /// buffer the record and mark the store degraded instead of erroring.
    pub fn append<T: Serialize>(&self, stream: Stream, data: &T) -> u64 {
        let mut inner = self.inner.lock();

        let state = &mut inner.streams[stream.index()];
        state.seq += 1;
        let seq = state.seq;

        let record = Record {
            seq,
            ts: Utc::now(),
            data: serde_json::to_value(data).unwrap_or(serde_json::Value::Null),
        };
        let line = match serde_json::to_string(&record) {
            Ok(l) => l,
            Err(e) => {
                error!(error = %e, "record serialisation failed — dropped");
                return seq;
            }
        };

        // Flush any backlog first so stream order is preserved.
        self.flush_backlog_locked(&mut inner);

        if inner.backlog.is_empty() {
            match self.write_line(stream, &line) {
                Ok(bytes) => {
                    let state = &mut inner.streams[stream.index()];
                    state.file_size += bytes;
                    if state.file_size >= self.config.rotate_bytes {
                        if let Err(e) = self.rotate(stream) {
                            warn!(stream = ?stream, error = %e, "stream rotation failed");
                        } else {
                            inner.streams[stream.index()].file_size = 0;
                        }
                    }
                    return seq;
                }
                Err(e) => {
                    warn!(stream = ?stream, error = %e, "append failed — buffering in memory");
                }
            }
        }

        if inner.first_failure.is_none() {
            inner.first_failure = Some(Instant::now());
        }
        inner.backlog.push_back((stream, line));
        seq
    }

    /// True when writes are currently buffering in memory.
    pub fn is_degraded(&self) -> bool {
        !self.inner.lock().backlog.is_empty()
    }

    /// True when the buffer has been failing longer than the 30 s window;
    /// ingress refuses new traffic with 503 at this point.
    pub fn degraded_beyond_window(&self) -> bool {
        let inner = self.inner.lock();
        match inner.first_failure {
            Some(t) => {
                !inner.backlog.is_empty() && t.elapsed().as_secs() >= DEGRADED_WINDOW_SECS
            }
            None => false,
        }
    }

    /// Attempt to flush the in-memory backlog (called from appends and from a
    /// periodic recovery task).
    pub fn try_recover(&self) {
        let mut inner = self.inner.lock();
        self.flush_backlog_locked(&mut inner);
    }

    fn flush_backlog_locked(&self, inner: &mut Inner) {
        while let Some((stream, line)) = inner.backlog.front().cloned() {
            match self.write_line(stream, &line) {
                Ok(bytes) => {
                    inner.backlog.pop_front();
                    inner.streams[stream.index()].file_size += bytes;
                }
                Err(_) => return,
            }
        }
        if inner.backlog.is_empty() && inner.first_failure.take().is_some() {
            info!("persistence recovered — backlog flushed in order");
        }
    }

    fn write_line(&self, stream: Stream, line: &str) -> Result<u64> {
        let path = self.data_dir.join(stream.file_name());
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        Ok(line.len() as u64 + 1)
    }

    /// Shift rotated files up one slot and truncate the live file.
    fn rotate(&self, stream: Stream) -> Result<()> {
        let base = self.data_dir.join(stream.file_name());

        let oldest = rotated_path(&base, self.config.retain_files);
        if oldest.exists() {
            std::fs::remove_file(&oldest)
                .with_context(|| format!("failed to delete {}", oldest.display()))?;
        }
        for slot in (1..self.config.retain_files).rev() {
            let from = rotated_path(&base, slot);
            if from.exists() {
                std::fs::rename(&from, rotated_path(&base, slot + 1))?;
            }
        }
        std::fs::rename(&base, rotated_path(&base, 1))?;
        info!(stream = ?stream, "stream file rotated");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Replay
    // -------------------------------------------------------------------------

    /// Read every retained record of `stream`, oldest first, including
    /// rotated files.
    pub fn replay(&self, stream: Stream) -> Result<Vec<Record>> {
        let base = self.data_dir.join(stream.file_name());
        let mut records = Vec::new();

        for slot in (1..=self.config.retain_files).rev() {
            read_records(&rotated_path(&base, slot), &mut records)?;
        }
        read_records(&base, &mut records)?;

        records.sort_by_key(|r| r.seq);
        Ok(records)
    }

    // -------------------------------------------------------------------------
    // Snapshots
    // -------------------------------------------------------------------------

    /// Atomically write a named snapshot (tmp + rename).
    pub fn write_snapshot<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        let path = self.snapshot_path(name);
        let content = serde_json::to_string_pretty(value)
            .with_context(|| format!("failed to serialise snapshot {name}"))?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, content)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("failed to rename {}", path.display()))?;
        Ok(())
    }

    /// Read a named snapshot, `None` when absent.
    pub fn read_snapshot<T: for<'de> Deserialize<'de>>(&self, name: &str) -> Result<Option<T>> {
        let path = self.snapshot_path(name);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let value = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse snapshot {name}"))?;
        Ok(Some(value))
    }

    /// Names of every snapshot with the given prefix.
    pub fn list_snapshots(&self, prefix: &str) -> Vec<String> {
        let dir = self.data_dir.join("snapshots");
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|n| n.ends_with(".json"))
            .map(|n| n.trim_end_matches(".json").to_string())
            .filter(|n| n.starts_with(prefix))
            .collect();
        names.sort();
        names
    }

    fn snapshot_path(&self, name: &str) -> PathBuf {
        // Snapshot names derive from ids; keep them path-safe.
        let safe: String = name
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
            .collect();
        self.data_dir.join("snapshots").join(format!("{safe}.json"))
    }
}

impl std::fmt::Debug for PersistentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("PersistentStore")
            .field("data_dir", &self.data_dir)
            .field("backlog", &inner.backlog.len())
            .finish()
    }
}

fn rotated_path(base: &Path, slot: usize) -> PathBuf {
    let mut os = base.as_os_str().to_owned();
    os.push(format!(".{slot}"));
    PathBuf::from(os)
}

fn read_records(path: &Path, out: &mut Vec<Record>) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Record>(line) {
            Ok(r) => out.push(r),
            Err(e) => warn!(path = %path.display(), error = %e, "skipping corrupt record"),
        }
    }
    Ok(())
}

/// Last sequence number in the live stream file (rotated files only ever
/// contain earlier sequences).
fn last_seq_in(path: &Path) -> Option<u64> {
    let content = std::fs::read_to_string(path).ok()?;
    content
        .lines()
        .rev()
        .find_map(|l| serde_json::from_str::<Record>(l).ok())
        .map(|r| r.seq)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &Path) -> PersistentStore {
        PersistentStore::open(dir, PersistenceConfig::default()).unwrap()
    }

    #[test]
    fn appends_are_sequenced_per_stream() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());

        assert_eq!(s.append(Stream::Alerts, &serde_json::json!({"a": 1})), 1);
        assert_eq!(s.append(Stream::Alerts, &serde_json::json!({"a": 2})), 2);
        assert_eq!(s.append(Stream::Orders, &serde_json::json!({"o": 1})), 1);

        let alerts = s.replay(Stream::Alerts).unwrap();
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].seq, 1);
        assert_eq!(alerts[1].seq, 2);
        assert_eq!(alerts[1].data["a"], 2);
    }

    #[test]
    fn sequence_resumes_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let s = store(dir.path());
            s.append(Stream::Fills, &serde_json::json!({"f": 1}));
            s.append(Stream::Fills, &serde_json::json!({"f": 2}));
        }
        let s = store(dir.path());
        assert_eq!(s.append(Stream::Fills, &serde_json::json!({"f": 3})), 3);
        assert_eq!(s.replay(Stream::Fills).unwrap().len(), 3);
    }

    #[test]
    fn rotation_preserves_replay_order() {
        let dir = tempfile::tempdir().unwrap();
        let s = PersistentStore::open(
            dir.path(),
            PersistenceConfig {
                rotate_bytes: 2048,
                retain_files: 6,
            },
        )
        .unwrap();

        for i in 0..50 {
            s.append(Stream::Orders, &serde_json::json!({"i": i, "pad": "x".repeat(32)}));
        }

        let records = s.replay(Stream::Orders).unwrap();
        assert_eq!(records.len(), 50);
        for (idx, r) in records.iter().enumerate() {
            assert_eq!(r.seq, idx as u64 + 1);
        }
        // Rotation actually happened.
        assert!(rotated_path(&dir.path().join("orders.jsonl"), 1).exists());
    }

    #[test]
    fn snapshots_roundtrip_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());

        s.write_snapshot("strategy-new_ma", &serde_json::json!({"mode": "paper"}))
            .unwrap();
        s.write_snapshot("account-sim-001", &serde_json::json!({"balance": 100000.0}))
            .unwrap();

        let loaded: Option<serde_json::Value> = s.read_snapshot("strategy-new_ma").unwrap();
        assert_eq!(loaded.unwrap()["mode"], "paper");

        assert_eq!(s.list_snapshots("strategy-"), vec!["strategy-new_ma"]);
        let missing: Option<serde_json::Value> = s.read_snapshot("strategy-none").unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn degraded_buffering_flushes_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        s.append(Stream::Alerts, &serde_json::json!({"n": 0}));

        // Force failures by replacing the stream file with a directory.
        let path = dir.path().join("alerts.jsonl");
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();

        s.append(Stream::Alerts, &serde_json::json!({"n": 1}));
        s.append(Stream::Alerts, &serde_json::json!({"n": 2}));
        assert!(s.is_degraded());
        assert!(!s.degraded_beyond_window());

        // Restore writability; the next append flushes the backlog first.
        std::fs::remove_dir(&path).unwrap();
        s.append(Stream::Alerts, &serde_json::json!({"n": 3}));
        assert!(!s.is_degraded());

        let records = s.replay(Stream::Alerts).unwrap();
        let ns: Vec<i64> = records
            .iter()
            .map(|r| r.data["n"].as_i64().unwrap())
            .collect();
        assert_eq!(ns, vec![0, 1, 2, 3]);
    }

    #[test]
    fn corrupt_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        s.append(Stream::Alerts, &serde_json::json!({"ok": true}));

        let path = dir.path().join("alerts.jsonl");
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(f, "this is not json").unwrap();

        let records = s.replay(Stream::Alerts).unwrap();
        assert_eq!(records.len(), 1);
    }
}
