//! Short-term conversational memory and the long-term workflow store.
//!
//! Short-term memory is a bounded FIFO of [`Turn`]s (default 20), never
//! persisted across restarts. [`SessionMemory`] keys one FIFO per HTTP
//! session id and mirrors each session to `sessions/<id>.json` so history
//! survives for inspection, while the in-process window stays authoritative.
//!
//! Long-term memory is the append-only workflow store: one JSON record per
//! line in `workflows-YYYY-MM.jsonl`. On the first write of a new calendar
//! month — or whenever the in-memory set exceeds [`MAX_RESIDENT_RECORDS`] —
//! the oldest records are moved to a dated archive file and dropped from
//! memory. All writes are serialised behind a single writer lock.

use std::collections::{HashMap, VecDeque};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, Utc};
use tokio::sync::Mutex;

use crate::taskweave::error::{EngineError, EngineResult};
use crate::taskweave::task::{Turn, WorkflowRecord};

/// Records kept in memory before the oldest spill to the archive.
pub const MAX_RESIDENT_RECORDS: usize = 10_000;

/// Bounded FIFO of conversation turns.
///
/// # Example
///
/// ```rust
/// use taskweave::memory::ShortTermMemory;
/// use taskweave::task::Turn;
///
/// let mut memory = ShortTermMemory::new(2);
/// memory.append(Turn::user("one"));
/// memory.append(Turn::assistant("two"));
/// memory.append(Turn::user("three"));
/// let turns = memory.as_messages();
/// assert_eq!(turns.len(), 2);
/// assert_eq!(turns[0].text, "two");
/// ```
#[derive(Debug, Clone)]
pub struct ShortTermMemory {
    window: usize,
    turns: VecDeque<Turn>,
}

impl ShortTermMemory {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            turns: VecDeque::new(),
        }
    }

    /// Append a turn, evicting the oldest once the window is full.
    pub fn append(&mut self, turn: Turn) {
        if self.turns.len() == self.window {
            self.turns.pop_front();
        }
        self.turns.push_back(turn);
    }

    /// The retained turns, oldest first.
    pub fn as_messages(&self) -> Vec<Turn> {
        self.turns.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}

/// Per-session conversation memory, one FIFO per session id.
pub struct SessionMemory {
    window: usize,
    dir: Option<PathBuf>,
    sessions: Mutex<HashMap<String, ShortTermMemory>>,
}

impl SessionMemory {
    /// In-process only; nothing touches disk.
    pub fn ephemeral(window: usize) -> Self {
        Self {
            window,
            dir: None,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Mirror sessions to `dir/sessions/<id>.json`.
    pub fn with_dir(window: usize, dir: &Path) -> Self {
        Self {
            window,
            dir: Some(dir.join("sessions")),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Append a turn to a session's FIFO.
    pub async fn append(&self, session_id: &str, turn: Turn) {
        let mut sessions = self.sessions.lock().await;
        let memory = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| ShortTermMemory::new(self.window));
        memory.append(turn);
        if let Some(dir) = &self.dir {
            if let Err(e) = persist_session(dir, session_id, memory) {
                log::warn!("session {} not persisted: {}", session_id, e);
            }
        }
    }

    /// Current window for a session, oldest first.
    pub async fn history(&self, session_id: &str) -> Vec<Turn> {
        self.sessions
            .lock()
            .await
            .get(session_id)
            .map(|m| m.as_messages())
            .unwrap_or_default()
    }

    /// Drop a session's turns.
    pub async fn clear(&self, session_id: &str) {
        self.sessions.lock().await.remove(session_id);
    }
}

fn persist_session(dir: &Path, session_id: &str, memory: &ShortTermMemory) -> std::io::Result<()> {
    fs::create_dir_all(dir)?;
    // Session ids were validated at the HTTP boundary; keep the filename flat
    // anyway.
    let safe: String = session_id
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    let path = dir.join(format!("{}.json", safe));
    let payload = serde_json::to_string_pretty(&memory.as_messages())
        .unwrap_or_else(|_| "[]".to_string());
    fs::write(path, payload)
}

struct LongTermInner {
    records: VecDeque<WorkflowRecord>,
    current_month: String,
}

/// Append-only structured store for completed workflows.
pub struct LongTermMemory {
    dir: PathBuf,
    resident_cap: usize,
    inner: Mutex<LongTermInner>,
}

fn month_key(when: DateTime<Utc>) -> String {
    format!("{:04}-{:02}", when.year(), when.month())
}

impl LongTermMemory {
    /// Open the store, loading the current month's records back into memory.
    pub fn open(dir: &Path) -> EngineResult<Self> {
        fs::create_dir_all(dir).map_err(|e| {
            EngineError::Storage(format!("cannot create {}: {}", dir.display(), e))
        })?;
        let current_month = month_key(Utc::now());
        let mut records = VecDeque::new();
        let path = dir.join(format!("workflows-{}.jsonl", current_month));
        if path.exists() {
            let raw = fs::read_to_string(&path)
                .map_err(|e| EngineError::Storage(format!("cannot read store: {}", e)))?;
            for line in raw.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<WorkflowRecord>(line) {
                    Ok(record) => records.push_back(record),
                    Err(e) => log::warn!("skipping corrupt workflow record: {}", e),
                }
            }
        }
        Ok(Self {
            dir: dir.to_path_buf(),
            resident_cap: MAX_RESIDENT_RECORDS,
            inner: Mutex::new(LongTermInner {
                records,
                current_month,
            }),
        })
    }

    /// Override the resident cap (tests exercise the spill without writing
    /// ten thousand records).
    pub fn with_resident_cap(mut self, cap: usize) -> Self {
        self.resident_cap = cap.max(1);
        self
    }

    /// Append a workflow record, rotating first when the month rolled over
    /// or the resident set is full.
    pub async fn store(&self, record: WorkflowRecord) -> EngineResult<()> {
        let mut inner = self.inner.lock().await;
        self.rotate_locked(&mut inner, Utc::now())?;

        let path = self
            .dir
            .join(format!("workflows-{}.jsonl", inner.current_month));
        let line = serde_json::to_string(&record)
            .map_err(|e| EngineError::Storage(format!("serialize failed: {}", e)))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| EngineError::Storage(format!("open failed: {}", e)))?;
        file.write_all(line.as_bytes())
            .and_then(|_| file.write_all(b"\n"))
            .and_then(|_| file.sync_all())
            .map_err(|e| EngineError::Storage(format!("append failed: {}", e)))?;

        inner.records.push_back(record);
        self.rotate_locked(&mut inner, Utc::now())?;
        Ok(())
    }

    /// Rotation pass, callable with an explicit clock for tests.
    pub async fn rotate(&self, now: DateTime<Utc>) -> EngineResult<()> {
        let mut inner = self.inner.lock().await;
        self.rotate_locked(&mut inner, now)
    }

    fn rotate_locked(&self, inner: &mut LongTermInner, now: DateTime<Utc>) -> EngineResult<()> {
        let month = month_key(now);
        if month != inner.current_month {
            let count = inner.records.len();
            let drained: Vec<WorkflowRecord> = inner.records.drain(..).collect();
            self.archive(&inner.current_month, &drained)?;
            inner.current_month = month;
            if count > 0 {
                log::info!("archived {} workflow records on month rollover", count);
            }
        }
        if inner.records.len() > self.resident_cap {
            let excess = inner.records.len() - self.resident_cap;
            let drained: Vec<WorkflowRecord> = inner.records.drain(..excess).collect();
            self.archive(&inner.current_month, &drained)?;
            log::info!("archived {} workflow records past the resident cap", excess);
        }
        Ok(())
    }

    fn archive(&self, month: &str, records: &[WorkflowRecord]) -> EngineResult<()> {
        if records.is_empty() {
            return Ok(());
        }
        let path = self.dir.join(format!("workflows-{}.archive.jsonl", month));
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| EngineError::Storage(format!("archive open failed: {}", e)))?;
        for record in records {
            let line = serde_json::to_string(record)
                .map_err(|e| EngineError::Storage(format!("serialize failed: {}", e)))?;
            file.write_all(line.as_bytes())
                .and_then(|_| file.write_all(b"\n"))
                .map_err(|e| EngineError::Storage(format!("archive append failed: {}", e)))?;
        }
        file.sync_all()
            .map_err(|e| EngineError::Storage(format!("archive sync failed: {}", e)))
    }

    /// Substring search over a whitelist of fields (task id, task text,
    /// aggregated output), newest first.
    pub async fn search(&self, query: &str, limit: usize) -> Vec<WorkflowRecord> {
        let needle = query.to_lowercase();
        let inner = self.inner.lock().await;
        inner
            .records
            .iter()
            .rev()
            .filter(|r| {
                r.task_id.to_lowercase().contains(&needle)
                    || r.task_text.to_lowercase().contains(&needle)
                    || r.aggregated.to_lowercase().contains(&needle)
            })
            .take(limit)
            .cloned()
            .collect()
    }

    /// Look up a record by task id (idempotent `execute` support).
    pub async fn find_by_task_id(&self, task_id: &str) -> Option<WorkflowRecord> {
        let inner = self.inner.lock().await;
        inner
            .records
            .iter()
            .rev()
            .find(|r| r.task_id == task_id)
            .cloned()
    }

    /// Number of resident records.
    pub async fn resident_count(&self) -> usize {
        self.inner.lock().await.records.len()
    }
}
