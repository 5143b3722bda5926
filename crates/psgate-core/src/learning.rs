use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::error::{PsgateError, Result};

const CANDIDATES_FILE: &str = "learnCandidates.jsonl";
const APPROVED_FILE: &str = "learned-safe.json";

/// A command waiting for operator review.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateEntry {
    pub normalized: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub times_queued: u32,
    pub source: String,
}

/// An approved normalized form acting as a highest-priority SAFE match.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LearnedSafe {
    pub pattern: String,
    pub approved_at: DateTime<Utc>,
    pub source: String,
}

/// Append-only record in the candidate log.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum CandidateRecord {
    Queue {
        normalized: String,
        source: String,
        ts: DateTime<Utc>,
    },
    Remove {
        normalized: String,
        ts: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueOutcome {
    pub added: bool,
    pub skipped: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApproveOutcome {
    pub promoted: u32,
    pub not_found: Vec<String>,
}

/// Read-side view of the approved-safe map. Cheap to clone; the writer
/// task swaps the inner Arc on every promotion.
#[derive(Clone)]
pub struct ApprovedView {
    map: Arc<RwLock<Arc<HashMap<String, LearnedSafe>>>>,
    version: Arc<AtomicU64>,
}

impl ApprovedView {
    fn new(map: HashMap<String, LearnedSafe>) -> Self {
        Self {
            map: Arc::new(RwLock::new(Arc::new(map))),
            version: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> Arc<HashMap<String, LearnedSafe>> {
        self.map.read().expect("approved view lock poisoned").clone()
    }

    pub fn get(&self, normalized: &str) -> Option<LearnedSafe> {
        self.snapshot().get(normalized).cloned()
    }

    fn publish(&self, map: HashMap<String, LearnedSafe>) {
        *self.map.write().expect("approved view lock poisoned") = Arc::new(map);
        self.version.fetch_add(1, Ordering::Release);
    }
}

enum Op {
    Queue {
        normalized: String,
        source: String,
        resp: oneshot::Sender<Result<QueueOutcome>>,
    },
    ListQueue {
        resp: oneshot::Sender<Vec<CandidateEntry>>,
    },
    Approve {
        normalized: Vec<String>,
        source: String,
        resp: oneshot::Sender<Result<ApproveOutcome>>,
    },
    Remove {
        normalized: Vec<String>,
        resp: oneshot::Sender<Result<u32>>,
    },
}

/// Handle to the learning store's single writer task.
#[derive(Clone)]
pub struct LearningHandle {
    tx: mpsc::Sender<Op>,
    view: ApprovedView,
}

impl LearningHandle {
    /// Idempotent candidate insertion; duplicates bump `times_queued`.
    pub async fn queue(&self, normalized: &str, source: &str) -> Result<QueueOutcome> {
        self.call(|resp| Op::Queue {
            normalized: normalized.to_string(),
            source: source.to_string(),
            resp,
        })
        .await?
    }

    /// Snapshot copy of the candidate queue, newest first.
    pub async fn list_queue(&self) -> Result<Vec<CandidateEntry>> {
        self.call(|resp| Op::ListQueue { resp }).await
    }

    /// Promote candidates to the approved-safe map.
    pub async fn approve(&self, normalized: Vec<String>, source: &str) -> Result<ApproveOutcome> {
        self.call(|resp| Op::Approve {
            normalized,
            source: source.to_string(),
            resp,
        })
        .await?
    }

    /// Remove candidates from the queue without promoting them.
    pub async fn remove(&self, normalized: Vec<String>) -> Result<u32> {
        self.call(|resp| Op::Remove { normalized, resp }).await?
    }

    /// Monotonic counter bumped on every approved-map change.
    pub fn approved_version(&self) -> u64 {
        self.view.version()
    }

    /// Read view shared with the classifier.
    pub fn approved_view(&self) -> ApprovedView {
        self.view.clone()
    }

    async fn call<T, F>(&self, make: F) -> Result<T>
    where
        F: FnOnce(oneshot::Sender<T>) -> Op,
    {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.tx
            .send(make(resp_tx))
            .await
            .map_err(|_| PsgateError::Internal("learning store task stopped".into()))?;
        resp_rx
            .await
            .map_err(|_| PsgateError::Internal("learning store dropped request".into()))
    }
}

/// The learning store: candidate queue plus approved-safe cache, owned
/// by one writer task. Persistence is append-then-rename under the data
/// directory; a failed write returns an error and leaves memory as-is.
pub struct LearningStore {
    data_dir: PathBuf,
    queue: HashMap<String, CandidateEntry>,
    approved: HashMap<String, LearnedSafe>,
    view: ApprovedView,
}

impl LearningStore {
    /// Load persisted state and spawn the writer task.
    pub fn spawn(data_dir: &Path) -> Result<LearningHandle> {
        fs::create_dir_all(data_dir)?;
        let approved = load_approved(&data_dir.join(APPROVED_FILE))?;
        let queue = load_candidates(&data_dir.join(CANDIDATES_FILE))?;
        info!(
            approved = approved.len(),
            queued = queue.len(),
            "Learning store loaded"
        );

        let view = ApprovedView::new(approved.clone());
        let store = Self {
            data_dir: data_dir.to_path_buf(),
            queue,
            approved,
            view: view.clone(),
        };

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(store.run(rx));
        Ok(LearningHandle { tx, view })
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Op>) {
        while let Some(op) = rx.recv().await {
            match op {
                Op::Queue { normalized, source, resp } => {
                    let _ = resp.send(self.handle_queue(normalized, source));
                }
                Op::ListQueue { resp } => {
                    let mut entries: Vec<CandidateEntry> = self.queue.values().cloned().collect();
                    entries.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
                    let _ = resp.send(entries);
                }
                Op::Approve { normalized, source, resp } => {
                    let _ = resp.send(self.handle_approve(normalized, source));
                }
                Op::Remove { normalized, resp } => {
                    let _ = resp.send(self.handle_remove(normalized));
                }
            }
        }
    }

    fn handle_queue(&mut self, normalized: String, source: String) -> Result<QueueOutcome> {
        if self.approved.contains_key(&normalized) {
            return Ok(QueueOutcome { added: false, skipped: true });
        }

        let now = Utc::now();
        self.append_candidate(&CandidateRecord::Queue {
            normalized: normalized.clone(),
            source: source.clone(),
            ts: now,
        })?;

        match self.queue.get_mut(&normalized) {
            Some(entry) => {
                entry.last_seen = now;
                entry.times_queued += 1;
                Ok(QueueOutcome { added: false, skipped: true })
            }
            None => {
                self.queue.insert(
                    normalized.clone(),
                    CandidateEntry {
                        normalized,
                        first_seen: now,
                        last_seen: now,
                        times_queued: 1,
                        source,
                    },
                );
                Ok(QueueOutcome { added: true, skipped: false })
            }
        }
    }

    fn handle_approve(&mut self, normalized: Vec<String>, source: String) -> Result<ApproveOutcome> {
        let now = Utc::now();
        let mut promoted: Vec<String> = Vec::new();
        let mut not_found: Vec<String> = Vec::new();

        for n in normalized {
            if self.approved.contains_key(&n) || !self.queue.contains_key(&n) {
                not_found.push(n);
            } else {
                promoted.push(n);
            }
        }

        if promoted.is_empty() {
            return Ok(ApproveOutcome { promoted: 0, not_found });
        }

        // Persist the new approved map first; memory mutates only on success.
        let mut next = self.approved.clone();
        for n in &promoted {
            next.insert(
                n.clone(),
                LearnedSafe {
                    pattern: n.clone(),
                    approved_at: now,
                    source: source.clone(),
                },
            );
        }
        write_approved(&self.data_dir.join(APPROVED_FILE), &next)?;
        for n in &promoted {
            self.append_candidate(&CandidateRecord::Remove { normalized: n.clone(), ts: now })?;
        }

        for n in &promoted {
            self.queue.remove(n);
        }
        self.approved = next.clone();
        self.view.publish(next);
        info!(count = promoted.len(), "Promoted learned-safe entries");

        Ok(ApproveOutcome {
            promoted: promoted.len() as u32,
            not_found,
        })
    }

    fn handle_remove(&mut self, normalized: Vec<String>) -> Result<u32> {
        let now = Utc::now();
        let mut removed = 0;
        for n in normalized {
            if self.queue.contains_key(&n) {
                self.append_candidate(&CandidateRecord::Remove { normalized: n.clone(), ts: now })?;
                self.queue.remove(&n);
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn append_candidate(&self, record: &CandidateRecord) -> Result<()> {
        let path = self.data_dir.join(CANDIDATES_FILE);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| PsgateError::Persist(format!("{}: {}", path.display(), e)))?;
        let line = serde_json::to_string(record)?;
        writeln!(file, "{}", line)
            .map_err(|e| PsgateError::Persist(format!("{}: {}", path.display(), e)))
    }
}

fn load_approved(path: &Path) -> Result<HashMap<String, LearnedSafe>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let raw = fs::read_to_string(path)?;
    serde_json::from_str(&raw).map_err(|e| PsgateError::Persist(format!("{}: {}", path.display(), e)))
}

fn write_approved(path: &Path, map: &HashMap<String, LearnedSafe>) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    let raw = serde_json::to_string_pretty(map)?;
    fs::write(&tmp, raw).map_err(|e| PsgateError::Persist(format!("{}: {}", tmp.display(), e)))?;
    fs::rename(&tmp, path).map_err(|e| PsgateError::Persist(format!("{}: {}", path.display(), e)))
}

/// Rebuild the in-memory queue by replaying the append-only log.
fn load_candidates(path: &Path) -> Result<HashMap<String, CandidateEntry>> {
    let mut queue: HashMap<String, CandidateEntry> = HashMap::new();
    if !path.exists() {
        return Ok(queue);
    }
    let raw = fs::read_to_string(path)?;
    for (lineno, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record: CandidateRecord = match serde_json::from_str(line) {
            Ok(r) => r,
            Err(e) => {
                // A torn tail line from a crash mid-append is expected; skip it.
                warn!(line = lineno + 1, error = %e, "Skipping bad candidate log line");
                continue;
            }
        };
        match record {
            CandidateRecord::Queue { normalized, source, ts } => {
                match queue.get_mut(&normalized) {
                    Some(entry) => {
                        entry.last_seen = ts;
                        entry.times_queued += 1;
                    }
                    None => {
                        queue.insert(
                            normalized.clone(),
                            CandidateEntry {
                                normalized,
                                first_seen: ts,
                                last_seen: ts,
                                times_queued: 1,
                                source,
                            },
                        );
                    }
                }
            }
            CandidateRecord::Remove { normalized, .. } => {
                queue.remove(&normalized);
            }
        }
    }
    Ok(queue)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn queue_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let handle = LearningStore::spawn(dir.path()).unwrap();

        let first = handle.queue("mytool --flag", "unknown").await.unwrap();
        assert!(first.added);
        let second = handle.queue("mytool --flag", "unknown").await.unwrap();
        assert!(second.skipped);

        let entries = handle.list_queue().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].times_queued, 2);
    }

    #[tokio::test]
    async fn approve_moves_to_safe_and_bumps_version() {
        let dir = tempfile::tempdir().unwrap();
        let handle = LearningStore::spawn(dir.path()).unwrap();
        handle.queue("mytool --flag", "unknown").await.unwrap();

        let v0 = handle.approved_version();
        let outcome = handle
            .approve(vec!["mytool --flag".to_string()], "operator")
            .await
            .unwrap();
        assert_eq!(outcome.promoted, 1);
        assert!(outcome.not_found.is_empty());
        assert!(handle.approved_version() > v0);
        assert!(handle.approved_view().get("mytool --flag").is_some());
        assert!(handle.list_queue().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn double_approve_promotes_zero_without_version_bump() {
        let dir = tempfile::tempdir().unwrap();
        let handle = LearningStore::spawn(dir.path()).unwrap();
        handle.queue("mytool --flag", "unknown").await.unwrap();
        handle
            .approve(vec!["mytool --flag".to_string()], "operator")
            .await
            .unwrap();

        let v1 = handle.approved_version();
        let outcome = handle
            .approve(vec!["mytool --flag".to_string()], "operator")
            .await
            .unwrap();
        assert_eq!(outcome.promoted, 0);
        assert_eq!(outcome.not_found, vec!["mytool --flag".to_string()]);
        assert_eq!(handle.approved_version(), v1);
    }

    #[tokio::test]
    async fn remove_drops_candidates() {
        let dir = tempfile::tempdir().unwrap();
        let handle = LearningStore::spawn(dir.path()).unwrap();
        handle.queue("one", "unknown").await.unwrap();
        handle.queue("two", "unknown").await.unwrap();

        let removed = handle.remove(vec!["one".to_string(), "ghost".to_string()]).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(handle.list_queue().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let handle = LearningStore::spawn(dir.path()).unwrap();
            handle.queue("keep-me --x", "unknown").await.unwrap();
            handle.queue("promote-me --y", "unknown").await.unwrap();
            handle
                .approve(vec!["promote-me --y".to_string()], "operator")
                .await
                .unwrap();
        }

        let handle = LearningStore::spawn(dir.path()).unwrap();
        let entries = handle.list_queue().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].normalized, "keep-me --x");
        assert!(handle.approved_view().get("promote-me --y").is_some());
    }

    #[tokio::test]
    async fn queueing_an_approved_form_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let handle = LearningStore::spawn(dir.path()).unwrap();
        handle.queue("mytool --flag", "unknown").await.unwrap();
        handle
            .approve(vec!["mytool --flag".to_string()], "operator")
            .await
            .unwrap();

        let outcome = handle.queue("mytool --flag", "unknown").await.unwrap();
        assert!(outcome.skipped);
        assert!(handle.list_queue().await.unwrap().is_empty());
    }
}
