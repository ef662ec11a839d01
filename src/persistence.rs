//! Persistence snapshotter and configuration store.
//!
//! Trace collections are committed on a dedicated thread so file I/O never
//! runs on the control loop. A commit clones the collection under its read
//! lock and writes the copy, so appends only wait for the clone, never for
//! the disk.
//!
//! Two kinds of commit exist:
//! - periodic ([`Snapshotter::schedule`]): dropped if a periodic commit is still
//!   in flight
//! - final ([`Snapshotter::commit`]): always runs; the caller awaits the path
//!
//! The [`ConfigStore`] is a key-value blob store backed by one JSON file and
//! written together with every commit.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use tokio::sync::oneshot;
use tracing::{debug, error, info};

use crate::error::{AppResult, DaqError, TraceError};
use crate::trace::naming::atomic_write;
use crate::trace::{SharedCollection, TraceFormat};

/// JSON file backed key-value store.
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    values: RwLock<Map<String, Value>>,
}

impl ConfigStore {
    /// Open the store at `path`; a missing file is an empty store.
    pub fn open(path: impl Into<PathBuf>) -> AppResult<Self> {
        let path = path.into();
        let values = if path.exists() {
            let text = std::fs::read_to_string(&path)?;
            if text.trim().is_empty() {
                Map::new()
            } else {
                serde_json::from_str(&text).map_err(|e| {
                    DaqError::Configuration(format!("config store {}: {e}", path.display()))
                })?
            }
        } else {
            Map::new()
        };
        Ok(Self {
            path,
            values: RwLock::new(values),
        })
    }

    /// Backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Value of `key`.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.values.read().get(key).cloned()
    }

    /// Set `key`.
    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.values.write().insert(key.into(), value);
    }

    /// Remove `key`, returning its value.
    pub fn remove(&self, key: &str) -> Option<Value> {
        self.values.write().remove(key)
    }

    /// Write the store atomically.
    pub fn save(&self) -> Result<(), TraceError> {
        let text = serde_json::to_string_pretty(&*self.values.read()).map_err(|e| {
            TraceError::StructuredData {
                name: "config store".into(),
                message: e.to_string(),
            }
        })?;
        atomic_write(&self.path, |file| {
            use std::io::Write;
            file.write_all(text.as_bytes())?;
            Ok(())
        })
    }
}

/// What to commit and where.
#[derive(Debug, Clone)]
pub struct CommitRequest {
    /// Collection to write.
    pub collection: SharedCollection,
    /// Directory for newly allocated file names.
    pub dir: PathBuf,
    /// Format for newly allocated file names.
    pub format: TraceFormat,
    /// Store written alongside.
    pub store: Option<Arc<ConfigStore>>,
}

type Reply = oneshot::Sender<Result<PathBuf, TraceError>>;

enum Job {
    Periodic(CommitRequest),
    Final(CommitRequest, Reply),
    Shutdown,
}

/// Commits collections on its own thread.
#[derive(Debug)]
pub struct Snapshotter {
    jobs: Sender<Job>,
    in_flight: Arc<AtomicBool>,
    commits: Arc<AtomicU64>,
    thread: Option<JoinHandle<()>>,
}

impl Snapshotter {
    /// Start the snapshot thread.
    pub fn spawn() -> AppResult<Self> {
        let (jobs, rx) = unbounded();
        let in_flight = Arc::new(AtomicBool::new(false));
        let commits = Arc::new(AtomicU64::new(0));
        let worker_flag = in_flight.clone();
        let worker_commits = commits.clone();
        let thread = thread::Builder::new()
            .name("trace-snapshotter".into())
            .spawn(move || run(rx, worker_flag, worker_commits))?;
        Ok(Self {
            jobs,
            in_flight,
            commits,
            thread: Some(thread),
        })
    }

    /// Queue a periodic commit. Returns `false` if it was dropped because the
    /// previous periodic commit has not finished.
    pub fn schedule(&self, request: CommitRequest) -> bool {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("periodic commit coalesced");
            return false;
        }
        if self.jobs.send(Job::Periodic(request)).is_err() {
            self.in_flight.store(false, Ordering::Release);
            return false;
        }
        true
    }

    /// Commit and wait for the result.
    pub async fn commit(&self, request: CommitRequest) -> Result<PathBuf, TraceError> {
        let (reply, rx) = oneshot::channel();
        self.jobs
            .send(Job::Final(request, reply))
            .map_err(|_| snapshotter_gone())?;
        rx.await.map_err(|_| snapshotter_gone())?
    }

    /// Successful commits so far.
    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::Acquire)
    }

    /// Whether a periodic commit is queued or running.
    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }
}

impl Drop for Snapshotter {
    fn drop(&mut self) {
        let _ = self.jobs.send(Job::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn snapshotter_gone() -> TraceError {
    TraceError::Io(std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        "snapshotter thread stopped",
    ))
}

fn run(jobs: Receiver<Job>, in_flight: Arc<AtomicBool>, commits: Arc<AtomicU64>) {
    debug!("snapshotter started");
    while let Ok(job) = jobs.recv() {
        match job {
            Job::Periodic(request) => {
                match write(&request) {
                    Ok(path) => {
                        commits.fetch_add(1, Ordering::AcqRel);
                        debug!(path = %path.display(), "periodic commit");
                    }
                    Err(e) => error!(error = %e, "periodic commit failed"),
                }
                in_flight.store(false, Ordering::Release);
            }
            Job::Final(request, reply) => {
                let result = write(&request);
                match &result {
                    Ok(path) => {
                        commits.fetch_add(1, Ordering::AcqRel);
                        info!(path = %path.display(), "final commit");
                    }
                    Err(e) => error!(error = %e, "final commit failed"),
                }
                let _ = reply.send(result);
            }
            Job::Shutdown => break,
        }
    }
    debug!("snapshotter stopped");
}

fn write(request: &CommitRequest) -> Result<PathBuf, TraceError> {
    let mut snapshot = request.collection.read().clone();
    let path = snapshot.ensure_path(&request.dir, request.format)?;
    let format = TraceFormat::from_path(&path).unwrap_or(request.format);
    snapshot.save(&path, format)?;
    {
        let mut collection = request.collection.write();
        if collection.path().is_none() {
            collection.set_path(path.clone());
        }
        collection.set_saved(true);
    }
    if let Some(store) = &request.store {
        store.save()?;
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{Trace, TraceCollection};
    use serde_json::json;
    use tempfile::tempdir;

    fn collection() -> SharedCollection {
        let mut collection = TraceCollection::new("scan");
        let mut trace = Trace::for_evaluation("counts");
        trace.append(&[("x", 0.0), ("y", 1.0)]).unwrap();
        collection.add_trace(trace);
        collection.into_shared()
    }

    #[tokio::test]
    async fn final_commit_allocates_sequenced_name_and_store() {
        let dir = tempdir().unwrap();
        let store = Arc::new(ConfigStore::open(dir.path().join("store.json")).unwrap());
        store.set("laser", json!({"power": 3.5}));
        let snapshotter = Snapshotter::spawn().unwrap();
        let shared = collection();
        let request = CommitRequest {
            collection: shared.clone(),
            dir: dir.path().to_path_buf(),
            format: TraceFormat::Text,
            store: Some(store.clone()),
        };
        let path = snapshotter.commit(request.clone()).await.unwrap();
        assert_eq!(path.file_name().unwrap(), "scan_001.txt");
        assert!(shared.read().is_saved());
        // Same destination on the next commit.
        assert_eq!(snapshotter.commit(request).await.unwrap(), path);
        assert_eq!(snapshotter.commits(), 2);

        let reopened = ConfigStore::open(dir.path().join("store.json")).unwrap();
        assert_eq!(reopened.get("laser"), Some(json!({"power": 3.5})));
    }

    #[tokio::test]
    async fn appends_proceed_while_a_commit_writes() {
        let dir = tempdir().unwrap();
        let snapshotter = Snapshotter::spawn().unwrap();
        let mut big = TraceCollection::new("big");
        let mut trace = Trace::for_evaluation("counts");
        for i in 0..100_000 {
            let x = f64::from(i);
            trace.append(&[("x", x), ("y", x * 0.5), ("raw", x)]).unwrap();
        }
        big.add_trace(trace);
        let shared = big.into_shared();

        let done = Arc::new(AtomicBool::new(false));
        let writer = {
            let (shared, done) = (shared.clone(), done.clone());
            thread::spawn(move || {
                let mut blocked = 0;
                while !done.load(Ordering::Acquire) {
                    match shared.try_write_for(std::time::Duration::from_millis(50)) {
                        Some(_guard) => {}
                        None => blocked += 1,
                    }
                }
                blocked
            })
        };
        let request = CommitRequest {
            collection: shared.clone(),
            dir: dir.path().to_path_buf(),
            format: TraceFormat::Text,
            store: None,
        };
        let path = snapshotter.commit(request).await.unwrap();
        done.store(true, Ordering::Release);
        assert_eq!(writer.join().unwrap(), 0);
        assert_eq!(shared.read().path(), Some(path.as_path()));
        assert!(shared.read().is_saved());
    }

    #[test]
    fn periodic_commits_coalesce() {
        let dir = tempdir().unwrap();
        let snapshotter = Snapshotter::spawn().unwrap();
        let shared = collection();
        // Hold the write lock so the first commit cannot finish.
        let guard = shared.write();
        let request = CommitRequest {
            collection: shared.clone(),
            dir: dir.path().to_path_buf(),
            format: TraceFormat::Text,
            store: None,
        };
        assert!(snapshotter.schedule(request.clone()));
        assert!(!snapshotter.schedule(request.clone()));
        drop(guard);
        while snapshotter.is_busy() {
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert!(snapshotter.schedule(request));
    }
}
