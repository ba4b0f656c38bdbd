//! Episodic memory: past failures with their fixes, and solved tasks.
//!
//! Records are persisted as JSON lines (`failure_patterns.jsonl`,
//! `success_patterns.jsonl`) and re-embedded into an in-memory index on open.
//! Only documents are stored; vectors are recomputed by the [`Embedder`].

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, instrument, warn};

use crate::core::embedding::{Embedder, HashEmbedder, cosine_similarity};
use crate::core::types::{FailureRecord, SuccessRecord, failure_document};
use crate::io::config::MemoryConfig;

pub const FAILURE_FILE: &str = "failure_patterns.jsonl";
pub const SUCCESS_FILE: &str = "success_patterns.jsonl";

/// Similarity-searchable store of failure/fix and success records.
pub trait EpisodicMemory {
    /// Failures most similar to `task` + `error`, best first.
    fn retrieve_similar_failures(&self, task: &str, error: &str) -> Result<Vec<FailureRecord>>;

    fn store_failure(&self, error: &str, failed_code: &str, fix: &str, task: &str) -> Result<()>;

    fn store_success(&self, task: &str, code: &str) -> Result<()>;

    /// Solved tasks most similar to `task`, best first.
    fn retrieve_similar_successes(&self, task: &str) -> Result<Vec<SuccessRecord>>;
}

impl<M: EpisodicMemory + ?Sized> EpisodicMemory for &M {
    fn retrieve_similar_failures(&self, task: &str, error: &str) -> Result<Vec<FailureRecord>> {
        (**self).retrieve_similar_failures(task, error)
    }

    fn store_failure(&self, error: &str, failed_code: &str, fix: &str, task: &str) -> Result<()> {
        (**self).store_failure(error, failed_code, fix, task)
    }

    fn store_success(&self, task: &str, code: &str) -> Result<()> {
        (**self).store_success(task, code)
    }

    fn retrieve_similar_successes(&self, task: &str) -> Result<Vec<SuccessRecord>> {
        (**self).retrieve_similar_successes(task)
    }
}

/// Records that carry their own searchable text.
trait Document {
    fn document(&self) -> &str;
}

impl Document for FailureRecord {
    fn document(&self) -> &str {
        &self.document
    }
}

impl Document for SuccessRecord {
    fn document(&self) -> &str {
        &self.document
    }
}

/// A record plus its document embedding.
struct Indexed<T> {
    record: T,
    vector: Vec<f64>,
}

/// One logical collection: optional backing file plus its index.
struct Collection<T> {
    path: Option<PathBuf>,
    entries: RwLock<Vec<Indexed<T>>>,
}

impl<T> Collection<T>
where
    T: Document + Clone + Serialize + DeserializeOwned,
{
    fn empty() -> Self {
        Self {
            path: None,
            entries: RwLock::new(Vec::new()),
        }
    }

    fn open(path: PathBuf, embedder: &dyn Embedder) -> Result<Self> {
        let records: Vec<T> = read_jsonl(&path)?;
        let entries = records
            .into_iter()
            .map(|record| Indexed {
                vector: embedder.embed(record.document()),
                record,
            })
            .collect();
        Ok(Self {
            path: Some(path),
            entries: RwLock::new(entries),
        })
    }

    fn append(&self, record: T, vector: Vec<f64>) -> Result<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| anyhow!("memory index lock poisoned"))?;
        if let Some(path) = &self.path {
            append_jsonl(path, &record)?;
        }
        entries.push(Indexed { record, vector });
        Ok(())
    }

    fn nearest(&self, query: &[f64], top_k: usize, min_similarity: f64) -> Result<Vec<T>> {
        let entries = self
            .entries
            .read()
            .map_err(|_| anyhow!("memory index lock poisoned"))?;
        let mut scored: Vec<(usize, f64)> = entries
            .iter()
            .enumerate()
            .map(|(idx, entry)| (idx, cosine_similarity(query, &entry.vector)))
            .filter(|(_, score)| *score > min_similarity)
            .collect();
        // Stable sort keeps insertion order among equal scores.
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        Ok(scored
            .into_iter()
            .take(top_k)
            .map(|(idx, _)| entries[idx].record.clone())
            .collect())
    }

    fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or_default()
    }
}

/// JSONL-backed [`EpisodicMemory`] with a brute-force cosine index.
pub struct MemoryStore {
    embedder: Box<dyn Embedder>,
    failures: Collection<FailureRecord>,
    successes: Collection<SuccessRecord>,
    top_k: usize,
    min_similarity: f64,
}

impl MemoryStore {
    /// Open (or create) the store under `dir`.
    #[instrument(skip_all, fields(dir = %dir.display()))]
    pub fn open(dir: &Path, config: &MemoryConfig) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("create memory dir {}", dir.display()))?;
        let embedder = HashEmbedder::default();
        let store = Self {
            failures: Collection::open(dir.join(FAILURE_FILE), &embedder)?,
            successes: Collection::open(dir.join(SUCCESS_FILE), &embedder)?,
            embedder: Box::new(embedder),
            top_k: config.top_k,
            min_similarity: config.min_similarity,
        };
        info!(
            failures = store.failures.len(),
            successes = store.successes.len(),
            "opened episodic memory"
        );
        Ok(store)
    }

    /// Store without backing files.
    pub fn in_memory(config: &MemoryConfig) -> Self {
        Self {
            embedder: Box::new(HashEmbedder::default()),
            failures: Collection::empty(),
            successes: Collection::empty(),
            top_k: config.top_k,
            min_similarity: config.min_similarity,
        }
    }

    pub fn failure_count(&self) -> usize {
        self.failures.len()
    }

    pub fn success_count(&self) -> usize {
        self.successes.len()
    }
}

impl EpisodicMemory for MemoryStore {
    fn retrieve_similar_failures(&self, task: &str, error: &str) -> Result<Vec<FailureRecord>> {
        let query = self.embedder.embed(&failure_document(task, error));
        let found = self.failures.nearest(&query, self.top_k, self.min_similarity)?;
        debug!(found = found.len(), "retrieved similar failures");
        Ok(found)
    }

    fn store_failure(&self, error: &str, failed_code: &str, fix: &str, task: &str) -> Result<()> {
        let record = FailureRecord::new(error, failed_code, fix, task);
        let vector = self.embedder.embed(&record.document);
        self.failures
            .append(record, vector)
            .context("store failure record")
    }

    fn store_success(&self, task: &str, code: &str) -> Result<()> {
        let record = SuccessRecord::new(task, code);
        let vector = self.embedder.embed(&record.document);
        self.successes
            .append(record, vector)
            .context("store success record")
    }

    fn retrieve_similar_successes(&self, task: &str) -> Result<Vec<SuccessRecord>> {
        let query = self.embedder.embed(task);
        let found = self.successes.nearest(&query, self.top_k, self.min_similarity)?;
        debug!(found = found.len(), "retrieved similar successes");
        Ok(found)
    }
}

fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let contents = fs::read_to_string(path)
        .with_context(|| format!("read memory file {}", path.display()))?;
    let mut records = Vec::new();
    for (idx, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(record) => records.push(record),
            // A torn trailing write should not make the whole store unreadable.
            Err(err) => warn!(
                path = %path.display(),
                line = idx + 1,
                err = %err,
                "skipping unreadable memory record"
            ),
        }
    }
    Ok(records)
}

fn append_jsonl<T: Serialize>(path: &Path, record: &T) -> Result<()> {
    let mut line = serde_json::to_string(record).context("serialize memory record")?;
    line.push('\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open memory file {}", path.display()))?;
    file.write_all(line.as_bytes())
        .with_context(|| format!("append memory file {}", path.display()))
}
