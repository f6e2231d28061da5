//! Decision history
//!
//! Keeps recent consensus results in memory for lookup by id and appends
//! each one to a JSON-lines journal so positions can be traced back to
//! the vote that opened them after a restart.

use parking_lot::RwLock;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::LedgerResult;
use crate::utils::types::ConsensusResult;

pub struct DecisionLog {
    /// Oldest first, at most `limit` entries
    entries: RwLock<VecDeque<ConsensusResult>>,
    limit: usize,
    /// Journal file; `None` keeps history in memory only
    path: Option<PathBuf>,
}

impl DecisionLog {
    pub fn in_memory(limit: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::new()),
            limit: limit.max(1),
            path: None,
        }
    }

    /// Log backed by a journal, restoring its newest `limit` entries
    pub async fn open(path: impl AsRef<Path>, limit: usize) -> LedgerResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut log = Self::in_memory(limit);

        if path.exists() {
            let content = tokio::fs::read_to_string(&path).await?;
            let mut skipped = 0usize;
            for line in content.lines().filter(|l| !l.trim().is_empty()) {
                match serde_json::from_str::<ConsensusResult>(line) {
                    Ok(result) => log.push(result),
                    Err(_) => skipped += 1,
                }
            }
            if skipped > 0 {
                warn!("Skipped {} unreadable entries in {:?}", skipped, path);
            }
            info!("Decision history loaded from {:?}: {} entries", path, log.len());
        }

        log.path = Some(path);
        Ok(log)
    }

    fn push(&self, result: ConsensusResult) {
        let mut entries = self.entries.write();
        entries.push_back(result);
        while entries.len() > self.limit {
            entries.pop_front();
        }
    }

    /// Remember `result` and append it to the journal
    pub async fn record(&self, result: &ConsensusResult) -> LedgerResult<()> {
        self.push(result.clone());

        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut line = serde_json::to_string(result)?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        debug!("Decision {} journaled to {:?}", result.id, path);
        Ok(())
    }

    /// Look a decision up by its consensus id
    pub fn get(&self, id: &str) -> Option<ConsensusResult> {
        self.entries.read().iter().rev().find(|r| r.id == id).cloned()
    }

    /// Up to `n` most recent decisions, newest first
    pub fn recent(&self, n: usize) -> Vec<ConsensusResult> {
        self.entries.read().iter().rev().take(n).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
