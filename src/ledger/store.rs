// src/ledger/store.rs

//! Storage seam for the grid ledger.
//!
//! The ledger hands every mutation to its store as one `Commit`. A store must
//! make a commit durable entirely or not at all; the ledger only publishes the
//! commit in memory after `commit` returns `Ok`.

use crate::pixel::{ActivityRecord, Pixel};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// One atomic ledger mutation: the rows it writes and, for purchases, the
/// activity record describing it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub revision: u64,
    pub pixels: Vec<Pixel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity: Option<ActivityRecord>,
}

/// Everything a store holds, as loaded at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerSnapshot {
    pub commits: Vec<Commit>,
}

/// Durable home of ledger commits.
pub trait LedgerStore: Send + Sync {
    /// Returns every commit previously made durable, oldest first.
    fn load(&self) -> Result<LedgerSnapshot>;

    /// Makes one commit durable as a unit.
    fn commit(&self, commit: &Commit) -> Result<()>;
}

/// Volatile store; keeps commits for inspection and nothing else.
#[derive(Debug, Default)]
pub struct MemoryStore {
    commits: Mutex<Vec<Commit>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of commits accepted so far.
    pub fn commit_count(&self) -> usize {
        self.commits.lock().map(|c| c.len()).unwrap_or(0)
    }
}

impl LedgerStore for MemoryStore {
    fn load(&self) -> Result<LedgerSnapshot> {
        let commits = self
            .commits
            .lock()
            .map_err(|_| anyhow::anyhow!("MemoryStore lock poisoned"))?;
        Ok(LedgerSnapshot {
            commits: commits.clone(),
        })
    }

    fn commit(&self, commit: &Commit) -> Result<()> {
        self.commits
            .lock()
            .map_err(|_| anyhow::anyhow!("MemoryStore lock poisoned"))?
            .push(commit.clone());
        Ok(())
    }
}
