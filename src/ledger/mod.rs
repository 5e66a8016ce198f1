// src/ledger/mod.rs

//! The authoritative grid ledger.
//!
//! Holds one row per purchased coordinate plus the append-only activity log.
//! Every mutation becomes a single `Commit` handed to the `LedgerStore` while
//! the write lock is held; the in-memory view changes only after the store
//! accepts it. Readers take the read lock, so a batch is observed either not
//! at all or completely.

pub mod journal;
pub mod store;

pub use journal::JournalStore;
pub use store::{Commit, LedgerSnapshot, LedgerStore, MemoryStore};

use crate::clock::Clock;
use crate::pixel::{ActivityKind, ActivityRecord, CellUpdate, Coord, Pixel, PixelColor, Rect, ValidationError};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use log::*;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

/// Why a ledger write did not happen. Either way the ledger is unchanged.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("ledger storage failure: {0:#}")]
    Storage(anyhow::Error),
}

/// Description of the activity record a purchase appends. The ledger fills in
/// the id, covered cells and timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewActivity {
    pub kind: ActivityKind,
    pub color: Option<PixelColor>,
    pub letter: Option<char>,
    pub letters: Option<String>,
    pub amount_paid: u64,
    pub payment_reference: String,
    pub event_reference: Option<String>,
}

/// Rows and activity record produced by one applied purchase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedPurchase {
    pub pixels: Vec<Pixel>,
    pub activity: ActivityRecord,
}

#[derive(Debug, Default)]
struct LedgerState {
    pixels: BTreeMap<Coord, Pixel>,
    activity: Vec<ActivityRecord>,
    revision: u64,
    last_timestamp: Option<DateTime<Utc>>,
}

impl LedgerState {
    fn apply(&mut self, commit: Commit) {
        for pixel in commit.pixels {
            self.last_timestamp = self.last_timestamp.max(Some(pixel.updated_at));
            self.pixels.insert(pixel.coord(), pixel);
        }
        if let Some(record) = commit.activity {
            self.activity.push(record);
        }
        self.revision = self.revision.max(commit.revision);
    }
}

pub struct GridLedger {
    state: RwLock<LedgerState>,
    store: Box<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
}

impl GridLedger {
    /// Opens a ledger, replaying everything the store already holds.
    pub fn open(store: Box<dyn LedgerStore>, clock: Arc<dyn Clock>) -> Result<Self> {
        let snapshot = store.load().context("Failed to load ledger from store")?;
        let mut state = LedgerState::default();
        let commit_count = snapshot.commits.len();
        for commit in snapshot.commits {
            state.apply(commit);
        }
        info!(
            "GridLedger: opened with {} cells, {} activity records ({} commits, revision {})",
            state.pixels.len(),
            state.activity.len(),
            commit_count,
            state.revision
        );
        Ok(Self {
            state: RwLock::new(state),
            store,
            clock,
        })
    }

    /// A volatile ledger, for tests and demos.
    pub fn in_memory(clock: Arc<dyn Clock>) -> Result<Self> {
        Self::open(Box::new(MemoryStore::new()), clock)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, LedgerState>> {
        self.state
            .read()
            .map_err(|_| anyhow!("ledger lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, LedgerState>, LedgerError> {
        self.state
            .write()
            .map_err(|_| LedgerError::Storage(anyhow!("ledger lock poisoned")))
    }

    // --- Reads ---

    pub fn get_by_coordinate(&self, coord: Coord) -> Result<Option<Pixel>> {
        Ok(self.read()?.pixels.get(&coord).cloned())
    }

    /// Cells inside the inclusive rectangle, by row then column.
    pub fn get_in_rectangle(&self, rect: Rect) -> Result<Vec<Pixel>> {
        let state = self.read()?;
        let from = Coord::new(i64::MIN, rect.y1);
        let to = Coord::new(i64::MAX, rect.y2);
        Ok(state
            .pixels
            .range(from..=to)
            .filter(|(coord, _)| rect.contains(**coord))
            .map(|(_, pixel)| pixel.clone())
            .collect())
    }

    /// Last paid amount of each coordinate, `None` where unsold.
    pub fn last_paid_amounts(&self, coords: &[Coord]) -> Result<Vec<Option<u64>>> {
        let state = self.read()?;
        Ok(coords
            .iter()
            .map(|coord| state.pixels.get(coord).map(|p| p.last_paid_amount))
            .collect())
    }

    /// Most recent activity first.
    pub fn recent_activity(&self, limit: usize) -> Result<Vec<ActivityRecord>> {
        let state = self.read()?;
        Ok(state.activity.iter().rev().take(limit).cloned().collect())
    }

    pub fn activity_count(&self) -> Result<usize> {
        Ok(self.read()?.activity.len())
    }

    /// Activity records created at or after `since`, oldest first.
    pub fn activity_since(&self, since: DateTime<Utc>) -> Result<Vec<ActivityRecord>> {
        let state = self.read()?;
        let start = state.activity.partition_point(|r| r.created_at < since);
        Ok(state.activity[start..].to_vec())
    }

    pub fn cell_count(&self) -> Result<usize> {
        Ok(self.read()?.pixels.len())
    }

    pub fn revision(&self) -> Result<u64> {
        Ok(self.read()?.revision)
    }

    // --- Writes ---

    /// Writes one cell without recording activity.
    pub fn upsert(&self, update: CellUpdate) -> Result<Pixel, LedgerError> {
        let mut pixels = self.commit_updates(vec![update], None)?.0;
        pixels
            .pop()
            .ok_or_else(|| LedgerError::Storage(anyhow!("commit produced no rows")))
    }

    /// Writes every cell as one atomic unit without recording activity.
    pub fn upsert_batch(&self, updates: Vec<CellUpdate>) -> Result<Vec<Pixel>, LedgerError> {
        Ok(self.commit_updates(updates, None)?.0)
    }

    /// Writes the purchased cells and appends their activity record, atomically.
    pub fn apply_purchase(
        &self,
        updates: Vec<CellUpdate>,
        activity: NewActivity,
    ) -> Result<AppliedPurchase, LedgerError> {
        let (pixels, record) = self.commit_updates(updates, Some(activity))?;
        let activity =
            record.ok_or_else(|| LedgerError::Storage(anyhow!("commit produced no activity")))?;
        Ok(AppliedPurchase { pixels, activity })
    }

    fn commit_updates(
        &self,
        updates: Vec<CellUpdate>,
        activity: Option<NewActivity>,
    ) -> Result<(Vec<Pixel>, Option<ActivityRecord>), LedgerError> {
        if updates.is_empty() {
            return Err(ValidationError::EmptyPurchase.into());
        }
        let mut seen = HashSet::with_capacity(updates.len());
        for update in &updates {
            update.validate()?;
            if !seen.insert(update.coord) {
                return Err(ValidationError::DuplicateCoordinate(update.coord).into());
            }
        }

        let mut state = self.write()?;
        let revision = state.revision + 1;
        // Timestamps never run backwards, so log order and created_at order agree.
        let now = match state.last_timestamp {
            Some(last) => last.max(self.clock.now()),
            None => self.clock.now(),
        };

        let pixels: Vec<Pixel> = updates
            .into_iter()
            .map(|update| {
                let created_at = state
                    .pixels
                    .get(&update.coord)
                    .map(|existing| existing.created_at)
                    .unwrap_or(now);
                Pixel {
                    x: update.coord.x,
                    y: update.coord.y,
                    color: update.color,
                    letter: update.letter,
                    last_paid_amount: update.price,
                    created_at,
                    updated_at: now,
                    revision,
                }
            })
            .collect();

        let record = activity.map(|a| ActivityRecord {
            id: revision,
            kind: a.kind,
            cells: pixels.iter().map(Pixel::coord).collect(),
            color: a.color,
            letter: a.letter,
            letters: a.letters,
            amount_paid: a.amount_paid,
            created_at: now,
            payment_reference: a.payment_reference,
            event_reference: a.event_reference,
        });

        let commit = Commit {
            revision,
            pixels,
            activity: record,
        };

        if let Err(e) = self.store.commit(&commit) {
            error!("GridLedger: store rejected revision {}: {:#}", revision, e);
            return Err(LedgerError::Storage(e));
        }

        let result = (commit.pixels.clone(), commit.activity.clone());
        state.apply(commit);
        debug!(
            "GridLedger: committed revision {} ({} cells)",
            revision,
            result.0.len()
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests;
