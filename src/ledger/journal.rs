// src/ledger/journal.rs

//! Append-only JSON-lines journal.
//!
//! Each commit is one line, written and synced before the ledger publishes it.
//! A failed write is rolled back by truncating to the previous length. On load,
//! a torn final line (crash mid-write) is dropped and truncated away; damage
//! anywhere else is an error.

use super::store::{Commit, LedgerSnapshot, LedgerStore};
use anyhow::{bail, Context, Result};
use log::*;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub struct JournalStore {
    path: PathBuf,
    file: Mutex<File>,
}

impl JournalStore {
    /// Opens (creating if needed) the journal at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create journal directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open journal {}", path.display()))?;
        info!("JournalStore: opened {}", path.display());
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, File>> {
        self.file
            .lock()
            .map_err(|_| anyhow::anyhow!("JournalStore lock poisoned"))
    }
}

impl LedgerStore for JournalStore {
    fn load(&self) -> Result<LedgerSnapshot> {
        let mut file = self.lock()?;
        file.seek(SeekFrom::Start(0))
            .context("Failed to rewind journal")?;

        let mut reader = BufReader::new(&*file);
        let mut commits = Vec::new();
        let mut offset: u64 = 0;
        let mut torn_at: Option<u64> = None;
        let mut line = String::new();

        loop {
            line.clear();
            let read = reader
                .read_line(&mut line)
                .with_context(|| format!("Failed to read journal {}", self.path.display()))?;
            if read == 0 {
                break;
            }
            let line_start = offset;
            offset += read as u64;

            if torn_at.is_some() {
                bail!(
                    "journal {} is corrupt before its final line (offset {})",
                    self.path.display(),
                    line_start
                );
            }

            let trimmed = line.trim_end();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<Commit>(trimmed) {
                Ok(commit) if line.ends_with('\n') => commits.push(commit),
                Ok(_) | Err(_) => torn_at = Some(line_start),
            }
        }
        drop(reader);

        if let Some(at) = torn_at {
            warn!(
                "JournalStore: discarding torn final entry at offset {} in {}",
                at,
                self.path.display()
            );
            file.set_len(at)
                .context("Failed to truncate torn journal entry")?;
        }

        debug!("JournalStore: loaded {} commits", commits.len());
        Ok(LedgerSnapshot { commits })
    }

    fn commit(&self, commit: &Commit) -> Result<()> {
        let mut encoded = serde_json::to_vec(commit).context("Failed to encode commit")?;
        encoded.push(b'\n');

        let mut file = self.lock()?;
        let previous_len = file
            .metadata()
            .context("Failed to stat journal")?
            .len();

        let written = file
            .write_all(&encoded)
            .and_then(|_| file.sync_data());
        if let Err(e) = written {
            if let Err(truncate_err) = file.set_len(previous_len) {
                error!(
                    "JournalStore: failed to roll back partial write: {}",
                    truncate_err
                );
            }
            return Err(e).with_context(|| {
                format!("Failed to append revision {} to journal", commit.revision)
            });
        }

        trace!("JournalStore: appended revision {}", commit.revision);
        Ok(())
    }
}
