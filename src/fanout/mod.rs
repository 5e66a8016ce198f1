// src/fanout/mod.rs

//! Fanout Actor - broadcasts confirmed mutations to every connected viewer.
//!
//! Threading model:
//! - Owns: the session registry, on a dedicated `fanout` thread
//! - Input: one unbounded command channel, so publishers never block
//! - Output: one bounded channel per viewer session
//!
//! Subscriptions and publishes travel through the same queue, so a session
//! receives exactly the batches published after its subscription, each batch
//! in order. A viewer whose queue is full or whose receiver is gone is dropped
//! and has to resync through the region fetch path.

use crate::pixel::{ActivityRecord, Pixel};
use anyhow::{Context, Result};
use log::*;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender, TryRecvError, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Events pushed to viewers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum FanoutEvent {
    #[serde(rename = "pixel-update")]
    PixelUpdated(Pixel),
    #[serde(rename = "activity")]
    ActivityAppended(ActivityRecord),
}

pub type SessionId = u64;

/// Counters reported by the fanout thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutStats {
    pub sessions: usize,
    pub published_batches: u64,
    pub delivered_events: u64,
    pub dropped_sessions: u64,
}

enum FanoutCommand {
    Subscribe {
        id: SessionId,
        tx: SyncSender<FanoutEvent>,
    },
    Unsubscribe(SessionId),
    Publish(Vec<FanoutEvent>),
    Stats(Sender<FanoutStats>),
    Shutdown,
}

/// Cloneable sending side of the fanout channel.
#[derive(Clone)]
pub struct FanoutHandle {
    tx: Sender<FanoutCommand>,
    next_session_id: Arc<AtomicU64>,
    session_capacity: usize,
}

impl FanoutHandle {
    /// Queues a batch for delivery and returns immediately.
    pub fn publish(&self, batch: Vec<FanoutEvent>) {
        if batch.is_empty() {
            return;
        }
        let len = batch.len();
        if self.tx.send(FanoutCommand::Publish(batch)).is_err() {
            warn!("Fanout: thread is gone, dropping batch of {} events", len);
        }
    }

    /// Connects a new viewer. It sees every batch published from now on.
    pub fn subscribe(&self) -> Result<ViewerSession> {
        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::sync_channel(self.session_capacity);
        self.tx
            .send(FanoutCommand::Subscribe { id, tx })
            .map_err(|_| anyhow::anyhow!("fanout thread is not running"))?;
        Ok(ViewerSession {
            id,
            rx,
            handle: self.clone(),
        })
    }

    pub fn stats(&self) -> Result<FanoutStats> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.tx
            .send(FanoutCommand::Stats(reply_tx))
            .map_err(|_| anyhow::anyhow!("fanout thread is not running"))?;
        reply_rx
            .recv_timeout(Duration::from_secs(5))
            .context("Fanout stats request timed out")
    }

    fn unsubscribe(&self, id: SessionId) {
        let _ = self.tx.send(FanoutCommand::Unsubscribe(id));
    }
}

/// Receiving side held by one viewer. Dropping it disconnects the viewer.
pub struct ViewerSession {
    id: SessionId,
    rx: Receiver<FanoutEvent>,
    handle: FanoutHandle,
}

impl ViewerSession {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Blocks until the next event; `None` once the session was dropped by
    /// the fanout thread or the thread stopped.
    pub fn recv(&self) -> Option<FanoutEvent> {
        self.rx.recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<FanoutEvent, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }

    pub fn try_recv(&self) -> Result<FanoutEvent, TryRecvError> {
        self.rx.try_recv()
    }
}

impl Drop for ViewerSession {
    fn drop(&mut self) {
        self.handle.unsubscribe(self.id);
    }
}

struct Session {
    id: SessionId,
    tx: SyncSender<FanoutEvent>,
}

/// Fanout actor state (runs on the dedicated thread).
#[derive(Default)]
struct FanoutActor {
    sessions: Vec<Session>,
    stats: FanoutStats,
}

impl FanoutActor {
    fn deliver(&mut self, batch: Vec<FanoutEvent>) {
        self.stats.published_batches += 1;
        let mut delivered = 0u64;
        let mut dropped = 0u64;

        self.sessions.retain(|session| {
            for event in &batch {
                match session.tx.try_send(event.clone()) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        warn!("Fanout: session {} is not keeping up, disconnecting", session.id);
                        dropped += 1;
                        return false;
                    }
                    Err(TrySendError::Disconnected(_)) => {
                        debug!("Fanout: session {} went away", session.id);
                        dropped += 1;
                        return false;
                    }
                }
            }
            true
        });

        self.stats.delivered_events += delivered;
        self.stats.dropped_sessions += dropped;
        trace!(
            "Fanout: delivered {} events of a {}-event batch to {} sessions",
            delivered,
            batch.len(),
            self.sessions.len()
        );
    }

    fn run(mut self, command_rx: Receiver<FanoutCommand>) {
        info!("Fanout: thread started");

        while let Ok(command) = command_rx.recv() {
            match command {
                FanoutCommand::Subscribe { id, tx } => {
                    debug!("Fanout: session {} connected", id);
                    self.sessions.push(Session { id, tx });
                }
                FanoutCommand::Unsubscribe(id) => {
                    self.sessions.retain(|s| s.id != id);
                    debug!("Fanout: session {} disconnected", id);
                }
                FanoutCommand::Publish(batch) => self.deliver(batch),
                FanoutCommand::Stats(reply) => {
                    let stats = FanoutStats {
                        sessions: self.sessions.len(),
                        ..self.stats
                    };
                    let _ = reply.send(stats);
                }
                FanoutCommand::Shutdown => {
                    info!("Fanout: shutdown requested");
                    break;
                }
            }
        }

        info!("Fanout: thread stopped");
    }
}

/// Owner of the fanout thread.
pub struct FanoutChannel {
    handle: FanoutHandle,
    thread_handle: Option<JoinHandle<()>>,
}

impl FanoutChannel {
    /// Spawns the fanout thread.
    ///
    /// # Arguments
    ///
    /// * `session_capacity` - Events buffered per viewer before it is dropped
    pub fn spawn(session_capacity: usize) -> Result<Self> {
        let (tx, rx) = mpsc::channel();

        let thread_handle = thread::Builder::new()
            .name("fanout".to_string())
            .spawn(move || FanoutActor::default().run(rx))
            .context("Failed to spawn fanout thread")?;

        Ok(Self {
            handle: FanoutHandle {
                tx,
                next_session_id: Arc::new(AtomicU64::new(1)),
                session_capacity: session_capacity.max(1),
            },
            thread_handle: Some(thread_handle),
        })
    }

    pub fn handle(&self) -> FanoutHandle {
        self.handle.clone()
    }

    /// Stops the thread after it drains already-queued commands.
    pub fn shutdown(mut self) -> Result<()> {
        self.stop()
    }

    fn stop(&mut self) -> Result<()> {
        if let Some(thread_handle) = self.thread_handle.take() {
            let _ = self.handle.tx.send(FanoutCommand::Shutdown);
            thread_handle
                .join()
                .map_err(|_| anyhow::anyhow!("fanout thread panicked"))?;
        }
        Ok(())
    }
}

impl Drop for FanoutChannel {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            error!("Fanout: {:#}", e);
        }
    }
}

#[cfg(test)]
mod tests;
