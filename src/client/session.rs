// src/client/session.rs

//! Client Sync Actor - single writer of a viewer's `ClientState`.
//!
//! Threading model:
//! - `client-sync` owns the `ClientState` and drains one command queue
//! - `tile-fetch` fetches queued tiles one at a time from a `RegionSource`
//!   and posts the result back into the command queue
//! - `fanout-pump` (optional, see `ClientHandle::attach`) forwards a viewer
//!   session's events into the same queue
//!
//! Because fetch results and fanout events are applied by one thread in
//! arrival order, the only reconciliation needed is the cache's revision rule.

use super::state::{CellView, ClientState};
use super::viewport::TileKey;
use super::RegionSource;
use crate::clock::Clock;
use crate::config::ViewportConfig;
use crate::fanout::{FanoutEvent, ViewerSession};
use crate::pixel::{parse_letter, parse_optional_color, Coord, Pixel, PixelColor, Rect};
use crate::pricing::PricingEngine;
use anyhow::{anyhow, Context, Result};
use log::*;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Summary of the client state, taken on the sync thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSnapshot {
    pub visible: Option<Rect>,
    /// Merged cells inside `visible`, row-major.
    pub cells: Vec<CellView>,
    pub pending_cells: usize,
    pub pending_total: u64,
    pub awaiting_payment: Option<String>,
    pub fetched_tiles: usize,
    pub in_flight_tiles: usize,
}

enum ClientCommand {
    SetViewport(Rect),
    Paint {
        coord: Coord,
        color: Option<PixelColor>,
        letter: Option<char>,
    },
    Erase(Coord),
    Clear,
    BeginPayment(String),
    PaymentSucceeded,
    Fanout(FanoutEvent),
    FanoutDisconnected,
    TileFetched {
        tile: TileKey,
        pixels: Vec<Pixel>,
    },
    TileFailed {
        tile: TileKey,
        error: String,
    },
    Snapshot(Sender<ClientSnapshot>),
    CellAt(Coord, Sender<Option<CellView>>),
    Shutdown,
}

/// Cloneable front of a running client.
#[derive(Clone)]
pub struct ClientHandle {
    tx: Sender<ClientCommand>,
}

impl ClientHandle {
    fn send(&self, command: ClientCommand) -> Result<()> {
        self.tx
            .send(command)
            .map_err(|_| anyhow!("client sync thread is not running"))
    }

    pub fn set_viewport(&self, visible: Rect) -> Result<()> {
        self.send(ClientCommand::SetViewport(visible))
    }

    /// Paints one cell locally. Attributes are validated here, on the caller.
    pub fn paint(&self, x: i64, y: i64, color: Option<&str>, letter: Option<&str>) -> Result<()> {
        self.send(ClientCommand::Paint {
            coord: Coord::new(x, y),
            color: parse_optional_color(color)?,
            letter: parse_letter(letter)?,
        })
    }

    pub fn erase(&self, x: i64, y: i64) -> Result<()> {
        self.send(ClientCommand::Erase(Coord::new(x, y)))
    }

    pub fn clear(&self) -> Result<()> {
        self.send(ClientCommand::Clear)
    }

    pub fn begin_payment(&self, reference: impl Into<String>) -> Result<()> {
        self.send(ClientCommand::BeginPayment(reference.into()))
    }

    pub fn payment_succeeded(&self) -> Result<()> {
        self.send(ClientCommand::PaymentSucceeded)
    }

    pub fn push_fanout(&self, event: FanoutEvent) -> Result<()> {
        self.send(ClientCommand::Fanout(event))
    }

    pub fn fanout_disconnected(&self) -> Result<()> {
        self.send(ClientCommand::FanoutDisconnected)
    }

    pub fn snapshot(&self) -> Result<ClientSnapshot> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.send(ClientCommand::Snapshot(reply_tx))?;
        reply_rx
            .recv_timeout(Duration::from_secs(5))
            .context("Client snapshot request timed out")
    }

    pub fn cell_at(&self, x: i64, y: i64) -> Result<Option<CellView>> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.send(ClientCommand::CellAt(Coord::new(x, y), reply_tx))?;
        reply_rx
            .recv_timeout(Duration::from_secs(5))
            .context("Client cell request timed out")
    }

    /// Forwards `session`'s events into this client on a `fanout-pump`
    /// thread. When the session ends, the client is told fanout was lost.
    pub fn attach(&self, session: ViewerSession) -> Result<JoinHandle<()>> {
        let handle = self.clone();
        thread::Builder::new()
            .name("fanout-pump".to_string())
            .spawn(move || {
                debug!("ClientSync: pumping fanout session {}", session.id());
                while let Some(event) = session.recv() {
                    if handle.push_fanout(event).is_err() {
                        return;
                    }
                }
                warn!("ClientSync: fanout session {} ended", session.id());
                let _ = handle.fanout_disconnected();
            })
            .context("Failed to spawn fanout pump thread")
    }
}

struct ClientActor {
    state: ClientState,
    fetch_tx: Sender<Vec<(TileKey, Rect)>>,
    clock: Arc<dyn Clock>,
}

impl ClientActor {
    fn request(&self, tiles: Vec<TileKey>) {
        if tiles.is_empty() {
            return;
        }
        let tile_size = self.state.viewport().tile_size();
        let batch = tiles
            .into_iter()
            .map(|tile| (tile, tile.bounds(tile_size)))
            .collect();
        if self.fetch_tx.send(batch).is_err() {
            warn!("ClientSync: tile fetch thread is gone");
        }
    }

    fn snapshot(&self) -> ClientSnapshot {
        let visible = self.state.visible();
        ClientSnapshot {
            visible,
            cells: visible
                .map(|rect| self.state.visible_cells(rect))
                .unwrap_or_default(),
            pending_cells: self.state.edits().len(),
            pending_total: self.state.edits().total(),
            awaiting_payment: self.state.edits().awaiting_payment().map(str::to_string),
            fetched_tiles: self.state.viewport().fetched_count(),
            in_flight_tiles: self.state.viewport().in_flight_count(),
        }
    }

    fn run(mut self, command_rx: Receiver<ClientCommand>) {
        info!("ClientSync: thread started");

        while let Ok(command) = command_rx.recv() {
            match command {
                ClientCommand::SetViewport(visible) => {
                    let tiles = self.state.set_viewport(visible);
                    self.request(tiles);
                }
                ClientCommand::Paint {
                    coord,
                    color,
                    letter,
                } => {
                    let price = self.state.paint(coord, color, letter);
                    trace!("ClientSync: painted {} at {}", coord, price);
                }
                ClientCommand::Erase(coord) => {
                    self.state.erase(coord);
                }
                ClientCommand::Clear => {
                    let cleared = self.state.clear();
                    debug!("ClientSync: cleared {} pending cells", cleared);
                }
                ClientCommand::BeginPayment(reference) => self.state.begin_payment(reference),
                ClientCommand::PaymentSucceeded => {
                    let promoted = self.state.payment_succeeded(self.clock.now());
                    debug!("ClientSync: payment succeeded for {} cells", promoted);
                }
                ClientCommand::Fanout(event) => self.state.on_fanout(&event),
                ClientCommand::FanoutDisconnected => {
                    let tiles = self.state.fanout_disconnected();
                    self.request(tiles);
                }
                ClientCommand::TileFetched { tile, pixels } => {
                    self.state.tile_fetched(tile, pixels);
                }
                ClientCommand::TileFailed { tile, error } => {
                    warn!("ClientSync: fetching tile {:?} failed: {}", tile, error);
                    self.state.tile_failed(tile);
                }
                ClientCommand::Snapshot(reply) => {
                    let _ = reply.send(self.snapshot());
                }
                ClientCommand::CellAt(coord, reply) => {
                    let _ = reply.send(self.state.cell_at(coord));
                }
                ClientCommand::Shutdown => {
                    info!("ClientSync: shutdown requested");
                    break;
                }
            }
        }

        info!("ClientSync: thread stopped");
    }
}

fn run_fetcher(
    source: Arc<dyn RegionSource>,
    fetch_rx: Receiver<Vec<(TileKey, Rect)>>,
    results: Sender<ClientCommand>,
) {
    debug!("TileFetch: thread started");
    while let Ok(batch) = fetch_rx.recv() {
        for (tile, bounds) in batch {
            let command = match source.fetch_region(bounds) {
                Ok(pixels) => ClientCommand::TileFetched { tile, pixels },
                Err(e) => ClientCommand::TileFailed {
                    tile,
                    error: format!("{:#}", e),
                },
            };
            if results.send(command).is_err() {
                return;
            }
        }
    }
    debug!("TileFetch: thread stopped");
}

/// Owner of a client's threads.
pub struct ClientSync {
    handle: ClientHandle,
    sync_thread: Option<JoinHandle<()>>,
    fetch_thread: Option<JoinHandle<()>>,
}

impl ClientSync {
    pub fn spawn(
        source: Arc<dyn RegionSource>,
        viewport: &ViewportConfig,
        pricing: PricingEngine,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let (fetch_tx, fetch_rx) = mpsc::channel();

        let results = tx.clone();
        let fetch_thread = thread::Builder::new()
            .name("tile-fetch".to_string())
            .spawn(move || run_fetcher(source, fetch_rx, results))
            .context("Failed to spawn tile fetch thread")?;

        let actor = ClientActor {
            state: ClientState::new(viewport, pricing),
            fetch_tx,
            clock,
        };
        let sync_thread = thread::Builder::new()
            .name("client-sync".to_string())
            .spawn(move || actor.run(rx))
            .context("Failed to spawn client sync thread")?;

        Ok(Self {
            handle: ClientHandle { tx },
            sync_thread: Some(sync_thread),
            fetch_thread: Some(fetch_thread),
        })
    }

    pub fn handle(&self) -> ClientHandle {
        self.handle.clone()
    }

    pub fn shutdown(mut self) -> Result<()> {
        self.stop()
    }

    fn stop(&mut self) -> Result<()> {
        if let Some(sync_thread) = self.sync_thread.take() {
            let _ = self.handle.tx.send(ClientCommand::Shutdown);
            sync_thread
                .join()
                .map_err(|_| anyhow!("client sync thread panicked"))?;
        }
        // The fetch queue closes once the sync actor is dropped.
        if let Some(fetch_thread) = self.fetch_thread.take() {
            fetch_thread
                .join()
                .map_err(|_| anyhow!("tile fetch thread panicked"))?;
        }
        Ok(())
    }
}

impl Drop for ClientSync {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            error!("ClientSync: {:#}", e);
        }
    }
}
