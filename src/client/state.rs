// src/client/state.rs

//! What a viewer shows: confirmed rows from the viewport cache with pending
//! local paints layered on top. The two collections are only merged here.

use super::edit_buffer::{OptimisticEditBuffer, PendingPurchase};
use super::viewport::{TileKey, ViewportCache};
use crate::config::ViewportConfig;
use crate::fanout::FanoutEvent;
use crate::pixel::{Coord, Pixel, PixelColor, Rect};
use crate::pricing::PricingEngine;
use chrono::{DateTime, Utc};
use log::*;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CellStatus {
    Confirmed,
    Pending,
}

/// One visible cell after merging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CellView {
    pub coord: Coord,
    pub color: Option<PixelColor>,
    pub letter: Option<char>,
    /// Last paid amount when confirmed, quoted price when pending.
    pub amount: u64,
    pub status: CellStatus,
}

impl CellView {
    fn confirmed(pixel: &Pixel) -> Self {
        Self {
            coord: pixel.coord(),
            color: pixel.color.clone(),
            letter: pixel.letter,
            amount: pixel.last_paid_amount,
            status: CellStatus::Confirmed,
        }
    }

    fn pending(purchase: &PendingPurchase) -> Self {
        Self {
            coord: purchase.coord,
            color: purchase.color.clone(),
            letter: purchase.letter,
            amount: purchase.price,
            status: CellStatus::Pending,
        }
    }
}

pub struct ClientState {
    viewport: ViewportCache,
    edits: OptimisticEditBuffer,
    pricing: PricingEngine,
    visible: Option<Rect>,
}

impl ClientState {
    pub fn new(config: &ViewportConfig, pricing: PricingEngine) -> Self {
        Self {
            viewport: ViewportCache::new(config),
            edits: OptimisticEditBuffer::new(),
            pricing,
            visible: None,
        }
    }

    pub fn viewport(&self) -> &ViewportCache {
        &self.viewport
    }

    pub fn edits(&self) -> &OptimisticEditBuffer {
        &self.edits
    }

    pub fn visible(&self) -> Option<Rect> {
        self.visible
    }

    /// Moves the viewport; returns the tiles to fetch.
    pub fn set_viewport(&mut self, visible: Rect) -> Vec<TileKey> {
        self.visible = Some(visible);
        self.viewport.request_viewport(visible)
    }

    pub fn tile_fetched(&mut self, tile: TileKey, pixels: Vec<Pixel>) {
        self.viewport.complete_fetch(tile, pixels);
    }

    pub fn tile_failed(&mut self, tile: TileKey) {
        self.viewport.fail_fetch(tile);
    }

    /// Paints a cell locally at the price the ledger would charge for it now.
    /// Returns that price.
    pub fn paint(&mut self, coord: Coord, color: Option<PixelColor>, letter: Option<char>) -> u64 {
        let confirmed = self.viewport.get(coord);
        let price = self
            .pricing
            .price(color.as_ref(), letter, confirmed.map(|p| p.last_paid_amount));
        self.edits.paint(coord, color, letter, price, confirmed);
        price
    }

    pub fn erase(&mut self, coord: Coord) -> bool {
        self.edits.erase(coord).is_some()
    }

    /// Drops every pending paint; each coordinate shows its pre-paint state.
    pub fn clear(&mut self) -> usize {
        let cleared = self.edits.clear();
        let count = cleared.len();
        for purchase in cleared {
            self.viewport.restore(purchase.snapshot);
        }
        count
    }

    pub fn begin_payment(&mut self, reference: impl Into<String>) {
        self.edits.begin_payment(reference);
    }

    /// The payment flow reported success before fanout did. Only the cells
    /// captured by `begin_payment` are promoted.
    pub fn payment_succeeded(&mut self, now: DateTime<Utc>) -> usize {
        let promoted = self.edits.confirm_awaited();
        let count = promoted.len();
        for purchase in promoted {
            self.viewport.apply_pixel(purchase.provisional_pixel(now));
        }
        count
    }

    /// Merges a fanout event into the confirmed view, then lets it confirm
    /// pending cells.
    pub fn on_fanout(&mut self, event: &FanoutEvent) {
        if let FanoutEvent::PixelUpdated(pixel) = event {
            self.viewport.apply_pixel(pixel.clone());
        }
        let promoted = self.edits.on_fanout(event);
        if !promoted.is_empty() {
            debug!("ClientState: {} pending cells confirmed", promoted.len());
        }
    }

    /// Fanout was lost; anything may have changed, so fetched tiles are
    /// forgotten. Returns tiles to refetch for the current viewport.
    pub fn fanout_disconnected(&mut self) -> Vec<TileKey> {
        self.viewport.invalidate_all();
        match self.visible {
            Some(visible) => self.viewport.request_viewport(visible),
            None => Vec::new(),
        }
    }

    pub fn cell_at(&self, coord: Coord) -> Option<CellView> {
        if let Some(pending) = self.edits.get(coord) {
            return Some(CellView::pending(pending));
        }
        self.viewport.get(coord).map(CellView::confirmed)
    }

    /// Merged cells inside `rect`, row-major.
    pub fn visible_cells(&self, rect: Rect) -> Vec<CellView> {
        let mut cells: Vec<CellView> = self
            .viewport
            .cells_in(rect)
            .filter(|pixel| self.edits.get(pixel.coord()).is_none())
            .map(CellView::confirmed)
            .collect();
        cells.extend(
            self.edits
                .iter()
                .filter(|pending| rect.contains(pending.coord))
                .map(CellView::pending),
        );
        cells.sort_by_key(|cell| cell.coord);
        cells
    }
}
