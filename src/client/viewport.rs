// src/client/viewport.rs

//! Tiled cache of confirmed cells.
//!
//! The grid is cut into square tiles keyed by floor division, so negative
//! coordinates tile the same way as positive ones. A tile is either unknown,
//! in flight or fetched. Cells merge by server revision: an incoming row wins
//! only if it is at least as new as the cached one, so a slow fetch can never
//! overwrite a newer fanout update.

use crate::config::ViewportConfig;
use crate::pixel::{Coord, Pixel, Rect};
use log::*;
use std::collections::{BTreeMap, HashSet};

/// Tile position. Ordered row-major.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileKey {
    pub row: i64,
    pub col: i64,
}

impl TileKey {
    pub fn containing(coord: Coord, tile_size: i64) -> Self {
        Self {
            row: coord.y.div_euclid(tile_size),
            col: coord.x.div_euclid(tile_size),
        }
    }

    /// Cells covered by this tile.
    pub fn bounds(&self, tile_size: i64) -> Rect {
        let x1 = self.col.saturating_mul(tile_size);
        let y1 = self.row.saturating_mul(tile_size);
        Rect::new(
            x1,
            y1,
            x1.saturating_add(tile_size - 1),
            y1.saturating_add(tile_size - 1),
        )
    }
}

#[derive(Debug)]
pub struct ViewportCache {
    tile_size: i64,
    prefetch_margin: i64,
    max_tiles: usize,
    fetched: HashSet<TileKey>,
    in_flight: HashSet<TileKey>,
    cells: BTreeMap<Coord, Pixel>,
}

impl ViewportCache {
    pub fn new(config: &ViewportConfig) -> Self {
        Self {
            tile_size: config.tile_size.max(1),
            prefetch_margin: config.prefetch_margin.max(0),
            max_tiles: config.max_tiles_per_viewport.max(1),
            fetched: HashSet::new(),
            in_flight: HashSet::new(),
            cells: BTreeMap::new(),
        }
    }

    pub fn tile_size(&self) -> i64 {
        self.tile_size
    }

    /// Registers a new visible rectangle and returns the tiles that must be
    /// fetched for it, row-major, marking them in flight.
    ///
    /// Tiles already fetched or in flight are skipped. At most
    /// `max_tiles_per_viewport` tiles are returned per call.
    pub fn request_viewport(&mut self, visible: Rect) -> Vec<TileKey> {
        let area = visible.grow(self.prefetch_margin);
        let first = TileKey::containing(Coord::new(area.x1, area.y1), self.tile_size);
        let last = TileKey::containing(Coord::new(area.x2, area.y2), self.tile_size);

        let mut wanted = Vec::new();
        'rows: for row in first.row..=last.row {
            for col in first.col..=last.col {
                let tile = TileKey { row, col };
                if self.fetched.contains(&tile) || self.in_flight.contains(&tile) {
                    continue;
                }
                if wanted.len() == self.max_tiles {
                    warn!(
                        "ViewportCache: viewport {} needs more than {} tiles, deferring the rest",
                        visible, self.max_tiles
                    );
                    break 'rows;
                }
                wanted.push(tile);
            }
        }

        self.in_flight.extend(wanted.iter().copied());
        debug!(
            "ViewportCache: viewport {} requests {} tiles",
            visible,
            wanted.len()
        );
        wanted
    }

    /// Marks `tile` fetched and merges its rows. Returns how many rows changed
    /// the cache.
    pub fn complete_fetch(&mut self, tile: TileKey, pixels: Vec<Pixel>) -> usize {
        self.in_flight.remove(&tile);
        self.fetched.insert(tile);
        let merged = pixels
            .into_iter()
            .fold(0, |n, pixel| n + usize::from(self.apply_pixel(pixel)));
        trace!("ViewportCache: tile {:?} fetched, {} rows merged", tile, merged);
        merged
    }

    /// Clears the in-flight mark so a later viewport change retries the tile.
    pub fn fail_fetch(&mut self, tile: TileKey) {
        self.in_flight.remove(&tile);
    }

    /// Merges one row whether or not its tile was fetched. Returns `true` if
    /// the cache changed.
    pub fn apply_pixel(&mut self, pixel: Pixel) -> bool {
        match self.cells.get(&pixel.coord()) {
            Some(cached) if !cached.is_superseded_by(&pixel) => false,
            Some(cached) if *cached == pixel => false,
            _ => {
                self.cells.insert(pixel.coord(), pixel);
                true
            }
        }
    }

    pub fn get(&self, coord: Coord) -> Option<&Pixel> {
        self.cells.get(&coord)
    }

    /// Cached rows inside `rect`, row-major.
    pub fn cells_in(&self, rect: Rect) -> impl Iterator<Item = &Pixel> + '_ {
        self.cells
            .range(Coord::new(i64::MIN, rect.y1)..=Coord::new(i64::MAX, rect.y2))
            .filter(move |(coord, _)| rect.contains(**coord))
            .map(|(_, pixel)| pixel)
    }

    /// Forgets which tiles were fetched; cached rows stay until refetched.
    pub fn invalidate_all(&mut self) {
        info!(
            "ViewportCache: invalidating {} fetched tiles",
            self.fetched.len()
        );
        self.fetched.clear();
    }

    /// Puts back a row captured earlier, unless something newer arrived since.
    pub fn restore(&mut self, snapshot: Option<Pixel>) {
        if let Some(pixel) = snapshot {
            self.apply_pixel(pixel);
        }
    }

    pub fn is_fetched(&self, tile: TileKey) -> bool {
        self.fetched.contains(&tile)
    }

    pub fn is_in_flight(&self, tile: TileKey) -> bool {
        self.in_flight.contains(&tile)
    }

    pub fn fetched_count(&self) -> usize {
        self.fetched.len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }
}
