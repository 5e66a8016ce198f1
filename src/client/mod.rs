// src/client/mod.rs

//! Viewer-side state: the tiled cache of confirmed cells, the buffer of
//! locally painted cells awaiting payment, and the actor that keeps both in
//! step with region fetches and fanout events.

pub mod edit_buffer;
pub mod session;
pub mod state;
pub mod viewport;

pub use edit_buffer::{OptimisticEditBuffer, PendingPurchase};
pub use session::{ClientHandle, ClientSnapshot, ClientSync};
pub use state::{CellStatus, CellView, ClientState};
pub use viewport::{TileKey, ViewportCache};

use crate::pixel::{Pixel, Rect};

/// Where a client loads confirmed cells from.
pub trait RegionSource: Send + Sync {
    /// Every ledger row inside `rect`.
    fn fetch_region(&self, rect: Rect) -> anyhow::Result<Vec<Pixel>>;
}
