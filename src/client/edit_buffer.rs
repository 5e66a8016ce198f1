// src/client/edit_buffer.rs

//! Cells painted locally but not yet confirmed by the ledger.
//!
//! Each pending cell remembers the confirmed row it covers at the moment it
//! was first painted. `begin_payment` captures the cells being paid for; only
//! those can be confirmed, through fanout (the activity record for the awaited
//! payment, or a row matching the paid attributes) or through an explicit
//! success acknowledgement from the payment flow. Cells painted or repainted
//! after `begin_payment` stay pending.

use crate::fanout::FanoutEvent;
use crate::pixel::{Coord, Pixel, PixelColor};
use chrono::{DateTime, Utc};
use log::*;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingPurchase {
    pub coord: Coord,
    pub color: Option<PixelColor>,
    pub letter: Option<char>,
    pub price: u64,
    /// Confirmed row under this cell when it was first painted.
    pub snapshot: Option<Pixel>,
}

impl PendingPurchase {
    fn matches(&self, pixel: &Pixel) -> bool {
        pixel.coord() == self.coord && pixel.color == self.color && pixel.letter == self.letter
    }

    /// Stand-in row shown between a success acknowledgement and the server
    /// row. It sits one revision above the snapshot, so the server row for
    /// this purchase (or anything newer) always replaces it.
    pub fn provisional_pixel(&self, now: DateTime<Utc>) -> Pixel {
        Pixel {
            x: self.coord.x,
            y: self.coord.y,
            color: self.color.clone(),
            letter: self.letter,
            last_paid_amount: self.price,
            created_at: self.snapshot.as_ref().map_or(now, |s| s.created_at),
            updated_at: now,
            revision: self.snapshot.as_ref().map_or(0, |s| s.revision) + 1,
        }
    }
}

/// A payment in progress and the cells it pays for, as painted when it began.
#[derive(Debug)]
struct AwaitedPayment {
    reference: String,
    cells: BTreeMap<Coord, PendingPurchase>,
}

#[derive(Debug, Default)]
pub struct OptimisticEditBuffer {
    pending: BTreeMap<Coord, PendingPurchase>,
    awaiting: Option<AwaitedPayment>,
}

impl OptimisticEditBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a local paint. Re-painting a pending cell replaces its
    /// attributes but keeps the snapshot from the first paint.
    pub fn paint(
        &mut self,
        coord: Coord,
        color: Option<PixelColor>,
        letter: Option<char>,
        price: u64,
        confirmed: Option<&Pixel>,
    ) {
        let snapshot = match self.pending.remove(&coord) {
            Some(previous) => previous.snapshot,
            None => confirmed.cloned(),
        };
        self.pending.insert(
            coord,
            PendingPurchase {
                coord,
                color,
                letter,
                price,
                snapshot,
            },
        );
    }

    pub fn erase(&mut self, coord: Coord) -> Option<PendingPurchase> {
        self.pending.remove(&coord)
    }

    pub fn begin_payment(&mut self, reference: impl Into<String>) {
        let reference = reference.into();
        debug!(
            "EditBuffer: awaiting payment {} for {} cells",
            reference,
            self.pending.len()
        );
        self.awaiting = Some(AwaitedPayment {
            reference,
            cells: self.pending.clone(),
        });
    }

    pub fn awaiting_payment(&self) -> Option<&str> {
        self.awaiting.as_ref().map(|a| a.reference.as_str())
    }

    /// Promotes whatever `event` confirms and returns the promoted cells.
    pub fn on_fanout(&mut self, event: &FanoutEvent) -> Vec<PendingPurchase> {
        let Some(awaited) = self.awaiting.as_ref() else {
            return Vec::new();
        };
        match event {
            FanoutEvent::ActivityAppended(record) if record.payment_reference == awaited.reference => {
                let covered: Vec<Coord> = awaited
                    .cells
                    .keys()
                    .copied()
                    .filter(|coord| record.covers(*coord))
                    .collect();
                let promoted = self.take_paid(&covered);
                debug!(
                    "EditBuffer: payment {} confirmed {} cells",
                    record.payment_reference,
                    promoted.len()
                );
                self.awaiting = None;
                promoted
            }
            FanoutEvent::PixelUpdated(pixel) => {
                let matched = awaited
                    .cells
                    .get(&pixel.coord())
                    .is_some_and(|paid| paid.matches(pixel));
                if matched {
                    self.take_paid(&[pixel.coord()])
                } else {
                    Vec::new()
                }
            }
            FanoutEvent::ActivityAppended(_) => Vec::new(),
        }
    }

    /// Promotes the cells of the awaited payment after the payment flow
    /// reported success. Returns them as they were paid for.
    pub fn confirm_awaited(&mut self) -> Vec<PendingPurchase> {
        let Some(awaited) = self.awaiting.take() else {
            return Vec::new();
        };
        for (coord, paid) in &awaited.cells {
            if self.pending.get(coord) == Some(paid) {
                self.pending.remove(coord);
            }
        }
        awaited.cells.into_values().collect()
    }

    /// Discards every pending cell, returning them with their snapshots.
    pub fn clear(&mut self) -> Vec<PendingPurchase> {
        self.awaiting = None;
        std::mem::take(&mut self.pending).into_values().collect()
    }

    pub fn get(&self, coord: Coord) -> Option<&PendingPurchase> {
        self.pending.get(&coord)
    }

    /// Pending cells, row-major.
    pub fn iter(&self) -> impl Iterator<Item = &PendingPurchase> + '_ {
        self.pending.values()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Sum of the prices shown for the pending cells.
    pub fn total(&self) -> u64 {
        self.pending
            .values()
            .map(|p| p.price)
            .fold(0u64, u64::saturating_add)
    }

    /// Removes the awaited cells at `coords` that still hold the paid
    /// attributes. A cell repainted since the payment began stays pending.
    fn take_paid(&mut self, coords: &[Coord]) -> Vec<PendingPurchase> {
        let Some(awaited) = self.awaiting.as_ref() else {
            return Vec::new();
        };
        let mut promoted = Vec::new();
        for coord in coords {
            let Some(paid) = awaited.cells.get(coord) else {
                continue;
            };
            if self.pending.get(coord) == Some(paid) {
                self.pending.remove(coord);
            }
            promoted.push(paid.clone());
        }
        promoted
    }
}
