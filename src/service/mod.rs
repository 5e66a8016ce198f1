// src/service/mod.rs

//! Query and quote interface in front of the ledger.
//!
//! Reads come straight from the ledger. A quote prices the requested cells
//! against current ledger state, builds the metadata the provider echoes back
//! in its callback, and asks the `InvoiceProvider` for a payment handle.
//! Quotes never mutate the ledger; only the confirmed callback does.

use crate::client::RegionSource;
use crate::config::LedgerConfig;
use crate::invoice::{InvoiceProvider, InvoiceRequest};
use crate::ledger::GridLedger;
use crate::pixel::{
    parse_letter, parse_letters, parse_optional_color, ActivityRecord, Coord, Pixel, Rect,
    ValidationError,
};
use crate::pricing::PricingEngine;
use crate::webhook::{BulkMetadata, PixelUpdateMetadata, SingleMetadata};
use anyhow::Context;
use chrono::{DateTime, Utc};
use log::*;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("payment provider failed: {0:#}")]
    Provider(anyhow::Error),
    #[error("ledger read failed: {0:#}")]
    Storage(anyhow::Error),
}

/// What a client needs to pay for a quote.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentHandle {
    pub amount: u64,
    pub payment_reference: String,
    pub payment_target: String,
    pub expires_at: DateTime<Utc>,
    /// Exactly what the provider will echo back in the callback.
    pub metadata: serde_json::Value,
}

/// Caps applied to caller-supplied sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceLimits {
    pub max_query_cells: u64,
    pub max_bulk_cells: u64,
    pub default_activity_limit: usize,
    pub max_activity_limit: usize,
}

impl From<&LedgerConfig> for ServiceLimits {
    fn from(config: &LedgerConfig) -> Self {
        Self {
            max_query_cells: config.max_query_cells,
            max_bulk_cells: config.max_bulk_cells,
            default_activity_limit: config.default_activity_limit,
            max_activity_limit: config.max_activity_limit,
        }
    }
}

impl Default for ServiceLimits {
    fn default() -> Self {
        Self::from(&LedgerConfig::default())
    }
}

pub struct PixelService {
    ledger: Arc<GridLedger>,
    pricing: PricingEngine,
    provider: Arc<dyn InvoiceProvider>,
    limits: ServiceLimits,
}

impl PixelService {
    pub fn new(
        ledger: Arc<GridLedger>,
        pricing: PricingEngine,
        provider: Arc<dyn InvoiceProvider>,
        limits: ServiceLimits,
    ) -> Self {
        Self {
            ledger,
            pricing,
            provider,
            limits,
        }
    }

    /// Cells inside `rect`, row-major. Oversized rectangles are rejected.
    pub fn pixels_in_rect(&self, rect: Rect) -> Result<Vec<Pixel>, ServiceError> {
        rect.ensure_at_most(self.limits.max_query_cells)?;
        self.ledger
            .get_in_rectangle(rect)
            .map_err(ServiceError::Storage)
    }

    /// Newest-first activity, `limit` defaulted and clamped.
    pub fn recent_activity(&self, limit: Option<usize>) -> Result<Vec<ActivityRecord>, ServiceError> {
        let limit = limit
            .unwrap_or(self.limits.default_activity_limit)
            .min(self.limits.max_activity_limit);
        self.ledger
            .recent_activity(limit)
            .map_err(ServiceError::Storage)
    }

    pub fn quote_single(
        &self,
        x: i64,
        y: i64,
        color: Option<&str>,
        letter: Option<&str>,
    ) -> Result<PaymentHandle, ServiceError> {
        let coord = Coord::new(x, y);
        let parsed_color = parse_optional_color(color)?;
        let parsed_letter = parse_letter(letter)?;
        let last_paid = self
            .ledger
            .get_by_coordinate(coord)
            .map_err(ServiceError::Storage)?
            .map(|p| p.last_paid_amount);
        let amount = self
            .pricing
            .price(parsed_color.as_ref(), parsed_letter, last_paid);

        let metadata = SingleMetadata {
            x,
            y,
            color: parsed_color.map(String::from),
            letter: parsed_letter.map(String::from),
        };
        debug!("PixelService: quoted {} at {}", coord, amount);
        self.issue(amount, format!("pixel {}", coord), &metadata)
    }

    /// Quotes every cell of `rect`, each priced on its own. Letters go to the
    /// cells in row-major order; remaining cells get none.
    pub fn quote_bulk(
        &self,
        rect: Rect,
        color: Option<&str>,
        letters: Option<&str>,
    ) -> Result<PaymentHandle, ServiceError> {
        rect.ensure_at_most(self.limits.max_bulk_cells)?;
        let parsed_color = parse_optional_color(color)?;
        let parsed_letters = parse_letters(letters)?;
        let cells = rect.cell_count() as u64;
        if parsed_letters.len() as u64 > cells {
            return Err(ValidationError::TooManyLetters {
                letters: parsed_letters.len(),
                cells,
            }
            .into());
        }

        let coords: Vec<Coord> = rect.cells().collect();
        let last_paid = self
            .ledger
            .last_paid_amounts(&coords)
            .map_err(ServiceError::Storage)?;

        let priced: Vec<(Coord, Option<char>, Option<u64>)> = coords
            .iter()
            .zip(last_paid)
            .enumerate()
            .map(|(i, (coord, last))| (*coord, parsed_letters.get(i).copied(), last))
            .collect();
        let amount = self.pricing.bulk_total(
            priced
                .iter()
                .map(|(_, letter, last)| (parsed_color.as_ref(), *letter, *last)),
        );
        let pixel_updates: Vec<PixelUpdateMetadata> = priced
            .iter()
            .map(|(coord, letter, last)| PixelUpdateMetadata {
                x: coord.x,
                y: coord.y,
                color: parsed_color.as_ref().map(|c| c.as_str().to_string()),
                letter: letter.map(String::from),
                price: self.pricing.price(parsed_color.as_ref(), *letter, *last),
            })
            .collect();

        let metadata = BulkMetadata {
            x1: rect.x1,
            y1: rect.y1,
            x2: rect.x2,
            y2: rect.y2,
            color: parsed_color.map(String::from),
            letters: (!parsed_letters.is_empty()).then(|| parsed_letters.iter().collect()),
            pixel_updates,
        };
        debug!("PixelService: quoted {} ({} cells) at {}", rect, cells, amount);
        self.issue(amount, format!("{} pixels at {}", cells, rect), &metadata)
    }

    fn issue<M: Serialize>(
        &self,
        amount: u64,
        memo: String,
        metadata: &M,
    ) -> Result<PaymentHandle, ServiceError> {
        let metadata = serde_json::to_value(metadata)
            .context("Failed to encode quote metadata")
            .map_err(ServiceError::Provider)?;
        let invoice = self
            .provider
            .create_invoice(&InvoiceRequest {
                amount,
                memo,
                metadata: metadata.clone(),
            })
            .map_err(ServiceError::Provider)?;
        info!(
            "PixelService: issued payment {} for {}",
            invoice.payment_reference, amount
        );
        Ok(PaymentHandle {
            amount,
            payment_reference: invoice.payment_reference,
            payment_target: invoice.payment_target,
            expires_at: invoice.expires_at,
            metadata,
        })
    }
}

impl RegionSource for PixelService {
    fn fetch_region(&self, rect: Rect) -> anyhow::Result<Vec<Pixel>> {
        Ok(self.pixels_in_rect(rect)?)
    }
}

#[cfg(test)]
mod tests;
