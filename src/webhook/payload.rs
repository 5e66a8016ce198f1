// src/webhook/payload.rs

//! Callback body shapes and their conversion into a typed `PurchaseEvent`.
//!
//! The provider echoes back the metadata attached when the invoice was
//! created. Some providers stringify every metadata value, so coordinates and
//! prices are accepted either as JSON numbers or as numeric strings.

use crate::pixel::{
    parse_letter, parse_letters, parse_optional_color, ActivityKind, CellUpdate, Coord, PixelColor,
    Rect, ValidationError,
};
use serde::de::{Deserializer, Error as _};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt::Display;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    #[error("callback is missing {0}")]
    MissingField(&'static str),
    #[error("metadata does not describe a purchase: {0}")]
    Metadata(String),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("cell {cell} lies outside the purchased rectangle {rect}")]
    OutsideRectangle { cell: Coord, rect: Rect },
}

// --- Wire shapes ---

/// Top-level callback body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackEnvelope {
    pub event: String,
    #[serde(default)]
    pub payment_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_option")]
    pub amount: Option<u64>,
    /// Epoch seconds.
    #[serde(default, deserialize_with = "lenient_option")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl CallbackEnvelope {
    pub fn parse(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }
}

/// Metadata of a one-cell purchase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SingleMetadata {
    #[serde(deserialize_with = "lenient")]
    pub x: i64,
    #[serde(deserialize_with = "lenient")]
    pub y: i64,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub letter: Option<String>,
}

/// Metadata of a rectangle purchase, with the price quoted for every cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkMetadata {
    #[serde(deserialize_with = "lenient")]
    pub x1: i64,
    #[serde(deserialize_with = "lenient")]
    pub y1: i64,
    #[serde(deserialize_with = "lenient")]
    pub x2: i64,
    #[serde(deserialize_with = "lenient")]
    pub y2: i64,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub letters: Option<String>,
    pub pixel_updates: Vec<PixelUpdateMetadata>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelUpdateMetadata {
    #[serde(deserialize_with = "lenient")]
    pub x: i64,
    #[serde(deserialize_with = "lenient")]
    pub y: i64,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub letter: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub price: u64,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrText<T> {
    Number(T),
    Text(String),
}

fn lenient<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + FromStr,
    T::Err: Display,
{
    match NumberOrText::<T>::deserialize(deserializer)? {
        NumberOrText::Number(value) => Ok(value),
        NumberOrText::Text(text) => text.trim().parse().map_err(D::Error::custom),
    }
}

fn lenient_option<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + FromStr,
    T::Err: Display,
{
    match Option::<NumberOrText<T>>::deserialize(deserializer)? {
        None => Ok(None),
        Some(NumberOrText::Number(value)) => Ok(Some(value)),
        Some(NumberOrText::Text(text)) => text.trim().parse().map(Some).map_err(D::Error::custom),
    }
}

// --- Typed purchase ---

/// A validated purchase, parsed once at the boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PurchaseEvent {
    Single(CellUpdate),
    Bulk {
        rect: Rect,
        color: Option<PixelColor>,
        letters: Option<String>,
        cells: Vec<CellUpdate>,
    },
}

impl PurchaseEvent {
    pub fn kind(&self) -> ActivityKind {
        match self {
            PurchaseEvent::Single(_) => ActivityKind::Single,
            PurchaseEvent::Bulk { .. } => ActivityKind::Bulk,
        }
    }

    pub fn cells(&self) -> &[CellUpdate] {
        match self {
            PurchaseEvent::Single(cell) => std::slice::from_ref(cell),
            PurchaseEvent::Bulk { cells, .. } => cells,
        }
    }

    /// Sum of the prices quoted for every cell.
    pub fn quoted_total(&self) -> u64 {
        self.cells()
            .iter()
            .map(|c| c.price)
            .fold(0u64, u64::saturating_add)
    }

    /// Interprets a completed payment's metadata.
    ///
    /// A single purchase is priced by the callback's `amount`; a bulk purchase
    /// carries its own per-cell prices.
    pub fn from_envelope(envelope: &CallbackEnvelope) -> Result<Self, PayloadError> {
        let metadata = match &envelope.metadata {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => return Err(PayloadError::MissingField("metadata")),
            other => {
                return Err(PayloadError::Metadata(format!(
                    "expected an object, found {}",
                    json_type_name(other)
                )))
            }
        };

        if metadata.contains_key("pixelUpdates") {
            let bulk: BulkMetadata = serde_json::from_value(envelope.metadata.clone())
                .map_err(|e| PayloadError::Metadata(e.to_string()))?;
            Self::from_bulk(bulk)
        } else {
            let single: SingleMetadata = serde_json::from_value(envelope.metadata.clone())
                .map_err(|e| PayloadError::Metadata(e.to_string()))?;
            let price = envelope.amount.ok_or(PayloadError::MissingField("amount"))?;
            let cell = CellUpdate {
                coord: Coord::new(single.x, single.y),
                color: parse_optional_color(single.color.as_deref())?,
                letter: parse_letter(single.letter.as_deref())?,
                price,
            };
            cell.validate()?;
            Ok(PurchaseEvent::Single(cell))
        }
    }

    fn from_bulk(bulk: BulkMetadata) -> Result<Self, PayloadError> {
        let rect = Rect::new(bulk.x1, bulk.y1, bulk.x2, bulk.y2);
        if bulk.pixel_updates.is_empty() {
            return Err(ValidationError::EmptyPurchase.into());
        }

        let mut seen = HashSet::with_capacity(bulk.pixel_updates.len());
        let mut cells = Vec::with_capacity(bulk.pixel_updates.len());
        for update in bulk.pixel_updates {
            let coord = Coord::new(update.x, update.y);
            if !rect.contains(coord) {
                return Err(PayloadError::OutsideRectangle { cell: coord, rect });
            }
            if !seen.insert(coord) {
                return Err(ValidationError::DuplicateCoordinate(coord).into());
            }
            let cell = CellUpdate {
                coord,
                color: parse_optional_color(update.color.as_deref())?,
                letter: parse_letter(update.letter.as_deref())?,
                price: update.price,
            };
            cell.validate()?;
            cells.push(cell);
        }

        let letters = parse_letters(bulk.letters.as_deref())?;
        Ok(PurchaseEvent::Bulk {
            rect,
            color: parse_optional_color(bulk.color.as_deref())?,
            letters: (!letters.is_empty()).then(|| letters.into_iter().collect()),
            cells,
        })
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}
