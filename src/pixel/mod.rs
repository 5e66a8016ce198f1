// src/pixel/mod.rs

//! Data model shared by the ledger, the callback processor, the fanout channel
//! and clients: coordinates, rectangles, validated cell attributes, ledger rows
//! and activity records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

/// Rejections raised before any state is touched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("invalid color {0:?}: expected #rgb or #rrggbb")]
    InvalidColor(String),
    #[error("invalid letter {0:?}: expected a single printable character")]
    InvalidLetter(String),
    #[error("rectangle covers {cells} cells, limit is {max}")]
    RectangleTooLarge { cells: u128, max: u64 },
    #[error("coordinate {0} appears more than once in one purchase")]
    DuplicateCoordinate(Coord),
    #[error("{letters} letters do not fit in {cells} cells")]
    TooManyLetters { letters: usize, cells: u64 },
    #[error("purchase contains no cells")]
    EmptyPurchase,
    #[error("price for {0} must be positive")]
    NonPositivePrice(Coord),
}

// --- Coordinates ---

/// An integer grid position. The grid has no bounds.
///
/// Coordinates order row-major: by `y`, then by `x`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Coord {
    pub x: i64,
    pub y: i64,
}

impl Coord {
    pub fn new(x: i64, y: i64) -> Self {
        Self { x, y }
    }
}

impl Ord for Coord {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.y, self.x).cmp(&(other.y, other.x))
    }
}

impl PartialOrd for Coord {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Coord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// An axis-aligned rectangle with inclusive corners, always normalized so
/// that `x1 <= x2` and `y1 <= y2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rect {
    pub x1: i64,
    pub y1: i64,
    pub x2: i64,
    pub y2: i64,
}

impl Rect {
    /// Builds a rectangle from any two opposite corners.
    pub fn new(x1: i64, y1: i64, x2: i64, y2: i64) -> Self {
        Self {
            x1: x1.min(x2),
            y1: y1.min(y2),
            x2: x1.max(x2),
            y2: y1.max(y2),
        }
    }

    pub fn width(&self) -> u128 {
        (self.x2 as i128 - self.x1 as i128 + 1) as u128
    }

    pub fn height(&self) -> u128 {
        (self.y2 as i128 - self.y1 as i128 + 1) as u128
    }

    /// Number of cells covered. Computed wide and saturating, since a
    /// rectangle spanning the whole plane holds 2^128 cells.
    pub fn cell_count(&self) -> u128 {
        self.width()
            .checked_mul(self.height())
            .unwrap_or(u128::MAX)
    }

    /// Rejects rectangles covering more than `max` cells.
    pub fn ensure_at_most(&self, max: u64) -> Result<(), ValidationError> {
        let cells = self.cell_count();
        if cells > max as u128 {
            return Err(ValidationError::RectangleTooLarge { cells, max });
        }
        Ok(())
    }

    pub fn contains(&self, coord: Coord) -> bool {
        (self.x1..=self.x2).contains(&coord.x) && (self.y1..=self.y2).contains(&coord.y)
    }

    /// Grows the rectangle by `margin` cells on every side, saturating at the
    /// integer limits.
    pub fn grow(&self, margin: i64) -> Rect {
        Rect {
            x1: self.x1.saturating_sub(margin),
            y1: self.y1.saturating_sub(margin),
            x2: self.x2.saturating_add(margin),
            y2: self.y2.saturating_add(margin),
        }
    }

    /// Cells in row-major order. Callers bound the size first.
    pub fn cells(&self) -> impl Iterator<Item = Coord> + '_ {
        (self.y1..=self.y2).flat_map(move |y| (self.x1..=self.x2).map(move |x| Coord { x, y }))
    }
}

impl fmt::Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})-({}, {})", self.x1, self.y1, self.x2, self.y2)
    }
}

// --- Cell attributes ---

/// A validated `#rgb` / `#rrggbb` color code, stored lower-case.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PixelColor(String);

impl PixelColor {
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let trimmed = raw.trim();
        let digits = trimmed
            .strip_prefix('#')
            .ok_or_else(|| ValidationError::InvalidColor(raw.to_string()))?;
        let well_formed =
            matches!(digits.len(), 3 | 6) && digits.chars().all(|c| c.is_ascii_hexdigit());
        if !well_formed {
            return Err(ValidationError::InvalidColor(raw.to_string()));
        }
        Ok(Self(trimmed.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for PixelColor {
    type Error = ValidationError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        PixelColor::parse(&raw)
    }
}

impl From<PixelColor> for String {
    fn from(color: PixelColor) -> Self {
        color.0
    }
}

impl fmt::Display for PixelColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Parses an optional color where an empty string means "no color".
pub fn parse_optional_color(raw: Option<&str>) -> Result<Option<PixelColor>, ValidationError> {
    match raw.map(str::trim) {
        None | Some("") => Ok(None),
        Some(value) => PixelColor::parse(value).map(Some),
    }
}

/// Parses an optional letter where an empty string means "no letter".
pub fn parse_letter(raw: Option<&str>) -> Result<Option<char>, ValidationError> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let mut chars = raw.chars();
    match (chars.next(), chars.next()) {
        (None, _) => Ok(None),
        (Some(c), None) if !c.is_control() && !c.is_whitespace() => Ok(Some(c)),
        _ => Err(ValidationError::InvalidLetter(raw.to_string())),
    }
}

/// Validates a run of letters for a bulk purchase; each must be a single
/// printable character.
pub fn parse_letters(raw: Option<&str>) -> Result<Vec<char>, ValidationError> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    raw.chars()
        .map(|c| {
            if c.is_control() || c.is_whitespace() {
                Err(ValidationError::InvalidLetter(raw.to_string()))
            } else {
                Ok(c)
            }
        })
        .collect()
}

// --- Ledger rows ---

/// One live cell of the grid. At most one exists per coordinate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pixel {
    pub x: i64,
    pub y: i64,
    pub color: Option<PixelColor>,
    pub letter: Option<char>,
    pub last_paid_amount: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Ledger commit that last wrote this row; higher is newer.
    pub revision: u64,
}

impl Pixel {
    pub fn coord(&self) -> Coord {
        Coord {
            x: self.x,
            y: self.y,
        }
    }

    /// True if `other` should replace `self` in a cached view.
    pub fn is_superseded_by(&self, other: &Pixel) -> bool {
        other.revision >= self.revision
    }
}

/// A requested cell mutation with the price quoted for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellUpdate {
    pub coord: Coord,
    pub color: Option<PixelColor>,
    pub letter: Option<char>,
    pub price: u64,
}

impl CellUpdate {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.price == 0 {
            return Err(ValidationError::NonPositivePrice(self.coord));
        }
        Ok(())
    }
}

// --- Activity log ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityKind {
    Single,
    Bulk,
}

/// Append-only record of one applied purchase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityRecord {
    /// Ledger commit that created this record.
    pub id: u64,
    pub kind: ActivityKind,
    pub cells: Vec<Coord>,
    pub color: Option<PixelColor>,
    pub letter: Option<char>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub letters: Option<String>,
    pub amount_paid: u64,
    pub created_at: DateTime<Utc>,
    pub payment_reference: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_reference: Option<String>,
}

impl ActivityRecord {
    pub fn covers(&self, coord: Coord) -> bool {
        self.cells.contains(&coord)
    }
}
