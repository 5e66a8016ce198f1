// src/pricing.rs

//! Pricing of cell purchases.
//!
//! A never-sold cell is priced by tier from the attributes requested for it.
//! A cell that has been sold before always costs exactly double its last paid
//! amount, whatever is requested.

use crate::config::PricingConfig;
use crate::pixel::PixelColor;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PricingEngine {
    base_price: u64,
    color_price: u64,
    letter_price: u64,
}

impl PricingEngine {
    pub fn new(config: &PricingConfig) -> Self {
        Self {
            base_price: config.base_price,
            color_price: config.color_price,
            letter_price: config.letter_price,
        }
    }

    /// Price of writing one cell.
    pub fn price(
        &self,
        color: Option<&PixelColor>,
        letter: Option<char>,
        last_paid_amount: Option<u64>,
    ) -> u64 {
        if let Some(previous) = last_paid_amount {
            return previous.saturating_mul(2);
        }
        match (color, letter) {
            (_, Some(_)) => self.letter_price,
            (Some(_), None) => self.color_price,
            (None, None) => self.base_price,
        }
    }

    /// Sum of independently priced cells, each `(color, letter, last_paid)`.
    pub fn bulk_total<'a, I>(&self, cells: I) -> u64
    where
        I: IntoIterator<Item = (Option<&'a PixelColor>, Option<char>, Option<u64>)>,
    {
        cells
            .into_iter()
            .map(|(color, letter, last)| self.price(color, letter, last))
            .fold(0u64, u64::saturating_add)
    }
}

impl Default for PricingEngine {
    fn default() -> Self {
        Self::new(&PricingConfig::default())
    }
}
