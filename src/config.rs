// src/config.rs

//! Defines the configuration structures for the pixel ledger.
//!
//! Every section deserializes with `#[serde(default)]`, so a configuration
//! file only needs to name the settings it changes. The file is JSON and is
//! located through the `PIXEL_LEDGER_CONFIG` environment variable; the webhook
//! secret is normally supplied through `PIXEL_LEDGER_WEBHOOK_SECRET` rather
//! than written to disk.

use anyhow::{bail, Context, Result};
use log::{info, warn};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Environment variable naming a JSON configuration file.
pub const CONFIG_PATH_ENV: &str = "PIXEL_LEDGER_CONFIG";
/// Environment variable overriding `webhook.secret`.
pub const WEBHOOK_SECRET_ENV: &str = "PIXEL_LEDGER_WEBHOOK_SECRET";

/// Process-wide configuration, loaded on first use.
///
/// A configuration that fails to load is reported and replaced by the
/// defaults; `Config::validate` then rejects the missing secret at startup.
pub static CONFIG: Lazy<Config> = Lazy::new(|| match Config::load() {
    Ok(config) => config,
    Err(e) => {
        warn!("Config: failed to load configuration, using defaults: {:#}", e);
        Config::default()
    }
});

// --- Top-Level Configuration Structure ---

/// Represents the complete configuration for the ledger server and its clients.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Price tiers for never-sold cells.
    pub pricing: PricingConfig,
    /// Payment provider callback verification.
    pub webhook: WebhookConfig,
    /// Retention of processed payment references.
    pub idempotency: IdempotencyConfig,
    /// Storage location and query limits.
    pub ledger: LedgerConfig,
    /// Real-time broadcast settings.
    pub fanout: FanoutConfig,
    /// Client-side tile loading.
    pub viewport: ViewportConfig,
}

impl Config {
    /// Loads the configuration from `PIXEL_LEDGER_CONFIG` (if set) and applies
    /// environment overrides.
    pub fn load() -> Result<Config> {
        let mut config = match std::env::var_os(CONFIG_PATH_ENV) {
            Some(path) => {
                let path = PathBuf::from(path);
                info!("Config: loading {}", path.display());
                Config::from_file(&path)?
            }
            None => Config::default(),
        };

        if let Ok(secret) = std::env::var(WEBHOOK_SECRET_ENV) {
            config.webhook.secret = secret;
        }

        Ok(config)
    }

    /// Reads a JSON configuration file.
    pub fn from_file(path: &std::path::Path) -> Result<Config> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Checks the cross-field invariants the rest of the crate relies on.
    pub fn validate(&self) -> Result<()> {
        let p = &self.pricing;
        if !(p.base_price > 0 && p.color_price > p.base_price && p.letter_price > p.color_price) {
            bail!(
                "pricing tiers must satisfy 0 < base ({}) < color ({}) < letter ({})",
                p.base_price,
                p.color_price,
                p.letter_price
            );
        }
        if self.webhook.secret.is_empty() {
            bail!(
                "webhook.secret is empty; set it in the config file or via {}",
                WEBHOOK_SECRET_ENV
            );
        }
        if self.webhook.acceptance_window_secs == 0 {
            bail!("webhook.acceptance_window_secs must be positive");
        }
        // A callback may be stamped up to one window ahead and is then accepted
        // for one more window; its reference must outlive both.
        if self.idempotency.horizon_secs <= self.webhook.acceptance_window_secs.saturating_mul(2) {
            bail!(
                "idempotency.horizon_secs ({}) must exceed twice webhook.acceptance_window_secs ({})",
                self.idempotency.horizon_secs,
                self.webhook.acceptance_window_secs
            );
        }
        if self.ledger.max_bulk_cells == 0 || self.ledger.max_query_cells == 0 {
            bail!("ledger cell limits must be positive");
        }
        if self.fanout.session_queue_capacity == 0 {
            bail!("fanout.session_queue_capacity must be positive");
        }
        if self.viewport.tile_size <= 0 || self.viewport.prefetch_margin < 0 {
            bail!("viewport.tile_size must be positive and prefetch_margin non-negative");
        }
        Ok(())
    }
}

// --- Pricing Configuration ---

/// Prices, in the smallest currency unit, of a cell that has never been sold.
/// Resold cells always cost double their last paid amount.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PricingConfig {
    /// Neither color nor letter.
    pub base_price: u64,
    /// Color only.
    pub color_price: u64,
    /// Letter present.
    pub letter_price: u64,
}

impl Default for PricingConfig {
    fn default() -> Self {
        PricingConfig {
            base_price: 1,
            color_price: 10,
            letter_price: 20,
        }
    }
}

// --- Webhook Configuration ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WebhookConfig {
    /// Shared HMAC secret. Never logged.
    pub secret: String,
    /// Header carrying the hex HMAC-SHA256 of the raw body.
    pub signature_header: String,
    /// Maximum distance, in seconds, between a callback's timestamp and now.
    pub acceptance_window_secs: u64,
    /// The only event type that mutates the grid.
    pub completed_event: String,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        WebhookConfig {
            secret: String::new(),
            signature_header: "x-payment-signature".to_string(),
            acceptance_window_secs: 300,
            completed_event: "payment.completed".to_string(),
        }
    }
}

// --- Idempotency Configuration ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IdempotencyConfig {
    /// Age after which a processed reference may be forgotten.
    pub horizon_secs: u64,
    /// Soft cap; beyond it the oldest references outside the acceptance
    /// window are evicted early.
    pub max_entries: usize,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        IdempotencyConfig {
            horizon_secs: 24 * 60 * 60,
            max_entries: 100_000,
        }
    }
}

// --- Ledger Configuration ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LedgerConfig {
    /// Append-only journal file. `None` keeps the ledger in memory only.
    pub journal_path: Option<PathBuf>,
    /// Largest rectangle, in cells, a single region query may cover.
    pub max_query_cells: u64,
    /// Largest rectangle, in cells, a single bulk purchase may cover.
    pub max_bulk_cells: u64,
    /// Activity entries returned when the caller gives no limit.
    pub default_activity_limit: usize,
    /// Upper clamp for caller-supplied activity limits.
    pub max_activity_limit: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        LedgerConfig {
            journal_path: Some(PathBuf::from("pixel-ledger.journal")),
            max_query_cells: 250_000,
            max_bulk_cells: 1024,
            default_activity_limit: 50,
            max_activity_limit: 500,
        }
    }
}

// --- Fanout Configuration ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FanoutConfig {
    /// Events buffered per viewer before the viewer is dropped as too slow.
    pub session_queue_capacity: usize,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        FanoutConfig {
            session_queue_capacity: 1024,
        }
    }
}

// --- Viewport Configuration ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ViewportConfig {
    /// Edge length of a square tile, in cells.
    pub tile_size: i64,
    /// Cells added on every side of the visible rectangle before tiling.
    pub prefetch_margin: i64,
    /// Most tiles requested for one viewport change.
    pub max_tiles_per_viewport: usize,
}

impl Default for ViewportConfig {
    fn default() -> Self {
        ViewportConfig {
            tile_size: 64,
            prefetch_margin: 16,
            max_tiles_per_viewport: 256,
        }
    }
}
