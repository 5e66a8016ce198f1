// src/processor/mod.rs

//! Payment Callback Processor.
//!
//! Turns a provider delivery `(signature header, raw body)` into at most one
//! ledger mutation:
//!
//! 1. Verify the HMAC over the raw body and the timestamp window.
//! 2. Skip references that were already applied.
//! 3. Parse the metadata into a typed `PurchaseEvent`.
//! 4. Apply it to the ledger with the quoted prices and mark the reference.
//! 5. Publish one event per mutated cell, then the activity record.
//!
//! Steps 1 and 3 run concurrently across deliveries. The duplicate re-check,
//! apply, mark and publish run under one lock, so two deliveries of the same
//! payment can never both apply and fanout order matches ledger order.
//!
//! Only a storage failure is reported to the provider as a failure (so it
//! retries); every other non-applying outcome is acknowledged.

use crate::clock::Clock;
use crate::config::WebhookConfig;
use crate::fanout::{FanoutEvent, FanoutHandle};
use crate::idempotency::IdempotencyStore;
use crate::ledger::{GridLedger, LedgerError, NewActivity};
use crate::pixel::{ActivityRecord, Pixel};
use crate::webhook::{CallbackEnvelope, PayloadError, PurchaseEvent, SignatureError, SignatureVerifier};
use anyhow::{anyhow, Context};
use chrono::{DateTime, Duration};
use log::*;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

/// A delivery that was acknowledged to the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackOutcome {
    Applied {
        payment_reference: String,
        pixels: Vec<Pixel>,
        activity: ActivityRecord,
    },
    /// Already applied; acknowledged so the provider stops retrying.
    Duplicate { payment_reference: String },
    /// Verified but intentionally not applied.
    Ignored(IgnoreReason),
}

impl CallbackOutcome {
    pub fn status_code(&self) -> u16 {
        200
    }

    pub fn label(&self) -> &'static str {
        match self {
            CallbackOutcome::Applied { .. } => "applied",
            CallbackOutcome::Duplicate { .. } => "duplicate",
            CallbackOutcome::Ignored(_) => "ignored",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IgnoreReason {
    #[error("body is not a callback envelope: {0}")]
    MalformedBody(String),
    #[error("event {0:?} does not complete a payment")]
    UnhandledEvent(String),
    #[error("callback has no payment reference")]
    MissingPaymentReference,
    #[error("purchase metadata rejected: {0}")]
    InvalidPurchase(#[from] PayloadError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthenticityError {
    #[error(transparent)]
    Signature(#[from] SignatureError),
    #[error("callback has no timestamp")]
    MissingTimestamp,
    #[error("callback timestamp is {skew_secs}s from now, window is {window_secs}s")]
    OutsideWindow { skew_secs: i64, window_secs: i64 },
}

/// A delivery that was not acknowledged.
#[derive(Debug, Error)]
pub enum CallbackError {
    #[error("callback rejected: {0}")]
    Authenticity(#[from] AuthenticityError),
    #[error("ledger storage failure: {0:#}")]
    Storage(anyhow::Error),
}

impl CallbackError {
    pub fn status_code(&self) -> u16 {
        match self {
            CallbackError::Authenticity(_) => 401,
            CallbackError::Storage(_) => 500,
        }
    }
}

/// Status to answer the provider with.
pub fn acknowledgement_status(result: &Result<CallbackOutcome, CallbackError>) -> u16 {
    match result {
        Ok(outcome) => outcome.status_code(),
        Err(e) => e.status_code(),
    }
}

pub struct CallbackProcessor {
    verifier: SignatureVerifier,
    acceptance_window: Duration,
    completed_event: String,
    ledger: Arc<GridLedger>,
    processed: Mutex<IdempotencyStore>,
    fanout: FanoutHandle,
    clock: Arc<dyn Clock>,
}

impl CallbackProcessor {
    /// Builds a processor and re-seeds `processed` from the ledger's recent
    /// activity, so references applied before a restart stay duplicates.
    pub fn new(
        webhook: &WebhookConfig,
        mut processed: IdempotencyStore,
        ledger: Arc<GridLedger>,
        fanout: FanoutHandle,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Self> {
        let now = clock.now();
        let recent = ledger
            .activity_since(now - processed.horizon())
            .context("Failed to read recent activity for idempotency seeding")?;
        let seeded = processed.seed_from(&recent, now);
        info!(
            "CallbackProcessor: seeded {} processed payment references",
            seeded
        );

        Ok(Self {
            verifier: SignatureVerifier::new(webhook.secret.as_bytes()),
            acceptance_window: Duration::seconds(webhook.acceptance_window_secs as i64),
            completed_event: webhook.completed_event.clone(),
            ledger,
            processed: Mutex::new(processed),
            fanout,
            clock,
        })
    }

    /// Processes one delivery.
    pub fn handle_delivery(
        &self,
        signature: Option<&str>,
        body: &[u8],
    ) -> Result<CallbackOutcome, CallbackError> {
        // 1. Verify.
        if let Err(e) = self.verifier.verify(body, signature) {
            warn!("CallbackProcessor: rejected delivery: {}", e);
            return Err(AuthenticityError::from(e).into());
        }

        let envelope = match CallbackEnvelope::parse(body) {
            Ok(envelope) => envelope,
            Err(e) => return Ok(ignored(IgnoreReason::MalformedBody(e.to_string()))),
        };
        self.check_timestamp(&envelope)?;
        trace!(
            "CallbackProcessor: verified {:?} event (nonce {:?})",
            envelope.event,
            envelope.nonce
        );

        if envelope.event != self.completed_event {
            return Ok(ignored(IgnoreReason::UnhandledEvent(envelope.event)));
        }
        let Some(reference) = envelope.payment_id.clone().filter(|r| !r.trim().is_empty()) else {
            return Ok(ignored(IgnoreReason::MissingPaymentReference));
        };

        // 2. Deduplicate (fast path; re-checked under the apply lock).
        if self.lock_processed()?.contains(&reference) {
            return Ok(duplicate(reference));
        }

        // 3. Classify.
        let purchase = match PurchaseEvent::from_envelope(&envelope) {
            Ok(purchase) => purchase,
            Err(e) => return Ok(ignored(IgnoreReason::InvalidPurchase(e))),
        };
        if let (PurchaseEvent::Bulk { .. }, Some(amount)) = (&purchase, envelope.amount) {
            if amount != purchase.quoted_total() {
                warn!(
                    "CallbackProcessor: payment {} paid {} but cells were quoted {}; applying quoted prices",
                    reference,
                    amount,
                    purchase.quoted_total()
                );
            }
        }

        // 4 + 5. Apply and publish.
        self.apply(reference, &envelope, purchase)
    }

    fn check_timestamp(&self, envelope: &CallbackEnvelope) -> Result<(), AuthenticityError> {
        let timestamp = envelope
            .timestamp
            .ok_or(AuthenticityError::MissingTimestamp)?;
        let skew_secs = self.clock.now().timestamp().saturating_sub(timestamp);
        let window_secs = self.acceptance_window.num_seconds();
        if skew_secs.unsigned_abs() > window_secs.unsigned_abs() {
            warn!(
                "CallbackProcessor: rejected delivery with timestamp {} ({}s skew)",
                timestamp, skew_secs
            );
            return Err(AuthenticityError::OutsideWindow {
                skew_secs,
                window_secs,
            });
        }
        Ok(())
    }

    fn apply(
        &self,
        reference: String,
        envelope: &CallbackEnvelope,
        purchase: PurchaseEvent,
    ) -> Result<CallbackOutcome, CallbackError> {
        let mut processed = self.lock_processed()?;
        if processed.contains(&reference) {
            return Ok(duplicate(reference));
        }

        let kind = purchase.kind();
        let amount_paid = envelope.amount.unwrap_or_else(|| purchase.quoted_total());
        let (cells, color, letter, letters) = match purchase {
            PurchaseEvent::Single(cell) => {
                let (color, letter) = (cell.color.clone(), cell.letter);
                (vec![cell], color, letter, None)
            }
            PurchaseEvent::Bulk {
                color,
                letters,
                cells,
                ..
            } => (cells, color, None, letters),
        };
        let activity = NewActivity {
            kind,
            color,
            letter,
            letters,
            amount_paid,
            payment_reference: reference.clone(),
            event_reference: envelope.event_id.clone(),
        };

        let applied = match self.ledger.apply_purchase(cells, activity) {
            Ok(applied) => applied,
            Err(LedgerError::Validation(e)) => {
                return Ok(ignored(IgnoreReason::InvalidPurchase(e.into())));
            }
            Err(LedgerError::Storage(e)) => {
                error!(
                    "CallbackProcessor: payment {} not applied, provider will retry: {:#}",
                    reference, e
                );
                return Err(CallbackError::Storage(e));
            }
        };

        let callback_at = envelope
            .timestamp
            .and_then(|secs| DateTime::from_timestamp(secs, 0));
        processed.insert(&reference, self.clock.now(), callback_at);

        let mut batch: Vec<FanoutEvent> = applied
            .pixels
            .iter()
            .cloned()
            .map(FanoutEvent::PixelUpdated)
            .collect();
        batch.push(FanoutEvent::ActivityAppended(applied.activity.clone()));
        self.fanout.publish(batch);
        drop(processed);

        info!(
            "CallbackProcessor: applied payment {} ({:?}, {} cells, revision {})",
            reference,
            kind,
            applied.pixels.len(),
            applied.activity.id
        );
        Ok(CallbackOutcome::Applied {
            payment_reference: reference,
            pixels: applied.pixels,
            activity: applied.activity,
        })
    }

    fn lock_processed(&self) -> Result<MutexGuard<'_, IdempotencyStore>, CallbackError> {
        self.processed
            .lock()
            .map_err(|_| CallbackError::Storage(anyhow!("idempotency store lock poisoned")))
    }

    /// Number of references currently remembered.
    pub fn processed_count(&self) -> usize {
        self.processed.lock().map(|p| p.len()).unwrap_or(0)
    }
}

fn ignored(reason: IgnoreReason) -> CallbackOutcome {
    warn!("CallbackProcessor: acknowledged without applying: {}", reason);
    CallbackOutcome::Ignored(reason)
}

fn duplicate(reference: String) -> CallbackOutcome {
    info!(
        "CallbackProcessor: payment {} already applied, acknowledging",
        reference
    );
    CallbackOutcome::Duplicate {
        payment_reference: reference,
    }
}
