// src/invoice.rs

//! Seam to the external payment provider.
//!
//! The provider turns an amount plus opaque metadata into a payment handle and
//! later reports completion through the signed callback, echoing the metadata
//! back. `OfflineInvoiceProvider` mints local references for demos and tests.

use crate::clock::Clock;
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvoiceRequest {
    pub amount: u64,
    pub memo: String,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invoice {
    /// The provider's payment id; echoed as `payment_id` in the callback.
    pub payment_reference: String,
    /// Something a wallet can render or scan.
    pub payment_target: String,
    pub expires_at: DateTime<Utc>,
}

pub trait InvoiceProvider: Send + Sync {
    fn create_invoice(&self, request: &InvoiceRequest) -> Result<Invoice>;
}

/// Issues references locally without contacting any provider.
pub struct OfflineInvoiceProvider {
    clock: Arc<dyn Clock>,
    expiry: Duration,
}

impl OfflineInvoiceProvider {
    pub fn new(clock: Arc<dyn Clock>, expiry: Duration) -> Self {
        Self { clock, expiry }
    }
}

impl InvoiceProvider for OfflineInvoiceProvider {
    fn create_invoice(&self, request: &InvoiceRequest) -> Result<Invoice> {
        let reference = Uuid::new_v4().simple().to_string();
        Ok(Invoice {
            payment_target: format!("offline:{}?amount={}", reference, request.amount),
            payment_reference: reference,
            expires_at: self.clock.now() + self.expiry,
        })
    }
}
