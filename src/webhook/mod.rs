// src/webhook/mod.rs

//! Inbound payment-provider callbacks: signature verification and typed
//! payload parsing. Nothing here touches ledger state.

pub mod payload;
pub mod signature;

pub use payload::{
    BulkMetadata, CallbackEnvelope, PayloadError, PixelUpdateMetadata, PurchaseEvent,
    SingleMetadata,
};
pub use signature::{SignatureError, SignatureVerifier};
