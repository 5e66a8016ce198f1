//! Pixel-ledger library crate.
//!
//! Server side: pricing, the authoritative grid ledger, the payment callback
//! processor and the fanout channel. Client side: the viewport tile cache and
//! the optimistic edit buffer, driven by a single-writer sync actor.

pub mod client;
pub mod clock;
pub mod config;
pub mod fanout;
pub mod idempotency;
pub mod invoice;
pub mod ledger;
pub mod pixel;
pub mod pricing;
pub mod processor;
pub mod service;
pub mod webhook;
