// src/main.rs

//! `pixel-ledger` binary.
//!
//! Usage:
//!   pixel-ledger [serve]                  apply forwarded deliveries from stdin
//!   pixel-ledger quote X Y [COLOR] [LETTER]
//!   pixel-ledger sign                     print the signature of the body on stdin
//!
//! `serve` reads one JSON delivery per line, `{"headers": {...}, "body":
//! "<raw callback body>"}`, as forwarded by the HTTP edge, and answers each
//! with one line `{"status": <code>, "outcome": "...", "detail": "..."}`. The
//! signature is taken from the header named by `webhook.signature_header`, or
//! from a top-level `"signature"` field.

use anyhow::{bail, Context};
use log::{error, info, warn};
use pixel_ledger::{
    clock::{Clock, SystemClock},
    config::{Config, CONFIG},
    fanout::FanoutChannel,
    idempotency::IdempotencyStore,
    invoice::OfflineInvoiceProvider,
    ledger::{GridLedger, JournalStore},
    pricing::PricingEngine,
    processor::{CallbackError, CallbackOutcome, CallbackProcessor},
    service::{PixelService, ServiceLimits},
    webhook::SignatureVerifier,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{self, BufRead, Read, Write};
use std::sync::Arc;
use std::thread;

#[derive(Debug, Deserialize)]
struct Delivery {
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    signature: Option<String>,
    body: String,
}

impl Delivery {
    /// Signature from `header` (matched case-insensitively), else the
    /// top-level field.
    fn signature(&self, header: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(header))
            .map(|(_, value)| value.as_str())
            .or(self.signature.as_deref())
    }
}

#[derive(Debug, Serialize)]
struct Reply {
    status: u16,
    outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

impl Reply {
    fn from_result(result: &Result<CallbackOutcome, CallbackError>) -> Self {
        match result {
            Ok(CallbackOutcome::Applied {
                payment_reference,
                pixels,
                ..
            }) => Reply {
                status: 200,
                outcome: "applied",
                detail: Some(format!("{} ({} cells)", payment_reference, pixels.len())),
            },
            Ok(outcome @ CallbackOutcome::Duplicate { payment_reference }) => Reply {
                status: outcome.status_code(),
                outcome: outcome.label(),
                detail: Some(payment_reference.clone()),
            },
            Ok(outcome @ CallbackOutcome::Ignored(reason)) => Reply {
                status: outcome.status_code(),
                outcome: outcome.label(),
                detail: Some(reason.to_string()),
            },
            Err(e) => Reply {
                status: e.status_code(),
                outcome: match e {
                    CallbackError::Authenticity(_) => "rejected",
                    CallbackError::Storage(_) => "failed",
                },
                detail: Some(e.to_string()),
            },
        }
    }
}

fn open_ledger(config: &Config, clock: Arc<dyn Clock>) -> anyhow::Result<Arc<GridLedger>> {
    let ledger = match &config.ledger.journal_path {
        Some(path) => {
            let store = JournalStore::open(path)
                .with_context(|| format!("Failed to open journal {}", path.display()))?;
            GridLedger::open(Box::new(store), clock)?
        }
        None => {
            warn!("No journal configured; ledger state will not survive a restart.");
            GridLedger::in_memory(clock)?
        }
    };
    Ok(Arc::new(ledger))
}

fn serve(config: &Config) -> anyhow::Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let ledger = open_ledger(config, clock.clone())?;

    let fanout = FanoutChannel::spawn(config.fanout.session_queue_capacity)?;
    let viewer = fanout.handle().subscribe()?;
    let viewer_thread = thread::Builder::new()
        .name("fanout-log".to_string())
        .spawn(move || {
            while let Some(event) = viewer.recv() {
                match serde_json::to_string(&event) {
                    Ok(line) => info!("Viewer {}: {}", viewer.id(), line),
                    Err(e) => warn!("Viewer {}: unencodable event: {}", viewer.id(), e),
                }
            }
        })
        .context("Failed to spawn fanout log thread")?;

    let processed = IdempotencyStore::from_config(&config.idempotency, &config.webhook);
    let processor = CallbackProcessor::new(
        &config.webhook,
        processed,
        ledger.clone(),
        fanout.handle(),
        clock,
    )?;

    info!("Reading deliveries from stdin...");
    let stdin = io::stdin();
    let mut stdout = io::stdout().lock();
    let mut handled = 0usize;
    for line in stdin.lock().lines() {
        let line = line.context("Failed to read delivery from stdin")?;
        if line.trim().is_empty() {
            continue;
        }
        let reply = match serde_json::from_str::<Delivery>(&line) {
            Ok(delivery) => {
                let signature = delivery.signature(&config.webhook.signature_header);
                let result = processor.handle_delivery(signature, delivery.body.as_bytes());
                if let Err(CallbackError::Storage(e)) = &result {
                    error!("Delivery failed on storage: {:#}", e);
                }
                Reply::from_result(&result)
            }
            Err(e) => Reply {
                status: 400,
                outcome: "unreadable",
                detail: Some(e.to_string()),
            },
        };
        serde_json::to_writer(&mut stdout, &reply).context("Failed to write reply")?;
        writeln!(stdout).context("Failed to write reply")?;
        stdout.flush().context("Failed to flush stdout")?;
        handled += 1;
    }

    info!(
        "Input closed after {} deliveries; ledger at revision {} with {} cells.",
        handled,
        ledger.revision()?,
        ledger.cell_count()?
    );
    fanout.shutdown()?;
    if viewer_thread.join().is_err() {
        error!("Fanout log thread panicked.");
    }
    Ok(())
}

fn quote(config: &Config, args: &[String]) -> anyhow::Result<()> {
    let (x, y) = match args {
        [x, y, ..] => (
            x.parse::<i64>().context("X must be an integer")?,
            y.parse::<i64>().context("Y must be an integer")?,
        ),
        _ => bail!("usage: pixel-ledger quote X Y [COLOR] [LETTER]"),
    };
    let color = args.get(2).map(String::as_str);
    let letter = args.get(3).map(String::as_str);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let ledger = open_ledger(config, clock.clone())?;
    let provider = Arc::new(OfflineInvoiceProvider::new(clock, chrono::Duration::minutes(15)));
    let service = PixelService::new(
        ledger,
        PricingEngine::new(&config.pricing),
        provider,
        ServiceLimits::from(&config.ledger),
    );

    let handle = service.quote_single(x, y, color, letter)?;
    println!(
        "{}",
        serde_json::to_string_pretty(&handle).context("Failed to encode quote")?
    );
    Ok(())
}

fn sign(config: &Config) -> anyhow::Result<()> {
    let mut body = Vec::new();
    io::stdin()
        .read_to_end(&mut body)
        .context("Failed to read body from stdin")?;
    let signature = SignatureVerifier::new(config.webhook.secret.as_bytes()).sign(&body)?;
    println!("{}", signature);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_micros()
        .init();

    info!("Starting pixel-ledger...");

    let config: &Config = &CONFIG;
    config.validate().context("Invalid configuration")?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    let result = match args.first().map(String::as_str) {
        None | Some("serve") => serve(config),
        Some("quote") => quote(config, &args[1..]),
        Some("sign") => sign(config),
        Some(other) => Err(anyhow::anyhow!(
            "unknown command {:?}; expected serve, quote or sign",
            other
        )),
    };

    if let Err(e) = &result {
        error!("pixel-ledger exited with error: {:#}", e);
    }
    info!("pixel-ledger finished.");
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_signature_prefers_the_configured_header() {
        let delivery: Delivery = serde_json::from_str(
            r#"{"headers": {"X-Payment-Signature": "abc"}, "signature": "zzz", "body": "{}"}"#,
        )
        .unwrap();
        assert_eq!(delivery.signature("x-payment-signature"), Some("abc"));
        assert_eq!(delivery.signature("x-other"), Some("zzz"));

        let bare: Delivery = serde_json::from_str(r#"{"body": "{}"}"#).unwrap();
        assert_eq!(bare.signature("x-payment-signature"), None);
    }
}
