// src/service/tests.rs

use super::*;
use crate::clock::ManualClock;
use crate::invoice::{Invoice, OfflineInvoiceProvider};
use crate::ledger::NewActivity;
use crate::pixel::{ActivityKind, CellUpdate, PixelColor};
use crate::webhook::{CallbackEnvelope, PurchaseEvent};
use anyhow::Result;
use serde_json::json;
use test_log::test;

struct DownProvider;

impl InvoiceProvider for DownProvider {
    fn create_invoice(&self, _request: &InvoiceRequest) -> Result<Invoice> {
        anyhow::bail!("provider unreachable")
    }
}

fn service_with(provider: Arc<dyn InvoiceProvider>, limits: ServiceLimits) -> Result<PixelService> {
    let clock = Arc::new(ManualClock::at_epoch_secs(1_700_000_000));
    let ledger = Arc::new(GridLedger::in_memory(clock)?);
    Ok(PixelService::new(ledger, PricingEngine::default(), provider, limits))
}

fn service() -> Result<PixelService> {
    let clock = Arc::new(ManualClock::at_epoch_secs(1_700_000_000));
    let provider = Arc::new(OfflineInvoiceProvider::new(clock, chrono::Duration::minutes(15)));
    service_with(provider, ServiceLimits::default())
}

fn buy(service: &PixelService, reference: &str, x: i64, y: i64, price: u64) -> Result<()> {
    service.ledger.apply_purchase(
        vec![CellUpdate {
            coord: Coord::new(x, y),
            color: Some(PixelColor::parse("#ff0000")?),
            letter: None,
            price,
        }],
        NewActivity {
            kind: ActivityKind::Single,
            color: Some(PixelColor::parse("#ff0000")?),
            letter: None,
            letters: None,
            amount_paid: price,
            payment_reference: reference.to_string(),
            event_reference: None,
        },
    )?;
    Ok(())
}

#[test]
fn single_quote_prices_by_tier_then_doubles() -> Result<()> {
    let service = service()?;
    let quote = service.quote_single(5, 5, Some("#FF0000"), None)?;
    assert_eq!(quote.amount, 10);
    assert_eq!(quote.metadata, json!({"x": 5, "y": 5, "color": "#ff0000", "letter": null}));

    buy(&service, "pay-1", 5, 5, 10)?;
    let again = service.quote_single(5, 5, Some("#00ff00"), Some("Q"))?;
    assert_eq!(again.amount, 20);
    assert_ne!(again.payment_reference, quote.payment_reference);
    Ok(())
}

#[test]
fn single_quote_rejects_bad_attributes() -> Result<()> {
    let service = service()?;
    assert!(matches!(
        service.quote_single(0, 0, Some("blue"), None),
        Err(ServiceError::Validation(ValidationError::InvalidColor(_)))
    ));
    assert!(matches!(
        service.quote_single(0, 0, Some("#00f"), Some("ab")),
        Err(ServiceError::Validation(ValidationError::InvalidLetter(_)))
    ));
    Ok(())
}

#[test]
fn bulk_quote_prices_each_cell_and_assigns_letters_row_major() -> Result<()> {
    let service = service()?;
    buy(&service, "pay-1", 1, 0, 10)?;

    let quote = service.quote_bulk(Rect::new(0, 0, 1, 1), Some("#0000ff"), Some("HI"))?;
    // (0,0) letter 20, (1,0) resold 20, (0,1) color 10, (1,1) color 10.
    assert_eq!(quote.amount, 60);

    let updates = quote.metadata["pixelUpdates"].as_array().unwrap();
    assert_eq!(updates.len(), 4);
    assert_eq!(updates[0]["letter"], "H");
    assert_eq!(updates[1]["letter"], "I");
    assert_eq!(updates[1]["price"], 20);
    assert!(updates[2]["letter"].is_null());
    assert_eq!(quote.metadata["letters"], "HI");
    let priced: u64 = updates.iter().map(|u| u["price"].as_u64().unwrap()).sum();
    assert_eq!(priced, quote.amount);
    Ok(())
}

#[test]
fn bulk_quote_metadata_parses_back_into_the_same_purchase() -> Result<()> {
    let service = service()?;
    let quote = service.quote_bulk(Rect::new(0, 0, 1, 0), Some("#0f0"), None)?;
    assert_eq!(quote.amount, 20);

    let envelope: CallbackEnvelope = serde_json::from_value(json!({
        "event": "payment.completed",
        "payment_id": quote.payment_reference,
        "amount": quote.amount,
        "timestamp": 1_700_000_000,
        "metadata": quote.metadata,
    }))?;
    let event = PurchaseEvent::from_envelope(&envelope)?;
    assert_eq!(event.quoted_total(), quote.amount);
    assert_eq!(event.cells().len(), 2);
    Ok(())
}

#[test]
fn bulk_quote_enforces_size_and_letter_limits() -> Result<()> {
    let clock = Arc::new(ManualClock::at_epoch_secs(0));
    let provider = Arc::new(OfflineInvoiceProvider::new(clock, chrono::Duration::minutes(1)));
    let service = service_with(
        provider,
        ServiceLimits {
            max_bulk_cells: 4,
            ..ServiceLimits::default()
        },
    )?;

    assert!(matches!(
        service.quote_bulk(Rect::new(0, 0, 2, 1), None, None),
        Err(ServiceError::Validation(ValidationError::RectangleTooLarge { cells: 6, max: 4 }))
    ));
    assert!(matches!(
        service.quote_bulk(Rect::new(0, 0, 1, 0), None, Some("ABC")),
        Err(ServiceError::Validation(ValidationError::TooManyLetters { letters: 3, cells: 2 }))
    ));
    Ok(())
}

#[test]
fn provider_failures_surface_as_provider_errors() -> Result<()> {
    let service = service_with(Arc::new(DownProvider), ServiceLimits::default())?;
    assert!(matches!(
        service.quote_single(0, 0, None, None),
        Err(ServiceError::Provider(_))
    ));
    Ok(())
}

#[test]
fn region_queries_are_capped() -> Result<()> {
    let service = service()?;
    buy(&service, "pay-1", 3, 4, 10)?;

    let pixels = service.pixels_in_rect(Rect::new(0, 0, 9, 9))?;
    assert_eq!(pixels.len(), 1);
    assert!(matches!(
        service.pixels_in_rect(Rect::new(0, 0, 1_000, 1_000)),
        Err(ServiceError::Validation(ValidationError::RectangleTooLarge { .. }))
    ));
    assert_eq!(service.fetch_region(Rect::new(3, 4, 3, 4))?.len(), 1);
    Ok(())
}

#[test]
fn whole_plane_rectangles_are_rejected_not_scanned() -> Result<()> {
    let service = service()?;
    let plane = Rect::new(i64::MIN, i64::MIN, i64::MAX, i64::MAX);
    assert!(matches!(
        service.pixels_in_rect(plane),
        Err(ServiceError::Validation(ValidationError::RectangleTooLarge { .. }))
    ));
    assert!(matches!(
        service.quote_bulk(plane, Some("#fff"), None),
        Err(ServiceError::Validation(ValidationError::RectangleTooLarge { .. }))
    ));
    Ok(())
}

#[test]
fn activity_limit_defaults_and_clamps() -> Result<()> {
    let service = service()?;
    for i in 0..60 {
        buy(&service, &format!("pay-{i}"), i, 0, 1)?;
    }
    let default = service.recent_activity(None)?;
    assert_eq!(default.len(), 50);
    assert_eq!(default[0].payment_reference, "pay-59");
    assert_eq!(service.recent_activity(Some(5))?.len(), 5);
    assert_eq!(service.recent_activity(Some(10_000))?.len(), 60);
    Ok(())
}
