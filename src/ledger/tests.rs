// src/ledger/tests.rs

use super::*;
use crate::clock::ManualClock;
use std::sync::atomic::{AtomicBool, Ordering};
use test_log::test;

/// Store that can be told to refuse commits.
struct FlakyStore {
    inner: MemoryStore,
    failing: Arc<AtomicBool>,
}

impl LedgerStore for FlakyStore {
    fn load(&self) -> Result<LedgerSnapshot> {
        self.inner.load()
    }

    fn commit(&self, commit: &Commit) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("simulated disk full");
        }
        self.inner.commit(commit)
    }
}

fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::at_epoch_secs(1_700_000_000))
}

fn update(x: i64, y: i64, color: &str, price: u64) -> CellUpdate {
    CellUpdate {
        coord: Coord::new(x, y),
        color: Some(PixelColor::parse(color).unwrap()),
        letter: None,
        price,
    }
}

fn purchase(reference: &str, kind: ActivityKind, amount: u64) -> NewActivity {
    NewActivity {
        kind,
        color: Some(PixelColor::parse("#ff0000").unwrap()),
        letter: None,
        letters: None,
        amount_paid: amount,
        payment_reference: reference.to_string(),
        event_reference: None,
    }
}

fn temp_journal_path() -> std::path::PathBuf {
    std::env::temp_dir().join(format!("pixel-ledger-test-{}.journal", uuid::Uuid::new_v4()))
}

#[test]
fn upsert_replaces_the_row_instead_of_appending() -> Result<()> {
    let clock = clock();
    let ledger = GridLedger::in_memory(clock.clone())?;

    let first = ledger.upsert(update(5, 5, "#ff0000", 10))?;
    clock.advance(chrono::Duration::seconds(60));
    let second = ledger.upsert(update(5, 5, "#00ff00", 20))?;

    assert_eq!(ledger.cell_count()?, 1);
    assert_eq!(second.created_at, first.created_at);
    assert!(second.updated_at > first.updated_at);
    assert!(second.revision > first.revision);

    let stored = ledger.get_by_coordinate(Coord::new(5, 5))?.unwrap();
    assert_eq!(stored.color.unwrap().as_str(), "#00ff00");
    assert_eq!(stored.last_paid_amount, 20);
    Ok(())
}

#[test]
fn rectangle_query_is_inclusive_and_row_major() -> Result<()> {
    let ledger = GridLedger::in_memory(clock())?;
    ledger.upsert_batch(vec![
        update(2, 1, "#111", 1),
        update(0, 0, "#222", 1),
        update(-1, 1, "#333", 1),
        update(3, 3, "#444", 1),
        update(2, 0, "#555", 1),
    ])?;

    let coords: Vec<Coord> = ledger
        .get_in_rectangle(Rect::new(-1, 0, 2, 1))?
        .iter()
        .map(Pixel::coord)
        .collect();
    assert_eq!(
        coords,
        vec![
            Coord::new(0, 0),
            Coord::new(2, 0),
            Coord::new(-1, 1),
            Coord::new(2, 1)
        ]
    );
    assert!(ledger.get_in_rectangle(Rect::new(10, 10, 20, 20))?.is_empty());
    Ok(())
}

#[test]
fn batch_shares_one_revision() -> Result<()> {
    let ledger = GridLedger::in_memory(clock())?;
    let pixels = ledger.upsert_batch(vec![update(0, 0, "#fff", 10), update(1, 0, "#fff", 10)])?;
    assert_eq!(pixels.len(), 2);
    assert!(pixels.iter().all(|p| p.revision == 1));
    assert_eq!(ledger.revision()?, 1);
    Ok(())
}

#[test]
fn batch_with_repeated_coordinate_is_rejected() -> Result<()> {
    let ledger = GridLedger::in_memory(clock())?;
    let result = ledger.upsert_batch(vec![update(0, 0, "#fff", 10), update(0, 0, "#000", 10)]);
    assert!(matches!(
        result,
        Err(LedgerError::Validation(ValidationError::DuplicateCoordinate(_)))
    ));
    assert_eq!(ledger.cell_count()?, 0);
    Ok(())
}

#[test]
fn zero_price_and_empty_batches_are_rejected() -> Result<()> {
    let ledger = GridLedger::in_memory(clock())?;
    assert!(matches!(
        ledger.upsert(update(0, 0, "#fff", 0)),
        Err(LedgerError::Validation(ValidationError::NonPositivePrice(_)))
    ));
    assert!(matches!(
        ledger.upsert_batch(Vec::new()),
        Err(LedgerError::Validation(ValidationError::EmptyPurchase))
    ));
    Ok(())
}

#[test]
fn storage_failure_leaves_the_ledger_untouched() -> Result<()> {
    let failing = Arc::new(AtomicBool::new(false));
    let store = FlakyStore {
        inner: MemoryStore::new(),
        failing: failing.clone(),
    };
    let ledger = GridLedger::open(Box::new(store), clock())?;
    ledger.apply_purchase(vec![update(0, 0, "#fff", 10)], purchase("pay-1", ActivityKind::Single, 10))?;

    failing.store(true, Ordering::SeqCst);
    let result = ledger.apply_purchase(
        vec![update(0, 0, "#000", 20), update(1, 0, "#000", 10), update(2, 0, "#000", 10)],
        purchase("pay-2", ActivityKind::Bulk, 40),
    );
    assert!(matches!(result, Err(LedgerError::Storage(_))));

    assert_eq!(ledger.cell_count()?, 1);
    assert_eq!(ledger.activity_count()?, 1);
    assert_eq!(ledger.revision()?, 1);
    let untouched = ledger.get_by_coordinate(Coord::new(0, 0))?.unwrap();
    assert_eq!(untouched.color.unwrap().as_str(), "#fff");
    assert_eq!(untouched.last_paid_amount, 10);

    failing.store(false, Ordering::SeqCst);
    let applied = ledger.apply_purchase(
        vec![update(1, 0, "#000", 10)],
        purchase("pay-2", ActivityKind::Bulk, 10),
    )?;
    assert_eq!(applied.activity.id, 2);
    Ok(())
}

#[test]
fn purchase_records_activity_newest_first() -> Result<()> {
    let clock = clock();
    let ledger = GridLedger::in_memory(clock.clone())?;
    for (i, reference) in ["a", "b", "c"].iter().enumerate() {
        ledger.apply_purchase(
            vec![update(i as i64, 0, "#abc", 10)],
            purchase(reference, ActivityKind::Single, 10),
        )?;
        clock.advance(chrono::Duration::seconds(1));
    }

    let recent = ledger.recent_activity(2)?;
    let references: Vec<&str> = recent.iter().map(|r| r.payment_reference.as_str()).collect();
    assert_eq!(references, vec!["c", "b"]);
    assert_eq!(recent[0].cells, vec![Coord::new(2, 0)]);
    assert!(recent[0].created_at > recent[1].created_at);
    Ok(())
}

#[test]
fn timestamps_never_run_backwards() -> Result<()> {
    let clock = clock();
    let ledger = GridLedger::in_memory(clock.clone())?;
    let first = ledger.apply_purchase(vec![update(0, 0, "#abc", 10)], purchase("a", ActivityKind::Single, 10))?;
    clock.advance(chrono::Duration::seconds(-120));
    let second = ledger.apply_purchase(vec![update(1, 0, "#abc", 10)], purchase("b", ActivityKind::Single, 10))?;
    assert!(second.activity.created_at >= first.activity.created_at);
    Ok(())
}

#[test]
fn activity_since_returns_the_tail() -> Result<()> {
    let clock = clock();
    let ledger = GridLedger::in_memory(clock.clone())?;
    ledger.apply_purchase(vec![update(0, 0, "#abc", 10)], purchase("old", ActivityKind::Single, 10))?;
    clock.advance(chrono::Duration::hours(2));
    let cutoff = clock.now() - chrono::Duration::minutes(5);
    ledger.apply_purchase(vec![update(1, 0, "#abc", 10)], purchase("new", ActivityKind::Single, 10))?;

    let tail = ledger.activity_since(cutoff)?;
    assert_eq!(tail.len(), 1);
    assert_eq!(tail[0].payment_reference, "new");
    Ok(())
}

#[test]
fn journal_survives_reopen() -> Result<()> {
    let path = temp_journal_path();
    {
        let ledger = GridLedger::open(Box::new(JournalStore::open(&path)?), clock())?;
        ledger.apply_purchase(
            vec![update(0, 0, "#f00", 10), update(1, 0, "#f00", 10)],
            purchase("bulk-1", ActivityKind::Bulk, 20),
        )?;
        ledger.apply_purchase(vec![update(0, 0, "#0f0", 20)], purchase("single-1", ActivityKind::Single, 20))?;
    }

    let reopened = GridLedger::open(Box::new(JournalStore::open(&path)?), clock())?;
    assert_eq!(reopened.cell_count()?, 2);
    assert_eq!(reopened.activity_count()?, 2);
    assert_eq!(reopened.revision()?, 2);
    let cell = reopened.get_by_coordinate(Coord::new(0, 0))?.unwrap();
    assert_eq!(cell.last_paid_amount, 20);
    assert_eq!(cell.color.unwrap().as_str(), "#0f0");

    let next = reopened.upsert(update(9, 9, "#00f", 10))?;
    assert_eq!(next.revision, 3);

    std::fs::remove_file(&path)?;
    Ok(())
}

#[test]
fn journal_drops_a_torn_final_line() -> Result<()> {
    let path = temp_journal_path();
    {
        let ledger = GridLedger::open(Box::new(JournalStore::open(&path)?), clock())?;
        ledger.apply_purchase(vec![update(0, 0, "#f00", 10)], purchase("p1", ActivityKind::Single, 10))?;
    }
    {
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new().append(true).open(&path)?;
        file.write_all(br#"{"revision":2,"pixels":[{"x":1"#)?;
    }

    let reopened = GridLedger::open(Box::new(JournalStore::open(&path)?), clock())?;
    assert_eq!(reopened.revision()?, 1);
    assert_eq!(reopened.cell_count()?, 1);

    // The torn bytes were truncated, so new commits land on a clean line.
    reopened.upsert(update(1, 0, "#f00", 10))?;
    let again = GridLedger::open(Box::new(JournalStore::open(&path)?), clock())?;
    assert_eq!(again.revision()?, 2);

    std::fs::remove_file(&path)?;
    Ok(())
}

#[test]
fn journal_rejects_corruption_before_the_end() -> Result<()> {
    let path = temp_journal_path();
    std::fs::write(&path, "not json\n{\"revision\":1,\"pixels\":[]}\n")?;
    assert!(JournalStore::open(&path)?.load().is_err());
    std::fs::remove_file(&path)?;
    Ok(())
}
