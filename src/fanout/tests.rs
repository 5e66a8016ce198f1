// src/fanout/tests.rs

use super::*;
use crate::pixel::{ActivityKind, Coord};
use chrono::DateTime;
use test_log::test;

const WAIT: Duration = Duration::from_secs(2);

fn pixel(x: i64, revision: u64) -> Pixel {
    let at = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
    Pixel {
        x,
        y: 0,
        color: None,
        letter: None,
        last_paid_amount: 1,
        created_at: at,
        updated_at: at,
        revision,
    }
}

fn activity(reference: &str) -> ActivityRecord {
    ActivityRecord {
        id: 1,
        kind: ActivityKind::Single,
        cells: vec![Coord::new(0, 0)],
        color: None,
        letter: None,
        letters: None,
        amount_paid: 1,
        created_at: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        payment_reference: reference.to_string(),
        event_reference: None,
    }
}

#[test]
fn every_connected_session_receives_the_batch_in_order() -> Result<()> {
    let channel = FanoutChannel::spawn(16)?;
    let handle = channel.handle();
    let a = handle.subscribe()?;
    let b = handle.subscribe()?;

    handle.publish(vec![
        FanoutEvent::PixelUpdated(pixel(0, 1)),
        FanoutEvent::PixelUpdated(pixel(1, 1)),
        FanoutEvent::ActivityAppended(activity("pay-1")),
    ]);

    for session in [&a, &b] {
        assert_eq!(session.recv_timeout(WAIT)?, FanoutEvent::PixelUpdated(pixel(0, 1)));
        assert_eq!(session.recv_timeout(WAIT)?, FanoutEvent::PixelUpdated(pixel(1, 1)));
        assert_eq!(
            session.recv_timeout(WAIT)?,
            FanoutEvent::ActivityAppended(activity("pay-1"))
        );
    }
    channel.shutdown()
}

#[test]
fn late_subscribers_do_not_see_earlier_batches() -> Result<()> {
    let channel = FanoutChannel::spawn(16)?;
    let handle = channel.handle();
    let early = handle.subscribe()?;

    handle.publish(vec![FanoutEvent::PixelUpdated(pixel(0, 1))]);
    let late = handle.subscribe()?;
    handle.publish(vec![FanoutEvent::PixelUpdated(pixel(1, 2))]);

    assert_eq!(early.recv_timeout(WAIT)?, FanoutEvent::PixelUpdated(pixel(0, 1)));
    assert_eq!(early.recv_timeout(WAIT)?, FanoutEvent::PixelUpdated(pixel(1, 2)));
    assert_eq!(late.recv_timeout(WAIT)?, FanoutEvent::PixelUpdated(pixel(1, 2)));
    assert!(late.try_recv().is_err());
    channel.shutdown()
}

#[test]
fn slow_session_is_dropped_without_blocking_others() -> Result<()> {
    let channel = FanoutChannel::spawn(2)?;
    let handle = channel.handle();
    let slow = handle.subscribe()?;
    let fast = handle.subscribe()?;

    for revision in 1..=3 {
        handle.publish(vec![FanoutEvent::PixelUpdated(pixel(0, revision))]);
        assert_eq!(
            fast.recv_timeout(WAIT)?,
            FanoutEvent::PixelUpdated(pixel(0, revision))
        );
    }

    // The slow session got the first two events, then was disconnected.
    assert!(slow.recv_timeout(WAIT).is_ok());
    assert!(slow.recv_timeout(WAIT).is_ok());
    assert_eq!(
        slow.recv_timeout(WAIT),
        Err(RecvTimeoutError::Disconnected)
    );

    let stats = handle.stats()?;
    assert_eq!(stats.sessions, 1);
    assert_eq!(stats.dropped_sessions, 1);
    assert_eq!(stats.published_batches, 3);
    channel.shutdown()
}

#[test]
fn dropping_a_session_unsubscribes_it() -> Result<()> {
    let channel = FanoutChannel::spawn(4)?;
    let handle = channel.handle();
    let session = handle.subscribe()?;
    assert_eq!(handle.stats()?.sessions, 1);
    drop(session);
    assert_eq!(handle.stats()?.sessions, 0);
    channel.shutdown()
}

#[test]
fn publishing_after_shutdown_does_not_panic() -> Result<()> {
    let channel = FanoutChannel::spawn(4)?;
    let handle = channel.handle();
    channel.shutdown()?;
    handle.publish(vec![FanoutEvent::PixelUpdated(pixel(0, 1))]);
    assert!(handle.subscribe().is_err());
    Ok(())
}

#[test]
fn events_serialize_with_type_tags() {
    let json = serde_json::to_value(FanoutEvent::PixelUpdated(pixel(3, 7))).unwrap();
    assert_eq!(json["type"], "pixel-update");
    assert_eq!(json["payload"]["x"], 3);
    assert_eq!(json["payload"]["revision"], 7);

    let json = serde_json::to_value(FanoutEvent::ActivityAppended(activity("p"))).unwrap();
    assert_eq!(json["type"], "activity");
    assert_eq!(json["payload"]["paymentReference"], "p");
}
