use crate::client::Transport;
use crate::coordinator::Shared;
use crate::models::device::{Channel, FieldKey, Fields, Snapshot, Value};
use crate::services::assemble::{self, CycleError};
use crate::services::rate::RateTracker;
use crate::shutdown::Shutdown;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use std::time::{Duration, Instant};

/// Fetch, normalize and derive one main snapshot.
pub fn main_cycle(
    transport: &dyn Transport,
    tracker: &mut RateTracker,
    shutdown: &Shutdown,
) -> Result<Snapshot, CycleError> {
    let reading = assemble::fetch_main(transport, shutdown)?;
    let snapshot = with_rate(reading.fields, tracker, Utc::now());
    debug!(
        "Poll: main cycle via {:?} produced {} field(s)",
        reading.strategy,
        snapshot.len()
    );
    Ok(snapshot)
}

/// Feed the reading's volume to `tracker` and add the derived rate, if any.
fn with_rate(mut fields: Fields, tracker: &mut RateTracker, captured_at: DateTime<Utc>) -> Snapshot {
    let volume = fields.get(&FieldKey::Volume).and_then(Value::as_f64);
    if let Some(rate) = tracker.update(captured_at, volume) {
        fields.insert(FieldKey::VolumePerHour, Value::Number(rate));
    }
    Snapshot::new(captured_at, fields)
}

pub fn pressure_cycle(transport: &dyn Transport, shutdown: &Shutdown) -> Result<Snapshot, CycleError> {
    let reading = assemble::fetch_pressure(transport, shutdown)?;
    Ok(Snapshot::new(Utc::now(), reading.fields))
}

/// Run `cycle` every `interval` until shutdown, publishing into `shared`.
///
/// The first cycle runs one interval after the call; bootstrap already
/// produced the initial snapshot.
pub fn run_loop<F>(channel: Channel, interval: Duration, shared: &Shared, mut cycle: F)
where
    F: FnMut(&Shutdown) -> Result<Snapshot, CycleError>,
{
    let shutdown = shared.shutdown().clone();
    let mut tick_start = Instant::now();

    loop {
        // Maintain steady cadence
        if shutdown.wait(interval.saturating_sub(tick_start.elapsed())) {
            break;
        }
        tick_start = Instant::now();

        match cycle(&shutdown) {
            Ok(snapshot) => {
                let fields = snapshot.len();
                if !shared.publish(channel, snapshot) {
                    break;
                }
                debug!(
                    "Poll: {} snapshot published ({} field(s), {}ms)",
                    channel,
                    fields,
                    tick_start.elapsed().as_millis()
                );
            }
            Err(CycleError::Cancelled) => break,
            Err(e) => {
                warn!("Poll: {} cycle failed; serving previous snapshot: {}", channel, e);
                if !shared.record_failure(channel, e) {
                    break;
                }
            }
        }
    }

    debug!("Poll: {} loop stopped", channel);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{BATCH_PATH, TransportError};
    use crate::coordinator::Event;
    use crate::testing::{FakeTransport, batch_fixture};
    use chrono::TimeZone;
    use serde_json::json;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn main_cycle_merges_rate_into_snapshot() {
        let transport = FakeTransport::new().with(BATCH_PATH, Ok(batch_fixture()));
        let mut tracker = RateTracker::new();

        let first = main_cycle(&transport, &mut tracker, &Shutdown::new()).unwrap();
        assert_eq!(first.number(FieldKey::VolumePerHour), Some(0.0));
        assert_eq!(first.number(FieldKey::Volume), Some(123456.0));
    }

    #[test]
    fn rate_follows_volume_within_the_hour() {
        let at = |m| Utc.with_ymd_and_hms(2024, 3, 10, 8, m, 0).unwrap();
        let volume = |v: f64| Fields::from([(FieldKey::Volume, Value::Number(v))]);
        let mut tracker = RateTracker::new();

        let first = with_rate(volume(123456.0), &mut tracker, at(5));
        assert_eq!(first.number(FieldKey::VolumePerHour), Some(0.0));
        assert_eq!(first.captured_at, at(5));

        let second = with_rate(volume(123458.5), &mut tracker, at(20));
        assert_eq!(second.number(FieldKey::VolumePerHour), Some(2.5));

        let reset = with_rate(volume(10.0), &mut tracker, at(40));
        assert_eq!(reset.get(FieldKey::VolumePerHour), None);
        assert_eq!(reset.number(FieldKey::Volume), Some(10.0));
    }

    #[test]
    fn main_cycle_without_volume_has_no_rate() {
        let transport = FakeTransport::new().with(BATCH_PATH, Ok(json!({"getCEL": "200"})));
        let mut tracker = RateTracker::new();
        let snapshot = main_cycle(&transport, &mut tracker, &Shutdown::new()).unwrap();
        assert_eq!(snapshot.get(FieldKey::VolumePerHour), None);
        assert_eq!(snapshot.number(FieldKey::Temperature), Some(20.0));
    }

    #[test]
    fn loop_records_failures_and_exits_on_shutdown() {
        let shared = Arc::new(Shared::new(Shutdown::new()));
        let events = shared.subscribe();

        let worker = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || {
                run_loop(Channel::Pressure, Duration::from_millis(5), &shared, |_| {
                    Err(CycleError::Transport(TransportError::Timeout { url: "get/bar".into() }))
                })
            })
        };

        let event = events.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(event, Event::Failed { channel: Channel::Pressure, .. }));

        shared.shutdown().trigger();
        worker.join().unwrap();
    }

    #[test]
    fn loop_with_out_of_range_interval_still_stops() {
        let shared = Arc::new(Shared::new(Shutdown::new()));
        let worker = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || {
                run_loop(Channel::Main, Duration::MAX, &shared, |_| {
                    panic!("cycle must not run before the interval elapses")
                })
            })
        };

        thread::sleep(Duration::from_millis(20));
        shared.shutdown().trigger();
        worker.join().unwrap();
    }
}
