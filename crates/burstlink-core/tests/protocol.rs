use burstlink_core::config::DispatcherConfig;
use burstlink_core::protocol::packet::encode;
use burstlink_core::protocol::{
    decode_ack, transport_micros, AckResult, BaseCommand, Clock, CommandRequest, DeviceTiming,
    DispatchStatus, Dispatcher, ErrorKind, ManualClock, Packet, SlotPool, TargetSet, Transport,
};
use pretty_assertions::assert_eq;
use std::collections::VecDeque;
use std::io;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Simulated link latency for every scripted reply
const LINK_LATENCY: Duration = Duration::from_micros(1500);

enum Reply {
    Line(&'static str),
    /// Nothing arrives within the read
    Silence,
    /// Cancel the dispatch while this read is waiting
    CancelDuringRead(CancellationToken),
}

/// Spy transport: records writes and plays back scripted replies
struct SpyTransport {
    clock: ManualClock,
    replies: VecDeque<Reply>,
    writes: Vec<Vec<u8>>,
    flushes: usize,
    failing_writes: usize,
}

impl SpyTransport {
    fn new(clock: &ManualClock) -> Self {
        Self {
            clock: clock.clone(),
            replies: VecDeque::new(),
            writes: Vec::new(),
            flushes: 0,
            failing_writes: 0,
        }
    }

    fn with_replies(clock: &ManualClock, replies: Vec<Reply>) -> Self {
        let mut spy = Self::new(clock);
        spy.replies = replies.into();
        spy
    }

    fn lines(&self) -> Vec<String> {
        self.writes
            .iter()
            .map(|w| String::from_utf8_lossy(w).to_string())
            .collect()
    }
}

impl Transport for SpyTransport {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.writes.push(data.to_vec());
        if self.failing_writes > 0 {
            self.failing_writes -= 1;
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device disconnected"));
        }
        Ok(data.len())
    }

    fn read_until(&mut self, _delimiter: u8, timeout: Duration) -> io::Result<Option<Vec<u8>>> {
        match self.replies.pop_front() {
            Some(Reply::Line(line)) => {
                self.clock.advance(LINK_LATENCY);
                Ok(Some(line.as_bytes().to_vec()))
            }
            Some(Reply::CancelDuringRead(token)) => {
                token.cancel();
                self.clock.advance(timeout);
                Ok(None)
            }
            Some(Reply::Silence) | None => {
                self.clock.advance(timeout);
                Ok(None)
            }
        }
    }

    fn flush_input(&mut self) -> io::Result<()> {
        self.flushes += 1;
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn is_open(&self) -> bool {
        true
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn dispatcher(spy: SpyTransport, clock: ManualClock) -> Dispatcher<SpyTransport, ManualClock> {
    init_tracing();
    Dispatcher::new(spy, clock, DispatcherConfig::default())
}

fn play(delay: Duration) -> CommandRequest {
    CommandRequest::new(BaseCommand::Play, delay).targets([0, 1, 5])
}

#[test]
fn test_ack_and_done_reports_transport_latency() {
    let clock = ManualClock::new();
    let spy = SpyTransport::with_replies(
        &clock,
        vec![Reply::Line("ACK:OK:10:5:20"), Reply::Line("DONE")],
    );
    let mut dispatcher = dispatcher(spy, clock);

    let outcome = dispatcher.send(&play(Duration::from_secs(1)));

    assert_eq!(outcome.status, DispatchStatus::Success);
    assert!(outcome.completed);
    assert!(outcome.warnings.is_empty());
    assert_eq!(outcome.targets, vec![0, 1, 5]);
    assert_eq!(outcome.code, Some(0xA0));

    let latency = outcome.latency.expect("success carries latency");
    assert_eq!(latency.round_trip_micros, 1500.0);
    assert_eq!(latency.device.total_micros, 20.0);
    assert_eq!(
        latency.transport_micros,
        transport_micros(latency.round_trip_micros, 20.0)
    );
    assert_eq!(latency.transport_micros, 1480.0);

    let spy = dispatcher.transport();
    assert_eq!(spy.lines(), vec!["160,1000000,0,23,0,0,0\n".to_string()]);
    assert_eq!(spy.flushes, 1);
}

#[test]
fn test_always_timeout_writes_one_plus_retries() {
    let clock = ManualClock::new();
    let mut dispatcher = dispatcher(SpyTransport::new(&clock), clock);

    let outcome = dispatcher.send(&play(Duration::from_millis(200)).retries(3));

    assert_eq!(outcome.status, DispatchStatus::Failure);
    assert_eq!(outcome.failure, Some(ErrorKind::Protocol));
    assert_eq!(outcome.attempts, 4);
    assert!(outcome.message.contains("Timed out"), "{}", outcome.message);
    assert_eq!(dispatcher.transport().writes.len(), 4);
}

#[test]
fn test_default_retry_budget_is_three() {
    let clock = ManualClock::new();
    let mut dispatcher = dispatcher(SpyTransport::new(&clock), clock);
    let outcome = dispatcher.send(&play(Duration::ZERO));
    assert_eq!(outcome.attempts, 4);
}

#[test]
fn test_nak_then_ack_succeeds_on_second_write() {
    let clock = ManualClock::new();
    let spy = SpyTransport::with_replies(
        &clock,
        vec![
            Reply::Line("NAK"),
            Reply::Line("ACK:OK:10:5:20"),
            Reply::Line("DONE"),
        ],
    );
    let mut dispatcher = dispatcher(spy, clock);

    let outcome = dispatcher.send(&play(Duration::from_secs(1)).retries(1));

    assert_eq!(outcome.status, DispatchStatus::Success);
    assert_eq!(outcome.attempts, 2);
    assert_eq!(dispatcher.transport().writes.len(), 2);
}

#[test]
fn test_malformed_reply_is_retried() {
    let clock = ManualClock::new();
    let spy = SpyTransport::with_replies(
        &clock,
        vec![
            Reply::Line("boot: esp32 ready"),
            Reply::Line("ACK:OK:1:1:2"),
            Reply::Line("DONE"),
        ],
    );
    let mut dispatcher = dispatcher(spy, clock);
    let outcome = dispatcher.send(&play(Duration::from_millis(10)));
    assert!(outcome.is_success());
    assert_eq!(outcome.attempts, 2);
}

#[test]
fn test_retry_resends_same_packet_and_keeps_slot_time() {
    let clock = ManualClock::new();
    let spy = SpyTransport::with_replies(
        &clock,
        vec![
            Reply::Line("NAK"),
            Reply::Line("NAK"),
            Reply::Line("ACK:OK:1:1:2"),
            Reply::Line("DONE"),
        ],
    );
    let mut dispatcher = dispatcher(spy, clock);

    let outcome = dispatcher.send(&play(Duration::from_secs(1)));
    assert!(outcome.is_success());
    assert_eq!(outcome.slot, Some(0));

    let writes = &dispatcher.transport().writes;
    assert_eq!(writes.len(), 3);
    assert!(writes.iter().all(|w| w == &writes[0]));
    assert_eq!(
        dispatcher.slots().target_time(0),
        Some(Duration::from_secs(1))
    );
}

#[test]
fn test_missing_done_is_success_with_warning() {
    let clock = ManualClock::new();
    let spy = SpyTransport::with_replies(&clock, vec![Reply::Line("ACK:OK:10:5:20")]);
    let mut dispatcher = dispatcher(spy, clock);

    let outcome = dispatcher.send(&play(Duration::from_millis(500)));

    assert_eq!(outcome.status, DispatchStatus::Success);
    assert!(!outcome.completed);
    assert_eq!(outcome.attempts, 1);
    assert!(outcome.warnings.iter().any(|w| w.contains("completion")));
    assert!(outcome.message.contains("completion marker missing"));
}

#[test]
fn test_defaulted_timing_is_flagged() {
    let clock = ManualClock::new();
    let spy = SpyTransport::with_replies(
        &clock,
        vec![Reply::Line("ACK:OK:fast"), Reply::Line("DONE")],
    );
    let mut dispatcher = dispatcher(spy, clock);

    let outcome = dispatcher.send(&play(Duration::ZERO));

    assert!(outcome.is_success());
    assert!(outcome.warnings.iter().any(|w| w.contains("timing")));
    let latency = outcome.latency.unwrap();
    assert_eq!(latency.device.total_micros, 0.0);
    assert_eq!(latency.transport_micros, latency.round_trip_micros);
}

#[test]
fn test_legacy_result_markers() {
    let clock = ManualClock::new();
    let spy = SpyTransport::with_replies(
        &clock,
        vec![
            Reply::Line("RESULT:ERROR"),
            Reply::Line("RESULT:OK"),
            Reply::Line("DONE"),
        ],
    );
    let mut dispatcher = dispatcher(spy, clock);
    let outcome = dispatcher.send(&play(Duration::ZERO));
    assert!(outcome.is_success());
    assert_eq!(outcome.attempts, 2);
}

#[test]
fn test_full_pool_is_capacity_error_without_writes() {
    let clock = ManualClock::new();
    let pool = SlotPool::new(16);
    for _ in 0..16 {
        pool.acquire(Duration::from_secs(60)).unwrap();
    }

    let mut dispatcher = Dispatcher::with_slots(
        SpyTransport::new(&clock),
        clock,
        DispatcherConfig::default(),
        pool,
    );
    let outcome = dispatcher.send(&play(Duration::from_secs(1)));

    assert_eq!(outcome.status, DispatchStatus::Failure);
    assert_eq!(outcome.failure, Some(ErrorKind::Capacity));
    assert_eq!(outcome.attempts, 0);
    assert!(dispatcher.transport().writes.is_empty());
    assert_eq!(dispatcher.transport().flushes, 0);
}

#[test]
fn test_successive_sends_use_distinct_slots() {
    let clock = ManualClock::new();
    let replies = (0..4)
        .flat_map(|_| [Reply::Line("ACK:OK:1:1:2"), Reply::Line("DONE")])
        .collect();
    let spy = SpyTransport::with_replies(&clock, replies);
    let mut dispatcher = dispatcher(spy, clock.clone());

    let mut previous = None;
    for _ in 0..4 {
        let outcome = dispatcher.send(&play(Duration::from_millis(100)));
        assert!(outcome.is_success());
        let slot = outcome.slot.unwrap();
        assert!(slot < 16);
        assert_ne!(Some(slot), previous);
        previous = Some(slot);
        clock.advance(Duration::from_secs(1));
    }
}

#[test]
fn test_expired_slot_is_reused() {
    let clock = ManualClock::new();
    let replies = (0..3)
        .flat_map(|_| [Reply::Line("ACK:OK:1:1:2"), Reply::Line("DONE")])
        .collect();
    let spy = SpyTransport::with_replies(&clock, replies);
    let mut dispatcher = dispatcher(spy, clock.clone());

    let first = dispatcher.send(&play(Duration::from_secs(1)));
    let second = dispatcher.send(&play(Duration::from_secs(1)));
    assert_eq!(first.slot, Some(0));
    assert_eq!(second.slot, Some(1));

    // past both target times
    clock.advance(Duration::from_secs(5));
    let third = dispatcher.send(&play(Duration::from_secs(1)));
    assert_eq!(third.slot, Some(0));
    assert_eq!(third.sub_command, Some(0xA0));
    assert_eq!(second.sub_command, Some(16 + 0xA0));
}

#[test]
fn test_transport_error_is_retried() {
    let clock = ManualClock::new();
    let mut spy = SpyTransport::with_replies(
        &clock,
        vec![Reply::Line("ACK:OK:1:1:2"), Reply::Line("DONE")],
    );
    spy.failing_writes = 1;
    let mut dispatcher = dispatcher(spy, clock);

    let outcome = dispatcher.send(&play(Duration::ZERO).retries(2));
    assert!(outcome.is_success());
    assert_eq!(outcome.attempts, 2);
}

#[test]
fn test_transport_error_exhausts_budget() {
    let clock = ManualClock::new();
    let mut spy = SpyTransport::new(&clock);
    spy.failing_writes = usize::MAX;
    let mut dispatcher = dispatcher(spy, clock);

    let outcome = dispatcher.send(&play(Duration::ZERO).retries(1));
    assert_eq!(outcome.failure, Some(ErrorKind::Transport));
    assert_eq!(outcome.attempts, 2);
    assert!(outcome.message.contains("device disconnected"));
}

#[test]
fn test_cancel_during_ack_wait_consumes_no_retry() {
    let clock = ManualClock::new();
    let cancel = CancellationToken::new();
    let spy = SpyTransport::with_replies(&clock, vec![Reply::CancelDuringRead(cancel.clone())]);
    let mut dispatcher = dispatcher(spy, clock);

    let outcome = dispatcher.send_with_cancel(&play(Duration::from_secs(1)).retries(3), &cancel);

    assert_eq!(outcome.status, DispatchStatus::Failure);
    assert_eq!(outcome.failure, Some(ErrorKind::Cancelled));
    assert_eq!(outcome.attempts, 1);
    assert_eq!(dispatcher.transport().writes.len(), 1);
}

#[test]
fn test_cancel_during_done_wait_fails() {
    let clock = ManualClock::new();
    let cancel = CancellationToken::new();
    let spy = SpyTransport::with_replies(
        &clock,
        vec![
            Reply::Line("ACK:OK:1:1:2"),
            Reply::CancelDuringRead(cancel.clone()),
        ],
    );
    let mut dispatcher = dispatcher(spy, clock);

    let outcome = dispatcher.send_with_cancel(&play(Duration::from_secs(1)), &cancel);
    assert_eq!(outcome.failure, Some(ErrorKind::Cancelled));
    assert!(outcome.latency.is_some());
}

#[test]
fn test_ack_wait_bounded_by_delay_plus_margin() {
    let clock = ManualClock::new();
    let mut spy = SpyTransport::new(&clock);
    spy.replies = vec![Reply::Silence, Reply::Silence].into();
    let mut dispatcher = dispatcher(spy, clock.clone());

    let outcome = dispatcher.send(&play(Duration::from_millis(100)).retries(0));
    assert_eq!(outcome.failure, Some(ErrorKind::Protocol));
    // delay plus the ACK margin bounds the wait
    assert_eq!(clock.now(), Duration::from_millis(2100));
}

#[test]
fn test_packet_fields_round_trip() {
    let targets = TargetSet::from_ids([2, 7, 31]).unwrap();
    let bytes = encode(
        BaseCommand::Pause.code(),
        9,
        Duration::from_micros(2_500_123),
        Duration::from_millis(750),
        targets,
        [12, 34, 56],
    );
    let line = String::from_utf8(bytes).unwrap();
    assert!(line.ends_with('\n'));
    assert_eq!(line.matches('\n').count(), 1);

    let packet = Packet::parse(&line).unwrap();
    assert_eq!(packet.code, 9 * 16 + 0xA1);
    assert_eq!(packet.delay_us, 2_500_123);
    assert_eq!(packet.lead_us, 750_000);
    assert_eq!(packet.target_mask, targets.mask());
    assert_eq!(packet.payload, [12, 34, 56]);
}

#[test]
fn test_outcome_serializes() {
    let clock = ManualClock::new();
    let spy = SpyTransport::with_replies(
        &clock,
        vec![Reply::Line("ACK:OK:10:5:20"), Reply::Line("DONE")],
    );
    let mut dispatcher = dispatcher(spy, clock);
    let outcome = dispatcher.send(&play(Duration::from_secs(1)));

    let json = serde_json::to_value(&outcome).unwrap();
    assert_eq!(json["status"], "Success");
    assert_eq!(json["slot"], 0);
    assert_eq!(json["targets"], serde_json::json!([0, 1, 5]));
}

#[test]
fn test_decode_ack_classifies_device_replies() {
    assert_eq!(
        decode_ack("ACK:OK:10:5:20\r\n"),
        AckResult::Ack {
            timing: DeviceTiming {
                read_micros: 10.0,
                parse_micros: 5.0,
                total_micros: 20.0,
            },
            timing_defaulted: false,
        }
    );
    assert!(matches!(decode_ack("NAK:FORMAT"), AckResult::Nak { .. }));
    assert_eq!(decode_ack(""), AckResult::Timeout);
    assert!(matches!(decode_ack("led on"), AckResult::Malformed { .. }));
}
