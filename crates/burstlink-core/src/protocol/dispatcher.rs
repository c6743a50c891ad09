//! Command dispatch
//!
//! Drives one command through slot acquisition, packet write, ACK wait and
//! DONE wait, retrying the write on protocol or transport failure.
//!
//! ```text
//! Idle -> SlotRequested -> PacketSent -> AwaitingAck
//!      -> AckReceived -> AwaitingDone -> Done
//!      (Nak | Timeout | Malformed -> PacketSent while retries remain, else Failed)
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{
    clock::{Clock, MonotonicClock},
    commands::{CommandId, CommandRequest, TargetSet},
    latency::{DeviceTiming, LatencyReport},
    packet::{decode_ack, is_completion, AckResult, Packet},
    slots::SlotPool,
    stream::{SerialTransport, Transport},
    DispatchError, ErrorKind, LINE_DELIMITER, PAYLOAD_LEN,
};
use crate::config::DispatcherConfig;

/// Dispatch state machine position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DispatchState {
    /// No dispatch in progress
    Idle,
    /// Request validated, waiting for a schedule slot
    SlotRequested,
    /// Packet written to the transport
    PacketSent,
    /// Waiting for the first response line
    AwaitingAck,
    /// Device accepted the packet
    AckReceived,
    /// Waiting for the completion marker
    AwaitingDone,
    /// Dispatch finished successfully
    Done,
    /// Dispatch finished with a failure
    Failed,
}

/// Final status of a dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DispatchStatus {
    /// Device acknowledged the command
    Success,
    /// Rejected, cancelled or out of retries; see `message`
    Failure,
}

/// Result of [`Dispatcher::send`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchOutcome {
    /// Unique id of this dispatch, for log correlation
    pub id: Uuid,
    /// The only field callers need to branch on
    pub status: DispatchStatus,
    /// Command as requested
    pub command: CommandId,
    /// Resolved base command code
    pub code: Option<u8>,
    /// Deduplicated target ids
    pub targets: Vec<u8>,
    /// Target bitmask as sent on the wire
    pub target_mask: u64,
    /// Schedule slot used
    pub slot: Option<usize>,
    /// Slot-derived command code sent on the wire
    pub sub_command: Option<u32>,
    /// Number of packet writes attempted
    pub attempts: u32,
    /// Failure class, set when `status` is `Failure`
    pub failure: Option<ErrorKind>,
    /// Success detail or last failure reason
    pub message: String,
    /// Non-fatal conditions (missed DONE, defaulted timing)
    pub warnings: Vec<String>,
    /// Round-trip breakdown, present once an ACK arrived
    pub latency: Option<LatencyReport>,
    /// Whether the DONE marker was seen
    pub completed: bool,
    /// Wall-clock time the dispatch ended
    pub finished_at: DateTime<Utc>,
}

impl DispatchOutcome {
    fn pending(request: &CommandRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: DispatchStatus::Failure,
            command: request.command.clone(),
            code: None,
            targets: request.targets.clone(),
            target_mask: 0,
            slot: None,
            sub_command: None,
            attempts: 0,
            failure: None,
            message: String::new(),
            warnings: Vec::new(),
            latency: None,
            completed: false,
            finished_at: Utc::now(),
        }
    }

    /// Failure outcome for a request that never reached a dispatcher
    pub fn rejected(request: &CommandRequest, err: &DispatchError) -> Self {
        let mut outcome = Self::pending(request);
        outcome.failure = Some(err.kind());
        outcome.message = err.to_string();
        outcome
    }

    /// Whether the device accepted the command
    pub fn is_success(&self) -> bool {
        self.status == DispatchStatus::Success
    }
}

/// A request that passed validation
#[derive(Debug, Clone, Copy)]
struct ValidatedRequest {
    code: u8,
    delay: Duration,
    lead_time: Duration,
    targets: TargetSet,
    payload: [u32; PAYLOAD_LEN],
    retries: u32,
}

/// What an accepted attempt produced
#[derive(Debug, Clone)]
struct AckReceipt {
    timing: DeviceTiming,
    timing_defaulted: bool,
    round_trip: Duration,
}

/// Sends timed commands over one transport
pub struct Dispatcher<T: Transport = SerialTransport, C: Clock = MonotonicClock> {
    transport: T,
    clock: C,
    slots: SlotPool,
    config: DispatcherConfig,
    state: DispatchState,
    /// Metrics: cumulative packets/bytes written and lines read
    tx_packets: u64,
    tx_bytes: u64,
    rx_lines: u64,
}

impl Dispatcher<SerialTransport, MonotonicClock> {
    /// Open the configured serial port and wake the bridge
    pub fn open(config: DispatcherConfig) -> Result<Self, DispatchError> {
        let mut transport =
            SerialTransport::open(&config.port_name, config.baud_rate, config.read_timeout())?;
        transport.wake(config.settle_delay())?;
        Ok(Self::new(transport, MonotonicClock::new(), config))
    }
}

impl<T: Transport, C: Clock> Dispatcher<T, C> {
    /// Create a dispatcher with its own slot pool
    pub fn new(transport: T, clock: C, config: DispatcherConfig) -> Self {
        let slots = SlotPool::new(config.slot_count);
        Self::with_slots(transport, clock, config, slots)
    }

    /// Create a dispatcher sharing an existing slot pool
    pub fn with_slots(transport: T, clock: C, config: DispatcherConfig, slots: SlotPool) -> Self {
        Self {
            transport,
            clock,
            slots,
            config,
            state: DispatchState::Idle,
            tx_packets: 0,
            tx_bytes: 0,
            rx_lines: 0,
        }
    }

    /// Slot pool, possibly shared with other dispatchers
    pub fn slots(&self) -> &SlotPool {
        &self.slots
    }

    /// Settings this dispatcher was built with
    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Clock used for target times and deadlines
    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// State reached by the most recent dispatch
    pub fn state(&self) -> DispatchState {
        self.state
    }

    /// Underlying transport
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Get cumulative packets written, bytes written and lines read
    pub fn counters(&self) -> (u64, u64, u64) {
        (self.tx_packets, self.tx_bytes, self.rx_lines)
    }

    /// Whether the transport can still be used
    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    /// Close the transport; later sends fail with `NotConnected`
    pub fn close(&mut self) {
        if let Err(e) = self.transport.close() {
            warn!("error closing transport: {}", e);
        }
    }

    /// Dispatch one command. Never fails: errors are folded into the outcome.
    pub fn send(&mut self, request: &CommandRequest) -> DispatchOutcome {
        self.send_with_cancel(request, &CancellationToken::new())
    }

    /// Dispatch one command, aborting any wait once `cancel` fires
    pub fn send_with_cancel(
        &mut self,
        request: &CommandRequest,
        cancel: &CancellationToken,
    ) -> DispatchOutcome {
        let mut outcome = DispatchOutcome::pending(request);
        self.state = DispatchState::Idle;

        if cancel.is_cancelled() {
            return self.fail(outcome, DispatchError::Cancelled);
        }

        let validated = match self.validate(request) {
            Ok(v) => v,
            Err(e) => return self.fail(outcome, e),
        };
        outcome.code = Some(validated.code);
        outcome.targets = validated.targets.ids();
        outcome.target_mask = validated.targets.mask();

        if !self.transport.is_open() {
            return self.fail(outcome, DispatchError::NotConnected);
        }

        self.state = DispatchState::SlotRequested;
        let target_time = self.clock.now() + validated.delay;
        let slot = match self.slots.acquire(target_time) {
            Ok(slot) => slot,
            Err(e) => return self.fail(outcome, e),
        };

        let packet = Packet::new(
            validated.code,
            slot,
            validated.delay,
            validated.lead_time,
            validated.targets,
            validated.payload,
        );
        outcome.slot = Some(slot);
        outcome.sub_command = Some(packet.code);

        // Retries resend this exact packet; the slot keeps its first target time
        let line = packet.to_line();
        let bytes = packet.to_bytes();
        let ack_timeout = validated.delay + self.config.ack_margin();
        let retries = validated.retries;
        let mut last_error = DispatchError::Timeout;

        for attempt in 0..=retries {
            if attempt > 0 {
                warn!(slot, "Retrying command (Attempt {}/{})...", attempt, retries);
                self.clock.sleep(self.config.retry_backoff());
            }
            if cancel.is_cancelled() {
                return self.fail(outcome, DispatchError::Cancelled);
            }

            outcome.attempts = attempt + 1;
            match self.attempt(&line, &bytes, ack_timeout, cancel) {
                Ok(receipt) => {
                    return self.complete(outcome, receipt, target_time, cancel);
                }
                Err(DispatchError::Cancelled) => {
                    return self.fail(outcome, DispatchError::Cancelled);
                }
                Err(e) if e.is_retryable() => {
                    warn!(slot, attempt = attempt + 1, "attempt failed: {}", e);
                    last_error = e;
                }
                Err(e) => return self.fail(outcome, e),
            }
        }

        error!(
            slot,
            "Giving up after {} attempts: {}", outcome.attempts, last_error
        );
        let attempts = outcome.attempts;
        let mut outcome = self.fail(outcome, last_error);
        outcome.message = format!("failed after {} attempts: {}", attempts, outcome.message);
        outcome
    }

    fn validate(&self, request: &CommandRequest) -> Result<ValidatedRequest, DispatchError> {
        let code = request.command.resolve()?;

        let minimum = self.config.min_delay();
        if request.delay < minimum {
            return Err(DispatchError::DelayTooShort {
                actual: request.delay,
                minimum,
            });
        }

        let targets = request.target_set()?;
        if targets.is_empty() && !(request.allow_empty_targets || self.config.allow_empty_targets)
        {
            return Err(DispatchError::NoTargets);
        }

        Ok(ValidatedRequest {
            code,
            delay: request.delay,
            lead_time: request.lead_time.unwrap_or(Duration::ZERO),
            targets,
            payload: request.payload,
            retries: request.retries.unwrap_or(self.config.default_retries),
        })
    }

    /// One write plus ACK wait
    fn attempt(
        &mut self,
        line: &str,
        bytes: &[u8],
        ack_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<AckReceipt, DispatchError> {
        self.state = DispatchState::PacketSent;
        self.transport.flush_input()?;

        info!("Sending Command: {}", line);
        self.tx_packets = self.tx_packets.saturating_add(1);
        self.tx_bytes = self.tx_bytes.saturating_add(bytes.len() as u64);
        self.transport.write(bytes)?;
        let sent_at = self.clock.now();

        self.state = DispatchState::AwaitingAck;
        let response = self.read_line(sent_at + ack_timeout, cancel)?;
        let received_at = self.clock.now();

        match decode_ack(response.as_deref().unwrap_or_default()) {
            AckResult::Ack {
                timing,
                timing_defaulted,
            } => {
                self.state = DispatchState::AckReceived;
                Ok(AckReceipt {
                    timing,
                    timing_defaulted,
                    round_trip: received_at.saturating_sub(sent_at),
                })
            }
            AckResult::Nak { raw } => {
                warn!("Device reported format error: {}", raw);
                Err(DispatchError::Nak(raw))
            }
            AckResult::Timeout => Err(DispatchError::Timeout),
            AckResult::Malformed { raw } => {
                warn!("Unexpected device response: {}", raw);
                Err(DispatchError::Malformed(raw))
            }
        }
    }

    /// DONE wait after an accepted ACK
    fn complete(
        &mut self,
        mut outcome: DispatchOutcome,
        receipt: AckReceipt,
        target_time: Duration,
        cancel: &CancellationToken,
    ) -> DispatchOutcome {
        let round_trip_micros = receipt.round_trip.as_nanos() as f64 / 1_000.0;
        let report = LatencyReport::new(round_trip_micros, receipt.timing);
        outcome.latency = Some(report);
        if receipt.timing_defaulted {
            warn!("ACK timing fields missing or malformed; device timing zeroed");
            outcome
                .warnings
                .push("device timing missing or malformed; reported as zero".to_string());
        }

        self.state = DispatchState::AwaitingDone;
        let deadline = target_time.max(self.clock.now()) + self.config.ack_margin();
        match self.await_completion(deadline, cancel) {
            Ok(true) => outcome.completed = true,
            Ok(false) => {
                warn!("Command acknowledged but completion marker not received");
                outcome
                    .warnings
                    .push("completion marker not received".to_string());
            }
            Err(DispatchError::Cancelled) => return self.fail(outcome, DispatchError::Cancelled),
            Err(e) => {
                warn!("Completion wait aborted: {}", e);
                outcome
                    .warnings
                    .push(format!("completion wait aborted: {}", e));
            }
        }

        self.state = DispatchState::Done;
        outcome.status = DispatchStatus::Success;
        outcome.message = format!(
            "acknowledged in {:.0}us (device {:.0}us, transport {:.0}us){}",
            report.round_trip_micros,
            report.device.total_micros,
            report.transport_micros,
            if outcome.completed {
                ""
            } else {
                "; completion marker missing"
            }
        );
        outcome.finished_at = Utc::now();
        info!(
            slot = outcome.slot,
            attempts = outcome.attempts,
            "Command executed successfully: {}",
            outcome.message
        );
        outcome
    }

    /// Read lines until the completion marker or the deadline
    fn await_completion(
        &mut self,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<bool, DispatchError> {
        while let Some(line) = self.read_line(deadline, cancel)? {
            if is_completion(&line) {
                return Ok(true);
            }
            debug!("ignoring line while awaiting completion: {}", line);
        }
        Ok(false)
    }

    /// Read the next non-blank line, or `None` once `deadline` passes
    fn read_line(
        &mut self,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, DispatchError> {
        let poll = self.config.poll_interval();
        loop {
            if cancel.is_cancelled() {
                return Err(DispatchError::Cancelled);
            }
            let now = self.clock.now();
            if now >= deadline {
                return Ok(None);
            }

            let slice = (deadline - now).min(poll);
            if let Some(bytes) = self.transport.read_until(LINE_DELIMITER, slice)? {
                self.rx_lines = self.rx_lines.saturating_add(1);
                let line = String::from_utf8_lossy(&bytes).trim().to_string();
                if line.is_empty() {
                    continue;
                }
                debug!("received line: {}", line);
                return Ok(Some(line));
            }
        }
    }

    fn fail(&mut self, mut outcome: DispatchOutcome, err: DispatchError) -> DispatchOutcome {
        match err.kind() {
            ErrorKind::Validation | ErrorKind::Capacity => error!("Dispatch rejected: {}", err),
            ErrorKind::Cancelled => info!("Dispatch cancelled"),
            _ => {}
        }
        self.state = DispatchState::Failed;
        outcome.status = DispatchStatus::Failure;
        outcome.failure = Some(err.kind());
        outcome.message = err.to_string();
        outcome.finished_at = Utc::now();
        outcome
    }
}

impl<T: Transport, C: Clock> Drop for Dispatcher<T, C> {
    fn drop(&mut self) {
        self.close();
    }
}
