//! Demo Mode - Simulated bridge firmware for testing
//!
//! Answers packets the way the ESP32 bridge does: an `ACK:OK` line with
//! randomized device timing after a short link delay, then `DONE` once the
//! command's delay has elapsed. Packets can be dropped or rejected at
//! configurable rates to exercise the retry path without hardware.

use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;
use std::io;
use std::time::Duration;

use crate::protocol::packet::{ACK_MARKER, DONE_MARKER};
use crate::protocol::stream::take_line;
use crate::protocol::{Clock, Packet, Transport, LINE_DELIMITER};

/// Knobs for the simulated device
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationConfig {
    /// Probability a packet gets no reply at all
    pub drop_rate: f64,
    /// Probability a packet is answered with NAK
    pub nak_rate: f64,
    /// One-way link delay range in microseconds
    pub link_delay_us: (u64, u64),
    /// Device handling time range in microseconds
    pub device_time_us: (u64, u64),
    /// Send `DONE` after executing
    pub report_completion: bool,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            drop_rate: 0.0,
            nak_rate: 0.0,
            link_delay_us: (1_500, 4_000),
            device_time_us: (20, 120),
            report_completion: true,
        }
    }
}

/// A reply waiting to be read
#[derive(Debug, Clone)]
struct Scheduled {
    ready_at: Duration,
    line: String,
}

/// Simulated bridge implementing [`Transport`]
pub struct SimulatedDevice<C: Clock> {
    clock: C,
    config: SimulationConfig,
    rng: StdRng,
    /// Bytes written but not yet terminated by a newline
    inbox: Vec<u8>,
    outbox: Vec<Scheduled>,
    received: Vec<Packet>,
    open: bool,
}

impl<C: Clock> SimulatedDevice<C> {
    /// Create a simulator with a random seed
    pub fn new(clock: C, config: SimulationConfig) -> Self {
        Self::from_rng(clock, config, StdRng::from_entropy())
    }

    /// Create a simulator with reproducible timings
    pub fn with_seed(clock: C, config: SimulationConfig, seed: u64) -> Self {
        Self::from_rng(clock, config, StdRng::seed_from_u64(seed))
    }

    fn from_rng(clock: C, config: SimulationConfig, rng: StdRng) -> Self {
        Self {
            clock,
            config,
            rng,
            inbox: Vec::new(),
            outbox: Vec::new(),
            received: Vec::new(),
            open: true,
        }
    }

    /// Packets decoded so far, in arrival order
    pub fn received(&self) -> &[Packet] {
        &self.received
    }

    fn sample(&mut self, (low, high): (u64, u64)) -> u64 {
        if high > low {
            self.rng.gen_range(low..=high)
        } else {
            low
        }
    }

    fn chance(&mut self, rate: f64) -> bool {
        self.rng.gen_bool(rate.clamp(0.0, 1.0))
    }

    fn schedule(&mut self, after: Duration, line: String) {
        let ready_at = self.clock.now() + after;
        self.outbox.push(Scheduled { ready_at, line });
    }

    /// React to one complete line from the host
    fn handle_line(&mut self, line: &[u8]) {
        let text = String::from_utf8_lossy(line);
        if text.trim().is_empty() {
            // wake-up newline
            return;
        }

        let packet = match Packet::parse(&text) {
            Ok(packet) => packet,
            Err(_) => {
                let delay = Duration::from_micros(self.sample(self.config.link_delay_us));
                self.schedule(delay, "NAK:PARSE".to_string());
                return;
            }
        };
        self.received.push(packet.clone());

        if self.chance(self.config.drop_rate) {
            return;
        }

        let link = self.sample(self.config.link_delay_us);
        if self.chance(self.config.nak_rate) {
            self.schedule(Duration::from_micros(link * 2), "NAK:REJECTED".to_string());
            return;
        }

        let total = self.sample(self.config.device_time_us);
        let read = total / 2;
        let parse = total / 4;
        self.schedule(
            Duration::from_micros(link * 2 + total),
            format!("{ACK_MARKER}:{read}:{parse}:{total}"),
        );

        if self.config.report_completion {
            let done_after = Duration::from_micros(packet.delay_us + link * 2 + total);
            self.schedule(done_after, DONE_MARKER.to_string());
        }
    }

    /// Index of the earliest queued reply
    fn next_ready(&self) -> Option<usize> {
        self.outbox
            .iter()
            .enumerate()
            .min_by_key(|(_, s)| s.ready_at)
            .map(|(i, _)| i)
    }
}

impl<C: Clock> Transport for SimulatedDevice<C> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if !self.open {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "device closed"));
        }
        self.inbox.extend_from_slice(data);
        while let Some(line) = take_line(&mut self.inbox, LINE_DELIMITER) {
            self.handle_line(&line);
        }
        Ok(data.len())
    }

    fn read_until(&mut self, _delimiter: u8, timeout: Duration) -> io::Result<Option<Vec<u8>>> {
        if !self.open {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "device closed"));
        }
        let now = self.clock.now();
        let deadline = now + timeout;

        match self.next_ready() {
            Some(i) if self.outbox[i].ready_at <= deadline => {
                let reply = self.outbox.remove(i);
                if reply.ready_at > now {
                    self.clock.sleep(reply.ready_at - now);
                }
                Ok(Some(reply.line.into_bytes()))
            }
            _ => {
                self.clock.sleep(timeout);
                Ok(None)
            }
        }
    }

    fn flush_input(&mut self) -> io::Result<()> {
        // Replies that already arrived count as stale input
        let now = self.clock.now();
        self.outbox.retain(|s| s.ready_at > now);
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        self.open = false;
        self.outbox.clear();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }
}
