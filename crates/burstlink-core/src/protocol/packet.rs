//! Packet encoding/decoding
//!
//! Device-bound packets are one comma-separated text line:
//! `<code>,<delay_us>,<lead_us>,<mask_hex>,<p0>,<p1>,<p2>\n`
//!
//! - `code`: `slot * 16 + base command code`
//! - `delay_us`, `lead_us`: integer microseconds (truncated)
//! - `mask_hex`: target bitmask, lowercase hex without prefix
//!
//! Host-bound replies are `ACK:OK:<read_us>:<parse_us>:<total_us>`, a line
//! containing `NAK`, and finally the completion marker `DONE`.

use std::time::Duration;

use super::{
    latency::DeviceTiming, DispatchError, TargetSet, LINE_DELIMITER, PAYLOAD_LEN,
    SLOT_CODE_STRIDE,
};

/// Substring marking an acknowledgement
pub const ACK_MARKER: &str = "ACK:OK";
/// Substring marking a rejection
pub const NAK_MARKER: &str = "NAK";
/// Acknowledgement used by older firmware
pub const LEGACY_OK_MARKER: &str = "RESULT:OK";
/// Rejection used by older firmware
pub const LEGACY_ERROR_MARKER: &str = "RESULT:ERROR";
/// Completion marker line
pub const DONE_MARKER: &str = "DONE";

const ACK_FIELD_DELIMITER: char = ':';
const ACK_MIN_FIELDS: usize = 5;
const PACKET_FIELDS: usize = 4 + PAYLOAD_LEN;

/// A device-bound command packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Slot-derived command code
    pub code: u32,
    /// Delay until execution, microseconds
    pub delay_us: u64,
    /// Secondary lead time, microseconds
    pub lead_us: u64,
    /// Target bitmask
    pub target_mask: u64,
    /// Auxiliary payload values
    pub payload: [u32; PAYLOAD_LEN],
}

impl Packet {
    /// Build a packet for `base_code` scheduled in `slot`
    pub fn new(
        base_code: u8,
        slot: usize,
        delay: Duration,
        lead_time: Duration,
        targets: TargetSet,
        payload: [u32; PAYLOAD_LEN],
    ) -> Self {
        Self {
            code: slot_code(slot, base_code),
            delay_us: delay.as_micros() as u64,
            lead_us: lead_time.as_micros() as u64,
            target_mask: targets.mask(),
            payload,
        }
    }

    /// The line without its delimiter
    pub fn to_line(&self) -> String {
        let mut line = format!(
            "{},{},{},{:x}",
            self.code, self.delay_us, self.lead_us, self.target_mask
        );
        for value in &self.payload {
            line.push(',');
            line.push_str(&value.to_string());
        }
        line
    }

    /// Encode to wire bytes, terminated by a single newline
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = self.to_line().into_bytes();
        bytes.push(LINE_DELIMITER);
        bytes
    }

    /// Decode a device-bound line back into its fields
    pub fn parse(line: &str) -> Result<Self, DispatchError> {
        let fields: Vec<&str> = line.trim().split(',').map(str::trim).collect();
        if fields.len() != PACKET_FIELDS {
            return Err(DispatchError::InvalidPacket(format!(
                "expected {} fields, got {}",
                PACKET_FIELDS,
                fields.len()
            )));
        }

        let bad = |name: &str, value: &str| {
            DispatchError::InvalidPacket(format!("bad {name} field '{value}'"))
        };

        let code = fields[0].parse().map_err(|_| bad("code", fields[0]))?;
        let delay_us = fields[1].parse().map_err(|_| bad("delay", fields[1]))?;
        let lead_us = fields[2].parse().map_err(|_| bad("lead", fields[2]))?;
        let target_mask =
            u64::from_str_radix(fields[3], 16).map_err(|_| bad("mask", fields[3]))?;

        let mut payload = [0u32; PAYLOAD_LEN];
        for (slot, field) in payload.iter_mut().zip(&fields[4..]) {
            *slot = field.parse().map_err(|_| bad("payload", *field))?;
        }

        Ok(Self {
            code,
            delay_us,
            lead_us,
            target_mask,
            payload,
        })
    }

    /// Encoded size including the delimiter
    pub fn encoded_size(&self) -> usize {
        self.to_line().len() + 1
    }
}

/// Fold a slot index and a base command into one wire code
pub fn slot_code(slot: usize, base_code: u8) -> u32 {
    slot as u32 * SLOT_CODE_STRIDE + base_code as u32
}

/// Encode a command straight to wire bytes
pub fn encode(
    base_code: u8,
    slot: usize,
    delay: Duration,
    lead_time: Duration,
    targets: TargetSet,
    payload: [u32; PAYLOAD_LEN],
) -> Vec<u8> {
    Packet::new(base_code, slot, delay, lead_time, targets, payload).to_bytes()
}

/// Result of decoding the first response line
#[derive(Debug, Clone, PartialEq)]
pub enum AckResult {
    /// Device accepted the packet and will execute it.
    ///
    /// `timing_defaulted` is set when the timing fields were missing or
    /// unparsable and `timing` holds zeros.
    Ack {
        timing: DeviceTiming,
        timing_defaulted: bool,
    },
    /// Device rejected the packet
    Nak { raw: String },
    /// No line arrived before the deadline
    Timeout,
    /// A line arrived but matched nothing expected
    Malformed { raw: String },
}

/// Decode an acknowledgement line
pub fn decode_ack(line: &str) -> AckResult {
    let line = line.trim();
    if line.is_empty() {
        return AckResult::Timeout;
    }

    if let Some(pos) = line.find(ACK_MARKER) {
        return match parse_timing(&line[pos..]) {
            Some(timing) => AckResult::Ack {
                timing,
                timing_defaulted: false,
            },
            None => AckResult::Ack {
                timing: DeviceTiming::default(),
                timing_defaulted: true,
            },
        };
    }

    if line.contains(LEGACY_ERROR_MARKER) || line.contains(NAK_MARKER) {
        return AckResult::Nak {
            raw: line.to_string(),
        };
    }

    if line.contains(LEGACY_OK_MARKER) {
        return AckResult::Ack {
            timing: DeviceTiming::default(),
            timing_defaulted: true,
        };
    }

    AckResult::Malformed {
        raw: line.to_string(),
    }
}

/// Parse `ACK:OK:<read>:<parse>:<total>[:...]` timing fields
fn parse_timing(ack: &str) -> Option<DeviceTiming> {
    let parts: Vec<&str> = ack.split(ACK_FIELD_DELIMITER).map(str::trim).collect();
    if parts.len() < ACK_MIN_FIELDS {
        return None;
    }
    Some(DeviceTiming {
        read_micros: parts[2].parse().ok()?,
        parse_micros: parts[3].parse().ok()?,
        total_micros: parts[4].parse().ok()?,
    })
}

/// Whether `line` is the completion marker
pub fn is_completion(line: &str) -> bool {
    line.trim() == DONE_MARKER
}

#[cfg(test)]
mod tests {
    use super::*;

    fn targets(ids: &[u8]) -> TargetSet {
        TargetSet::from_ids(ids.iter().copied()).unwrap()
    }

    #[test]
    fn test_encode_line() {
        let bytes = encode(
            0xA0,
            0,
            Duration::from_secs(1),
            Duration::ZERO,
            targets(&[0, 1, 5]),
            [0, 0, 0],
        );
        assert_eq!(bytes, b"160,1000000,0,23,0,0,0\n".to_vec());
    }

    #[test]
    fn test_slot_folded_into_code() {
        let packet = Packet::new(
            0x01,
            3,
            Duration::from_millis(1500),
            Duration::from_millis(250),
            targets(&[10]),
            [255, 64, 7],
        );
        assert_eq!(packet.code, 3 * 16 + 1);
        assert_eq!(packet.to_line(), "49,1500000,250000,400,255,64,7");
        assert_eq!(packet.encoded_size(), packet.to_bytes().len());
    }

    #[test]
    fn test_micros_truncated() {
        let packet = Packet::new(
            0x02,
            0,
            Duration::from_nanos(1_999),
            Duration::from_nanos(999),
            TargetSet::default(),
            [0; PAYLOAD_LEN],
        );
        assert_eq!(packet.delay_us, 1);
        assert_eq!(packet.lead_us, 0);
        assert!(packet.to_line().contains(",0,"));
    }

    #[test]
    fn test_parse_rejects_bad_lines() {
        assert!(Packet::parse("1,2,3").is_err());
        assert!(Packet::parse("1,2,3,zz,0,0,0").is_err());
        assert!(Packet::parse("x,2,3,ff,0,0,0").is_err());
    }

    #[test]
    fn test_decode_ack_with_timing() {
        let result = decode_ack("ACK:OK:10:5:20\r\n");
        assert_eq!(
            result,
            AckResult::Ack {
                timing: DeviceTiming {
                    read_micros: 10.0,
                    parse_micros: 5.0,
                    total_micros: 20.0,
                },
                timing_defaulted: false,
            }
        );
    }

    #[test]
    fn test_decode_ack_with_prefix_and_extra_fields() {
        match decode_ack("[bridge] ACK:OK:12.5:3.25:40.75:extra") {
            AckResult::Ack {
                timing,
                timing_defaulted,
            } => {
                assert!(!timing_defaulted);
                assert_eq!(timing.read_micros, 12.5);
                assert_eq!(timing.total_micros, 40.75);
            }
            other => panic!("expected ack, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_ack_short_layout_defaults_timing() {
        let expected = AckResult::Ack {
            timing: DeviceTiming::default(),
            timing_defaulted: true,
        };
        assert_eq!(decode_ack("ACK:OK:10:5"), expected);
        assert_eq!(decode_ack("ACK:OK:ten:5:20"), expected);
        assert_eq!(decode_ack("RESULT:OK"), expected);
    }

    #[test]
    fn test_decode_nak() {
        assert_eq!(
            decode_ack("NAK:FORMAT"),
            AckResult::Nak {
                raw: "NAK:FORMAT".to_string()
            }
        );
        assert!(matches!(decode_ack("RESULT:ERROR"), AckResult::Nak { .. }));
    }

    #[test]
    fn test_decode_timeout_and_malformed() {
        assert_eq!(decode_ack(""), AckResult::Timeout);
        assert_eq!(decode_ack("  \r\n"), AckResult::Timeout);
        assert_eq!(
            decode_ack("garbage"),
            AckResult::Malformed {
                raw: "garbage".to_string()
            }
        );
    }

    #[test]
    fn test_is_completion() {
        assert!(is_completion("DONE\n"));
        assert!(is_completion("DONE\r\n"));
        assert!(!is_completion("DONE:1"));
    }
}
