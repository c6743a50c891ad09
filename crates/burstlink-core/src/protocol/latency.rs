//! Latency decomposition
//!
//! Splits a measured round trip into the part spent inside the device and the
//! part spent on the link.

use serde::{Deserialize, Serialize};

/// Timing breakdown reported by the device in its ACK line, in microseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceTiming {
    /// Time spent reading the packet off the link
    pub read_micros: f64,
    /// Time spent parsing the packet
    pub parse_micros: f64,
    /// Total device-side handling time
    pub total_micros: f64,
}

/// Round-trip minus device-reported time.
///
/// The result is not clamped: a negative value means the clocks disagree or
/// the device over-reports.
pub fn transport_micros(total_round_trip_micros: f64, device_total_micros: f64) -> f64 {
    total_round_trip_micros - device_total_micros
}

/// Latency figures attached to a successful dispatch
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatencyReport {
    /// Host-measured time from write to ACK receipt
    pub round_trip_micros: f64,
    /// Device-reported breakdown
    pub device: DeviceTiming,
    /// Link-only share of the round trip
    pub transport_micros: f64,
}

impl LatencyReport {
    /// Derive transport time from a measured round trip
    pub fn new(round_trip_micros: f64, device: DeviceTiming) -> Self {
        Self {
            round_trip_micros,
            device,
            transport_micros: transport_micros(round_trip_micros, device.total_micros),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_micros() {
        assert_eq!(transport_micros(1500.0, 20.0), 1480.0);
    }

    #[test]
    fn test_negative_transport_not_clamped() {
        assert_eq!(transport_micros(10.0, 25.5), -15.5);
    }

    #[test]
    fn test_report() {
        let device = DeviceTiming {
            read_micros: 10.0,
            parse_micros: 5.0,
            total_micros: 20.0,
        };
        let report = LatencyReport::new(3020.0, device);
        assert_eq!(report.transport_micros, 3000.0);
        assert_eq!(report.device, device);
    }
}
