//! # Emission and detection reports
//!
//! The per-frame records produced at the transmitter and the detector,
//! plus the fixed system parameters that govern alignment.

use serde::{Deserialize, Serialize};

use crate::frame::FrameId;
use crate::qubit::{QubitSequence, SlotIndex};

/// Per-frame record at the transmitter.
///
/// Owned by the `TransmitterStore` until the peer has finished discarding
/// non-matching slots for that frame, then dropped.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EmitterReport {
    pub frame_id: FrameId,
    pub epoch_timestamp_ps: u64,
    pub slot_period_ps: u64,
    pub emissions: QubitSequence,
    /// Optional per-slot intensity (mean photon number), parallel to
    /// `emissions`.
    pub intensity: Option<Vec<f64>>,
}

impl EmitterReport {
    pub fn frame_slot_count(&self) -> usize {
        self.emissions.len()
    }
}

/// A single time-tagged detection event.
///
/// `time_offset_ps` is a monotonically non-decreasing elapsed interval
/// from the report's `epoch_timestamp_ps`, resolution picoseconds.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectionEvent {
    pub time_offset_ps: u64,
    pub measured_qubit: crate::qubit::Qubit,
}

/// Per-frame record at the detector.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DetectionReport {
    pub frame_id: FrameId,
    pub epoch_timestamp_ps: u64,
    pub detections: Vec<DetectionEvent>,
}

impl DetectionReport {
    /// Detections are required to be non-decreasing in `time_offset_ps`;
    /// this checks that invariant holds (violations are an `Internal`
    /// error upstream — devices are expected to deliver reports in time
    /// order).
    pub fn is_time_ordered(&self) -> bool {
        self.detections
            .windows(2)
            .all(|w| w[1].time_offset_ps >= w[0].time_offset_ps)
    }
}

/// Fixed alignment parameters for a session.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SystemParameters {
    pub frame_width_ps: u64,
    pub slot_width_ps: u64,
    pub pulse_width_ps: u64,
    pub max_drift_ps_per_second: i64,
    pub acceptance_ratio: f64,
    pub frame_slot_count: u32,
}

impl SystemParameters {
    /// Convert a time offset under a candidate drift (expressed in
    /// picoseconds of shift per slot) to a tentative slot index. Returns
    /// `None` if the resulting slot would fall outside the frame.
    pub fn slot_for_offset(&self, time_offset_ps: u64, drift_ps_per_slot: i64) -> Option<SlotIndex> {
        let corrected = time_offset_ps as i128 - drift_ps_per_slot as i128;
        if corrected < 0 {
            return None;
        }
        let slot = corrected / self.slot_width_ps as i128;
        if slot < 0 || slot >= self.frame_slot_count as i128 {
            return None;
        }
        Some(slot as SlotIndex)
    }

    /// Fractional offset of a detection within its nominal slot, modulo
    /// `slot_width_ps`.
    pub fn fractional_offset(&self, time_offset_ps: u64, drift_ps_per_slot: i64) -> u64 {
        let corrected = (time_offset_ps as i128 - drift_ps_per_slot as i128).max(0);
        (corrected % self.slot_width_ps as i128) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> SystemParameters {
        SystemParameters {
            frame_width_ps: 1024 * 100_000,
            slot_width_ps: 100_000,
            pulse_width_ps: 1_000,
            max_drift_ps_per_second: 1_000_000,
            acceptance_ratio: 0.9,
            frame_slot_count: 1024,
        }
    }

    #[test]
    fn slot_for_offset_with_zero_drift() {
        let p = params();
        assert_eq!(p.slot_for_offset(0, 0), Some(0));
        assert_eq!(p.slot_for_offset(250_000, 0), Some(2));
        assert_eq!(p.slot_for_offset(100_000 * 1024, 0), None);
    }

    #[test]
    fn slot_for_offset_rejects_negative_corrected() {
        let p = params();
        assert_eq!(p.slot_for_offset(0, 500_000), None);
    }

    #[test]
    fn detection_report_time_ordering() {
        let report = DetectionReport {
            frame_id: FrameId(1),
            epoch_timestamp_ps: 0,
            detections: vec![
                DetectionEvent { time_offset_ps: 0, measured_qubit: crate::qubit::Qubit::new(0).unwrap() },
                DetectionEvent { time_offset_ps: 5, measured_qubit: crate::qubit::Qubit::new(1).unwrap() },
            ],
        };
        assert!(report.is_time_ordered());
    }
}
