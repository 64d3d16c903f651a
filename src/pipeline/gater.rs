//! # Detector gater
//!
//! Locks a detection report onto the transmitter's slot grid: searches
//! for the clock drift that best explains the detection times, confirms
//! the lock against disclosed alignment markers, assigns surviving
//! detections to slots, and reports which slots to keep back to the
//! transmitter.

use std::sync::Mutex;
use std::time::Duration;

use crossbeam_channel::Sender;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::frame::FrameId;
use crate::net::rpc::{RpcChannel, RpcRequest, RpcResponse};
use crate::qubit::Qubit;
use crate::reports::{DetectionReport, SystemParameters};
use crate::stats::StatsHub;

/// A frame handed to the local sifter-rx: the slots this side kept, in
/// ascending slot order, matching the order the transmitter keeps its
/// own survivors.
pub struct GatedDetection {
    pub frame_id: FrameId,
    pub qubits: Vec<Qubit>,
}

/// Pluggable slot-assignment policy.
pub trait AlignmentStrategy {
    /// Search for the drift (picoseconds of shift per slot) that best
    /// explains `report`, starting the search from `last_drift`.
    /// Returns the locked drift and its supporting peak histogram count.
    fn search_drift(
        &self,
        report: &DetectionReport,
        params: &SystemParameters,
        last_drift_ps_per_slot: i64,
        half_range_ps_per_slot: i64,
    ) -> (i64, usize);
}

/// The default strategy: build a histogram of
/// fractional in-slot offsets for a spread of candidate drifts and pick
/// the candidate whose histogram has the sharpest peak.
pub struct DriftSearchAligner {
    candidates: usize,
}

impl DriftSearchAligner {
    pub fn new() -> DriftSearchAligner {
        DriftSearchAligner { candidates: 64 }
    }
}

impl Default for DriftSearchAligner {
    fn default() -> Self {
        DriftSearchAligner::new()
    }
}

impl AlignmentStrategy for DriftSearchAligner {
    fn search_drift(
        &self,
        report: &DetectionReport,
        params: &SystemParameters,
        last_drift_ps_per_slot: i64,
        half_range_ps_per_slot: i64,
    ) -> (i64, usize) {
        if report.detections.is_empty() {
            return (last_drift_ps_per_slot, 0);
        }

        let bin_width = params.pulse_width_ps.max(1);
        let bin_count = ((params.slot_width_ps / bin_width).max(1)) as usize;
        let step = (half_range_ps_per_slot * 2 / self.candidates.max(1) as i64).max(1);

        let mut best_drift = last_drift_ps_per_slot;
        let mut best_peak = 0usize;
        let mut best_distance = i64::MAX;

        let mut candidate = last_drift_ps_per_slot - half_range_ps_per_slot;
        let end = last_drift_ps_per_slot + half_range_ps_per_slot;
        while candidate <= end {
            let mut bins = vec![0usize; bin_count];
            for detection in &report.detections {
                let offset = params.fractional_offset(detection.time_offset_ps, candidate);
                let bin = ((offset / bin_width) as usize).min(bin_count - 1);
                bins[bin] += 1;
            }
            let peak = bins.into_iter().max().unwrap_or(0);
            let distance = (candidate - last_drift_ps_per_slot).abs();

            let better = peak > best_peak
                || (peak == best_peak && distance < best_distance)
                || (peak == best_peak && distance == best_distance && candidate.abs() < best_drift.abs());
            if better {
                best_peak = peak;
                best_drift = candidate;
                best_distance = distance;
            }
            candidate += step;
        }

        (best_drift, best_peak)
    }
}

/// Assumes zero clock drift outright.
pub struct NullAligner;

impl AlignmentStrategy for NullAligner {
    fn search_drift(
        &self,
        report: &DetectionReport,
        params: &SystemParameters,
        _last_drift_ps_per_slot: i64,
        _half_range_ps_per_slot: i64,
    ) -> (i64, usize) {
        let bin_width = params.pulse_width_ps.max(1);
        let bin_count = ((params.slot_width_ps / bin_width).max(1)) as usize;
        let mut bins = vec![0usize; bin_count];
        for detection in &report.detections {
            let offset = params.fractional_offset(detection.time_offset_ps, 0);
            let bin = ((offset / bin_width) as usize).min(bin_count - 1);
            bins[bin] += 1;
        }
        (0, bins.into_iter().max().unwrap_or(0))
    }
}

/// Converts the configured maximum drift, expressed in ps/second, to
/// ps/slot, so the search operates in the same units as
/// `SystemParameters::slot_for_offset`.
fn max_drift_ps_per_slot(params: &SystemParameters) -> i64 {
    let scaled = params.max_drift_ps_per_second as i128 * params.slot_width_ps as i128 / 1_000_000_000_000i128;
    scaled.clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

/// Maximum number of times the search range is doubled before a frame
/// is abandoned for failing to lock.
const MAX_RANGE_EXPANSIONS: u32 = 3;

pub struct DetectorGater {
    params: SystemParameters,
    alignment: Box<dyn AlignmentStrategy + Send + Sync>,
    last_drift_ps_per_slot: Mutex<i64>,
    ewma_weight: f64,
    marker_count: u32,
    peer: std::sync::Arc<RpcChannel>,
    rpc_timeout: Duration,
    to_sifter: Sender<GatedDetection>,
    stats: std::sync::Arc<StatsHub>,
}

impl DetectorGater {
    pub fn new(
        params: SystemParameters,
        alignment: Box<dyn AlignmentStrategy + Send + Sync>,
        ewma_weight: f64,
        marker_count: u32,
        peer: std::sync::Arc<RpcChannel>,
        rpc_timeout: Duration,
        to_sifter: Sender<GatedDetection>,
        stats: std::sync::Arc<StatsHub>,
    ) -> DetectorGater {
        DetectorGater {
            params,
            alignment,
            last_drift_ps_per_slot: Mutex::new(0),
            ewma_weight,
            marker_count,
            peer,
            rpc_timeout,
            to_sifter,
            stats,
        }
    }

    pub fn current_drift_estimate(&self) -> i64 {
        *self.last_drift_ps_per_slot.lock().unwrap()
    }

    /// Run the full alignment pipeline for one detection report. Frame
    /// failures are non-fatal: an empty `GatedDetection` is still
    /// forwarded so downstream stages stay in frame-id order.
    pub fn process_frame(&self, report: DetectionReport) -> Result<()> {
        let frame_id = report.frame_id;
        let result = self.stats.time("gater_frame", || self.try_process_frame(&report));
        match result {
            Ok(qubits) => {
                log::debug!("frame {} gated: {} slots kept, drift {} ps/slot", frame_id.0, qubits.len(), self.current_drift_estimate());
                self.stats.incr("gater_frames_locked");
                self.stats.incr_by("gater_slots_kept", qubits.len() as u64);
                self.send(frame_id, qubits)?;
                Ok(())
            }
            Err(e) => {
                log::warn!("frame {} abandoned at gater: {}", frame_id.0, e);
                self.stats.incr("gater_frames_abandoned");
                let _ = self.send(frame_id, Vec::new());
                Err(e)
            }
        }
    }

    fn send(&self, frame_id: FrameId, qubits: Vec<Qubit>) -> Result<()> {
        self.to_sifter
            .send(GatedDetection { frame_id, qubits })
            .map_err(|_| Error::SessionFaulted("sifter input channel closed".into()))
    }

    fn try_process_frame(&self, report: &DetectionReport) -> Result<Vec<Qubit>> {
        if report.detections.is_empty() {
            return Err(Error::frame_abandoned(report.frame_id.0, "no detections in report"));
        }

        let max_half_range = max_drift_ps_per_slot(&self.params).max(1);
        let mut half_range = (max_half_range / 8).max(1);
        let last_drift = *self.last_drift_ps_per_slot.lock().unwrap();

        let mut expansions = 0;
        loop {
            let (candidate_drift, _peak) = self.alignment.search_drift(report, &self.params, last_drift, half_range);

            let idempotency_token = format!("gate-{}-{}", report.frame_id.0, expansions);
            let markers = self.request_markers(report.frame_id, &idempotency_token)?;

            if markers.is_empty() {
                return Err(Error::frame_abandoned(report.frame_id.0, "transmitter returned no alignment markers"));
            }

            let hits = self.count_marker_hits(report, candidate_drift, &markers);
            let required = (markers.len() as f64 * self.params.acceptance_ratio).ceil() as usize;

            if hits >= required {
                *self.last_drift_ps_per_slot.lock().unwrap() = ewma_update(last_drift, candidate_drift, self.ewma_weight);
                return self.finish_frame(report, candidate_drift, &markers);
            }

            expansions += 1;
            if expansions > MAX_RANGE_EXPANSIONS {
                return Err(Error::frame_abandoned(
                    report.frame_id.0,
                    format!("drift lock failed after {} range expansions", MAX_RANGE_EXPANSIONS),
                ));
            }
            half_range *= 2;
        }
    }

    fn request_markers(&self, frame_id: FrameId, idempotency_token: &str) -> Result<std::collections::HashMap<u32, Qubit>> {
        let request = RpcRequest::GetAlignmentMarkers {
            frame_id,
            marker_count: self.marker_count,
            send_all_basis: false,
            idempotency_token: idempotency_token.to_string(),
        };
        match self.peer.call(request, self.rpc_timeout).map_err(Error::from)? {
            RpcResponse::AlignmentMarkers { markers } => Ok(markers),
            _ => Err(Error::ProtocolMismatch("unexpected response to GetAlignmentMarkers".into())),
        }
    }

    fn count_marker_hits(&self, report: &DetectionReport, drift: i64, markers: &std::collections::HashMap<u32, Qubit>) -> usize {
        let mut hits = 0;
        for detection in &report.detections {
            if let Some(slot) = self.params.slot_for_offset(detection.time_offset_ps, drift) {
                if let Some(expected) = markers.get(&slot) {
                    if *expected == detection.measured_qubit {
                        hits += 1;
                    }
                }
            }
        }
        hits
    }

    /// First-wins slot assignment, excluding marker slots (already
    /// disclosed, so not usable key material), then tells the
    /// transmitter which slots to keep.
    fn finish_frame(&self, report: &DetectionReport, drift: i64, markers: &std::collections::HashMap<u32, Qubit>) -> Result<Vec<Qubit>> {
        let mut slots: std::collections::HashMap<u32, Qubit> = std::collections::HashMap::new();
        for detection in &report.detections {
            if let Some(slot) = self.params.slot_for_offset(detection.time_offset_ps, drift) {
                if markers.contains_key(&slot) {
                    continue;
                }
                slots.entry(slot).or_insert(detection.measured_qubit);
            }
        }

        let mut ordered: Vec<(u32, Qubit)> = slots.into_iter().collect();
        ordered.sort_by_key(|(slot, _)| *slot);
        let valid_slots: Vec<u32> = ordered.iter().map(|(slot, _)| *slot).collect();

        let request = RpcRequest::DiscardTransmissions { frame_id: report.frame_id, valid_slots };
        self.peer.call(request, self.rpc_timeout).map_err(Error::from)?;

        Ok(ordered.into_iter().map(|(_, q)| q).collect())
    }
}

fn ewma_update(previous: i64, sample: i64, weight: f64) -> i64 {
    (previous as f64 * (1.0 - weight) + sample as f64 * weight).round() as i64
}
