//! # Transmitter store
//!
//! Stores each `EmitterReport` by frame id until the detector has
//! discarded the slots it could not use; serves alignment markers to
//! help the detector lock onto the transmission.

use std::collections::HashMap;
use std::sync::Mutex;

use crossbeam_channel::Sender;

use crate::error::{Error, Result};
use crate::frame::FrameId;
use crate::net::rpc::{RequestHandler, RpcError, RpcRequest, RpcResponse, StatusCode};
use crate::qubit::Qubit;
use crate::reports::EmitterReport;
use crate::rng::RandomSource;
use crate::stats::StatsHub;

/// Default number of slots disclosed as alignment markers when the
/// detector does not ask for every slot's basis.
pub const DEFAULT_MARKER_COUNT: u32 = 32;

struct MarkerCacheKey {
    frame_id: FrameId,
    marker_count: u32,
    idempotency_token: String,
}

impl PartialEq for MarkerCacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.frame_id == other.frame_id
            && self.marker_count == other.marker_count
            && self.idempotency_token == other.idempotency_token
    }
}
impl Eq for MarkerCacheKey {}
impl std::hash::Hash for MarkerCacheKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.frame_id.hash(state);
        self.marker_count.hash(state);
        self.idempotency_token.hash(state);
    }
}

/// A frame handed to the local sifter-tx: the slots that survived the
/// detector's discard, in original (ascending slot) order.
pub struct SiftedEmission {
    pub frame_id: FrameId,
    pub qubits: Vec<Qubit>,
}

/// Per-session store of emitted frames, awaiting the detector's
/// `DiscardTransmissions` before handing trimmed qubits to the local
/// sifter.
pub struct TransmitterStore<R: RandomSource> {
    reports: Mutex<HashMap<FrameId, EmitterReport>>,
    marker_cache: Mutex<HashMap<MarkerCacheKey, HashMap<u32, Qubit>>>,
    rng: Mutex<R>,
    to_sifter: Sender<SiftedEmission>,
    stats: std::sync::Arc<StatsHub>,
}

impl<R: RandomSource> TransmitterStore<R> {
    pub fn new(rng: R, to_sifter: Sender<SiftedEmission>, stats: std::sync::Arc<StatsHub>) -> TransmitterStore<R> {
        TransmitterStore {
            reports: Mutex::new(HashMap::new()),
            marker_cache: Mutex::new(HashMap::new()),
            rng: Mutex::new(rng),
            to_sifter,
            stats,
        }
    }

    /// Store an `EmitterReport` by frame id.
    pub fn store(&self, report: EmitterReport) {
        self.reports.lock().unwrap().insert(report.frame_id, report);
    }

    /// Serve `GetAlignmentMarkers`: select `count` slot indices uniformly
    /// at random (or all slots if `send_all_basis`), returning the
    /// qubit at each. Repeats with the same `(frame_id, count,
    /// idempotency_token)` return the same marker set.
    pub fn get_alignment_markers(
        &self,
        frame_id: FrameId,
        count: u32,
        send_all_basis: bool,
        idempotency_token: &str,
    ) -> Result<HashMap<u32, Qubit>> {
        let key = MarkerCacheKey {
            frame_id,
            marker_count: count,
            idempotency_token: idempotency_token.to_string(),
        };
        if let Some(cached) = self.marker_cache.lock().unwrap().get(&key) {
            return Ok(cached.clone());
        }

        let reports = self.reports.lock().unwrap();
        let report = reports
            .get(&frame_id)
            .ok_or_else(|| Error::frame_abandoned(frame_id.0, "no emitter report for alignment markers"))?;

        let slot_count = report.emissions.len() as u32;
        let slots = if send_all_basis {
            (0..slot_count).collect::<Vec<_>>()
        } else {
            self.rng.lock().unwrap().sample_distinct_slots(slot_count, count)
        };

        let markers: HashMap<u32, Qubit> = slots
            .into_iter()
            .map(|slot| (slot, report.emissions[slot as usize]))
            .collect();

        self.marker_cache.lock().unwrap().insert(key, markers.clone());
        self.stats.incr("store_markers_served");
        Ok(markers)
    }

    /// Serve `DiscardTransmissions`: keep only the qubits at
    /// `valid_slots` (in original order), hand them to the local sifter,
    /// and release the full report. A second identical call on an
    /// already-trimmed or released frame is a no-op.
    pub fn discard_transmissions(&self, frame_id: FrameId, valid_slots: &[u32]) -> Result<()> {
        let report = self.reports.lock().unwrap().remove(&frame_id);
        let report = match report {
            Some(r) => r,
            None => return Ok(()), // already trimmed/released: no-op.
        };

        let mut sorted_slots = valid_slots.to_vec();
        sorted_slots.sort_unstable();
        sorted_slots.dedup();

        let qubits: Vec<Qubit> = sorted_slots
            .iter()
            .filter_map(|&slot| report.emissions.get(slot as usize).copied())
            .collect();

        self.stats.incr_by("store_slots_kept", qubits.len() as u64);
        self.to_sifter
            .send(SiftedEmission { frame_id, qubits })
            .map_err(|_| Error::SessionFaulted("sifter input channel closed".into()))
    }
}

/// Adapter so a `TransmitterStore` can be registered with a `Dispatcher`
/// to serve `GetAlignmentMarkers`/`DiscardTransmissions`.
pub struct TransmitterStoreHandler<R: RandomSource + Send> {
    store: std::sync::Arc<TransmitterStore<R>>,
}

impl<R: RandomSource + Send> TransmitterStoreHandler<R> {
    pub fn new(store: std::sync::Arc<TransmitterStore<R>>) -> TransmitterStoreHandler<R> {
        TransmitterStoreHandler { store }
    }
}

impl<R: RandomSource + Send + Sync + 'static> RequestHandler for TransmitterStoreHandler<R> {
    fn handle(&self, request: RpcRequest) -> std::result::Result<RpcResponse, RpcError> {
        match request {
            RpcRequest::GetAlignmentMarkers { frame_id, marker_count, send_all_basis, idempotency_token } => self
                .store
                .get_alignment_markers(frame_id, marker_count, send_all_basis, &idempotency_token)
                .map(|markers| RpcResponse::AlignmentMarkers { markers })
                .map_err(|e| RpcError::new(StatusCode::FailedPrecondition, format!("{}", e))),
            RpcRequest::DiscardTransmissions { frame_id, valid_slots } => self
                .store
                .discard_transmissions(frame_id, &valid_slots)
                .map(|_| RpcResponse::Empty)
                .map_err(|e| RpcError::new(StatusCode::FailedPrecondition, format!("{}", e))),
            _ => Err(RpcError::new(StatusCode::NotFound, "not a TransmitterStore request")),
        }
    }
}
