//! # Sifting
//!
//! Basis reconciliation over the public channel: each side discloses
//! its bases (never its bits), keeps the bits where both sides chose
//! the same basis, and packs the survivors into a `JaggedBitBlock`
//! tagged with a monotonic sift sequence number.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};

use crate::bitblock::JaggedBitBlock;
use crate::error::{Error, Result};
use crate::frame::{is_contiguous_ascending, FrameId};
use crate::net::rpc::{RequestHandler, RpcChannel, RpcError, RpcRequest, RpcResponse, StatusCode};
use crate::qubit::Qubit;
use crate::stats::StatsHub;

/// A sifted block handed to error correction, tagged with the sequence
/// number both sides agree on.
#[derive(Debug, Clone)]
pub struct SiftedBlock {
    pub sift_seq: u64,
    pub bits: JaggedBitBlock,
}

/// Transmitter-side sifter: the client that drives `VerifyBases`.
///
/// Buffers incoming `(FrameId, Vec<Qubit>)` batches from the
/// transmitter store until a contiguous ascending run of at least
/// `min_frames_before_verify` frames is available, then discloses bases and applies the peer's
/// answers.
pub struct TransmitterSifter {
    min_frames_before_verify: u32,
    next_expected: Mutex<FrameId>,
    pending: Mutex<BTreeMap<FrameId, Vec<Qubit>>>,
    ready: Mutex<Vec<(FrameId, Vec<Qubit>)>>,
    next_sift_seq: Mutex<u64>,
    peer: std::sync::Arc<RpcChannel>,
    rpc_timeout: Duration,
    to_error_correction: Sender<SiftedBlock>,
    stats: std::sync::Arc<StatsHub>,
}

impl TransmitterSifter {
    pub fn new(
        min_frames_before_verify: u32,
        peer: std::sync::Arc<RpcChannel>,
        rpc_timeout: Duration,
        to_error_correction: Sender<SiftedBlock>,
        stats: std::sync::Arc<StatsHub>,
    ) -> TransmitterSifter {
        TransmitterSifter {
            min_frames_before_verify: min_frames_before_verify.max(1),
            next_expected: Mutex::new(FrameId(1)),
            pending: Mutex::new(BTreeMap::new()),
            ready: Mutex::new(Vec::new()),
            next_sift_seq: Mutex::new(1),
            peer,
            rpc_timeout,
            to_error_correction,
            stats,
        }
    }

    /// Feed one frame's surviving qubits in. Flushes a verify round once
    /// enough contiguous frames have accumulated.
    pub fn ingest(&self, frame_id: FrameId, qubits: Vec<Qubit>) -> Result<()> {
        self.pending.lock().unwrap().insert(frame_id, qubits);
        self.drain_contiguous();

        let should_flush = self.ready.lock().unwrap().len() as u32 >= self.min_frames_before_verify;
        if should_flush {
            self.flush()
        } else {
            Ok(())
        }
    }

    fn drain_contiguous(&self) {
        let mut next_expected = self.next_expected.lock().unwrap();
        let mut pending = self.pending.lock().unwrap();
        let mut ready = self.ready.lock().unwrap();
        while let Some(qubits) = pending.remove(&*next_expected) {
            ready.push((*next_expected, qubits));
            *next_expected = next_expected.next();
        }
    }

    fn flush(&self) -> Result<()> {
        let batch: Vec<(FrameId, Vec<Qubit>)> = std::mem::take(&mut *self.ready.lock().unwrap());
        if batch.is_empty() {
            return Ok(());
        }
        debug_assert!(is_contiguous_ascending(&batch.iter().map(|(id, _)| *id).collect::<Vec<_>>()));

        let sift_seq = {
            let mut next = self.next_sift_seq.lock().unwrap();
            let seq = *next;
            *next += 1;
            seq
        };

        let bases: HashMap<u64, Vec<u8>> = batch
            .iter()
            .map(|(id, qubits)| (id.0, qubits.iter().map(|q| q.basis() as u8).collect()))
            .collect();

        let response = self
            .peer
            .call(RpcRequest::VerifyBases { sift_seq, bases }, self.rpc_timeout)
            .map_err(Error::from)?;
        let answers = match response {
            RpcResponse::SiftAnswers { answers } => answers,
            _ => return Err(Error::ProtocolMismatch("unexpected response to VerifyBases".into())),
        };

        let mut bits = JaggedBitBlock::new();
        for (frame_id, qubits) in &batch {
            let matches = answers.get(&frame_id.0).ok_or_else(|| {
                Error::LengthMismatch { frame_id: frame_id.0, expected: qubits.len(), actual: 0 }
            })?;
            if matches.len() != qubits.len() {
                return Err(Error::LengthMismatch {
                    frame_id: frame_id.0,
                    expected: qubits.len(),
                    actual: matches.len(),
                });
            }
            for (qubit, &matched) in qubits.iter().zip(matches.iter()) {
                if matched {
                    bits.push_bit(qubit.bit() != 0);
                }
            }
        }

        self.stats.incr("sifter_batches_flushed");
        self.stats.incr_by("sifter_bits_kept", bits.bit_len() as u64);
        self.to_error_correction
            .send(SiftedBlock { sift_seq, bits })
            .map_err(|_| Error::SessionFaulted("error-correction input channel closed".into()))
    }
}

/// Receiver-side sifter: the server that answers `VerifyBases`.
///
/// Holds locally gated frames until the peer's bases arrive for them,
/// bounded by `wait_timeout`.
pub struct ReceiverSifter {
    pending: Mutex<HashMap<FrameId, Vec<Qubit>>>,
    wait_timeout: Duration,
    poll_interval: Duration,
    to_error_correction: Sender<SiftedBlock>,
    stats: std::sync::Arc<StatsHub>,
}

impl ReceiverSifter {
    pub fn new(wait_timeout: Duration, to_error_correction: Sender<SiftedBlock>, stats: std::sync::Arc<StatsHub>) -> ReceiverSifter {
        ReceiverSifter {
            pending: Mutex::new(HashMap::new()),
            wait_timeout,
            poll_interval: Duration::from_millis(5),
            to_error_correction,
            stats,
        }
    }

    pub fn ingest(&self, frame_id: FrameId, qubits: Vec<Qubit>) {
        self.pending.lock().unwrap().insert(frame_id, qubits);
    }

    /// Wait (bounded) for a locally gated frame to appear, for use by a
    /// drainer loop that pre-populates `pending` from a channel.
    pub fn drain_from(&self, rx: &Receiver<(FrameId, Vec<Qubit>)>) {
        while let Ok((frame_id, qubits)) = rx.try_recv() {
            self.ingest(frame_id, qubits);
        }
    }

    fn wait_for_frame(&self, frame_id: FrameId) -> Option<Vec<Qubit>> {
        let deadline = Instant::now() + self.wait_timeout;
        loop {
            if let Some(qubits) = self.pending.lock().unwrap().remove(&frame_id) {
                return Some(qubits);
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(self.poll_interval);
        }
    }

    fn handle_verify_bases(&self, sift_seq: u64, bases: HashMap<u64, Vec<u8>>) -> std::result::Result<RpcResponse, RpcError> {
        let mut answers = HashMap::with_capacity(bases.len());
        let mut bits = JaggedBitBlock::new();

        let mut frame_ids: Vec<u64> = bases.keys().copied().collect();
        frame_ids.sort_unstable();

        for frame_id_raw in frame_ids {
            let frame_id = FrameId(frame_id_raw);
            let peer_bases = &bases[&frame_id_raw];
            let local = self
                .wait_for_frame(frame_id)
                .ok_or_else(|| RpcError::new(StatusCode::Aborted, format!("no locally gated frame {}", frame_id_raw)))?;

            if local.len() != peer_bases.len() {
                return Err(RpcError::new(
                    StatusCode::OutOfRange,
                    format!("basis count mismatch for frame {}: local {} vs peer {}", frame_id_raw, local.len(), peer_bases.len()),
                ));
            }

            let matches: Vec<bool> = local
                .iter()
                .zip(peer_bases.iter())
                .map(|(qubit, &peer_basis)| qubit.basis() as u8 == peer_basis)
                .collect();

            for (qubit, &matched) in local.iter().zip(matches.iter()) {
                if matched {
                    bits.push_bit(qubit.bit() != 0);
                }
            }
            answers.insert(frame_id_raw, matches);
        }

        self.stats.incr("sifter_verify_rounds_answered");
        self.to_error_correction
            .send(SiftedBlock { sift_seq, bits })
            .map_err(|_| RpcError::new(StatusCode::Aborted, "error-correction input channel closed"))?;

        Ok(RpcResponse::SiftAnswers { answers })
    }
}

impl RequestHandler for ReceiverSifter {
    fn handle(&self, request: RpcRequest) -> std::result::Result<RpcResponse, RpcError> {
        match request {
            RpcRequest::VerifyBases { sift_seq, bases } => self.handle_verify_bases(sift_seq, bases),
            _ => Err(RpcError::new(StatusCode::NotFound, "not a VerifyBases request")),
        }
    }
}
