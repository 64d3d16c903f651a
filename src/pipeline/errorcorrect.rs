//! # Error correction
//!
//! Reconciles the transmitter's and detector's sifted bits over the
//! public channel without disclosing them directly: a binary parity
//! cascade. Each disclosed parity bit is leakage,
//! accounted for and handed to privacy amplification; an excessive
//! round-zero mismatch rate aborts reconciliation under the configured
//! QBER threshold.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};

use crate::bitblock::JaggedBitBlock;
use crate::error::{Error, Result};
use crate::net::rpc::{RequestHandler, RpcChannel, RpcError, RpcRequest, RpcResponse, StatusCode};
use crate::stats::StatsHub;

/// `(start, len)` into the flat bit vector for one block.
type Range = (u32, u32);

#[derive(Serialize, Deserialize)]
struct EcPayload {
    ranges: Vec<Range>,
    parities: Vec<bool>,
}

/// Reconciled bits ready for privacy amplification, with the total
/// number of bits disclosed while correcting them.
#[derive(Debug, Clone)]
pub struct CorrectedBlock {
    pub sift_seq: u64,
    pub bits: JaggedBitBlock,
    pub leaked_bits: usize,
}

const MAX_ROUNDS: u32 = 32;

fn parity(bits: &[bool], start: u32, len: u32) -> bool {
    bits[start as usize..(start + len) as usize].iter().fold(false, |acc, &b| acc ^ b)
}

fn partition(n: usize, block_size: usize) -> Vec<Range> {
    let mut ranges = Vec::new();
    let mut start = 0usize;
    while start < n {
        let len = block_size.min(n - start);
        ranges.push((start as u32, len as u32));
        start += len;
    }
    ranges
}

fn bisect(range: Range) -> (Range, Range) {
    let (start, len) = range;
    let left_len = len / 2;
    ((start, left_len), (start + left_len, len - left_len))
}

/// Transmitter-side (initiator) error correction: drives the cascade
/// and keeps its own bits unchanged throughout (this crate treats the
/// transmitter's bits as the reference, matching BB84's asymmetric
/// reconciliation convention).
pub struct TransmitterErrorCorrection {
    block_size: usize,
    qber_threshold: f64,
    peer: std::sync::Arc<RpcChannel>,
    rpc_timeout: Duration,
    to_privacy_amp: Sender<CorrectedBlock>,
    stats: std::sync::Arc<StatsHub>,
}

impl TransmitterErrorCorrection {
    pub fn new(
        block_size: usize,
        qber_threshold: f64,
        peer: std::sync::Arc<RpcChannel>,
        rpc_timeout: Duration,
        to_privacy_amp: Sender<CorrectedBlock>,
        stats: std::sync::Arc<StatsHub>,
    ) -> TransmitterErrorCorrection {
        TransmitterErrorCorrection {
            block_size: block_size.max(1),
            qber_threshold,
            peer,
            rpc_timeout,
            to_privacy_amp,
            stats,
        }
    }

    pub fn process(&self, sift_seq: u64, bits: JaggedBitBlock) -> Result<()> {
        let flat: Vec<bool> = bits.iter().collect();
        if flat.is_empty() {
            return self.forward(sift_seq, Vec::new(), 0);
        }

        let mut ranges = partition(flat.len(), self.block_size);
        let total_blocks = ranges.len();
        let mut leaked = 0usize;
        let mut round = 0u32;
        let mut first_round_mismatches = None;

        loop {
            if ranges.is_empty() {
                break;
            }
            let parities: Vec<bool> = ranges.iter().map(|&(s, l)| parity(&flat, s, l)).collect();
            leaked += parities.len();

            let payload = bincode::serialize(&EcPayload { ranges: ranges.clone(), parities })
                .map_err(|e| Error::Internal(format!("encode EC round: {}", e)))?;
            let response = self
                .peer
                .call(RpcRequest::ErrorCorrectRound { sift_seq, round, payload }, self.rpc_timeout)
                .map_err(Error::from)?;

            let (reply_payload, converged) = match response {
                RpcResponse::ErrorCorrectRound { payload, converged } => (payload, converged),
                _ => return Err(Error::ProtocolMismatch("unexpected response to ErrorCorrectRound".into())),
            };
            let matches: Vec<bool> = bincode::deserialize(&reply_payload)
                .map_err(|e| Error::Internal(format!("decode EC round reply: {}", e)))?;
            if matches.len() != ranges.len() {
                return Err(Error::ProtocolMismatch("EC round reply length mismatch".into()));
            }

            if round == 0 {
                first_round_mismatches = Some(matches.iter().filter(|&&m| !m).count());
            }

            let mut next_ranges = Vec::new();
            for (&range, &matched) in ranges.iter().zip(matches.iter()) {
                if matched {
                    continue;
                }
                if range.1 <= 1 {
                    continue; // single-bit mismatch: responder corrects itself.
                }
                let (left, right) = bisect(range);
                next_ranges.push(left);
                next_ranges.push(right);
            }
            ranges = next_ranges;

            if let Some(mismatches) = first_round_mismatches {
                let estimated_qber = mismatches as f64 / total_blocks as f64;
                if estimated_qber > self.qber_threshold {
                    log::warn!("sift sequence {} aborted: estimated QBER {:.3} exceeds threshold {:.3}", sift_seq, estimated_qber, self.qber_threshold);
                    self.stats.incr("ec_reconciliation_failed");
                    return Err(Error::ReconciliationFailed {
                        sift_seq,
                        reason: format!("estimated QBER {:.3} exceeds threshold {:.3}", estimated_qber, self.qber_threshold),
                    });
                }
            }

            if converged {
                break;
            }
            round += 1;
            if round > MAX_ROUNDS {
                log::warn!("sift sequence {} did not converge within {} rounds", sift_seq, MAX_ROUNDS);
                self.stats.incr("ec_reconciliation_failed");
                return Err(Error::ReconciliationFailed {
                    sift_seq,
                    reason: format!("did not converge within {} rounds", MAX_ROUNDS),
                });
            }
        }

        log::debug!("sift sequence {} reconciled over {} rounds, {} bits leaked", sift_seq, round + 1, leaked);
        self.stats.incr_by("ec_bits_leaked", leaked as u64);
        self.stats.incr_by("ec_rounds", (round + 1) as u64);
        self.forward(sift_seq, flat, leaked)
    }

    fn forward(&self, sift_seq: u64, flat_bits: Vec<bool>, leaked_bits: usize) -> Result<()> {
        self.to_privacy_amp
            .send(CorrectedBlock { sift_seq, bits: JaggedBitBlock::from_bits(&flat_bits), leaked_bits })
            .map_err(|_| Error::SessionFaulted("privacy-amplification input channel closed".into()))
    }
}

struct ReconcileState {
    corrected: Vec<bool>,
    leaked: usize,
}

/// Detector-side (responder) error correction: serves `ErrorCorrectRound`,
/// flipping its own bits to match single-bit mismatches.
pub struct DetectorErrorCorrection {
    state: Mutex<HashMap<u64, ReconcileState>>,
    to_privacy_amp: Sender<CorrectedBlock>,
    stats: std::sync::Arc<StatsHub>,
}

impl DetectorErrorCorrection {
    pub fn new(to_privacy_amp: Sender<CorrectedBlock>, stats: std::sync::Arc<StatsHub>) -> DetectorErrorCorrection {
        DetectorErrorCorrection {
            state: Mutex::new(HashMap::new()),
            to_privacy_amp,
            stats,
        }
    }

    /// Register this side's sifted bits for `sift_seq`, before the
    /// first `ErrorCorrectRound` request for it arrives.
    pub fn ingest(&self, sift_seq: u64, bits: JaggedBitBlock) {
        let flat: Vec<bool> = bits.iter().collect();
        self.state.lock().unwrap().insert(sift_seq, ReconcileState { corrected: flat, leaked: 0 });
    }

    fn handle_round(&self, sift_seq: u64, payload: Vec<u8>) -> std::result::Result<RpcResponse, RpcError> {
        let request: EcPayload = bincode::deserialize(&payload)
            .map_err(|e| RpcError::new(StatusCode::InvalidArgument, format!("decode EC round: {}", e)))?;

        let mut states = self.state.lock().unwrap();
        let state = states
            .get_mut(&sift_seq)
            .ok_or_else(|| RpcError::new(StatusCode::FailedPrecondition, format!("no local sifted bits for sift sequence {}", sift_seq)))?;

        if request.ranges.len() != request.parities.len() {
            return Err(RpcError::new(StatusCode::InvalidArgument, "EC round ranges/parities length mismatch"));
        }

        let mut matches = Vec::with_capacity(request.ranges.len());
        let mut active_remaining = 0usize;
        for (&(start, len), &their_parity) in request.ranges.iter().zip(request.parities.iter()) {
            if (start + len) as usize > state.corrected.len() {
                return Err(RpcError::new(StatusCode::OutOfRange, "EC round range out of bounds"));
            }
            let our_parity = parity(&state.corrected, start, len);
            let matched = our_parity == their_parity;
            matches.push(matched);
            if !matched {
                if len <= 1 {
                    state.corrected[start as usize] = their_parity;
                } else {
                    active_remaining += 1;
                }
            }
        }
        state.leaked += request.parities.len();

        let converged = active_remaining == 0;
        if converged {
            let corrected = std::mem::take(&mut state.corrected);
            let leaked = state.leaked;
            states.remove(&sift_seq);
            drop(states);
            self.stats.incr("ec_blocks_converged");
            self.to_privacy_amp
                .send(CorrectedBlock { sift_seq, bits: JaggedBitBlock::from_bits(&corrected), leaked_bits: leaked })
                .map_err(|_| RpcError::new(StatusCode::Aborted, "privacy-amplification input channel closed"))?;
        }

        let reply_payload = bincode::serialize(&matches)
            .map_err(|e| RpcError::new(StatusCode::InvalidArgument, format!("encode EC round reply: {}", e)))?;
        Ok(RpcResponse::ErrorCorrectRound { payload: reply_payload, converged })
    }
}

impl RequestHandler for DetectorErrorCorrection {
    fn handle(&self, request: RpcRequest) -> std::result::Result<RpcResponse, RpcError> {
        match request {
            RpcRequest::ErrorCorrectRound { sift_seq, round: _, payload } => self.handle_round(sift_seq, payload),
            _ => Err(RpcError::new(StatusCode::NotFound, "not an ErrorCorrectRound request")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::rpc::{Dispatcher, RpcServer};
    use std::sync::Arc;

    fn bits_from(values: &[bool]) -> JaggedBitBlock {
        JaggedBitBlock::from_bits(values)
    }

    #[test]
    fn identical_bits_converge_with_no_correction() {
        let values = [true, false, true, true, false, false, true, false, true, true, false, true];
        let (tx, rx) = crossbeam_channel::unbounded();
        let responder = Arc::new(DetectorErrorCorrection::new(tx, Arc::new(StatsHub::new())));
        responder.ingest(1, bits_from(&values));

        let dispatcher = Dispatcher::new();
        dispatcher.register(Arc::clone(&responder) as Arc<dyn RequestHandler>);
        let server = RpcServer::bind("127.0.0.1:0", dispatcher).unwrap();
        let addr = server.local_addr().to_string();
        let channel = RpcChannel::connect(&addr, Duration::from_secs(1)).unwrap();

        let (tx2, rx2) = crossbeam_channel::unbounded();
        let initiator = TransmitterErrorCorrection::new(4, 0.5, channel, Duration::from_secs(1), tx2, Arc::new(StatsHub::new()));
        initiator.process(1, bits_from(&values)).unwrap();

        let corrected_tx = rx2.recv_timeout(Duration::from_secs(1)).unwrap();
        let corrected_rx = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(corrected_tx.bits.iter().collect::<Vec<_>>(), values.to_vec());
        assert_eq!(corrected_rx.bits.iter().collect::<Vec<_>>(), values.to_vec());
        assert_eq!(corrected_tx.leaked_bits, corrected_rx.leaked_bits);
        server.stop();
    }

    #[test]
    fn single_bit_error_gets_corrected() {
        let reference = [true, false, true, true, false, false, true, false];
        let mut noisy = reference;
        noisy[5] = !noisy[5];

        let (tx, rx) = crossbeam_channel::unbounded();
        let responder = Arc::new(DetectorErrorCorrection::new(tx, Arc::new(StatsHub::new())));
        responder.ingest(7, bits_from(&noisy));

        let dispatcher = Dispatcher::new();
        dispatcher.register(Arc::clone(&responder) as Arc<dyn RequestHandler>);
        let server = RpcServer::bind("127.0.0.1:0", dispatcher).unwrap();
        let addr = server.local_addr().to_string();
        let channel = RpcChannel::connect(&addr, Duration::from_secs(1)).unwrap();

        let (tx2, rx2) = crossbeam_channel::unbounded();
        let initiator = TransmitterErrorCorrection::new(2, 0.5, channel, Duration::from_secs(1), tx2, Arc::new(StatsHub::new()));
        initiator.process(7, bits_from(&reference)).unwrap();

        let corrected_rx = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(corrected_rx.bits.iter().collect::<Vec<_>>(), reference.to_vec());
        let _ = rx2.recv_timeout(Duration::from_secs(1)).unwrap();
        server.stop();
    }

    #[test]
    fn excessive_mismatch_rate_aborts_reconciliation() {
        let reference = [true; 16];
        let mut noisy = reference;
        for i in (0..16).step_by(2) {
            noisy[i] = false;
        }

        let (tx, _rx) = crossbeam_channel::unbounded();
        let responder = Arc::new(DetectorErrorCorrection::new(tx, Arc::new(StatsHub::new())));
        responder.ingest(3, bits_from(&noisy));

        let dispatcher = Dispatcher::new();
        dispatcher.register(Arc::clone(&responder) as Arc<dyn RequestHandler>);
        let server = RpcServer::bind("127.0.0.1:0", dispatcher).unwrap();
        let addr = server.local_addr().to_string();
        let channel = RpcChannel::connect(&addr, Duration::from_secs(1)).unwrap();

        let (tx2, _rx2) = crossbeam_channel::unbounded();
        let initiator = TransmitterErrorCorrection::new(4, 0.1, channel, Duration::from_secs(1), tx2, Arc::new(StatsHub::new()));
        let result = initiator.process(3, bits_from(&reference));
        assert!(matches!(result, Err(Error::ReconciliationFailed { .. })));
        server.stop();
    }
}
