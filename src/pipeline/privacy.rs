//! # Privacy amplification
//!
//! Compresses reconciled bits through a two-universal (Toeplitz) hash
//! so that an eavesdropper's information about the disclosed parity
//! bits and the corrected bit itself, taken together, gives no useful
//! information about the output. The hash matrix is
//! derived deterministically from the session's ECDH shared secret
//! plus a fresh per-round nonce exchanged over `PrivacyAmplifySeedExchange`,
//! so both sides build the identical matrix without ever sending it.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use crate::bitblock::JaggedBitBlock;
use crate::error::{Error, Result};
use crate::net::keyagreement::KeyAgreement;
use crate::net::rpc::{RequestHandler, RpcChannel, RpcError, RpcRequest, RpcResponse, StatusCode};
use crate::pipeline::errorcorrect::CorrectedBlock;
use crate::rng::RandomSource;
use crate::stats::StatsHub;

/// A finished key block, still to be packaged.
#[derive(Debug, Clone)]
pub struct AmplifiedBlock {
    pub sift_seq: u64,
    pub bits: JaggedBitBlock,
}

fn toeplitz_diagonal(seed: &[u8], len: usize) -> Vec<bool> {
    let mut seed_arr = [0u8; 32];
    let copy_len = seed.len().min(32);
    seed_arr[..copy_len].copy_from_slice(&seed[..copy_len]);
    let mut rng = StdRng::from_seed(seed_arr);
    let mut bytes = vec![0u8; (len + 7) / 8];
    rng.fill_bytes(&mut bytes);
    (0..len).map(|i| (bytes[i / 8] >> (i % 8)) & 1 != 0).collect()
}

/// Multiply the Toeplitz matrix built from `diag` by `input`, producing
/// `out_len` output bits. `diag` must have length `in_len + out_len - 1`.
fn toeplitz_hash(diag: &[bool], input: &[bool], out_len: usize) -> Vec<bool> {
    let in_len = input.len();
    (0..out_len)
        .map(|i| {
            (0..in_len).fold(false, |acc, j| {
                let diag_idx = i + (in_len - 1) - j;
                acc ^ (diag[diag_idx] && input[j])
            })
        })
        .collect()
}

/// Output length after subtracting disclosed parity bits and the
/// configured safety margin, clamped to zero.
fn output_len(in_len: usize, leaked_bits: usize, security_margin_bits: usize) -> usize {
    in_len.saturating_sub(leaked_bits).saturating_sub(security_margin_bits)
}

fn amplify_with_seed(seed: &[u8], corrected: &CorrectedBlock, security_margin_bits: usize) -> JaggedBitBlock {
    let input: Vec<bool> = corrected.bits.iter().collect();
    let out_len = output_len(input.len(), corrected.leaked_bits, security_margin_bits);
    if out_len == 0 || input.is_empty() {
        return JaggedBitBlock::new();
    }
    let diag = toeplitz_diagonal(seed, input.len() + out_len - 1);
    JaggedBitBlock::from_bits(&toeplitz_hash(&diag, &input, out_len))
}

/// Transmitter-side (initiator): picks a fresh nonce per sift sequence,
/// exchanges it, then hashes locally.
pub struct TransmitterPrivacyAmplifier {
    key_agreement: std::sync::Arc<KeyAgreement>,
    token: String,
    security_margin_bits: usize,
    peer: std::sync::Arc<RpcChannel>,
    rpc_timeout: Duration,
    to_packager: crossbeam_channel::Sender<AmplifiedBlock>,
    stats: std::sync::Arc<StatsHub>,
}

impl TransmitterPrivacyAmplifier {
    pub fn new(
        key_agreement: std::sync::Arc<KeyAgreement>,
        token: String,
        security_margin_bits: usize,
        peer: std::sync::Arc<RpcChannel>,
        rpc_timeout: Duration,
        to_packager: crossbeam_channel::Sender<AmplifiedBlock>,
        stats: std::sync::Arc<StatsHub>,
    ) -> TransmitterPrivacyAmplifier {
        TransmitterPrivacyAmplifier {
            key_agreement,
            token,
            security_margin_bits,
            peer,
            rpc_timeout,
            to_packager,
            stats,
        }
    }

    pub fn process(&self, corrected: CorrectedBlock, rng: &mut dyn RandomSource) -> Result<()> {
        let sift_seq = corrected.sift_seq;
        let mut nonce = [0u8; 16];
        rng.fill_bytes(&mut nonce);

        let response = self
            .peer
            .call(
                RpcRequest::PrivacyAmplifySeedExchange { sift_seq, seed_material: nonce.to_vec() },
                self.rpc_timeout,
            )
            .map_err(Error::from)?;
        if !matches!(response, RpcResponse::PrivacyAmplifySeedAck) {
            return Err(Error::ProtocolMismatch("unexpected response to PrivacyAmplifySeedExchange".into()));
        }

        let info = seed_info(sift_seq, &nonce);
        let seed = self.key_agreement.derive_seed(&self.token, &info, 32)?;
        let bits = amplify_with_seed(&seed, &corrected, self.security_margin_bits);
        self.stats.incr_by("privacy_output_bits", bits.bit_len() as u64);

        self.to_packager
            .send(AmplifiedBlock { sift_seq, bits })
            .map_err(|_| Error::SessionFaulted("packager input channel closed".into()))
    }
}

fn seed_info(sift_seq: u64, nonce: &[u8]) -> Vec<u8> {
    let mut info = Vec::with_capacity(8 + nonce.len());
    info.extend_from_slice(&sift_seq.to_le_bytes());
    info.extend_from_slice(nonce);
    info
}

/// Detector-side (responder): holds the locally error-corrected block
/// until the transmitter's nonce arrives, then hashes and forwards it.
pub struct DetectorPrivacyAmplifier {
    key_agreement: std::sync::Arc<KeyAgreement>,
    token: String,
    security_margin_bits: usize,
    pending: Mutex<HashMap<u64, CorrectedBlock>>,
    wait_timeout: Duration,
    to_packager: crossbeam_channel::Sender<AmplifiedBlock>,
    stats: std::sync::Arc<StatsHub>,
}

impl DetectorPrivacyAmplifier {
    pub fn new(
        key_agreement: std::sync::Arc<KeyAgreement>,
        token: String,
        security_margin_bits: usize,
        wait_timeout: Duration,
        to_packager: crossbeam_channel::Sender<AmplifiedBlock>,
        stats: std::sync::Arc<StatsHub>,
    ) -> DetectorPrivacyAmplifier {
        DetectorPrivacyAmplifier {
            key_agreement,
            token,
            security_margin_bits,
            pending: Mutex::new(HashMap::new()),
            wait_timeout,
            to_packager,
            stats,
        }
    }

    pub fn ingest(&self, corrected: CorrectedBlock) {
        self.pending.lock().unwrap().insert(corrected.sift_seq, corrected);
    }

    fn wait_for_block(&self, sift_seq: u64) -> Option<CorrectedBlock> {
        let deadline = Instant::now() + self.wait_timeout;
        loop {
            if let Some(block) = self.pending.lock().unwrap().remove(&sift_seq) {
                return Some(block);
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn handle_seed_exchange(&self, sift_seq: u64, seed_material: Vec<u8>) -> std::result::Result<RpcResponse, RpcError> {
        let corrected = self
            .wait_for_block(sift_seq)
            .ok_or_else(|| RpcError::new(StatusCode::FailedPrecondition, format!("no locally corrected block for sift sequence {}", sift_seq)))?;

        let info = seed_info(sift_seq, &seed_material);
        let seed = self
            .key_agreement
            .derive_seed(&self.token, &info, 32)
            .map_err(|e| RpcError::new(StatusCode::FailedPrecondition, format!("{}", e)))?;
        let bits = amplify_with_seed(&seed, &corrected, self.security_margin_bits);
        self.stats.incr_by("privacy_output_bits", bits.bit_len() as u64);

        self.to_packager
            .send(AmplifiedBlock { sift_seq, bits })
            .map_err(|_| RpcError::new(StatusCode::Aborted, "packager input channel closed"))?;

        Ok(RpcResponse::PrivacyAmplifySeedAck)
    }
}

impl RequestHandler for DetectorPrivacyAmplifier {
    fn handle(&self, request: RpcRequest) -> std::result::Result<RpcResponse, RpcError> {
        match request {
            RpcRequest::PrivacyAmplifySeedExchange { sift_seq, seed_material } => self.handle_seed_exchange(sift_seq, seed_material),
            _ => Err(RpcError::new(StatusCode::NotFound, "not a PrivacyAmplifySeedExchange request")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::keyagreement::SharedKeyAgreementHandler;
    use crate::net::rpc::{Dispatcher, RpcServer};
    use crate::rng::SeededRandomSource;
    use std::sync::Arc;

    /// Run a real key-agreement handshake over a loopback RPC server so
    /// both sides end up with the same shared secret under `token`.
    fn shared_key_agreements() -> (Arc<KeyAgreement>, Arc<KeyAgreement>, String) {
        let responder = Arc::new(KeyAgreement::new());
        let dispatcher = Dispatcher::new();
        dispatcher.register(Arc::new(SharedKeyAgreementHandler::new(Arc::clone(&responder))));
        let server = RpcServer::bind("127.0.0.1:0", dispatcher).unwrap();
        let addr = server.local_addr().to_string();

        let initiator = Arc::new(KeyAgreement::new());
        let channel = RpcChannel::connect(&addr, Duration::from_secs(1)).unwrap();
        let token = initiator.initiate(&channel, Duration::from_secs(1)).unwrap();
        server.stop();
        (initiator, responder, token)
    }

    #[test]
    fn output_shrinks_by_leaked_bits_and_margin() {
        assert_eq!(output_len(100, 10, 20), 70);
        assert_eq!(output_len(10, 5, 10), 0);
    }

    #[test]
    fn both_sides_compute_the_same_amplified_bits() {
        let (agreement_a, agreement_b, token) = shared_key_agreements();

        let corrected = CorrectedBlock {
            sift_seq: 42,
            bits: JaggedBitBlock::from_bits(&[true, false, true, true, false, false, true, false, true, true, false, true]),
            leaked_bits: 2,
        };

        let (tx_b, rx_b) = crossbeam_channel::unbounded();
        let responder = Arc::new(DetectorPrivacyAmplifier::new(agreement_b, token.clone(), 2, Duration::from_millis(200), tx_b, Arc::new(StatsHub::new())));
        responder.ingest(corrected.clone());

        let dispatcher = Dispatcher::new();
        dispatcher.register(Arc::clone(&responder) as Arc<dyn RequestHandler>);
        let server = RpcServer::bind("127.0.0.1:0", dispatcher).unwrap();
        let addr = server.local_addr().to_string();
        let channel = RpcChannel::connect(&addr, Duration::from_secs(1)).unwrap();

        let (tx_a, rx_a) = crossbeam_channel::unbounded();
        let initiator = TransmitterPrivacyAmplifier::new(agreement_a, token, 2, channel, Duration::from_secs(1), tx_a, Arc::new(StatsHub::new()));
        let mut rng = SeededRandomSource::from_seed(5);
        initiator.process(corrected, &mut rng).unwrap();

        let out_a = rx_a.recv_timeout(Duration::from_secs(1)).unwrap();
        let out_b = rx_b.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(out_a.sift_seq, 42);
        assert_eq!(out_a.bits.iter().collect::<Vec<_>>(), out_b.bits.iter().collect::<Vec<_>>());
        assert_eq!(out_a.bits.bit_len(), 12 - 2 - 2);
        server.stop();
    }
}
