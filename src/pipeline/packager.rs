//! # Key packaging
//!
//! Slices the privacy-amplified bit stream into fixed-size key records,
//! carrying over any remainder below one key's worth of bits to the
//! next block, alongside hex/base64 display helpers for the finished key
//! bytes.

use std::sync::Mutex;

use base64::Engine;
use crossbeam_channel::Sender;

use crate::bitblock::JaggedBitBlock;
use crate::error::{Error, Result};
use crate::pipeline::privacy::AmplifiedBlock;
use crate::stats::StatsHub;

/// One finished key, ready to be handed to a consumer outside this
/// crate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRecord {
    pub key_id: u64,
    pub bytes: Vec<u8>,
}

impl KeyRecord {
    pub fn to_hex(&self) -> String {
        hex::encode(&self.bytes)
    }

    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.bytes)
    }
}

/// Packages amplified key bits into fixed-size `KeyRecord`s with a
/// monotonic `key_id` sequence.
pub struct KeyPackager {
    key_size_bytes: usize,
    next_key_id: Mutex<u64>,
    carry: Mutex<JaggedBitBlock>,
    publish: Sender<KeyRecord>,
    stats: std::sync::Arc<StatsHub>,
}

impl KeyPackager {
    pub fn new(key_size_bytes: usize, key_id_base: u64, publish: Sender<KeyRecord>, stats: std::sync::Arc<StatsHub>) -> KeyPackager {
        KeyPackager {
            key_size_bytes: key_size_bytes.max(1),
            next_key_id: Mutex::new(key_id_base),
            carry: Mutex::new(JaggedBitBlock::new()),
            publish,
            stats,
        }
    }

    /// Append one amplified block's bits to the carry-over buffer and
    /// publish every whole key that can be sliced off, in order.
    pub fn ingest(&self, block: AmplifiedBlock) -> Result<()> {
        let key_size_bits = self.key_size_bytes * 8;
        let mut carry = self.carry.lock().unwrap();
        carry.extend(&block.bits);

        while carry.bit_len() >= key_size_bits {
            let key_bits = carry.split_off_front(key_size_bits);
            let key_id = {
                let mut next = self.next_key_id.lock().unwrap();
                let id = *next;
                *next += 1;
                id
            };
            self.stats.incr("packager_keys_emitted");
            self.publish
                .send(KeyRecord { key_id, bytes: key_bits.bytes().to_vec() })
                .map_err(|_| Error::SessionFaulted("key-record publish channel closed".into()))?;
        }
        debug_assert!(carry.bit_len() < key_size_bits, "carry-over buffer must stay below one key's worth of bits");
        Ok(())
    }

    /// Number of bits currently held back, below one full key.
    pub fn carry_len(&self) -> usize {
        self.carry.lock().unwrap().bit_len()
    }
}
