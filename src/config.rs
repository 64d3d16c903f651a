//! # Session configuration
//!
//! The recognized session options, with their default values. Loadable
//! from a TOML file or built programmatically.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Which role this peer plays in the session.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Transmitter,
    Detector,
}

/// Full session configuration. Every field has a sensible default
/// via `Default`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub side: Side,

    /// Slots per frame.
    pub frame_slot_count: u32,

    pub slot_width_ps: u64,
    pub pulse_width_ps: u64,
    pub frame_width_ps: u64,
    pub max_drift_ps_per_second: i64,
    pub acceptance_ratio: f64,

    /// Sifter batching: contiguous frames accumulated before a verify
    /// round is issued.
    pub min_frames_before_verify: u32,

    /// Packager output size in bytes.
    pub key_size_bytes: usize,

    /// Safety margin subtracted during privacy amplification, in bits.
    pub privacy_security_margin_bits: usize,

    /// Which side sends `SessionStarting` (and so, on a transmitter,
    /// delays local emission) before the other begins. Both peers must agree on this
    /// bit out of band; the controller does not infer it.
    pub detector_goes_first: bool,

    /// EWMA weight for the detector's drift estimate update.
    pub drift_ewma_weight: f64,

    /// Peer connect timeout, in milliseconds.
    pub connect_timeout_ms: u64,

    /// Sifter wait-for-local-frame timeout, in milliseconds.
    pub sifter_wait_ms: u64,

    /// Stage-loop idle timeout, in milliseconds (bounded wait so a
    /// stage can observe `should_stop`).
    pub stage_idle_timeout_ms: u64,

    /// Base `key_id` the packager's sequence starts from.
    pub key_id_base: u64,

    /// Block size, in bits, for the error-correction parity cascade.
    pub ec_block_size_bits: usize,

    /// Estimated QBER above which reconciliation is abandoned rather
    /// than continued. 0.11 is the standard BB84
    /// abort threshold.
    pub qber_threshold: f64,
}

impl Default for Side {
    fn default() -> Self {
        Side::Transmitter
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            side: Side::Transmitter,
            frame_slot_count: 1024,
            slot_width_ps: 100_000,
            pulse_width_ps: 1_000,
            frame_width_ps: 1024 * 100_000,
            max_drift_ps_per_second: 1_000_000,
            acceptance_ratio: 0.9,
            min_frames_before_verify: 1,
            key_size_bytes: 16,
            privacy_security_margin_bits: 64,
            detector_goes_first: false,
            drift_ewma_weight: 0.25,
            connect_timeout_ms: 10_000,
            sifter_wait_ms: 500,
            stage_idle_timeout_ms: 1_000,
            key_id_base: 1,
            ec_block_size_bits: 16,
            qber_threshold: 0.11,
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file, falling back to the
    /// built-in defaults for any option the file omits.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<SessionConfig> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|e| Error::Internal(format!("invalid config: {}", e)))
    }

    pub fn system_parameters(&self) -> crate::reports::SystemParameters {
        crate::reports::SystemParameters {
            frame_width_ps: self.frame_width_ps,
            slot_width_ps: self.slot_width_ps,
            pulse_width_ps: self.pulse_width_ps,
            max_drift_ps_per_second: self.max_drift_ps_per_second,
            acceptance_ratio: self.acceptance_ratio,
            frame_slot_count: self.frame_slot_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = SessionConfig::default();
        assert_eq!(cfg.frame_slot_count, 1024);
        assert_eq!(cfg.key_size_bytes, 16);
        assert_eq!(cfg.min_frames_before_verify, 1);
        assert!((cfg.acceptance_ratio - 0.9).abs() < f64::EPSILON);
        assert!((cfg.drift_ewma_weight - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn partial_toml_fills_remaining_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.toml");
        std::fs::write(&path, "side = \"detector\"\nkey_size_bytes = 32\n").unwrap();

        let cfg = SessionConfig::from_toml_file(&path).unwrap();
        assert_eq!(cfg.side, Side::Detector);
        assert_eq!(cfg.key_size_bytes, 32);
        assert_eq!(cfg.frame_slot_count, 1024);
    }
}
