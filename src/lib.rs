//! # qkd-postproc
//!
//! A post-processing pipeline for Quantum Key Distribution: alignment,
//! sifting, error correction, privacy amplification and key packaging,
//! run between a transmitter (Alice) and a detector (Bob) peer over an
//! authenticated two-way RPC session.
//!
//! This crate does not generate or measure photons, nor does it provide
//! the authenticated classical channel itself — it
//! implements everything from the point a device driver hands it an
//! `EmitterReport`/`DetectionReport` through to delivering packaged
//! `KeyRecord`s to a key consumer.
//!
//! [`session::SessionController`] is the entry point: it carries a pair
//! of peers through connection setup, key-agreement bootstrap and the
//! session lifecycle; [`pipeline`] holds the six post-processing stages
//! it wires together once a session starts.

pub mod bitblock;
pub mod config;
pub mod error;
pub mod frame;
pub mod net;
pub mod pipeline;
pub mod qubit;
pub mod reports;
pub mod rng;
pub mod session;
pub mod stats;
pub mod worker;

pub use config::{Side, SessionConfig};
pub use error::{Error, Result, Severity};
pub use session::{SessionController, SessionState};
