//! # Qubit
//!
//! The basic unit of the BB84-style preparation this pipeline assumes:
//! a value in `{0,1,2,3}` encoding `(basis, bit)` as `basis*2 + bit`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Measurement basis. Rectilinear = 0, Diagonal = 1.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Basis {
    Rectilinear = 0,
    Diagonal = 1,
}

impl Basis {
    #[inline]
    pub fn get(value: u8) -> Option<Basis> {
        match value {
            0 => Some(Basis::Rectilinear),
            1 => Some(Basis::Diagonal),
            _ => None,
        }
    }
}

/// A prepared or measured qubit: `basis*2 + bit`, immutable once produced.
///
/// This is transmitted on the wire as an integer in `[0,3]`; any other
/// value is a `ProtocolMismatch` error.
#[derive(Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Qubit(u8);

pub const QUBIT_MIN: u8 = 0;
pub const QUBIT_MAX: u8 = 3;

impl Qubit {
    /// Construct a `Qubit` from its wire value. Returns `None` if the
    /// value is outside `[0,3]`.
    #[inline]
    pub fn new(value: u8) -> Option<Qubit> {
        if value <= QUBIT_MAX {
            Some(Qubit(value))
        } else {
            None
        }
    }

    /// Construct a `Qubit` from an explicit `(basis, bit)` pair.
    #[inline]
    pub fn from_basis_bit(basis: Basis, bit: u8) -> Qubit {
        debug_assert!(bit <= 1);
        Qubit((basis as u8) * 2 + (bit & 1))
    }

    /// The wire value in `[0,3]`.
    #[inline]
    pub fn value(&self) -> u8 {
        self.0
    }

    /// `basis(q) = q >> 1`.
    #[inline]
    pub fn basis(&self) -> Basis {
        if self.0 >> 1 == 0 {
            Basis::Rectilinear
        } else {
            Basis::Diagonal
        }
    }

    /// `bit(q) = q & 1`.
    #[inline]
    pub fn bit(&self) -> u8 {
        self.0 & 1
    }
}

impl fmt::Debug for Qubit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Qubit({}, basis={:?}, bit={})", self.0, self.basis(), self.bit())
    }
}

/// A finite ordered sequence of qubits. The length of one transmitted
/// frame is fixed at session-start time.
pub type QubitSequence = Vec<Qubit>;

/// An integer in `[0, frame_slot_count)` identifying which transmission
/// slot within a frame a detection or emission belongs to.
pub type SlotIndex = u32;
