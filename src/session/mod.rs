//! Session lifecycle: the connector and key-agreement
//! bootstrap feed into a single controller that both a transmitter and
//! a detector process construct, distinguished only by config.

pub mod controller;

pub use controller::{SessionController, SessionState};
