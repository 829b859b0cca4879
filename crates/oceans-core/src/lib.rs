//! # Oceans Core
//!
//! Shared vocabulary for the epoch incentive pipeline:
//!
//! - **Types**: targets, holders, participants, positions, reference points
//! - **Fixed point**: [`Weight`] and exact integer helpers used by every
//!   weight and reward computation
//! - **Epoch status**: the coordinator state machine
//! - **Sources**: point-in-time interfaces to the external collaborators
//!   (vote store, stake snapshot, registry, chain, price oracle)
//!
//! Nothing in this crate performs I/O.

pub mod epoch;
pub mod error;
pub mod fixed;
pub mod sources;
pub mod types;

pub use epoch::EpochStatus;
pub use error::{OceansError, Result};
pub use fixed::{Weight, PRICE_SCALE, WEIGHT_SCALE};
pub use types::*;
