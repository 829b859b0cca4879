//! # Oceans Position Observer
//!
//! Reads every registered participant's liquidity in every eligible target
//! at the epoch's reference block and values it in the common unit.
//!
//! ## Unit of Work
//!
//! One (participant, target) pair is one unit. Units run through a bounded
//! [`WorkerPool`] so the chain client never sees more than
//! `max_concurrency` reads at once, and a failing unit only marks its own
//! position unavailable.
//!
//! ```text
//! registry ──► participants × eligible targets ──► WorkerPool ──► chain read
//!                                                                    │
//!                                          oracle quote (cached) ◄───┘
//!                                                   │
//!                                                   ▼
//!                                   Position { Available | Unavailable }
//! ```

pub mod observer;
pub mod pool;

pub use observer::{
    ExcludedParticipant, Observation, ObserverConfig, PositionObserver, UnitFailure,
};
pub use pool::WorkerPool;
