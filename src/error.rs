use std::time::Duration;

use crate::types::{StateKind, UnitId};

/// Failures of a single work-unit transition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("unknown work unit {0}")]
    NotFound(UnitId),
    #[error("work unit {id} is {state}")]
    Conflict { id: UnitId, state: StateKind },
    #[error("work unit store is full")]
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LeaseError {
    #[error("no work available")]
    NoWorkAvailable,
    #[error("lease ttl {ttl:?} runs past the end of the clock")]
    ExpiryOverflow { ttl: Duration },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Why a claimed hash was not accepted as a proof.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProofError {
    #[error("claimed hash does not match recomputed hash")]
    HashMismatch,
    #[error("hash has {actual} leading zero bits, {required} required")]
    InsufficientDifficulty { actual: u32, required: u32 },
    #[error("hash computation failed: {0}")]
    Hash(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("difficulty {requested} exceeds maximum {max}")]
    InvalidDifficulty { requested: u32, max: u32 },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("hash computation failed: {0}")]
    Hash(String),
    #[error("solver gave up after {0} attempts")]
    SolverExhausted(u64),
    #[error("pool is shut down")]
    ShutDown,
}
