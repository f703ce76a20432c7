use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Opaque identifier of a work unit, assigned by the store in creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitId(pub u64);

impl Display for UnitId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0.to_be_bytes()))
    }
}

/// Identifier of one subscription. A reconnecting client receives a fresh one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub u64);

impl Display for ClientId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Lifecycle state of a work unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitState {
    Pending,
    Leased { holder: ClientId, expires_at: Instant },
    Completed { hash: Vec<u8>, nonce: u64 },
}

impl UnitState {
    pub fn kind(&self) -> StateKind {
        match self {
            UnitState::Pending => StateKind::Pending,
            UnitState::Leased { .. } => StateKind::Leased,
            UnitState::Completed { .. } => StateKind::Completed,
        }
    }
}

/// Field-less view of [`UnitState`], used in errors and counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateKind {
    Pending,
    Leased,
    Completed,
}

impl Display for StateKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            StateKind::Pending => write!(f, "pending"),
            StateKind::Leased => write!(f, "leased"),
            StateKind::Completed => write!(f, "completed"),
        }
    }
}

/// One block payload plus its difficulty target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkUnit {
    pub id: UnitId,
    pub data: Arc<[u8]>,
    /// Minimum leading zero bits of a valid hash.
    pub difficulty: u32,
    pub state: UnitState,
    /// Holder of the most recent lease, kept across requeues.
    pub previous_holder: Option<ClientId>,
}

impl WorkUnit {
    pub fn lease_holder(&self) -> Option<ClientId> {
        match self.state {
            UnitState::Leased { holder, .. } => Some(holder),
            _ => None,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self.state, UnitState::Completed { .. })
    }
}

/// Subscribe request: the client-declared, unauthenticated name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub name: String,
}

impl ClientInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Work pushed to a subscribed client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub id: UnitId,
    pub data: Vec<u8>,
    pub difficulty: u32,
    /// Big-endian threshold: a hash is valid iff it is `<=` this template.
    pub target: Vec<u8>,
}

/// Submit request: a computed result for a previously assigned unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub id: UnitId,
    pub data: Vec<u8>,
    pub hash: Vec<u8>,
    pub nonce: u64,
}

impl Block {
    pub fn hash_hex(&self) -> String {
        hex::encode(&self.hash)
    }
}

/// Outcome of a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum StatusCode {
    Accepted = 0,
    RejectedInvalidProof = 1,
    RejectedUnknown = 2,
    RejectedStale = 3,
    RejectedUnauthorized = 4,
}

impl StatusCode {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(StatusCode::Accepted),
            1 => Some(StatusCode::RejectedInvalidProof),
            2 => Some(StatusCode::RejectedUnknown),
            3 => Some(StatusCode::RejectedStale),
            4 => Some(StatusCode::RejectedUnauthorized),
            _ => None,
        }
    }

    pub fn is_accepted(self) -> bool {
        self == StatusCode::Accepted
    }
}

impl Display for StatusCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusCode::Accepted => write!(f, "accepted"),
            StatusCode::RejectedInvalidProof => write!(f, "rejected: invalid proof"),
            StatusCode::RejectedUnknown => write!(f, "rejected: unknown unit"),
            StatusCode::RejectedStale => write!(f, "rejected: stale"),
            StatusCode::RejectedUnauthorized => write!(f, "rejected: unauthorized"),
        }
    }
}

/// Wire form of a submission reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockStatus {
    pub code: u32,
}

impl From<StatusCode> for BlockStatus {
    fn from(status: StatusCode) -> Self {
        Self {
            code: status.code(),
        }
    }
}

impl BlockStatus {
    pub fn status(&self) -> Option<StatusCode> {
        StatusCode::from_code(self.code)
    }
}

/// A payload handed to the pool by the external producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewWork {
    pub data: Vec<u8>,
    pub difficulty: u32,
}

/// An accepted result, reported back to the producer side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedWork {
    pub id: UnitId,
    pub data: Vec<u8>,
    pub hash: Vec<u8>,
    pub nonce: u64,
    pub solved_by: String,
}

/// Snapshot of unit and session counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub pending: usize,
    pub leased: usize,
    pub completed: usize,
    pub sessions: usize,
}
