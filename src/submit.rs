use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::hash::HashAlgorithm;
use crate::store::WorkUnitStore;
use crate::types::{Block, ClientId, StateKind, StatusCode, UnitState};
use crate::validator;

/// Validates reported results and records the winning one.
#[derive(Debug)]
pub struct SubmissionHandler {
    store: Arc<WorkUnitStore>,
    algorithm: HashAlgorithm,
}

impl SubmissionHandler {
    pub fn new(store: Arc<WorkUnitStore>, algorithm: HashAlgorithm) -> Self {
        Self { store, algorithm }
    }

    /// Decide one submission. Every call yields exactly one status.
    pub fn submit(&self, client: ClientId, block: &Block) -> StatusCode {
        let status = self.decide(client, block);
        match status {
            StatusCode::Accepted => {
                info!(%client, unit = %block.id, nonce = block.nonce, hash = %block.hash_hex(), "proof accepted")
            }
            StatusCode::RejectedInvalidProof => {}
            _ => debug!(%client, unit = %block.id, %status, "submission rejected"),
        }
        status
    }

    fn decide(&self, client: ClientId, block: &Block) -> StatusCode {
        let unit = match self.store.get(block.id) {
            Ok(unit) => unit,
            Err(_) => return StatusCode::RejectedUnknown,
        };

        if unit.is_completed() {
            return StatusCode::RejectedStale;
        }

        // A bad proof is rejected as such no matter who sent it or whether the
        // lease is still live.
        if block.data.as_slice() != &unit.data[..] {
            warn!(%client, unit = %block.id, "submitted data does not match the unit payload");
            return StatusCode::RejectedInvalidProof;
        }
        if let Err(err) = validator::verify(
            &self.algorithm,
            &unit.data,
            block.nonce,
            &block.hash,
            unit.difficulty,
        ) {
            warn!(%client, unit = %block.id, nonce = block.nonce, %err, "invalid proof");
            return StatusCode::RejectedInvalidProof;
        }

        match unit.state {
            UnitState::Completed { .. } | UnitState::Pending => return StatusCode::RejectedStale,
            UnitState::Leased { holder, .. } if holder != client => {
                return StatusCode::RejectedUnauthorized
            }
            UnitState::Leased { .. } => {}
        }

        // The lease may have moved while the proof was checked; the store decides.
        match self
            .store
            .mark_completed(block.id, client, block.hash.clone(), block.nonce)
        {
            Ok(_) => StatusCode::Accepted,
            Err(StoreError::Conflict {
                state: StateKind::Leased,
                ..
            }) => StatusCode::RejectedUnauthorized,
            Err(StoreError::Conflict { .. }) => StatusCode::RejectedStale,
            Err(StoreError::NotFound(_) | StoreError::Exhausted) => StatusCode::RejectedUnknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validator::leading_zero_bits;
    use std::sync::Barrier;
    use std::thread;
    use std::time::Instant;

    const X: ClientId = ClientId(1);
    const Y: ClientId = ClientId(2);

    fn setup(data: &[u8], difficulty: u32) -> (Arc<WorkUnitStore>, SubmissionHandler, Block) {
        let store = Arc::new(WorkUnitStore::new(usize::MAX));
        let id = store.create(data.to_vec(), difficulty).unwrap();
        let handler = SubmissionHandler::new(store.clone(), HashAlgorithm::Sha2_256);
        let block = Block {
            id,
            data: data.to_vec(),
            hash: Vec::new(),
            nonce: 0,
        };
        (store, handler, block)
    }

    fn with_nonce(block: &Block, pred: impl Fn(u32) -> bool) -> Block {
        let (nonce, hash) = (0u64..)
            .map(|n| (n, HashAlgorithm::calculate_sha2_256(&block.data, n)))
            .find(|(_, h)| pred(leading_zero_bits(h)))
            .unwrap();
        Block {
            nonce,
            hash,
            ..block.clone()
        }
    }

    #[test]
    fn unknown_unit() {
        let (_, handler, mut block) = setup(b"abc", 8);
        block.id = crate::types::UnitId(999);
        assert_eq!(handler.submit(X, &block), StatusCode::RejectedUnknown);
    }

    #[test]
    fn pending_unit_is_stale() {
        let (_, handler, block) = setup(b"abc", 8);
        let good = with_nonce(&block, |bits| bits >= 8);
        assert_eq!(handler.submit(X, &good), StatusCode::RejectedStale);
    }

    #[test]
    fn other_holder_is_unauthorized() {
        let (store, handler, block) = setup(b"abc", 8);
        store.mark_leased(block.id, X, Instant::now()).unwrap();
        let good = with_nonce(&block, |bits| bits >= 8);
        assert_eq!(handler.submit(Y, &good), StatusCode::RejectedUnauthorized);
        assert_eq!(store.get(block.id).unwrap().lease_holder(), Some(X));
    }

    #[test]
    fn weak_nonce_is_invalid_whoever_sends_it() {
        let (store, handler, block) = setup(b"abc", 8);
        let weak = with_nonce(&block, |bits| (4..8).contains(&bits));
        assert_eq!(handler.submit(X, &weak), StatusCode::RejectedInvalidProof);

        store.mark_leased(block.id, X, Instant::now()).unwrap();
        assert_eq!(handler.submit(Y, &weak), StatusCode::RejectedInvalidProof);
        assert_eq!(handler.submit(X, &weak), StatusCode::RejectedInvalidProof);
        assert_eq!(store.get(block.id).unwrap().lease_holder(), Some(X));
    }

    #[test]
    fn weak_proof_keeps_lease_then_retry_wins() {
        let (store, handler, block) = setup(b"abc", 8);
        store.mark_leased(block.id, X, Instant::now()).unwrap();

        let weak = with_nonce(&block, |bits| (4..8).contains(&bits));
        assert_eq!(handler.submit(X, &weak), StatusCode::RejectedInvalidProof);
        assert_eq!(store.get(block.id).unwrap().lease_holder(), Some(X));

        let good = with_nonce(&block, |bits| bits >= 8);
        assert_eq!(handler.submit(X, &good), StatusCode::Accepted);
        assert_eq!(handler.submit(Y, &good), StatusCode::RejectedStale);
        assert_eq!(handler.submit(X, &good), StatusCode::RejectedStale);
    }

    #[test]
    fn mismatched_claim_or_payload_is_invalid() {
        let (store, handler, block) = setup(b"abc", 8);
        store.mark_leased(block.id, X, Instant::now()).unwrap();
        let good = with_nonce(&block, |bits| bits >= 8);

        let mut wrong_hash = good.clone();
        wrong_hash.hash[31] ^= 1;
        assert_eq!(handler.submit(X, &wrong_hash), StatusCode::RejectedInvalidProof);

        let mut wrong_data = good.clone();
        wrong_data.data = b"abd".to_vec();
        assert_eq!(handler.submit(X, &wrong_data), StatusCode::RejectedInvalidProof);

        assert_eq!(handler.submit(X, &good), StatusCode::Accepted);
    }

    #[test]
    fn racing_submissions_accept_once() {
        let (store, handler, block) = setup(b"race", 4);
        store.mark_leased(block.id, X, Instant::now()).unwrap();
        let good = with_nonce(&block, |bits| bits >= 4);
        let handler = Arc::new(handler);

        let barrier = Arc::new(Barrier::new(6));
        let handles: Vec<_> = (0..6)
            .map(|_| {
                let handler = handler.clone();
                let barrier = barrier.clone();
                let good = good.clone();
                thread::spawn(move || {
                    barrier.wait();
                    handler.submit(X, &good)
                })
            })
            .collect();

        let statuses: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(
            statuses.iter().filter(|s| s.is_accepted()).count(),
            1,
            "{statuses:?}"
        );
        assert!(statuses
            .iter()
            .all(|s| matches!(s, StatusCode::Accepted | StatusCode::RejectedStale)));
    }
}
