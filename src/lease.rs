//! Lease assignment and expiry-based reclaim.
//!
//! Pending units are indexed by id, which is creation order, so the oldest
//! pending unit is always the first entry. Requeued units go back to their
//! original position rather than the tail.
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Level};

use crate::error::{LeaseError, StoreError};
use crate::store::WorkUnitStore;
use crate::time::Clock;
use crate::types::{ClientId, UnitId, WorkUnit};

pub struct LeaseManager {
    store: Arc<WorkUnitStore>,
    /// Pending unit ids mapped to the holder of their most recent lease.
    pending: Mutex<BTreeMap<UnitId, Option<ClientId>>>,
    clock: Arc<dyn Clock>,
    lease_ttl: Duration,
    work_ready: Notify,
}

impl std::fmt::Debug for LeaseManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseManager")
            .field("pending", &self.pending_len())
            .field("lease_ttl", &self.lease_ttl)
            .finish_non_exhaustive()
    }
}

impl LeaseManager {
    pub fn new(store: Arc<WorkUnitStore>, clock: Arc<dyn Clock>, lease_ttl: Duration) -> Self {
        Self {
            store,
            pending: Mutex::new(BTreeMap::new()),
            clock,
            lease_ttl,
            work_ready: Notify::new(),
        }
    }

    pub fn store(&self) -> &Arc<WorkUnitStore> {
        &self.store
    }

    /// Wakes idle sessions whenever a unit becomes pending.
    pub fn work_ready(&self) -> &Notify {
        &self.work_ready
    }

    fn lock_pending(&self) -> MutexGuard<'_, BTreeMap<UnitId, Option<ClientId>>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn index(&self, id: UnitId, previous_holder: Option<ClientId>) {
        self.lock_pending().insert(id, previous_holder);
        self.work_ready.notify_waiters();
    }

    /// Create a unit and make it assignable.
    pub fn enqueue(&self, data: impl Into<Arc<[u8]>>, difficulty: u32) -> Result<UnitId, StoreError> {
        let id = self.store.create(data, difficulty)?;
        self.index(id, None);
        debug!(unit = %id, difficulty, "unit enqueued");
        Ok(id)
    }

    /// Lease the oldest pending unit to `client`.
    ///
    /// Units this client held last are skipped while any other pending unit
    /// exists, and used as a fallback otherwise.
    pub fn acquire(&self, client: ClientId) -> Result<WorkUnit, LeaseError> {
        loop {
            // Computed before a unit is taken off the queue, so a failure leaves it queued.
            let expires_at = self
                .clock
                .now()
                .checked_add(self.lease_ttl)
                .ok_or(LeaseError::ExpiryOverflow { ttl: self.lease_ttl })?;
            let id = {
                let mut pending = self.lock_pending();
                let pick = pending
                    .iter()
                    .find(|(_, previous)| **previous != Some(client))
                    .or_else(|| pending.iter().next())
                    .map(|(id, _)| *id);
                let Some(id) = pick else {
                    return Err(LeaseError::NoWorkAvailable);
                };
                pending.remove(&id);
                id
            };

            match self.store.mark_leased(id, client, expires_at) {
                Ok(unit) => {
                    debug!(unit = %id, %client, "lease granted");
                    return Ok(unit);
                }
                Err(err) => {
                    // Only pending units are indexed; a stale entry is dropped and skipped.
                    warn!(unit = %id, %err, "dropping stale pending entry");
                }
            }
        }
    }

    /// Return a leased unit to pending immediately.
    pub fn release(&self, id: UnitId) -> Result<bool, StoreError> {
        let released = self.store.mark_pending(id)?;
        Ok(self.requeue(id, released))
    }

    /// Release `id` only if `client` still holds it.
    pub fn release_held(&self, id: UnitId, client: ClientId) -> Result<bool, StoreError> {
        let released = self.store.mark_pending_if(id, |holder, _| holder == client)?;
        Ok(self.requeue(id, released))
    }

    fn requeue(&self, id: UnitId, released: Option<ClientId>) -> bool {
        match released {
            Some(holder) => {
                debug!(unit = %id, %holder, "lease released");
                self.index(id, Some(holder));
                true
            }
            None => false,
        }
    }

    /// Requeue every lease that has run out. Returns how many were reclaimed.
    pub fn reclaim_expired(&self) -> usize {
        let now = self.clock.now();
        self.reclaim(self.store.expired_leases(now), now)
    }

    fn reclaim(&self, expired: Vec<UnitId>, now: Instant) -> usize {
        let mut reclaimed = 0;
        for id in expired {
            // Re-checked under the unit lock: the lease may have changed hands since the scan.
            match self.store.mark_pending_if(id, |_, expires_at| expires_at <= now) {
                Ok(released) => {
                    if self.requeue(id, released) {
                        reclaimed += 1;
                    }
                }
                Err(err) => warn!(unit = %id, %err, "failed to reclaim lease"),
            }
        }
        reclaimed
    }

    pub fn pending_len(&self) -> usize {
        self.lock_pending().len()
    }
}

/// Periodically reclaim expired leases until `cancel` fires.
pub async fn run_sweeper(leases: Arc<LeaseManager>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    debug!(?interval, "lease sweeper started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let reclaimed = leases.reclaim_expired();
                if reclaimed > 0 {
                    info!(reclaimed, "requeued expired leases");
                }
                if tracing::enabled!(Level::DEBUG) {
                    let counts = leases.store().counts();
                    debug!(
                        pending = counts.pending,
                        leased = counts.leased,
                        completed = counts.completed,
                        "sweep finished"
                    );
                }
            }
        }
    }

    debug!("lease sweeper stopped");
}
