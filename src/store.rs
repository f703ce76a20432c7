//! Canonical lifecycle state of every known work unit.
//!
//! Each unit lives behind its own mutex, so transitions on distinct units never
//! contend. The map itself only guards membership. Live leases are also kept in
//! an expiry-ordered index, and per-state counts are maintained on every
//! transition, so neither the sweep nor stats have to visit completed units.
//!
//! Lock order: a unit's mutex, then the lease index. Nothing locks a unit while
//! holding the index.
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use dashmap::DashMap;

use crate::error::StoreError;
use crate::types::{ClientId, StateKind, UnitId, UnitState, WorkUnit};

#[derive(Debug)]
pub struct WorkUnitStore {
    units: DashMap<UnitId, Arc<Mutex<WorkUnit>>>,
    /// `(expires_at, id)` of every leased unit.
    leases: Mutex<BTreeSet<(Instant, UnitId)>>,
    next_id: AtomicU64,
    len: AtomicUsize,
    capacity: usize,
    pending: AtomicUsize,
    leased: AtomicUsize,
    completed: AtomicUsize,
}

/// Per-state unit counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateCounts {
    pub pending: usize,
    pub leased: usize,
    pub completed: usize,
}

fn lock(unit: &Mutex<WorkUnit>) -> MutexGuard<'_, WorkUnit> {
    // Every critical section leaves the record consistent, so a poisoned lock is still usable.
    unit.lock().unwrap_or_else(|e| e.into_inner())
}

impl WorkUnitStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            units: DashMap::new(),
            leases: Mutex::new(BTreeSet::new()),
            next_id: AtomicU64::new(0),
            len: AtomicUsize::new(0),
            capacity,
            pending: AtomicUsize::new(0),
            leased: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
        }
    }

    fn lock_leases(&self) -> MutexGuard<'_, BTreeSet<(Instant, UnitId)>> {
        self.leases.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Move a unit between count buckets. Called with the unit locked.
    fn shift(&self, from: StateKind, to: StateKind) {
        self.counter(from).fetch_sub(1, Ordering::SeqCst);
        self.counter(to).fetch_add(1, Ordering::SeqCst);
    }

    fn counter(&self, kind: StateKind) -> &AtomicUsize {
        match kind {
            StateKind::Pending => &self.pending,
            StateKind::Leased => &self.leased,
            StateKind::Completed => &self.completed,
        }
    }

    /// Register a new pending unit.
    pub fn create(&self, data: impl Into<Arc<[u8]>>, difficulty: u32) -> Result<UnitId, StoreError> {
        self.len
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.capacity).then_some(n + 1)
            })
            .map_err(|_| StoreError::Exhausted)?;
        let id = match self
            .next_id
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_add(1))
        {
            Ok(id) => UnitId(id),
            Err(_) => {
                self.len.fetch_sub(1, Ordering::SeqCst);
                return Err(StoreError::Exhausted);
            }
        };
        let unit = WorkUnit {
            id,
            data: data.into(),
            difficulty,
            state: UnitState::Pending,
            previous_holder: None,
        };
        self.pending.fetch_add(1, Ordering::SeqCst);
        self.units.insert(id, Arc::new(Mutex::new(unit)));
        Ok(id)
    }

    fn entry(&self, id: UnitId) -> Result<Arc<Mutex<WorkUnit>>, StoreError> {
        self.units
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(StoreError::NotFound(id))
    }

    /// Snapshot of a unit.
    pub fn get(&self, id: UnitId) -> Result<WorkUnit, StoreError> {
        let entry = self.entry(id)?;
        let unit = lock(&entry);
        Ok(unit.clone())
    }

    /// Pending -> Leased.
    pub fn mark_leased(
        &self,
        id: UnitId,
        client: ClientId,
        expires_at: Instant,
    ) -> Result<WorkUnit, StoreError> {
        let entry = self.entry(id)?;
        let mut unit = lock(&entry);
        if unit.state != UnitState::Pending {
            return Err(StoreError::Conflict {
                id,
                state: unit.state.kind(),
            });
        }
        unit.state = UnitState::Leased {
            holder: client,
            expires_at,
        };
        unit.previous_holder = Some(client);
        self.lock_leases().insert((expires_at, id));
        self.shift(StateKind::Pending, StateKind::Leased);
        Ok(unit.clone())
    }

    /// Leased -> Pending. Returns the holder whose lease was revoked; pending
    /// and completed units are left untouched.
    pub fn mark_pending(&self, id: UnitId) -> Result<Option<ClientId>, StoreError> {
        self.mark_pending_if(id, |_, _| true)
    }

    /// Leased -> Pending, only if `pred(holder, expires_at)` holds while the
    /// unit is locked.
    pub fn mark_pending_if(
        &self,
        id: UnitId,
        pred: impl FnOnce(ClientId, Instant) -> bool,
    ) -> Result<Option<ClientId>, StoreError> {
        let entry = self.entry(id)?;
        let mut guard = lock(&entry);
        let unit = &mut *guard;
        if let UnitState::Leased { holder, expires_at } = unit.state {
            if pred(holder, expires_at) {
                unit.state = UnitState::Pending;
                self.lock_leases().remove(&(expires_at, id));
                self.shift(StateKind::Leased, StateKind::Pending);
                return Ok(Some(holder));
            }
        }
        Ok(None)
    }

    /// Leased by `claimant` -> Completed. Exactly one caller can win this per unit.
    pub fn mark_completed(
        &self,
        id: UnitId,
        claimant: ClientId,
        hash: Vec<u8>,
        nonce: u64,
    ) -> Result<WorkUnit, StoreError> {
        let entry = self.entry(id)?;
        let mut guard = lock(&entry);
        let unit = &mut *guard;
        let expires_at = match unit.state {
            UnitState::Leased { holder, expires_at } if holder == claimant => expires_at,
            _ => {
                return Err(StoreError::Conflict {
                    id,
                    state: unit.state.kind(),
                })
            }
        };
        unit.state = UnitState::Completed { hash, nonce };
        self.lock_leases().remove(&(expires_at, id));
        self.shift(StateKind::Leased, StateKind::Completed);
        Ok(unit.clone())
    }

    /// Ids of leased units whose lease ran out at or before `now`, soonest first.
    ///
    /// Only the expired prefix of the lease index is visited.
    pub fn expired_leases(&self, now: Instant) -> Vec<UnitId> {
        self.lock_leases()
            .iter()
            .take_while(|(expires_at, _)| *expires_at <= now)
            .map(|(_, id)| *id)
            .collect()
    }

    /// Per-state counts. Each counter is exact; the three are read separately.
    pub fn counts(&self) -> StateCounts {
        StateCounts {
            pending: self.pending.load(Ordering::SeqCst),
            leased: self.leased.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::SeqCst),
        }
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
