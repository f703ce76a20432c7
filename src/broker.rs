//! One outbound assignment stream per connected client.
//!
//! Every session runs a small task that waits until the session has no
//! outstanding lease, acquires the oldest pending unit, and pushes it into a
//! bounded queue read by the client. While no work exists the task parks on
//! the lease manager's notifier; there is no polling beyond the configured
//! retry interval.
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::LeaseError;
use crate::lease::LeaseManager;
use crate::types::{Assignment, ClientId, ClientInfo, StatusCode, UnitId, WorkUnit};
use crate::validator::target_template;

/// Bookkeeping for one subscribed client.
#[derive(Debug)]
pub struct ClientSession {
    id: ClientId,
    name: String,
    active_lease: Mutex<Option<UnitId>>,
    lease_cleared: Notify,
    connected: AtomicBool,
    cancel: CancellationToken,
}

impl ClientSession {
    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn lease(&self) -> MutexGuard<'_, Option<UnitId>> {
        self.active_lease.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn active_lease(&self) -> Option<UnitId> {
        *self.lease()
    }
}

#[derive(Debug)]
struct BrokerInner {
    leases: Arc<LeaseManager>,
    sessions: DashMap<ClientId, Arc<ClientSession>>,
    next_client: AtomicU64,
    retry_interval: Duration,
    hash_len: usize,
    shutdown: CancellationToken,
}

#[derive(Debug, Clone)]
pub struct SubscriptionBroker {
    inner: Arc<BrokerInner>,
}

impl SubscriptionBroker {
    pub fn new(
        leases: Arc<LeaseManager>,
        retry_interval: Duration,
        hash_len: usize,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                leases,
                sessions: DashMap::new(),
                next_client: AtomicU64::new(1),
                retry_interval,
                hash_len,
                shutdown,
            }),
        }
    }

    /// Open a session and start streaming assignments to it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn subscribe(&self, info: ClientInfo) -> Subscription {
        let id = ClientId(self.inner.next_client.fetch_add(1, Ordering::SeqCst));
        let session = Arc::new(ClientSession {
            id,
            name: info.name,
            active_lease: Mutex::new(None),
            lease_cleared: Notify::new(),
            connected: AtomicBool::new(true),
            cancel: self.inner.shutdown.child_token(),
        });
        self.inner.sessions.insert(id, session.clone());
        info!(client = %id, name = %session.name, "client subscribed");

        let (tx, rx) = flume::bounded(1);
        tokio::spawn(run_session(self.inner.clone(), session.clone(), tx));

        Subscription {
            client: id,
            name: session.name.clone(),
            assignments: rx,
            broker: Arc::downgrade(&self.inner),
        }
    }

    /// Tear a session down and hand its lease back right away.
    pub fn disconnect(&self, client: ClientId) -> bool {
        self.inner.disconnect(client)
    }

    pub fn disconnect_all(&self) {
        let clients: Vec<ClientId> = self.inner.sessions.iter().map(|e| *e.key()).collect();
        for client in clients {
            self.inner.disconnect(client);
        }
    }

    /// Update a session after one of its submissions was decided.
    ///
    /// The outstanding assignment is cleared once the unit is done or no
    /// longer this session's; an invalid proof leaves it in place for a retry.
    pub fn on_submitted(&self, client: ClientId, unit: UnitId, status: StatusCode) {
        if status == StatusCode::RejectedInvalidProof || status == StatusCode::RejectedUnknown {
            return;
        }
        let Some(session) = self.session(client) else {
            return;
        };
        let mut lease = session.lease();
        if *lease == Some(unit) {
            *lease = None;
            drop(lease);
            debug!(%client, %unit, %status, "assignment cleared");
            session.lease_cleared.notify_one();
        }
    }

    pub fn session(&self, client: ClientId) -> Option<Arc<ClientSession>> {
        self.inner.sessions.get(&client).map(|e| e.value().clone())
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }
}

impl BrokerInner {
    fn disconnect(&self, client: ClientId) -> bool {
        let Some((_, session)) = self.sessions.remove(&client) else {
            return false;
        };
        session.connected.store(false, Ordering::SeqCst);
        session.cancel.cancel();
        let held = session.lease().take();
        if let Some(unit) = held {
            self.release(&session, unit);
        }
        info!(%client, name = %session.name, "client disconnected");
        true
    }

    fn release(&self, session: &ClientSession, unit: UnitId) {
        match self.leases.release_held(unit, session.id) {
            Ok(true) => debug!(client = %session.id, %unit, "lease returned on disconnect"),
            Ok(false) => {}
            Err(err) => warn!(client = %session.id, %unit, %err, "failed to release lease"),
        }
    }

    fn assignment(&self, unit: &WorkUnit) -> Assignment {
        Assignment {
            id: unit.id,
            data: unit.data.to_vec(),
            difficulty: unit.difficulty,
            target: target_template(unit.difficulty, self.hash_len),
        }
    }
}

async fn run_session(
    inner: Arc<BrokerInner>,
    session: Arc<ClientSession>,
    tx: flume::Sender<Assignment>,
) {
    loop {
        if !wait_for_capacity(&session).await {
            return;
        }
        let Some(unit) = wait_for_work(&inner, &session).await else {
            return;
        };

        *session.lease() = Some(unit.id);
        // A disconnect that ran before the lease was recorded could not release it.
        if session.cancel.is_cancelled() {
            let held = session.lease().take();
            if let Some(id) = held {
                inner.release(&session, id);
            }
            return;
        }

        let assignment = inner.assignment(&unit);
        debug!(client = %session.id, unit = %unit.id, "pushing assignment");
        tokio::select! {
            _ = session.cancel.cancelled() => return,
            sent = tx.send_async(assignment) => {
                if sent.is_err() {
                    inner.disconnect(session.id);
                    return;
                }
            }
        }
    }
}

/// Park until the session has no outstanding assignment. `false` on cancellation.
async fn wait_for_capacity(session: &ClientSession) -> bool {
    loop {
        let cleared = session.lease_cleared.notified();
        tokio::pin!(cleared);
        cleared.as_mut().enable();
        if session.active_lease().is_none() {
            return true;
        }
        tokio::select! {
            _ = session.cancel.cancelled() => return false,
            _ = &mut cleared => {}
        }
    }
}

/// Acquire a lease for the session, parking while none is available.
async fn wait_for_work(inner: &BrokerInner, session: &ClientSession) -> Option<WorkUnit> {
    loop {
        let ready = inner.leases.work_ready().notified();
        tokio::pin!(ready);
        ready.as_mut().enable();

        match inner.leases.acquire(session.id) {
            Ok(unit) => return Some(unit),
            Err(LeaseError::NoWorkAvailable) => {}
            Err(err) => warn!(client = %session.id, %err, "acquire failed"),
        }

        tokio::select! {
            _ = session.cancel.cancelled() => return None,
            _ = &mut ready => {}
            _ = tokio::time::sleep(inner.retry_interval) => {}
        }
    }
}

/// Client end of a session. Dropping it disconnects the session.
#[derive(Debug)]
pub struct Subscription {
    client: ClientId,
    name: String,
    assignments: flume::Receiver<Assignment>,
    broker: Weak<BrokerInner>,
}

impl Subscription {
    pub fn client_id(&self) -> ClientId {
        self.client
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the next assignment. `None` once the session is closed.
    pub async fn next(&mut self) -> Option<Assignment> {
        self.assignments.recv_async().await.ok()
    }

    /// An assignment that has already been pushed, without waiting.
    pub fn try_next(&mut self) -> Option<Assignment> {
        self.assignments.try_recv().ok()
    }

    /// Explicit unsubscribe.
    pub fn close(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.broker.upgrade() {
            inner.disconnect(self.client);
        }
    }
}
