//! The pool as clients and producers see it.
//!
//! Clients `subscribe` for an assignment stream and `submit` results against
//! it. The producer side pushes new payloads and reads back accepted results.
use std::sync::{Arc, Mutex};

use flume::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::{Subscription, SubscriptionBroker};
use crate::config::PoolConfig;
use crate::error::Error;
use crate::lease::{run_sweeper, LeaseManager};
use crate::store::WorkUnitStore;
use crate::submit::SubmissionHandler;
use crate::time::{Clock, TokioClock};
use crate::types::{
    Block, BlockStatus, ClientId, ClientInfo, CompletedWork, NewWork, PoolStats, StatusCode,
    UnitId, WorkUnit,
};

#[derive(Debug)]
pub struct Pool {
    config: PoolConfig,
    store: Arc<WorkUnitStore>,
    leases: Arc<LeaseManager>,
    broker: SubscriptionBroker,
    submissions: SubmissionHandler,
    completions_tx: flume::Sender<CompletedWork>,
    completions_rx: flume::Receiver<CompletedWork>,
    shutdown: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Pool {
    /// Build the pool and start the lease sweeper. Requires a tokio runtime.
    pub fn start(config: PoolConfig) -> Result<Self, Error> {
        Self::start_with_clock(config, Arc::new(TokioClock))
    }

    pub fn start_with_clock(config: PoolConfig, clock: Arc<dyn Clock>) -> Result<Self, Error> {
        config.validate()?;

        let store = Arc::new(WorkUnitStore::new(config.capacity));
        let leases = Arc::new(LeaseManager::new(store.clone(), clock, config.lease_ttl));
        let shutdown = CancellationToken::new();
        let broker = SubscriptionBroker::new(
            leases.clone(),
            config.retry_interval,
            config.algorithm.output_len(),
            shutdown.child_token(),
        );
        let submissions = SubmissionHandler::new(store.clone(), config.algorithm.clone());
        let (completions_tx, completions_rx) = flume::bounded(config.completion_buffer);

        let sweeper = tokio::spawn(run_sweeper(
            leases.clone(),
            config.sweep_interval,
            shutdown.child_token(),
        ));

        info!(
            algorithm = config.algorithm.name(),
            lease_ttl = ?config.lease_ttl,
            sweep_interval = ?config.sweep_interval,
            "pool started"
        );

        Ok(Self {
            config,
            store,
            leases,
            broker,
            submissions,
            completions_tx,
            completions_rx,
            shutdown,
            sweeper: Mutex::new(Some(sweeper)),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Open an assignment stream for a client.
    pub fn subscribe(&self, info: ClientInfo) -> Result<Subscription, Error> {
        if self.shutdown.is_cancelled() {
            return Err(Error::ShutDown);
        }
        Ok(self.broker.subscribe(info))
    }

    /// Decide a client's reported result.
    pub fn submit(&self, client: ClientId, block: Block) -> BlockStatus {
        let status = self.submissions.submit(client, &block);
        self.broker.on_submitted(client, block.id, status);
        if status == StatusCode::Accepted {
            self.report_completion(client, block);
        }
        status.into()
    }

    fn report_completion(&self, client: ClientId, block: Block) {
        let solved_by = self
            .broker
            .session(client)
            .map(|s| s.name().to_owned())
            .unwrap_or_else(|| client.to_string());
        let done = CompletedWork {
            id: block.id,
            data: block.data,
            hash: block.hash,
            nonce: block.nonce,
            solved_by,
        };
        match self.completions_tx.try_send(done) {
            Ok(()) => {}
            Err(TrySendError::Full(done)) => {
                warn!(unit = %done.id, "completion feed full, dropping notice")
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    pub fn producer(&self) -> WorkProducer {
        WorkProducer {
            leases: self.leases.clone(),
            difficulty_limit: self.config.difficulty_limit(),
            shutdown: self.shutdown.clone(),
        }
    }

    /// Accepted results, in acceptance order.
    pub fn completions(&self) -> flume::Receiver<CompletedWork> {
        self.completions_rx.clone()
    }

    pub fn unit(&self, id: UnitId) -> Result<WorkUnit, Error> {
        Ok(self.store.get(id)?)
    }

    pub fn stats(&self) -> PoolStats {
        let counts = self.store.counts();
        PoolStats {
            pending: counts.pending,
            leased: counts.leased,
            completed: counts.completed,
            sessions: self.broker.session_count(),
        }
    }

    /// Stop the sweeper and disconnect every session.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.broker.disconnect_all();
        let sweeper = self
            .sweeper
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = sweeper {
            let _ = handle.await;
        }
        info!("pool shut down");
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Handle for the external producer to feed payloads in.
#[derive(Debug, Clone)]
pub struct WorkProducer {
    leases: Arc<LeaseManager>,
    difficulty_limit: u32,
    shutdown: CancellationToken,
}

impl WorkProducer {
    /// Add a payload as a new pending unit.
    pub fn push(&self, data: impl Into<Vec<u8>>, difficulty: u32) -> Result<UnitId, Error> {
        if self.shutdown.is_cancelled() {
            return Err(Error::ShutDown);
        }
        if difficulty > self.difficulty_limit {
            return Err(Error::InvalidDifficulty {
                requested: difficulty,
                max: self.difficulty_limit,
            });
        }
        let data: Vec<u8> = data.into();
        Ok(self.leases.enqueue(data, difficulty)?)
    }

    /// Drain `feed` into the pool until it closes or the pool shuts down.
    pub fn spawn_feed(&self, feed: flume::Receiver<NewWork>) -> JoinHandle<()> {
        let producer = self.clone();
        tokio::spawn(async move {
            loop {
                let work = tokio::select! {
                    _ = producer.shutdown.cancelled() => break,
                    work = feed.recv_async() => match work {
                        Ok(work) => work,
                        Err(_) => break,
                    },
                };
                if let Err(err) = producer.push(work.data, work.difficulty) {
                    warn!(%err, "dropping work from feed");
                }
            }
            debug!("work feed closed");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfigBuilder;
    use crate::hash::HashAlgorithm;
    use crate::solver::SolverBuilder;
    use crate::types::UnitState;
    use crate::validator::leading_zero_bits;
    use std::time::Duration;
    use tokio::time::timeout;

    fn config(lease_ttl: Duration) -> PoolConfig {
        crate::logging::init_for_tests();
        PoolConfigBuilder::default()
            .lease_ttl(lease_ttl)
            .sweep_interval(Duration::from_millis(250))
            .retry_interval(Duration::from_secs(1))
            .build_validated()
            .expect("valid config")
    }

    fn nonce_where(data: &[u8], pred: impl Fn(u32) -> bool) -> (u64, Vec<u8>) {
        (0u64..)
            .map(|n| (n, HashAlgorithm::calculate_sha2_256(data, n)))
            .find(|(_, h)| pred(leading_zero_bits(h)))
            .unwrap()
    }

    fn block(id: UnitId, data: &[u8], (nonce, hash): (u64, Vec<u8>)) -> Block {
        Block {
            id,
            data: data.to_vec(),
            hash,
            nonce,
        }
    }

    fn status(pool: &Pool, client: ClientId, block: Block) -> StatusCode {
        pool.submit(client, block).status().expect("known status code")
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_weak_proof_then_late_duplicate() {
        let pool = Pool::start(config(Duration::from_secs(30))).unwrap();
        let id = pool.producer().push(b"abc".to_vec(), 8).unwrap();

        let mut x = pool.subscribe(ClientInfo::new("X")).unwrap();
        let y = pool.subscribe(ClientInfo::new("Y")).unwrap();
        assert_eq!(x.next().await.unwrap().id, id);

        let weak = nonce_where(b"abc", |bits| (4..8).contains(&bits));
        assert_eq!(
            status(&pool, x.client_id(), block(id, b"abc", weak)),
            StatusCode::RejectedInvalidProof
        );
        assert_eq!(pool.unit(id).unwrap().lease_holder(), Some(x.client_id()));

        let good = nonce_where(b"abc", |bits| bits >= 8);
        assert_eq!(
            status(&pool, x.client_id(), block(id, b"abc", good.clone())),
            StatusCode::Accepted
        );
        assert_eq!(
            status(&pool, y.client_id(), block(id, b"abc", good.clone())),
            StatusCode::RejectedStale
        );

        let done = pool.completions().try_recv().expect("completion reported");
        assert_eq!(done.id, id);
        assert_eq!(done.nonce, good.0);
        assert_eq!(done.solved_by, "X");
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lease_moves_to_another_client() {
        let pool = Pool::start(config(Duration::from_secs(2))).unwrap();
        let id = pool.producer().push(b"stall".to_vec(), 4).unwrap();

        let mut a = pool.subscribe(ClientInfo::new("A")).unwrap();
        assert_eq!(a.next().await.unwrap().id, id);

        let mut b = pool.subscribe(ClientInfo::new("B")).unwrap();
        let assignment = timeout(Duration::from_secs(5), b.next())
            .await
            .expect("reassigned after ttl")
            .unwrap();
        assert_eq!(assignment.id, id);

        // A's late answer loses to the new holder.
        let good = nonce_where(b"stall", |bits| bits >= 4);
        assert_eq!(
            status(&pool, a.client_id(), block(id, b"stall", good.clone())),
            StatusCode::RejectedUnauthorized
        );
        assert_eq!(
            status(&pool, b.client_id(), block(id, b"stall", good)),
            StatusCode::Accepted
        );
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_makes_unit_assignable_before_ttl() {
        let pool = Pool::start(config(Duration::from_secs(600))).unwrap();
        let id = pool.producer().push(b"abc".to_vec(), 4).unwrap();

        let mut a = pool.subscribe(ClientInfo::new("A")).unwrap();
        assert_eq!(a.next().await.unwrap().id, id);
        a.close();
        assert_eq!(pool.unit(id).unwrap().state, UnitState::Pending);

        let mut b = pool.subscribe(ClientInfo::new("B")).unwrap();
        let assignment = timeout(Duration::from_secs(1), b.next())
            .await
            .expect("no ttl wait")
            .unwrap();
        assert_eq!(assignment.id, id);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_and_stale_submissions() {
        let pool = Pool::start(config(Duration::from_secs(30))).unwrap();
        let id = pool.producer().push(b"abc".to_vec(), 4).unwrap();
        let good = nonce_where(b"abc", |bits| bits >= 4);

        assert_eq!(
            status(&pool, ClientId(77), block(UnitId(12345), b"abc", good.clone())),
            StatusCode::RejectedUnknown
        );
        // Never leased to anyone yet.
        assert_eq!(
            status(&pool, ClientId(77), block(id, b"abc", good)),
            StatusCode::RejectedStale
        );
    }

    #[tokio::test(start_paused = true)]
    async fn producer_rejects_unreachable_difficulty() {
        let pool = Pool::start(config(Duration::from_secs(30))).unwrap();
        let err = pool.producer().push(b"abc".to_vec(), 257).unwrap_err();
        assert_eq!(
            err,
            Error::InvalidDifficulty {
                requested: 257,
                max: 256
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn feed_channel_creates_units() {
        let pool = Pool::start(config(Duration::from_secs(30))).unwrap();
        let (tx, rx) = flume::unbounded();
        let feed = pool.producer().spawn_feed(rx);

        tx.send(NewWork {
            data: b"fed".to_vec(),
            difficulty: 2,
        })
        .unwrap();
        drop(tx);
        feed.await.unwrap();

        assert_eq!(pool.stats().pending, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_everything() {
        let pool = Pool::start(config(Duration::from_secs(30))).unwrap();
        let mut sub = pool.subscribe(ClientInfo::new("A")).unwrap();
        pool.shutdown().await;

        assert_eq!(sub.next().await, None);
        assert_eq!(pool.stats().sessions, 0);
        assert!(matches!(
            pool.subscribe(ClientInfo::new("B")),
            Err(Error::ShutDown)
        ));
        assert!(matches!(
            pool.producer().push(b"x".to_vec(), 1),
            Err(Error::ShutDown)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn many_solvers_complete_every_unit_once() {
        let pool = Arc::new(Pool::start(config(Duration::from_secs(30))).unwrap());
        let producer = pool.producer();
        let ids: Vec<_> = (0..20u8)
            .map(|i| producer.push(vec![i; 16], 6).unwrap())
            .collect();

        let mut workers = Vec::new();
        for w in 0..4 {
            let pool = pool.clone();
            workers.push(tokio::spawn(async move {
                let mut sub = pool.subscribe(ClientInfo::new(format!("w{w}"))).unwrap();
                let solver = SolverBuilder::default().build().unwrap();
                let mut accepted = 0;
                while let Ok(Some(assignment)) =
                    timeout(Duration::from_millis(500), sub.next()).await
                {
                    let block = solver.solve_assignment(&assignment).unwrap();
                    if pool.submit(sub.client_id(), block).status() == Some(StatusCode::Accepted)
                    {
                        accepted += 1;
                    }
                }
                accepted
            }));
        }

        let mut total = 0;
        for worker in workers {
            total += worker.await.unwrap();
        }
        assert_eq!(total, ids.len());
        for id in ids {
            assert!(pool.unit(id).unwrap().is_completed());
        }
        assert_eq!(pool.completions().len(), 20);
    }
}
