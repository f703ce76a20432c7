//! Lease-based proof-of-work distribution for pools of untrusted workers.
//!
//! A [`Pool`] hands out work units (payload plus difficulty) to subscribed
//! clients, one at a time per client, and accepts at most one valid result per
//! unit. Leases expire after a configurable TTL and are swept back into the
//! queue, so a stalled or vanished worker never pins a unit.
//!
//! ```no_run
//! # async fn demo() -> Result<(), powpool::Error> {
//! use powpool::{ClientInfo, PoolConfig, Pool, SolverBuilder};
//!
//! let pool = Pool::start(PoolConfig::default())?;
//! pool.producer().push(b"block".to_vec(), 12)?;
//!
//! let mut sub = pool.subscribe(ClientInfo::new("worker-1"))?;
//! let solver = SolverBuilder::default().build().expect("defaults are valid");
//! if let Some(assignment) = sub.next().await {
//!     let block = solver.solve_assignment(&assignment)?;
//!     let status = pool.submit(sub.client_id(), block);
//!     println!("{:?}", status.status());
//! }
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod config;
pub mod error;
pub mod hash;
pub mod lease;
pub mod logging;
pub mod service;
pub mod solver;
pub mod store;
pub mod submit;
pub mod time;
pub mod types;
pub mod validator;

pub use broker::{ClientSession, Subscription, SubscriptionBroker};
pub use config::{PoolConfig, PoolConfigBuilder, MAX_LEASE_TTL};
pub use error::{Error, LeaseError, ProofError, StoreError};
pub use hash::{Argon2Params, HashAlgorithm, ScryptParams};
pub use lease::LeaseManager;
pub use service::{Pool, WorkProducer};
pub use solver::{Solution, Solver, SolverBuilder};
pub use store::WorkUnitStore;
pub use submit::SubmissionHandler;
pub use types::{
    Assignment, Block, BlockStatus, ClientId, ClientInfo, CompletedWork, NewWork, PoolStats,
    StatusCode, UnitId, UnitState, WorkUnit,
};
pub use validator::{leading_zero_bits, meets_difficulty};
