//! Reference worker: a multi-threaded nonce search.
//!
//! Threads pull nonces from a shared counter and report the first hash that
//! meets the difficulty over a bounded channel; the first hit stops the rest.
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use derive_builder::Builder;
use flume::{Receiver, Sender};

use crate::error::Error;
use crate::hash::HashAlgorithm;
use crate::types::{Assignment, Block};
use crate::validator::meets_difficulty;

#[derive(Builder, Debug)]
#[builder(pattern = "owned")]
pub struct Solver {
    #[builder(default)]
    pub algorithm: HashAlgorithm,
    #[builder(default = "1")]
    pub threads: usize,
    #[builder(default)]
    pub start_nonce: u64,
    /// Total hashes tried across all threads before giving up.
    #[builder(default = "u64::MAX")]
    pub max_attempts: u64,
    #[builder(default = "Arc::new(AtomicU64::new(0))")]
    pub progress: Arc<AtomicU64>,
}

/// A nonce whose hash meets the requested difficulty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Solution {
    pub nonce: u64,
    pub hash: Vec<u8>,
    pub attempts: u64,
}

type SolveResult = Result<(u64, Vec<u8>), Error>;

#[derive(Debug)]
struct NonceSource {
    next: AtomicU64,
}

impl NonceSource {
    const fn new(start: u64) -> Self {
        Self {
            next: AtomicU64::new(start),
        }
    }

    #[inline]
    fn fetch(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
struct StopFlag {
    stop: AtomicBool,
}

impl StopFlag {
    #[inline]
    fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    fn force_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

impl Solver {
    fn validate(&self) -> Result<(), Error> {
        if self.threads == 0 {
            return Err(Error::InvalidConfig("threads must be >= 1".into()));
        }
        if self.max_attempts == 0 {
            return Err(Error::InvalidConfig("max_attempts must be >= 1".into()));
        }
        Ok(())
    }

    /// Search for a nonce whose hash over `data` has at least `difficulty` leading zero bits.
    pub fn solve(&self, data: &[u8], difficulty: u32) -> Result<Solution, Error> {
        self.validate()?;
        if difficulty > self.algorithm.output_bits() {
            return Err(Error::InvalidDifficulty {
                requested: difficulty,
                max: self.algorithm.output_bits(),
            });
        }
        self.progress.store(0, Ordering::SeqCst);

        let data: Arc<[u8]> = Arc::from(data);
        let nonces = Arc::new(NonceSource::new(self.start_nonce));
        let stop = Arc::new(StopFlag::default());
        let (tx, rx): (Sender<SolveResult>, Receiver<SolveResult>) =
            flume::bounded(self.threads * 2);
        let mut joins = Vec::with_capacity(self.threads);

        for _ in 0..self.threads {
            let worker = Worker {
                algorithm: self.algorithm.clone(),
                data: data.clone(),
                difficulty,
                max_attempts: self.max_attempts,
                nonces: nonces.clone(),
                stop: stop.clone(),
                progress: self.progress.clone(),
                tx: tx.clone(),
            };
            joins.push(thread::spawn(move || worker.run()));
        }
        drop(tx);

        let first = rx.recv();
        stop.force_stop();
        for handle in joins {
            let _ = handle.join();
        }

        let attempts = self.progress.load(Ordering::SeqCst).min(self.max_attempts);
        match first {
            Ok(Ok((nonce, hash))) => Ok(Solution {
                nonce,
                hash,
                attempts,
            }),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(Error::SolverExhausted(attempts)),
        }
    }

    /// Solve an assignment and package the result for submission.
    pub fn solve_assignment(&self, assignment: &Assignment) -> Result<Block, Error> {
        let solution = self.solve(&assignment.data, assignment.difficulty)?;
        Ok(Block {
            id: assignment.id,
            data: assignment.data.clone(),
            hash: solution.hash,
            nonce: solution.nonce,
        })
    }
}

struct Worker {
    algorithm: HashAlgorithm,
    data: Arc<[u8]>,
    difficulty: u32,
    max_attempts: u64,
    nonces: Arc<NonceSource>,
    stop: Arc<StopFlag>,
    progress: Arc<AtomicU64>,
    tx: Sender<SolveResult>,
}

impl Worker {
    fn run(self) {
        while !self.stop.should_stop() {
            if self.progress.fetch_add(1, Ordering::Relaxed) >= self.max_attempts {
                break;
            }
            let nonce = self.nonces.fetch();
            match self.algorithm.calculate(&self.data, nonce) {
                Ok(hash) if meets_difficulty(&hash, self.difficulty) => {
                    let _ = self.tx.send(Ok((nonce, hash)));
                    self.stop.force_stop();
                    break;
                }
                Ok(_) => continue,
                Err(err) => {
                    let _ = self.tx.send(Err(err));
                    self.stop.force_stop();
                    break;
                }
            }
        }
    }
}
