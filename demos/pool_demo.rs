//! Minimal end-to-end demo of the pool.
//!
//! - A producer task feeds blocks through a flume channel.
//! - Several workers subscribe, solve on blocking threads, and submit.
//! - One worker misbehaves: it takes an assignment and then goes silent, so its
//!   unit only comes back through the lease sweeper.
//!
//! Run with `RUST_LOG=powpool=debug` to watch leases move.

use std::error::Error;
use std::time::Duration;

use powpool::logging;
use powpool::{
    ClientInfo, HashAlgorithm, NewWork, Pool, PoolConfigBuilder, SolverBuilder, StatusCode,
};
use tokio::time::timeout;

const BLOCKS: usize = 12;
const DIFFICULTY: u32 = 14;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    logging::init_stdout();

    let config = PoolConfigBuilder::default()
        .algorithm(HashAlgorithm::Blake3)
        .lease_ttl(Duration::from_secs(2))
        .sweep_interval(Duration::from_millis(250))
        .retry_interval(Duration::from_millis(500))
        .build_validated()?;
    let pool = std::sync::Arc::new(Pool::start(config)?);

    let (feed_tx, feed_rx) = flume::bounded(4);
    let feed = pool.producer().spawn_feed(feed_rx);
    tokio::spawn(async move {
        for i in 0..BLOCKS {
            let work = NewWork {
                data: format!("block-{i}").into_bytes(),
                difficulty: DIFFICULTY,
            };
            if feed_tx.send_async(work).await.is_err() {
                break;
            }
        }
    });

    // Takes one assignment and never answers.
    let mut stalled = pool.subscribe(ClientInfo::new("stalled"))?;
    if let Some(assignment) = stalled.next().await {
        println!("stalled worker sits on unit {}", assignment.id);
    }

    let mut workers = Vec::new();
    for w in 0..3 {
        let pool = pool.clone();
        workers.push(tokio::spawn(async move {
            let mut sub = pool.subscribe(ClientInfo::new(format!("worker-{w}")))?;
            let mut solved = 0usize;
            while let Ok(Some(assignment)) = timeout(Duration::from_secs(4), sub.next()).await {
                let solver = SolverBuilder::default()
                    .algorithm(HashAlgorithm::Blake3)
                    .threads(2)
                    .build()?;
                let block =
                    tokio::task::spawn_blocking(move || solver.solve_assignment(&assignment))
                        .await??;
                if pool.submit(sub.client_id(), block).status() == Some(StatusCode::Accepted) {
                    solved += 1;
                }
            }
            Ok::<usize, Box<dyn Error + Send + Sync>>(solved)
        }));
    }

    for (w, worker) in workers.into_iter().enumerate() {
        match worker.await? {
            Ok(solved) => println!("worker-{w} solved {solved} blocks"),
            Err(err) => println!("worker-{w} failed: {err}"),
        }
    }

    let completions = pool.completions();
    while let Ok(done) = completions.try_recv() {
        println!(
            "{} {} nonce={} hash={} by {}",
            done.id,
            String::from_utf8_lossy(&done.data),
            done.nonce,
            hex::encode(&done.hash),
            done.solved_by
        );
    }

    println!("{:?}", pool.stats());
    drop(stalled);
    pool.shutdown().await;
    feed.abort();
    Ok(())
}
