//! Demo driver: a synthetic producer feeds two stores while the engine
//! applies events and induces rules in the background.
//!
//! Environment: the engine reads `ActiveConfig::from_env` and
//! `InduceParams::from_env`; the driver adds `EVENTS`, `PRODUCER_SEED`,
//! `PRODUCER_INTERVAL_MS`, `REPORT_SECS`, `STATE_PATH` and `LOG_DIR`.

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::{interval, sleep, Duration, Instant};

use activeslice::history::DenseSpec;
use activeslice::logging::{obj, v_str, v_u64, Domain, JsonlSink, Logger};
use activeslice::{Active, ActiveConfig, DenseRow, DenseStore, InduceParams, SparseRow, SparseStore};

const DENSE_VARS: [u64; 3] = [1, 2, 3];
const DENSE_SHAPE: [u16; 3] = [2, 3, 4];

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// A two-regime source: the regime drifts slowly and biases every variable,
/// so induced rules have something to find.
struct Producer {
    rng: StdRng,
    regime: u8,
}

impl Producer {
    fn new(seed: u64) -> Self {
        Self { rng: StdRng::seed_from_u64(seed), regime: 0 }
    }

    fn next(&mut self) -> (DenseRow, SparseRow) {
        if self.rng.gen_bool(0.02) {
            self.regime ^= 1;
        }
        let values: Vec<u8> = DENSE_SHAPE
            .iter()
            .map(|&v| {
                if self.rng.gen_bool(0.8) {
                    (self.regime as u16 % v) as u8
                } else {
                    self.rng.gen_range(0..v) as u8
                }
            })
            .collect();
        let dense = DenseRow::new(DENSE_VARS.to_vec(), DENSE_SHAPE.to_vec(), values);
        let category = 100 + self.regime as u64;
        let sparse = if self.rng.gen_bool(0.5) {
            SparseRow::new(vec![category, category * 10 + self.rng.gen_range(0..3)])
        } else {
            SparseRow::single(category)
        };
        (dense, sparse)
    }
}

fn logger() -> Logger {
    if std::env::var("LOG_DIR").is_ok() {
        match JsonlSink::from_env() {
            Ok(sink) => return Logger::new(Arc::new(sink)),
            Err(e) => eprintln!("log dir unavailable, using stdout: {}", e),
        }
    }
    Logger::default()
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = ActiveConfig::from_env();
    let params = InduceParams::from_env();
    let events: u64 = env_or("EVENTS", 5000);
    let seed: u64 = env_or("PRODUCER_SEED", 42);
    let pace = Duration::from_millis(env_or("PRODUCER_INTERVAL_MS", 0));
    let report_every = Duration::from_secs(env_or("REPORT_SECS", 5));
    let state_path = std::env::var("STATE_PATH").ok().map(PathBuf::from);
    let log = logger();

    let dense = DenseStore::shared("dense", 0);
    let sparse = SparseStore::shared("sparse", 0);
    let active = Arc::new(
        Active::builder(config)
            .params(params)
            .logger(log.clone())
            .dense(dense.clone(), DenseSpec::new(DENSE_VARS.to_vec(), DENSE_SHAPE.to_vec()))
            .sparse(sparse.clone())
            .build()
            .context("building engine")?,
    );

    if let Some(path) = state_path.as_ref().filter(|p| p.exists()) {
        active
            .load_path(path)
            .with_context(|| format!("loading {}", path.display()))?;
    }
    let first_id = active.last_event().map_or(1, |id| id + 1);

    let done = Arc::new(AtomicBool::new(false));
    let producer = {
        let done = done.clone();
        let dense = dense.clone();
        let sparse = sparse.clone();
        tokio::spawn(async move {
            let mut source = Producer::new(seed);
            for id in first_id..first_id + events {
                let (d, s) = source.next();
                dense.insert(id, d);
                sparse.insert(id, s);
                if pace.is_zero() {
                    tokio::task::yield_now().await;
                } else {
                    sleep(pace).await;
                }
            }
            done.store(true, Ordering::SeqCst);
        })
    };

    let started = Instant::now();
    let mut tick = interval(Duration::from_millis(active.params().poll_interval_ms.max(1)));
    let mut last_report = Instant::now();
    loop {
        tick.tick().await;
        let engine = active.clone();
        let applied = tokio::task::spawn_blocking(move || engine.update())
            .await
            .context("update task")??;
        let engine = active.clone();
        let induced = tokio::task::spawn_blocking(move || engine.induce())
            .await
            .context("induce task")??;
        if induced.grown > 0 || induced.failed > 0 {
            log.info(
                Domain::Induce,
                "induce_round",
                obj(&[
                    ("grown", v_u64(induced.grown as u64)),
                    ("failed", v_u64(induced.failed as u64)),
                ]),
            );
        }
        if last_report.elapsed() >= report_every {
            active.report();
            last_report = Instant::now();
        }
        if active.is_terminated() {
            break;
        }
        if done.load(Ordering::SeqCst) && applied.applied == 0 && !applied.paused && dense.is_empty() {
            break;
        }
    }
    producer.await.context("producer task")?;

    active.check_partition()?;
    let report = active.report();
    println!("{}", serde_json::to_string_pretty(&report)?);
    if let Some(path) = state_path {
        let bytes = active
            .save_path(&path)
            .with_context(|| format!("saving {}", path.display()))?;
        log.info(
            Domain::System,
            "saved",
            obj(&[
                ("path", v_str(&path.to_string_lossy())),
                ("bytes", v_u64(bytes)),
                ("elapsed_ms", v_u64(started.elapsed().as_millis() as u64)),
            ]),
        );
    }
    Ok(())
}
