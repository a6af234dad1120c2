//! Print a summary of a saved engine state as JSON.
//!
//! Usage: inspect <state-file>

use activeslice::codec::{read_layout, state_digest};
use activeslice::config::{ActiveConfig, FrameConfig};
use activeslice::logging::{Level, Logger, StdoutSink};
use activeslice::{Active, DenseStore, SparseStore};
use serde_json::json;
use std::env;
use std::fs;
use std::sync::Arc;

fn main() {
    let path = match env::args().nth(1) {
        Some(p) => p,
        None => {
            eprintln!("usage: inspect <state-file>");
            std::process::exit(1);
        }
    };
    let bytes = match fs::read(&path) {
        Ok(b) => b,
        Err(err) => {
            eprintln!("failed to read {}: {}", path, err);
            std::process::exit(2);
        }
    };
    let layout = match read_layout(&mut bytes.as_slice()) {
        Ok(l) => l,
        Err(err) => {
            eprintln!("not a state file: {}", err);
            std::process::exit(3);
        }
    };

    let config = ActiveConfig {
        name: layout.name.clone(),
        history_size: layout.history_size,
        cache_cumulative: true,
        cache_transitions: true,
        frames: FrameConfig::default(),
        ..ActiveConfig::default()
    };
    let mut builder = Active::builder(config).logger(Logger::new(Arc::new(StdoutSink)).with_level(Level::Error));
    for (k, spec) in layout.dense.iter().enumerate() {
        builder = builder.dense(DenseStore::shared(&format!("dense{}", k), 0), spec.clone());
    }
    for k in 0..layout.sparse {
        builder = builder.sparse(SparseStore::shared(&format!("sparse{}", k), 0));
    }
    let active = match builder.build() {
        Ok(a) => a,
        Err(err) => {
            eprintln!("cannot build engine for {}: {}", path, err);
            std::process::exit(4);
        }
    };
    if let Err(err) = active.load(&mut bytes.as_slice()) {
        eprintln!("load failed: {}", err);
        std::process::exit(5);
    }

    let leaves: Vec<_> = active
        .leaves()
        .into_iter()
        .map(|s| {
            json!({
                "slice": s,
                "size": active.slice_size(s),
                "length": active.slice_length(s),
                "path": active.path(s),
                "failure": active.failure(s),
            })
        })
        .collect();
    let payload = json!({
        "file": path,
        "bytes": bytes.len(),
        "digest": state_digest(&bytes),
        "report": active.report(),
        "partition_ok": active.check_partition().is_ok(),
        "leaves": leaves,
    });
    match serde_json::to_string_pretty(&payload) {
        Ok(s) => println!("{}", s),
        Err(err) => {
            eprintln!("failed to render: {}", err);
            std::process::exit(6);
        }
    }
}
