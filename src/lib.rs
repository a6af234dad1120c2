//! Online slice-partitioning engine.
//!
//! Producers push events into shared [`store::EventStore`]s. An
//! [`active::Active`] consumes one event per id across all of its stores,
//! merges them into a circular history window, classifies the new row down a
//! tree of induced rules, and periodically grows the tree by inducing a rule
//! over the largest eligible slice.

pub mod active;
pub mod codec;
pub mod config;
pub mod decomp;
pub mod error;
pub mod frames;
pub mod fud;
pub mod history;
pub mod induce;
pub mod kernel;
pub mod logging;
pub mod slices;
pub mod store;
pub mod system;
pub mod variable;
pub mod view;

pub use active::{Active, ActiveBuilder, ActiveReport, EventApplied, UpdateSummary};
pub use config::{ActiveConfig, FrameConfig, InduceParams};
pub use error::{ActiveError, Result};
pub use induce::{InduceOutcome, InduceSummary};
pub use store::{DenseRow, DenseStore, SparseRow, SparseStore};
