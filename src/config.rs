//! Engine and induction configuration, read from the environment.

use std::collections::BTreeSet;

use crate::kernel::LayerParams;
use crate::system::BITS_MAX;

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

fn env_list<T: std::str::FromStr>(key: &str) -> Option<Vec<T>> {
    std::env::var(key).ok().map(|v| {
        v.split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .filter_map(|s| s.parse().ok())
            .collect()
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameConfig {
    /// Row lags at which underlying variables are offered to induction.
    /// Lag 0 is always offered.
    pub underlying: Vec<usize>,
    /// Row lags at which earlier slice tags are offered. Entries are >= 1.
    pub history: Vec<usize>,
    /// Count lags in slice runs instead of rows.
    pub dynamic: bool,
}

impl FrameConfig {
    pub fn from_env() -> Self {
        Self {
            underlying: env_list("FRAMES_UNDERLYING").unwrap_or_default(),
            history: env_list("FRAMES_HISTORY").unwrap_or_default(),
            dynamic: env_flag("FRAMES_DYNAMIC", false),
        }
        .normalized()
    }

    pub fn normalized(mut self) -> Self {
        self.underlying.retain(|l| *l > 0);
        self.underlying.sort_unstable();
        self.underlying.dedup();
        self.history.retain(|l| *l > 0);
        self.history.sort_unstable();
        self.history.dedup();
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActiveConfig {
    pub name: String,
    pub history_size: usize,
    /// Block width of the variable allocator.
    pub bits: u32,
    /// Per-event and per-induction info records.
    pub logging: bool,
    /// Count gaps in the processed id sequence.
    pub continuity: bool,
    pub cache_cumulative: bool,
    pub cache_transitions: bool,
    pub frames: FrameConfig,
}

impl Default for ActiveConfig {
    fn default() -> Self {
        Self {
            name: "active".to_string(),
            history_size: 1000,
            bits: 16,
            logging: false,
            continuity: false,
            cache_cumulative: false,
            cache_transitions: false,
            frames: FrameConfig::default(),
        }
    }
}

impl ActiveConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            name: std::env::var("ACTIVE_NAME").unwrap_or(d.name),
            history_size: env_parse("HISTORY_SIZE", d.history_size),
            bits: env_parse("VAR_BITS", d.bits).clamp(1, BITS_MAX),
            logging: env_flag("ACTIVE_LOGGING", d.logging),
            continuity: env_flag("ACTIVE_CONTINUITY", d.continuity),
            cache_cumulative: env_flag("CACHE_CUMULATIVE", d.cache_cumulative),
            cache_transitions: env_flag("CACHE_TRANSITIONS", d.cache_transitions),
            frames: FrameConfig::from_env(),
        }
    }

    pub fn with_history(mut self, size: usize) -> Self {
        self.history_size = size;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InduceParams {
    /// Population thresholds, ascending. The first makes a slice eligible;
    /// after a failure at population `p` the next threshold above `p` does.
    /// Empty disables induction.
    pub thresholds: Vec<usize>,
    /// Underlying variables never offered as features.
    pub exclusions: BTreeSet<u64>,
    /// Dense variables also offered as value-prefix indicators.
    pub computed: BTreeSet<u64>,
    pub znnmax: f64,
    pub bmax: usize,
    pub candidates_max: Option<usize>,
    pub density_min: f64,
    pub seed: u64,
    pub wmax: u16,
    pub asynchronous: bool,
    pub max_threads: usize,
    pub poll_interval_ms: u64,
    /// Back-pressure once an in-progress slice is larger than this. 0 is
    /// no limit.
    pub slice_update_limit: usize,
}

impl Default for InduceParams {
    fn default() -> Self {
        Self {
            thresholds: vec![100],
            exclusions: BTreeSet::new(),
            computed: BTreeSet::new(),
            znnmax: 60_000_000.0,
            bmax: 10,
            candidates_max: None,
            density_min: 0.0,
            seed: 5,
            wmax: 9,
            asynchronous: false,
            max_threads: num_cpus::get(),
            poll_interval_ms: 10,
            slice_update_limit: 0,
        }
    }
}

impl InduceParams {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            thresholds: env_list("INDUCE_THRESHOLDS").unwrap_or(d.thresholds),
            exclusions: env_list("INDUCE_EXCLUSIONS").map(|v| v.into_iter().collect()).unwrap_or(d.exclusions),
            computed: env_list("INDUCE_COMPUTED").map(|v| v.into_iter().collect()).unwrap_or(d.computed),
            znnmax: env_parse("INDUCE_ZNNMAX", d.znnmax),
            bmax: env_parse("INDUCE_BMAX", d.bmax),
            candidates_max: std::env::var("INDUCE_CANDIDATES_MAX").ok().and_then(|v| v.parse().ok()),
            density_min: env_parse("INDUCE_DENSITY_MIN", d.density_min),
            seed: env_parse("INDUCE_SEED", d.seed),
            wmax: env_parse("INDUCE_WMAX", d.wmax),
            asynchronous: env_flag("INDUCE_ASYNC", d.asynchronous),
            max_threads: env_parse("INDUCE_THREADS", d.max_threads),
            poll_interval_ms: env_parse("INDUCE_POLL_MS", d.poll_interval_ms),
            slice_update_limit: env_parse("INDUCE_SLICE_LIMIT", d.slice_update_limit),
        }
        .normalized()
    }

    pub fn normalized(mut self) -> Self {
        self.thresholds.retain(|t| *t > 0);
        self.thresholds.sort_unstable();
        self.thresholds.dedup();
        self.max_threads = self.max_threads.max(1);
        self
    }

    pub fn with_thresholds(mut self, thresholds: &[usize]) -> Self {
        self.thresholds = thresholds.to_vec();
        self.normalized()
    }

    /// Feature budget for a slice of `population` rows.
    pub fn feature_limit(&self, population: usize) -> usize {
        let z = population.max(1) as f64;
        let n = (self.znnmax / (2.0 * z)).sqrt() as usize;
        let n = n.max(self.bmax);
        match self.candidates_max {
            Some(cap) => n.min(cap),
            None => n,
        }
    }

    pub fn layer_params(&self, slice: u64) -> LayerParams {
        LayerParams { wmax: self.wmax, seed: self.seed ^ slice }
    }
}
