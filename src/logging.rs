//! Structured logging for the active engine.
//!
//! Every record is one JSON object per line:
//! `{"ts","run_id","seq","lvl","component","event","msg","data":{..}}`.
//!
//! The engine never writes to a global logger. A [`Logger`] handle wrapping
//! an injected [`LogSink`] is passed at construction, so tests can capture
//! records with [`MemorySink`] and long runs can write a run directory with
//! [`JsonlSink`].

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fs::{create_dir_all, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

// =============================================================================
// Log Levels
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
    Fatal = 5,
}

impl Level {
    pub fn from_env() -> Self {
        match std::env::var("LOG_LEVEL").as_deref() {
            Ok("trace") => Level::Trace,
            Ok("debug") => Level::Debug,
            Ok("info") => Level::Info,
            Ok("warn") => Level::Warn,
            Ok("error") => Level::Error,
            Ok("fatal") => Level::Fatal,
            _ => Level::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Fatal => "fatal",
        }
    }
}

// =============================================================================
// Log Domains (categories for filtering)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Ingest,  // Event discovery, merge, retire
    Slice,   // Classification and slice bookkeeping
    Induce,  // Candidate selection, layering, integration
    Store,   // Event store reference counting
    Codec,   // Save / load
    System,  // Startup, shutdown, reports
    Profile, // Timing scopes
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Ingest => "ingest",
            Domain::Slice => "slice",
            Domain::Induce => "induce",
            Domain::Store => "store",
            Domain::Codec => "codec",
            Domain::System => "system",
            Domain::Profile => "profile",
        }
    }

    /// `LOG_DOMAINS` is a comma-separated list or "all".
    fn enabled_from_env() -> Option<Vec<String>> {
        match std::env::var("LOG_DOMAINS").as_deref() {
            Ok("all") | Err(_) => None,
            Ok(domains) => Some(domains.split(',').map(|d| d.trim().to_string()).collect()),
        }
    }
}

// =============================================================================
// Records and sinks
// =============================================================================

static LOG_SEQ: AtomicU64 = AtomicU64::new(0);
static PROFILE_SEQ: AtomicU64 = AtomicU64::new(0);

fn next_seq() -> u64 {
    LOG_SEQ.fetch_add(1, Ordering::SeqCst)
}

/// RFC3339 timestamp with milliseconds
pub fn ts_now() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Epoch milliseconds
pub fn ts_epoch_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

#[derive(Debug, Clone)]
pub struct Record {
    pub ts: String,
    pub seq: u64,
    pub level: Level,
    pub component: String,
    pub event: String,
    pub fields: Map<String, Value>,
}

impl Record {
    pub fn to_json(&self, run_id: &str) -> Value {
        let mut data = self.fields.clone();
        let msg = data.remove("msg").unwrap_or(Value::String(String::new()));
        let mut entry = Map::new();
        entry.insert("ts".to_string(), json!(self.ts));
        entry.insert("run_id".to_string(), json!(run_id));
        entry.insert("seq".to_string(), json!(self.seq));
        entry.insert("lvl".to_string(), json!(self.level.as_str().to_uppercase()));
        entry.insert("component".to_string(), json!(self.component));
        entry.insert("event".to_string(), json!(self.event));
        entry.insert("msg".to_string(), msg);
        for key in ["name", "slice", "event_id"] {
            if let Some(value) = data.remove(key) {
                entry.insert(key.to_string(), value);
            }
        }
        entry.insert("data".to_string(), Value::Object(data));
        Value::Object(entry)
    }
}

/// Destination for log records.
pub trait LogSink: Send + Sync {
    fn emit(&self, record: &Record);
}

/// Prints each record as a JSON line on stdout.
#[derive(Debug, Default)]
pub struct StdoutSink;

impl LogSink for StdoutSink {
    fn emit(&self, record: &Record) {
        println!("{}", record.to_json("-"));
    }
}

/// Writes a run directory: `events.jsonl`, `trace.jsonl` and `manifest.json`.
#[derive(Debug)]
pub struct JsonlSink {
    run_id: String,
    events: Mutex<BufWriter<File>>,
    trace: Mutex<BufWriter<File>>,
    echo: bool,
}

impl JsonlSink {
    pub fn create(base: &Path, run_id: String, echo: bool) -> std::io::Result<Self> {
        let mut run_dir = PathBuf::from(base);
        run_dir.push(&run_id);
        create_dir_all(&run_dir)?;
        std::fs::write(
            run_dir.join("manifest.json"),
            json!({
                "run_id": run_id,
                "ts": ts_now(),
                "pid": process::id(),
                "log_dir": run_dir.to_string_lossy(),
            })
            .to_string(),
        )?;
        let events = File::create(run_dir.join("events.jsonl"))?;
        let trace = File::create(run_dir.join("trace.jsonl"))?;
        Ok(Self {
            run_id,
            events: Mutex::new(BufWriter::new(events)),
            trace: Mutex::new(BufWriter::new(trace)),
            echo,
        })
    }

    /// Run directory from `LOG_DIR` (default `out/runs`) and `RUN_ID`.
    pub fn from_env() -> std::io::Result<Self> {
        let run_id = std::env::var("RUN_ID")
            .unwrap_or_else(|_| format!("r-{}-{}", ts_epoch_ms(), process::id()));
        let base = std::env::var("LOG_DIR").unwrap_or_else(|_| "out/runs".to_string());
        Self::create(Path::new(&base), run_id, true)
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }
}

impl LogSink for JsonlSink {
    fn emit(&self, record: &Record) {
        let line = record.to_json(&self.run_id).to_string();
        let writer = match record.level {
            Level::Trace | Level::Debug => &self.trace,
            _ => &self.events,
        };
        {
            let mut w = writer.lock();
            let _ = writeln!(w, "{}", line);
            let _ = w.flush();
        }
        if self.echo {
            println!("{}", line);
        }
    }
}

/// Keeps records in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<Record>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<Record> {
        self.records.lock().clone()
    }

    pub fn events(&self) -> Vec<String> {
        self.records.lock().iter().map(|r| r.event.clone()).collect()
    }

    pub fn count(&self, event: &str) -> usize {
        self.records.lock().iter().filter(|r| r.event == event).count()
    }
}

impl LogSink for MemorySink {
    fn emit(&self, record: &Record) {
        self.records.lock().push(record.clone());
    }
}

// =============================================================================
// Logger handle
// =============================================================================

/// Cheap clonable handle over an injected sink with level and domain filters.
#[derive(Clone)]
pub struct Logger {
    sink: Arc<dyn LogSink>,
    min_level: Level,
    domains: Option<Arc<Vec<String>>>,
}

impl std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Logger").field("min_level", &self.min_level).finish()
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new(Arc::new(StdoutSink))
    }
}

impl Logger {
    /// Level and domain filters are read from `LOG_LEVEL` / `LOG_DOMAINS`.
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        Self {
            sink,
            min_level: Level::from_env(),
            domains: Domain::enabled_from_env().map(Arc::new),
        }
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.min_level = level;
        self
    }

    pub fn enabled(&self, level: Level, domain: Domain) -> bool {
        if level < self.min_level {
            return false;
        }
        match &self.domains {
            None => true,
            Some(list) => list.iter().any(|d| d == domain.as_str()),
        }
    }

    pub fn log(&self, level: Level, domain: Domain, event: &str, fields: Map<String, Value>) {
        if !self.enabled(level, domain) {
            return;
        }
        self.sink.emit(&Record {
            ts: ts_now(),
            seq: next_seq(),
            level,
            component: domain.as_str().to_string(),
            event: event.to_string(),
            fields,
        });
    }

    pub fn info(&self, domain: Domain, event: &str, fields: Map<String, Value>) {
        self.log(Level::Info, domain, event, fields);
    }

    pub fn debug(&self, domain: Domain, event: &str, fields: Map<String, Value>) {
        self.log(Level::Debug, domain, event, fields);
    }

    pub fn warn(&self, domain: Domain, event: &str, fields: Map<String, Value>) {
        self.log(Level::Warn, domain, event, fields);
    }

    pub fn error(&self, domain: Domain, event: &str, fields: Map<String, Value>) {
        self.log(Level::Error, domain, event, fields);
    }

    /// Log a fatal engine error with its kind and source operation.
    pub fn fatal(&self, domain: Domain, name: &str, operation: &str, err: &crate::error::ActiveError) {
        self.log(
            Level::Fatal,
            domain,
            "fatal",
            obj(&[
                ("name", v_str(name)),
                ("operation", v_str(operation)),
                ("kind", v_str(err.kind())),
                ("msg", v_str(&err.to_string())),
            ]),
        );
    }

    /// Checkpoint written by the codec.
    pub fn checkpoint(&self, name: &str, state_hash: &str, bytes: u64, event_id: Option<u64>) {
        self.log(
            Level::Info,
            Domain::Codec,
            "checkpoint",
            obj(&[
                ("name", v_str(name)),
                ("state_hash", v_str(state_hash)),
                ("bytes", json!(bytes)),
                ("event_id", event_id.map(|v| json!(v)).unwrap_or(Value::Null)),
            ]),
        );
    }
}

// =============================================================================
// Field helpers
// =============================================================================

pub fn obj(pairs: &[(&str, Value)]) -> Map<String, Value> {
    let mut map = Map::new();
    for (k, v) in pairs {
        map.insert((*k).to_string(), v.clone());
    }
    map
}

pub fn v_str(s: &str) -> Value {
    Value::String(s.to_string())
}

pub fn v_num(n: f64) -> Value {
    json!(n)
}

pub fn v_u64(n: u64) -> Value {
    json!(n)
}

// =============================================================================
// Profiling Scope
// =============================================================================

/// Profiling scope that emits structured timing on drop.
pub struct ProfileScope {
    logger: Logger,
    label: &'static str,
    context: Option<Map<String, Value>>,
    started: Instant,
    enabled: bool,
}

impl ProfileScope {
    pub fn new(logger: &Logger, label: &'static str, fields: &[(&str, Value)]) -> Self {
        let enabled = logger.enabled(Level::Trace, Domain::Profile) && Self::should_sample();
        Self {
            logger: logger.clone(),
            label,
            context: if enabled { Some(obj(fields)) } else { None },
            started: Instant::now(),
            enabled,
        }
    }

    /// A scope that never emits, for callers with logging switched off.
    pub fn disabled(logger: &Logger) -> Self {
        Self {
            logger: logger.clone(),
            label: "",
            context: None,
            started: Instant::now(),
            enabled: false,
        }
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.started.elapsed().as_secs_f64() * 1000.0
    }

    fn should_sample() -> bool {
        std::env::var("PROFILE_SAMPLE")
            .ok()
            .and_then(|v| v.parse::<f64>().ok())
            .map(|p| {
                if p >= 1.0 {
                    true
                } else if p <= 0.0 {
                    false
                } else {
                    let seq = PROFILE_SEQ.fetch_add(1, Ordering::SeqCst);
                    let bucket = (seq % 10_000) as f64 / 10_000.0;
                    bucket < p
                }
            })
            .unwrap_or(true)
    }
}

impl Drop for ProfileScope {
    fn drop(&mut self) {
        if !self.enabled {
            return;
        }
        let mut fields = self.context.take().unwrap_or_default();
        fields.insert("label".to_string(), v_str(self.label));
        fields.insert("elapsed_ms".to_string(), v_num(self.elapsed_ms()));
        self.logger.log(Level::Trace, Domain::Profile, "profile", fields);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(Level::Trace < Level::Debug);
        assert!(Level::Debug < Level::Info);
        assert!(Level::Info < Level::Warn);
        assert!(Level::Warn < Level::Error);
        assert!(Level::Error < Level::Fatal);
    }

    #[test]
    fn test_obj_helper() {
        let m = obj(&[("key", v_str("value")), ("num", v_num(42.0))]);
        assert_eq!(m.get("key").unwrap(), "value");
        assert_eq!(m.get("num").unwrap(), 42.0);
    }

    #[test]
    fn test_memory_sink_captures() {
        let sink = Arc::new(MemorySink::new());
        let logger = Logger::new(sink.clone()).with_level(Level::Trace);
        logger.info(Domain::Ingest, "applied", obj(&[("slice", v_u64(3))]));
        logger.debug(Domain::Induce, "candidate", Map::new());
        assert_eq!(sink.events(), vec!["applied".to_string(), "candidate".to_string()]);
        assert_eq!(sink.count("applied"), 1);
    }

    #[test]
    fn test_level_filter() {
        let sink = Arc::new(MemorySink::new());
        let logger = Logger::new(sink.clone()).with_level(Level::Warn);
        logger.info(Domain::System, "quiet", Map::new());
        logger.warn(Domain::System, "loud", Map::new());
        assert_eq!(sink.events(), vec!["loud".to_string()]);
    }

    #[test]
    fn test_record_json_shape() {
        let rec = Record {
            ts: ts_now(),
            seq: 7,
            level: Level::Info,
            component: "slice".to_string(),
            event: "applied".to_string(),
            fields: obj(&[("msg", v_str("hello")), ("slice", v_u64(5)), ("x", v_num(1.0))]),
        };
        let v = rec.to_json("run");
        assert_eq!(v["lvl"], "INFO");
        assert_eq!(v["msg"], "hello");
        assert_eq!(v["slice"], 5);
        assert_eq!(v["data"]["x"], 1.0);
    }

    #[test]
    fn test_jsonl_sink_writes_run_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let sink = JsonlSink::create(dir.path(), "r-test".to_string(), false).unwrap();
        let logger = Logger::new(Arc::new(sink)).with_level(Level::Trace);
        logger.info(Domain::System, "started", Map::new());
        let events = std::fs::read_to_string(dir.path().join("r-test").join("events.jsonl")).unwrap();
        assert!(events.contains("\"started\""));
        assert!(dir.path().join("r-test").join("manifest.json").exists());
    }
}
