//! # Pulse Engine - Node-Local Metrics Pipeline
//!
//! An in-process metrics store, windowed aggregation pipeline and query service
//! embedded next to a search-engine node. Request-handling threads emit small
//! text samples into a hierarchical store; a single background aggregator folds
//! completed windows into typed tables; a local HTTP endpoint serves them.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                              PULSE ENGINE                                    │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ADAPTERS → SAMPLE WRITER → WINDOW STORE → AGGREGATOR → TABLES → QUERY HTTP  │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Store Layout
//!
//! ```text
//! <root>/<window-id>/<category>/<dimension>/.../<start|finish|leaf>
//! ```
//!
//! Writers never coordinate with each other or with the reader. Uniqueness of
//! locations comes from per-adapter id counters, and the reader only touches
//! windows whose wall-clock time has fully elapsed.

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================
// External crate imports organized by functionality.
// ============================================================================

#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Debug, Display, Formatter};
use std::fs;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

// ----------------------------------------------------------------------------
// Async Runtime - Tokio
// ----------------------------------------------------------------------------
use tokio::net::TcpListener as TokioTcpListener;
use tokio::signal;
use tokio::task::{self, JoinHandle as TokioJoinHandle};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

// ----------------------------------------------------------------------------
// Concurrency Primitives - Crossbeam & Parking Lot
// ----------------------------------------------------------------------------
use crossbeam::atomic::AtomicCell;
use crossbeam::utils::CachePadded;
use parking_lot::Mutex;
use rayon::prelude::*;

// ----------------------------------------------------------------------------
// Lock-Free Data Structures
// ----------------------------------------------------------------------------
use arc_swap::ArcSwap;
use dashmap::DashMap;

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::json;

// ----------------------------------------------------------------------------
// String & Memory Optimization
// ----------------------------------------------------------------------------
use compact_str::CompactString;
use smallvec::SmallVec;

// ----------------------------------------------------------------------------
// Hashing
// ----------------------------------------------------------------------------
use ahash::{AHashMap, AHashSet};

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use anyhow::{Context as AnyhowContext, Result as AnyhowResult};
use thiserror::Error;

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::{debug, error, info, instrument, trace, warn};
use tracing_subscriber::{fmt as tracing_fmt, layer::SubscriberExt, EnvFilter};

// ----------------------------------------------------------------------------
// Time & Timestamps
// ----------------------------------------------------------------------------
use chrono::{DateTime, Utc};

// ----------------------------------------------------------------------------
// HTTP Surface
// ----------------------------------------------------------------------------
use axum::{
    extract::{RawQuery, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

// ----------------------------------------------------------------------------
// UUID & Identifiers
// ----------------------------------------------------------------------------
use uuid::Uuid;

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};

// ----------------------------------------------------------------------------
// CLI
// ----------------------------------------------------------------------------
use clap::{Parser, Subcommand};

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================
// Global constants that define the behavior and limits of the engine.
// ============================================================================

/// Engine version - follows semantic versioning
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ENGINE_NAME: &str = "pulse-engine";
pub const ENGINE_FULL_NAME: &str = "Pulse Metrics Engine";

// ----------------------------------------------------------------------------
// Windowing & Retention
// ----------------------------------------------------------------------------

/// Default window duration (milliseconds)
pub const DEFAULT_WINDOW_MS: u64 = 5_000;

/// Smallest window the engine accepts (milliseconds)
pub const MIN_WINDOW_MS: u64 = 100;

/// Default number of windows kept on the medium
pub const DEFAULT_RETENTION_WINDOWS: usize = 3;

/// Default number of earlier windows searched for a matching `start`
pub const DEFAULT_LOOKBACK_WINDOWS: usize = 1;

/// Delay after a window boundary before the aggregator reads the closed window
pub const DEFAULT_AGGREGATION_DELAY_MS: u64 = 500;

/// Upper bound for the parse pool size
pub const MAX_PARSE_THREADS: usize = 256;

// ----------------------------------------------------------------------------
// Storage
// ----------------------------------------------------------------------------

/// Default root of the on-disk store (memory-backed on Linux)
pub const DEFAULT_STORE_ROOT: &str = "/dev/shm/pulse";

/// Maximum length of a single path segment (bytes)
pub const MAX_SEGMENT_LENGTH: usize = 255;

// ----------------------------------------------------------------------------
// Sample Format
// ----------------------------------------------------------------------------

/// Key of the mandatory first pair in every sample body
pub const CURRENT_TIME_KEY: &str = "current_time";

/// Separator between pairs
pub const PAIR_DELIMITER: char = '\n';

/// Separator between key and value
pub const KEY_VALUE_DELIMITER: char = '=';

// ----------------------------------------------------------------------------
// Query Surface
// ----------------------------------------------------------------------------

/// Default HTTP query port
pub const DEFAULT_QUERY_PORT: u16 = 9650;

/// Default query deadline (milliseconds)
pub const DEFAULT_QUERY_TIMEOUT_MS: u64 = 5_000;

/// Path of the query endpoint
pub const QUERY_PATH: &str = "/_pulse/metrics";

/// Path of the health endpoint
pub const HEALTH_PATH: &str = "/_pulse/health";

/// Grace period for shutdown (seconds)
pub const SHUTDOWN_GRACE_PERIOD_SECS: u64 = 30;

// ============================================================================
// SECTION 3: CORE TYPE SYSTEM
// ============================================================================
// The fundamental data types shared by writers, the store, the aggregator and
// the query service.
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Timestamp Types - Millisecond Wall-Clock Time
// ----------------------------------------------------------------------------

/// Wall-clock timestamp in milliseconds since Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Create a timestamp from milliseconds since Unix epoch
    #[inline]
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// Create a timestamp from seconds since Unix epoch
    #[inline]
    pub const fn from_secs(secs: i64) -> Self {
        Self(secs * 1_000)
    }

    /// Current wall-clock time
    #[inline]
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_millis() as i64)
    }

    /// Milliseconds value
    #[inline]
    pub const fn as_millis(&self) -> i64 {
        self.0
    }

    /// Duration elapsed since an earlier timestamp (zero if `earlier` is later)
    #[inline]
    pub fn duration_since(&self, earlier: Timestamp) -> Duration {
        let millis = self.0.saturating_sub(earlier.0);
        Duration::from_millis(millis.max(0) as u64)
    }

    /// Add duration to timestamp
    #[inline]
    pub fn add_duration(&self, duration: Duration) -> Self {
        Self(self.0.saturating_add(duration.as_millis() as i64))
    }

    /// Convert to chrono DateTime<Utc>
    #[inline]
    pub fn to_datetime(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.0).unwrap_or_default()
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_datetime().format("%Y-%m-%d %H:%M:%S%.3f UTC"))
    }
}

impl From<i64> for Timestamp {
    #[inline]
    fn from(millis: i64) -> Self {
        Self(millis)
    }
}

impl From<SystemTime> for Timestamp {
    fn from(st: SystemTime) -> Self {
        let duration = st.duration_since(UNIX_EPOCH).unwrap_or_default();
        Self(duration.as_millis() as i64)
    }
}

// ----------------------------------------------------------------------------
// 3.2 Time Sources - Injectable Clocks
// ----------------------------------------------------------------------------

/// Source of "now" for windowing decisions.
pub trait TimeSource: Send + Sync + Debug {
    fn now(&self) -> Timestamp;
}

/// Reads the system wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    #[inline]
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

/// A clock that only moves when told to. Used by tests and replay tooling.
#[derive(Debug)]
pub struct ManualTimeSource(AtomicI64);

impl ManualTimeSource {
    pub fn new(start: Timestamp) -> Self {
        Self(AtomicI64::new(start.as_millis()))
    }

    pub fn set(&self, ts: Timestamp) {
        self.0.store(ts.as_millis(), AtomicOrdering::Release);
    }

    pub fn advance(&self, by: Duration) -> Timestamp {
        let delta = by.as_millis() as i64;
        Timestamp(self.0.fetch_add(delta, AtomicOrdering::AcqRel) + delta)
    }
}

impl TimeSource for ManualTimeSource {
    fn now(&self) -> Timestamp {
        Timestamp(self.0.load(AtomicOrdering::Acquire))
    }
}

// ----------------------------------------------------------------------------
// 3.3 Windows - Fixed-Duration Time Buckets
// ----------------------------------------------------------------------------

/// Identifier of a window: its start time in epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct WindowId(i64);

impl WindowId {
    #[inline]
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    #[inline]
    pub const fn as_millis(&self) -> i64 {
        self.0
    }
}

impl Display for WindowId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for WindowId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<i64>().map(WindowId)
    }
}

/// Window geometry shared by writers, the store and the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSpec {
    duration_ms: i64,
}

impl WindowSpec {
    /// Create a window spec. Durations below one millisecond are clamped.
    pub fn new(duration: Duration) -> Self {
        Self {
            duration_ms: (duration.as_millis() as i64).max(1),
        }
    }

    #[inline]
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms as u64)
    }

    /// `floor(ts / W) * W`
    #[inline]
    pub fn window_of(&self, ts: Timestamp) -> WindowId {
        WindowId(ts.as_millis().div_euclid(self.duration_ms) * self.duration_ms)
    }

    /// Window `n` positions before `window`
    #[inline]
    pub fn preceding(&self, window: WindowId, n: usize) -> WindowId {
        WindowId(window.0.saturating_sub(self.duration_ms.saturating_mul(n as i64)))
    }

    /// First instant of the window after the one containing `ts`
    #[inline]
    pub fn next_boundary(&self, ts: Timestamp) -> Timestamp {
        Timestamp(self.window_of(ts).0 + self.duration_ms)
    }
}

impl Default for WindowSpec {
    fn default() -> Self {
        Self::new(Duration::from_millis(DEFAULT_WINDOW_MS))
    }
}

// ----------------------------------------------------------------------------
// 3.4 Phases & Terminals - Leaf of a Storage Location
// ----------------------------------------------------------------------------

/// Lifecycle marker pairing two samples of one logical operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Start,
    Finish,
}

impl Phase {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Phase::Start => "start",
            Phase::Finish => "finish",
        }
    }
}

impl Display for Phase {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(Phase::Start),
            "finish" => Ok(Phase::Finish),
            _ => Err(()),
        }
    }
}

/// Last path segment of a location.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Terminal {
    /// `start` / `finish` of a lifecycle category
    Phase(Phase),
    /// Fixed leaf name of a point category
    Point(CompactString),
}

impl Terminal {
    pub fn as_str(&self) -> &str {
        match self {
            Terminal::Phase(phase) => phase.as_str(),
            Terminal::Point(leaf) => leaf.as_str(),
        }
    }

    pub fn phase(&self) -> Option<Phase> {
        match self {
            Terminal::Phase(phase) => Some(*phase),
            Terminal::Point(_) => None,
        }
    }

    fn from_segment(segment: &str) -> Self {
        match segment.parse::<Phase>() {
            Ok(phase) => Terminal::Phase(phase),
            Err(()) => Terminal::Point(CompactString::from(segment)),
        }
    }
}

impl Display for Terminal {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ----------------------------------------------------------------------------
// 3.5 Field Values - Typed Cells
// ----------------------------------------------------------------------------

/// A typed value carried by a sample and stored in an aggregate table cell.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(CompactString),
    Integer(i64),
    Float(f64),
}

impl FieldValue {
    /// Numeric view used by grouped aggregations
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Integer(v) => Some(*v as f64),
            FieldValue::Float(v) => Some(*v),
            FieldValue::Text(_) => None,
        }
    }
}

impl Display for FieldValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Text(v) => f.write_str(v),
            FieldValue::Integer(v) => write!(f, "{}", v),
            FieldValue::Float(v) => write!(f, "{}", v),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Text(CompactString::from(v))
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Text(CompactString::from(v))
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Integer(v)
    }
}

impl From<u64> for FieldValue {
    fn from(v: u64) -> Self {
        FieldValue::Integer(v as i64)
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        FieldValue::Integer(v as i64)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

// ----------------------------------------------------------------------------
// 3.6 Category Schemas - Declarative Sample Layouts
// ----------------------------------------------------------------------------

/// Role a field plays in a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldKind {
    /// Groupable attribute
    Dimension,
    /// Aggregatable measurement
    Metric,
    /// Time column derived from `current_time`
    Time,
}

/// Declared value type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldType {
    Text,
    Integer,
    Float,
}

impl FieldType {
    /// Type name reported by the query endpoint
    pub const fn sql_name(&self) -> &'static str {
        match self {
            FieldType::Text => "VARCHAR",
            FieldType::Integer => "BIGINT",
            FieldType::Float => "DOUBLE",
        }
    }

    /// Convert a raw body value into a typed value
    pub fn parse(&self, raw: &str) -> Option<FieldValue> {
        match self {
            FieldType::Text => Some(FieldValue::Text(CompactString::from(raw))),
            FieldType::Integer => raw.trim().parse::<i64>().ok().map(FieldValue::Integer),
            FieldType::Float => raw
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .map(FieldValue::Float),
        }
    }
}

/// One declared body field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDef {
    pub name: CompactString,
    pub kind: FieldKind,
    pub ty: FieldType,
    pub required: bool,
}

impl FieldDef {
    pub fn dimension(name: &str, ty: FieldType) -> Self {
        Self {
            name: CompactString::from(name),
            kind: FieldKind::Dimension,
            ty,
            required: false,
        }
    }

    pub fn metric(name: &str, ty: FieldType) -> Self {
        Self {
            name: CompactString::from(name),
            kind: FieldKind::Metric,
            ty,
            required: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// How samples of a category are laid out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SampleShape {
    /// Paired `start` / `finish` samples
    Lifecycle {
        start: Vec<FieldDef>,
        finish: Vec<FieldDef>,
    },
    /// Single samples under a fixed leaf name
    Point { leaf: CompactString, fields: Vec<FieldDef> },
}

/// Schema of one metric category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategorySchema {
    pub name: CompactString,
    /// Dimension keys encoded in the path, in order
    pub path_keys: Vec<CompactString>,
    pub shape: SampleShape,
    /// Query keys that must be present when querying this category
    pub required_filters: Vec<CompactString>,
}

impl CategorySchema {
    pub fn lifecycle(name: &str, path_keys: &[&str], start: Vec<FieldDef>, finish: Vec<FieldDef>) -> Self {
        Self {
            name: CompactString::from(name),
            path_keys: path_keys.iter().map(|k| CompactString::from(*k)).collect(),
            shape: SampleShape::Lifecycle { start, finish },
            required_filters: Vec::new(),
        }
    }

    pub fn point(name: &str, path_keys: &[&str], leaf: &str, fields: Vec<FieldDef>) -> Self {
        Self {
            name: CompactString::from(name),
            path_keys: path_keys.iter().map(|k| CompactString::from(*k)).collect(),
            shape: SampleShape::Point {
                leaf: CompactString::from(leaf),
                fields,
            },
            required_filters: Vec::new(),
        }
    }

    pub fn with_required_filter(mut self, key: &str) -> Self {
        self.required_filters.push(CompactString::from(key));
        self
    }

    pub fn is_lifecycle(&self) -> bool {
        matches!(self.shape, SampleShape::Lifecycle { .. })
    }

    /// Fields allowed in a body written under `terminal`
    pub fn fields_for(&self, terminal: &Terminal) -> Option<&[FieldDef]> {
        match (&self.shape, terminal) {
            (SampleShape::Lifecycle { start, .. }, Terminal::Phase(Phase::Start)) => Some(start),
            (SampleShape::Lifecycle { finish, .. }, Terminal::Phase(Phase::Finish)) => Some(finish),
            (SampleShape::Point { leaf, fields }, Terminal::Point(name)) if leaf == name => Some(fields),
            _ => None,
        }
    }

    /// Expected terminal for a write with the given phase
    pub fn terminal_for(&self, phase: Option<Phase>) -> Option<Terminal> {
        match (&self.shape, phase) {
            (SampleShape::Lifecycle { .. }, Some(phase)) => Some(Terminal::Phase(phase)),
            (SampleShape::Point { leaf, .. }, None) => Some(Terminal::Point(leaf.clone())),
            _ => None,
        }
    }

    /// Columns of the aggregate table built for this category
    pub fn columns(&self) -> Vec<ColumnDef> {
        let mut columns: Vec<ColumnDef> = self
            .path_keys
            .iter()
            .map(|key| ColumnDef::new(key.clone(), FieldKind::Dimension, FieldType::Text))
            .collect();
        let mut seen: AHashSet<CompactString> = self.path_keys.iter().cloned().collect();

        let mut push_fields = |fields: &[FieldDef], columns: &mut Vec<ColumnDef>| {
            for field in fields {
                if seen.insert(field.name.clone()) {
                    columns.push(ColumnDef::new(field.name.clone(), field.kind, field.ty));
                }
            }
        };

        match &self.shape {
            SampleShape::Lifecycle { start, finish } => {
                push_fields(start, &mut columns);
                push_fields(finish, &mut columns);
                columns.push(ColumnDef::new("start_time".into(), FieldKind::Time, FieldType::Integer));
                columns.push(ColumnDef::new("finish_time".into(), FieldKind::Time, FieldType::Integer));
                columns.push(ColumnDef::new("latency_ms".into(), FieldKind::Metric, FieldType::Integer));
            }
            SampleShape::Point { fields, .. } => {
                push_fields(fields, &mut columns);
                columns.push(ColumnDef::new("sample_time".into(), FieldKind::Time, FieldType::Integer));
            }
        }
        columns
    }
}

/// Registry of category schemas, fixed once the engine starts.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: AHashMap<CompactString, Arc<CategorySchema>>,
}

impl SchemaRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the node's built-in categories
    pub fn builtin() -> Self {
        use FieldType::*;

        let mut registry = Self::new();
        let builtins = [
            CategorySchema::lifecycle(
                "http",
                &["rid"],
                vec![
                    FieldDef::dimension("indices", Text).required(),
                    FieldDef::dimension("operation", Text),
                    FieldDef::metric("docs", Integer),
                ],
                vec![
                    FieldDef::dimension("status", Integer).required(),
                    FieldDef::dimension("exception", Text),
                    FieldDef::metric("response_bytes", Integer),
                ],
            ),
            CategorySchema::lifecycle(
                "shard_bulk",
                &["index", "shard", "rid"],
                vec![
                    FieldDef::dimension("primary", Text),
                    FieldDef::metric("docs", Integer).required(),
                ],
                vec![
                    FieldDef::dimension("status", Integer).required(),
                    FieldDef::metric("failed_docs", Integer),
                ],
            ),
            CategorySchema::point(
                "thread_cpu",
                &["thread_id"],
                "os_metrics",
                vec![
                    FieldDef::dimension("thread_name", Text),
                    FieldDef::metric("cpu_utilization", Float).required(),
                    FieldDef::metric("resident_memory", Integer),
                    FieldDef::metric("minor_faults", Integer),
                    FieldDef::metric("major_faults", Integer),
                ],
            ),
            CategorySchema::point(
                "disk",
                &["device"],
                "disk_metrics",
                vec![
                    FieldDef::metric("utilization", Float).required(),
                    FieldDef::metric("await_ms", Float),
                    FieldDef::metric("service_rate", Float),
                ],
            ),
        ];
        for schema in builtins {
            registry
                .schemas
                .insert(schema.name.clone(), Arc::new(schema));
        }
        registry
    }

    /// Register an additional category. Names and keys must be valid path segments.
    pub fn register(&mut self, schema: CategorySchema) -> Result<(), AddressError> {
        validate_segment(&schema.name)?;
        for key in &schema.path_keys {
            validate_segment(key)?;
        }
        if let SampleShape::Point { leaf, .. } = &schema.shape {
            validate_segment(leaf)?;
            if leaf.parse::<Phase>().is_ok() {
                return Err(AddressError::InvalidSegment {
                    segment: leaf.to_string(),
                    reason: "point leaf may not be a phase name",
                });
            }
        }
        self.schemas.insert(schema.name.clone(), Arc::new(schema));
        Ok(())
    }

    pub fn get(&self, category: &str) -> Option<&Arc<CategorySchema>> {
        self.schemas.get(category)
    }

    /// Registered category names, sorted
    pub fn categories(&self) -> Vec<CompactString> {
        let mut names: Vec<_> = self.schemas.keys().cloned().collect();
        names.sort();
        names
    }
}

// ----------------------------------------------------------------------------
// 3.7 Metric Samples - Immutable key=value Text Blocks
// ----------------------------------------------------------------------------

/// An ordered block of `key=value` pairs whose first pair is `current_time`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricSample {
    pairs: Vec<(CompactString, CompactString)>,
}

impl MetricSample {
    /// Start a sample stamped with `current_time`
    pub fn new(current_time: Timestamp) -> Self {
        let mut pairs = Vec::with_capacity(8);
        pairs.push((
            CompactString::from(CURRENT_TIME_KEY),
            CompactString::from(current_time.as_millis().to_string()),
        ));
        Self { pairs }
    }

    /// Append a pair. Keys are unique and neither part may break the framing.
    pub fn insert(&mut self, key: &str, value: impl Display) -> Result<(), SampleError> {
        if key.is_empty() || key.contains(KEY_VALUE_DELIMITER) || key.contains(PAIR_DELIMITER) {
            return Err(SampleError::InvalidKey { key: key.to_string() });
        }
        if self.pairs.iter().any(|(k, _)| k.as_str() == key) {
            return Err(SampleError::DuplicateKey { key: key.to_string() });
        }
        let value = CompactString::from(value.to_string());
        if value.contains(PAIR_DELIMITER) {
            return Err(SampleError::InvalidValue { key: key.to_string() });
        }
        self.pairs.push((CompactString::from(key), value));
        Ok(())
    }

    /// Builder-style `insert`
    pub fn with(mut self, key: &str, value: impl Display) -> Result<Self, SampleError> {
        self.insert(key, value)?;
        Ok(self)
    }

    pub fn current_time(&self) -> Timestamp {
        self.pairs
            .first()
            .and_then(|(_, v)| v.parse::<i64>().ok())
            .map(Timestamp::from_millis)
            .unwrap_or(Timestamp::from_millis(0))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k.as_str() == key)
            .map(|(_, v)| v.as_str())
    }

    /// Pairs after the `current_time` marker
    pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().skip(1).map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Render the on-medium text form
    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(self.pairs.len() * 24);
        for (i, (k, v)) in self.pairs.iter().enumerate() {
            if i > 0 {
                out.push(PAIR_DELIMITER);
            }
            out.push_str(k);
            out.push(KEY_VALUE_DELIMITER);
            out.push_str(v);
        }
        out
    }

    /// Parse the on-medium text form. Blank lines are tolerated.
    pub fn decode(body: &str) -> Result<Self, ParseError> {
        let mut pairs: Vec<(CompactString, CompactString)> = Vec::new();
        for line in body.split(PAIR_DELIMITER) {
            let line = line.trim_end_matches('\r');
            if line.trim().is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once(KEY_VALUE_DELIMITER)
                .ok_or_else(|| ParseError::MissingDelimiter { line: line.to_string() })?;
            if key.is_empty() {
                return Err(ParseError::MissingDelimiter { line: line.to_string() });
            }
            if pairs.iter().any(|(k, _)| k.as_str() == key) {
                return Err(ParseError::DuplicateKey { key: key.to_string() });
            }
            pairs.push((CompactString::from(key), CompactString::from(value)));
        }

        match pairs.first() {
            Some((key, value)) if key.as_str() == CURRENT_TIME_KEY => {
                if value.trim().parse::<i64>().is_err() {
                    return Err(ParseError::InvalidCurrentTime { value: value.to_string() });
                }
            }
            _ => return Err(ParseError::MissingCurrentTime),
        }
        Ok(Self { pairs })
    }
}

impl Display for MetricSample {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================
// Error types for every subsystem of the pipeline.
// Designed for:
// - Clear error categorization
// - Easy error propagation with context
// - Recovery strategy hints
// ============================================================================

// ----------------------------------------------------------------------------
// 4.1 Core Engine Errors
// ----------------------------------------------------------------------------

/// The main error type for the Pulse engine.
/// All subsystem errors can be converted to this type.
#[derive(Error, Debug)]
pub enum PulseError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Addressing error: {0}")]
    Address(#[from] AddressError),

    #[error("Sample error: {0}")]
    Sample(#[from] SampleError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Aggregator error: {0}")]
    Aggregator(#[from] AggregatorError),

    #[error("Query error: {0}")]
    Query(#[from] QueryError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl PulseError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            PulseError::Config(_) => false,
            PulseError::Address(_) => true,
            PulseError::Sample(_) => true,
            PulseError::Store(e) => e.is_recoverable(),
            PulseError::Parse(_) => true,
            PulseError::Aggregator(_) => true,
            PulseError::Query(_) => true,
            PulseError::Io(_) => true,
            PulseError::Internal(_) => false,
            PulseError::ShuttingDown => false,
        }
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            PulseError::Config(_) => "config",
            PulseError::Address(_) => "address",
            PulseError::Sample(_) => "sample",
            PulseError::Store(_) => "store",
            PulseError::Parse(_) => "parse",
            PulseError::Aggregator(_) => "aggregator",
            PulseError::Query(_) => "query",
            PulseError::Io(_) => "io",
            PulseError::Internal(_) => "internal",
            PulseError::ShuttingDown => "shutdown",
        }
    }

    /// Get suggested recovery action
    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            PulseError::Config(_) => RecoveryHint::FixConfiguration,
            PulseError::Address(_) | PulseError::Sample(_) => RecoveryHint::Skip,
            PulseError::Store(e) => e.recovery_hint(),
            PulseError::Parse(_) => RecoveryHint::Skip,
            PulseError::Aggregator(_) => RecoveryHint::RestartComponent,
            PulseError::Query(_) => RecoveryHint::None,
            PulseError::ShuttingDown => RecoveryHint::None,
            _ => RecoveryHint::AlertOperator,
        }
    }
}

/// Hints for how to recover from an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryHint {
    /// No recovery needed or possible
    None,
    /// Drop this item and continue
    Skip,
    /// Restart the component from scratch
    RestartComponent,
    /// Fix configuration and restart
    FixConfiguration,
    /// Alert operator for manual intervention
    AlertOperator,
}

// ----------------------------------------------------------------------------
// 4.2 Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.3 Addressing Errors
// ----------------------------------------------------------------------------

/// Errors raised while mapping a sample to its storage location
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("Unknown metric category '{category}'")]
    UnknownCategory { category: String },

    #[error("Category '{category}' expects {expected} path segments, got {actual}")]
    InvalidDimensionCount {
        category: String,
        expected: usize,
        actual: usize,
    },

    #[error("Category '{category}' requires path dimension '{key}'")]
    MissingDimension { category: String, key: String },

    #[error("Invalid path segment '{segment}': {reason}")]
    InvalidSegment { segment: String, reason: &'static str },

    #[error("Category '{category}' is a {shape} category; phase {phase:?} does not apply")]
    PhaseMismatch {
        category: String,
        shape: &'static str,
        phase: Option<Phase>,
    },
}

// ----------------------------------------------------------------------------
// 4.4 Sample Errors
// ----------------------------------------------------------------------------

/// Errors building a sample body on the write side
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SampleError {
    #[error("Invalid sample key '{key}'")]
    InvalidKey { key: String },

    #[error("Value of '{key}' contains a pair delimiter")]
    InvalidValue { key: String },

    #[error("Duplicate sample key '{key}'")]
    DuplicateKey { key: String },
}

// ----------------------------------------------------------------------------
// 4.5 Storage Errors
// ----------------------------------------------------------------------------

/// Errors from the shared sample medium
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Write to '{location}' failed: {source}")]
    WriteFailed {
        location: String,
        #[source]
        source: io::Error,
    },

    #[error("Read of '{location}' failed: {source}")]
    ReadFailed {
        location: String,
        #[source]
        source: io::Error,
    },

    #[error("Listing '{target}' failed: {source}")]
    ListFailed {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("Removing window {window} failed: {source}")]
    RemoveFailed {
        window: WindowId,
        #[source]
        source: io::Error,
    },

    #[error("Body at '{location}' is not valid UTF-8")]
    InvalidEncoding { location: String },
}

impl StoreError {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, StoreError::ListFailed { .. })
    }

    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            StoreError::WriteFailed { .. } | StoreError::InvalidEncoding { .. } => RecoveryHint::Skip,
            StoreError::ReadFailed { .. } => RecoveryHint::RestartComponent,
            StoreError::ListFailed { .. } => RecoveryHint::AlertOperator,
            StoreError::RemoveFailed { .. } => RecoveryHint::None,
        }
    }
}

// ----------------------------------------------------------------------------
// 4.6 Parse Errors
// ----------------------------------------------------------------------------

/// Per-sample problems found by the reader. Never fatal to a pass.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Line without key/value delimiter: '{line}'")]
    MissingDelimiter { line: String },

    #[error("Sample does not start with '{}'", CURRENT_TIME_KEY)]
    MissingCurrentTime,

    #[error("Invalid current time '{value}'")]
    InvalidCurrentTime { value: String },

    #[error("Duplicate key '{key}'")]
    DuplicateKey { key: String },

    #[error("Unknown category '{category}'")]
    UnknownCategory { category: String },

    #[error("Location '{location}' does not match schema: {reason}")]
    Structural { location: String, reason: &'static str },

    #[error("Field '{field}' is not declared for {category}/{terminal}")]
    UnknownField {
        category: String,
        terminal: String,
        field: String,
    },

    #[error("Required field '{field}' missing for {category}/{terminal}")]
    MissingField {
        category: String,
        terminal: String,
        field: String,
    },

    #[error("Field '{field}' has invalid {expected:?} value '{value}'")]
    InvalidValue {
        field: String,
        expected: FieldType,
        value: String,
    },

    #[error("Body at '{location}' is not valid UTF-8")]
    InvalidEncoding { location: String },
}

// ----------------------------------------------------------------------------
// 4.7 Aggregator Errors
// ----------------------------------------------------------------------------

/// Errors escaping an aggregation pass. Each one restarts the worker.
#[derive(Error, Debug)]
pub enum AggregatorError {
    #[error("Store failure during pass: {0}")]
    Store(#[from] StoreError),

    #[error("Aggregation worker crashed: {message}")]
    WorkerCrashed { message: String },

    #[error("Parse pool unavailable: {message}")]
    PoolUnavailable { message: String },
}

// ----------------------------------------------------------------------------
// 4.8 Query Errors
// ----------------------------------------------------------------------------

/// Errors surfaced to query callers as structured responses
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error("No table for category '{category}'")]
    UnknownCategory { category: String },

    #[error("Malformed query: '{key}' {message}")]
    MalformedQuery { key: String, message: String },
}

impl QueryError {
    pub fn malformed(key: impl Into<String>, message: impl Into<String>) -> Self {
        QueryError::MalformedQuery {
            key: key.into(),
            message: message.into(),
        }
    }

    /// HTTP status the query endpoint answers with
    pub fn status_code(&self) -> StatusCode {
        match self {
            QueryError::UnknownCategory { .. } => StatusCode::NOT_FOUND,
            QueryError::MalformedQuery { .. } => StatusCode::BAD_REQUEST,
        }
    }

    /// Stable machine-readable name
    pub fn kind(&self) -> &'static str {
        match self {
            QueryError::UnknownCategory { .. } => "unknown_category",
            QueryError::MalformedQuery { .. } => "malformed_query",
        }
    }
}

// ----------------------------------------------------------------------------
// 4.9 Result Type Aliases
// ----------------------------------------------------------------------------

/// Standard result type for Pulse operations
pub type PulseResult<T> = Result<T, PulseError>;

/// Result type for medium operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Result type for sample parsing
pub type ParseResult<T> = Result<T, ParseError>;

// ----------------------------------------------------------------------------
// 4.10 Pipeline Statistics Tracking
// ----------------------------------------------------------------------------

/// Counters shared by every stage of the pipeline.
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub samples_written: AtomicU64,
    pub write_failures: AtomicU64,
    pub samples_read: AtomicU64,
    pub parse_errors: AtomicU64,
    pub passes: AtomicU64,
    pub windows_processed: AtomicU64,
    pub windows_evicted: AtomicU64,
    pub aggregator_restarts: AtomicU64,
    pub queries: AtomicU64,
    pub query_errors: AtomicU64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, AtomicOrdering::Relaxed);
    }

    pub fn snapshot(&self) -> PipelineStatsSnapshot {
        let load = |c: &AtomicU64| c.load(AtomicOrdering::Relaxed);
        PipelineStatsSnapshot {
            samples_written: load(&self.samples_written),
            write_failures: load(&self.write_failures),
            samples_read: load(&self.samples_read),
            parse_errors: load(&self.parse_errors),
            passes: load(&self.passes),
            windows_processed: load(&self.windows_processed),
            windows_evicted: load(&self.windows_evicted),
            aggregator_restarts: load(&self.aggregator_restarts),
            queries: load(&self.queries),
            query_errors: load(&self.query_errors),
        }
    }
}

/// Point-in-time copy of [`PipelineStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStatsSnapshot {
    pub samples_written: u64,
    pub write_failures: u64,
    pub samples_read: u64,
    pub parse_errors: u64,
    pub passes: u64,
    pub windows_processed: u64,
    pub windows_evicted: u64,
    pub aggregator_restarts: u64,
    pub queries: u64,
    pub query_errors: u64,
}

// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================
// Configuration management with:
// - TOML file parsing
// - Environment variable overrides (PULSE_ prefix, `__` for nesting)
// - Validation
// - Sensible defaults
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration for the engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub engine: GeneralConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub aggregator: AggregatorConfig,

    #[serde(default)]
    pub query: QueryConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("PULSE_").split("__"));

        let config: Self = figment.extract().map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, for running without a file
    pub fn from_env() -> Result<Self, ConfigError> {
        let config: Self = Figment::new()
            .merge(figment::providers::Serialized::defaults(Self::default()))
            .merge(Env::prefixed("PULSE_").split("__"))
            .extract()
            .map_err(|e| ConfigError::ParseError {
                message: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Load from string (for testing)
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let window = self.store.window;
        if window < Duration::from_millis(MIN_WINDOW_MS) {
            return Err(ConfigError::invalid_value(
                "store.window",
                format!("window must be at least {}ms", MIN_WINDOW_MS),
            ));
        }
        if window.subsec_nanos() % 1_000_000 != 0 {
            return Err(ConfigError::invalid_value(
                "store.window",
                "window must be a whole number of milliseconds",
            ));
        }

        // The reader needs the current window, the closed one and its lookback.
        let min_retention = self.aggregator.lookback_windows + 2;
        if self.store.retention_windows < min_retention {
            return Err(ConfigError::invalid_value(
                "store.retention_windows",
                format!(
                    "must be at least lookback_windows + 2 = {}",
                    min_retention
                ),
            ));
        }

        if self.aggregator.delay >= window {
            return Err(ConfigError::invalid_value(
                "aggregator.delay",
                "settle delay must be shorter than the window",
            ));
        }

        if self.aggregator.parse_threads > MAX_PARSE_THREADS {
            return Err(ConfigError::invalid_value(
                "aggregator.parse_threads",
                format!("cannot exceed {}", MAX_PARSE_THREADS),
            ));
        }

        Ok(())
    }

    /// Create a default config file
    pub fn generate_default_config() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }

    /// Window geometry derived from the store section
    pub fn window_spec(&self) -> WindowSpec {
        WindowSpec::new(self.store.window)
    }

    /// Get effective parse pool size (auto-detect if 0)
    pub fn effective_parse_threads(&self) -> usize {
        if self.aggregator.parse_threads == 0 {
            num_cpus().min(MAX_PARSE_THREADS)
        } else {
            self.aggregator.parse_threads
        }
    }
}

// ----------------------------------------------------------------------------
// 5.2 General Engine Configuration
// ----------------------------------------------------------------------------

/// General engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Engine instance name (for identification)
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    /// Graceful shutdown timeout in seconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            instance_name: default_instance_name(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

fn default_instance_name() -> String {
    ENGINE_NAME.into()
}

fn default_shutdown_timeout() -> u64 {
    SHUTDOWN_GRACE_PERIOD_SECS
}

// ----------------------------------------------------------------------------
// 5.3 Store Configuration
// ----------------------------------------------------------------------------

/// Physical medium backing the sample store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local map; samples vanish with the process
    Memory,
    /// Directory tree under `root` (use a tmpfs such as /dev/shm)
    Filesystem,
}

/// Sample store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,

    /// Root directory of the filesystem backend
    #[serde(default = "default_store_root")]
    pub root: PathBuf,

    /// Window duration W
    #[serde(default = "default_window", with = "humantime_serde")]
    pub window: Duration,

    /// Number of most recent windows kept (K)
    #[serde(default = "default_retention_windows")]
    pub retention_windows: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            root: default_store_root(),
            window: default_window(),
            retention_windows: default_retention_windows(),
        }
    }
}

fn default_backend() -> StoreBackend {
    StoreBackend::Filesystem
}

fn default_store_root() -> PathBuf {
    PathBuf::from(DEFAULT_STORE_ROOT)
}

fn default_window() -> Duration {
    Duration::from_millis(DEFAULT_WINDOW_MS)
}

fn default_retention_windows() -> usize {
    DEFAULT_RETENTION_WINDOWS
}

// ----------------------------------------------------------------------------
// 5.4 Aggregator Configuration
// ----------------------------------------------------------------------------

/// Reader/aggregator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorConfig {
    /// Earlier windows searched for the `start` of a `finish`
    #[serde(default = "default_lookback_windows")]
    pub lookback_windows: usize,

    /// Settle time after a boundary before the closed window is read
    #[serde(default = "default_aggregation_delay", with = "humantime_serde")]
    pub delay: Duration,

    /// Parse pool size (0 = one per CPU)
    #[serde(default)]
    pub parse_threads: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            lookback_windows: default_lookback_windows(),
            delay: default_aggregation_delay(),
            parse_threads: 0,
        }
    }
}

fn default_lookback_windows() -> usize {
    DEFAULT_LOOKBACK_WINDOWS
}

fn default_aggregation_delay() -> Duration {
    Duration::from_millis(DEFAULT_AGGREGATION_DELAY_MS)
}

// ----------------------------------------------------------------------------
// 5.5 Query Configuration
// ----------------------------------------------------------------------------

/// Query endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Listening port; unset, zero or unparsable values fall back to the default
    #[serde(default = "default_query_port", deserialize_with = "deserialize_port")]
    pub port: u16,

    /// Per-request deadline
    #[serde(default = "default_query_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_query_port(),
            timeout: default_query_timeout(),
        }
    }
}

impl QueryConfig {
    /// Socket address the HTTP server binds to
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.bind_address, self.port)
            .parse()
            .map_err(|e| ConfigError::invalid_value("query.bind_address", format!("{}", e)))
    }
}

fn default_bind_address() -> String {
    "127.0.0.1".into()
}

fn default_query_port() -> u16 {
    DEFAULT_QUERY_PORT
}

fn default_query_timeout() -> Duration {
    Duration::from_millis(DEFAULT_QUERY_TIMEOUT_MS)
}

/// Port as written by operators: a number, a numeric string, or garbage.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawPort {
    Number(i64),
    Text(String),
}

fn deserialize_port<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<RawPort>::deserialize(deserializer)?;
    Ok(resolve_port(raw))
}

fn resolve_port(raw: Option<RawPort>) -> u16 {
    let parsed = match &raw {
        None => return DEFAULT_QUERY_PORT,
        Some(RawPort::Number(n)) => u16::try_from(*n).ok(),
        Some(RawPort::Text(s)) => s.trim().parse::<u16>().ok(),
    };
    match parsed {
        Some(port) if port != 0 => port,
        _ => {
            warn!(
                target: "pulse::config",
                value = ?raw,
                fallback = DEFAULT_QUERY_PORT,
                "Invalid query port, using default"
            );
            DEFAULT_QUERY_PORT
        }
    }
}

// ----------------------------------------------------------------------------
// 5.6 Logging Configuration
// ----------------------------------------------------------------------------

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Enable ANSI colors
    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include source location
    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            colors: true,
            source_location: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

fn default_true() -> bool {
    true
}

/// Helper to get number of CPUs
fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(4)
}

// ============================================================================
// SECTION 6: LOGGING & TRACING INFRASTRUCTURE
// ============================================================================
// Structured logging with:
// - JSON / compact / pretty output
// - Level filtering with RUST_LOG overrides
// ============================================================================

/// Initialize the logging system based on configuration
pub fn init_logging(config: &LoggingConfig) -> PulseResult<()> {
    let level_filter = match config.level.to_lowercase().as_str() {
        "trace" => tracing::level_filters::LevelFilter::TRACE,
        "debug" => tracing::level_filters::LevelFilter::DEBUG,
        "info" => tracing::level_filters::LevelFilter::INFO,
        "warn" | "warning" => tracing::level_filters::LevelFilter::WARN,
        "error" => tracing::level_filters::LevelFilter::ERROR,
        _ => tracing::level_filters::LevelFilter::INFO,
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .from_env_lossy();

    match config.format.as_str() {
        "json" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .json()
                    .with_timer(tracing_fmt::time::UtcTime::rfc_3339())
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_thread_names(true),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| PulseError::Internal(format!("Failed to set logger: {}", e)))?;
        }
        "compact" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .compact()
                    .with_ansi(config.colors)
                    .with_target(true),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| PulseError::Internal(format!("Failed to set logger: {}", e)))?;
        }
        _ => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .pretty()
                    .with_ansi(config.colors)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_thread_names(true),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| PulseError::Internal(format!("Failed to set logger: {}", e)))?;
        }
    }

    info!(
        target: "pulse::init",
        level = %config.level,
        format = %config.format,
        "Logging initialized"
    );

    Ok(())
}

// ============================================================================
// SECTION 7: CLI & COMMAND LINE INTERFACE
// ============================================================================
// Command-line interface for the engine with:
// - Subcommands for running, validating and inspecting
// - A small query client for the local endpoint
// - Environment variable support
// ============================================================================

// ----------------------------------------------------------------------------
// 7.1 CLI Argument Parser
// ----------------------------------------------------------------------------

/// Pulse Engine CLI
#[derive(Parser, Debug)]
#[command(
    name = "pulse",
    author = "Pulse Team",
    version,
    about = "Node-local metrics store and aggregation pipeline",
    long_about = "Pulse collects fine-grained request, shard and OS samples emitted by a \
                  search-engine node, folds each completed time window into typed tables \
                  and serves them over a local HTTP query endpoint."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "pulse.toml", env = "PULSE_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "PULSE_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable debug mode
    #[arg(short, long, env = "PULSE_DEBUG")]
    pub debug: bool,

    /// Subcommand to run
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the engine (default)
    Run,

    /// Validate configuration file
    Validate {
        /// Show full parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show engine version and build info
    Version,

    /// Query a running engine, e.g. `pulse query 'category=http&groupby=status&agg=avg'`
    Query {
        /// Raw query string
        params: String,

        /// Endpoint address (default: from configuration)
        #[arg(short, long)]
        addr: Option<String>,
    },

    /// List stored windows, or the locations of one window
    Inspect {
        /// Window id (epoch milliseconds)
        #[arg(short, long)]
        window: Option<i64>,
    },
}

// ----------------------------------------------------------------------------
// 7.2 CLI Handler Functions
// ----------------------------------------------------------------------------

/// Handle the validate subcommand
fn handle_validate(config_path: &Path, verbose: bool) -> PulseResult<()> {
    println!("Validating configuration file: {}", config_path.display());

    match EngineConfig::load(config_path) {
        Ok(config) => {
            println!("✅ Configuration is valid!");

            if verbose {
                println!("\n📋 Parsed configuration:");
                println!("{}", "=".repeat(60));
                match toml::to_string_pretty(&config) {
                    Ok(s) => println!("{}", s),
                    Err(e) => println!("Failed to serialize: {}", e),
                }
            }

            println!("\n📊 Configuration Summary:");
            println!("  • Instance name: {}", config.engine.instance_name);
            println!("  • Store backend: {:?}", config.store.backend);
            println!("  • Store root: {}", config.store.root.display());
            println!("  • Window: {}", humantime::format_duration(config.store.window));
            println!("  • Retained windows: {}", config.store.retention_windows);
            println!("  • Lookback windows: {}", config.aggregator.lookback_windows);
            println!("  • Parse threads: {}", config.effective_parse_threads());
            println!("  • Query endpoint: {}:{}{}", config.query.bind_address, config.query.port, QUERY_PATH);

            Ok(())
        }
        Err(e) => {
            println!("❌ Configuration validation failed!");
            println!("Error: {}", e);
            Err(PulseError::Config(e))
        }
    }
}

/// Handle the generate-config subcommand
fn handle_generate_config(output: Option<&Path>) -> PulseResult<()> {
    let config_str = EngineConfig::generate_default_config();

    match output {
        Some(path) => {
            fs::write(path, &config_str)?;
            println!("✅ Default configuration written to: {}", path.display());
        }
        None => {
            println!("{}", config_str);
        }
    }

    Ok(())
}

/// Handle the version subcommand
fn handle_version() {
    println!("📈 {} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);
    println!();
    println!("Build Information:");
    println!("  • Target: {}", std::env::consts::ARCH);
    println!("  • OS: {}", std::env::consts::OS);
    println!("  • Family: {}", std::env::consts::FAMILY);
    println!();
    println!("Built-in categories:");
    for category in SchemaRegistry::builtin().categories() {
        println!("  • {}", category);
    }
    println!();
    println!("License: MIT");
}

/// Handle the query subcommand
async fn handle_query(config: &EngineConfig, params: &str, addr: Option<&str>) -> AnyhowResult<()> {
    let base = match addr {
        Some(addr) => addr.trim_start_matches("http://").trim_end_matches('/').to_string(),
        None => format!("{}:{}", config.query.bind_address, config.query.port),
    };
    let url = format!("http://{}{}?{}", base, QUERY_PATH, params.trim_start_matches('?'));

    let client = reqwest::Client::builder()
        .timeout(config.query.timeout)
        .build()
        .context("Failed to build HTTP client")?;
    let response = client
        .get(&url)
        .send()
        .await
        .with_context(|| format!("Failed to reach {}", url))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .json::<serde_json::Value>()
            .await
            .unwrap_or(serde_json::Value::Null);
        anyhow::bail!("Query failed with {}: {}", status, body);
    }

    let result: QueryResponse = response.json().await.context("Malformed query response")?;
    let header: Vec<String> = result
        .fields
        .iter()
        .map(|f| format!("{} ({})", f.name, f.ty))
        .collect();
    println!("{}", header.join("\t"));
    for record in &result.records {
        let cells: Vec<&str> = record.iter().map(|v| v.as_deref().unwrap_or("null")).collect();
        println!("{}", cells.join("\t"));
    }
    println!("\n{} record(s)", result.len());
    Ok(())
}

/// Handle the inspect subcommand
fn handle_inspect(config: &EngineConfig, window: Option<i64>) -> PulseResult<()> {
    if config.store.backend == StoreBackend::Memory {
        println!("The memory backend lives inside the engine process; nothing to inspect.");
        return Ok(());
    }

    let medium = open_medium(&config.store)?;
    match window {
        Some(millis) => {
            let window = WindowId::from_millis(millis);
            let locations = medium.locations(window)?;
            println!("Window {} ({} locations):", window, locations.len());
            for location in locations {
                println!("  {}", location);
            }
        }
        None => {
            let windows = medium.windows()?;
            println!("{} window(s) under {}:", windows.len(), config.store.root.display());
            for window in windows {
                let count = medium.locations(window)?.len();
                println!(
                    "  • {} [{}] {} sample(s)",
                    window,
                    Timestamp::from_millis(window.as_millis()),
                    count
                );
            }
        }
    }
    Ok(())
}

// ============================================================================
// SECTION 8: MAIN ENTRY POINT
// ============================================================================

/// Main entry point for the Pulse engine
#[tokio::main]
async fn main() -> AnyhowResult<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Handle subcommands that don't need full initialization
    match &cli.command {
        Some(Commands::Version) => {
            handle_version();
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => {
            handle_generate_config(output.as_deref())?;
            return Ok(());
        }
        Some(Commands::Validate { verbose }) => {
            handle_validate(&cli.config, *verbose)?;
            return Ok(());
        }
        _ => {}
    }

    // Load configuration
    let config_found = cli.config.exists();
    let config = if config_found {
        EngineConfig::load(&cli.config)
            .with_context(|| format!("Failed to load config from {}", cli.config.display()))?
    } else {
        EngineConfig::from_env().context("Failed to build configuration from environment")?
    };

    match cli.command {
        Some(Commands::Query { params, addr }) => {
            handle_query(&config, &params, addr.as_deref()).await?;
        }
        Some(Commands::Inspect { window }) => {
            handle_inspect(&config, window)?;
        }
        _ => {
            // Override log level if specified
            let mut logging_config = config.logging.clone();
            if let Some(level) = &cli.log_level {
                logging_config.level = level.clone();
            }
            if cli.debug {
                logging_config.level = "debug".into();
            }
            init_logging(&logging_config)?;

            info!("📈 {} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);
            if !config_found {
                warn!("Config file not found at {}, using defaults", cli.config.display());
            }

            let engine = Engine::new(config)?;
            engine.run().await?;
        }
    }

    Ok(())
}

// ============================================================================
// SECTION 9: TESTS
// ============================================================================



// ============================================================================
// PHASE 2: SAMPLE STORE
// Addressing, the shared medium, the sample writer and windowed retention
// ============================================================================

// ============================================================================
// SECTION 10: METRIC PATH ADDRESSING
// ============================================================================
// Pure mapping from (timestamp, category, dimension segments, phase) to a
// unique storage location. No I/O, no shared state.
// ============================================================================

// ----------------------------------------------------------------------------
// 10.1 Segment Validation
// ----------------------------------------------------------------------------

/// Check that `segment` can be used as one component of a location.
pub fn validate_segment(segment: &str) -> Result<(), AddressError> {
    let reason = if segment.is_empty() {
        "segment is empty"
    } else if segment.len() > MAX_SEGMENT_LENGTH {
        "segment exceeds 255 bytes"
    } else if segment.starts_with('.') {
        "segment starts with '.'"
    } else if segment.contains('/') {
        "segment contains '/'"
    } else if segment.contains('\0') {
        "segment contains NUL"
    } else {
        return Ok(());
    };

    Err(AddressError::InvalidSegment {
        segment: segment.to_string(),
        reason,
    })
}

// ----------------------------------------------------------------------------
// 10.2 Storage Locations
// ----------------------------------------------------------------------------

/// Dimension segments of a location; almost always four or fewer.
pub type DimensionSegments = SmallVec<[CompactString; 4]>;

/// Fully-resolved address of one sample on the medium.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StorageLocation {
    pub window: WindowId,
    pub category: CompactString,
    pub dims: DimensionSegments,
    pub terminal: Terminal,
}

impl StorageLocation {
    /// Rebuild a location from the path components below its window directory.
    /// Returns `None` when there are not enough components.
    pub fn from_components<S: AsRef<str>>(window: WindowId, components: &[S]) -> Option<Self> {
        let (category, rest) = components.split_first()?;
        let (terminal, dims) = rest.split_last()?;
        Some(Self {
            window,
            category: CompactString::from(category.as_ref()),
            dims: dims.iter().map(|d| CompactString::from(d.as_ref())).collect(),
            terminal: Terminal::from_segment(terminal.as_ref()),
        })
    }

    /// Parse the relative form produced by `Display`
    pub fn parse_relative(relative: &str) -> Option<Self> {
        let mut parts = relative.split('/');
        let window = parts.next()?.parse::<WindowId>().ok()?;
        let components: Vec<&str> = parts.collect();
        Self::from_components(window, &components)
    }

    /// Absolute path of this location below `root`
    pub fn to_path(&self, root: &Path) -> PathBuf {
        let mut path = root.join(self.window.to_string());
        path.push(self.category.as_str());
        for dim in &self.dims {
            path.push(dim.as_str());
        }
        path.push(self.terminal.as_str());
        path
    }
}

impl Display for StorageLocation {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.window, self.category)?;
        for dim in &self.dims {
            write!(f, "/{}", dim)?;
        }
        write!(f, "/{}", self.terminal)
    }
}

// ----------------------------------------------------------------------------
// 10.3 Addresser
// ----------------------------------------------------------------------------

/// Resolves storage locations against the schema registry and window geometry.
#[derive(Debug, Clone)]
pub struct Addresser {
    spec: WindowSpec,
    registry: Arc<SchemaRegistry>,
}

impl Addresser {
    pub fn new(spec: WindowSpec, registry: Arc<SchemaRegistry>) -> Self {
        Self { spec, registry }
    }

    pub fn spec(&self) -> WindowSpec {
        self.spec
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    /// Compute the location a sample stamped `timestamp` is written to.
    pub fn locate(
        &self,
        timestamp: Timestamp,
        category: &str,
        segments: &[&str],
        phase: Option<Phase>,
    ) -> Result<StorageLocation, AddressError> {
        let schema = self
            .registry
            .get(category)
            .ok_or_else(|| AddressError::UnknownCategory {
                category: category.to_string(),
            })?;

        let terminal = schema
            .terminal_for(phase)
            .ok_or_else(|| AddressError::PhaseMismatch {
                category: category.to_string(),
                shape: if schema.is_lifecycle() { "lifecycle" } else { "point" },
                phase,
            })?;

        if segments.len() != schema.path_keys.len() {
            return Err(AddressError::InvalidDimensionCount {
                category: category.to_string(),
                expected: schema.path_keys.len(),
                actual: segments.len(),
            });
        }

        for segment in segments {
            validate_segment(segment)?;
        }

        Ok(StorageLocation {
            window: self.spec.window_of(timestamp),
            category: schema.name.clone(),
            dims: segments.iter().map(|s| CompactString::from(*s)).collect(),
            terminal,
        })
    }
}

// ----------------------------------------------------------------------------
// 10.4 Unique-Id Counters
// ----------------------------------------------------------------------------

/// Process-wide monotonic id source for one instrumentation adapter.
///
/// Ids start at 1 and are never reset, so two concurrent operations of the
/// same adapter can never share a location.
#[derive(Debug)]
pub struct UniqueIdCounter {
    next: CachePadded<AtomicU64>,
}

impl UniqueIdCounter {
    pub const fn new() -> Self {
        Self {
            next: CachePadded::new(AtomicU64::new(1)),
        }
    }

    /// Take the next id
    #[inline]
    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, AtomicOrdering::Relaxed)
    }

    /// Last id handed out (0 if none)
    #[inline]
    pub fn current(&self) -> u64 {
        self.next.load(AtomicOrdering::Relaxed).saturating_sub(1)
    }
}

impl Default for UniqueIdCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Request ids of the HTTP adapter
pub static HTTP_REQUEST_IDS: UniqueIdCounter = UniqueIdCounter::new();

/// Request ids of the shard-bulk adapter
pub static SHARD_BULK_IDS: UniqueIdCounter = UniqueIdCounter::new();

// ============================================================================
// SECTION 11: SAMPLE MEDIUM & WRITER
// ============================================================================
// A pluggable hierarchical medium (in-memory map or a directory tree, ideally
// on tmpfs) plus the write primitive used by instrumentation adapters.
// ============================================================================

// ----------------------------------------------------------------------------
// 11.1 Medium Trait
// ----------------------------------------------------------------------------

/// Shared store of sample bodies keyed by [`StorageLocation`].
///
/// Implementations must make `put` atomic with respect to `get`: a reader sees
/// either the whole body or nothing.
pub trait SampleMedium: Send + Sync + Debug {
    /// Store `body` at `location`, replacing any previous body
    fn put(&self, location: &StorageLocation, body: &str) -> StoreResult<()>;

    /// Body stored at `location`, `None` if absent
    fn get(&self, location: &StorageLocation) -> StoreResult<Option<String>>;

    /// Every window that currently holds at least one location
    fn windows(&self) -> StoreResult<BTreeSet<WindowId>>;

    /// Locations of one window, sorted
    fn locations(&self, window: WindowId) -> StoreResult<Vec<StorageLocation>>;

    /// Drop a whole window. Returns whether anything was removed.
    fn remove_window(&self, window: WindowId) -> StoreResult<bool>;

    /// Short backend name for logs
    fn name(&self) -> &'static str;
}

// ----------------------------------------------------------------------------
// 11.2 In-Memory Medium
// ----------------------------------------------------------------------------

type WindowBodies = DashMap<StorageLocation, Arc<str>>;

/// Process-local medium built on sharded concurrent maps.
#[derive(Debug, Default)]
pub struct MemoryMedium {
    windows: DashMap<WindowId, Arc<WindowBodies>>,
}

impl MemoryMedium {
    pub fn new() -> Self {
        Self::default()
    }

    fn window(&self, window: WindowId) -> Option<Arc<WindowBodies>> {
        self.windows.get(&window).map(|entry| Arc::clone(entry.value()))
    }
}

impl SampleMedium for MemoryMedium {
    fn put(&self, location: &StorageLocation, body: &str) -> StoreResult<()> {
        let bodies = Arc::clone(self.windows.entry(location.window).or_default().value());
        bodies.insert(location.clone(), Arc::from(body));
        Ok(())
    }

    fn get(&self, location: &StorageLocation) -> StoreResult<Option<String>> {
        let Some(bodies) = self.window(location.window) else {
            return Ok(None);
        };
        let body = bodies.get(location).map(|body| body.value().to_string());
        Ok(body)
    }

    fn windows(&self) -> StoreResult<BTreeSet<WindowId>> {
        Ok(self
            .windows
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| *entry.key())
            .collect())
    }

    fn locations(&self, window: WindowId) -> StoreResult<Vec<StorageLocation>> {
        let Some(bodies) = self.window(window) else {
            return Ok(Vec::new());
        };
        let mut locations: Vec<StorageLocation> = bodies.iter().map(|entry| entry.key().clone()).collect();
        locations.sort();
        Ok(locations)
    }

    fn remove_window(&self, window: WindowId) -> StoreResult<bool> {
        Ok(self.windows.remove(&window).is_some())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

// ----------------------------------------------------------------------------
// 11.3 Filesystem Medium
// ----------------------------------------------------------------------------

/// Medium laid out as `root/<window>/<category>/<dim>/.../<terminal>`.
///
/// Bodies are written to a dot-prefixed temporary file in the target directory
/// and renamed into place, so readers never observe a partial body.
#[derive(Debug, Clone)]
pub struct FsMedium {
    root: PathBuf,
}

impl FsMedium {
    /// Open (and create if needed) a store rooted at `root`
    pub fn open<P: AsRef<Path>>(root: P) -> StoreResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|source| StoreError::ListFailed {
            target: root.display().to_string(),
            source,
        })?;
        debug!(target: "pulse::store", root = %root.display(), "Opened filesystem medium");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn collect_locations(
        &self,
        window: WindowId,
        dir: &Path,
        prefix: &mut Vec<String>,
        out: &mut Vec<StorageLocation>,
    ) -> StoreResult<()> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            // Evicted underneath us
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(source) => {
                return Err(StoreError::ListFailed {
                    target: dir.display().to_string(),
                    source,
                })
            }
        };

        for entry in entries {
            let entry = entry.map_err(|source| StoreError::ListFailed {
                target: dir.display().to_string(),
                source,
            })?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            let file_type = match entry.file_type() {
                Ok(ft) => ft,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(source) => {
                    return Err(StoreError::ListFailed {
                        target: entry.path().display().to_string(),
                        source,
                    })
                }
            };

            prefix.push(name);
            if file_type.is_dir() {
                self.collect_locations(window, &entry.path(), prefix, out)?;
            } else if let Some(location) = StorageLocation::from_components(window, prefix.as_slice()) {
                out.push(location);
            }
            prefix.pop();
        }
        Ok(())
    }
}

impl SampleMedium for FsMedium {
    fn put(&self, location: &StorageLocation, body: &str) -> StoreResult<()> {
        let target = location.to_path(&self.root);
        let write_failed = |source: io::Error| StoreError::WriteFailed {
            location: location.to_string(),
            source,
        };

        let parent = target.parent().ok_or_else(|| {
            write_failed(io::Error::new(io::ErrorKind::InvalidInput, "location has no parent"))
        })?;
        fs::create_dir_all(parent).map_err(write_failed)?;

        let tmp = parent.join(format!(".{}.{}.tmp", location.terminal, Uuid::new_v4().simple()));
        if let Err(e) = fs::write(&tmp, body.as_bytes()) {
            let _ = fs::remove_file(&tmp);
            return Err(write_failed(e));
        }
        if let Err(e) = fs::rename(&tmp, &target) {
            let _ = fs::remove_file(&tmp);
            return Err(write_failed(e));
        }
        Ok(())
    }

    fn get(&self, location: &StorageLocation) -> StoreResult<Option<String>> {
        let path = location.to_path(&self.root);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StoreError::ReadFailed {
                    location: location.to_string(),
                    source,
                })
            }
        };
        String::from_utf8(bytes)
            .map(Some)
            .map_err(|_| StoreError::InvalidEncoding {
                location: location.to_string(),
            })
    }

    fn windows(&self) -> StoreResult<BTreeSet<WindowId>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
            Err(source) => {
                return Err(StoreError::ListFailed {
                    target: self.root.display().to_string(),
                    source,
                })
            }
        };

        let mut windows = BTreeSet::new();
        for entry in entries {
            let entry = entry.map_err(|source| StoreError::ListFailed {
                target: self.root.display().to_string(),
                source,
            })?;
            if let Some(window) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<WindowId>().ok())
            {
                windows.insert(window);
            }
        }
        Ok(windows)
    }

    fn locations(&self, window: WindowId) -> StoreResult<Vec<StorageLocation>> {
        let dir = self.root.join(window.to_string());
        let mut out = Vec::new();
        self.collect_locations(window, &dir, &mut Vec::new(), &mut out)?;
        out.sort();
        Ok(out)
    }

    fn remove_window(&self, window: WindowId) -> StoreResult<bool> {
        match fs::remove_dir_all(self.root.join(window.to_string())) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(StoreError::RemoveFailed { window, source }),
        }
    }

    fn name(&self) -> &'static str {
        "filesystem"
    }
}

/// Build the medium selected by the store configuration
pub fn open_medium(config: &StoreConfig) -> StoreResult<Arc<dyn SampleMedium>> {
    Ok(match config.backend {
        StoreBackend::Memory => Arc::new(MemoryMedium::new()),
        StoreBackend::Filesystem => Arc::new(FsMedium::open(&config.root)?),
    })
}

// ----------------------------------------------------------------------------
// 11.4 Sample Writer
// ----------------------------------------------------------------------------

/// Write primitive shared by every producer thread.
///
/// Holds no cache and no lock: every call goes straight to the medium.
#[derive(Debug, Clone)]
pub struct SampleWriter {
    medium: Arc<dyn SampleMedium>,
    addresser: Addresser,
    stats: Arc<PipelineStats>,
}

impl SampleWriter {
    pub fn new(medium: Arc<dyn SampleMedium>, addresser: Addresser, stats: Arc<PipelineStats>) -> Self {
        Self {
            medium,
            addresser,
            stats,
        }
    }

    pub fn addresser(&self) -> &Addresser {
        &self.addresser
    }

    /// Store one sample. A failure is logged and counted; it is never retried.
    pub fn write(&self, location: &StorageLocation, sample: &MetricSample) -> StoreResult<()> {
        match self.medium.put(location, &sample.encode()) {
            Ok(()) => {
                PipelineStats::bump(&self.stats.samples_written, 1);
                trace!(target: "pulse::writer", location = %location, "Sample written");
                Ok(())
            }
            Err(e) => {
                PipelineStats::bump(&self.stats.write_failures, 1);
                warn!(
                    target: "pulse::writer",
                    location = %location,
                    error = %e,
                    "Dropping sample after write failure"
                );
                Err(e)
            }
        }
    }

    /// Raw body stored at `location`
    pub fn read(&self, location: &StorageLocation) -> StoreResult<Option<String>> {
        self.medium.get(location)
    }

    /// Delete every location of `window`
    pub fn remove(&self, window: WindowId) -> StoreResult<bool> {
        self.medium.remove_window(window)
    }

    /// Build and write one sample.
    ///
    /// Path segments are taken from `dimensions` in schema order. The body holds
    /// `current_time`, then the remaining dimensions, then `fields`, in caller
    /// order.
    pub fn emit(
        &self,
        category: &str,
        dimensions: &[(&str, &str)],
        fields: &[(&str, FieldValue)],
        phase: Option<Phase>,
        timestamp: Timestamp,
    ) -> PulseResult<StorageLocation> {
        let schema = self
            .addresser
            .registry()
            .get(category)
            .ok_or_else(|| AddressError::UnknownCategory {
                category: category.to_string(),
            })?;

        let mut segments: SmallVec<[&str; 4]> = SmallVec::with_capacity(schema.path_keys.len());
        for key in &schema.path_keys {
            let value = dimensions
                .iter()
                .find(|(k, _)| *k == key.as_str())
                .map(|(_, v)| *v)
                .ok_or_else(|| AddressError::MissingDimension {
                    category: category.to_string(),
                    key: key.to_string(),
                })?;
            segments.push(value);
        }

        let location = self.addresser.locate(timestamp, category, &segments, phase)?;

        let mut sample = MetricSample::new(timestamp);
        for (key, value) in dimensions {
            if !schema.path_keys.iter().any(|k| k.as_str() == *key) {
                sample.insert(key, value)?;
            }
        }
        for (key, value) in fields {
            sample.insert(key, value)?;
        }

        self.write(&location, &sample)?;
        Ok(location)
    }
}

// ============================================================================
// SECTION 12: TIME-WINDOW STORE
// ============================================================================
// Window enumeration and wholesale eviction. Only whole windows are ever
// deleted, and only windows whose wall-clock time has long elapsed.
// ============================================================================

/// Window-level view of the medium with the retention policy.
#[derive(Debug, Clone)]
pub struct WindowStore {
    medium: Arc<dyn SampleMedium>,
    spec: WindowSpec,
    retention: usize,
    stats: Arc<PipelineStats>,
}

impl WindowStore {
    pub fn new(
        medium: Arc<dyn SampleMedium>,
        spec: WindowSpec,
        retention: usize,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            medium,
            spec,
            retention: retention.max(1),
            stats,
        }
    }

    pub fn spec(&self) -> WindowSpec {
        self.spec
    }

    pub fn retention(&self) -> usize {
        self.retention
    }

    pub fn medium(&self) -> &Arc<dyn SampleMedium> {
        &self.medium
    }

    /// All windows on the medium, oldest first
    pub fn list_windows(&self) -> StoreResult<BTreeSet<WindowId>> {
        self.medium.windows()
    }

    /// Remove every window strictly older than `older_than`
    pub fn evict(&self, older_than: WindowId) -> StoreResult<usize> {
        let mut evicted = 0;
        for window in self.list_windows()?.range(..older_than) {
            if self.medium.remove_window(*window)? {
                evicted += 1;
                debug!(target: "pulse::store", window = %window, "Window evicted");
            }
        }
        if evicted > 0 {
            PipelineStats::bump(&self.stats.windows_evicted, evicted as u64);
        }
        Ok(evicted)
    }

    /// Keep the K most recent windows by time, relative to `now`
    pub fn enforce_retention(&self, now: Timestamp) -> StoreResult<usize> {
        let current = self.spec.window_of(now);
        let cutoff = self.spec.preceding(current, self.retention - 1);
        let evicted = self.evict(cutoff)?;
        if evicted > 0 {
            info!(
                target: "pulse::store",
                evicted,
                cutoff = %cutoff,
                "Retention pass complete"
            );
        }
        Ok(evicted)
    }

    /// Background retention loop: one pass per window duration until cancelled.
    pub async fn run_retention(self: Arc<Self>, clock: Arc<dyn TimeSource>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.spec.duration());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            target: "pulse::store",
            retention = self.retention,
            window_ms = self.spec.duration().as_millis() as u64,
            "Retention task started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let store = Arc::clone(&self);
                    let now = clock.now();
                    match task::spawn_blocking(move || store.enforce_retention(now)).await {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => warn!(target: "pulse::store", error = %e, "Retention pass failed"),
                        Err(e) => error!(target: "pulse::store", error = %e, "Retention task panicked"),
                    }
                }
            }
        }

        info!(target: "pulse::store", "Retention task stopped");
    }
}

// ============================================================================
// SECTION 13: PHASE 2 TESTS
// ============================================================================

#[cfg(test)]
mod phase2_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use rstest::rstest;

    const W: Duration = Duration::from_millis(5_000);

    fn addresser() -> Addresser {
        Addresser::new(WindowSpec::new(W), Arc::new(SchemaRegistry::builtin()))
    }

    fn writer_on(medium: Arc<dyn SampleMedium>) -> (SampleWriter, Arc<PipelineStats>) {
        let stats = Arc::new(PipelineStats::new());
        (SampleWriter::new(medium, addresser(), Arc::clone(&stats)), stats)
    }

    fn both_mediums(dir: &tempfile::TempDir) -> Vec<Arc<dyn SampleMedium>> {
        let memory: Arc<dyn SampleMedium> = Arc::new(MemoryMedium::new());
        let fs: Arc<dyn SampleMedium> = Arc::new(FsMedium::open(dir.path().join("store")).unwrap());
        vec![memory, fs]
    }

    /// Medium that rejects every write
    #[derive(Debug)]
    struct ReadOnlyMedium;

    impl SampleMedium for ReadOnlyMedium {
        fn put(&self, location: &StorageLocation, _body: &str) -> StoreResult<()> {
            Err(StoreError::WriteFailed {
                location: location.to_string(),
                source: io::Error::new(io::ErrorKind::PermissionDenied, "read-only"),
            })
        }
        fn get(&self, _location: &StorageLocation) -> StoreResult<Option<String>> {
            Ok(None)
        }
        fn windows(&self) -> StoreResult<BTreeSet<WindowId>> {
            Ok(BTreeSet::new())
        }
        fn locations(&self, _window: WindowId) -> StoreResult<Vec<StorageLocation>> {
            Ok(Vec::new())
        }
        fn remove_window(&self, _window: WindowId) -> StoreResult<bool> {
            Ok(false)
        }
        fn name(&self) -> &'static str {
            "read-only"
        }
    }

    // ------------------------------------------------------------------------
    // Addressing
    // ------------------------------------------------------------------------

    #[test]
    fn test_locate_is_deterministic() {
        let addresser = addresser();
        let a = addresser
            .locate(Timestamp::from_millis(1_000), "http", &["7"], Some(Phase::Start))
            .unwrap();
        let b = addresser
            .locate(Timestamp::from_millis(1_000), "http", &["7"], Some(Phase::Start))
            .unwrap();

        assert_eq!(a, b);
        assert_eq!(a.to_string(), "0/http/7/start");
        assert_eq!(StorageLocation::parse_relative("0/http/7/start"), Some(a.clone()));
        assert_eq!(
            a.to_path(Path::new("/tmp/pulse")),
            PathBuf::from("/tmp/pulse/0/http/7/start")
        );
    }

    #[test]
    fn test_locate_point_category() {
        let location = addresser()
            .locate(Timestamp::from_millis(7_500), "thread_cpu", &["42"], None)
            .unwrap();
        assert_eq!(location.to_string(), "5000/thread_cpu/42/os_metrics");
        assert_eq!(location.terminal.phase(), None);
    }

    #[test]
    fn test_locate_errors() {
        let addresser = addresser();
        let ts = Timestamp::from_millis(0);

        assert_eq!(
            addresser.locate(ts, "nope", &["1"], None),
            Err(AddressError::UnknownCategory {
                category: "nope".into()
            })
        );
        assert_eq!(
            addresser.locate(ts, "shard_bulk", &["logs", "0"], Some(Phase::Start)),
            Err(AddressError::InvalidDimensionCount {
                category: "shard_bulk".into(),
                expected: 3,
                actual: 2,
            })
        );
        assert!(matches!(
            addresser.locate(ts, "http", &["1"], None),
            Err(AddressError::PhaseMismatch { shape: "lifecycle", .. })
        ));
        assert!(matches!(
            addresser.locate(ts, "disk", &["sda"], Some(Phase::Finish)),
            Err(AddressError::PhaseMismatch { shape: "point", .. })
        ));
    }

    #[rstest]
    #[case("")]
    #[case(".hidden")]
    #[case("a/b")]
    #[case("a\0b")]
    #[case(&"x".repeat(MAX_SEGMENT_LENGTH + 1))]
    fn test_invalid_segments(#[case] segment: &str) {
        let result = addresser().locate(Timestamp::from_millis(0), "disk", &[segment], None);
        assert!(matches!(result, Err(AddressError::InvalidSegment { .. })));
    }

    proptest! {
        #[test]
        fn prop_distinct_ids_never_collide(a in any::<u64>(), b in any::<u64>(), ts in 0i64..10_000_000) {
            prop_assume!(a != b);
            let addresser = addresser();
            let (a, b) = (a.to_string(), b.to_string());
            let la = addresser.locate(Timestamp::from_millis(ts), "http", &[a.as_str()], Some(Phase::Start)).unwrap();
            let lb = addresser.locate(Timestamp::from_millis(ts), "http", &[b.as_str()], Some(Phase::Start)).unwrap();
            prop_assert_ne!(la, lb);
        }
    }

    #[test]
    fn test_unique_id_counter_across_threads() {
        let counter = Arc::new(UniqueIdCounter::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let counter = Arc::clone(&counter);
                std::thread::spawn(move || (0..1_000).map(|_| counter.next()).collect::<Vec<u64>>())
            })
            .collect();

        let mut seen = AHashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "id {} handed out twice", id);
            }
        }
        assert_eq!(seen.len(), 8_000);
        assert_eq!(counter.current(), 8_000);
        assert!(!seen.contains(&0));
    }

    #[test]
    fn test_static_counters_are_monotonic() {
        let first = HTTP_REQUEST_IDS.next();
        let second = HTTP_REQUEST_IDS.next();
        assert!(second > first);
        assert!(SHARD_BULK_IDS.next() >= 1);
    }

    // ------------------------------------------------------------------------
    // Writer & media
    // ------------------------------------------------------------------------

    #[test]
    fn test_emit_then_read_returns_identical_body() {
        let dir = tempfile::tempdir().unwrap();
        for medium in both_mediums(&dir) {
            let (writer, stats) = writer_on(Arc::clone(&medium));
            let location = writer
                .emit(
                    "http",
                    &[("rid", "1"), ("indices", "logs")],
                    &[("docs", FieldValue::from(5i64))],
                    Some(Phase::Start),
                    Timestamp::from_millis(1_000),
                )
                .unwrap();

            assert_eq!(location.to_string(), "0/http/1/start");
            assert_eq!(
                writer.read(&location).unwrap().as_deref(),
                Some("current_time=1000\nindices=logs\ndocs=5"),
                "medium {}",
                medium.name()
            );
            assert_eq!(stats.snapshot().samples_written, 1);
            assert_eq!(medium.locations(WindowId::from_millis(0)).unwrap(), vec![location]);
        }
    }

    #[test]
    fn test_emit_requires_path_dimensions() {
        let (writer, _) = writer_on(Arc::new(MemoryMedium::new()));
        let result = writer.emit(
            "shard_bulk",
            &[("index", "logs"), ("rid", "3")],
            &[("docs", FieldValue::from(1i64))],
            Some(Phase::Start),
            Timestamp::from_millis(0),
        );
        assert!(matches!(
            result,
            Err(PulseError::Address(AddressError::MissingDimension { ref key, .. })) if key == "shard"
        ));
    }

    #[test]
    fn test_write_overwrites_existing_location() {
        let dir = tempfile::tempdir().unwrap();
        for medium in both_mediums(&dir) {
            let (writer, _) = writer_on(Arc::clone(&medium));
            let location = writer
                .addresser()
                .locate(Timestamp::from_millis(10), "disk", &["sda"], None)
                .unwrap();

            let first = MetricSample::new(Timestamp::from_millis(10))
                .with("utilization", 0.5)
                .unwrap();
            let second = MetricSample::new(Timestamp::from_millis(20))
                .with("utilization", 0.75)
                .unwrap();
            writer.write(&location, &first).unwrap();
            writer.write(&location, &second).unwrap();

            assert_eq!(writer.read(&location).unwrap(), Some(second.encode()));
            assert_eq!(medium.locations(location.window).unwrap().len(), 1);
        }
    }

    #[test]
    fn test_write_failure_is_counted_and_dropped() {
        let (writer, stats) = writer_on(Arc::new(ReadOnlyMedium));
        let result = writer.emit(
            "disk",
            &[("device", "sda")],
            &[("utilization", FieldValue::from(0.1))],
            None,
            Timestamp::from_millis(0),
        );

        assert!(matches!(result, Err(PulseError::Store(StoreError::WriteFailed { .. }))));
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.write_failures, 1);
        assert_eq!(snapshot.samples_written, 0);
    }

    #[test]
    fn test_read_missing_location_is_none() {
        let dir = tempfile::tempdir().unwrap();
        for medium in both_mediums(&dir) {
            let (writer, _) = writer_on(medium);
            let location = writer
                .addresser()
                .locate(Timestamp::from_millis(0), "http", &["404"], Some(Phase::Finish))
                .unwrap();
            assert_eq!(writer.read(&location).unwrap(), None);
        }
    }

    #[test]
    fn test_fs_medium_hides_temporary_files() {
        let dir = tempfile::tempdir().unwrap();
        let medium = FsMedium::open(dir.path()).unwrap();
        let (writer, _) = writer_on(Arc::new(medium.clone()));

        let location = writer
            .emit(
                "disk",
                &[("device", "sda")],
                &[("utilization", FieldValue::from(0.3))],
                None,
                Timestamp::from_millis(5_001),
            )
            .unwrap();

        let parent = location.to_path(medium.root());
        let parent = parent.parent().unwrap();
        fs::write(parent.join(".disk_metrics.partial.tmp"), "current_time=1").unwrap();
        fs::create_dir_all(dir.path().join("lost+found")).unwrap();

        assert_eq!(medium.windows().unwrap(), BTreeSet::from([WindowId::from_millis(5_000)]));
        assert_eq!(medium.locations(location.window).unwrap(), vec![location]);
    }

    #[test]
    fn test_fs_medium_missing_root_lists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("gone");
        let medium = FsMedium::open(&root).unwrap();
        fs::remove_dir_all(&root).unwrap();

        assert!(medium.windows().unwrap().is_empty());
        assert!(medium.locations(WindowId::from_millis(0)).unwrap().is_empty());
        assert!(!medium.remove_window(WindowId::from_millis(0)).unwrap());
    }

    // ------------------------------------------------------------------------
    // Window store
    // ------------------------------------------------------------------------

    fn emit_point(writer: &SampleWriter, device: &str, ts: i64) -> StorageLocation {
        writer
            .emit(
                "disk",
                &[("device", device)],
                &[("utilization", FieldValue::from(0.5))],
                None,
                Timestamp::from_millis(ts),
            )
            .unwrap()
    }

    #[test]
    fn test_evict_removes_strictly_older_windows() {
        let dir = tempfile::tempdir().unwrap();
        for medium in both_mediums(&dir) {
            let (writer, stats) = writer_on(Arc::clone(&medium));
            let store = WindowStore::new(Arc::clone(&medium), WindowSpec::new(W), 3, Arc::clone(&stats));

            let old = emit_point(&writer, "sda", 1_000);
            emit_point(&writer, "sda", 6_000);
            emit_point(&writer, "sda", 11_000);

            assert_eq!(store.evict(WindowId::from_millis(5_000)).unwrap(), 1);
            assert_eq!(writer.read(&old).unwrap(), None);
            assert_eq!(
                store.list_windows().unwrap().into_iter().collect::<Vec<_>>(),
                vec![WindowId::from_millis(5_000), WindowId::from_millis(10_000)]
            );
            assert_eq!(stats.snapshot().windows_evicted, 1);
        }
    }

    #[test]
    fn test_every_location_of_evicted_window_reads_none() {
        let (writer, _) = writer_on(Arc::new(MemoryMedium::new()));

        let locations: Vec<_> = (0..20)
            .map(|i| emit_point(&writer, &format!("dev{}", i), 100 + i))
            .collect();
        assert!(writer.remove(WindowId::from_millis(0)).unwrap());
        for location in &locations {
            assert_eq!(writer.read(location).unwrap(), None);
        }
        assert!(!writer.remove(WindowId::from_millis(0)).unwrap());
    }

    #[test]
    fn test_retention_keeps_k_windows() {
        let dir = tempfile::tempdir().unwrap();
        for medium in both_mediums(&dir) {
            let clock = ManualTimeSource::new(Timestamp::from_millis(1_000));
            let (writer, stats) = writer_on(Arc::clone(&medium));
            let store = WindowStore::new(Arc::clone(&medium), WindowSpec::new(W), 3, stats);

            // Four windows written, crossing three boundaries, no reads.
            for i in 0..4 {
                if i > 0 {
                    clock.advance(W);
                }
                emit_point(&writer, "sda", clock.now().as_millis());
            }
            let now = clock.now();

            assert_eq!(store.list_windows().unwrap().len(), 4);
            assert_eq!(store.enforce_retention(now).unwrap(), 1);
            assert_eq!(
                store.list_windows().unwrap().into_iter().collect::<Vec<_>>(),
                vec![
                    WindowId::from_millis(5_000),
                    WindowId::from_millis(10_000),
                    WindowId::from_millis(15_000)
                ],
                "medium {}",
                medium.name()
            );

            // Idempotent once the policy holds.
            assert_eq!(store.enforce_retention(now).unwrap(), 0);
        }
    }

    #[tokio::test]
    async fn test_retention_task_stops_on_cancel() {
        let medium: Arc<dyn SampleMedium> = Arc::new(MemoryMedium::new());
        let (writer, stats) = writer_on(Arc::clone(&medium));
        emit_point(&writer, "sda", 0);

        let store = Arc::new(WindowStore::new(
            medium,
            WindowSpec::new(Duration::from_millis(100)),
            3,
            stats,
        ));
        let clock: Arc<dyn TimeSource> = Arc::new(ManualTimeSource::new(Timestamp::from_millis(60_000)));
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&store).run_retention(clock, shutdown.clone()));

        // The first tick fires immediately and evicts the stale window.
        let mut waited = 0;
        while !store.list_windows().unwrap().is_empty() && waited < 50 {
            sleep(Duration::from_millis(20)).await;
            waited += 1;
        }
        assert!(store.list_windows().unwrap().is_empty());

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("retention task did not stop")
            .unwrap();
    }
}


// ============================================================================
// PHASE 3: READER & AGGREGATION
// Schema-on-read parsing, table building and the supervised aggregator
// ============================================================================

// ============================================================================
// SECTION 14: SAMPLE PARSING
// ============================================================================
// Declarative, schema-driven parsing of raw bodies into tagged records.
// Anything the schema does not declare is rejected explicitly.
// ============================================================================

/// One parsed sample.
#[derive(Debug, Clone, PartialEq)]
pub enum SampleRecord {
    /// One half of a start/finish pair
    Lifecycle {
        category: CompactString,
        dims: DimensionSegments,
        phase: Phase,
        time: Timestamp,
        values: Vec<(CompactString, FieldValue)>,
    },
    /// A self-contained sample
    Point {
        category: CompactString,
        dims: DimensionSegments,
        time: Timestamp,
        values: Vec<(CompactString, FieldValue)>,
    },
}

impl SampleRecord {
    pub fn category(&self) -> &str {
        match self {
            SampleRecord::Lifecycle { category, .. } | SampleRecord::Point { category, .. } => category.as_str(),
        }
    }

    pub fn dims(&self) -> &DimensionSegments {
        match self {
            SampleRecord::Lifecycle { dims, .. } | SampleRecord::Point { dims, .. } => dims,
        }
    }

    pub fn time(&self) -> Timestamp {
        match self {
            SampleRecord::Lifecycle { time, .. } | SampleRecord::Point { time, .. } => *time,
        }
    }

    pub fn phase(&self) -> Option<Phase> {
        match self {
            SampleRecord::Lifecycle { phase, .. } => Some(*phase),
            SampleRecord::Point { .. } => None,
        }
    }

    /// Typed value of a body field
    pub fn value(&self, name: &str) -> Option<&FieldValue> {
        let values = match self {
            SampleRecord::Lifecycle { values, .. } | SampleRecord::Point { values, .. } => values,
        };
        values.iter().find(|(k, _)| k.as_str() == name).map(|(_, v)| v)
    }
}

/// Parse `body` read from `location` against the category's schema.
pub fn parse_sample(schema: &CategorySchema, location: &StorageLocation, body: &str) -> ParseResult<SampleRecord> {
    let structural = |reason: &'static str| ParseError::Structural {
        location: location.to_string(),
        reason,
    };

    if location.category != schema.name {
        return Err(structural("category does not match schema"));
    }
    if location.dims.len() != schema.path_keys.len() {
        return Err(structural("wrong number of path dimensions"));
    }
    let declared = schema
        .fields_for(&location.terminal)
        .ok_or_else(|| structural("unexpected terminal for category"))?;

    let sample = MetricSample::decode(body)?;

    let mut values: Vec<(CompactString, FieldValue)> = Vec::with_capacity(sample.len());
    for (key, raw) in sample.fields() {
        let field = declared
            .iter()
            .find(|f| f.name.as_str() == key)
            .ok_or_else(|| ParseError::UnknownField {
                category: schema.name.to_string(),
                terminal: location.terminal.to_string(),
                field: key.to_string(),
            })?;
        let value = field.ty.parse(raw).ok_or_else(|| ParseError::InvalidValue {
            field: key.to_string(),
            expected: field.ty,
            value: raw.to_string(),
        })?;
        values.push((field.name.clone(), value));
    }

    if let Some(missing) = declared
        .iter()
        .find(|f| f.required && !values.iter().any(|(k, _)| *k == f.name))
    {
        return Err(ParseError::MissingField {
            category: schema.name.to_string(),
            terminal: location.terminal.to_string(),
            field: missing.name.to_string(),
        });
    }

    let time = sample.current_time();
    Ok(match location.terminal.phase() {
        Some(phase) => SampleRecord::Lifecycle {
            category: schema.name.clone(),
            dims: location.dims.clone(),
            phase,
            time,
            values,
        },
        None => SampleRecord::Point {
            category: schema.name.clone(),
            dims: location.dims.clone(),
            time,
            values,
        },
    })
}

/// Resolve the schema for `location` and parse its body.
pub fn parse_location(registry: &SchemaRegistry, location: &StorageLocation, body: &str) -> ParseResult<SampleRecord> {
    let schema = registry
        .get(&location.category)
        .ok_or_else(|| ParseError::UnknownCategory {
            category: location.category.to_string(),
        })?;
    parse_sample(schema, location, body)
}

// ============================================================================
// SECTION 15: AGGREGATE TABLES
// ============================================================================
// Typed per-category tables rebuilt from scratch for every window, and the
// immutable snapshot they are published in.
// ============================================================================

// ----------------------------------------------------------------------------
// 15.1 Columns & Tables
// ----------------------------------------------------------------------------

/// One column of an aggregate table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnDef {
    pub name: CompactString,
    pub kind: FieldKind,
    pub ty: FieldType,
}

impl ColumnDef {
    pub fn new(name: CompactString, kind: FieldKind, ty: FieldType) -> Self {
        Self { name, kind, ty }
    }
}

/// Row of typed cells, `None` where the sample carried no value.
pub type Row = Vec<Option<FieldValue>>;

/// Typed table for one category.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateTable {
    pub category: CompactString,
    pub columns: Vec<ColumnDef>,
    rows: Vec<Row>,
    partial_rows: usize,
}

impl AggregateTable {
    pub fn new(schema: &CategorySchema) -> Self {
        Self {
            category: schema.name.clone(),
            columns: schema.columns(),
            rows: Vec::new(),
            partial_rows: 0,
        }
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name.as_str() == name)
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows built from an unpaired start or finish
    pub fn partial_rows(&self) -> usize {
        self.partial_rows
    }

    /// Cell `column` of `row`
    pub fn cell(&self, row: usize, column: &str) -> Option<&FieldValue> {
        let idx = self.column_index(column)?;
        self.rows.get(row)?.get(idx)?.as_ref()
    }

    fn blank_row(&self, dims: &DimensionSegments) -> Row {
        let mut row: Row = vec![None; self.columns.len()];
        for (cell, dim) in row.iter_mut().zip(dims.iter()) {
            *cell = Some(FieldValue::Text(dim.clone()));
        }
        row
    }

    fn set(&self, row: &mut Row, column: &str, value: FieldValue) {
        if let Some(idx) = self.column_index(column) {
            row[idx] = Some(value);
        }
    }

    fn push_point(&mut self, dims: &DimensionSegments, time: Timestamp, values: Vec<(CompactString, FieldValue)>) {
        let mut row = self.blank_row(dims);
        for (name, value) in values {
            self.set(&mut row, &name, value);
        }
        self.set(&mut row, "sample_time", FieldValue::Integer(time.as_millis()));
        self.rows.push(row);
    }

    fn push_lifecycle(&mut self, dims: &DimensionSegments, start: Option<LifecycleHalf>, finish: Option<LifecycleHalf>) {
        let mut row = self.blank_row(dims);
        let partial = start.is_none() || finish.is_none();
        let start_time = start.as_ref().map(|s| s.time);
        let finish_time = finish.as_ref().map(|f| f.time);

        for half in [start, finish].into_iter().flatten() {
            for (name, value) in half.values {
                self.set(&mut row, &name, value);
            }
        }
        if let Some(t) = start_time {
            self.set(&mut row, "start_time", FieldValue::Integer(t.as_millis()));
        }
        if let Some(t) = finish_time {
            self.set(&mut row, "finish_time", FieldValue::Integer(t.as_millis()));
        }
        if let Some(latency) = start_time
            .zip(finish_time)
            .and_then(|(s, f)| f.as_millis().checked_sub(s.as_millis()))
        {
            self.set(&mut row, "latency_ms", FieldValue::Integer(latency));
        }

        if partial {
            self.partial_rows += 1;
        }
        self.rows.push(row);
    }
}

// ----------------------------------------------------------------------------
// 15.2 Table Builder
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct LifecycleHalf {
    time: Timestamp,
    values: Vec<(CompactString, FieldValue)>,
}

#[derive(Debug, Default)]
struct CategoryRecords {
    starts: BTreeMap<DimensionSegments, LifecycleHalf>,
    finishes: BTreeMap<DimensionSegments, LifecycleHalf>,
    points: Vec<(DimensionSegments, Timestamp, Vec<(CompactString, FieldValue)>)>,
}

/// Collects the records of one window and turns them into tables.
///
/// Pairing is by (category, dimension segments), never by arrival order.
#[derive(Debug)]
pub struct TableBuilder<'a> {
    registry: &'a SchemaRegistry,
    categories: BTreeMap<CompactString, CategoryRecords>,
    lookback_starts: AHashMap<(CompactString, DimensionSegments), LifecycleHalf>,
}

impl<'a> TableBuilder<'a> {
    pub fn new(registry: &'a SchemaRegistry) -> Self {
        Self {
            registry,
            categories: BTreeMap::new(),
            lookback_starts: AHashMap::new(),
        }
    }

    /// Make sure a table exists for `category`, even if none of its samples parse
    pub fn observe(&mut self, category: &str) {
        if self.registry.get(category).is_some() && !self.categories.contains_key(category) {
            self.categories
                .insert(CompactString::from(category), CategoryRecords::default());
        }
    }

    /// Add a record of the window being built
    pub fn add(&mut self, record: SampleRecord) {
        self.observe(record.category());
        match record {
            SampleRecord::Lifecycle {
                category,
                dims,
                phase,
                time,
                values,
            } => {
                let Some(records) = self.categories.get_mut(&category) else {
                    return;
                };
                let half = LifecycleHalf { time, values };
                match phase {
                    Phase::Start => records.starts.insert(dims, half),
                    Phase::Finish => records.finishes.insert(dims, half),
                };
            }
            SampleRecord::Point {
                category,
                dims,
                time,
                values,
            } => {
                if let Some(records) = self.categories.get_mut(&category) {
                    records.points.push((dims, time, values));
                }
            }
        }
    }

    /// Offer a `start` from an earlier window. The most recent window wins.
    pub fn add_lookback(&mut self, record: SampleRecord) {
        if let SampleRecord::Lifecycle {
            category,
            dims,
            phase: Phase::Start,
            time,
            values,
        } = record
        {
            self.lookback_starts
                .entry((category, dims))
                .or_insert(LifecycleHalf { time, values });
        }
    }

    /// Build every observed category's table
    pub fn build(mut self) -> AHashMap<CompactString, AggregateTable> {
        let mut tables = AHashMap::with_capacity(self.categories.len());

        for (category, mut records) in std::mem::take(&mut self.categories) {
            let Some(schema) = self.registry.get(&category) else {
                continue;
            };
            let mut table = AggregateTable::new(schema);

            if schema.is_lifecycle() {
                let mut keys: BTreeSet<DimensionSegments> = records.finishes.keys().cloned().collect();
                keys.extend(records.starts.keys().cloned());

                for dims in keys {
                    let finish = records.finishes.remove(&dims);
                    let start = records.starts.remove(&dims);
                    let start = match (&finish, start) {
                        (_, Some(start)) => Some(start),
                        (Some(_), None) => self.lookback_starts.remove(&(category.clone(), dims.clone())),
                        (None, None) => None,
                    };
                    table.push_lifecycle(&dims, start, finish);
                }
            } else {
                for (dims, time, values) in records.points {
                    table.push_point(&dims, time, values);
                }
            }

            tables.insert(category, table);
        }
        tables
    }
}

// ----------------------------------------------------------------------------
// 15.3 Published Snapshots
// ----------------------------------------------------------------------------

/// The full set of tables built for one window. Immutable once published.
#[derive(Debug, Clone, Default)]
pub struct TableSnapshot {
    pub window: Option<WindowId>,
    pub built_at: Option<Timestamp>,
    tables: AHashMap<CompactString, Arc<AggregateTable>>,
}

impl TableSnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(window: WindowId, built_at: Timestamp, tables: AHashMap<CompactString, AggregateTable>) -> Self {
        Self {
            window: Some(window),
            built_at: Some(built_at),
            tables: tables.into_iter().map(|(k, v)| (k, Arc::new(v))).collect(),
        }
    }

    pub fn table(&self, category: &str) -> Option<&Arc<AggregateTable>> {
        self.tables.get(category)
    }

    /// Category names with a table, sorted
    pub fn categories(&self) -> Vec<CompactString> {
        let mut names: Vec<_> = self.tables.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn total_rows(&self) -> usize {
        self.tables.values().map(|t| t.len()).sum()
    }
}

/// Handle through which the aggregator publishes and readers load snapshots
pub type PublishedTables = Arc<ArcSwap<TableSnapshot>>;

pub fn new_published_tables() -> PublishedTables {
    Arc::new(ArcSwap::from_pointee(TableSnapshot::empty()))
}

// ============================================================================
// SECTION 16: READER / AGGREGATOR
// ============================================================================
// A single long-lived background worker, restarted from scratch by an outer
// supervisor whenever a pass fails:
//
//   STARTING → RUNNING → (FAILED → RESTARTING → STARTING → RUNNING) | STOPPED
// ============================================================================

// ----------------------------------------------------------------------------
// 16.1 Aggregator State
// ----------------------------------------------------------------------------

/// Lifecycle state of the aggregator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregatorState {
    Starting,
    Running,
    Failed,
    Restarting,
    Stopped,
}

impl AggregatorState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            AggregatorState::Starting => "starting",
            AggregatorState::Running => "running",
            AggregatorState::Failed => "failed",
            AggregatorState::Restarting => "restarting",
            AggregatorState::Stopped => "stopped",
        }
    }
}

impl Display for AggregatorState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub windows_processed: usize,
    pub samples_read: usize,
    pub parse_errors: usize,
    pub rows: usize,
    pub partial_rows: usize,
}

impl PassReport {
    fn absorb(&mut self, other: PassReport) {
        self.windows_processed += other.windows_processed;
        self.samples_read += other.samples_read;
        self.parse_errors += other.parse_errors;
        self.rows += other.rows;
        self.partial_rows += other.partial_rows;
    }
}

/// Marker value meaning "no window processed yet"
const NO_WINDOW: i64 = i64::MIN;

// ----------------------------------------------------------------------------
// 16.2 Aggregation Worker
// ----------------------------------------------------------------------------

/// One incarnation of the reader. Discarded on any fatal error.
#[derive(Debug)]
pub struct AggregatorWorker {
    generation: u64,
    store: Arc<WindowStore>,
    registry: Arc<SchemaRegistry>,
    lookback: usize,
    published: PublishedTables,
    last_processed: Arc<AtomicI64>,
    pool: rayon::ThreadPool,
    stats: Arc<PipelineStats>,
}

impl AggregatorWorker {
    /// Run one pass: process every closed, unprocessed window in order.
    #[instrument(level = "debug", skip(self), fields(generation = self.generation))]
    pub fn run_pass(&mut self, now: Timestamp) -> Result<PassReport, AggregatorError> {
        let spec = self.store.spec();
        let current = spec.window_of(now);
        let last = self.last_processed.load(AtomicOrdering::Acquire);

        let pending: Vec<WindowId> = self
            .store
            .list_windows()?
            .range(..current)
            .filter(|w| w.as_millis() > last)
            .copied()
            .collect();

        let mut report = PassReport::default();
        for window in pending {
            let window_report = self.process_window(window, now)?;
            report.absorb(window_report);
        }
        Ok(report)
    }

    /// Read, parse and aggregate one closed window, then publish it
    fn process_window(&self, window: WindowId, now: Timestamp) -> Result<PassReport, AggregatorError> {
        let started = Instant::now();
        let spec = self.store.spec();
        let medium = Arc::clone(self.store.medium());
        let registry = &*self.registry;

        let locations = medium.locations(window)?;
        let parsed = self.read_and_parse(&medium, registry, &locations)?;

        let mut builder = TableBuilder::new(registry);
        let mut report = PassReport {
            windows_processed: 1,
            ..PassReport::default()
        };

        for (location, result) in locations.iter().zip(parsed) {
            builder.observe(&location.category);
            match result {
                None => {}
                Some(Ok(record)) => {
                    report.samples_read += 1;
                    builder.add(record);
                }
                Some(Err(e)) => {
                    report.samples_read += 1;
                    report.parse_errors += 1;
                    debug!(
                        target: "pulse::aggregator",
                        location = %location,
                        error = %e,
                        "Skipping malformed sample"
                    );
                }
            }
        }

        for n in 1..=self.lookback {
            let earlier = spec.preceding(window, n);
            let starts: Vec<StorageLocation> = medium
                .locations(earlier)?
                .into_iter()
                .filter(|l| l.terminal == Terminal::Phase(Phase::Start))
                .collect();
            for record in self
                .read_and_parse(&medium, registry, &starts)?
                .into_iter()
                .flatten()
                .flatten()
            {
                builder.add_lookback(record);
            }
        }

        let tables = builder.build();
        for table in tables.values() {
            report.rows += table.len();
            report.partial_rows += table.partial_rows();
        }

        self.published
            .store(Arc::new(TableSnapshot::new(window, now, tables)));
        self.last_processed
            .store(window.as_millis(), AtomicOrdering::Release);

        PipelineStats::bump(&self.stats.windows_processed, 1);
        PipelineStats::bump(&self.stats.samples_read, report.samples_read as u64);
        PipelineStats::bump(&self.stats.parse_errors, report.parse_errors as u64);

        if report.parse_errors > 0 {
            warn!(
                target: "pulse::aggregator",
                window = %window,
                parse_errors = report.parse_errors,
                samples = report.samples_read,
                "Window contained malformed samples"
            );
        }
        debug!(
            target: "pulse::aggregator",
            window = %window,
            rows = report.rows,
            partial_rows = report.partial_rows,
            elapsed_us = started.elapsed().as_micros() as u64,
            "Window published"
        );
        Ok(report)
    }

    /// Read and parse `locations` on the parse pool, preserving order.
    /// `None` marks a location that vanished between listing and reading.
    fn read_and_parse(
        &self,
        medium: &Arc<dyn SampleMedium>,
        registry: &SchemaRegistry,
        locations: &[StorageLocation],
    ) -> StoreResult<Vec<Option<ParseResult<SampleRecord>>>> {
        self.pool.install(|| {
            locations
                .par_iter()
                .map(|location| -> StoreResult<Option<ParseResult<SampleRecord>>> {
                    match medium.get(location) {
                        Ok(body) => Ok(body.map(|body| parse_location(registry, location, &body))),
                        // Undecodable bodies count as parse errors
                        Err(StoreError::InvalidEncoding { location: at }) => {
                            Ok(Some(Err(ParseError::InvalidEncoding { location: at })))
                        }
                        Err(e) => Err(e),
                    }
                })
                .collect()
        })
    }
}

// ----------------------------------------------------------------------------
// 16.3 Aggregator Supervisor
// ----------------------------------------------------------------------------

/// Supervises the aggregation worker, rebuilding it after every failure.
#[derive(Debug)]
pub struct Aggregator {
    store: Arc<WindowStore>,
    registry: Arc<SchemaRegistry>,
    lookback: usize,
    delay: Duration,
    parse_threads: usize,
    published: PublishedTables,
    last_processed: Arc<AtomicI64>,
    state: AtomicCell<AggregatorState>,
    restarts: AtomicU64,
    generation: AtomicU64,
    stats: Arc<PipelineStats>,
    clock: Arc<dyn TimeSource>,
}

impl Aggregator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<WindowStore>,
        registry: Arc<SchemaRegistry>,
        lookback: usize,
        delay: Duration,
        parse_threads: usize,
        published: PublishedTables,
        stats: Arc<PipelineStats>,
        clock: Arc<dyn TimeSource>,
    ) -> Self {
        Self {
            store,
            registry,
            lookback,
            delay,
            parse_threads: parse_threads.clamp(1, MAX_PARSE_THREADS),
            published,
            last_processed: Arc::new(AtomicI64::new(NO_WINDOW)),
            state: AtomicCell::new(AggregatorState::Starting),
            restarts: AtomicU64::new(0),
            generation: AtomicU64::new(0),
            stats,
            clock,
        }
    }

    pub fn state(&self) -> AggregatorState {
        self.state.load()
    }

    pub fn restarts(&self) -> u64 {
        self.restarts.load(AtomicOrdering::Relaxed)
    }

    /// Most recent window folded into the published snapshot
    pub fn last_processed(&self) -> Option<WindowId> {
        match self.last_processed.load(AtomicOrdering::Acquire) {
            NO_WINDOW => None,
            millis => Some(WindowId::from_millis(millis)),
        }
    }

    pub fn published(&self) -> &PublishedTables {
        &self.published
    }

    /// Build a fresh worker with its own parse pool
    fn spawn_worker(&self) -> Result<AggregatorWorker, AggregatorError> {
        let generation = self.generation.fetch_add(1, AtomicOrdering::Relaxed) + 1;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.parse_threads)
            .thread_name(move |i| format!("pulse-parse-{}-{}", generation, i))
            .build()
            .map_err(|e| AggregatorError::PoolUnavailable { message: e.to_string() })?;

        debug!(
            target: "pulse::aggregator",
            generation,
            parse_threads = self.parse_threads,
            "Aggregation worker created"
        );

        Ok(AggregatorWorker {
            generation,
            store: Arc::clone(&self.store),
            registry: Arc::clone(&self.registry),
            lookback: self.lookback,
            published: Arc::clone(&self.published),
            last_processed: Arc::clone(&self.last_processed),
            pool,
            stats: Arc::clone(&self.stats),
        })
    }

    fn record_failure(&self, reason: &str) {
        self.state.store(AggregatorState::Failed);
        let restarts = self.restarts.fetch_add(1, AtomicOrdering::Relaxed) + 1;
        PipelineStats::bump(&self.stats.aggregator_restarts, 1);
        error!(
            target: "pulse::aggregator",
            restarts,
            error = %reason,
            "Aggregation pass failed, restarting worker"
        );
        self.state.store(AggregatorState::Restarting);
    }

    /// One supervisor step: (re)build the worker if needed, then run a pass.
    ///
    /// On failure the worker is dropped and `None` is returned.
    pub fn tick(&self, worker: &mut Option<AggregatorWorker>) -> Option<PassReport> {
        if worker.is_none() {
            self.state.store(AggregatorState::Starting);
            match self.spawn_worker() {
                Ok(fresh) => *worker = Some(fresh),
                Err(e) => {
                    self.record_failure(&e.to_string());
                    return None;
                }
            }
            self.state.store(AggregatorState::Running);
        }

        let active = worker.as_mut()?;
        let now = self.clock.now();
        match active.run_pass(now) {
            Ok(report) => {
                PipelineStats::bump(&self.stats.passes, 1);
                Some(report)
            }
            Err(e) => {
                *worker = None;
                self.record_failure(&e.to_string());
                None
            }
        }
    }

    /// Time until the next window boundary plus the settle delay
    pub fn next_wake(&self) -> Duration {
        let now = self.clock.now();
        let target = self.store.spec().next_boundary(now).add_duration(self.delay);
        target.duration_since(now)
    }

    /// Supervisor loop. Passes run on the blocking pool; a panic inside a pass
    /// counts as a failure and the worker is rebuilt on the next tick.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            target: "pulse::aggregator",
            lookback = self.lookback,
            delay_ms = self.delay.as_millis() as u64,
            parse_threads = self.parse_threads,
            "Aggregator started"
        );

        let mut slot: Option<AggregatorWorker> = None;
        while !shutdown.is_cancelled() {
            let this = Arc::clone(&self);
            let mut worker = slot.take();
            let joined = task::spawn_blocking(move || {
                let report = this.tick(&mut worker);
                (worker, report)
            })
            .await;

            match joined {
                Ok((worker, report)) => {
                    slot = worker;
                    if let Some(report) = report.filter(|r| r.windows_processed > 0) {
                        info!(
                            target: "pulse::aggregator",
                            windows = report.windows_processed,
                            samples = report.samples_read,
                            rows = report.rows,
                            parse_errors = report.parse_errors,
                            "Aggregation pass complete"
                        );
                    }
                }
                Err(e) => {
                    let reason = AggregatorError::WorkerCrashed { message: e.to_string() };
                    self.record_failure(&reason.to_string());
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(self.next_wake()) => {}
            }
        }

        self.state.store(AggregatorState::Stopped);
        info!(target: "pulse::aggregator", restarts = self.restarts(), "Aggregator stopped");
    }
}

// ============================================================================
// SECTION 17: PHASE 3 TESTS
// ============================================================================



// ============================================================================
// PHASE 4: QUERY SURFACE & ENGINE
// The query service, its HTTP endpoint and the engine that wires it all up
// ============================================================================

// ============================================================================
// SECTION 18: QUERY SERVICE
// ============================================================================
// Read-only access to the most recently published snapshot. Never blocks on
// the aggregator: a query sees either the previous snapshot or the new one.
// ============================================================================

// ----------------------------------------------------------------------------
// 18.1 Query Parameters
// ----------------------------------------------------------------------------

/// Query keys with a fixed meaning; every other key is a column filter.
pub const RESERVED_QUERY_KEYS: [&str; 3] = ["category", "groupby", "agg"];

/// Split a raw query string into parameters.
///
/// Values are taken verbatim (no percent-decoding). The first `=` separates key
/// from value, a bare key maps to the empty string, empty pieces are skipped and
/// a repeated key keeps its last value.
pub fn parse_query_string(raw: &str) -> AHashMap<String, String> {
    let mut params = AHashMap::new();
    for piece in raw.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = piece.split_once('=').unwrap_or((piece, ""));
        params.insert(key.to_string(), value.to_string());
    }
    params
}

// ----------------------------------------------------------------------------
// 18.2 Aggregation Functions
// ----------------------------------------------------------------------------

/// Aggregation applied per group to each metric column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateFunction {
    Sum,
    Avg,
    Min,
    Max,
    Count,
}

impl AggregateFunction {
    /// Apply this aggregation to the non-null values of a column.
    /// `None` when there is nothing to aggregate.
    pub fn apply(&self, values: &[f64]) -> Option<f64> {
        if values.is_empty() {
            return match self {
                AggregateFunction::Count => Some(0.0),
                _ => None,
            };
        }

        Some(match self {
            AggregateFunction::Sum => values.iter().sum(),
            AggregateFunction::Avg => values.iter().sum::<f64>() / values.len() as f64,
            AggregateFunction::Min => values.iter().cloned().fold(f64::INFINITY, f64::min),
            AggregateFunction::Max => values.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
            AggregateFunction::Count => values.len() as f64,
        })
    }
}

impl FromStr for AggregateFunction {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sum" => Ok(AggregateFunction::Sum),
            "avg" => Ok(AggregateFunction::Avg),
            "min" => Ok(AggregateFunction::Min),
            "max" => Ok(AggregateFunction::Max),
            "count" => Ok(AggregateFunction::Count),
            other => Err(QueryError::malformed(
                "agg",
                format!("'{}' is not one of sum, avg, min, max, count", other),
            )),
        }
    }
}

// ----------------------------------------------------------------------------
// 18.3 Query Results
// ----------------------------------------------------------------------------

/// Name and type of one result column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: String,
}

impl FieldInfo {
    fn new(name: &str, ty: FieldType) -> Self {
        Self {
            name: name.to_string(),
            ty: ty.sql_name().to_string(),
        }
    }
}

/// `(fields, records)` answer of a query. Values are rendered as strings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub fields: Vec<FieldInfo>,
    pub records: Vec<Vec<Option<String>>>,
}

impl QueryResponse {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Position of a field by name
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Value of field `name` in record `row`
    pub fn value(&self, row: usize, name: &str) -> Option<&str> {
        let idx = self.field_index(name)?;
        self.records.get(row)?.get(idx)?.as_deref()
    }
}

// ----------------------------------------------------------------------------
// 18.4 Query Service
// ----------------------------------------------------------------------------

/// Answers queries against the published table snapshot.
#[derive(Debug, Clone)]
pub struct QueryService {
    published: PublishedTables,
    registry: Arc<SchemaRegistry>,
    stats: Arc<PipelineStats>,
}

impl QueryService {
    pub fn new(published: PublishedTables, registry: Arc<SchemaRegistry>, stats: Arc<PipelineStats>) -> Self {
        Self {
            published,
            registry,
            stats,
        }
    }

    /// Window of the snapshot queries currently run against
    pub fn published_window(&self) -> Option<WindowId> {
        self.published.load().window
    }

    /// Categories with a table in the current snapshot
    pub fn categories(&self) -> Vec<CompactString> {
        self.published.load().categories()
    }

    /// Rows across every table of the current snapshot
    pub fn published_rows(&self) -> usize {
        self.published.load().total_rows()
    }

    /// Run one query
    pub fn query(&self, params: &AHashMap<String, String>) -> Result<QueryResponse, QueryError> {
        PipelineStats::bump(&self.stats.queries, 1);
        let result = self.execute(params);
        if let Err(e) = &result {
            PipelineStats::bump(&self.stats.query_errors, 1);
            debug!(target: "pulse::query", error = %e, "Query rejected");
        }
        result
    }

    fn execute(&self, params: &AHashMap<String, String>) -> Result<QueryResponse, QueryError> {
        let category = params
            .get("category")
            .filter(|c| !c.is_empty())
            .ok_or_else(|| QueryError::malformed("category", "is required"))?;

        let snapshot = self.published.load();
        let table = snapshot
            .table(category)
            .ok_or_else(|| QueryError::UnknownCategory {
                category: category.clone(),
            })?;

        if let Some(schema) = self.registry.get(category) {
            for key in &schema.required_filters {
                if !params.contains_key(key.as_str()) {
                    return Err(QueryError::malformed(
                        key.as_str(),
                        format!("is required for category '{}'", category),
                    ));
                }
            }
        }

        let filters: Vec<(usize, &str)> = params
            .iter()
            .filter(|(k, _)| !RESERVED_QUERY_KEYS.contains(&k.as_str()))
            .filter_map(|(k, v)| table.column_index(k).map(|idx| (idx, v.as_str())))
            .collect();

        let rows: Vec<&Row> = table
            .rows()
            .iter()
            .filter(|row| {
                filters.iter().all(|(idx, expected)| {
                    matches!(&row[*idx], Some(value) if value.to_string() == *expected)
                })
            })
            .collect();

        match params.get("groupby") {
            Some(groupby) => {
                let agg = params
                    .get("agg")
                    .ok_or_else(|| QueryError::malformed("agg", "is required with groupby"))?
                    .parse::<AggregateFunction>()?;
                grouped_response(table, &rows, groupby, agg)
            }
            None if params.contains_key("agg") => Err(QueryError::malformed("agg", "requires groupby")),
            None => Ok(QueryResponse {
                fields: table
                    .columns
                    .iter()
                    .map(|c| FieldInfo::new(&c.name, c.ty))
                    .collect(),
                records: rows
                    .iter()
                    .map(|row| row.iter().map(|cell| cell.as_ref().map(|v| v.to_string())).collect())
                    .collect(),
            }),
        }
    }
}

/// Group `rows` by the listed columns and aggregate every metric column.
fn grouped_response(
    table: &AggregateTable,
    rows: &[&Row],
    groupby: &str,
    agg: AggregateFunction,
) -> Result<QueryResponse, QueryError> {
    let mut group_cols: Vec<usize> = Vec::new();
    for name in groupby.split(',').map(str::trim).filter(|n| !n.is_empty()) {
        let idx = table
            .column_index(name)
            .ok_or_else(|| QueryError::malformed("groupby", format!("unknown column '{}'", name)))?;
        if !group_cols.contains(&idx) {
            group_cols.push(idx);
        }
    }
    if group_cols.is_empty() {
        return Err(QueryError::malformed("groupby", "must name at least one column"));
    }

    let metric_cols: Vec<usize> = table
        .columns
        .iter()
        .enumerate()
        .filter(|(idx, c)| c.kind == FieldKind::Metric && !group_cols.contains(idx))
        .map(|(idx, _)| idx)
        .collect();

    let mut groups: BTreeMap<Vec<Option<String>>, Vec<&Row>> = BTreeMap::new();
    for row in rows {
        let key = group_cols
            .iter()
            .map(|idx| row[*idx].as_ref().map(|v| v.to_string()))
            .collect();
        groups.entry(key).or_default().push(*row);
    }

    let mut fields: Vec<FieldInfo> = group_cols
        .iter()
        .map(|idx| FieldInfo::new(&table.columns[*idx].name, FieldType::Text))
        .collect();
    fields.extend(
        metric_cols
            .iter()
            .map(|idx| FieldInfo::new(&table.columns[*idx].name, FieldType::Float)),
    );
    fields.push(FieldInfo::new("count", FieldType::Integer));

    let records = groups
        .into_iter()
        .map(|(key, members)| {
            let mut record = key;
            for idx in &metric_cols {
                let values: Vec<f64> = members
                    .iter()
                    .filter_map(|row| row[*idx].as_ref().and_then(FieldValue::as_f64))
                    .collect();
                record.push(agg.apply(&values).map(|v| v.to_string()));
            }
            record.push(Some(members.len().to_string()));
            record
        })
        .collect();

    Ok(QueryResponse { fields, records })
}

// ============================================================================
// SECTION 19: HTTP QUERY ENDPOINT
// ============================================================================
// axum router exposing the query service and a health probe.
// ============================================================================

/// Shared state of the HTTP handlers
#[derive(Debug, Clone)]
pub struct HttpState {
    pub service: QueryService,
    pub aggregator: Option<Arc<Aggregator>>,
    pub stats: Arc<PipelineStats>,
}

impl IntoResponse for QueryError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = json!({
            "error": {
                "type": self.kind(),
                "reason": self.to_string(),
            },
            "status": status.as_u16(),
        });
        (status, Json(body)).into_response()
    }
}

/// Build the HTTP router with tracing and a per-request deadline
pub fn build_router(state: HttpState, timeout: Duration) -> Router {
    Router::new()
        .route(QUERY_PATH, get(handle_metrics_query))
        .route(HEALTH_PATH, get(handle_health))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(timeout))
        .with_state(state)
}

async fn handle_metrics_query(State(state): State<HttpState>, RawQuery(raw): RawQuery) -> Response {
    let params = parse_query_string(raw.as_deref().unwrap_or_default());
    match state.service.query(&params) {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn handle_health(State(state): State<HttpState>) -> Response {
    let aggregator = state.aggregator.as_ref().map(|a| {
        json!({
            "state": a.state().as_str(),
            "restarts": a.restarts(),
            "last_processed": a.last_processed().map(|w| w.as_millis()),
        })
    });

    Json(json!({
        "status": "ok",
        "engine": ENGINE_NAME,
        "version": ENGINE_VERSION,
        "aggregator": aggregator,
        "published_window": state.service.published_window().map(|w| w.as_millis()),
        "categories": state.service.categories(),
        "published_rows": state.service.published_rows(),
        "stats": state.stats.snapshot(),
    }))
    .into_response()
}

/// Serve `router` on `listener` until `shutdown` is cancelled
pub async fn serve_http(listener: TokioTcpListener, router: Router, shutdown: CancellationToken) -> io::Result<()> {
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

// ============================================================================
// SECTION 20: ENGINE
// ============================================================================
// Owns every component and the background tasks: the aggregator supervisor,
// the retention loop and the HTTP server.
// ============================================================================

/// The main engine state
#[derive(Debug)]
pub struct Engine {
    config: EngineConfig,
    registry: Arc<SchemaRegistry>,
    writer: SampleWriter,
    store: Arc<WindowStore>,
    aggregator: Arc<Aggregator>,
    query: QueryService,
    stats: Arc<PipelineStats>,
    clock: Arc<dyn TimeSource>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<TokioJoinHandle<()>>>,
    start_time: Timestamp,
}

impl Engine {
    /// Create an engine with the built-in categories and the system clock
    pub fn new(config: EngineConfig) -> PulseResult<Self> {
        Self::with_parts(config, SchemaRegistry::builtin(), Arc::new(SystemTimeSource))
    }

    /// Create an engine with a custom schema registry and clock
    pub fn with_parts(config: EngineConfig, registry: SchemaRegistry, clock: Arc<dyn TimeSource>) -> PulseResult<Self> {
        config.validate()?;

        let registry = Arc::new(registry);
        let stats = Arc::new(PipelineStats::new());
        let spec = config.window_spec();
        let medium = open_medium(&config.store)?;

        let writer = SampleWriter::new(
            Arc::clone(&medium),
            Addresser::new(spec, Arc::clone(&registry)),
            Arc::clone(&stats),
        );
        let store = Arc::new(WindowStore::new(
            Arc::clone(&medium),
            spec,
            config.store.retention_windows,
            Arc::clone(&stats),
        ));
        let published = new_published_tables();
        let aggregator = Arc::new(Aggregator::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            config.aggregator.lookback_windows,
            config.aggregator.delay,
            config.effective_parse_threads(),
            Arc::clone(&published),
            Arc::clone(&stats),
            Arc::clone(&clock),
        ));
        let query = QueryService::new(published, Arc::clone(&registry), Arc::clone(&stats));

        info!(
            target: "pulse::engine",
            medium = medium.name(),
            window_ms = spec.duration().as_millis() as u64,
            retention = config.store.retention_windows,
            categories = registry.categories().len(),
            "Engine assembled"
        );

        Ok(Self {
            config,
            registry,
            writer,
            store,
            aggregator,
            query,
            stats,
            clock,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            start_time: Timestamp::now(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    /// Write primitive for instrumentation adapters
    pub fn writer(&self) -> &SampleWriter {
        &self.writer
    }

    pub fn store(&self) -> &Arc<WindowStore> {
        &self.store
    }

    pub fn aggregator(&self) -> &Arc<Aggregator> {
        &self.aggregator
    }

    pub fn query_service(&self) -> &QueryService {
        &self.query
    }

    pub fn stats(&self) -> PipelineStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn uptime(&self) -> Duration {
        Timestamp::now().duration_since(self.start_time)
    }

    /// Token cancelled when the engine shuts down
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Signal shutdown
    pub fn shutdown(&self) {
        info!(target: "pulse::engine", "Shutdown requested");
        self.shutdown.cancel();
    }

    /// HTTP router over this engine's query service
    pub fn router(&self) -> Router {
        build_router(
            HttpState {
                service: self.query.clone(),
                aggregator: Some(Arc::clone(&self.aggregator)),
                stats: Arc::clone(&self.stats),
            },
            self.config.query.timeout,
        )
    }

    /// Bind the query endpoint and spawn the background tasks.
    /// Returns the address the endpoint listens on.
    pub async fn start(&self) -> PulseResult<SocketAddr> {
        if self.shutdown.is_cancelled() {
            return Err(PulseError::ShuttingDown);
        }

        let addr = self.config.query.socket_addr()?;
        let listener = TokioTcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        let router = self.router();
        let shutdown = self.shutdown.clone();
        {
            let mut tasks = self.tasks.lock();
            tasks.push(tokio::spawn(
                Arc::clone(&self.aggregator).run(self.shutdown.clone()),
            ));
            tasks.push(tokio::spawn(
                Arc::clone(&self.store).run_retention(Arc::clone(&self.clock), self.shutdown.clone()),
            ));
            tasks.push(tokio::spawn(async move {
                if let Err(e) = serve_http(listener, router, shutdown.clone()).await {
                    error!(target: "pulse::http", error = %e, "Query endpoint failed");
                    shutdown.cancel();
                }
            }));
        }

        info!(
            target: "pulse::engine",
            addr = %local_addr,
            path = QUERY_PATH,
            "Query endpoint listening"
        );
        Ok(local_addr)
    }

    /// Run until SIGINT/SIGTERM or cancellation, then shut down gracefully
    pub async fn run(&self) -> PulseResult<()> {
        info!(
            target: "pulse::engine",
            version = ENGINE_VERSION,
            instance = %self.config.engine.instance_name,
            "Starting Pulse Engine"
        );

        self.start().await?;
        wait_for_signal(self.shutdown.clone()).await;
        self.stop().await;
        Ok(())
    }

    /// Cancel every task and wait for them within the shutdown timeout
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let handles: Vec<_> = std::mem::take(&mut *self.tasks.lock());

        let shutdown_start = Instant::now();
        let deadline = shutdown_start + Duration::from_secs(self.config.engine.shutdown_timeout_secs);
        for handle in handles {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(target: "pulse::engine", error = %e, "Task ended abnormally"),
                Err(_) => warn!(target: "pulse::engine", "Task did not stop before the shutdown timeout"),
            }
        }

        info!(
            target: "pulse::engine",
            duration_ms = shutdown_start.elapsed().as_millis() as u64,
            uptime_secs = self.uptime().as_secs(),
            "Engine shutdown complete"
        );
    }
}

/// Resolve on SIGINT, SIGTERM or cancellation of `shutdown`
async fn wait_for_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(target: "pulse::engine", error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = signal::ctrl_c() => info!(target: "pulse::engine", "Received SIGINT"),
        _ = terminate => info!(target: "pulse::engine", "Received SIGTERM"),
        _ = shutdown.cancelled() => {}
    }
}

// ============================================================================
// SECTION 21: PHASE 4 TESTS
// ============================================================================

#[cfg(test)]
mod phase4_tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use tower::ServiceExt;

    fn memory_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.store.backend = StoreBackend::Memory;
        config.query.bind_address = "127.0.0.1".into();
        config.query.port = 0;
        config.engine.shutdown_timeout_secs = 5;
        config
    }

    fn engine_with(registry: SchemaRegistry) -> (Engine, Arc<ManualTimeSource>) {
        let clock = Arc::new(ManualTimeSource::new(Timestamp::from_millis(0)));
        let engine = Engine::with_parts(memory_config(), registry, clock.clone()).unwrap();
        (engine, clock)
    }

    fn request(engine: &Engine, rid: &str, indices: &str, docs: i64, start: i64, finish: Option<(i64, i64)>) {
        engine
            .writer()
            .emit(
                "http",
                &[("rid", rid), ("indices", indices)],
                &[("docs", FieldValue::from(docs))],
                Some(Phase::Start),
                Timestamp::from_millis(start),
            )
            .unwrap();
        if let Some((status, at)) = finish {
            let status = status.to_string();
            engine
                .writer()
                .emit(
                    "http",
                    &[("rid", rid), ("status", status.as_str())],
                    &[],
                    Some(Phase::Finish),
                    Timestamp::from_millis(at),
                )
                .unwrap();
        }
    }

    /// Engine with four requests in window 0, already aggregated
    fn seeded_engine() -> Engine {
        let (engine, clock) = engine_with(SchemaRegistry::builtin());
        request(&engine, "1", "logs", 5, 1_000, Some((200, 1_050)));
        request(&engine, "2", "logs", 7, 1_100, Some((200, 1_300)));
        request(&engine, "3", "metrics", 1, 1_200, Some((500, 1_210)));
        request(&engine, "4", "logs", 2, 1_400, None);

        clock.set(Timestamp::from_millis(5_500));
        let mut worker = None;
        let report = engine.aggregator().tick(&mut worker).unwrap();
        assert_eq!(report.windows_processed, 1);
        engine
    }

    fn params(raw: &str) -> AHashMap<String, String> {
        parse_query_string(raw)
    }

    // ------------------------------------------------------------------------
    // Query parameters
    // ------------------------------------------------------------------------

    #[test]
    fn test_parse_query_string() {
        let parsed = params("category=http&&status=200&flag&status=500&expr=a=b");
        assert_eq!(parsed.len(), 4);
        assert_eq!(parsed["category"], "http");
        assert_eq!(parsed["status"], "500");
        assert_eq!(parsed["flag"], "");
        assert_eq!(parsed["expr"], "a=b");
        assert!(params("").is_empty());
    }

    #[rstest]
    #[case(AggregateFunction::Sum, Some(9.0))]
    #[case(AggregateFunction::Avg, Some(3.0))]
    #[case(AggregateFunction::Min, Some(1.0))]
    #[case(AggregateFunction::Max, Some(5.0))]
    #[case(AggregateFunction::Count, Some(3.0))]
    fn test_aggregate_functions(#[case] agg: AggregateFunction, #[case] expected: Option<f64>) {
        assert_eq!(agg.apply(&[1.0, 3.0, 5.0]), expected);
    }

    #[test]
    fn test_aggregate_over_nothing() {
        assert_eq!(AggregateFunction::Avg.apply(&[]), None);
        assert_eq!(AggregateFunction::Sum.apply(&[]), None);
        assert_eq!(AggregateFunction::Count.apply(&[]), Some(0.0));
    }

    #[test]
    fn test_aggregate_function_names() {
        assert_eq!("max".parse::<AggregateFunction>().unwrap(), AggregateFunction::Max);
        let err = "median".parse::<AggregateFunction>().unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert!(err.to_string().contains("median"));
    }

    // ------------------------------------------------------------------------
    // Query service
    // ------------------------------------------------------------------------

    #[test]
    fn test_full_table_query() {
        let engine = seeded_engine();
        let response = engine.query_service().query(&params("category=http")).unwrap();

        let names: Vec<&str> = response.fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "rid",
                "indices",
                "operation",
                "docs",
                "status",
                "exception",
                "response_bytes",
                "start_time",
                "finish_time",
                "latency_ms"
            ]
        );
        assert_eq!(response.fields[1].ty, "VARCHAR");
        assert_eq!(response.fields[3].ty, "BIGINT");

        assert_eq!(response.len(), 4);
        assert_eq!(response.value(0, "rid"), Some("1"));
        assert_eq!(response.value(0, "docs"), Some("5"));
        assert_eq!(response.value(0, "status"), Some("200"));
        assert_eq!(response.value(0, "latency_ms"), Some("50"));
        assert_eq!(response.value(3, "rid"), Some("4"));
        assert_eq!(response.value(3, "status"), None);
    }

    #[rstest]
    #[case("category=http&status=200", 2)]
    #[case("category=http&indices=logs", 3)]
    #[case("category=http&indices=logs&status=200", 2)]
    #[case("category=http&indices=nothing", 0)]
    #[case("category=http&colour=blue", 4)]
    fn test_column_filters(#[case] raw: &str, #[case] expected: usize) {
        let engine = seeded_engine();
        let response = engine.query_service().query(&params(raw)).unwrap();
        assert_eq!(response.len(), expected);
    }

    #[rstest]
    #[case("sum", "12")]
    #[case("avg", "6")]
    #[case("min", "5")]
    #[case("max", "7")]
    #[case("count", "2")]
    fn test_groupby_aggregations(#[case] agg: &str, #[case] docs: &str) {
        let engine = seeded_engine();
        let raw = format!("category=http&groupby=status&agg={}", agg);
        let response = engine.query_service().query(&params(&raw)).unwrap();

        // Groups sort by key, the missing status first.
        assert_eq!(response.len(), 3);
        assert_eq!(response.value(0, "status"), None);
        assert_eq!(response.value(1, "status"), Some("200"));
        assert_eq!(response.value(2, "status"), Some("500"));
        assert_eq!(response.value(1, "docs"), Some(docs));
        assert_eq!(response.value(1, "count"), Some("2"));
    }

    #[test]
    fn test_grouped_fields_and_empty_aggregates() {
        let engine = seeded_engine();
        let response = engine
            .query_service()
            .query(&params("category=http&groupby=indices,status&agg=avg"))
            .unwrap();

        let fields: Vec<(&str, &str)> = response
            .fields
            .iter()
            .map(|f| (f.name.as_str(), f.ty.as_str()))
            .collect();
        assert_eq!(
            fields,
            vec![
                ("indices", "VARCHAR"),
                ("status", "VARCHAR"),
                ("docs", "DOUBLE"),
                ("response_bytes", "DOUBLE"),
                ("latency_ms", "DOUBLE"),
                ("count", "BIGINT"),
            ]
        );

        // logs/None, logs/200, metrics/500
        assert_eq!(response.len(), 3);
        assert_eq!(response.value(1, "latency_ms"), Some("125"));
        assert_eq!(response.value(1, "response_bytes"), None);

        let counted = engine
            .query_service()
            .query(&params("category=http&groupby=indices,status&agg=count"))
            .unwrap();
        assert_eq!(counted.value(1, "response_bytes"), Some("0"));
    }

    #[rstest]
    #[case("", "category")]
    #[case("category=", "category")]
    #[case("category=http&groupby=status", "agg")]
    #[case("category=http&agg=sum", "agg")]
    #[case("category=http&groupby=status&agg=median", "agg")]
    #[case("category=http&groupby=nope&agg=sum", "groupby")]
    #[case("category=http&groupby=,&agg=sum", "groupby")]
    fn test_malformed_queries(#[case] raw: &str, #[case] offending: &str) {
        let engine = seeded_engine();
        match engine.query_service().query(&params(raw)) {
            Err(QueryError::MalformedQuery { key, .. }) => assert_eq!(key, offending),
            other => panic!("expected malformed query, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_categories() {
        let engine = seeded_engine();
        for category in ["queue", "disk"] {
            let err = engine
                .query_service()
                .query(&params(&format!("category={}", category)))
                .unwrap_err();
            assert_eq!(
                err,
                QueryError::UnknownCategory {
                    category: category.to_string()
                }
            );
            assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
        }
    }

    #[test]
    fn test_required_filters() {
        let mut registry = SchemaRegistry::builtin();
        registry
            .register(
                CategorySchema::point(
                    "index_stats",
                    &["index"],
                    "stats",
                    vec![
                        FieldDef::dimension("tier", FieldType::Text),
                        FieldDef::metric("size_bytes", FieldType::Integer),
                    ],
                )
                .with_required_filter("tier"),
            )
            .unwrap();
        let (engine, clock) = engine_with(registry);
        engine
            .writer()
            .emit(
                "index_stats",
                &[("index", "logs"), ("tier", "hot")],
                &[("size_bytes", FieldValue::from(42i64))],
                None,
                Timestamp::from_millis(10),
            )
            .unwrap();
        clock.set(Timestamp::from_millis(5_020));
        engine.aggregator().tick(&mut None).unwrap();

        let err = engine
            .query_service()
            .query(&params("category=index_stats"))
            .unwrap_err();
        assert_eq!(err.kind(), "malformed_query");

        let response = engine
            .query_service()
            .query(&params("category=index_stats&tier=hot"))
            .unwrap();
        assert_eq!(response.len(), 1);
        assert_eq!(response.value(0, "size_bytes"), Some("42"));
    }

    #[test]
    fn test_queries_are_idempotent_and_counted() {
        let engine = seeded_engine();
        let service = engine.query_service();
        let p = params("category=http&groupby=indices&agg=sum");
        assert_eq!(service.query(&p).unwrap(), service.query(&p).unwrap());

        let _ = service.query(&params("category=queue"));
        let stats = engine.stats();
        assert_eq!(stats.queries, 3);
        assert_eq!(stats.query_errors, 1);
    }

    #[test]
    fn test_queries_see_newest_snapshot() {
        let (engine, clock) = engine_with(SchemaRegistry::builtin());
        assert_eq!(engine.query_service().published_window(), None);

        request(&engine, "1", "logs", 1, 100, Some((200, 200)));
        request(&engine, "2", "logs", 1, 5_100, Some((404, 5_200)));

        let mut worker = None;
        clock.set(Timestamp::from_millis(5_050));
        engine.aggregator().tick(&mut worker).unwrap();
        let first = engine.query_service().query(&params("category=http")).unwrap();
        assert_eq!(first.value(0, "status"), Some("200"));

        clock.set(Timestamp::from_millis(10_050));
        engine.aggregator().tick(&mut worker).unwrap();
        let second = engine.query_service().query(&params("category=http")).unwrap();
        assert_eq!(engine.query_service().published_window(), Some(WindowId::from_millis(5_000)));
        assert_eq!(second.len(), 1);
        assert_eq!(second.value(0, "status"), Some("404"));
    }

    // ------------------------------------------------------------------------
    // HTTP endpoint
    // ------------------------------------------------------------------------

    async fn get(router: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_http_query_returns_table() {
        let engine = seeded_engine();
        let (status, body) = get(engine.router(), &format!("{}?category=http&status=200", QUERY_PATH)).await;
        assert_eq!(status, StatusCode::OK);

        let response: QueryResponse = serde_json::from_value(body).unwrap();
        assert_eq!(response.len(), 2);
        assert_eq!(response.fields[0].name, "rid");
        assert_eq!(response.value(1, "docs"), Some("7"));
    }

    #[tokio::test]
    async fn test_http_errors_are_structured() {
        let engine = seeded_engine();

        let (status, body) = get(engine.router(), &format!("{}?category=queue", QUERY_PATH)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["type"], "unknown_category");
        assert_eq!(body["status"], 404);

        let (status, body) = get(engine.router(), QUERY_PATH).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["type"], "malformed_query");
        assert!(body["error"]["reason"].as_str().unwrap().contains("category"));
    }

    #[tokio::test]
    async fn test_http_health() {
        let engine = seeded_engine();
        let (status, body) = get(engine.router(), HEALTH_PATH).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["aggregator"]["state"], "running");
        assert_eq!(body["aggregator"]["last_processed"], 0);
        assert_eq!(body["published_window"], 0);
        assert_eq!(body["categories"], json!(["http"]));
        assert_eq!(body["published_rows"], 4);
        assert_eq!(body["stats"]["samples_written"], 7);
    }

    // ------------------------------------------------------------------------
    // Engine lifecycle
    // ------------------------------------------------------------------------

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_engine_serves_until_stopped() {
        let (engine, _clock) = engine_with(SchemaRegistry::builtin());
        let addr = engine.start().await.unwrap();
        assert_ne!(addr.port(), 0);

        let client = reqwest::Client::new();
        let health: serde_json::Value = client
            .get(format!("http://{}{}", addr, HEALTH_PATH))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["engine"], ENGINE_NAME);

        let missing = client
            .get(format!("http://{}{}?category=http", addr, QUERY_PATH))
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status().as_u16(), 404);

        engine.stop().await;
        assert!(engine.uptime() < Duration::from_secs(60));
        assert!(engine.shutdown_token().is_cancelled());
        assert_eq!(engine.aggregator().state(), AggregatorState::Stopped);
        assert!(matches!(engine.start().await, Err(PulseError::ShuttingDown)));
    }

    #[test]
    fn test_engine_rejects_invalid_config() {
        let mut config = memory_config();
        config.store.retention_windows = 1;
        let clock: Arc<dyn TimeSource> = Arc::new(SystemTimeSource);
        assert!(matches!(
            Engine::with_parts(config, SchemaRegistry::builtin(), clock),
            Err(PulseError::Config(_))
        ));
    }
}
