//! Progress telemetry: thread-safe counters, rolling-window ETA
//! estimation, and throttled status reporting.
//!
//! Telemetry is pluggable: the engine always feeds a
//! [`MetricsCollector`], and callers opt into emission by attaching a
//! [`ProgressReporter`] over any [`StatusSink`].

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Receives human-readable status lines, optionally with a 0-100 percent.
/// Rendering is the caller's concern.
pub trait StatusSink: Send + Sync {
    fn status(&self, message: &str, percent: Option<f64>);
}

impl<F> StatusSink for F
where
    F: Fn(&str, Option<f64>) + Send + Sync,
{
    fn status(&self, message: &str, percent: Option<f64>) {
        self(message, percent);
    }
}

/// Sink that drops everything. Useful for headless runs and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl StatusSink for NullSink {
    fn status(&self, _message: &str, _percent: Option<f64>) {}
}

/// How trustworthy the current ETA is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EtaConfidence {
    /// Fewer than five window samples.
    Unknown,
    /// Relative standard deviation of the window below 0.25.
    Stable,
    Volatile,
}

impl fmt::Display for EtaConfidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Stable => write!(f, "stable"),
            Self::Volatile => write!(f, "volatile"),
        }
    }
}

/// Point-in-time view of a run, recomputed on demand.
#[derive(Debug, Clone, Copy)]
pub struct ProgressSnapshot {
    pub files: u64,
    pub bytes: u64,
    pub errors: u64,
    /// 0 when the total is unknown.
    pub total_files: u64,
    /// 0.0 when the total is unknown.
    pub percent: f64,
    pub files_per_sec: f64,
    pub bytes_per_sec: f64,
    /// Mean seconds-per-file over the window times remaining files.
    pub eta: Option<Duration>,
    pub confidence: EtaConfidence,
}

const MIN_SAMPLES_FOR_ETA: usize = 5;
const STABLE_REL_STDDEV: f64 = 0.25;

struct SampleWindow {
    samples: VecDeque<f64>,
    capacity: usize,
    last_completion: Option<Instant>,
}

/// Thread-safe counters shared by the orchestrator and every download
/// task, plus a fixed-size rolling window of seconds-per-file samples
/// used to smooth the ETA.
pub struct MetricsCollector {
    files: AtomicU64,
    bytes: AtomicU64,
    errors: AtomicU64,
    total_files: AtomicU64,
    started: Instant,
    per_folder: Mutex<HashMap<String, u64>>,
    window: Mutex<SampleWindow>,
}

impl MetricsCollector {
    /// Default rolling window size.
    pub const DEFAULT_WINDOW: usize = 20;

    #[must_use]
    pub fn new() -> Self {
        Self::with_window(Self::DEFAULT_WINDOW)
    }

    #[must_use]
    pub fn with_window(capacity: usize) -> Self {
        Self {
            files: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            total_files: AtomicU64::new(0),
            started: Instant::now(),
            per_folder: Mutex::new(HashMap::new()),
            window: Mutex::new(SampleWindow {
                samples: VecDeque::with_capacity(capacity),
                capacity,
                last_completion: None,
            }),
        }
    }

    /// Declare the expected file total, enabling percent and ETA.
    pub fn set_total_files(&self, total: u64) {
        self.total_files.store(total, Ordering::Relaxed);
    }

    /// Record one completed file download.
    pub fn record_file(&self, folder: &str, bytes: u64) {
        self.files.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);

        if let Ok(mut folders) = self.per_folder.lock() {
            *folders.entry(folder.to_string()).or_insert(0) += 1;
        }

        let now = Instant::now();
        if let Ok(mut window) = self.window.lock() {
            let since = window
                .last_completion
                .map_or_else(|| self.started.elapsed(), |prev| now - prev);
            window.last_completion = Some(now);
            let capacity = window.capacity;
            window.samples.push_back(since.as_secs_f64());
            while window.samples.len() > capacity {
                window.samples.pop_front();
            }
        }
    }

    /// Record one failed file download.
    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn files(&self) -> u64 {
        self.files.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Files completed per destination directory.
    pub fn folder_breakdown(&self) -> HashMap<String, u64> {
        self.per_folder
            .lock()
            .map(|folders| folders.clone())
            .unwrap_or_default()
    }

    /// Recompute all derived values from the current counters.
    pub fn snapshot(&self) -> ProgressSnapshot {
        let files = self.files();
        let bytes = self.bytes();
        let total = self.total_files.load(Ordering::Relaxed);
        let elapsed = self.started.elapsed().as_secs_f64().max(f64::EPSILON);

        #[allow(clippy::cast_precision_loss)]
        let percent = if total == 0 {
            0.0
        } else {
            (files as f64 / total as f64) * 100.0
        };

        let (eta, confidence) = self
            .window
            .lock()
            .map_or((None, EtaConfidence::Unknown), |window| {
                window_estimate(&window.samples, total.saturating_sub(files))
            });

        #[allow(clippy::cast_precision_loss)]
        ProgressSnapshot {
            files,
            bytes,
            errors: self.errors(),
            total_files: total,
            percent,
            files_per_sec: files as f64 / elapsed,
            bytes_per_sec: bytes as f64 / elapsed,
            eta,
            confidence,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[allow(clippy::cast_precision_loss)]
fn window_estimate(
    samples: &VecDeque<f64>,
    remaining: u64,
) -> (Option<Duration>, EtaConfidence) {
    if samples.is_empty() {
        return (None, EtaConfidence::Unknown);
    }

    let mean = samples.iter().sum::<f64>() / samples.len() as f64;
    let eta = Duration::from_secs_f64((mean * remaining as f64).max(0.0));

    if samples.len() < MIN_SAMPLES_FOR_ETA {
        return (Some(eta), EtaConfidence::Unknown);
    }

    let variance =
        samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / samples.len() as f64;
    let rel_stddev = if mean > 0.0 {
        variance.sqrt() / mean
    } else {
        0.0
    };

    let confidence = if rel_stddev < STABLE_REL_STDDEV {
        EtaConfidence::Stable
    } else {
        EtaConfidence::Volatile
    };

    (Some(eta), confidence)
}

/// Throttles status emission: at most once per `every_files` completed
/// files OR once per `min_interval`, whichever fires first. `flush`
/// always emits.
pub struct ProgressReporter {
    sink: Box<dyn StatusSink>,
    every_files: u64,
    min_interval: Duration,
    state: Mutex<ReporterState>,
}

struct ReporterState {
    last_files: u64,
    last_emit: Instant,
}

impl ProgressReporter {
    pub fn new(sink: Box<dyn StatusSink>, every_files: u64, min_interval: Duration) -> Self {
        Self {
            sink,
            every_files: every_files.max(1),
            min_interval,
            state: Mutex::new(ReporterState {
                last_files: 0,
                last_emit: Instant::now(),
            }),
        }
    }

    /// Emit a status line if either throttle gate is open.
    pub fn maybe_report(&self, metrics: &MetricsCollector) {
        let snapshot = metrics.snapshot();
        let should_emit = self.state.lock().is_ok_and(|mut state| {
            let by_count = snapshot.files >= state.last_files + self.every_files;
            let by_time = state.last_emit.elapsed() >= self.min_interval;
            if by_count || by_time {
                state.last_files = snapshot.files;
                state.last_emit = Instant::now();
                true
            } else {
                false
            }
        });

        if should_emit {
            self.emit(&snapshot, false);
        }
    }

    /// Emit a final summary regardless of throttling state.
    pub fn flush(&self, metrics: &MetricsCollector) {
        let snapshot = metrics.snapshot();
        if let Ok(mut state) = self.state.lock() {
            state.last_files = snapshot.files;
            state.last_emit = Instant::now();
        }
        self.emit(&snapshot, true);
    }

    fn emit(&self, snapshot: &ProgressSnapshot, final_summary: bool) {
        let prefix = if final_summary { "done:" } else { "progress:" };
        let eta = snapshot.eta.map_or_else(
            || "eta unknown".to_string(),
            |eta| format!("eta {}s ({})", eta.as_secs(), snapshot.confidence),
        );
        let message = format!(
            "{prefix} {} files, {} bytes, {} errors, {:.1} files/s, {eta}",
            snapshot.files, snapshot.bytes, snapshot.errors, snapshot.files_per_sec,
        );
        let percent = (snapshot.total_files > 0).then_some(snapshot.percent);
        self.sink.status(&message, percent);
    }
}
