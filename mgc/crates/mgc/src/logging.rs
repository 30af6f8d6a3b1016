//! GC Logging and Tracing
//!
//! Structured collector events, useful for:
//! - Pause analysis
//! - Debugging heap corruption
//! - Production monitoring
//!
//! Every event is forwarded to the `log` facade. When the collector runs
//! with `GcConfig::verbose`, events are additionally printed to the console
//! (human-readable or JSON) with a wall-clock timestamp, and the most recent
//! ones are kept for inspection.
//!
//! Log Levels:
//! - ERROR: Allocation failures
//! - WARN: Unusual conditions (finalizer refused to run, side table misses)
//! - INFO: Collection cycles
//! - DEBUG: Per-phase statistics
//! - TRACE: Per-object operations

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

/// Log level for GC operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl LogLevel {
    fn to_log(self) -> log::Level {
        match self {
            LogLevel::Error => log::Level::Error,
            LogLevel::Warn => log::Level::Warn,
            LogLevel::Info => log::Level::Info,
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Trace => log::Level::Trace,
        }
    }
}

/// GC event types
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GcEvent {
    /// Collection cycle started
    CycleStart {
        backend: &'static str,
        cycle: u64,
        /// Oldest generation condemned by this cycle
        generation: usize,
    },

    /// Collection cycle completed
    CycleEnd {
        cycle: u64,
        duration_ms: f64,
        copied_bytes: usize,
        reclaimed_bytes: usize,
    },

    /// Chunks kept in place because ambiguous references hit them
    Nailed { cycle: u64, chunks: usize },

    /// Weak references and finalization after tracing
    ReferenceStats {
        cycle: u64,
        weak_splatted: usize,
        finalizers_posted: usize,
    },

    /// Type descriptor liveness sweep
    TypeSweep { freed: usize, kept: usize },

    /// Heap statistics
    HeapStats {
        used_bytes: usize,
        mapped_bytes: usize,
    },

    /// Allocation failure
    AllocationFailure { size: usize, what: &'static str },

    /// Finalizer could not run on its requested thread
    FinalizerFailed { object: usize },
}

impl GcEvent {
    /// Severity of this event
    pub fn level(&self) -> LogLevel {
        match self {
            GcEvent::AllocationFailure { .. } => LogLevel::Error,
            GcEvent::FinalizerFailed { .. } => LogLevel::Warn,
            GcEvent::CycleStart { .. } | GcEvent::CycleEnd { .. } | GcEvent::HeapStats { .. } => {
                LogLevel::Info
            },
            GcEvent::Nailed { .. } | GcEvent::ReferenceStats { .. } | GcEvent::TypeSweep { .. } => {
                LogLevel::Debug
            },
        }
    }
}

/// GC Logger configuration
#[derive(Debug, Clone)]
pub struct GcLoggerConfig {
    /// Minimum log level for console output
    pub level: LogLevel,

    /// Enable console output
    pub console: bool,

    /// Enable JSON format
    pub json: bool,

    /// Enable timestamps
    pub timestamps: bool,

    /// Number of recent events kept in memory
    pub history: usize,
}

impl Default for GcLoggerConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            console: true,
            json: false,
            timestamps: true,
            history: 256,
        }
    }
}

/// GC Logger - centralized logging for collector events
pub struct GcLogger {
    config: GcLoggerConfig,
    events: Mutex<VecDeque<GcEvent>>,
    enabled: AtomicBool,
}

impl GcLogger {
    /// Create new GC logger
    pub fn new(config: GcLoggerConfig) -> Self {
        Self {
            config,
            events: Mutex::new(VecDeque::new()),
            enabled: AtomicBool::new(true),
        }
    }

    /// Logger matching the collector's `verbose` flag
    pub fn for_verbosity(verbose: bool) -> Self {
        let logger = Self::new(GcLoggerConfig::default());
        if !verbose {
            logger.disable();
        }
        logger
    }

    /// Enable console output and event history
    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    /// Disable console output and event history
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    /// Check if logging is enabled
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Log a GC event
    pub fn log(&self, event: GcEvent) {
        let level = event.level();
        log::log!(target: "mgc", level.to_log(), "{:?}", event);

        if !self.is_enabled() || level > self.config.level {
            return;
        }

        if self.config.console {
            self.output_console(&event);
        }

        let mut events = self.events.lock();
        if events.len() == self.config.history {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// Most recent events, oldest first
    pub fn recent(&self) -> Vec<GcEvent> {
        self.events.lock().iter().cloned().collect()
    }

    /// Output to console
    fn output_console(&self, event: &GcEvent) {
        let prefix = if self.config.timestamps {
            format!("[{}] ", chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"))
        } else {
            String::new()
        };

        if self.config.json {
            match serde_json::to_string(event) {
                Ok(json) => println!("{}{}", prefix, json),
                Err(e) => eprintln!("{}[GC] unserializable event: {}", prefix, e),
            }
        } else {
            println!("{}{}", prefix, Self::human(event));
        }
    }

    /// Render in human-readable format
    fn human(event: &GcEvent) -> String {
        match event {
            GcEvent::CycleStart {
                backend,
                cycle,
                generation,
            } => format!(
                "[GC] Cycle {} started ({} backend, generations 0..={})",
                cycle, backend, generation
            ),
            GcEvent::CycleEnd {
                cycle,
                duration_ms,
                copied_bytes,
                reclaimed_bytes,
            } => format!(
                "[GC] Cycle {} completed ({:.2}ms, copied {} bytes, reclaimed {} bytes)",
                cycle, duration_ms, copied_bytes, reclaimed_bytes
            ),
            GcEvent::Nailed { cycle, chunks } => {
                format!("[GC] Cycle {}: {} chunks nailed by ambiguous roots", cycle, chunks)
            },
            GcEvent::ReferenceStats {
                cycle,
                weak_splatted,
                finalizers_posted,
            } => format!(
                "[GC] Cycle {}: {} weak references splatted, {} finalizers posted",
                cycle, weak_splatted, finalizers_posted
            ),
            GcEvent::TypeSweep { freed, kept } => {
                format!("[GC] Type sweep: {} freed, {} still referenced", freed, kept)
            },
            GcEvent::HeapStats {
                used_bytes,
                mapped_bytes,
            } => format!("[GC] Heap: {}/{} bytes in use", used_bytes, mapped_bytes),
            GcEvent::AllocationFailure { size, what } => {
                format!("[GC] Allocation failure: {} bytes ({})", size, what)
            },
            GcEvent::FinalizerFailed { object } => format!(
                "[GC] Failed to execute finalizer for {:#x} even on its owning thread",
                object
            ),
        }
    }
}

impl Default for GcLogger {
    fn default() -> Self {
        Self::new(GcLoggerConfig::default())
    }
}
