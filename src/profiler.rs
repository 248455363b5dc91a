use std::{
    collections::{BTreeMap, HashMap},
    fmt::Write,
    time::{Duration, Instant},
};

use log::{trace, warn};
use parking_lot::Mutex;

/// Records how long named actions take.
pub trait Profiler: Send + Sync {
    /// Marks the start of `action`.
    fn start(&self, action: &str);

    /// Marks the end of `action`.
    fn stop(&self, action: &str);

    /// A human-readable report of everything recorded so far.
    fn summary(&self) -> String;
}

impl<'p> dyn Profiler + 'p {
    /// Starts `action` and returns a guard that stops it when dropped.
    pub fn profile<'a>(&'a self, action: &'a str) -> ProfileScope<'a> {
        self.start(action);
        ProfileScope {
            profiler: self,
            action,
        }
    }
}

/// Stops its action on drop, including when the profiled code returns early with an error.
#[must_use = "the action stops as soon as the scope is dropped"]
pub struct ProfileScope<'a> {
    profiler: &'a dyn Profiler,
    action: &'a str,
}

impl Drop for ProfileScope<'_> {
    fn drop(&mut self) {
        self.profiler.stop(self.action);
    }
}

/// A profiler that records nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThroughProfiler;

impl Profiler for PassThroughProfiler {
    fn start(&self, _action: &str) {}

    fn stop(&self, _action: &str) {}

    fn summary(&self) -> String {
        String::new()
    }
}

/// Timing statistics for one action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionStats {
    pub calls: usize,
    pub total: Duration,
    pub min: Duration,
    pub max: Duration,
}

impl ActionStats {
    fn new(elapsed: Duration) -> Self {
        Self {
            calls: 1,
            total: elapsed,
            min: elapsed,
            max: elapsed,
        }
    }

    fn record(&mut self, elapsed: Duration) {
        self.calls += 1;
        self.total += elapsed;
        self.min = self.min.min(elapsed);
        self.max = self.max.max(elapsed);
    }

    pub fn mean(&self) -> Duration {
        self.total / self.calls as u32
    }
}

/// Measures the wall-clock duration of every action.
#[derive(Debug, Default)]
pub struct SimpleProfiler {
    running: Mutex<HashMap<String, Instant>>,
    recorded: Mutex<BTreeMap<String, ActionStats>>,
}

impl SimpleProfiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Statistics for `action`, if it completed at least once.
    pub fn stats(&self, action: &str) -> Option<ActionStats> {
        self.recorded.lock().get(action).copied()
    }

    /// How many times `action` completed.
    pub fn calls(&self, action: &str) -> usize {
        self.stats(action).map_or(0, |s| s.calls)
    }

    /// Names of every completed action, sorted.
    pub fn actions(&self) -> Vec<String> {
        self.recorded.lock().keys().cloned().collect()
    }
}

impl Profiler for SimpleProfiler {
    fn start(&self, action: &str) {
        trace!("profiler start: {action}");

        let mut running = self.running.lock();
        if running.insert(action.to_string(), Instant::now()).is_some() {
            warn!("profiler action `{action}` started twice, restarting its timer");
        }
    }

    fn stop(&self, action: &str) {
        let Some(started) = self.running.lock().remove(action) else {
            warn!("profiler action `{action}` stopped without being started");
            return;
        };

        let elapsed = started.elapsed();
        trace!("profiler stop: {action} after {elapsed:?}");

        self.recorded
            .lock()
            .entry(action.to_string())
            .and_modify(|s| s.record(elapsed))
            .or_insert_with(|| ActionStats::new(elapsed));
    }

    fn summary(&self) -> String {
        let recorded = self.recorded.lock();
        let mut out = String::from("Profiler Report\n\n");

        let _ = writeln!(
            out,
            "{:<32} | {:>18} | {:>9} | {:>14}",
            "Action", "Mean duration (s)", "Num calls", "Total time (s)"
        );
        out.push_str(&"-".repeat(82));
        out.push('\n');

        for (action, stats) in recorded.iter() {
            let _ = writeln!(
                out,
                "{:<32} | {:>18.6} | {:>9} | {:>14.6}",
                action,
                stats.mean().as_secs_f64(),
                stats.calls,
                stats.total.as_secs_f64()
            );
        }

        out
    }
}
