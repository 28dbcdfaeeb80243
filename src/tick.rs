//! Fixed-tempo event loop and cooperative periodic scheduler.
//!
//! The loop invokes registered tick callbacks in registration order, then
//! sleeps out the remainder of the tick period. Callbacks that fail are
//! logged and swallowed; a tick is never skipped or batched, even after an
//! overrun.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::Result;
use log::{error, warn};

use crate::error::CoreError;

/// Window of recent ticks inspected for overrun accounting.
const OVERRUN_WINDOW: usize = 150;

/// Fraction of the window that may overrun before we complain.
const OVERRUN_WARN_FRACTION: f64 = 0.05;

/// Minimum spacing of overrun warnings.
const OVERRUN_WARN_INTERVAL: Duration = Duration::from_secs(5);

type Callback<C> = Box<dyn FnMut(&mut C, Instant) -> Result<()>>;

/// Drives registered callbacks at a fixed tempo against a caller-owned
/// context.
pub struct TickLoop<C> {
    period: Duration,
    callbacks: Vec<(String, Callback<C>)>,
    recent_overruns: VecDeque<bool>,
    tick_count: u64,
    last_overrun_warning: Option<Instant>,
}

impl<C> TickLoop<C> {
    pub fn new(frequency_hz: f64) -> Self {
        Self {
            period: Duration::from_secs_f64(1.0 / frequency_hz),
            callbacks: Vec::new(),
            recent_overruns: VecDeque::with_capacity(OVERRUN_WINDOW),
            tick_count: 0,
            last_overrun_warning: None,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    /// Register a callback; callbacks run in registration order each tick.
    pub fn register(
        &mut self,
        name: &str,
        callback: impl FnMut(&mut C, Instant) -> Result<()> + 'static,
    ) {
        self.callbacks.push((name.to_string(), Box::new(callback)));
    }

    /// Run one tick: invoke every callback, then account for overrun.
    /// Returns how long the tick took.
    pub fn tick(&mut self, ctx: &mut C) -> Duration {
        let started = Instant::now();
        for (name, callback) in &mut self.callbacks {
            if let Err(err) = callback(ctx, started) {
                // A tick must never take the loop down.
                error!("tick callback '{name}' failed: {err:#}");
            }
        }
        let elapsed = started.elapsed();
        self.tick_count += 1;
        self.record_overrun(elapsed > self.period, started + elapsed);
        elapsed
    }

    /// Run until the shutdown flag is raised.
    pub fn run(&mut self, ctx: &mut C, shutdown: &Arc<AtomicBool>) {
        while !shutdown.load(Ordering::Relaxed) {
            let elapsed = self.tick(ctx);
            std::thread::sleep(self.period.saturating_sub(elapsed));
        }
    }

    fn record_overrun(&mut self, overran: bool, now: Instant) {
        if self.recent_overruns.len() == OVERRUN_WINDOW {
            self.recent_overruns.pop_front();
        }
        self.recent_overruns.push_back(overran);

        let overruns = self.recent_overruns.iter().filter(|o| **o).count();
        let window = self.recent_overruns.len();
        if window < OVERRUN_WINDOW / 2 {
            return;
        }
        if (overruns as f64) / (window as f64) <= OVERRUN_WARN_FRACTION {
            return;
        }
        let due = self
            .last_overrun_warning
            .map(|last| now.duration_since(last) >= OVERRUN_WARN_INTERVAL)
            .unwrap_or(true);
        if due {
            self.last_overrun_warning = Some(now);
            warn!(
                "{}",
                CoreError::TickOverrun {
                    budget_ms: self.period.as_millis() as u64,
                    overruns,
                    window,
                }
            );
        }
    }
}

/// A named periodic job.
struct Job {
    name: String,
    interval: Duration,
    last_run: Option<Instant>,
}

/// Holds periodic jobs keyed by name. Each tick, `due` advances and returns
/// the jobs whose interval has elapsed, at most once per job per tick. Jobs
/// execute inside the tick context and must be non-blocking.
#[derive(Default)]
pub struct Scheduler {
    jobs: Vec<Job>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job; replaces any existing job with the same name.
    pub fn schedule(&mut self, name: &str, interval: Duration) {
        self.jobs.retain(|job| job.name != name);
        self.jobs.push(Job {
            name: name.to_string(),
            interval,
            last_run: None,
        });
    }

    pub fn unschedule(&mut self, name: &str) {
        self.jobs.retain(|job| job.name != name);
    }

    /// Names of jobs due at `now`, marking each as run.
    pub fn due(&mut self, now: Instant) -> Vec<String> {
        let mut due = Vec::new();
        for job in &mut self.jobs {
            let ready = job
                .last_run
                .map(|last| now.duration_since(last) >= job.interval)
                .unwrap_or(true);
            if ready {
                job.last_run = Some(now);
                due.push(job.name.clone());
            }
        }
        due
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }
}
