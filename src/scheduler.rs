// Soft real-time periodic loop
//
// Deadlines form an exact arithmetic sequence from the loop start
// (start + n * dt), independent of how long the loop body takes.
// Waiting is two-phase: short sleeps until within the precision window,
// then a busy-poll to the deadline. The cancellation signal is checked
// between every sleep increment and every spin.

use std::fmt;
use std::iter::FusedIterator;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing::warn;

use crate::config::BallbotConfig;
use crate::shutdown::LoopKiller;

/// Monotonic time source used by the loop, the killer and the driver
pub trait Clock: Send + Sync {
    /// Time elapsed since the clock's origin
    fn now(&self) -> Duration;

    fn sleep(&self, duration: Duration);

    /// One iteration of a busy-wait
    fn spin(&self) {
        std::hint::spin_loop();
    }
}

/// Wall-clock implementation backed by `Instant`
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Simulated time: only moves when slept on, spun on, or advanced.
///
/// Clones share the same timeline.
#[derive(Debug, Clone, Default)]
pub struct SimClock {
    now_ns: Arc<AtomicU64>,
}

impl SimClock {
    const SPIN_STEP: Duration = Duration::from_micros(1);

    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, duration: Duration) {
        self.now_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::SeqCst);
    }
}

impl Clock for SimClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.now_ns.load(Ordering::SeqCst))
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }

    fn spin(&self) {
        self.advance(Self::SPIN_STEP);
    }
}

const OVERRUN_LOG_EVERY: u64 = 1000;

/// One tick of the loop
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tick {
    /// 1-based tick number
    pub index: u64,
    /// Nominal deadline, relative to the loop start (always index * dt)
    pub deadline: Duration,
    /// Actual wake time, relative to the loop start
    pub elapsed: Duration,
}

/// Running timing-error accumulators (diagnostics only)
#[derive(Debug, Clone, Default)]
pub struct LoopStats {
    pub samples: u64,
    pub sum_err: f64,
    pub sum_sq_err: f64,
    pub sleep_time: Duration,
    /// Ticks that woke more than a full period late
    pub overruns: u64,
}

impl LoopStats {
    fn record(&mut self, error: Duration) {
        let err = error.as_secs_f64();
        self.samples += 1;
        self.sum_err += err;
        self.sum_sq_err += err * err;
    }

    pub fn mean_error(&self) -> Option<f64> {
        (self.samples > 0).then(|| self.sum_err / self.samples as f64)
    }

    /// Sample standard deviation; needs at least two samples
    pub fn stddev_error(&self) -> Option<f64> {
        if self.samples < 2 {
            return None;
        }
        let n = self.samples as f64;
        let var = (self.sum_sq_err - self.sum_err * self.sum_err / n) / (n - 1.0);
        // Rounding can push a near-zero variance slightly negative
        Some(var.max(0.0).sqrt())
    }
}

/// Summary printed at the end of a run
#[derive(Debug, Clone, PartialEq)]
pub struct LoopReport {
    pub ticks: u64,
    pub overruns: u64,
    pub frequency_hz: f64,
    pub mean_error: Option<f64>,
    pub stddev_error: Option<f64>,
    pub sleep_fraction: Option<f64>,
}

impl fmt::Display for LoopReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} cycles at {:.2} Hz", self.ticks, self.frequency_hz)?;
        if self.overruns > 0 {
            write!(f, " ({} overruns)", self.overruns)?;
        }
        match self.mean_error {
            Some(mean) => write!(f, ", avg error {:.3} ms", mean * 1e3)?,
            None => write!(f, ", avg error n/a")?,
        }
        match self.stddev_error {
            Some(std) => write!(f, ", stddev error {:.3} ms", std * 1e3)?,
            None => write!(f, ", stddev error n/a")?,
        }
        if let Some(fraction) = self.sleep_fraction {
            write!(f, ", {:.1}% of time sleeping", fraction * 100.0)?;
        }
        Ok(())
    }
}

/// Finite, non-restartable sequence of ticks spaced `dt` apart.
///
/// The sequence ends the first time the killer reports stopped at any
/// polling point.
pub struct SoftRealtimeLoop<C: Clock> {
    clock: C,
    killer: Arc<LoopKiller<C>>,
    dt: Duration,
    precision: Duration,
    poll_interval: Duration,
    start: Duration,
    // Offset of the next deadline from `start`
    target: Duration,
    index: u64,
    stats: LoopStats,
    finished: bool,
}

impl<C: Clock> SoftRealtimeLoop<C> {
    /// Start a loop at the current clock time; the first tick fires at start + dt
    pub fn new(
        clock: C,
        killer: Arc<LoopKiller<C>>,
        dt: Duration,
        precision: Duration,
        poll_interval: Duration,
    ) -> Self {
        let start = clock.now();
        Self {
            clock,
            killer,
            dt,
            precision,
            poll_interval,
            start,
            target: dt,
            index: 0,
            stats: LoopStats::default(),
            finished: false,
        }
    }

    pub fn from_config(config: &BallbotConfig, clock: C, killer: Arc<LoopKiller<C>>) -> Self {
        Self::new(
            clock,
            killer,
            config.dt(),
            config.sleep_precision,
            config.poll_interval,
        )
    }

    pub fn dt(&self) -> Duration {
        self.dt
    }

    pub fn stats(&self) -> &LoopStats {
        &self.stats
    }

    /// Time since the loop started
    pub fn time(&self) -> Duration {
        self.clock.now().saturating_sub(self.start)
    }

    pub fn report(&self) -> LoopReport {
        let runtime = self.time();
        LoopReport {
            ticks: self.index,
            overruns: self.stats.overruns,
            frequency_hz: 1.0 / self.dt.as_secs_f64(),
            mean_error: self.stats.mean_error(),
            stddev_error: self.stats.stddev_error(),
            sleep_fraction: (!runtime.is_zero())
                .then(|| self.stats.sleep_time.as_secs_f64() / runtime.as_secs_f64()),
        }
    }

    fn on_overrun(&mut self, late: Duration) {
        self.stats.overruns += 1;
        // First overrun, then every OVERRUN_LOG_EVERY after that
        if self.stats.overruns == 1 || self.stats.overruns % OVERRUN_LOG_EVERY == 0 {
            warn!(
                "Loop overrun at tick {}: woke {:?} late (period {:?}, {} overruns so far)",
                self.index, late, self.dt, self.stats.overruns
            );
        }
    }

    /// Block until `deadline`; returns false if cancelled while waiting
    fn wait_until(&mut self, deadline: Duration) -> bool {
        // Phase 1: sleep in increments until within the precision window
        loop {
            if self.killer.is_stopped() {
                return false;
            }
            let now = self.clock.now();
            if now + self.precision * 2 >= deadline {
                break;
            }
            let chunk = (deadline - now - self.precision).min(self.poll_interval);
            self.clock.sleep(chunk);
            self.stats.sleep_time += self.clock.now().saturating_sub(now);
        }

        // Phase 2: busy-poll the remaining window
        while self.clock.now() < deadline {
            if self.killer.is_stopped() {
                return false;
            }
            self.clock.spin();
        }

        !self.killer.is_stopped()
    }
}

impl<C: Clock> Iterator for SoftRealtimeLoop<C> {
    type Item = Tick;

    fn next(&mut self) -> Option<Tick> {
        if self.finished {
            return None;
        }

        let deadline = self.start + self.target;
        if !self.wait_until(deadline) {
            self.finished = true;
            return None;
        }

        let now = self.clock.now();
        self.index += 1;
        // The first tick only initializes the loop; there is no prior target to measure against
        if self.index > 1 {
            let late = now.saturating_sub(deadline);
            self.stats.record(late);
            if late > self.dt {
                self.on_overrun(late);
            }
        }

        let tick = Tick {
            index: self.index,
            deadline: self.target,
            elapsed: now.saturating_sub(self.start),
        };
        self.target += self.dt;
        Some(tick)
    }
}

impl<C: Clock> FusedIterator for SoftRealtimeLoop<C> {}
