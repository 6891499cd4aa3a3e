// Cancellation signal for the control loop
//
// Tri-state: running -> fading -> stopped (or running -> stopped when there is
// no fade). All state lives in atomics so a stop can be requested from a
// signal context without blocking.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

use tracing::{info, warn};

use crate::scheduler::{Clock, MonotonicClock};

const RUNNING: u8 = 0;
const FADING: u8 = 1;
const STOPPED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancellationState {
    Running,
    Fading,
    Stopped,
}

/// Stop flag shared between the control loop and the signal listener
#[derive(Debug)]
pub struct LoopKiller<C: Clock = MonotonicClock> {
    clock: C,
    fade_time: Duration,
    state: AtomicU8,
    // Clock time the fade began, only meaningful once state is FADING
    fade_started_ns: AtomicU64,
}

impl<C: Clock> LoopKiller<C> {
    pub fn new(fade_time: Duration, clock: C) -> Self {
        Self {
            clock,
            fade_time,
            state: AtomicU8::new(RUNNING),
            fade_started_ns: AtomicU64::new(0),
        }
    }

    pub fn fade_time(&self) -> Duration {
        self.fade_time
    }

    /// Request the loop to stop.
    ///
    /// The first request starts the fade (or stops immediately when there is
    /// no fade); a request while fading stops immediately.
    pub fn request_stop(&self) {
        loop {
            match self.state.load(Ordering::Acquire) {
                RUNNING => {
                    let next = if self.fade_time.is_zero() {
                        STOPPED
                    } else {
                        // Published by the Release half of the exchange below
                        let now = self.clock.now().as_nanos() as u64;
                        self.fade_started_ns.store(now, Ordering::Relaxed);
                        FADING
                    };
                    if self
                        .state
                        .compare_exchange(RUNNING, next, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return;
                    }
                }
                FADING => {
                    self.state.store(STOPPED, Ordering::Release);
                    return;
                }
                _ => return,
            }
        }
    }

    /// True once stopped, or once the fade has run longer than `fade_time`
    pub fn is_stopped(&self) -> bool {
        match self.state.load(Ordering::Acquire) {
            STOPPED => true,
            FADING => {
                if self.fade_elapsed() > self.fade_time {
                    // Losing this race only means someone else already stopped us
                    let _ = self.state.compare_exchange(
                        FADING,
                        STOPPED,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                    true
                } else {
                    false
                }
            }
            _ => false,
        }
    }

    /// Output scale in [0, 1]: 1.0 while running, linear ramp to 0.0 over the fade
    pub fn fade_level(&self) -> f64 {
        match self.state() {
            CancellationState::Running => 1.0,
            CancellationState::Stopped => 0.0,
            CancellationState::Fading => {
                let fraction =
                    self.fade_elapsed().as_secs_f64() / self.fade_time.as_secs_f64();
                (1.0 - fraction).clamp(0.0, 1.0)
            }
        }
    }

    pub fn state(&self) -> CancellationState {
        if self.is_stopped() {
            return CancellationState::Stopped;
        }
        match self.state.load(Ordering::Acquire) {
            RUNNING => CancellationState::Running,
            FADING => CancellationState::Fading,
            _ => CancellationState::Stopped,
        }
    }

    fn fade_elapsed(&self) -> Duration {
        let started = Duration::from_nanos(self.fade_started_ns.load(Ordering::Relaxed));
        self.clock.now().saturating_sub(started)
    }
}

/// Listen for SIGTERM, SIGINT and SIGHUP and forward each one to the killer.
///
/// Must be called from within a tokio runtime.
#[cfg(unix)]
pub fn spawn_signal_listener<C: Clock + 'static>(
    killer: Arc<LoopKiller<C>>,
) -> std::io::Result<tokio::task::JoinHandle<()>> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sighup = signal(SignalKind::hangup())?;

    Ok(tokio::spawn(async move {
        loop {
            let name = tokio::select! {
                _ = sigterm.recv() => "SIGTERM",
                _ = sigint.recv() => "SIGINT",
                _ = sighup.recv() => "SIGHUP",
            };
            on_signal(&killer, name);
        }
    }))
}

#[cfg(not(unix))]
pub fn spawn_signal_listener<C: Clock + 'static>(
    killer: Arc<LoopKiller<C>>,
) -> std::io::Result<tokio::task::JoinHandle<()>> {
    Ok(tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            on_signal(&killer, "Ctrl-C");
        }
    }))
}

fn on_signal<C: Clock>(killer: &LoopKiller<C>, name: &str) {
    let before = killer.state();
    killer.request_stop();
    match (before, killer.state()) {
        (CancellationState::Running, CancellationState::Fading) => info!(
            "{} received, fading out over {:?} (send again to stop now)",
            name,
            killer.fade_time()
        ),
        (CancellationState::Fading, _) => warn!("{} received during fade, stopping now", name),
        _ => info!("{} received, stopping", name),
    }
}
