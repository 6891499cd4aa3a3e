// Auxiliary yaw-torque input
//
// The yaw demand comes from a human teleop over zenoh. The control loop only
// ever reads the last value; a watchdog zeroes it once it goes stale so a
// crashed teleop cannot leave the robot spinning.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::interval;
use tracing::{info, warn};

use crate::config::{TOPIC_CMD_YAW, TOPIC_HEALTH};
use crate::messages::{RuntimeHealth, YawCommand};
use crate::scheduler::{Clock, MonotonicClock};

// Rate at which pending teleop samples are drained and health is published
const BRIDGE_HZ: u64 = 50;

const NEVER: u64 = u64::MAX;

/// Non-blocking source of the auxiliary yaw torque
pub trait YawSource {
    fn yaw_torque(&self) -> f64;
}

/// Fixed yaw demand (0.0 when no teleop is attached)
impl YawSource for f64 {
    fn yaw_torque(&self) -> f64 {
        *self
    }
}

impl<T: YawSource + ?Sized> YawSource for Arc<T> {
    fn yaw_torque(&self) -> f64 {
        (**self).yaw_torque()
    }
}

/// Last received yaw demand plus its arrival time, updated lock-free
#[derive(Debug)]
pub struct YawInput<C: Clock = MonotonicClock> {
    clock: C,
    timeout: Duration,
    tz_bits: AtomicU32,
    received_at_ns: AtomicU64,
}

impl<C: Clock> YawInput<C> {
    pub fn new(timeout: Duration, clock: C) -> Self {
        Self {
            clock,
            timeout,
            tz_bits: AtomicU32::new(0.0f32.to_bits()),
            received_at_ns: AtomicU64::new(NEVER),
        }
    }

    /// Process incoming command
    pub fn on_command(&self, cmd: YawCommand) {
        self.tz_bits.store(cmd.tz.to_bits(), Ordering::Relaxed);
        self.received_at_ns
            .store(self.clock.now().as_nanos() as u64, Ordering::Release);
    }

    pub fn health(&self) -> RuntimeHealth {
        let received = self.received_at_ns.load(Ordering::Acquire);
        if received == NEVER {
            // No command ever received
            return RuntimeHealth::CmdStale;
        }
        let age = self.clock.now().saturating_sub(Duration::from_nanos(received));
        if age > self.timeout {
            RuntimeHealth::CmdStale
        } else {
            RuntimeHealth::Ok
        }
    }
}

impl<C: Clock> YawSource for YawInput<C> {
    fn yaw_torque(&self) -> f64 {
        match self.health() {
            RuntimeHealth::Ok => f32::from_bits(self.tz_bits.load(Ordering::Relaxed)) as f64,
            RuntimeHealth::CmdStale => 0.0,
        }
    }
}

/// Subscribe to teleop yaw commands and publish input health.
///
/// Runs until the zenoh session fails.
pub async fn run_yaw_bridge<C: Clock>(
    input: Arc<YawInput<C>>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;

    let subscriber = session.declare_subscriber(TOPIC_CMD_YAW).await?;
    let pub_health = session.declare_publisher(TOPIC_HEALTH).await?;
    info!("Subscribed to: {}", TOPIC_CMD_YAW);
    info!("Publishing to: {}", TOPIC_HEALTH);

    let mut tick = interval(Duration::from_millis(1000 / BRIDGE_HZ));
    let mut last_health = input.health();

    loop {
        tick.tick().await;

        // 1. Drain all pending commands (non-blocking), keep latest
        while let Ok(Some(sample)) = subscriber.try_recv() {
            let payload = sample.payload().to_bytes();
            match serde_json::from_slice::<YawCommand>(&payload) {
                Ok(cmd) => input.on_command(cmd),
                Err(e) => warn!("Failed to parse yaw command: {}", e),
            }
        }

        // 2. Publish health, noting watchdog transitions
        let health = input.health();
        if health != last_health {
            match health {
                RuntimeHealth::Ok => info!("Yaw teleop connected"),
                RuntimeHealth::CmdStale => warn!("Yaw command stale, holding yaw torque at zero"),
            }
            last_health = health;
        }
        let health_json = serde_json::to_string(&health)?;
        pub_health.put(health_json).await?;
    }
}
