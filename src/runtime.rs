// Balance control loop
//
// Initializing -> Running -> Stopping -> Terminated
//
// Every tick: latest board state -> ball rotation -> stability controller ->
// planar saturation -> torque allocation -> motor command + log row.
// A tick with no board state yet is skipped, never fatal.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::BallbotConfig;
use crate::controller::{Setpoint, StabilityController};
use crate::datalog::{DataLogger, LOG_COLUMNS, LogSink};
use crate::kinematics::{KinematicTransform, MotorTorques, TorqueAllocator};
use crate::messages::{MotorCommands, MotorStates};
use crate::scheduler::{Clock, LoopReport, MonotonicClock, SoftRealtimeLoop, Tick};
use crate::shutdown::{LoopKiller, spawn_signal_listener};
use crate::teleop::{YawInput, YawSource, run_yaw_bridge};
use crate::transport::{SerialTransport, Transport, TransportError};

/// Number of steps used to ramp duties to zero on shutdown
const RAMP_STEPS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Initializing,
    Running,
    Stopping,
    Terminated,
}

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("Failed to send initial command: {0}")]
    Init(#[from] TransportError),
}

/// Result of one control tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TickOutcome {
    /// No board state received yet; nothing computed or sent
    NoData,
    Commanded(MotorTorques),
}

pub struct BalanceDriver<T, L, Y, C>
where
    T: Transport,
    L: LogSink,
    Y: YawSource,
    C: Clock + Clone,
{
    config: BallbotConfig,
    transport: T,
    sink: L,
    yaw: Y,
    clock: C,
    killer: Arc<LoopKiller<C>>,
    kinematics: KinematicTransform,
    allocator: TorqueAllocator,
    controller: StabilityController,
    setpoint: Setpoint,
    commands: MotorCommands,
    state: DriverState,
    iteration: u64,
    skipped: u64,
    first_sample_at: Option<std::time::Duration>,
}

impl<T, L, Y, C> BalanceDriver<T, L, Y, C>
where
    T: Transport,
    L: LogSink,
    Y: YawSource,
    C: Clock + Clone,
{
    /// `config` must already be validated
    pub fn new(
        config: BallbotConfig,
        transport: T,
        sink: L,
        yaw: Y,
        clock: C,
        killer: Arc<LoopKiller<C>>,
    ) -> Self {
        Self {
            kinematics: KinematicTransform::from_config(&config),
            allocator: TorqueAllocator::from_config(&config),
            controller: StabilityController::from_config(&config),
            config,
            transport,
            sink,
            yaw,
            clock,
            killer,
            setpoint: Setpoint::default(),
            commands: MotorCommands::default(),
            state: DriverState::Initializing,
            iteration: 0,
            skipped: 0,
            first_sample_at: None,
        }
    }

    pub fn with_setpoint(mut self, setpoint: Setpoint) -> Self {
        self.setpoint = setpoint;
        self
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    /// Last command written to the board
    pub fn commands(&self) -> &MotorCommands {
        &self.commands
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn sink(&self) -> &L {
        &self.sink
    }

    /// Zero the command, let the link settle, then send the zero command
    pub fn initialize(&mut self) -> Result<(), DriverError> {
        self.commands = MotorCommands::default();
        debug!("Waiting {:?} for the link to settle", self.config.settle_delay);
        self.clock.sleep(self.config.settle_delay);

        self.transport.send(&self.commands)?;
        self.state = DriverState::Running;
        info!("Beginning balance loop at {} Hz", self.config.loop_hz);
        Ok(())
    }

    /// Run one control tick
    pub fn step(&mut self, tick: &Tick) -> TickOutcome {
        let Some(states) = self.transport.get_latest::<MotorStates>() else {
            self.skipped += 1;
            if self.skipped == 1 {
                info!("No motor board state yet, waiting");
            }
            return TickOutcome::NoData;
        };

        let now = self.clock.now();
        let first = *self.first_sample_at.get_or_insert(now);
        let t_now = now.saturating_sub(first).as_secs_f64();
        self.iteration += 1;

        let psi = states.encoder_angles();
        let lean = states.lean_angles();
        let phi = self.kinematics.wheel_to_ball(psi);

        let output = self.controller.update(lean, phi, &self.setpoint);
        // Saturate the planar demands before allocation so motor saturation
        // cannot skew the x/y balance
        let planar = output.torque.saturated(self.config.max_planar_duty);
        let tz = self.yaw.yaw_torque();

        let torques = self
            .allocator
            .allocate(planar.tx, planar.ty, tz)
            .scaled(self.killer.fade_level());

        self.commands
            .set_duties(torques.as_array().map(|t| t as f32));
        if let Err(e) = self.transport.send(&self.commands) {
            warn!("Failed to send motor command: {}", e);
        }

        let row = [
            self.iteration as f64,
            t_now,
            lean[0],
            lean[1],
            torques.t1,
            torques.t2,
            torques.t3,
            phi.x,
            phi.y,
            phi.z,
            psi[0],
            psi[1],
            psi[2],
            output.phi_dot_x,
            output.phi_dot_y,
        ];
        if let Err(e) = self.sink.append(&row) {
            warn!("Failed to append log row: {}", e);
        }

        debug!(
            "Tick {} (iteration {}): theta=({:.5}, {:.5}) T=({:.2}, {:.2}, {:.2})",
            tick.index, self.iteration, lean[0], lean[1], torques.t1, torques.t2, torques.t3
        );
        TickOutcome::Commanded(torques)
    }

    /// Persist the log, ramp duties to zero, then send the kill command.
    ///
    /// Every step is best-effort: failures are logged and the rest still runs.
    pub fn shutdown(&mut self) {
        self.state = DriverState::Stopping;
        info!("Stopping: flushing log and resetting motor commands");

        if let Err(e) = self.sink.flush() {
            warn!("Failed to flush log: {}", e);
        }

        let start = self.commands.duties();
        let step_delay = self.config.shutdown_step / RAMP_STEPS;
        for step in 1..=RAMP_STEPS {
            let factor = 1.0 - step as f32 / RAMP_STEPS as f32;
            self.commands.set_duties(start.map(|d| d * factor));
            if let Err(e) = self.transport.send(&self.commands) {
                warn!("Failed to send ramp-down command: {}", e);
            }
            self.clock.sleep(step_delay);
        }

        self.commands = MotorCommands {
            kill: true,
            ..MotorCommands::default()
        };
        if let Err(e) = self.transport.send(&self.commands) {
            warn!("Failed to send kill command: {}", e);
        }
        self.clock.sleep(self.config.shutdown_step);

        self.state = DriverState::Terminated;
        info!(
            "Motors killed after {} control iterations ({} ticks without data)",
            self.iteration, self.skipped
        );
    }

    /// Drive the whole state machine until the killer stops the loop
    pub fn run(mut self) -> Result<LoopReport, DriverError> {
        self.initialize()?;

        // The schedule starts after the settle delay so the first ticks are not overruns
        let mut ticks =
            SoftRealtimeLoop::from_config(&self.config, self.clock.clone(), self.killer.clone());
        for tick in ticks.by_ref() {
            self.step(&tick);
        }
        self.shutdown();

        Ok(ticks.report())
    }
}

/// Everything `run` needs from the command line
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub port: String,
    pub baudrate: u32,
    pub log_path: PathBuf,
    pub config: BallbotConfig,
    /// Subscribe to the zenoh yaw teleop
    pub teleop: bool,
    /// Print loop timing statistics at the end
    pub report: bool,
}

pub async fn run(options: RunOptions) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let RunOptions {
        port,
        baudrate,
        log_path,
        config,
        teleop,
        report,
    } = options;
    config.validate()?;

    let clock = MonotonicClock::new();
    let killer = Arc::new(LoopKiller::new(config.fade_duration(), clock));
    spawn_signal_listener(killer.clone())?;

    let yaw = Arc::new(YawInput::new(config.yaw_timeout, clock));
    if teleop {
        let input = yaw.clone();
        tokio::spawn(async move {
            if let Err(e) = run_yaw_bridge(input).await {
                warn!("Yaw teleop bridge stopped: {}", e);
            }
        });
    }

    let transport = SerialTransport::open(&port, baudrate)?;
    let sink = DataLogger::create(&log_path, &LOG_COLUMNS)?;

    info!(
        "Runtime started: {}Hz loop, max planar duty {}, fade {}s",
        config.loop_hz, config.max_planar_duty, config.fade_time
    );

    let driver = BalanceDriver::new(config, transport, sink, yaw, clock, killer);
    // The control loop blocks its thread for its whole life
    let loop_report = tokio::task::spawn_blocking(move || driver.run()).await??;

    if report {
        info!("Loop timing: {}", loop_report);
    } else {
        debug!("Loop timing: {}", loop_report);
    }
    info!("Soft realtime loop has ended successfully.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AxisGains;
    use crate::messages::Record;
    use crate::scheduler::SimClock;
    use crate::transport::TopicTable;
    use std::io;
    use std::time::Duration;

    #[derive(Default)]
    struct MockTransport {
        board: TopicTable,
        sent: Vec<MotorCommands>,
        fail_sends: bool,
    }

    impl MockTransport {
        fn new() -> Self {
            Self {
                board: TopicTable::motor_board(),
                ..Default::default()
            }
        }

        fn publish(&self, states: MotorStates) {
            self.board.store(MotorStates::TOPIC, states.encode());
        }
    }

    impl Transport for MockTransport {
        fn send<R: Record>(&mut self, record: &R) -> Result<(), TransportError> {
            if self.fail_sends {
                return Err(TransportError::Io(io::Error::other("link down")));
            }
            self.sent.push(MotorCommands::decode(&record.encode())?);
            Ok(())
        }

        fn get_latest<R: Record>(&self) -> Option<R> {
            self.board.latest_record()
        }
    }

    #[derive(Default)]
    struct MemorySink {
        rows: Vec<Vec<f64>>,
        flushes: usize,
        // Request a stop once this many rows are logged
        stop_after: Option<(usize, Arc<LoopKiller<SimClock>>)>,
    }

    impl LogSink for MemorySink {
        fn append(&mut self, row: &[f64]) -> io::Result<()> {
            self.rows.push(row.to_vec());
            if let Some((limit, killer)) = &self.stop_after {
                if self.rows.len() >= *limit {
                    killer.request_stop();
                }
            }
            Ok(())
        }

        fn flush(&mut self) -> io::Result<()> {
            self.flushes += 1;
            Ok(())
        }
    }

    type TestDriver = BalanceDriver<MockTransport, MemorySink, f64, SimClock>;

    fn driver_with(config: BallbotConfig, fade: Duration) -> (SimClock, TestDriver) {
        let clock = SimClock::new();
        let killer = Arc::new(LoopKiller::new(fade, clock.clone()));
        let driver = BalanceDriver::new(
            config,
            MockTransport::new(),
            MemorySink::default(),
            0.0,
            clock.clone(),
            killer,
        );
        (clock, driver)
    }

    fn tick(index: u64) -> Tick {
        Tick {
            index,
            deadline: Duration::from_millis(5) * index as u32,
            elapsed: Duration::from_millis(5) * index as u32,
        }
    }

    fn torques_of(outcome: TickOutcome) -> MotorTorques {
        match outcome {
            TickOutcome::Commanded(t) => t,
            TickOutcome::NoData => panic!("expected a command"),
        }
    }

    #[test]
    fn test_initialize_settles_then_sends_zero_command() {
        let (clock, mut driver) = driver_with(BallbotConfig::default(), Duration::ZERO);
        assert_eq!(driver.state(), DriverState::Initializing);

        driver.initialize().unwrap();
        assert_eq!(clock.now(), Duration::from_secs(1));
        assert_eq!(driver.state(), DriverState::Running);
        assert_eq!(driver.transport().sent, vec![MotorCommands::default()]);
    }

    #[test]
    fn test_initialize_fails_fast_on_dead_link() {
        let (_clock, mut driver) = driver_with(BallbotConfig::default(), Duration::ZERO);
        driver.transport.fail_sends = true;
        assert!(matches!(driver.initialize(), Err(DriverError::Init(_))));
        assert_eq!(driver.state(), DriverState::Initializing);
    }

    #[test]
    fn test_tick_without_data_is_skipped() {
        let (_clock, mut driver) = driver_with(BallbotConfig::default(), Duration::ZERO);
        driver.initialize().unwrap();

        assert_eq!(driver.step(&tick(1)), TickOutcome::NoData);
        assert_eq!(driver.step(&tick(2)), TickOutcome::NoData);
        assert_eq!(driver.transport().sent.len(), 1);
        assert!(driver.sink().rows.is_empty());
        assert_eq!(driver.state(), DriverState::Running);

        driver.transport().publish(MotorStates::default());
        assert!(matches!(driver.step(&tick(3)), TickOutcome::Commanded(_)));
    }

    #[test]
    fn test_at_rest_all_torques_zero() {
        let (_clock, mut driver) = driver_with(BallbotConfig::default(), Duration::ZERO);
        driver.initialize().unwrap();
        driver.transport().publish(MotorStates::default());

        for i in 1..=3 {
            let torques = torques_of(driver.step(&tick(i)));
            assert_eq!(torques.as_array(), [0.0, 0.0, 0.0]);
        }
        let last = driver.transport().sent.last().unwrap();
        assert_eq!(last.duties(), [0.0, 0.0, 0.0]);
        assert!(!last.kill);
    }

    #[test]
    fn test_lean_error_drives_motors_two_and_three() {
        let zero = AxisGains {
            kp_theta: 0.0,
            kd_theta: 0.0,
            kp_phi_dot: 0.0,
        };
        let config = BallbotConfig {
            gains_x: AxisGains {
                kp_theta: 8.0,
                ..zero
            },
            gains_y: zero,
            ..Default::default()
        };
        let (_clock, mut driver) = driver_with(config, Duration::ZERO);
        driver.initialize().unwrap();
        driver.transport().publish(MotorStates {
            theta_roll: -0.1,
            ..Default::default()
        });

        let torques = torques_of(driver.step(&tick(1)));
        // Tx = 0.8 after saturation, Ty = Tz = 0
        let expected = TorqueAllocator::new(45f64.to_radians()).allocate(0.8, 0.0, 0.0);
        assert!(torques.t1.abs() < 1e-12);
        assert!((torques.t2 - expected.t2).abs() < 1e-12);
        assert!((torques.t3 - expected.t3).abs() < 1e-12);
        assert!(torques.t3 > 0.0 && torques.t2 < 0.0);

        let row = &driver.sink().rows[0];
        assert_eq!(row.len(), LOG_COLUMNS.len());
        assert_eq!(row[0], 1.0);
        assert!((row[2] + 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_planar_saturation_happens_before_allocation() {
        let (_clock, mut driver) = driver_with(BallbotConfig::default(), Duration::ZERO);
        driver.initialize().unwrap();
        // Huge lean on both axes: each planar torque clips to the limit
        driver.transport().publish(MotorStates {
            theta_roll: -1.0,
            theta_pitch: 1.0,
            ..Default::default()
        });
        let torques = torques_of(driver.step(&tick(1)));
        let expected = TorqueAllocator::new(45f64.to_radians()).allocate(0.8, -0.8, 0.0);
        for (got, want) in torques.as_array().iter().zip(expected.as_array()) {
            assert!((got - want).abs() < 1e-12);
        }
    }

    #[test]
    fn test_fade_scales_output() {
        let zero = AxisGains {
            kp_theta: 0.0,
            kd_theta: 0.0,
            kp_phi_dot: 0.0,
        };
        let config = BallbotConfig {
            gains_x: AxisGains {
                kp_theta: 4.0,
                ..zero
            },
            gains_y: zero,
            ..Default::default()
        };
        let (clock, mut driver) = driver_with(config, Duration::from_millis(20));
        driver.initialize().unwrap();
        driver.transport().publish(MotorStates {
            theta_roll: -0.1,
            ..Default::default()
        });

        let full = torques_of(driver.step(&tick(1)));
        driver.killer.request_stop();
        clock.advance(Duration::from_millis(10));
        let faded = torques_of(driver.step(&tick(2)));
        assert!((faded.t3 - full.t3 / 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_send_failures_do_not_stop_the_loop() {
        let (_clock, mut driver) = driver_with(BallbotConfig::default(), Duration::ZERO);
        driver.initialize().unwrap();
        driver.transport().publish(MotorStates::default());
        driver.transport.fail_sends = true;

        assert!(matches!(driver.step(&tick(1)), TickOutcome::Commanded(_)));
        assert!(matches!(driver.step(&tick(2)), TickOutcome::Commanded(_)));
        assert_eq!(driver.sink().rows.len(), 2);

        driver.shutdown();
        assert_eq!(driver.state(), DriverState::Terminated);
        assert_eq!(driver.sink().flushes, 1);
    }

    #[test]
    fn test_shutdown_ramps_then_kills() {
        let (clock, mut driver) = driver_with(BallbotConfig::default(), Duration::ZERO);
        driver.initialize().unwrap();
        driver.transport().publish(MotorStates {
            theta_roll: -0.05,
            ..Default::default()
        });
        driver.step(&tick(1));
        let before = driver.commands().duties();
        let sent_before = driver.transport().sent.len();
        let t0 = clock.now();

        driver.shutdown();
        assert_eq!(driver.state(), DriverState::Terminated);
        assert_eq!(driver.sink().flushes, 1);

        let shutdown_cmds = &driver.transport().sent[sent_before..];
        assert_eq!(shutdown_cmds.len(), RAMP_STEPS as usize + 1);

        // Ramp: magnitudes shrink step by step and end at zero, without the kill flag
        let mut last = before[2].abs();
        for cmd in &shutdown_cmds[..RAMP_STEPS as usize] {
            assert!(!cmd.kill);
            assert!(cmd.motor_3_duty.abs() < last);
            last = cmd.motor_3_duty.abs();
        }
        assert_eq!(last, 0.0);

        let kill = shutdown_cmds.last().unwrap();
        assert!(kill.kill);
        assert_eq!(kill.duties(), [0.0, 0.0, 0.0]);
        assert_eq!(clock.now() - t0, Duration::from_millis(500));
    }

    #[test]
    fn test_run_until_stopped() {
        let clock = SimClock::new();
        let killer = Arc::new(LoopKiller::new(Duration::ZERO, clock.clone()));
        let transport = MockTransport::new();
        transport.publish(MotorStates::default());
        let sink = MemorySink {
            stop_after: Some((10, killer.clone())),
            ..Default::default()
        };
        let driver = BalanceDriver::new(
            BallbotConfig::default(),
            transport,
            sink,
            0.0,
            clock.clone(),
            killer,
        );

        let report = driver.run().unwrap();
        assert_eq!(report.ticks, 10);
        // Settle (1s) + 10 ticks (50ms) + shutdown (0.25s ramp + 0.25s hold)
        assert!(clock.now() >= Duration::from_millis(1550));
    }
}
