// Keyboard yaw teleop: Z/X spin, R/F torque level, Q quit
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode},
};
use std::time::{Duration, Instant};
use tracing::info;

use ballbot_runtime::config::TOPIC_CMD_YAW;
use ballbot_runtime::messages::YawCommand;

const YAW_TORQUES: [f32; 3] = [0.1, 0.25, 0.5]; // normalized duty
const INPUT_TIMEOUT_MS: u64 = 100; // Reset yaw demand after this much time with no input

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;
    let publisher = session.declare_publisher(TOPIC_CMD_YAW).await?;

    info!("Controls: Z/X=spin, R/F=torque level, Q=quit");
    info!("Level: LOW");

    enable_raw_mode()?;
    let result = run_teleop(&publisher).await;
    disable_raw_mode()?;

    result
}

async fn run_teleop(
    publisher: &zenoh::pubsub::Publisher<'_>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut level_idx: usize = 0;
    let mut tz = 0.0f32;
    let mut last_input = Instant::now();

    loop {
        // Poll for key with 20ms timeout (50Hz effective rate)
        if event::poll(Duration::from_millis(20))? {
            if let Event::Key(KeyEvent { code, kind, .. }) = event::read()? {
                let pressed = kind == KeyEventKind::Press || kind == KeyEventKind::Repeat;

                match code {
                    KeyCode::Char('z') if pressed => {
                        tz = YAW_TORQUES[level_idx];
                        last_input = Instant::now();
                    }
                    KeyCode::Char('x') if pressed => {
                        tz = -YAW_TORQUES[level_idx];
                        last_input = Instant::now();
                    }

                    KeyCode::Char('r') if pressed => {
                        level_idx = (level_idx + 1).min(YAW_TORQUES.len() - 1);
                        print_level(level_idx);
                    }
                    KeyCode::Char('f') if pressed => {
                        level_idx = level_idx.saturating_sub(1);
                        print_level(level_idx);
                    }

                    KeyCode::Char('q') | KeyCode::Esc if pressed => break,

                    _ => {}
                }
            }
        }

        if last_input.elapsed() > Duration::from_millis(INPUT_TIMEOUT_MS) {
            tz = 0.0;
        }

        // Always publish at ~50Hz so the runtime watchdog stays fed
        let cmd = serde_json::to_string(&YawCommand { tz })?;
        publisher.put(cmd).await?;
    }

    // Leave the robot without a spin demand
    publisher.put(serde_json::to_string(&YawCommand { tz: 0.0 })?).await?;
    Ok(())
}

fn print_level(idx: usize) {
    let label = ["LOW", "MED", "HIGH"][idx];
    info!("Level: {} ({})", label, YAW_TORQUES[idx]);
}
