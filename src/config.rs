// Timings, topics, rig geometry and experiment presets
use std::time::Duration;

use crate::run::{BrakeKind, Geometry};
use crate::sequencer::SequenceParams;

// Serial port for the rig's microcontroller bridge
pub const RIG_PORT: &str = "/dev/ttyACM0";
pub const RIG_BAUDRATE: u32 = 115_200;

// Zenoh topic for live encoder samples
pub const TOPIC_SAMPLES: &str = "brake_rig/samples";

// Hand-off queue between the ingestion loop and the publisher task
pub const SAMPLE_QUEUE_DEPTH: usize = 1024;

// Encoder packets before this many seconds of stream time are sensor warm-up
pub const WARMUP_DELAY: f64 = 2.0;

// Ingestion loop pacing
pub const POLL_IDLE: Duration = Duration::from_millis(1);
pub const SILENCE_WARNING: Duration = Duration::from_secs(1);

// Dry-run rig used when no hardware is attached
pub const SIM_SAMPLE_PERIOD: f64 = 0.005;
pub const SIM_DEGREES_PER_NEWTON_METER: f64 = 20.0;
pub const SIM_SPIN_RATE: f64 = 1.0; // deg/s per motor count

// Command timeline pauses (seconds)
pub const SETTLE_PAUSE: f64 = 5.0; // twist settles after a motor speed change
pub const MAX_HOLD_PAUSE: f64 = 2.0;
pub const ZERO_HOLD_PAUSE: f64 = 5.0; // brake dynamics reset between cycles

// Encoder pulley 32T driving the 48T shaft pulley
pub const GEAR_RATIO: f64 = 32.0 / 48.0;

// Where runs and lookup tables live
pub const EXPERIMENTS_DIR: &str = "experiments";
pub const LOOKUP_TABLES_DIR: &str = "lookup_tables";

// Default conical annulus under test (inches)
pub const WIDTH_IN: f64 = 0.5;
pub const HEIGHT_IN: f64 = 0.5;
pub const WALL_THICKNESS_IN: f64 = 0.025;
pub const COMMANDED_MOTOR_SPEED: i16 = 255;

/// Highest brake command that is safe for each brake
pub fn max_torque_command(kind: BrakeKind) -> u8 {
    match kind {
        BrakeKind::Large => 190,
        BrakeKind::Small => 255,
    }
}

/// Standard experiment for each brake
pub fn preset(kind: BrakeKind) -> SequenceParams {
    let (command_interval, repeats) = match kind {
        BrakeKind::Large => (16, 3),
        BrakeKind::Small => (8, 2),
    };
    SequenceParams {
        commanded_motor_speed: COMMANDED_MOTOR_SPEED,
        command_interval,
        time_interval: 7.0,
        max_torque_command: max_torque_command(kind),
        repeats,
    }
}

pub fn default_geometry() -> Geometry {
    Geometry::from_inches(WIDTH_IN, HEIGHT_IN, WALL_THICKNESS_IN)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_respect_brake_limits() {
        for kind in [BrakeKind::Large, BrakeKind::Small] {
            let params = preset(kind);
            assert!(params.max_torque_command <= max_torque_command(kind));
            assert!(params.command_interval > 0);
            assert!(params.repeats >= 1);
        }
        assert_eq!(preset(BrakeKind::Large).max_torque_command, 190);
        assert_eq!(preset(BrakeKind::Small).max_torque_command, 255);
    }
}
