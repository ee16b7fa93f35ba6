// Deterministic brake ramp timeline for a calibration experiment
//
// The timeline is fixed up front from the experiment parameters. Pacing comes
// only from the pauses between writes, never from rig feedback, so the whole
// sequence can be queued on the link before acquisition starts.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{MAX_HOLD_PAUSE, SETTLE_PAUSE, ZERO_HOLD_PAUSE};
use crate::error::{CalibrationError, Result};
use crate::link::Link;
use crate::messages::Command;

/// Parameters that shape the command timeline
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SequenceParams {
    pub commanded_motor_speed: i16,
    /// Brake command step between ramp levels
    pub command_interval: u8,
    /// Seconds spent at each ramp level
    pub time_interval: f64,
    pub max_torque_command: u8,
    /// Ramp cycles per motor direction
    pub repeats: u32,
}

/// Phase of the sequencer state machine a step belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    SetBaseSpeed,
    Settle,
    RampUp,
    HoldMax,
    PauseRelease,
    RampDown,
    HoldZero,
    PauseReset,
    ReverseMotor,
    SetIdle,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Action {
    Send(Command),
    Pause(f64),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Step {
    pub phase: Phase,
    pub action: Action,
}

pub struct CommandSequencer {
    params: SequenceParams,
}

impl CommandSequencer {
    pub fn new(params: SequenceParams) -> Result<Self> {
        if params.command_interval == 0 {
            return Err(CalibrationError::InvalidArgument(
                "command interval must be positive".to_string(),
            ));
        }
        if params.max_torque_command == 0 {
            return Err(CalibrationError::InvalidArgument(
                "max torque command must be positive".to_string(),
            ));
        }
        if params.repeats == 0 {
            return Err(CalibrationError::InvalidArgument(
                "at least one repeat is required".to_string(),
            ));
        }
        if !params.time_interval.is_finite() || params.time_interval < 0.0 {
            return Err(CalibrationError::InvalidArgument(format!(
                "time interval must be a non-negative number of seconds, got {}",
                params.time_interval
            )));
        }
        Ok(Self { params })
    }

    pub fn params(&self) -> &SequenceParams {
        &self.params
    }

    /// Brake cycles the ingestion loop should see: two directions of repeats
    pub fn expected_cycles(&self) -> u32 {
        2 * self.params.repeats
    }

    /// Every write and pause, in order
    pub fn timeline(&self) -> Vec<Step> {
        let p = &self.params;
        let mut steps = Vec::new();
        let mut push = |phase: Phase, action: Action| steps.push(Step { phase, action });

        push(Phase::SetBaseSpeed, Action::Send(Command::Motor(p.commanded_motor_speed)));
        push(Phase::Settle, Action::Pause(SETTLE_PAUSE));

        for direction in 0..2 {
            for _ in 0..p.repeats {
                push(Phase::RampUp, Action::Send(Command::Brake(0)));
                for level in ramp_levels(p.max_torque_command, p.command_interval) {
                    push(Phase::RampUp, Action::Send(Command::Brake(level)));
                    push(Phase::RampUp, Action::Pause(p.time_interval));
                }

                push(Phase::HoldMax, Action::Send(Command::Brake(p.max_torque_command)));
                push(Phase::PauseRelease, Action::Pause(MAX_HOLD_PAUSE));

                push(Phase::RampDown, Action::Send(Command::Brake(p.max_torque_command)));
                for level in ramp_levels(p.max_torque_command, p.command_interval) {
                    push(Phase::RampDown, Action::Send(Command::Brake(p.max_torque_command - level)));
                    push(Phase::RampDown, Action::Pause(p.time_interval));
                }

                push(Phase::HoldZero, Action::Send(Command::Brake(0)));
                push(Phase::PauseReset, Action::Pause(ZERO_HOLD_PAUSE));
            }

            if direction == 0 {
                push(Phase::ReverseMotor, Action::Send(Command::Motor(-p.commanded_motor_speed)));
                push(Phase::Settle, Action::Pause(SETTLE_PAUSE));
            }
        }

        push(Phase::SetIdle, Action::Pause(p.time_interval));
        push(Phase::SetIdle, Action::Send(Command::Motor(0)));
        push(Phase::SetIdle, Action::Send(Command::Brake(0)));
        steps
    }

    /// Each command with the time it is issued, assuming instant writes
    pub fn timed_commands(&self) -> Vec<(f64, Command)> {
        let mut now = 0.0;
        let mut commands = Vec::new();
        for step in self.timeline() {
            match step.action {
                Action::Send(command) => commands.push((now, command)),
                Action::Pause(seconds) => now += seconds,
            }
        }
        commands
    }

    /// Total length of the timeline in seconds
    pub fn duration(&self) -> f64 {
        self.timeline()
            .iter()
            .map(|step| match step.action {
                Action::Pause(seconds) => seconds,
                Action::Send(_) => 0.0,
            })
            .sum()
    }

    /// Queue the whole timeline on the link
    pub fn schedule<L: Link + ?Sized>(&self, link: &mut L) {
        let steps = self.timeline();
        info!(
            "Scheduling {} steps over {:.1}s ({} cycles)",
            steps.len(),
            self.duration(),
            self.expected_cycles()
        );
        for step in steps {
            match step.action {
                Action::Send(command) => {
                    debug!("{:?}: {}", step.phase, command);
                    link.write(command);
                }
                Action::Pause(seconds) => link.write_and_wait(seconds),
            }
        }
    }
}

/// Ramp levels from 0 to `max` in steps of `step`, ending exactly on `max`
///
/// Going down uses the same offsets from `max`, so a step size that does not
/// divide `max` snaps to 0 at the bottom and to `max` at the top.
pub fn ramp_levels(max: u8, step: u8) -> Vec<u8> {
    let mut levels: Vec<u8> = (0..=max).step_by(step.max(1) as usize).collect();
    if levels.last() != Some(&max) {
        levels.push(max);
    }
    levels
}
