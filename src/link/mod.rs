// Duplex link to the brake rig
//
// Provides:
// - The `Link` contract used by the sequencer and the ingestion loop
// - A paced write schedule shared by link implementations
// - Serial transport for the real rig and a simulated rig for dry runs

pub mod serial;
pub mod sim;

use std::collections::VecDeque;

use crate::messages::{Command, Packet};

pub use serial::SerialLink;
pub use sim::SimulatedRig;

/// Error types for link communication
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, LinkError>;

/// Byte-oriented duplex link to the rig
///
/// Writes are queued and released in order as their preceding pauses
/// elapse; neither `write` nor `write_and_wait` blocks the caller.
pub trait Link {
    /// False once the link is closed or disconnected
    fn ok(&self) -> bool;

    /// Next packet if one is available
    fn read(&mut self) -> Result<Option<Packet>>;

    /// Queue a command
    fn write(&mut self, command: Command);

    /// Queue a pause before the next queued command
    fn write_and_wait(&mut self, seconds: f64);

    /// Drop pending writes, idle the rig and close
    fn stop(&mut self);
}

impl<L: Link + ?Sized> Link for Box<L> {
    fn ok(&self) -> bool {
        (**self).ok()
    }

    fn read(&mut self) -> Result<Option<Packet>> {
        (**self).read()
    }

    fn write(&mut self, command: Command) {
        (**self).write(command)
    }

    fn write_and_wait(&mut self, seconds: f64) {
        (**self).write_and_wait(seconds)
    }

    fn stop(&mut self) {
        (**self).stop()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Outgoing {
    Command(Command),
    Pause(f64),
}

/// FIFO of commands and pauses released against a clock in seconds
///
/// Each pause runs from the previous deadline, so late polls do not stretch
/// the timeline. A pause with no deadline pending runs from the current poll.
#[derive(Debug, Default)]
pub struct WriteSchedule {
    queue: VecDeque<Outgoing>,
    ready_at: Option<f64>,
}

impl WriteSchedule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_command(&mut self, command: Command) {
        self.queue.push_back(Outgoing::Command(command));
    }

    pub fn push_pause(&mut self, seconds: f64) {
        self.queue.push_back(Outgoing::Pause(seconds.max(0.0)));
    }

    /// Commands whose preceding pauses have elapsed at `now`
    pub fn due(&mut self, now: f64) -> Vec<Command> {
        let mut released = Vec::new();
        while self.ready_at.is_none_or(|t| now >= t) {
            match self.queue.pop_front() {
                Some(Outgoing::Command(command)) => released.push(command),
                Some(Outgoing::Pause(seconds)) => {
                    self.ready_at = Some(self.ready_at.unwrap_or(now) + seconds);
                }
                None => {
                    self.ready_at = None;
                    break;
                }
            }
        }
        released
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.ready_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_releases_after_pauses() {
        let mut schedule = WriteSchedule::new();
        schedule.push_command(Command::Motor(255));
        schedule.push_pause(1.0);
        schedule.push_command(Command::Brake(8));
        schedule.push_command(Command::Brake(16));
        schedule.push_pause(0.5);
        schedule.push_command(Command::Brake(0));

        assert_eq!(schedule.due(0.0), vec![Command::Motor(255)]);
        assert!(schedule.due(0.5).is_empty());
        assert_eq!(schedule.due(1.0), vec![Command::Brake(8), Command::Brake(16)]);
        assert!(schedule.due(1.2).is_empty());
        assert_eq!(schedule.due(1.5), vec![Command::Brake(0)]);
        assert!(schedule.is_empty());
    }

    #[test]
    fn test_late_polls_do_not_accumulate() {
        let mut schedule = WriteSchedule::new();
        for level in [8, 16, 24] {
            schedule.push_command(Command::Brake(level));
            schedule.push_pause(1.0);
        }
        schedule.push_command(Command::Brake(0));

        // First pause runs from the first poll
        assert_eq!(schedule.due(10.0), vec![Command::Brake(8)]);
        assert!(schedule.due(10.9).is_empty());
        assert_eq!(schedule.due(11.3), vec![Command::Brake(16)]);
        // Deadline is 12.0, not 12.3
        assert_eq!(schedule.due(12.0), vec![Command::Brake(24)]);
        assert_eq!(schedule.due(13.25), vec![Command::Brake(0)]);
        assert!(schedule.is_empty());

        // Once drained, new pauses start from the next poll again
        schedule.push_pause(1.0);
        schedule.push_command(Command::Motor(0));
        assert!(schedule.due(20.0).is_empty());
        assert_eq!(schedule.due(21.0), vec![Command::Motor(0)]);
    }

    #[test]
    fn test_clear_drops_pending() {
        let mut schedule = WriteSchedule::new();
        schedule.push_pause(10.0);
        schedule.push_command(Command::Brake(100));
        assert!(schedule.due(0.0).is_empty());
        schedule.clear();
        assert!(schedule.due(20.0).is_empty());
    }
}
