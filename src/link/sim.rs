// Simulated brake rig on a virtual clock
//
// Acknowledges every command the way the bridge firmware does and emits one
// encoder packet per poll. The shaft twists in proportion to the applied
// brake torque, so a run recorded here calibrates back to the configured
// stiffness.

use std::collections::VecDeque;

use tracing::debug;

use super::{Link, Result, WriteSchedule};
use crate::lookup::BrakeLookup;
use crate::messages::{Command, Packet};

/// Physical behaviour of the simulated rig
#[derive(Debug, Clone)]
pub struct RigModel {
    pub lookup: BrakeLookup,
    /// Shaft twist per unit of applied torque
    pub degrees_per_newton_meter: f64,
    pub gear_ratio: f64,
    /// Shaft rotation speed per motor command count (deg/s)
    pub spin_rate: f64,
    pub encoder_offsets: [f64; 2],
    /// Extra apparent twist while the motor runs in reverse
    pub backlash_deg: f64,
}

pub struct SimulatedRig {
    model: RigModel,
    clock: f64,
    sample_period: f64,
    schedule: WriteSchedule,
    pending: VecDeque<Packet>,
    brake: u8,
    rising: bool,
    motor: i16,
    spin: f64,
    open: bool,
    close_at: Option<f64>,
}

impl SimulatedRig {
    pub fn new(model: RigModel, sample_period: f64) -> Self {
        Self {
            model,
            clock: 0.0,
            sample_period,
            schedule: WriteSchedule::new(),
            pending: VecDeque::new(),
            brake: 0,
            rising: true,
            motor: 0,
            spin: 0.0,
            open: true,
            close_at: None,
        }
    }

    /// Disconnect once the virtual clock reaches `seconds`
    pub fn close_at(mut self, seconds: f64) -> Self {
        self.close_at = Some(seconds);
        self
    }

    pub fn clock(&self) -> f64 {
        self.clock
    }

    fn apply(&mut self, command: Command) {
        debug!("Sim rig applying {}", command);
        match command {
            Command::Brake(value) => {
                if value != self.brake {
                    self.rising = value > self.brake;
                }
                self.brake = value;
                self.pending.push_back(Packet::brake_ack(self.clock, value));
            }
            Command::Motor(value) => {
                self.motor = value;
                self.pending.push_back(Packet::motor_ack(self.clock, value));
            }
        }
    }

    /// Shaft twist (deg) for the current brake and motor state
    fn twist(&self) -> f64 {
        let table = if self.rising {
            &self.model.lookup.ascending
        } else {
            &self.model.lookup.descending
        };
        let torque = table.torque(self.brake) * self.model.degrees_per_newton_meter;
        let backlash = if self.motor < 0 { self.model.backlash_deg } else { 0.0 };
        self.motor.signum() as f64 * torque + backlash
    }

    fn sample(&mut self) -> Packet {
        self.spin += self.motor as f64 * self.model.spin_rate * self.sample_period;
        let gear = self.model.gear_ratio;
        let [offset1, offset2] = self.model.encoder_offsets;
        Packet::encoder(
            self.clock,
            offset1 + (self.spin + self.twist()) / gear,
            offset2 + self.spin / gear,
        )
    }
}

impl Link for SimulatedRig {
    fn ok(&self) -> bool {
        self.open && self.close_at.is_none_or(|t| self.clock < t)
    }

    fn read(&mut self) -> Result<Option<Packet>> {
        if !self.ok() {
            return Ok(None);
        }

        self.clock += self.sample_period;
        for command in self.schedule.due(self.clock) {
            self.apply(command);
        }

        match self.pending.pop_front() {
            Some(packet) => Ok(Some(packet)),
            None => Ok(Some(self.sample())),
        }
    }

    fn write(&mut self, command: Command) {
        self.schedule.push_command(command);
    }

    fn write_and_wait(&mut self, seconds: f64) {
        self.schedule.push_pause(seconds);
    }

    fn stop(&mut self) {
        self.schedule.clear();
        self.brake = 0;
        self.motor = 0;
        self.open = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookup::LookupTable;
    use crate::messages::PacketTag;

    fn linear_model() -> RigModel {
        let table = LookupTable::from_values((0..256).map(|b| b as f64 * 0.01).collect()).unwrap();
        RigModel {
            lookup: BrakeLookup {
                ascending: table.clone(),
                descending: table,
            },
            degrees_per_newton_meter: 2.0,
            gear_ratio: 0.5,
            spin_rate: 1.0,
            encoder_offsets: [10.0, 20.0],
            backlash_deg: 0.0,
        }
    }

    #[test]
    fn test_commands_are_acknowledged_in_order() {
        let mut rig = SimulatedRig::new(linear_model(), 0.01);
        rig.write(Command::Motor(100));
        rig.write(Command::Brake(50));

        let first = rig.read().unwrap().unwrap();
        assert_eq!(first.tag, PacketTag::MotorAck);
        assert_eq!(first.payload, vec![100.0]);
        let second = rig.read().unwrap().unwrap();
        assert_eq!(second.tag, PacketTag::BrakeAck);
        assert_eq!(second.payload, vec![50.0]);
        assert_eq!(rig.read().unwrap().unwrap().tag, PacketTag::Encoder);
    }

    #[test]
    fn test_twist_follows_torque() {
        let mut rig = SimulatedRig::new(linear_model(), 0.01);
        rig.write(Command::Motor(100));
        rig.write(Command::Brake(100));
        rig.read().unwrap();
        rig.read().unwrap();

        let packet = rig.read().unwrap().unwrap();
        let twist = (packet.payload[0] - 10.0) * 0.5 - (packet.payload[1] - 20.0) * 0.5;
        // 100 counts * 0.01 N·m * 2 deg/N·m
        assert!((twist - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_pauses_delay_commands() {
        let mut rig = SimulatedRig::new(linear_model(), 0.1);
        rig.write_and_wait(0.55);
        rig.write(Command::Brake(1));

        let mut ack_time = None;
        for _ in 0..20 {
            let packet = rig.read().unwrap().unwrap();
            if packet.tag == PacketTag::BrakeAck {
                ack_time = Some(packet.timestamp);
                break;
            }
        }
        let ack_time = ack_time.unwrap();
        assert!(ack_time >= 0.55 && ack_time < 0.8, "ack at {}", ack_time);
    }

    #[test]
    fn test_close_and_stop() {
        let mut rig = SimulatedRig::new(linear_model(), 0.5).close_at(1.0);
        assert!(rig.ok());
        rig.read().unwrap();
        rig.read().unwrap();
        assert!(!rig.ok());
        assert!(rig.read().unwrap().is_none());

        let mut rig = SimulatedRig::new(linear_model(), 0.5);
        rig.stop();
        assert!(!rig.ok());
    }
}
