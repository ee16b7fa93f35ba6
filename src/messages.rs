// Message types exchanged with the brake rig

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of telemetry carried by a packet
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PacketTag {
    Encoder,
    BrakeAck,
    MotorAck,
    Unknown,
}

impl PacketTag {
    /// Map the leading token of a telemetry line to a tag
    pub fn from_name(name: &str) -> Self {
        match name {
            "enc" => PacketTag::Encoder,
            "brake" => PacketTag::BrakeAck,
            "motor" => PacketTag::MotorAck,
            _ => PacketTag::Unknown,
        }
    }
}

/// One telemetry packet read from the link
///
/// Timestamps are seconds since the link was opened.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Packet {
    pub tag: PacketTag,
    pub timestamp: f64,
    pub payload: Vec<f64>,
}

impl Packet {
    pub fn new(tag: PacketTag, timestamp: f64, payload: Vec<f64>) -> Self {
        Self {
            tag,
            timestamp,
            payload,
        }
    }

    pub fn encoder(timestamp: f64, enc1: f64, enc2: f64) -> Self {
        Self::new(PacketTag::Encoder, timestamp, vec![enc1, enc2])
    }

    pub fn brake_ack(timestamp: f64, value: u8) -> Self {
        Self::new(PacketTag::BrakeAck, timestamp, vec![value as f64])
    }

    pub fn motor_ack(timestamp: f64, value: i16) -> Self {
        Self::new(PacketTag::MotorAck, timestamp, vec![value as f64])
    }

    /// Parse a whitespace separated telemetry line such as `enc 12.5 13.0`
    ///
    /// Lines with an unrecognised name, a missing value or a value that does
    /// not parse come back tagged `Unknown` with an empty payload.
    pub fn parse_line(line: &str, timestamp: f64) -> Self {
        let mut fields = line.split_whitespace();
        let tag = fields.next().map(PacketTag::from_name).unwrap_or(PacketTag::Unknown);
        let payload: Option<Vec<f64>> = fields.map(|f| f.parse().ok()).collect();

        let expected = match tag {
            PacketTag::Encoder => 2,
            PacketTag::BrakeAck | PacketTag::MotorAck => 1,
            PacketTag::Unknown => return Self::new(PacketTag::Unknown, timestamp, Vec::new()),
        };

        match payload {
            Some(values) if values.len() >= expected => Self::new(tag, timestamp, values),
            _ => Self::new(PacketTag::Unknown, timestamp, Vec::new()),
        }
    }
}

/// Command written to the rig
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    /// Brake command byte, 0 = released
    Brake(u8),
    /// Signed motor speed
    Motor(i16),
}

impl fmt::Display for Command {
    // Wire format: one-letter opcode followed by the signed value
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Brake(value) => write!(f, "b{}", value),
            Command::Motor(value) => write!(f, "m{}", value),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Malformed command token: {0:?}")]
pub struct ParseCommandError(pub String);

impl FromStr for Command {
    type Err = ParseCommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let token = s.trim();
        let err = || ParseCommandError(token.to_string());
        let (opcode, value) = token.split_at_checked(1).ok_or_else(err)?;
        match opcode {
            "b" => value.parse().map(Command::Brake).map_err(|_| err()),
            "m" => value.parse().map(Command::Motor).map_err(|_| err()),
            _ => Err(err()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_wire_format() {
        assert_eq!(Command::Brake(168).to_string(), "b168");
        assert_eq!(Command::Motor(-255).to_string(), "m-255");
        assert_eq!("m-255".parse::<Command>(), Ok(Command::Motor(-255)));
        assert_eq!("b0\n".parse::<Command>(), Ok(Command::Brake(0)));
        assert!("b256".parse::<Command>().is_err());
        assert!("x12".parse::<Command>().is_err());
        assert!("".parse::<Command>().is_err());
    }

    #[test]
    fn test_parse_telemetry_lines() {
        let enc = Packet::parse_line("enc 10.5 -3.25", 1.0);
        assert_eq!(enc.tag, PacketTag::Encoder);
        assert_eq!(enc.payload, vec![10.5, -3.25]);

        let brake = Packet::parse_line("brake 64", 2.0);
        assert_eq!(brake.tag, PacketTag::BrakeAck);
        assert_eq!(brake.payload, vec![64.0]);

        let motor = Packet::parse_line("motor -255", 3.0);
        assert_eq!(motor.tag, PacketTag::MotorAck);
        assert_eq!(motor.payload, vec![-255.0]);
    }

    #[test]
    fn test_malformed_lines_are_unknown() {
        assert_eq!(Packet::parse_line("", 0.0).tag, PacketTag::Unknown);
        assert_eq!(Packet::parse_line("enc 1.0", 0.0).tag, PacketTag::Unknown);
        assert_eq!(Packet::parse_line("brake abc", 0.0).tag, PacketTag::Unknown);
        assert_eq!(Packet::parse_line("hello 1 2", 0.0).tag, PacketTag::Unknown);
    }
}
