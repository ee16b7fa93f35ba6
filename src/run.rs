// Experiment run record and its on-disk format
//
// A run is written once at the end of acquisition and read back by the
// calibration pipeline. Records without a `version` field come from the
// first generation of the rig software and are migrated on load.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{CalibrationError, Result};
use crate::sequencer::SequenceParams;

pub const RUN_FORMAT_VERSION: u32 = 2;

pub const CM_PER_INCH: f64 = 2.54;

/// Brake hardware variant
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BrakeKind {
    Large,
    Small,
}

impl BrakeKind {
    /// Prefix used for run and lookup table file names
    pub fn file_name(self) -> &'static str {
        match self {
            BrakeKind::Large => "large_brake",
            BrakeKind::Small => "small_brake",
        }
    }

    /// Numeric code used by legacy records
    pub fn from_legacy_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(BrakeKind::Large),
            1 => Ok(BrakeKind::Small),
            other => Err(CalibrationError::Data(format!("unknown legacy brake type {}", other))),
        }
    }
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

/// Conical annulus dimensions
///
/// Centimeters are authoritative; inch fields may be absent in older records
/// and are derived on load.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Geometry {
    pub width_cm: f64,
    pub height_cm: f64,
    pub wall_thickness_cm: f64,
    #[serde(default)]
    pub width_in: Option<f64>,
    #[serde(default)]
    pub height_in: Option<f64>,
    #[serde(default)]
    pub wall_thickness_in: Option<f64>,
}

impl Geometry {
    pub fn from_inches(width_in: f64, height_in: f64, wall_thickness_in: f64) -> Self {
        Self {
            width_cm: width_in * CM_PER_INCH,
            height_cm: height_in * CM_PER_INCH,
            wall_thickness_cm: wall_thickness_in * CM_PER_INCH,
            width_in: Some(width_in),
            height_in: Some(height_in),
            wall_thickness_in: Some(wall_thickness_in),
        }
    }

    pub fn from_cm(width_cm: f64, height_cm: f64, wall_thickness_cm: f64) -> Self {
        Self {
            width_cm,
            height_cm,
            wall_thickness_cm,
            width_in: None,
            height_in: None,
            wall_thickness_in: None,
        }
        .with_derived_inches()
    }

    /// Fill missing inch fields from centimeters, rounded to 4 decimals
    pub fn with_derived_inches(self) -> Self {
        Self {
            width_in: self.width_in.or(Some(round4(self.width_cm / CM_PER_INCH))),
            height_in: self.height_in.or(Some(round4(self.height_cm / CM_PER_INCH))),
            wall_thickness_in: self
                .wall_thickness_in
                .or(Some(round4(self.wall_thickness_cm / CM_PER_INCH))),
            ..self
        }
    }

    /// `<w>x<h>x<t>` in inches, e.g. `1.0x0.75x0.125`
    pub fn key(&self) -> String {
        let g = self.with_derived_inches();
        format!(
            "{:?}x{:?}x{:?}",
            g.width_in.unwrap_or_default(),
            g.height_in.unwrap_or_default(),
            g.wall_thickness_in.unwrap_or_default()
        )
    }
}

/// Everything recorded during one calibration experiment
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExperimentRun {
    pub version: u32,
    pub brake_kind: BrakeKind,
    pub geometry: Geometry,
    pub commanded_motor_speed: i16,
    pub command_interval: u8,
    pub time_interval: f64,
    pub max_torque_command: u8,
    pub repeats: u32,
    /// (timestamp, brake command byte)
    #[serde(default)]
    pub torque_commands: Vec<(f64, u8)>,
    /// (timestamp, motor command)
    #[serde(default)]
    pub motor_commands: Vec<(f64, i16)>,
    /// (timestamp, encoder 1, encoder 2)
    #[serde(default)]
    pub encoder_samples: Vec<(f64, f64, f64)>,
    /// Unix seconds at the start of acquisition
    pub start_time: f64,
    #[serde(default)]
    pub initial_encoder_time: Option<f64>,
    #[serde(default)]
    pub encoder_start_values: [f64; 2],
}

impl ExperimentRun {
    pub fn new(brake_kind: BrakeKind, geometry: Geometry, params: &SequenceParams) -> Self {
        let start_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();

        Self {
            version: RUN_FORMAT_VERSION,
            brake_kind,
            geometry: geometry.with_derived_inches(),
            commanded_motor_speed: params.commanded_motor_speed,
            command_interval: params.command_interval,
            time_interval: params.time_interval,
            max_torque_command: params.max_torque_command,
            repeats: params.repeats,
            torque_commands: Vec::new(),
            motor_commands: Vec::new(),
            encoder_samples: Vec::new(),
            start_time,
            initial_encoder_time: None,
            encoder_start_values: [0.0; 2],
        }
    }

    pub fn record_torque_command(&mut self, timestamp: f64, command: u8) {
        self.torque_commands.push((timestamp, command));
    }

    pub fn record_motor_command(&mut self, timestamp: f64, command: i16) {
        self.motor_commands.push((timestamp, command));
    }

    pub fn record_encoders(&mut self, timestamp: f64, enc1: f64, enc2: f64) {
        self.encoder_samples.push((timestamp, enc1, enc2));
    }

    pub fn record_encoder_start(&mut self, timestamp: f64, enc1: f64, enc2: f64) {
        self.initial_encoder_time = Some(timestamp);
        self.encoder_start_values = [enc1, enc2];
    }

    /// File name keyed by brake, geometry and start time
    pub fn file_name(&self) -> String {
        format!(
            "{}_{}_{:?}.json",
            self.brake_kind.file_name(),
            self.geometry.key(),
            self.start_time
        )
    }

    /// Write the run under `dir`, returning the path written
    pub fn save(&self, dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let path = dir.join(self.file_name());
        fs::write(&path, serde_json::to_string(self)?)?;
        info!("Saved run to {}", path.display());
        Ok(path)
    }

    /// Read a run of any known format version
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        match value.get("version").and_then(|v| v.as_u64()) {
            Some(version) if version >= 2 => {
                let mut run: ExperimentRun = serde_json::from_value(value)?;
                run.geometry = run.geometry.with_derived_inches();
                Ok(run)
            }
            Some(version) => Err(CalibrationError::Data(format!(
                "unsupported run format version {}",
                version
            ))),
            None => {
                debug!("Migrating unversioned run record");
                let legacy: LegacyRunRecord = serde_json::from_value(value)?;
                legacy.migrate()
            }
        }
    }
}

/// First generation record: flat fields, brake as 0/1, geometry in cm
#[derive(Debug, Deserialize)]
struct LegacyRunRecord {
    brake_type: u8,
    conical_annulus_width: f64,
    conical_annulus_height: f64,
    conical_annulus_wall_thickness: f64,
    commanded_motor_speed: i16,
    command_interval: f64,
    time_interval: f64,
    max_torque_command: f64,
    repeats: u32,
    #[serde(default)]
    commanded_torque_data: Vec<(f64, f64)>,
    #[serde(default)]
    commanded_motor_data: Vec<(f64, f64)>,
    #[serde(default)]
    encoder_data: Vec<(f64, f64, f64)>,
    start_time: f64,
    #[serde(default)]
    encoder_start_values: Vec<f64>,
}

impl LegacyRunRecord {
    fn migrate(self) -> Result<ExperimentRun> {
        let byte = |value: f64| -> Result<u8> {
            if (0.0..=255.0).contains(&value) {
                Ok(value.round() as u8)
            } else {
                Err(CalibrationError::Data(format!("command {} outside 0..=255", value)))
            }
        };

        let torque_commands = self
            .commanded_torque_data
            .iter()
            .map(|&(t, c)| byte(c).map(|c| (t, c)))
            .collect::<Result<Vec<_>>>()?;
        let motor_commands = self
            .commanded_motor_data
            .iter()
            .map(|&(t, c)| (t, c.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16))
            .collect();

        let mut encoder_start_values = [0.0; 2];
        for (slot, value) in encoder_start_values.iter_mut().zip(&self.encoder_start_values) {
            *slot = *value;
        }

        Ok(ExperimentRun {
            version: RUN_FORMAT_VERSION,
            brake_kind: BrakeKind::from_legacy_code(self.brake_type)?,
            geometry: Geometry::from_cm(
                self.conical_annulus_width,
                self.conical_annulus_height,
                self.conical_annulus_wall_thickness,
            ),
            commanded_motor_speed: self.commanded_motor_speed,
            command_interval: byte(self.command_interval)?,
            time_interval: self.time_interval,
            max_torque_command: byte(self.max_torque_command)?,
            repeats: self.repeats,
            torque_commands,
            motor_commands,
            encoder_samples: self.encoder_data,
            start_time: self.start_time,
            initial_encoder_time: None,
            encoder_start_values,
        })
    }
}
