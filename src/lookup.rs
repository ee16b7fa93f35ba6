// Brake command byte -> applied torque lookup tables
//
// Built from the brake datasheets: torque vs. percent-of-rated-current curves
// for engaging (ascending) and releasing (descending) the brake, composed with
// a measured current vs. command byte map for each brake driver.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{CalibrationError, Result};
use crate::filter::interp;
use crate::run::BrakeKind;

/// Number of distinct brake command values
pub const COMMAND_COUNT: usize = 256;

pub const OZIN_TO_NM: f64 = 0.0070615518333333;
pub const LBIN_TO_NM: f64 = 0.11298482933333;

/// Friction of the rig with no brake fitted (oz-in):
/// two sleeve bushings at 0.3 plus two encoder and two shaft bearings at 0.05
pub const NO_BRAKE_TORQUE_OZIN: f64 = 0.3 * 2.0 + 0.05 * 4.0;

/// Torque unit used by a datasheet
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TorqueUnit {
    PoundInch,
    OunceInch,
}

impl TorqueUnit {
    pub fn to_newton_meters(self, value: f64) -> f64 {
        match self {
            TorqueUnit::PoundInch => value * LBIN_TO_NM,
            TorqueUnit::OunceInch => value * OZIN_TO_NM,
        }
    }
}

/// Drive direction a table applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

impl Direction {
    pub fn name(self) -> &'static str {
        match self {
            Direction::Ascending => "ascending",
            Direction::Descending => "descending",
        }
    }
}

/// Datasheet description of one brake
pub struct BrakeDatasheet {
    pub unit: TorqueUnit,
    /// Rated current at 100 %
    pub max_current: f64,
    /// Torque below which the datasheet curve does not slip (native unit)
    pub min_torque: f64,
    /// (torque, percent current) while engaging, increasing current
    pub ascending: &'static [[f64; 2]],
    /// (torque, percent current) while releasing, decreasing current
    pub descending: &'static [[f64; 2]],
    /// (current amps, command byte) measured on the driver
    pub current_to_byte: &'static [[f64; 2]],
}

impl BrakeDatasheet {
    pub fn for_kind(kind: BrakeKind) -> &'static BrakeDatasheet {
        match kind {
            BrakeKind::Large => &LARGE_BRAKE,
            BrakeKind::Small => &SMALL_BRAKE,
        }
    }

    /// (torque N·m, current A) control points in interpolation order
    ///
    /// Descending points are listed in release order and come back reversed
    /// so the current axis increases.
    pub fn control_points(&self, direction: Direction) -> Vec<(f64, f64)> {
        let raw = match direction {
            Direction::Ascending => self.ascending,
            Direction::Descending => self.descending,
        };

        let mut points: Vec<(f64, f64)> = raw
            .iter()
            .map(|&[torque, percent]| {
                (
                    self.unit.to_newton_meters(torque + self.min_torque),
                    percent * self.max_current / 100.0,
                )
            })
            .collect();

        if direction == Direction::Descending {
            points.reverse();
        }
        points
    }

    pub fn current_to_byte_points(&self) -> Vec<(f64, f64)> {
        self.current_to_byte.iter().map(|&[current, byte]| (current, byte)).collect()
    }
}

/// Applied torque for every command byte
#[derive(Debug, Clone, PartialEq)]
pub struct LookupTable {
    torques: Vec<f64>,
}

impl LookupTable {
    /// Wrap 256 precomputed torques
    pub fn from_values(torques: Vec<f64>) -> Result<Self> {
        if torques.len() != COMMAND_COUNT {
            return Err(CalibrationError::Configuration(format!(
                "lookup table needs {} entries, got {}",
                COMMAND_COUNT,
                torques.len()
            )));
        }
        if let Some(i) = torques.iter().position(|t| !t.is_finite()) {
            return Err(CalibrationError::Configuration(format!(
                "lookup table entry {} is not finite",
                i
            )));
        }
        Ok(Self { torques })
    }

    /// Compose (torque, current) and (current, byte) curves into a table
    ///
    /// `torque_current` must be ordered by non-decreasing current and
    /// `current_byte` by non-decreasing byte. `friction_offset` (N·m) is added
    /// to every torque.
    pub fn from_control_points(
        torque_current: &[(f64, f64)],
        current_byte: &[(f64, f64)],
        friction_offset: f64,
    ) -> Result<Self> {
        if torque_current.len() < 2 || current_byte.len() < 2 {
            return Err(CalibrationError::Configuration(
                "need at least two control points per curve".to_string(),
            ));
        }

        let currents: Vec<f64> = torque_current.iter().map(|p| p.1).collect();
        let torques: Vec<f64> = torque_current.iter().map(|p| p.0 + friction_offset).collect();
        ensure_non_decreasing(&currents, "current axis of the torque curve")?;

        let byte_currents: Vec<f64> = current_byte.iter().map(|p| p.0).collect();
        let bytes: Vec<f64> = current_byte.iter().map(|p| p.1).collect();
        ensure_non_decreasing(&bytes, "byte axis of the current map")?;
        ensure_finite(&torques, "torque values")?;
        ensure_finite(&byte_currents, "current values")?;

        // Torque at each measured byte, then at every byte
        let torque_at_bytes = interp(&byte_currents, &currents, &torques)?;
        let all_bytes: Vec<f64> = (0..COMMAND_COUNT).map(|b| b as f64).collect();
        let table = interp(&all_bytes, &bytes, &torque_at_bytes)?;

        Self::from_values(table)
    }

    /// Torque (N·m) applied for a command byte
    pub fn torque(&self, command: u8) -> f64 {
        self.torques[command as usize]
    }

    pub fn values(&self) -> &[f64] {
        &self.torques
    }

    /// Lowest command byte whose torque is closest to `torque`
    pub fn nearest_command(&self, torque: f64) -> u8 {
        let mut best = 0;
        let mut best_diff = f64::INFINITY;
        for (i, t) in self.torques.iter().enumerate() {
            let diff = (t - torque).abs();
            if diff < best_diff {
                best = i;
                best_diff = diff;
            }
        }
        best as u8
    }

    /// Load a table written one value per line
    pub fn read_from(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let torques = text
            .lines()
            .filter(|line| !line.trim().is_empty())
            .enumerate()
            .map(|(i, line)| {
                line.trim().parse::<f64>().map_err(|e| {
                    CalibrationError::Configuration(format!(
                        "{} line {}: {}",
                        path.display(),
                        i + 1,
                        e
                    ))
                })
            })
            .collect::<Result<Vec<f64>>>()?;
        Self::from_values(torques)
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        let mut text = String::with_capacity(COMMAND_COUNT * 24);
        for torque in &self.torques {
            text.push_str(&torque.to_string());
            text.push('\n');
        }
        fs::write(path, text)?;
        Ok(())
    }
}

fn ensure_non_decreasing(values: &[f64], what: &str) -> Result<()> {
    match values.windows(2).position(|w| w[1] < w[0]) {
        Some(i) => Err(CalibrationError::Configuration(format!(
            "{} decreases at point {} ({} -> {})",
            what,
            i + 1,
            values[i],
            values[i + 1]
        ))),
        None => Ok(()),
    }
}

fn ensure_finite(values: &[f64], what: &str) -> Result<()> {
    if values.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(CalibrationError::Configuration(format!("{} contain non-finite entries", what)))
    }
}

/// Ascending and descending tables for one brake
#[derive(Debug, Clone, PartialEq)]
pub struct BrakeLookup {
    pub ascending: LookupTable,
    pub descending: LookupTable,
}

impl BrakeLookup {
    /// Build both tables from the brake's datasheet
    pub fn build(kind: BrakeKind) -> Result<Self> {
        let sheet = BrakeDatasheet::for_kind(kind);
        let friction = TorqueUnit::OunceInch.to_newton_meters(NO_BRAKE_TORQUE_OZIN);
        let current_byte = sheet.current_to_byte_points();

        let build_direction = |direction: Direction| {
            LookupTable::from_control_points(&sheet.control_points(direction), &current_byte, friction)
        };

        Ok(Self {
            ascending: build_direction(Direction::Ascending)?,
            descending: build_direction(Direction::Descending)?,
        })
    }

    pub fn table(&self, direction: Direction) -> &LookupTable {
        match direction {
            Direction::Ascending => &self.ascending,
            Direction::Descending => &self.descending,
        }
    }

    /// File holding one direction's table, e.g. `large_brake_ascending.csv`
    pub fn path(dir: &Path, kind: BrakeKind, direction: Direction) -> PathBuf {
        dir.join(format!("{}_{}.csv", kind.file_name(), direction.name()))
    }

    pub fn load(dir: &Path, kind: BrakeKind) -> Result<Self> {
        Ok(Self {
            ascending: LookupTable::read_from(&Self::path(dir, kind, Direction::Ascending))?,
            descending: LookupTable::read_from(&Self::path(dir, kind, Direction::Descending))?,
        })
    }

    /// Load saved tables, building from the datasheet when none are saved
    pub fn load_or_build(dir: &Path, kind: BrakeKind) -> Result<Self> {
        if Self::path(dir, kind, Direction::Ascending).exists() {
            debug!("Loading {} lookup tables from {}", kind.file_name(), dir.display());
            Self::load(dir, kind)
        } else {
            info!(
                "No lookup tables for {} in {}, building from datasheet",
                kind.file_name(),
                dir.display()
            );
            Self::build(kind)
        }
    }

    pub fn save(&self, dir: &Path, kind: BrakeKind) -> Result<()> {
        fs::create_dir_all(dir)?;
        for direction in [Direction::Ascending, Direction::Descending] {
            let path = Self::path(dir, kind, direction);
            self.table(direction).write_to(&path)?;
            info!("Wrote {}", path.display());
        }
        Ok(())
    }
}

// === Datasheet data ===

static LARGE_BRAKE: BrakeDatasheet = BrakeDatasheet {
    unit: TorqueUnit::PoundInch,
    max_current: 0.41,
    min_torque: 0.3,
    ascending: &[
        [0.031242914796173693, 0.16108047396307512],
        [0.17954996529340406, 9.998081544809882],
        [0.4474988576471368, 14.994994576003965],
        [0.8123332252022237, 19.990791415087426],
        [1.2498316991583227, 24.985751110087936],
        [1.9053224923174614, 29.97819937283956],
        [3.506960504239789, 39.95974732201097],
        [5.423476310566507, 49.93766764682286],
        [7.412656223294237, 59.9147508275518],
        [9.522942980023654, 69.89043876814247],
        [11.609008367952734, 79.8664057567608],
        [13.52552417427945, 89.84432608157269],
        [15.030276711000427, 99.82699022285472],
    ],
    descending: &[
        [15.030276711000427, 99.82699022285472],
        [14.03417291908654, 89.83846607299196],
        [12.529420382365565, 79.85580193170996],
        [10.516019100837497, 69.87899779900867],
        [8.526839188109767, 59.90191461827973],
        [6.707208856984401, 49.92287810135721],
        [4.814914419458022, 39.94467872851766],
        [3.116390932334344, 29.96424697145687],
        [1.7085238708147195, 19.98046663806424],
        [0.6398048059046566, 10.154069392268273],
        [0.031242914796173693, 0.16108047396307512],
    ],
    current_to_byte: &[
        [0.01, 0.0],
        [0.03, 16.0],
        [0.05, 32.0],
        [0.07, 48.0],
        [0.09, 64.0],
        [0.11, 80.0],
        [0.131, 96.0],
        [0.151, 112.0],
        [0.172, 128.0],
        [0.193, 144.0],
        [0.213, 160.0],
        [0.2345, 176.0],
        [0.253, 192.0],
        [0.278, 208.0],
        [0.295, 224.0],
        [0.297, 240.0],
        [0.303, 255.0],
    ],
};

static SMALL_BRAKE: BrakeDatasheet = BrakeDatasheet {
    unit: TorqueUnit::OunceInch,
    max_current: 0.10,
    min_torque: 0.1,
    ascending: &[
        [0.005802707930366857, -0.1160541586073478],
        [0.03288201160541693, 4.835589941972923],
        [0.07156673114119894, 9.941972920696326],
        [0.1489361702127665, 15.048355899419732],
        [0.23404255319149048, 20.0],
        [0.36557059961315286, 25.88007736943907],
        [0.4816247582205033, 30.98646034816248],
        [0.8994197292069632, 41.04448742746616],
        [1.1934235976789171, 45.99613152804642],
        [1.4410058027079304, 50.01934235976789],
        [2.0831721470019344, 59.92263056092844],
        [2.7717601547388786, 69.98065764023211],
        [3.4990328820116057, 80.03868471953578],
        [4.0019342359767895, 87.00193423597679],
        [4.23404255319149, 90.09671179883946],
        [5.0, 100.0],
    ],
    descending: &[
        [5.0, 100.0],
        [4.9071566731141205, 97.05996131528047],
        [4.752417794970986, 93.81044487427467],
        [4.682785299806577, 92.1083172147002],
        [4.55899419729207, 90.09671179883946],
        [4.087040618955513, 81.89555125725339],
        [3.305609284332689, 69.98065764023211],
        [2.655705996131528, 60.07736943907156],
        [2.0135396518375246, 50.01934235976789],
        [1.402321083172147, 39.96131528046421],
        [0.8607350096711803, 29.90328820116055],
        [0.6750483558994205, 26.034816247582206],
        [0.44294003868471954, 19.845261121856865],
        [0.1798839458413921, 9.941972920696326],
        [0.06382978723404253, 4.835589941972923],
        [-0.005802707930366857, -0.1160541586073478],
    ],
    current_to_byte: &[
        [0.004, 0.0],
        [0.014, 16.0],
        [0.024, 32.0],
        [0.033, 48.0],
        [0.043, 64.0],
        [0.052, 80.0],
        [0.062, 96.0],
        [0.071, 112.0],
        [0.081, 128.0],
        [0.090, 144.0],
        [0.095, 160.0],
        [0.095, 176.0],
        [0.095, 192.0],
        [0.095, 208.0],
        [0.095, 224.0],
        [0.095, 240.0],
        [0.095, 255.0],
    ],
};
