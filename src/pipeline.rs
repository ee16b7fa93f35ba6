// Offline analysis: logged commands and encoder ticks -> torque vs twist angle
//
// Stages, each exposed for inspection:
// 1. torque reconstruction from brake command bytes via the lookup tables
// 2. twist reconstruction from the two encoder channels
// 3. backlash correction around the motor reversal (or the zero valley
//    when the motor log has none)
// 4. alignment of twist onto the torque timestamps
// 5. linear regression of torque against twist

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::GEAR_RATIO;
use crate::error::{CalibrationError, Result};
use crate::filter;
use crate::lookup::{BrakeLookup, Direction};
use crate::run::ExperimentRun;

/// Tunables for the analysis
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Fraction of the time interval the rig needs to settle after a command
    pub settling_fraction: f64,
    /// Encoder pulley ratio
    pub gear_ratio: f64,
    /// Outlier threshold in standard deviations
    pub outlier_sigma: f64,
    pub smoothing_window: usize,
    pub smoothing_order: usize,
    /// Seconds after the motor reversal before the shaft has actually turned
    pub backlash_grace: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            settling_fraction: 1.0 / 3.0,
            gear_ratio: GEAR_RATIO,
            outlier_sigma: 6.0,
            smoothing_window: 501,
            smoothing_order: 5,
            backlash_grace: 0.5,
        }
    }
}

/// Commanded torque per distinct brake command
#[derive(Debug, Clone, PartialEq)]
pub struct TorqueTrace {
    /// Command timestamps shifted by the settling time
    pub timestamps: Vec<f64>,
    /// Signed torque (N·m)
    pub torques: Vec<f64>,
    /// First index of the second motor direction
    pub reversal_index: usize,
    /// Settling shift applied to `timestamps`
    pub shift: f64,
}

impl TorqueTrace {
    /// Unshifted time of the brake command that opens the second direction
    pub fn valley_time(&self) -> f64 {
        self.timestamps[self.reversal_index] - self.shift
    }
}

/// Twist angle after outlier rejection, before and after smoothing
#[derive(Debug, Clone, PartialEq)]
pub struct TwistTrace {
    pub timestamps: Vec<f64>,
    pub raw: Vec<f64>,
    pub smoothed: Vec<f64>,
    pub outliers_removed: usize,
}

/// Torque against twist angle with its least-squares line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationResult {
    pub torque_samples: Vec<f64>,
    pub twist_angle_samples: Vec<f64>,
    pub regression_slope: f64,
    pub regression_intercept: f64,
}

impl CalibrationResult {
    /// Regression line evaluated at each twist sample
    pub fn fitted(&self) -> Vec<f64> {
        self.twist_angle_samples
            .iter()
            .map(|x| self.regression_slope * x + self.regression_intercept)
            .collect()
    }
}

pub struct CalibrationPipeline<'a> {
    config: PipelineConfig,
    lookup: &'a BrakeLookup,
}

impl<'a> CalibrationPipeline<'a> {
    pub fn new(config: PipelineConfig, lookup: &'a BrakeLookup) -> Self {
        Self { config, lookup }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run every stage on a recorded experiment
    pub fn run(&self, run: &ExperimentRun) -> Result<CalibrationResult> {
        let torque = self.reconstruct_torque(run)?;
        let reversal = match motor_reversal_timestamp(run) {
            Some(reversal) => {
                self.check_reversal(run, &torque, reversal);
                reversal
            }
            None => {
                debug!("No motor reversal logged, using the zero valley at {:.3}s", torque.valley_time());
                torque.valley_time()
            }
        };

        let twist = self.reconstruct_twist(run)?;
        let corrected = self.correct_backlash(&twist, Some(reversal));

        let aligned = filter::interp(&torque.timestamps, &twist.timestamps, &corrected)?;
        let (slope, intercept) = filter::linear_fit(&aligned, &torque.torques)?;

        info!(
            "{} {}: {} torque samples, slope {:.4} N·m/deg, intercept {:.4} N·m",
            run.brake_kind.file_name(),
            run.geometry.key(),
            torque.torques.len(),
            slope,
            intercept
        );

        Ok(CalibrationResult {
            torque_samples: torque.torques,
            twist_angle_samples: aligned,
            regression_slope: slope,
            regression_intercept: intercept,
        })
    }

    /// Convert the brake command log into signed torque
    pub fn reconstruct_torque(&self, run: &ExperimentRun) -> Result<TorqueTrace> {
        if run.torque_commands.is_empty() {
            return Err(CalibrationError::Data("run has no brake commands".to_string()));
        }

        let shift = run.time_interval * self.config.settling_fraction;

        // Keep the last of each run of repeated commands
        let commands: Vec<(f64, u8)> = run
            .torque_commands
            .iter()
            .enumerate()
            .filter(|&(i, &(_, cmd))| {
                run.torque_commands
                    .get(i + 1)
                    .is_none_or(|&(_, next)| next != cmd)
            })
            .map(|(_, &entry)| entry)
            .collect();

        let valleys = zero_valleys(&commands);
        if valleys.is_empty() {
            return Err(CalibrationError::Data(
                "brake command log never returns to zero".to_string(),
            ));
        }
        let reversal_index = *valleys.get(run.repeats as usize).ok_or_else(|| {
            CalibrationError::Data(format!(
                "expected a motor reversal after {} cycles, found only {} zero valleys",
                run.repeats,
                valleys.len()
            ))
        })?;

        let motor_sign = if run.commanded_motor_speed < 0 { -1.0 } else { 1.0 };
        let mut timestamps = Vec::with_capacity(commands.len());
        let mut torques = Vec::with_capacity(commands.len());

        for (i, &(t, cmd)) in commands.iter().enumerate() {
            let rising = commands.get(i + 1).is_some_and(|&(_, next)| next > cmd);
            let direction = if rising {
                Direction::Ascending
            } else {
                Direction::Descending
            };

            let mut torque = self.lookup.table(direction).torque(cmd);
            if i >= reversal_index {
                torque = -torque;
            }
            timestamps.push(t + shift);
            torques.push(torque * motor_sign);
        }

        debug!(
            "{} of {} brake commands kept, reversal at index {}",
            commands.len(),
            run.torque_commands.len(),
            reversal_index
        );

        Ok(TorqueTrace {
            timestamps,
            torques,
            reversal_index,
            shift,
        })
    }

    /// Twist angle between the two encoder channels, cleaned and smoothed
    pub fn reconstruct_twist(&self, run: &ExperimentRun) -> Result<TwistTrace> {
        let samples = &run.encoder_samples;
        let Some(&(_, first1, first2)) = samples.first() else {
            return Err(CalibrationError::Data("run has no encoder samples".to_string()));
        };

        let gear = self.config.gear_ratio;
        let timestamps: Vec<f64> = samples.iter().map(|&(t, _, _)| t).collect();
        let twist: Vec<f64> = samples
            .iter()
            .map(|&(_, e1, e2)| (e1 - first1) * gear - (e2 - first2) * gear)
            .collect();

        let (raw, timestamps) = filter::reject_outliers(&twist, &timestamps, self.config.outlier_sigma)?;
        let outliers_removed = twist.len() - raw.len();
        if outliers_removed > 0 {
            debug!("Removed {} encoder outliers", outliers_removed);
        }

        let half = self.config.smoothing_window / 2;
        if raw.len() <= half {
            return Err(CalibrationError::Data(format!(
                "{} encoder samples is too few to smooth with a window of {}",
                raw.len(),
                self.config.smoothing_window
            )));
        }
        let smoothed = filter::savitzky_golay(&raw, self.config.smoothing_window, self.config.smoothing_order)?;

        Ok(TwistTrace {
            timestamps,
            raw,
            smoothed,
            outliers_removed,
        })
    }

    /// Zero the smoothed twist separately before and after the motor reversal
    ///
    /// The trace is split at the reversal. The second segment is zeroed
    /// against its value `backlash_grace` seconds later, once the slack has
    /// been taken up. Without a reversal the trace is returned unchanged.
    pub fn correct_backlash(&self, twist: &TwistTrace, reversal: Option<f64>) -> Vec<f64> {
        let mut corrected = twist.smoothed.clone();
        let Some(reversal) = reversal else {
            return corrected;
        };
        if corrected.is_empty() {
            return corrected;
        }

        let split = nearest_index(&twist.timestamps, reversal);
        let settled = nearest_index(&twist.timestamps, reversal + self.config.backlash_grace);
        let before = corrected[0];
        let after = corrected[settled];
        debug!(
            "Backlash split at index {} ({:.3}s), settled at {}: offsets {:.4} / {:.4}",
            split, twist.timestamps[split], settled, before, after
        );

        for v in &mut corrected[..split] {
            *v -= before;
        }
        for v in &mut corrected[split..] {
            *v -= after;
        }
        corrected
    }

    /// Warn when the zero-valley reversal disagrees with the motor log
    fn check_reversal(&self, run: &ExperimentRun, torque: &TorqueTrace, reversal: f64) {
        let i = torque.reversal_index;
        let valley_time = torque.valley_time();
        let previous_time = i
            .checked_sub(1)
            .map(|p| torque.timestamps[p] - torque.shift)
            .unwrap_or(f64::NEG_INFINITY);

        if !(previous_time <= reversal && reversal <= valley_time) {
            warn!(
                "Zero valley {} ({:.3}s) does not bracket the motor reversal at {:.3}s in {}",
                run.repeats,
                valley_time,
                reversal,
                run.file_name()
            );
        }
    }
}

/// Time of the first motor command that differs from its predecessor
pub fn motor_reversal_timestamp(run: &ExperimentRun) -> Option<f64> {
    run.motor_commands
        .windows(2)
        .find(|w| w[0].1 != w[1].1)
        .map(|w| w[1].0)
}

/// First zero command and every zero that does not directly follow another
fn zero_valleys(commands: &[(f64, u8)]) -> Vec<usize> {
    let mut valleys = Vec::new();
    let mut prev: Option<usize> = None;
    for (i, &(_, cmd)) in commands.iter().enumerate() {
        if cmd != 0 {
            continue;
        }
        match prev {
            None => valleys.push(i),
            Some(p) if i - p > 1 => valleys.push(i),
            _ => {}
        }
        prev = Some(i);
    }
    valleys
}

fn nearest_index(values: &[f64], target: f64) -> usize {
    values
        .iter()
        .enumerate()
        .min_by(|a, b| (a.1 - target).abs().total_cmp(&(b.1 - target).abs()))
        .map(|(i, _)| i)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;
    use crate::lookup::LookupTable;
    use crate::run::BrakeKind;
    use approx::assert_abs_diff_eq;

    fn linear_lookup() -> BrakeLookup {
        let ascending = LookupTable::from_values((0..256).map(|b| b as f64 * 0.01).collect()).unwrap();
        let descending = LookupTable::from_values((0..256).map(|b| b as f64 * 0.02).collect()).unwrap();
        BrakeLookup { ascending, descending }
    }

    fn empty_run(repeats: u32) -> ExperimentRun {
        let mut params = config::preset(BrakeKind::Large);
        params.repeats = repeats;
        params.time_interval = 3.0;
        ExperimentRun::new(BrakeKind::Large, config::default_geometry(), &params)
    }

    fn small_config() -> PipelineConfig {
        PipelineConfig {
            smoothing_window: 11,
            smoothing_order: 3,
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn test_zero_valleys() {
        let cmds: Vec<(f64, u8)> = [0, 8, 0, 0, 8, 0, 8, 16, 0]
            .iter()
            .enumerate()
            .map(|(i, &c)| (i as f64, c))
            .collect();
        assert_eq!(zero_valleys(&cmds), vec![0, 2, 5, 8]);
    }

    #[test]
    fn test_torque_dedupe_direction_and_sign() {
        let lookup = linear_lookup();
        let pipeline = CalibrationPipeline::new(small_config(), &lookup);
        let mut run = empty_run(1);
        for (t, c) in [(0.0, 0), (1.0, 0), (2.0, 10), (3.0, 20), (4.0, 20), (5.0, 10), (6.0, 0), (7.0, 10), (8.0, 0)] {
            run.record_torque_command(t, c);
        }

        let trace = pipeline.reconstruct_torque(&run).unwrap();
        // Duplicate zeros at 0s and twenties at 3s dropped
        assert_abs_diff_eq!(trace.shift, 1.0, epsilon = 1e-12);
        assert_eq!(trace.timestamps, vec![2.0, 3.0, 5.0, 6.0, 7.0, 8.0, 9.0]);
        assert_eq!(trace.reversal_index, 4);

        let expected = [0.0, 0.10, 0.40, 0.20, -0.0, -0.20, -0.0];
        for (got, want) in trace.torques.iter().zip(expected) {
            assert_abs_diff_eq!(*got, want, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_negative_motor_speed_flips_everything() {
        let lookup = linear_lookup();
        let pipeline = CalibrationPipeline::new(small_config(), &lookup);
        let mut run = empty_run(1);
        run.commanded_motor_speed = -255;
        for (t, c) in [(0.0, 0), (1.0, 50), (2.0, 0), (3.0, 50), (4.0, 0)] {
            run.record_torque_command(t, c);
        }

        let trace = pipeline.reconstruct_torque(&run).unwrap();
        assert_abs_diff_eq!(trace.torques[1], -1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(trace.torques[3], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_missing_reversal_is_data_error() {
        let lookup = linear_lookup();
        let pipeline = CalibrationPipeline::new(small_config(), &lookup);

        let run = empty_run(1);
        assert!(matches!(pipeline.reconstruct_torque(&run), Err(CalibrationError::Data(_))));

        let mut run = empty_run(2);
        for (t, c) in [(0.0, 0), (1.0, 50), (2.0, 0)] {
            run.record_torque_command(t, c);
        }
        assert!(matches!(pipeline.reconstruct_torque(&run), Err(CalibrationError::Data(_))));

        let mut run = empty_run(1);
        run.record_torque_command(0.0, 40);
        assert!(matches!(pipeline.reconstruct_torque(&run), Err(CalibrationError::Data(_))));
    }

    #[test]
    fn test_twist_from_encoders() {
        let lookup = linear_lookup();
        let config = PipelineConfig {
            gear_ratio: 0.5,
            ..small_config()
        };
        let pipeline = CalibrationPipeline::new(config, &lookup);
        let mut run = empty_run(1);
        for i in 0..50 {
            let t = i as f64 * 0.1;
            run.record_encoders(t, 100.0 + 2.0 * t, 40.0);
        }

        let trace = pipeline.reconstruct_twist(&run).unwrap();
        assert_eq!(trace.outliers_removed, 0);
        assert_eq!(trace.smoothed.len(), 50);
        for (i, v) in trace.smoothed.iter().enumerate() {
            assert_abs_diff_eq!(*v, i as f64 * 0.1, epsilon = 1e-6);
        }

        let empty = empty_run(1);
        assert!(matches!(pipeline.reconstruct_twist(&empty), Err(CalibrationError::Data(_))));

        let mut short = empty_run(1);
        short.record_encoders(0.0, 0.0, 0.0);
        short.record_encoders(0.1, 0.0, 0.0);
        assert!(matches!(pipeline.reconstruct_twist(&short), Err(CalibrationError::Data(_))));
    }

    fn stepped_twist(reversal: f64, step: f64) -> TwistTrace {
        let timestamps: Vec<f64> = (0..1000).map(|i| i as f64 * 0.01).collect();
        let raw: Vec<f64> = timestamps
            .iter()
            .map(|&t| if t >= reversal { step } else { 0.0 } + 1.5)
            .collect();
        let smoothed = filter::savitzky_golay(&raw, 11, 3).unwrap();
        TwistTrace {
            timestamps,
            raw,
            smoothed,
            outliers_removed: 0,
        }
    }

    #[test]
    fn test_backlash_step_removed() {
        let lookup = linear_lookup();
        let pipeline = CalibrationPipeline::new(small_config(), &lookup);
        let reversal = 5.0;
        let twist = stepped_twist(reversal, 5.0);

        let corrected = pipeline.correct_backlash(&twist, Some(reversal));
        let split = nearest_index(&twist.timestamps, reversal);
        assert_eq!(split, 500);

        // Just outside the smoothing span the two sides agree
        let half = small_config().smoothing_window / 2;
        assert_abs_diff_eq!(corrected[split - half - 1], corrected[split + half], epsilon = 1e-9);

        // Everywhere outside the span reads zero, including the grace period
        for (i, v) in corrected.iter().enumerate() {
            if i + half < split || i >= split + half {
                assert_abs_diff_eq!(*v, 0.0, epsilon = 1e-9);
            }
        }

        assert_eq!(pipeline.correct_backlash(&twist, None), twist.smoothed);
    }

    #[test]
    fn test_backlash_uses_zero_valley_without_motor_log() {
        let lookup = linear_lookup();
        let pipeline = CalibrationPipeline::new(small_config(), &lookup);
        let mut run = empty_run(1);
        let commands = [(0.0, 0), (2.0, 50), (4.0, 0), (6.0, 50), (8.0, 0)];
        for (t, c) in commands {
            run.record_torque_command(t, c);
        }
        // 0.01 deg per count, reversed after the valley at 4s; slack appears at 4.2s
        for i in 0..1000 {
            let t = i as f64 * 0.01;
            let brake = commands.iter().rev().find(|&&(ct, _)| ct <= t).map_or(0, |&(_, c)| c);
            let sign = if t >= 4.0 { -1.0 } else { 1.0 };
            let backlash = if t >= 4.2 { 5.0 } else { 0.0 };
            let twist = sign * brake as f64 * 0.01 + backlash;
            run.record_encoders(t, 100.0 + twist / GEAR_RATIO, 40.0);
        }
        assert!(run.motor_commands.is_empty());

        let torque = pipeline.reconstruct_torque(&run).unwrap();
        assert_abs_diff_eq!(torque.valley_time(), 4.0, epsilon = 1e-12);

        let result = pipeline.run(&run).unwrap();
        let expected = [0.0, 0.5, 0.0, -0.5, 0.0];
        assert_eq!(result.twist_angle_samples.len(), expected.len());
        for (got, want) in result.twist_angle_samples.iter().zip(expected) {
            assert_abs_diff_eq!(*got, want, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_motor_reversal_timestamp() {
        let mut run = empty_run(1);
        assert_eq!(motor_reversal_timestamp(&run), None);
        run.record_motor_command(0.5, 255);
        assert_eq!(motor_reversal_timestamp(&run), None);
        run.record_motor_command(1.0, 255);
        run.record_motor_command(20.0, -255);
        run.record_motor_command(40.0, 0);
        assert_eq!(motor_reversal_timestamp(&run), Some(20.0));
    }

    #[test]
    fn test_result_fitted_line() {
        let result = CalibrationResult {
            torque_samples: vec![0.0, 1.0],
            twist_angle_samples: vec![0.0, 2.0, -1.0],
            regression_slope: 0.5,
            regression_intercept: 0.1,
        };
        let fitted = result.fitted();
        assert_eq!(fitted.len(), 3);
        for (got, want) in fitted.iter().zip([0.1, 1.1, -0.4]) {
            assert_abs_diff_eq!(*got, want, epsilon = 1e-12);
        }
    }
}
