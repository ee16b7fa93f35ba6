//! Property-based tests for the numeric helpers and the command timeline
//!
//! - Interpolation stays inside its brackets and clamps at the ends
//! - Outlier rejection removes exactly the injected spikes
//! - Smoothing leaves constant signals untouched
//! - Every timeline produces exactly two cycles per repeat
//! - Run with ProptestConfig::with_cases(100)

use brake_calibrator::classifier::{Flow, PacketClassifier};
use brake_calibrator::config;
use brake_calibrator::filter::{interp_one, reject_outliers, savitzky_golay};
use brake_calibrator::messages::{Command, Packet};
use brake_calibrator::run::{BrakeKind, ExperimentRun};
use brake_calibrator::sequencer::{CommandSequencer, SequenceParams, ramp_levels};
use proptest::prelude::*;

// ============================================================================
// Strategies
// ============================================================================

/// Strictly increasing abscissa with matching ordinates
fn arb_curve() -> impl Strategy<Value = (Vec<f64>, Vec<f64>)> {
    (2usize..40).prop_flat_map(|n| {
        (
            proptest::collection::vec(0.01f64..10.0, n),
            proptest::collection::vec(-100.0f64..100.0, n),
        )
            .prop_map(|(gaps, ys)| {
                let xs = gaps
                    .iter()
                    .scan(0.0, |acc, g| {
                        *acc += g;
                        Some(*acc)
                    })
                    .collect();
                (xs, ys)
            })
    })
}

/// Noise in [-1, 1] with 1 to 3 spikes at distinct indices
fn arb_spiked_series() -> impl Strategy<Value = (Vec<f64>, Vec<usize>)> {
    (100usize..300).prop_flat_map(|n| {
        (
            proptest::collection::vec(-1.0f64..1.0, n),
            proptest::sample::subsequence((0..n).collect::<Vec<_>>(), 1..=3),
        )
    })
}

/// Odd window with a polynomial order it can support
fn arb_window_order() -> impl Strategy<Value = (usize, usize)> {
    (prop::sample::select(vec![5usize, 7, 11, 21, 51]), 0usize..=4)
        .prop_filter("window too small for order", |(w, o)| *w >= o + 2)
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property: interior points lie between the bracketing values
    #[test]
    fn prop_interp_within_brackets((xs, ys) in arb_curve(), t in 0.0f64..1.0) {
        let x = xs[0] + t * (xs[xs.len() - 1] - xs[0]);
        let y = interp_one(x, &xs, &ys).unwrap();

        let i = xs.partition_point(|&v| v <= x).clamp(1, xs.len() - 1);
        let lo = ys[i - 1].min(ys[i]);
        let hi = ys[i - 1].max(ys[i]);
        prop_assert!(y >= lo - 1e-9 && y <= hi + 1e-9, "{} outside [{}, {}]", y, lo, hi);
    }

    /// Property: queries outside the range take the boundary values
    #[test]
    fn prop_interp_clamps((xs, ys) in arb_curve(), beyond in 0.0f64..100.0) {
        let n = xs.len();
        prop_assert_eq!(interp_one(xs[0] - beyond, &xs, &ys), Some(ys[0]));
        prop_assert_eq!(interp_one(xs[n - 1] + beyond, &xs, &ys), Some(ys[n - 1]));
    }

    /// Property: exactly the spikes are removed, in order, from both series
    #[test]
    fn prop_outliers_remove_injected_spikes((mut values, spikes) in arb_spiked_series()) {
        for &i in &spikes {
            values[i] = 1000.0;
        }
        let timestamps: Vec<f64> = (0..values.len()).map(|i| i as f64).collect();

        let (kept, kept_t) = reject_outliers(&values, &timestamps, 3.0).unwrap();
        prop_assert_eq!(kept.len(), values.len() - spikes.len());
        prop_assert_eq!(kept_t.len(), kept.len());

        let expected_t: Vec<f64> = timestamps
            .iter()
            .enumerate()
            .filter(|(i, _)| !spikes.contains(i))
            .map(|(_, &t)| t)
            .collect();
        prop_assert_eq!(&kept_t, &expected_t);
        for (v, t) in kept.iter().zip(&kept_t) {
            prop_assert_eq!(*v, values[*t as usize]);
        }
    }

    /// Property: a constant signal is reproduced
    #[test]
    fn prop_smoothing_preserves_constants(
        c in -100.0f64..100.0,
        len in 60usize..200,
        (window, order) in arb_window_order(),
    ) {
        let y = vec![c; len];
        let smoothed = savitzky_golay(&y, window, order).unwrap();
        prop_assert_eq!(smoothed.len(), len);
        for v in smoothed {
            prop_assert!((v - c).abs() < 1e-8 * c.abs().max(1.0), "{} != {}", v, c);
        }
    }

    /// Property: ramp levels climb from 0 to max in steps of at most `step`
    #[test]
    fn prop_ramp_levels_cover_range(max in 1u8..=255, step in 1u8..=64) {
        let levels = ramp_levels(max, step);
        prop_assert_eq!(levels[0], 0);
        prop_assert_eq!(*levels.last().unwrap(), max);
        for w in levels.windows(2) {
            prop_assert!(w[1] > w[0] && w[1] - w[0] <= step);
        }
    }

    /// Property: the classifier finishes on the last brake command of the
    /// final cycle, after exactly two cycles per repeat
    #[test]
    fn prop_timeline_yields_two_cycles_per_repeat(
        repeats in 1u32..=4,
        max in 1u8..=255,
        step in 1u8..=64,
    ) {
        let params = SequenceParams {
            commanded_motor_speed: 255,
            command_interval: step,
            time_interval: 1.0,
            max_torque_command: max,
            repeats,
        };
        let sequencer = CommandSequencer::new(params).unwrap();
        let run = ExperimentRun::new(BrakeKind::Small, config::default_geometry(), &params);
        let mut classifier = PacketClassifier::new(run, (), 0.0);

        let mut done_at = None;
        for (i, (t, command)) in sequencer.timed_commands().into_iter().enumerate() {
            if let Command::Brake(value) = command {
                if classifier.classify(Packet::brake_ack(t, value)) == Flow::Done {
                    done_at = Some(i);
                    break;
                }
            }
        }

        prop_assert!(done_at.is_some());
        prop_assert_eq!(classifier.completed_cycles(), sequencer.expected_cycles());
    }
}
