// Numeric helpers for the calibration pipeline
//
// Provides:
// - Savitzky-Golay polynomial smoothing
// - Standard-deviation outlier rejection across parallel series
// - Clamped piecewise-linear interpolation
// - First degree least-squares fit

use nalgebra::DMatrix;

use crate::error::{CalibrationError, Result};

/// Singular values below this are treated as zero by the pseudo-inverse
const PINV_EPSILON: f64 = 1e-12;

/// Smoothing coefficients for a symmetric window
///
/// Fits a degree-`order` polynomial by least squares over `window` samples
/// and returns the weights that evaluate the fit at the window center. The
/// abscissa is normalized to [-1, 1]; the center value does not depend on
/// that scaling, and it keeps the Vandermonde matrix well conditioned for
/// wide windows.
pub fn savitzky_golay_coefficients(window: usize, order: usize) -> Result<Vec<f64>> {
    validate_window(window, order)?;

    let half = (window - 1) / 2;
    let scale = half.max(1) as f64;
    let vandermonde = DMatrix::from_fn(window, order + 1, |row, col| {
        let x = (row as f64 - half as f64) / scale;
        x.powi(col as i32)
    });

    let pinv = vandermonde
        .pseudo_inverse(PINV_EPSILON)
        .map_err(|e| CalibrationError::InvalidArgument(format!("pseudo-inverse failed: {}", e)))?;

    Ok(pinv.row(0).iter().copied().collect())
}

fn validate_window(window: usize, order: usize) -> Result<()> {
    if window == 0 || window % 2 != 1 {
        return Err(CalibrationError::InvalidArgument(format!(
            "window size must be a positive odd number, got {}",
            window
        )));
    }
    if window < order + 2 {
        return Err(CalibrationError::InvalidArgument(format!(
            "window size {} is too small for polynomial order {}",
            window, order
        )));
    }
    Ok(())
}

/// Smooth `y` with a Savitzky-Golay filter
///
/// The series is padded with `window / 2` samples on each end by reflecting
/// about the end value and negating, so a rising ramp keeps rising past its
/// ends instead of being pulled toward zero.
pub fn savitzky_golay(y: &[f64], window: usize, order: usize) -> Result<Vec<f64>> {
    let coeffs = savitzky_golay_coefficients(window, order)?;
    let half = (window - 1) / 2;

    if y.len() <= half {
        return Err(CalibrationError::InvalidArgument(format!(
            "series of {} samples is too short for a window of {}",
            y.len(),
            window
        )));
    }

    let first = y[0];
    let last = y[y.len() - 1];
    let n = y.len();

    let mut padded = Vec::with_capacity(n + 2 * half);
    padded.extend((1..=half).rev().map(|k| first - (y[k] - first).abs()));
    padded.extend_from_slice(y);
    padded.extend((1..=half).map(|k| last + (y[n - 1 - k] - last).abs()));

    Ok(padded
        .windows(window)
        .map(|w| w.iter().zip(&coeffs).map(|(v, c)| v * c).sum())
        .collect())
}

/// Indices whose value lies more than `k` population standard deviations
/// from the mean
pub fn outlier_indices(values: &[f64], k: f64) -> Vec<usize> {
    if values.is_empty() {
        return Vec::new();
    }

    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let std_dev = (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();

    values
        .iter()
        .enumerate()
        .filter(|(_, v)| (*v - mean).abs() > std_dev * k)
        .map(|(i, _)| i)
        .collect()
}

/// Drop outliers from `values` and the matching entries of `timestamps`
pub fn reject_outliers(values: &[f64], timestamps: &[f64], k: f64) -> Result<(Vec<f64>, Vec<f64>)> {
    if values.len() != timestamps.len() {
        return Err(CalibrationError::InvalidArgument(format!(
            "{} values but {} timestamps",
            values.len(),
            timestamps.len()
        )));
    }

    let outliers = outlier_indices(values, k);
    let mut skip = outliers.iter().peekable();
    let mut kept_values = Vec::with_capacity(values.len() - outliers.len());
    let mut kept_timestamps = Vec::with_capacity(values.len() - outliers.len());

    for (i, (&v, &t)) in values.iter().zip(timestamps).enumerate() {
        if skip.peek() == Some(&&i) {
            skip.next();
            continue;
        }
        kept_values.push(v);
        kept_timestamps.push(t);
    }

    Ok((kept_values, kept_timestamps))
}

/// Interpolate a single point against non-decreasing `xs`
///
/// Points outside `[xs[0], xs[n-1]]` take the nearest boundary value.
/// `None` when the series are empty or of different lengths.
pub fn interp_one(x: f64, xs: &[f64], ys: &[f64]) -> Option<f64> {
    if xs.len() != ys.len() {
        return None;
    }
    let (&first, &last) = (xs.first()?, xs.last()?);
    if x <= first {
        return ys.first().copied();
    }
    if x >= last {
        return ys.last().copied();
    }

    // First index with xs[i] > x; bracket is [i-1, i]
    let i = xs.partition_point(|&v| v <= x);
    let (x0, x1) = (xs[i - 1], xs[i]);
    let (y0, y1) = (ys[i - 1], ys[i]);
    if x1 == x0 {
        return Some(y1);
    }
    Some(y0 + (x - x0) * (y1 - y0) / (x1 - x0))
}

/// Piecewise-linear interpolation of every query point
pub fn interp(queries: &[f64], xs: &[f64], ys: &[f64]) -> Result<Vec<f64>> {
    if xs.is_empty() || xs.len() != ys.len() {
        return Err(CalibrationError::InvalidArgument(format!(
            "interpolation needs matching non-empty series, got {} x and {} y",
            xs.len(),
            ys.len()
        )));
    }
    Ok(queries.iter().filter_map(|&q| interp_one(q, xs, ys)).collect())
}

/// Least-squares line `y = slope * x + intercept`
pub fn linear_fit(x: &[f64], y: &[f64]) -> Result<(f64, f64)> {
    if x.len() != y.len() {
        return Err(CalibrationError::Data(format!(
            "cannot fit {} x values against {} y values",
            x.len(),
            y.len()
        )));
    }
    if x.len() < 2 {
        return Err(CalibrationError::Data(format!(
            "linear fit needs at least 2 points, got {}",
            x.len()
        )));
    }

    let n = x.len() as f64;
    let mean_x = x.iter().sum::<f64>() / n;
    let mean_y = y.iter().sum::<f64>() / n;

    let mut sxx = 0.0;
    let mut sxy = 0.0;
    for (&xi, &yi) in x.iter().zip(y) {
        sxx += (xi - mean_x) * (xi - mean_x);
        sxy += (xi - mean_x) * (yi - mean_y);
    }

    if sxx == 0.0 || !sxx.is_finite() {
        return Err(CalibrationError::Data(
            "linear fit is degenerate: all x values are identical".to_string(),
        ));
    }

    let slope = sxy / sxx;
    Ok((slope, mean_y - slope * mean_x))
}
