// Error types for calibration table construction, filtering and analysis

use std::path::PathBuf;

/// Result type alias
pub type Result<T> = std::result::Result<T, CalibrationError>;

/// Errors raised while building lookup tables or analyzing a run
#[derive(Debug, thiserror::Error)]
pub enum CalibrationError {
    /// Malformed calibration inputs, rejected at construction
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Bad parameter passed to a filter or sequencer
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Logged data cannot produce a meaningful result
    #[error("Data error: {0}")]
    Data(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Wraps a failure with the run file that caused it
    #[error("{}: {source}", .path.display())]
    InRun {
        path: PathBuf,
        #[source]
        source: Box<CalibrationError>,
    },
}

impl CalibrationError {
    /// Attach the path of the offending run file
    pub fn in_run(self, path: impl Into<PathBuf>) -> Self {
        CalibrationError::InRun {
            path: path.into(),
            source: Box::new(self),
        }
    }
}
