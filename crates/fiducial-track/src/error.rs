use fiducial_linalg::LinalgError;

/// Errors from pose filtering and marker edge estimation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TrackError {
    /// Sample rate or cutoff frequency was not positive.
    #[error("sample rate and cutoff frequency must be positive, got {sample_rate} and {cutoff_frequency}")]
    InvalidFilterParams {
        /// Requested sample rate in Hz.
        sample_rate: f64,
        /// Requested cutoff frequency in Hz.
        cutoff_frequency: f64,
    },

    /// The pose's rotation block is not orthonormal, so no quaternion
    /// decomposition exists.
    #[error("pose rotation block is not orthonormal; cannot decompose to a quaternion")]
    DegenerateRotation,

    /// Two adjacent fitted edge lines are too close to parallel to
    /// intersect reliably.
    #[error("adjacent marker edges are nearly parallel")]
    NearlyParallelLines,

    /// Too few contour samples survive the end-margin trim.
    #[error("edge segment keeps {actual} samples after trimming, need at least {required}")]
    TooFewContourPoints {
        /// Minimum surviving samples required.
        required: usize,
        /// Samples that actually survived.
        actual: usize,
    },

    /// The injected observed-to-ideal coordinate mapping failed.
    #[error("ideal-coordinate mapping failed at ({x}, {y})")]
    UndistortFailed {
        /// Observed x coordinate handed to the mapping.
        x: f64,
        /// Observed y coordinate handed to the mapping.
        y: f64,
    },

    /// A dense kernel operation failed while fitting.
    #[error(transparent)]
    Linalg(#[from] LinalgError),
}
