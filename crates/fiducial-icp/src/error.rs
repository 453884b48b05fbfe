use fiducial_linalg::LinalgError;

/// Errors from the pose refinement solvers.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum IcpError {
    /// Too few 2D-3D correspondences for the pose to be well-posed.
    #[error("pose refinement requires at least {required} 2D-3D correspondences, got {actual}")]
    InsufficientCorrespondences {
        /// Minimum number of correspondences required.
        required: usize,
        /// Number of correspondences provided (or surviving as inliers).
        actual: usize,
    },

    /// The parallel world/image slices have different lengths.
    #[error("mismatched array lengths: {left_name} ({left_len}) != {right_name} ({right_len})")]
    MismatchedArrayLengths {
        /// Label for the left-hand slice.
        left_name: &'static str,
        /// Length of the left-hand slice.
        left_len: usize,
        /// Label for the right-hand slice.
        right_name: &'static str,
        /// Length of the right-hand slice.
        right_len: usize,
    },

    /// A point projected at or behind the camera plane.
    #[error("degenerate projection: point at or behind the camera plane")]
    DegenerateProjection,

    /// Calibration was invoked without any data sets.
    #[error("no calibration data sets were provided")]
    NoCalibrationData,

    /// A dense kernel operation failed, typically a singular
    /// normal-equations system from a degenerate correspondence set.
    #[error(transparent)]
    Linalg(#[from] LinalgError),
}
