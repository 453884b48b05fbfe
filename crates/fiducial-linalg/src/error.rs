/// Errors from the dense matrix and eigen routines.
///
/// Dimension variants are caller contract violations; `Singular` and
/// `EigenNotConverged` are numerical failures the caller may recover from
/// by retrying with fresh data.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LinalgError {
    /// A matrix was requested or supplied with a zero dimension.
    #[error("matrix dimensions must be non-zero, got {rows}x{cols}")]
    ZeroDimension {
        /// Requested row count.
        rows: usize,
        /// Requested column count.
        cols: usize,
    },

    /// Operand shapes do not match the requested operation.
    #[error("incompatible dimensions for {op}: {lhs_rows}x{lhs_cols} vs {rhs_rows}x{rhs_cols}")]
    IncompatibleDimensions {
        /// Name of the operation that was attempted.
        op: &'static str,
        /// Row count of the left-hand operand.
        lhs_rows: usize,
        /// Column count of the left-hand operand.
        lhs_cols: usize,
        /// Row count of the right-hand operand.
        rhs_rows: usize,
        /// Column count of the right-hand operand.
        rhs_cols: usize,
    },

    /// The operation requires a square matrix.
    #[error("operation requires a square matrix, got {rows}x{cols}")]
    NotSquare {
        /// Row count of the offending matrix.
        rows: usize,
        /// Column count of the offending matrix.
        cols: usize,
    },

    /// A pivot fell below tolerance during elimination.
    #[error("matrix is singular or nearly singular")]
    Singular,

    /// The QL iteration exhausted its sweep budget for one eigenvalue.
    #[error("eigenvalue iteration did not converge within {max_sweeps} sweeps")]
    EigenNotConverged {
        /// Sweep budget that was exhausted.
        max_sweeps: usize,
    },

    /// Too few sample rows to estimate a covariance.
    #[error("PCA requires at least 2 sample rows, got {rows}")]
    TooFewSamples {
        /// Number of rows in the input.
        rows: usize,
    },
}
